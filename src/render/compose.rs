use crate::frame::Frame;
use crate::validator::ValidatedSample;

pub const BACKGROUND: u32 = 0x0020_2020;
pub const CORNER_COLOR: u32 = 0x0000_FF40;
pub const MISSING_COLOR: u32 = 0x0040_0000;

/// 1行最大 `views_horizontal` 枚で `n` ビューを並べたときの (列数, 行数)
pub fn grid_layout(n: usize, views_horizontal: usize) -> (usize, usize) {
    let cols = n.min(views_horizontal).max(1);
    let rows = n.div_ceil(cols).max(1);
    (cols, rows)
}

/// 0RGB ピクセルバッファ
#[derive(Debug, Clone)]
pub struct Canvas {
    width: usize,
    height: usize,
    buffer: Vec<u32>,
}

impl Canvas {
    pub fn new(width: usize, height: usize) -> Self {
        Self { width, height, buffer: vec![0u32; width * height] }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn buffer(&self) -> &[u32] {
        &self.buffer
    }

    pub fn pixel(&self, x: usize, y: usize) -> u32 {
        self.buffer[y * self.width + x]
    }

    pub fn fill_rect(&mut self, x0: usize, y0: usize, w: usize, h: usize, color: u32) {
        for y in y0..(y0 + h).min(self.height) {
            for x in x0..(x0 + w).min(self.width) {
                self.buffer[y * self.width + x] = color;
            }
        }
    }

    /// `frame` を指定矩形に最近傍で拡大縮小して描画
    pub fn blit(&mut self, frame: &Frame, x0: usize, y0: usize, w: usize, h: usize) {
        if frame.width() == 0 || frame.height() == 0 || w == 0 || h == 0 {
            return;
        }
        for ty in 0..h {
            let y = y0 + ty;
            if y >= self.height {
                break;
            }
            let sy = (ty * frame.height() as usize / h) as u32;
            for tx in 0..w {
                let x = x0 + tx;
                if x >= self.width {
                    break;
                }
                let sx = (tx * frame.width() as usize / w) as u32;
                let (r, g, b) = frame.rgb_at(sx, sy);
                self.buffer[y * self.width + x] = ((r as u32) << 16) | ((g as u32) << 8) | b as u32;
            }
        }
    }

    pub fn draw_circle(&mut self, cx: i32, cy: i32, radius: i32, color: u32) {
        for dy in -radius..=radius {
            for dx in -radius..=radius {
                if dx * dx + dy * dy <= radius * radius {
                    self.set_pixel(cx + dx, cy + dy, color);
                }
            }
        }
    }

    fn set_pixel(&mut self, x: i32, y: i32, color: u32) {
        if x >= 0 && x < self.width as i32 && y >= 0 && y < self.height as i32 {
            self.buffer[y as usize * self.width + x as usize] = color;
        }
    }
}

/// カメラタイルのグリッドに最新の検証済みコーナーを重ねて描画する
#[derive(Debug)]
pub struct Compositor {
    cols: usize,
    tile_w: usize,
    tile_h: usize,
    canvas: Canvas,
}

impl Compositor {
    pub fn new(cameras: usize, views_horizontal: usize, tile_w: usize, tile_h: usize) -> Self {
        let (cols, rows) = grid_layout(cameras, views_horizontal);
        Self { cols, tile_w, tile_h, canvas: Canvas::new(cols * tile_w, rows * tile_h) }
    }

    pub fn canvas(&self) -> &Canvas {
        &self.canvas
    }

    /// カメラ `i` のタイル左上座標
    pub fn tile_origin(&self, i: usize) -> (usize, usize) {
        ((i % self.cols) * self.tile_w, (i / self.cols) * self.tile_h)
    }

    pub fn compose<F: AsRef<Frame>>(&mut self, frames: &[Option<F>], overlays: &[Option<ValidatedSample>]) {
        self.canvas.fill_rect(0, 0, self.canvas.width(), self.canvas.height(), BACKGROUND);
        for (i, frame) in frames.iter().enumerate() {
            let (x0, y0) = self.tile_origin(i);
            let Some(frame) = frame.as_ref().map(AsRef::as_ref) else {
                self.canvas.fill_rect(x0, y0, self.tile_w, self.tile_h, MISSING_COLOR);
                continue;
            };
            self.canvas.blit(frame, x0, y0, self.tile_w, self.tile_h);

            if let Some(Some(sample)) = overlays.get(i) {
                let sx = self.tile_w as f32 / frame.width() as f32;
                let sy = self.tile_h as f32 / frame.height() as f32;
                for c in &sample.corners {
                    let x = x0 as f32 + c.x * sx;
                    let y = y0 as f32 + c.y * sy;
                    self.canvas.draw_circle(x as i32, y as i32, 3, CORNER_COLOR);
                }
            }
        }
    }
}
