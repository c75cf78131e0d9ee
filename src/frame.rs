use std::path::Path;

use anyhow::{bail, Context, Result};
use image::{GrayImage, RgbImage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Gray8,
    /// Interleaved blue, green, red bytes.
    Bgr8,
}

impl PixelFormat {
    pub fn channels(self) -> usize {
        match self {
            PixelFormat::Gray8 => 1,
            PixelFormat::Bgr8 => 3,
        }
    }
}

/// An owned 8-bit image as produced by any camera backend.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    width: u32,
    height: u32,
    format: PixelFormat,
    data: Vec<u8>,
}

impl Frame {
    pub fn new(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * format.channels();
        if data.len() != expected {
            bail!(
                "frame buffer is {} bytes, expected {} for {}x{} {:?}",
                data.len(),
                expected,
                width,
                height,
                format
            );
        }
        Ok(Self { width, height, format, data })
    }

    pub fn filled(width: u32, height: u32, format: PixelFormat, value: u8) -> Self {
        let len = width as usize * height as usize * format.channels();
        Self { width, height, format, data: vec![value; len] }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Pixel at (x, y) as (r, g, b).
    pub fn rgb_at(&self, x: u32, y: u32) -> (u8, u8, u8) {
        let i = (y as usize * self.width as usize + x as usize) * self.format.channels();
        match self.format {
            PixelFormat::Gray8 => (self.data[i], self.data[i], self.data[i]),
            PixelFormat::Bgr8 => (self.data[i + 2], self.data[i + 1], self.data[i]),
        }
    }

    pub fn to_gray(&self) -> Frame {
        match self.format {
            PixelFormat::Gray8 => self.clone(),
            PixelFormat::Bgr8 => {
                let data = self
                    .data
                    .chunks_exact(3)
                    .map(|p| {
                        let (b, g, r) = (p[0] as u32, p[1] as u32, p[2] as u32);
                        ((299 * r + 587 * g + 114 * b + 500) / 1000) as u8
                    })
                    .collect();
                Frame { width: self.width, height: self.height, format: PixelFormat::Gray8, data }
            }
        }
    }

    pub fn save_png(&self, path: &Path) -> Result<()> {
        match self.format {
            PixelFormat::Gray8 => {
                let img = GrayImage::from_raw(self.width, self.height, self.data.clone())
                    .context("gray buffer does not match dimensions")?;
                img.save(path)
            }
            PixelFormat::Bgr8 => {
                let rgb: Vec<u8> = self
                    .data
                    .chunks_exact(3)
                    .flat_map(|p| [p[2], p[1], p[0]])
                    .collect();
                let img = RgbImage::from_raw(self.width, self.height, rgb)
                    .context("color buffer does not match dimensions")?;
                img.save(path)
            }
        }
        .with_context(|| format!("Failed to write {}", path.display()))
    }

    /// Load an image file. Single-channel files stay grayscale, anything else becomes BGR.
    pub fn load(path: &Path) -> Result<Frame> {
        let img = image::open(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let (width, height) = (img.width(), img.height());
        if img.color().channel_count() == 1 {
            return Frame::new(width, height, PixelFormat::Gray8, img.into_luma8().into_raw());
        }
        let data = img
            .into_rgb8()
            .into_raw()
            .chunks_exact(3)
            .flat_map(|p| [p[2], p[1], p[0]])
            .collect();
        Frame::new(width, height, PixelFormat::Bgr8, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_wrong_length() {
        assert!(Frame::new(4, 4, PixelFormat::Bgr8, vec![0; 47]).is_err());
        assert!(Frame::new(4, 4, PixelFormat::Bgr8, vec![0; 48]).is_ok());
    }

    #[test]
    fn test_to_gray_weights() {
        let f = Frame::new(2, 1, PixelFormat::Bgr8, vec![0, 0, 255, 255, 255, 255]).unwrap();
        let g = f.to_gray();
        assert_eq!(g.format(), PixelFormat::Gray8);
        assert_eq!(g.data(), &[76, 255]);
    }

    #[test]
    fn test_png_keeps_channel_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.png");
        let f = Frame::new(2, 1, PixelFormat::Bgr8, vec![10, 20, 30, 40, 50, 60]).unwrap();
        f.save_png(&path).unwrap();
        let back = Frame::load(&path).unwrap();
        assert_eq!(back, f);
        assert_eq!(back.rgb_at(0, 0), (30, 20, 10));
    }
}
