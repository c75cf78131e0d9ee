use std::time::Duration;

use anyhow::Result;
use crossbeam_channel::{Receiver, TryRecvError};
use minifb::{Key, Window, WindowOptions};
use tracing::{info, warn};

use super::compose::{Canvas, Compositor};
use crate::camera::Roster;
use crate::cancel::StopToken;
use crate::config::ViewingConfig;
use crate::validator::{AcceptanceTotals, ValidatedSample};

const REFRESH: Duration = Duration::from_millis(33);

/// 合成キャンバスを表示するminifbウィンドウ
pub struct MinifbRenderer {
    window: Window,
    width: usize,
    height: usize,
}

impl MinifbRenderer {
    pub fn new(title: &str, width: usize, height: usize) -> Result<Self> {
        let window = Window::new(
            title,
            width,
            height,
            WindowOptions {
                resize: false,
                ..WindowOptions::default()
            },
        )?;
        Ok(Self { window, width, height })
    }

    /// ウィンドウが閉じられたかEscapeが押された
    pub fn is_open(&self) -> bool {
        self.window.is_open() && !self.window.is_key_down(Key::Escape)
    }

    pub fn set_title(&mut self, title: &str) {
        self.window.set_title(title);
    }

    pub fn present(&mut self, canvas: &Canvas) -> Result<()> {
        debug_assert_eq!((canvas.width(), canvas.height()), (self.width, self.height));
        self.window.update_with_buffer(canvas.buffer(), self.width, self.height)?;
        Ok(())
    }
}

fn title(totals: AcceptanceTotals) -> String {
    format!(
        "rigcal - {} samples, {} corners accepted",
        totals.accepted_sets, totals.accepted_corners
    )
}

/// ライブ確認ループ。ウィンドウが閉じるかセッションが止まるまで呼び出し元スレッドで回る。
/// ウィンドウを閉じるとセッションも止める。
pub fn run_viewer(
    roster: Roster,
    samples: Receiver<ValidatedSample>,
    stop: StopToken,
    viewing: &ViewingConfig,
) -> Result<()> {
    let cameras = roster.len();
    let tile_w = viewing.tile_width.max(1);
    let (w, h) = roster
        .iter()
        .find_map(|c| c.description().map(|d| (d.width, d.height)))
        .unwrap_or((4, 3));
    let tile_h = (tile_w as u64 * h.max(1) as u64 / w.max(1) as u64).max(1) as usize;

    let mut compositor = Compositor::new(cameras, viewing.views_horizontal, tile_w, tile_h);
    let (width, height) = (compositor.canvas().width(), compositor.canvas().height());
    let mut renderer = MinifbRenderer::new(&title(AcceptanceTotals::default()), width, height)?;
    info!(width, height, cameras, "viewer opened");

    let mut overlays: Vec<Option<ValidatedSample>> = vec![None; cameras];
    while renderer.is_open() && !stop.stop_requested() {
        loop {
            match samples.try_recv() {
                Ok(sample) => {
                    if let Some(totals) = sample.totals {
                        renderer.set_title(&title(totals));
                    }
                    if let Some(slot) = overlays.get_mut(sample.camera) {
                        *slot = Some(sample);
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break,
            }
        }

        let frames: Vec<_> = roster.iter().map(|c| c.live().latest()).collect();
        compositor.compose(&frames, &overlays);
        if let Err(e) = renderer.present(compositor.canvas()) {
            warn!("viewer update failed: {}", e);
        }
        std::thread::sleep(REFRESH);
    }

    stop.request_stop();
    info!("viewer closed");
    Ok(())
}
