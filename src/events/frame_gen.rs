use std::collections::VecDeque;

use super::CdEvent;
use crate::frame::{Frame, PixelFormat};

/// BGR colours used when rendering events.
#[derive(Debug, Clone, Copy)]
pub struct Palette {
    pub background: [u8; 3],
    pub on: [u8; 3],
    pub off: [u8; 3],
}

impl Default for Palette {
    fn default() -> Self {
        Self { background: [52, 37, 30], on: [255, 255, 255], off: [200, 126, 64] }
    }
}

/// Renders frames from buffered CD events on demand.
///
/// A frame at time `t` shows every event in `(t - accumulation, t]`, later
/// events overwriting earlier ones at the same pixel.
#[derive(Debug)]
pub struct FrameGenerator {
    width: u32,
    height: u32,
    accumulation: u64,
    palette: Palette,
    events: VecDeque<CdEvent>,
    latest: Option<u64>,
}

impl FrameGenerator {
    pub fn new(width: u32, height: u32, accumulation: u64) -> Self {
        Self {
            width,
            height,
            accumulation,
            palette: Palette::default(),
            events: VecDeque::new(),
            latest: None,
        }
    }

    pub fn latest_timestamp(&self) -> Option<u64> {
        self.latest
    }

    pub fn buffered(&self) -> usize {
        self.events.len()
    }

    pub fn push(&mut self, event: CdEvent) {
        if event.x as u32 >= self.width || event.y as u32 >= self.height {
            return;
        }
        self.latest = Some(self.latest.map_or(event.t, |l| l.max(event.t)));
        self.events.push_back(event);
        self.prune();
    }

    pub fn extend(&mut self, events: impl IntoIterator<Item = CdEvent>) {
        for e in events {
            self.push(e);
        }
    }

    // Anything older than one window before the newest event can never be rendered again.
    fn prune(&mut self) {
        let Some(latest) = self.latest else { return };
        let horizon = latest.saturating_sub(self.accumulation);
        while self.events.front().is_some_and(|e| e.t <= horizon && latest >= self.accumulation) {
            self.events.pop_front();
        }
    }

    pub fn render(&self, t: u64) -> Frame {
        let mut frame = Frame::filled(self.width, self.height, PixelFormat::Bgr8, 0);
        for px in frame.data_mut().chunks_exact_mut(3) {
            px.copy_from_slice(&self.palette.background);
        }
        let start = t.saturating_sub(self.accumulation);
        let stride = self.width as usize * 3;
        let data = frame.data_mut();
        for e in self.events.iter().filter(|e| e.t <= t && (e.t > start || t < self.accumulation)) {
            let i = e.y as usize * stride + e.x as usize * 3;
            let colour = if e.polarity == 0 { &self.palette.off } else { &self.palette.on };
            data[i..i + 3].copy_from_slice(colour);
        }
        frame
    }
}
