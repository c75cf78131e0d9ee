//! OpenCV `VideoCapture` によるフレームカメラバックエンド

use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::unbounded;
use opencv::{
    core::Mat,
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureAPIs},
};
use tracing::debug;

use super::driver::{Capture, DeviceDescription, DeviceDriver, DeviceInfo, FrameOptions, FrameSource};
use super::Backend;
use crate::detection::charuco::mat_to_frame;
use crate::error::DeviceError;

/// 連続読み込み失敗がこの回数に達したらデバイス喪失とみなす
const MAX_FAILED_READS: u32 = 30;

/// OpenCVキャプチャインデックスのフレームドライバ。デバイスIDはインデックスの文字列。
#[derive(Debug, Clone)]
pub struct OpenCvDriver {
    max_index: i32,
    probe_timeout: Duration,
}

impl Default for OpenCvDriver {
    fn default() -> Self {
        Self { max_index: 8, probe_timeout: Duration::from_secs(3) }
    }
}

impl OpenCvDriver {
    pub fn new(max_index: i32, probe_timeout: Duration) -> Self {
        Self { max_index, probe_timeout }
    }
}

/// 全インデックスを並列に開き、タイムアウト内に開けたものを残す
fn probe_cameras(max_index: i32, timeout: Duration) -> Vec<i32> {
    let (tx, rx) = unbounded();

    for i in 0..max_index {
        let tx = tx.clone();
        thread::spawn(move || {
            if let Ok(cap) = VideoCapture::new(i, VideoCaptureAPIs::CAP_ANY as i32) {
                if cap.is_opened().unwrap_or(false) {
                    let _ = tx.send(i);
                }
            }
        });
    }
    drop(tx);

    let deadline = Instant::now() + timeout;
    let mut found = Vec::new();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match rx.recv_timeout(remaining) {
            Ok(idx) => found.push(idx),
            Err(_) => break,
        }
    }
    found.sort();
    found
}

impl DeviceDriver for OpenCvDriver {
    type Source = Box<dyn FrameSource>;
    type Options = FrameOptions;

    fn backend(&self) -> Backend {
        Backend::Frame
    }

    fn enumerate(&self) -> Result<Vec<DeviceInfo>, DeviceError> {
        Ok(probe_cameras(self.max_index, self.probe_timeout)
            .into_iter()
            .map(|i| DeviceInfo { id: i.to_string(), name: format!("OpenCV camera {}", i), transport: "videoio".into() })
            .collect())
    }

    fn open(&self, device: &DeviceInfo, options: &FrameOptions) -> Result<Box<dyn FrameSource>, DeviceError> {
        let open_err = |reason: String| DeviceError::Open { id: device.id.clone(), reason };
        let index: i32 = device.id.parse().map_err(|_| open_err("not a capture index".into()))?;
        let camera = OpenCvCamera::open_with_config(index, &device.name, options).map_err(|e| open_err(format!("{:#}", e)))?;
        Ok(Box::new(camera))
    }
}

/// OpenCVを使用したカメラキャプチャ
pub struct OpenCvCamera {
    capture: VideoCapture,
    name: String,
    width: u32,
    height: u32,
    counter: u64,
    failed_reads: u32,
}

impl OpenCvCamera {
    pub fn open_with_config(index: i32, name: &str, options: &FrameOptions) -> Result<Self> {
        let mut capture =
            VideoCapture::new(index, VideoCaptureAPIs::CAP_ANY as i32).context("Failed to open camera")?;

        if !capture.is_opened()? {
            anyhow::bail!("Camera {} is not available", index);
        }

        if let Some(w) = options.width {
            capture.set(videoio::CAP_PROP_FRAME_WIDTH, w as f64)?;
        }
        if let Some(h) = options.height {
            capture.set(videoio::CAP_PROP_FRAME_HEIGHT, h as f64)?;
        }
        if let Some(f) = options.fps {
            capture.set(videoio::CAP_PROP_FPS, f as f64)?;
        }
        capture.set(videoio::CAP_PROP_BUFFERSIZE, 1.0)?;

        let width = capture.get(videoio::CAP_PROP_FRAME_WIDTH)? as u32;
        let height = capture.get(videoio::CAP_PROP_FRAME_HEIGHT)? as u32;
        debug!(index, fps = capture.get(videoio::CAP_PROP_FPS)?, "capture configured");

        Ok(Self { capture, name: name.to_string(), width, height, counter: 0, failed_reads: 0 })
    }
}

impl FrameSource for OpenCvCamera {
    fn description(&self) -> DeviceDescription {
        DeviceDescription { name: self.name.clone(), width: self.width, height: self.height }
    }

    fn grab(&mut self) -> Result<Capture, DeviceError> {
        let mut mat = Mat::default();
        let ok = self.capture.read(&mut mat).unwrap_or(false);
        // ハードウェアカウンタと同じく読み込み1回で1フレーム進める
        self.counter += 1;

        if !ok || mat.empty() {
            self.failed_reads += 1;
            if self.failed_reads >= MAX_FAILED_READS || !self.capture.is_opened().unwrap_or(false) {
                return Err(DeviceError::Disconnected(format!("{}: no frames", self.name)));
            }
            return Ok(Capture::Skipped);
        }
        self.failed_reads = 0;

        match mat_to_frame(&mat) {
            Ok(frame) => Ok(Capture::Frame { counter: self.counter, frame }),
            Err(e) => {
                debug!("frame conversion failed: {:#}", e);
                Ok(Capture::Skipped)
            }
        }
    }
}
