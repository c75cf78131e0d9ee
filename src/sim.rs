//! Scripted devices and solvers for exercising the pipeline without hardware.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use nalgebra::{Matrix3, Point3, Rotation3, Vector3};

use crate::board::BoardGeometry;
use crate::calibration::{CalibrationResult, CalibrationSolver, StereoCorrespondences, StereoExtrinsics, ViewCorrespondences};
use crate::camera::driver::{
    Capture, DeviceDescription, DeviceDriver, DeviceInfo, EventOptions, EventSource, FrameOptions, FrameSource,
};
use crate::camera::Backend;
use crate::detection::{BoardDetector, Detection, Point2};
use crate::error::DeviceError;
use crate::events::{CdEvent, EventBatch, TriggerEvent};
use crate::frame::{Frame, PixelFormat};

pub fn device(id: &str) -> DeviceInfo {
    DeviceInfo { id: id.to_string(), name: format!("sim {}", id), transport: "sim".to_string() }
}

/// Frame camera yielding `frames` grabs, each frame filled with its counter.
#[derive(Debug, Clone)]
pub struct ScriptedFrameDriver {
    pub devices: Vec<DeviceInfo>,
    pub frames: u64,
    pub width: u32,
    pub height: u32,
    pub pace: Duration,
    pub fail_at: Option<u64>,
    pub skip_every: Option<u64>,
}

impl ScriptedFrameDriver {
    pub fn new(ids: &[&str], frames: u64) -> Self {
        Self {
            devices: ids.iter().map(|id| device(id)).collect(),
            frames,
            width: 8,
            height: 6,
            pace: Duration::from_millis(1),
            fail_at: None,
            skip_every: None,
        }
    }
}

struct ScriptedFrameSource {
    script: ScriptedFrameDriver,
    name: String,
    counter: u64,
}

impl FrameSource for ScriptedFrameSource {
    fn description(&self) -> DeviceDescription {
        DeviceDescription { name: self.name.clone(), width: self.script.width, height: self.script.height }
    }

    fn grab(&mut self) -> Result<Capture, DeviceError> {
        std::thread::sleep(self.script.pace);
        self.counter += 1;
        if self.script.fail_at == Some(self.counter) {
            return Err(DeviceError::Disconnected(self.name.clone()));
        }
        if self.counter > self.script.frames {
            return Ok(Capture::Exhausted);
        }
        if self.script.skip_every.is_some_and(|n| self.counter % n == 0) {
            return Ok(Capture::Skipped);
        }
        let frame = Frame::filled(self.script.width, self.script.height, PixelFormat::Gray8, (self.counter % 256) as u8);
        Ok(Capture::Frame { counter: self.counter, frame })
    }
}

impl DeviceDriver for ScriptedFrameDriver {
    type Source = Box<dyn FrameSource>;
    type Options = FrameOptions;

    fn backend(&self) -> Backend {
        Backend::Frame
    }

    fn enumerate(&self) -> Result<Vec<DeviceInfo>, DeviceError> {
        Ok(self.devices.clone())
    }

    fn open(&self, device: &DeviceInfo, _options: &FrameOptions) -> Result<Box<dyn FrameSource>, DeviceError> {
        Ok(Box::new(ScriptedFrameSource { script: self.clone(), name: device.name.clone(), counter: 0 }))
    }
}

/// Event camera emitting one trigger pulse (rising then falling) per batch,
/// with a short row of CD events before each pulse.
#[derive(Debug, Clone)]
pub struct ScriptedEventDriver {
    pub devices: Vec<DeviceInfo>,
    pub pulses: u64,
    pub period_us: u64,
    pub falling_polarity: u8,
    pub width: u32,
    pub height: u32,
    pub pace: Duration,
}

impl ScriptedEventDriver {
    pub fn new(ids: &[&str], pulses: u64) -> Self {
        Self {
            devices: ids.iter().map(|id| device(id)).collect(),
            pulses,
            period_us: 1000,
            falling_polarity: 0,
            width: 8,
            height: 6,
            pace: Duration::from_millis(1),
        }
    }
}

struct ScriptedEventSource {
    script: ScriptedEventDriver,
    name: String,
    pulse: u64,
}

impl EventSource for ScriptedEventSource {
    fn description(&self) -> DeviceDescription {
        DeviceDescription { name: self.name.clone(), width: self.script.width, height: self.script.height }
    }

    fn next_batch(&mut self) -> Result<Option<EventBatch>, DeviceError> {
        std::thread::sleep(self.script.pace);
        if self.pulse >= self.script.pulses {
            return Ok(None);
        }
        self.pulse += 1;
        let base = self.pulse * self.script.period_us;
        let cd = (0..self.script.width as u16)
            .map(|x| CdEvent { x, y: (self.pulse % self.script.height as u64) as u16, polarity: 1, t: base + x as u64 })
            .collect();
        let falling = self.script.falling_polarity;
        let triggers = vec![
            TriggerEvent { t: base + 100, id: 0, polarity: 1 - falling },
            TriggerEvent { t: base + 500, id: 0, polarity: falling },
        ];
        Ok(Some(EventBatch { cd, triggers }))
    }
}

impl DeviceDriver for ScriptedEventDriver {
    type Source = Box<dyn EventSource>;
    type Options = EventOptions;

    fn backend(&self) -> Backend {
        Backend::Event
    }

    fn enumerate(&self) -> Result<Vec<DeviceInfo>, DeviceError> {
        Ok(self.devices.clone())
    }

    fn open(&self, device: &DeviceInfo, _options: &EventOptions) -> Result<Box<dyn EventSource>, DeviceError> {
        Ok(Box::new(ScriptedEventSource { script: self.clone(), name: device.name.clone(), pulse: 0 }))
    }
}

/// Detector driven by a closure.
pub struct FnDetector<F>(pub F);

impl<F> BoardDetector for FnDetector<F>
where
    F: FnMut(&Frame) -> Detection + Send,
{
    fn detect(&mut self, frame: &Frame) -> Result<Detection> {
        Ok((self.0)(frame))
    }
}

/// Detection of the given ids with distinct coordinates per id.
pub fn detection_of(ids: impl IntoIterator<Item = i32>, offset: f32) -> Detection {
    let ids: Vec<i32> = ids.into_iter().collect();
    let corners = ids.iter().map(|&i| Point2::new(i as f32 + offset, 2.0 * i as f32 + offset)).collect();
    Detection::new(ids, corners).unwrap()
}

/// Pinhole projection of every board corner visible in front of the camera.
pub fn project_board(
    board: &BoardGeometry,
    k: &Matrix3<f64>,
    rotation: &Rotation3<f64>,
    translation: &Vector3<f64>,
) -> Detection {
    let mut ids = Vec::new();
    let mut corners = Vec::new();
    for id in 0..board.corner_count() as i32 {
        let Some(p) = board.object_point(id) else { continue };
        let p = Point3::new(p.x as f64, p.y as f64, p.z as f64);
        let cam = rotation * p.coords + translation;
        if cam.z <= 0.0 {
            continue;
        }
        let uv = k * (cam / cam.z);
        ids.push(id);
        corners.push(Point2::new(uv.x as f32, uv.y as f32));
    }
    Detection::new(ids, corners).unwrap()
}

/// Solver that records its inputs and returns fixed results.
#[derive(Debug, Default, Clone)]
pub struct RecordingSolver {
    pub mono_calls: Arc<Mutex<Vec<(usize, (u32, u32))>>>,
    pub stereo_calls: Arc<Mutex<Vec<StereoCall>>>,
}

#[derive(Debug, Clone)]
pub struct StereoCall {
    pub views: Vec<StereoCorrespondences>,
    pub left_fx: f64,
    pub right_fx: f64,
}

impl CalibrationSolver for RecordingSolver {
    fn calibrate_camera(&self, views: &[ViewCorrespondences], image_size: (u32, u32)) -> Result<CalibrationResult> {
        let mut calls = self.mono_calls.lock().unwrap();
        calls.push((views.len(), image_size));
        let fx = 100.0 * calls.len() as f64;
        Ok(CalibrationResult {
            image_size,
            reprojection_error: 0.25,
            camera_matrix: [[fx, 0.0, image_size.0 as f64 / 2.0], [0.0, fx, image_size.1 as f64 / 2.0], [0.0, 0.0, 1.0]],
            dist_coeffs: vec![0.0; 5],
            rvecs: vec![[0.0; 3]; views.len()],
            tvecs: vec![[0.0, 0.0, 1.0]; views.len()],
        })
    }

    fn stereo_calibrate(
        &self,
        views: &[StereoCorrespondences],
        left: &CalibrationResult,
        right: &CalibrationResult,
        _image_size: (u32, u32),
    ) -> Result<StereoExtrinsics> {
        self.stereo_calls.lock().unwrap().push(StereoCall {
            views: views.to_vec(),
            left_fx: left.camera_matrix[0][0],
            right_fx: right.camera_matrix[0][0],
        });
        Ok(StereoExtrinsics {
            reprojection_error: 0.5,
            rotation_matrix: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            translation: [0.1, 0.0, 0.0],
            essential_matrix: [[0.0; 3]; 3],
            fundamental_matrix: [[0.0; 3]; 3],
        })
    }
}

/// Valid config with `frames` frame workers, each with a distinct device id `f<i>`.
pub fn config(frames: usize, master: usize) -> crate::config::Config {
    let mut text = format!(
        "[board]\nsquares_x = 7\nsquares_y = 5\nsquare_length = 0.04\nmarker_length = 0.03\n\n\
         [recording]\nfps = 5\nmaster_worker = {}\n",
        master
    );
    for i in 0..frames {
        text.push_str(&format!("\n[[recording.workers]]\ntype = \"frame\"\nplacement = {}\ndevice_id = \"f{}\"\n", i, i));
    }
    crate::config::Config::from_toml(&text).unwrap()
}
