use std::path::PathBuf;

use tracing::{error, info};

use super::driver::{select_device, DeviceDriver, DeviceInfo, EventDriver, FrameDriver};
use super::event_worker::EventWorker;
use super::frame_worker::FrameWorker;
use super::{CameraState, Roster, WorkerState};
use crate::cancel::StopToken;
use crate::config::{Config, EventWorkerConfig, FrameWorkerConfig};
use crate::error::DeviceError;

/// Session-wide capture settings.
#[derive(Debug, Clone, Copy)]
pub struct RecordingParams {
    pub fps: u32,
    /// Seconds between synchronized samples
    pub detection_interval: f64,
}

impl RecordingParams {
    pub fn from_config(config: &Config) -> Self {
        Self { fps: config.recording.fps, detection_interval: config.detection.detection_interval }
    }

    /// Trigger pulses between two synchronized samples, never less than one.
    pub fn frame_step(&self) -> u64 {
        (self.fps as f64 * self.detection_interval).round().max(1.0) as u64
    }
}

/// What every worker is constructed with.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub stop: StopToken,
    pub roster: Roster,
    pub index: usize,
    pub params: RecordingParams,
    pub job_dir: PathBuf,
}

impl WorkerContext {
    pub fn state(&self) -> &CameraState {
        &self.roster[self.index]
    }

    /// Enumerate, select and open this camera's device, recording failures.
    pub(super) fn open<D>(&self, driver: &D, wanted: Option<&str>, options: &D::Options) -> Option<D::Source>
    where
        D: DeviceDriver + ?Sized,
    {
        self.state().set_state(WorkerState::Opening);
        let opened = driver
            .enumerate()
            .and_then(|devices| select_device(driver.backend(), devices, wanted))
            .and_then(|device| {
                info!(camera = self.index, id = %device.id, name = %device.name, "opening {} camera", driver.backend());
                driver.open(&device, options)
            });
        match opened {
            Ok(source) => {
                self.state().set_state(WorkerState::Open);
                Some(source)
            }
            Err(e) => {
                self.fail(&e);
                self.state().set_state(WorkerState::Stopped);
                None
            }
        }
    }

    /// Record a fatal device error and stop the whole session.
    pub(super) fn fail(&self, err: &DeviceError) {
        error!(camera = self.index, "{}", err);
        self.state().set_exit_code(err.exit_code());
        self.stop.request_stop();
    }

    /// Leave RUNNING. A rig with a camera gone cannot sample, so the session stops too.
    pub(super) fn finish(&self) {
        self.state().set_state(WorkerState::Stopping);
        self.stop.request_stop();
        self.state().set_state(WorkerState::Stopped);
        info!(camera = self.index, exit_code = self.state().exit_code(), "camera stopped");
    }
}

/// One camera of the rig, over either backend.
pub enum CameraWorker {
    Frame(FrameWorker),
    Event(EventWorker),
}

impl CameraWorker {
    pub fn frame(ctx: WorkerContext, driver: FrameDriver, config: FrameWorkerConfig) -> Self {
        CameraWorker::Frame(FrameWorker::new(ctx, driver, config))
    }

    pub fn event(ctx: WorkerContext, driver: EventDriver, config: EventWorkerConfig) -> Self {
        CameraWorker::Event(EventWorker::new(ctx, driver, config))
    }

    pub fn index(&self) -> usize {
        match self {
            CameraWorker::Frame(w) => w.context().index,
            CameraWorker::Event(w) => w.context().index,
        }
    }

    /// Open the device and capture until the session stops.
    pub fn start(self) {
        match self {
            CameraWorker::Frame(w) => w.run(),
            CameraWorker::Event(w) => w.run(),
        }
    }
}

/// Devices the driver can currently see.
pub fn list_available_sources<D>(driver: &D) -> Result<Vec<DeviceInfo>, DeviceError>
where
    D: DeviceDriver + ?Sized,
{
    driver.enumerate()
}
