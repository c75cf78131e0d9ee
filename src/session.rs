//! One recording session: workers, validator and the optional viewer.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::Receiver;
use tracing::{error, info, warn};

use crate::board::BoardGeometry;
use crate::camera::driver::{EventDriver, FrameDriver};
use crate::camera::{
    roster_from, worst_exit_code, Backend, CameraIdentity, CameraWorker, RecordingParams, Roster, WorkerContext,
    WorkerState,
};
use crate::cancel::StopToken;
use crate::config::{Config, WorkerConfig};
use crate::detection::BoardDetector;
use crate::error::DeviceError;
use crate::job::{JobData, JobPaths};
use crate::validator::{sample_channel, DetectionValidator, ValidatedSample};

const STARTUP_POLL: Duration = Duration::from_millis(10);

/// Presentation loop run on the session's calling thread.
pub type Viewer = Box<dyn FnOnce(Roster, Receiver<ValidatedSample>, StopToken) -> Result<()>>;

/// Device drivers available to this session, one per backend.
#[derive(Clone, Default)]
pub struct Drivers {
    pub frame: Option<FrameDriver>,
    pub event: Option<EventDriver>,
}

/// Rig order follows `placement`; the master is `recording.master_worker`.
pub fn build_roster(config: &Config) -> Roster {
    let mut workers: Vec<&WorkerConfig> = config.recording.workers.iter().collect();
    workers.sort_by_key(|w| w.placement());
    roster_from(workers.into_iter().map(|w| CameraIdentity {
        index: w.placement(),
        is_master: w.placement() == config.recording.master_worker,
        backend: w.backend(),
    }))
}

pub struct RecordingSession {
    config: Config,
    job: JobPaths,
    drivers: Drivers,
    stop: StopToken,
    roster: Roster,
}

impl RecordingSession {
    pub fn new(config: Config, job: JobPaths, drivers: Drivers, stop: StopToken) -> Self {
        let roster = build_roster(&config);
        Self { config, job, drivers, stop, roster }
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    fn worker(&self, config: &WorkerConfig) -> Result<CameraWorker, DeviceError> {
        let ctx = WorkerContext {
            stop: self.stop.clone(),
            roster: self.roster.clone(),
            index: config.placement(),
            params: RecordingParams::from_config(&self.config),
            job_dir: self.job.root().to_path_buf(),
        };
        let missing = |backend: Backend| DeviceError::NotFound { backend: backend.as_str() };
        match config {
            WorkerConfig::Frame(c) => {
                let driver = self.drivers.frame.clone().ok_or_else(|| missing(Backend::Frame))?;
                Ok(CameraWorker::frame(ctx, driver, c.clone()))
            }
            WorkerConfig::Event(c) => {
                let driver = self.drivers.event.clone().ok_or_else(|| missing(Backend::Event))?;
                Ok(CameraWorker::event(ctx, driver, c.clone()))
            }
        }
    }

    /// Record until a stop is requested, a camera fails or a source runs dry.
    /// Returns the worst worker exit code.
    pub fn run(self, detector: Box<dyn BoardDetector>, viewer: Option<Viewer>) -> Result<i32> {
        info!(job = %self.job.id(), cameras = self.roster.len(), "recording session starting");

        let mut workers = Vec::with_capacity(self.roster.len());
        for config in &self.config.recording.workers {
            match self.worker(config) {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    error!(camera = config.placement(), "{}", e);
                    let state = &self.roster[config.placement()];
                    state.set_exit_code(e.exit_code());
                    state.set_state(WorkerState::Stopped);
                    self.stop.request_stop();
                }
            }
        }

        // Slaves first, so the master's first request has a listener.
        let (masters, slaves): (Vec<_>, Vec<_>) =
            workers.into_iter().partition(|w| self.roster[w.index()].identity().is_master);
        let mut handles = Vec::with_capacity(self.roster.len() + 1);
        for worker in slaves {
            handles.push(spawn_worker(worker)?);
        }
        self.wait_for_slaves();
        for worker in masters {
            handles.push(spawn_worker(worker)?);
        }

        let (samples_tx, samples_rx) = sample_channel();
        let threshold = BoardGeometry::from_config(&self.config.board)
            .corner_threshold(self.config.detection.minimum_corner_fraction);
        let validator = DetectionValidator::new(
            self.roster.clone(),
            detector,
            threshold,
            Duration::from_secs_f64(self.config.detection.alignment_timeout_secs),
            self.job.clone(),
            samples_tx,
            self.stop.clone(),
        );
        let validator = thread::Builder::new()
            .name("validator".to_string())
            .spawn(move || validator.run())
            .context("Failed to spawn validator thread")?;

        match viewer {
            Some(viewer) => {
                if let Err(e) = viewer(self.roster.clone(), samples_rx, self.stop.clone()) {
                    error!("viewer failed: {:#}", e);
                    self.stop.request_stop();
                }
            }
            None => {
                while !self.stop.wait(Duration::from_millis(100)) {
                    samples_rx.try_iter().for_each(drop);
                }
            }
        }
        self.stop.request_stop();

        for handle in handles {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                warn!(thread = %name, "worker thread panicked");
            }
        }
        match validator.join() {
            Ok(stats) => info!(accepted = stats.accepted, rounds = stats.rounds, "validation finished"),
            Err(_) => warn!("validator thread panicked"),
        }

        let data = JobData::from_roster(&self.config, &self.roster);
        data.save(&self.job.manifest_path())?;
        let code = worst_exit_code(&self.roster);
        info!(job = %self.job.id(), exit_code = code, "recording session finished");
        Ok(code)
    }

    fn wait_for_slaves(&self) {
        let ready = |s: WorkerState| matches!(s, WorkerState::Running | WorkerState::Stopped);
        while !self.stop.stop_requested() {
            let pending = self
                .roster
                .iter()
                .filter(|c| !c.identity().is_master)
                .any(|c| !ready(c.state()));
            if !pending {
                return;
            }
            thread::sleep(STARTUP_POLL);
        }
    }
}

fn spawn_worker(worker: CameraWorker) -> Result<JoinHandle<()>> {
    let index = worker.index();
    thread::Builder::new()
        .name(format!("cam-{}", index))
        .spawn(move || worker.start())
        .with_context(|| format!("Failed to spawn worker thread for camera {}", index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EventWorkerConfig, FrameWorkerConfig};
    use crate::job::frame_ids;
    use crate::sim::{self, detection_of, FnDetector, ScriptedEventDriver, ScriptedFrameDriver};
    use std::sync::Arc;

    fn full_board() -> Box<dyn BoardDetector> {
        Box::new(FnDetector(|_: &crate::frame::Frame| detection_of(0..24, 0.0)))
    }

    fn frame_drivers(ids: &[&str], frames: u64) -> Drivers {
        Drivers { frame: Some(Arc::new(ScriptedFrameDriver::new(ids, frames))), event: None }
    }

    #[test]
    fn test_roster_sorted_by_placement() {
        let mut config = sim::config(3, 2);
        config.recording.workers.reverse();
        let roster = build_roster(&config);
        let indices: Vec<usize> = roster.iter().map(|c| c.index()).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert!(roster[2].identity().is_master);
        assert!(!roster[0].identity().is_master);
    }

    #[test]
    fn test_frame_rig_records_and_writes_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let job = JobPaths::in_data_dir(dir.path(), "job_test");
        job.prepare_recording(false).unwrap();
        let session =
            RecordingSession::new(sim::config(2, 0), job.clone(), frame_drivers(&["f0", "f1"], 200), StopToken::new());
        let code = session.run(full_board(), None).unwrap();
        assert_eq!(code, 0);

        let data = JobData::load(&job.manifest_path()).unwrap();
        assert_eq!(data.camera_indices(), vec![0, 1]);
        assert!(data.camera(0).unwrap().is_master);
        assert_eq!(data.camera(1).unwrap().resolution.width, 8);

        let ids = frame_ids(&job.raw_camera_dir(0)).unwrap();
        assert!(!ids.is_empty());
        assert!(ids.iter().all(|id| id % 10 == 1));
        assert_eq!(ids, frame_ids(&job.raw_camera_dir(1)).unwrap());
    }

    #[test]
    fn test_mixed_rig_with_event_master() {
        let dir = tempfile::tempdir().unwrap();
        let job = JobPaths::in_data_dir(dir.path(), "job_mixed");
        job.prepare_recording(false).unwrap();
        let mut config = sim::config(1, 0);
        config.recording.workers[0] =
            WorkerConfig::Frame(FrameWorkerConfig { placement: 1, device_id: None, width: None, height: None });
        config.recording.workers.push(WorkerConfig::Event(EventWorkerConfig {
            placement: 0,
            device_id: None,
            accumulation_time: 500,
            falling_edge_polarity: 0,
            polarity_filter: None,
            save_event_file: false,
            realtime: false,
        }));
        config.validate().unwrap();
        let drivers = Drivers {
            frame: Some(Arc::new(ScriptedFrameDriver::new(&["f"], 200))),
            event: Some(Arc::new(ScriptedEventDriver::new(&["e"], 40))),
        };
        let session = RecordingSession::new(config, job.clone(), drivers, StopToken::new());
        assert_eq!(session.roster()[0].identity().backend, Backend::Event);
        let code = session.run(full_board(), None).unwrap();
        assert_eq!(code, 0);

        let data = JobData::load(&job.manifest_path()).unwrap();
        assert_eq!(data.camera(0).unwrap().backend, Backend::Event);
        assert_eq!(data.camera(1).unwrap().backend, Backend::Frame);
    }

    #[test]
    fn test_missing_device_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let job = JobPaths::in_data_dir(dir.path(), "job_missing");
        job.prepare_recording(false).unwrap();
        let session =
            RecordingSession::new(sim::config(2, 0), job.clone(), frame_drivers(&["f0"], 1000), StopToken::new());
        let code = session.run(full_board(), None).unwrap();
        assert_eq!(code, 2);
        assert!(job.manifest_path().is_file());
    }

    #[test]
    fn test_missing_backend_driver_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let job = JobPaths::in_data_dir(dir.path(), "job_nodriver");
        let session = RecordingSession::new(sim::config(1, 0), job.clone(), Drivers::default(), StopToken::new());
        std::fs::create_dir_all(job.root()).unwrap();
        assert_eq!(session.run(full_board(), None).unwrap(), 2);
    }

    #[test]
    fn test_viewer_close_stops_session() {
        let dir = tempfile::tempdir().unwrap();
        let job = JobPaths::in_data_dir(dir.path(), "job_viewer");
        job.prepare_recording(false).unwrap();
        let session = RecordingSession::new(
            sim::config(2, 0),
            job.clone(),
            frame_drivers(&["f0", "f1"], u64::MAX),
            StopToken::new(),
        );
        let viewer: Viewer = Box::new(|roster: Roster, _samples, stop: StopToken| {
            stop.wait(Duration::from_millis(50));
            assert_eq!(roster.len(), 2);
            Ok(())
        });
        assert_eq!(session.run(full_board(), Some(viewer)).unwrap(), 0);
    }
}
