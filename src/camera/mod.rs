//! Per-camera workers and the state they share with the rest of the session.

#[cfg(feature = "opencv")]
pub mod capture;
pub mod driver;
pub mod event_worker;
pub mod frame_worker;
pub mod sync;
pub mod worker;

use std::fmt;
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender};
use serde::{Deserialize, Serialize};

use crate::cancel::StopToken;
use crate::frame::Frame;

pub use driver::{DeviceDescription, DeviceInfo};
pub use worker::{CameraWorker, RecordingParams, WorkerContext};

pub const REQUEST_QUEUE_CAPACITY: usize = 100;
pub const VERIFY_QUEUE_CAPACITY: usize = 100;

const VERIFY_SEND_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Frame,
    Event,
}

impl Backend {
    pub fn as_str(self) -> &'static str {
        match self {
            Backend::Frame => "frame",
            Backend::Event => "event",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CameraIdentity {
    /// Left-to-right position in the rig
    pub index: usize,
    pub is_master: bool,
    pub backend: Backend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Closed = 0,
    Opening = 1,
    Open = 2,
    Running = 3,
    Stopping = 4,
    Stopped = 5,
}

impl WorkerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => WorkerState::Closed,
            1 => WorkerState::Opening,
            2 => WorkerState::Open,
            3 => WorkerState::Running,
            4 => WorkerState::Stopping,
            _ => WorkerState::Stopped,
        }
    }
}

/// Frame captured at a requested logical index, waiting for validation.
#[derive(Debug, Clone)]
pub struct VerifyTask {
    pub id: u64,
    pub frame: Arc<Frame>,
}

/// Single-slot holder of the newest frame, for presentation only.
#[derive(Debug, Default)]
pub struct LiveFrame {
    slot: Mutex<Option<Arc<Frame>>>,
}

impl LiveFrame {
    pub fn publish(&self, frame: Arc<Frame>) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(frame);
    }

    pub fn latest(&self) -> Option<Arc<Frame>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Runtime state of one camera, shared between its worker, the master, the
/// validator and the viewer.
#[derive(Debug)]
pub struct CameraState {
    identity: CameraIdentity,
    description: OnceLock<DeviceDescription>,
    state: AtomicU8,
    exit_code: AtomicI32,
    live: LiveFrame,
    request_tx: Sender<u64>,
    request_rx: Receiver<u64>,
    verify_tx: Sender<VerifyTask>,
    verify_rx: Receiver<VerifyTask>,
}

impl CameraState {
    pub fn new(identity: CameraIdentity) -> Self {
        let (request_tx, request_rx) = bounded(REQUEST_QUEUE_CAPACITY);
        let (verify_tx, verify_rx) = bounded(VERIFY_QUEUE_CAPACITY);
        Self {
            identity,
            description: OnceLock::new(),
            state: AtomicU8::new(WorkerState::Closed as u8),
            exit_code: AtomicI32::new(0),
            live: LiveFrame::default(),
            request_tx,
            request_rx,
            verify_tx,
            verify_rx,
        }
    }

    pub fn identity(&self) -> CameraIdentity {
        self.identity
    }

    pub fn index(&self) -> usize {
        self.identity.index
    }

    pub fn description(&self) -> Option<&DeviceDescription> {
        self.description.get()
    }

    /// Record the opened device. Only the first call has an effect.
    pub fn set_description(&self, description: DeviceDescription) {
        let _ = self.description.set(description);
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::Acquire)
    }

    pub fn set_exit_code(&self, code: i32) {
        self.exit_code.store(code, Ordering::Release);
    }

    pub fn live(&self) -> &LiveFrame {
        &self.live
    }

    pub fn request_sender(&self) -> Sender<u64> {
        self.request_tx.clone()
    }

    pub fn request_receiver(&self) -> Receiver<u64> {
        self.request_rx.clone()
    }

    pub fn verify_receiver(&self) -> &Receiver<VerifyTask> {
        &self.verify_rx
    }

    /// Queue a task for the validator, waiting while the queue is full.
    /// Returns false if the session stopped before the task was accepted.
    pub fn submit_verify(&self, mut task: VerifyTask, stop: &StopToken) -> bool {
        loop {
            if stop.stop_requested() {
                return false;
            }
            match self.verify_tx.send_timeout(task, VERIFY_SEND_TIMEOUT) {
                Ok(()) => return true,
                Err(SendTimeoutError::Timeout(t)) => task = t,
                Err(SendTimeoutError::Disconnected(_)) => return false,
            }
        }
    }
}

/// All cameras of a session ordered by placement.
pub type Roster = Arc<[CameraState]>;

pub fn roster_from(identities: impl IntoIterator<Item = CameraIdentity>) -> Roster {
    identities.into_iter().map(CameraState::new).collect::<Vec<_>>().into()
}

/// Highest exit code recorded by any camera, 0 if all succeeded.
pub fn worst_exit_code(roster: &[CameraState]) -> i32 {
    roster.iter().map(CameraState::exit_code).max().unwrap_or(0).max(0)
}
