use std::path::PathBuf;

use thiserror::Error;

/// Exit code reported when a configured camera cannot be found.
pub const EXIT_DEVICE_NOT_FOUND: i32 = 2;
/// Exit code for any other unrecoverable camera failure.
pub const EXIT_FAILURE: i32 = 1;

/// Failures while locating, opening or streaming from a camera.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("no {backend} camera connected")]
    NotFound { backend: &'static str },
    #[error("no {backend} camera with id {id:?} (available: {available:?})")]
    NoMatch {
        backend: &'static str,
        id: String,
        available: Vec<String>,
    },
    #[error("failed to enumerate {backend} cameras: {reason}")]
    Enumeration { backend: &'static str, reason: String },
    #[error("failed to open camera {id:?}: {reason}")]
    Open { id: String, reason: String },
    #[error("camera connection lost: {0}")]
    Disconnected(String),
}

impl DeviceError {
    pub fn exit_code(&self) -> i32 {
        match self {
            DeviceError::NotFound { .. } | DeviceError::NoMatch { .. } => EXIT_DEVICE_NOT_FOUND,
            _ => EXIT_FAILURE,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no workers configured")]
    NoWorkers,
    #[error("master_worker {master} is out of range for {workers} workers")]
    MasterOutOfRange { master: usize, workers: usize },
    #[error("worker placements must cover 0..{workers} exactly once (got {placements:?})")]
    Placements { workers: usize, placements: Vec<usize> },
    #[error("two {backend} workers need distinct device_id values")]
    AmbiguousDevice { backend: &'static str },
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Reasons a calibration command cannot run or complete.
#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("job directory {0} does not exist")]
    MissingJob(PathBuf),
    #[error("verified image directory {0} does not exist; run `verify` first")]
    MissingVerifiedImages(PathBuf),
    #[error("job manifest {0} does not exist")]
    MissingManifest(PathBuf),
    #[error("camera {0} is not listed in the job manifest")]
    MissingCamera(String),
    #[error("no images found for {0}")]
    NoImages(String),
    #[error("{camera}: only {usable} usable views, need at least {required}")]
    InsufficientViews {
        camera: String,
        usable: usize,
        required: usize,
    },
    #[error("{0} has no intrinsics; run mono calibration first")]
    MissingIntrinsics(String),
    #[error("{left} and {right} share no usable views")]
    NoCommonViews { left: String, right: String },
    #[error("solver failed for {camera}: {reason}")]
    Solver { camera: String, reason: String },
}
