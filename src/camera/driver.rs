//! Device access seams for the two camera backends.

use std::sync::Arc;

use crate::error::DeviceError;
use crate::events::EventBatch;
use crate::frame::Frame;

use super::Backend;

/// A device found during enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Stable unique identifier used in `device_id`
    pub id: String,
    pub name: String,
    pub transport: String,
}

/// What an opened device reports about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescription {
    pub name: String,
    pub width: u32,
    pub height: u32,
}

/// Result of one grab on a frame camera.
#[derive(Debug)]
pub enum Capture {
    /// Image with the device's per-grab counter
    Frame { counter: u64, frame: Frame },
    /// Unreadable image, not fatal
    Skipped,
    /// The source has no more images
    Exhausted,
}

#[derive(Debug, Clone, Default)]
pub struct FrameOptions {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct EventOptions {
    /// Replay recorded streams at their original speed
    pub realtime: bool,
}

pub trait FrameSource: Send {
    fn description(&self) -> DeviceDescription;
    /// Blocks until the next image. `Err` means the device is gone.
    fn grab(&mut self) -> Result<Capture, DeviceError>;
}

pub trait EventSource: Send {
    fn description(&self) -> DeviceDescription;
    /// Next slice of the event stream, `Ok(None)` once exhausted.
    fn next_batch(&mut self) -> Result<Option<EventBatch>, DeviceError>;
}

/// Enumerates and opens devices of one backend.
pub trait DeviceDriver: Send + Sync {
    type Source;
    type Options;

    fn backend(&self) -> Backend;
    fn enumerate(&self) -> Result<Vec<DeviceInfo>, DeviceError>;
    fn open(&self, device: &DeviceInfo, options: &Self::Options) -> Result<Self::Source, DeviceError>;
}

pub type FrameDriver = Arc<dyn DeviceDriver<Source = Box<dyn FrameSource>, Options = FrameOptions>>;
pub type EventDriver = Arc<dyn DeviceDriver<Source = Box<dyn EventSource>, Options = EventOptions>>;

/// Pick the requested device, or the first one when no id is given.
pub fn select_device(
    backend: Backend,
    devices: Vec<DeviceInfo>,
    wanted: Option<&str>,
) -> Result<DeviceInfo, DeviceError> {
    if devices.is_empty() {
        return Err(DeviceError::NotFound { backend: backend.as_str() });
    }
    match wanted {
        None => devices.into_iter().next().ok_or(DeviceError::NotFound { backend: backend.as_str() }),
        Some(id) => {
            let available: Vec<String> = devices.iter().map(|d| d.id.clone()).collect();
            devices.into_iter().find(|d| d.id == id).ok_or_else(|| DeviceError::NoMatch {
                backend: backend.as_str(),
                id: id.to_string(),
                available,
            })
        }
    }
}
