//! Event streams stored as EVT 2.0 files, exposed as an event camera backend.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use super::evt2::{Evt2Decoder, Evt2Encoder, Evt2Header};
use super::EventBatch;
use crate::camera::driver::{DeviceDescription, DeviceDriver, DeviceInfo, EventOptions, EventSource};
use crate::camera::Backend;
use crate::error::DeviceError;

const READ_CHUNK: usize = 64 * 1024;

/// Treats every `*.raw` file in a directory as a connected event camera.
/// The device id is the file stem.
#[derive(Debug, Clone)]
pub struct Evt2Driver {
    dir: PathBuf,
}

impl Evt2Driver {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl DeviceDriver for Evt2Driver {
    type Source = Box<dyn EventSource>;
    type Options = EventOptions;

    fn backend(&self) -> Backend {
        Backend::Event
    }

    fn enumerate(&self) -> Result<Vec<DeviceInfo>, DeviceError> {
        let entries = fs::read_dir(&self.dir).map_err(|e| DeviceError::Enumeration {
            backend: "event",
            reason: format!("{}: {}", self.dir.display(), e),
        })?;
        let mut devices: Vec<DeviceInfo> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "raw"))
            .filter_map(|p| {
                let stem = p.file_stem()?.to_string_lossy().to_string();
                Some(DeviceInfo {
                    id: stem.clone(),
                    name: format!("EVT2 stream {}", stem),
                    transport: p.display().to_string(),
                })
            })
            .collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(devices)
    }

    fn open(&self, device: &DeviceInfo, options: &EventOptions) -> Result<Box<dyn EventSource>, DeviceError> {
        let path = self.dir.join(format!("{}.raw", device.id));
        let source = Evt2Source::open(&path, options.realtime).map_err(|e| DeviceError::Open {
            id: device.id.clone(),
            reason: format!("{:#}", e),
        })?;
        Ok(Box::new(source))
    }
}

/// Reads an EVT 2.0 stream in fixed-size chunks.
pub struct Evt2Source<R: Read = File> {
    name: String,
    reader: BufReader<R>,
    header: Evt2Header,
    decoder: Evt2Decoder,
    buf: Vec<u8>,
    pacing: Option<Pacing>,
}

#[derive(Debug)]
struct Pacing {
    started: Instant,
    first_t: Option<u64>,
}

impl Pacing {
    fn hold(&mut self, t: u64) {
        let first = *self.first_t.get_or_insert(t);
        let due = Duration::from_micros(t.saturating_sub(first));
        let elapsed = self.started.elapsed();
        if due > elapsed {
            std::thread::sleep(due - elapsed);
        }
    }
}

impl Evt2Source<File> {
    pub fn open(path: &Path, realtime: bool) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        let name = path.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_default();
        Self::from_reader(name, file, realtime)
    }
}

impl<R: Read> Evt2Source<R> {
    pub fn from_reader(name: String, inner: R, realtime: bool) -> Result<Self> {
        let mut reader = BufReader::new(inner);
        let header = Evt2Header::read(&mut reader)?;
        Ok(Self {
            name,
            reader,
            header,
            decoder: Evt2Decoder::new(),
            buf: vec![0; READ_CHUNK],
            pacing: realtime.then(|| Pacing { started: Instant::now(), first_t: None }),
        })
    }

    pub fn header(&self) -> &Evt2Header {
        &self.header
    }
}

impl<R: Read + Send> EventSource for Evt2Source<R> {
    fn description(&self) -> DeviceDescription {
        DeviceDescription { name: self.name.clone(), width: self.header.width, height: self.header.height }
    }

    fn next_batch(&mut self) -> Result<Option<EventBatch>, DeviceError> {
        let n = self
            .reader
            .read(&mut self.buf)
            .map_err(|e| DeviceError::Disconnected(format!("{}: {}", self.name, e)))?;
        if n == 0 {
            return Ok(None);
        }
        let mut batch = EventBatch::default();
        self.decoder.decode(&self.buf[..n], &mut batch);
        if let (Some(pacing), Some(t)) = (self.pacing.as_mut(), batch.last_timestamp()) {
            pacing.hold(t);
        }
        Ok(Some(batch))
    }
}

/// Records an event stream to an EVT 2.0 file.
pub struct Evt2Writer {
    out: BufWriter<File>,
    encoder: Evt2Encoder,
    scratch: Vec<u8>,
}

impl Evt2Writer {
    pub fn create(path: &Path, width: u32, height: u32) -> Result<Self> {
        let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
        let mut out = BufWriter::new(file);
        out.write_all(&Evt2Header::new(width, height).encode())?;
        Ok(Self { out, encoder: Evt2Encoder::new(), scratch: Vec::new() })
    }

    pub fn write_batch(&mut self, batch: &EventBatch) -> Result<()> {
        self.scratch.clear();
        self.encoder.encode_batch(batch, &mut self.scratch);
        self.out.write_all(&self.scratch).context("Failed to write event file")
    }

    pub fn finish(mut self) -> Result<()> {
        self.out.flush().context("Failed to flush event file")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{CdEvent, TriggerEvent};

    fn sample_batch() -> EventBatch {
        EventBatch {
            cd: (0..100).map(|i| CdEvent { x: i, y: i * 2, polarity: (i % 2) as u8, t: i as u64 * 37 }).collect(),
            triggers: vec![
                TriggerEvent { t: 1000, id: 0, polarity: 1 },
                TriggerEvent { t: 1500, id: 0, polarity: 0 },
            ],
        }
    }

    fn drain<S: EventSource>(source: &mut S) -> EventBatch {
        let mut all = EventBatch::default();
        while let Some(batch) = source.next_batch().unwrap() {
            all.cd.extend(batch.cd);
            all.triggers.extend(batch.triggers);
        }
        all
    }

    #[test]
    fn test_recorded_file_replays() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ev0.raw");
        let mut writer = Evt2Writer::create(&path, 640, 480).unwrap();
        writer.write_batch(&sample_batch()).unwrap();
        writer.finish().unwrap();

        let mut source = Evt2Source::open(&path, false).unwrap();
        let desc = source.description();
        assert_eq!((desc.width, desc.height), (640, 480));
        assert_eq!(drain(&mut source), sample_batch());
    }

    #[test]
    fn test_driver_enumerates_raw_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.raw", "a.raw", "notes.txt"] {
            fs::write(dir.path().join(name), b"% end\n").unwrap();
        }
        let driver = Evt2Driver::new(dir.path());
        let ids: Vec<String> = driver.enumerate().unwrap().into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);

        let device = driver.enumerate().unwrap().remove(0);
        let mut source = driver.open(&device, &EventOptions::default()).unwrap();
        assert!(source.next_batch().unwrap().is_none());
    }

    #[test]
    fn test_missing_dir_is_enumeration_error() {
        let driver = Evt2Driver::new("/nonexistent/rigcal-events");
        assert!(matches!(driver.enumerate(), Err(DeviceError::Enumeration { .. })));
    }
}
