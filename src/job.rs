//! On-disk layout of a recording job and its manifest.
//!
//! ```text
//! <data_dir>/job_<YYYY-mm-dd_HH-MM-SS>/
//!     job_data.json
//!     event_file_cam_<i>.raw
//!     images/raw/cam_<i>/frame_<n>.png
//!     images/verified/cam_<i>/frame_<n>.png
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::calibration::{CalibrationResult, StereoCalibrationResult};
use crate::camera::{Backend, CameraState};
use crate::config::Config;
use crate::error::CalibrationError;
use crate::frame::Frame;

pub const MANIFEST_FILE: &str = "job_data.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPaths {
    root: PathBuf,
}

impl JobPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn in_data_dir(data_dir: &Path, id: &str) -> Self {
        Self::new(data_dir.join(id))
    }

    /// Fresh job named after the current UTC time.
    pub fn timestamped(data_dir: &Path) -> Self {
        let id = format!("job_{}", Utc::now().format("%Y-%m-%d_%H-%M-%S"));
        Self::in_data_dir(data_dir, &id)
    }

    pub fn id(&self) -> String {
        self.root.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.root.join("images").join("raw")
    }

    pub fn verified_dir(&self) -> PathBuf {
        self.root.join("images").join("verified")
    }

    pub fn raw_camera_dir(&self, camera: usize) -> PathBuf {
        self.raw_dir().join(camera_key(camera))
    }

    pub fn verified_camera_dir(&self, camera: usize) -> PathBuf {
        self.verified_dir().join(camera_key(camera))
    }

    pub fn raw_frame(&self, camera: usize, frame_id: u64) -> PathBuf {
        self.raw_camera_dir(camera).join(frame_file_name(frame_id))
    }

    pub fn verified_frame(&self, camera: usize, frame_id: u64) -> PathBuf {
        self.verified_camera_dir(camera).join(frame_file_name(frame_id))
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    /// Create the job directory. An existing job with raw frames is only
    /// reused when `overwrite` is set, in which case its images are removed.
    pub fn prepare_recording(&self, overwrite: bool) -> Result<()> {
        let has_raw = !frame_ids_any_camera(&self.raw_dir())?.is_empty();
        if has_raw {
            if !overwrite {
                bail!("job {} already holds recorded frames; pass --overwrite to replace them", self.id());
            }
            let images = self.root.join("images");
            fs::remove_dir_all(&images).with_context(|| format!("Failed to clear {}", images.display()))?;
        }
        fs::create_dir_all(self.raw_dir())
            .with_context(|| format!("Failed to create {}", self.raw_dir().display()))?;
        Ok(())
    }

    pub fn save_raw_frame(&self, camera: usize, frame_id: u64, frame: &Frame) -> Result<()> {
        let dir = self.raw_camera_dir(camera);
        fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;
        frame.save_png(&self.raw_frame(camera, frame_id))
    }

    /// Check the directories calibration reads from.
    pub fn require_verified(&self) -> Result<(), CalibrationError> {
        if !self.root.is_dir() {
            return Err(CalibrationError::MissingJob(self.root.clone()));
        }
        if !self.verified_dir().is_dir() {
            return Err(CalibrationError::MissingVerifiedImages(self.verified_dir()));
        }
        if !self.manifest_path().is_file() {
            return Err(CalibrationError::MissingManifest(self.manifest_path()));
        }
        Ok(())
    }
}

pub fn camera_key(camera: usize) -> String {
    format!("cam_{}", camera)
}

pub fn pair_key(left: usize, right: usize) -> String {
    format!("cam_{}_cam_{}", left, right)
}

pub fn frame_file_name(frame_id: u64) -> String {
    format!("frame_{}.png", frame_id)
}

pub fn parse_frame_id(file_name: &str) -> Option<u64> {
    file_name.strip_prefix("frame_")?.strip_suffix(".png")?.parse().ok()
}

/// Sorted frame ids stored in one camera directory. A missing directory has none.
pub fn frame_ids(dir: &Path) -> Result<Vec<u64>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut ids: Vec<u64> = fs::read_dir(dir)
        .with_context(|| format!("Failed to list {}", dir.display()))?
        .filter_map(|e| e.ok())
        .filter_map(|e| parse_frame_id(&e.file_name().to_string_lossy()))
        .collect();
    ids.sort_unstable();
    Ok(ids)
}

/// Sorted indices of the `cam_<i>` directories under `dir`.
pub fn camera_dirs(dir: &Path) -> Result<Vec<usize>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut cams: Vec<usize> = fs::read_dir(dir)
        .with_context(|| format!("Failed to list {}", dir.display()))?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().to_string_lossy().strip_prefix("cam_")?.parse().ok())
        .collect();
    cams.sort_unstable();
    Ok(cams)
}

fn frame_ids_any_camera(dir: &Path) -> Result<BTreeSet<u64>> {
    let mut all = BTreeSet::new();
    for cam in camera_dirs(dir)? {
        all.extend(frame_ids(&dir.join(camera_key(cam)))?);
    }
    Ok(all)
}

/// Frame ids present for every camera under `dir`.
pub fn complete_frame_sets(dir: &Path) -> Result<Vec<u64>> {
    let cams = camera_dirs(dir)?;
    let mut common: Option<BTreeSet<u64>> = None;
    for cam in cams {
        let ids: BTreeSet<u64> = frame_ids(&dir.join(camera_key(cam)))?.into_iter().collect();
        common = Some(match common {
            None => ids,
            Some(acc) => acc.intersection(&ids).copied().collect(),
        });
    }
    Ok(common.map(|c| c.into_iter().collect()).unwrap_or_default())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Empty,
    PendingReview,
    Reviewed,
    Calibrated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSummary {
    pub id: String,
    pub cameras: usize,
    pub raw_sets: usize,
    pub verified_sets: usize,
    pub mono_calibrated: bool,
    pub stereo_calibrated: bool,
}

impl JobSummary {
    pub fn status(&self) -> JobStatus {
        if self.mono_calibrated {
            JobStatus::Calibrated
        } else if self.verified_sets > 0 {
            JobStatus::Reviewed
        } else if self.raw_sets > 0 {
            JobStatus::PendingReview
        } else {
            JobStatus::Empty
        }
    }
}

/// Summaries of every job directory under `data_dir`, sorted by id.
pub fn list_jobs(data_dir: &Path) -> Result<Vec<JobSummary>> {
    if !data_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut jobs = Vec::new();
    for entry in fs::read_dir(data_dir).with_context(|| format!("Failed to list {}", data_dir.display()))? {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }
        let job = JobPaths::new(path);
        let manifest = JobData::load(&job.manifest_path()).ok();
        jobs.push(JobSummary {
            id: job.id(),
            cameras: camera_dirs(&job.raw_dir())?.len(),
            raw_sets: complete_frame_sets(&job.raw_dir())?.len(),
            verified_sets: complete_frame_sets(&job.verified_dir())?.len(),
            mono_calibrated: manifest
                .as_ref()
                .is_some_and(|m| !m.cams.is_empty() && m.cams.values().all(|c| c.calibration.is_some())),
            stereo_calibrated: manifest.as_ref().is_some_and(|m| !m.stereo_calib.is_empty()),
        });
    }
    jobs.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(jobs)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PromoteReport {
    pub promoted: usize,
    pub excluded: usize,
    pub incomplete: usize,
}

/// Rebuild the verified tree from every complete raw frame set not listed in
/// `exclude`. Frames verified by an earlier review are dropped first.
pub fn promote(job: &JobPaths, exclude: &[u64]) -> Result<PromoteReport> {
    let raw = job.raw_dir();
    let cams = camera_dirs(&raw)?;
    if cams.is_empty() {
        bail!("job {} has no raw frames", job.id());
    }
    let verified = job.verified_dir();
    if verified.exists() {
        fs::remove_dir_all(&verified).with_context(|| format!("Failed to clear {}", verified.display()))?;
    }
    fs::create_dir_all(&verified).with_context(|| format!("Failed to create {}", verified.display()))?;
    let complete = complete_frame_sets(&raw)?;
    let every = frame_ids_any_camera(&raw)?;
    let mut report = PromoteReport { incomplete: every.len() - complete.len(), ..Default::default() };

    for id in complete {
        if exclude.contains(&id) {
            report.excluded += 1;
            continue;
        }
        for &cam in &cams {
            let dir = job.verified_camera_dir(cam);
            fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;
            let from = job.raw_frame(cam, id);
            fs::copy(&from, job.verified_frame(cam, id))
                .with_context(|| format!("Failed to copy {}", from.display()))?;
        }
        report.promoted += 1;
    }
    Ok(report)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// Identity of one camera as recorded in the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraRecord {
    pub cam_name: String,
    pub cam_id: usize,
    pub resolution: Resolution,
    pub is_master: bool,
    pub backend: Backend,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calibration: Option<CalibrationResult>,
}

/// Contents of `job_data.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobData {
    pub version: String,
    pub created: DateTime<Utc>,
    pub config: Config,
    pub cams: BTreeMap<String, CameraRecord>,
    #[serde(default)]
    pub stereo_calib: BTreeMap<String, StereoCalibrationResult>,
}

impl JobData {
    pub fn from_roster(config: &Config, roster: &[CameraState]) -> Self {
        let cams = roster
            .iter()
            .map(|cam| {
                let (name, width, height) = cam
                    .description()
                    .map(|d| (d.name.clone(), d.width, d.height))
                    .unwrap_or_default();
                let record = CameraRecord {
                    cam_name: name,
                    cam_id: cam.index(),
                    resolution: Resolution { width, height },
                    is_master: cam.identity().is_master,
                    backend: cam.identity().backend,
                    calibration: None,
                };
                (camera_key(cam.index()), record)
            })
            .collect();
        Self {
            version: format!("{} ({})", env!("CARGO_PKG_VERSION"), env!("GIT_VERSION")),
            created: Utc::now(),
            config: config.clone(),
            cams,
            stereo_calib: BTreeMap::new(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Invalid job manifest {}", path.display()))
    }

    /// Write atomically through a temporary file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, path).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn camera(&self, index: usize) -> Option<&CameraRecord> {
        self.cams.get(&camera_key(index))
    }

    pub fn camera_mut(&mut self, index: usize) -> Option<&mut CameraRecord> {
        self.cams.get_mut(&camera_key(index))
    }

    /// Camera indices in rig order.
    pub fn camera_indices(&self) -> Vec<usize> {
        let mut ids: Vec<usize> = self.cams.values().map(|c| c.cam_id).collect();
        ids.sort_unstable();
        ids
    }
}
