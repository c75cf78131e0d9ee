//! Cross-camera validation of synchronized samples.
//!
//! Each round collects one `VerifyTask` per camera at the same logical index,
//! detects the board in every frame and keeps the sample only when every
//! camera, and the ids all cameras share, reach the corner threshold.

use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::camera::{Roster, VerifyTask};
use crate::cancel::StopToken;
use crate::detection::{intersect_all, BoardDetector, Detection, Point2};
use crate::job::JobPaths;

pub const SAMPLE_QUEUE_CAPACITY: usize = 100;
const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(100);

/// Running totals shown in the review UI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AcceptanceTotals {
    pub accepted_sets: u64,
    pub accepted_corners: u64,
}

/// Overlay data for one camera of an accepted sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidatedSample {
    pub frame_id: u64,
    pub camera: usize,
    /// Ids seen by every camera, sorted
    pub ids: Vec<i32>,
    /// This camera's corners for `ids`, co-indexed
    pub corners: Vec<Point2>,
    /// Present on the first camera's record only
    pub totals: Option<AcceptanceTotals>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    NotFound { camera: usize },
    BelowThreshold { camera: usize, detected: usize, threshold: usize },
    CommonBelowThreshold { common: usize, threshold: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundOutcome {
    Accepted { frame_id: u64, common: usize },
    Rejected { frame_id: u64, reason: Rejection },
    /// Cameras did not agree on an index before the round timeout
    Aborted { held: usize },
    Stopped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidatorStats {
    pub rounds: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub aborted: u64,
}

enum Alignment {
    Aligned(Vec<VerifyTask>),
    Aborted(usize),
    Stopped,
}

pub struct DetectionValidator {
    roster: Roster,
    detector: Box<dyn BoardDetector>,
    threshold: usize,
    round_timeout: Duration,
    job: JobPaths,
    samples: Sender<ValidatedSample>,
    stop: StopToken,
    totals: AcceptanceTotals,
    stats: ValidatorStats,
}

/// SPSC channel between the validator and the presentation layer.
pub fn sample_channel() -> (Sender<ValidatedSample>, Receiver<ValidatedSample>) {
    bounded(SAMPLE_QUEUE_CAPACITY)
}

impl DetectionValidator {
    pub fn new(
        roster: Roster,
        detector: Box<dyn BoardDetector>,
        threshold: usize,
        round_timeout: Duration,
        job: JobPaths,
        samples: Sender<ValidatedSample>,
        stop: StopToken,
    ) -> Self {
        Self {
            roster,
            detector,
            threshold,
            round_timeout,
            job,
            samples,
            stop,
            totals: AcceptanceTotals::default(),
            stats: ValidatorStats::default(),
        }
    }

    pub fn totals(&self) -> AcceptanceTotals {
        self.totals
    }

    /// Validate rounds until the session stops.
    pub fn run(mut self) -> ValidatorStats {
        info!(cameras = self.roster.len(), threshold = self.threshold, "validator started");
        loop {
            match self.run_round() {
                RoundOutcome::Stopped => break,
                RoundOutcome::Accepted { frame_id, common } => {
                    info!(
                        frame_id,
                        common,
                        accepted = self.totals.accepted_sets,
                        "sample accepted"
                    );
                }
                RoundOutcome::Rejected { frame_id, reason } => debug!(frame_id, ?reason, "sample rejected"),
                RoundOutcome::Aborted { held } => {
                    warn!(held, timeout = ?self.round_timeout, "cameras did not align, round dropped")
                }
            }
        }
        info!(stats = ?self.stats, "validator stopped");
        self.stats
    }

    pub fn run_round(&mut self) -> RoundOutcome {
        let tasks = match self.align() {
            Alignment::Aligned(tasks) => tasks,
            Alignment::Aborted(held) => {
                self.stats.rounds += 1;
                self.stats.aborted += 1;
                return RoundOutcome::Aborted { held };
            }
            Alignment::Stopped => return RoundOutcome::Stopped,
        };
        self.stats.rounds += 1;
        let outcome = self.evaluate(&tasks);
        match outcome {
            RoundOutcome::Accepted { .. } => self.stats.accepted += 1,
            RoundOutcome::Rejected { .. } => self.stats.rejected += 1,
            _ => {}
        }
        outcome
    }

    /// Collect one task per camera, all with the same id.
    fn align(&self) -> Alignment {
        let deadline = Instant::now() + self.round_timeout;
        let mut held: Vec<Option<VerifyTask>> = vec![None; self.roster.len()];
        loop {
            for i in 0..held.len() {
                while held[i].is_none() {
                    if self.stop.stop_requested() {
                        return Alignment::Stopped;
                    }
                    if Instant::now() >= deadline {
                        return Alignment::Aborted(held.iter().flatten().count());
                    }
                    match self.roster[i].verify_receiver().recv_timeout(DEQUEUE_TIMEOUT) {
                        Ok(task) => held[i] = Some(task),
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => return Alignment::Stopped,
                    }
                }
            }

            let Some(max) = held.iter().flatten().map(|t| t.id).max() else {
                return Alignment::Stopped;
            };
            let mut aligned = true;
            for (camera, slot) in held.iter_mut().enumerate() {
                if slot.as_ref().is_some_and(|t| t.id < max) {
                    debug!(camera, max, "dropping lagging task");
                    *slot = None;
                    aligned = false;
                }
            }
            if aligned {
                return Alignment::Aligned(held.into_iter().flatten().collect());
            }
        }
    }

    fn evaluate(&mut self, tasks: &[VerifyTask]) -> RoundOutcome {
        let frame_id = tasks[0].id;
        let mut detections = Vec::with_capacity(tasks.len());
        for (camera, task) in tasks.iter().enumerate() {
            let detection = match self.detector.detect(&task.frame) {
                Ok(d) => d,
                Err(e) => {
                    warn!(camera, frame_id, "detection failed: {:#}", e);
                    Detection::empty()
                }
            };
            if !detection.found() {
                return RoundOutcome::Rejected { frame_id, reason: Rejection::NotFound { camera } };
            }
            if detection.len() < self.threshold {
                let reason = Rejection::BelowThreshold { camera, detected: detection.len(), threshold: self.threshold };
                return RoundOutcome::Rejected { frame_id, reason };
            }
            detections.push(detection);
        }

        let common = intersect_all(detections.iter().map(|d| d.ids()));
        if common.is_empty() || common.len() < self.threshold {
            let reason = Rejection::CommonBelowThreshold { common: common.len(), threshold: self.threshold };
            return RoundOutcome::Rejected { frame_id, reason };
        }

        for (camera, task) in tasks.iter().enumerate() {
            if let Err(e) = self.job.save_raw_frame(camera, frame_id, &task.frame) {
                warn!(camera, frame_id, "raw frame not saved: {:#}", e);
            }
        }

        self.totals.accepted_sets += 1;
        self.totals.accepted_corners += common.len() as u64;
        for (camera, detection) in detections.iter().enumerate() {
            let restricted = detection.restrict_to(&common);
            let sample = ValidatedSample {
                frame_id,
                camera,
                ids: common.clone(),
                corners: restricted.corners().to_vec(),
                totals: (camera == 0).then_some(self.totals),
            };
            match self.samples.try_send(sample) {
                Ok(()) | Err(TrySendError::Disconnected(_)) => {}
                Err(TrySendError::Full(_)) => debug!(camera, frame_id, "sample queue full"),
            }
        }
        RoundOutcome::Accepted { frame_id, common: common.len() }
    }
}
