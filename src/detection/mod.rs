//! Board detection results and cross-camera id matching.

#[cfg(feature = "opencv")]
pub mod charuco;

use std::collections::{BTreeSet, HashMap};

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::frame::Frame;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point2 {
    pub x: f32,
    pub y: f32,
}

impl Point2 {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Output of one board detection. `ids[i]` is the interior corner seen at `corners[i]`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Detection {
    ids: Vec<i32>,
    corners: Vec<Point2>,
    pub marker_ids: Vec<i32>,
    pub marker_corners: Vec<[Point2; 4]>,
}

impl Detection {
    pub fn new(ids: Vec<i32>, corners: Vec<Point2>) -> Result<Self> {
        if ids.len() != corners.len() {
            bail!("{} corner ids but {} corner positions", ids.len(), corners.len());
        }
        Ok(Self { ids, corners, marker_ids: Vec::new(), marker_corners: Vec::new() })
    }

    pub fn with_markers(mut self, marker_ids: Vec<i32>, marker_corners: Vec<[Point2; 4]>) -> Self {
        self.marker_ids = marker_ids;
        self.marker_corners = marker_corners;
        self
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn ids(&self) -> &[i32] {
        &self.ids
    }

    pub fn corners(&self) -> &[Point2] {
        &self.corners
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn found(&self) -> bool {
        !self.ids.is_empty()
    }

    pub fn meets(&self, threshold: usize) -> bool {
        self.found() && self.ids.len() >= threshold
    }

    pub fn corner_of(&self, id: i32) -> Option<Point2> {
        self.ids.iter().position(|&i| i == id).map(|k| self.corners[k])
    }

    /// Keep only the given ids, in the order they are listed. Ids not detected are skipped.
    pub fn restrict_to(&self, ids: &[i32]) -> Detection {
        let lookup: HashMap<i32, Point2> =
            self.ids.iter().copied().zip(self.corners.iter().copied()).collect();
        let (ids, corners) = ids
            .iter()
            .filter_map(|id| lookup.get(id).map(|c| (*id, *c)))
            .unzip();
        Detection { ids, corners, marker_ids: Vec::new(), marker_corners: Vec::new() }
    }
}

/// Finds the calibration target in an image.
pub trait BoardDetector: Send {
    fn detect(&mut self, frame: &Frame) -> Result<Detection>;
}

/// Sorted ids present in both lists.
pub fn intersect_ids(a: &[i32], b: &[i32]) -> Vec<i32> {
    let a: BTreeSet<i32> = a.iter().copied().collect();
    let b: BTreeSet<i32> = b.iter().copied().collect();
    a.intersection(&b).copied().collect()
}

/// Sorted ids present in every list. Empty input yields an empty set.
pub fn intersect_all<'a, I>(lists: I) -> Vec<i32>
where
    I: IntoIterator<Item = &'a [i32]>,
{
    let mut iter = lists.into_iter();
    let Some(first) = iter.next() else {
        return Vec::new();
    };
    let mut acc: BTreeSet<i32> = first.iter().copied().collect();
    for list in iter {
        let next: BTreeSet<i32> = list.iter().copied().collect();
        acc = acc.intersection(&next).copied().collect();
    }
    acc.into_iter().collect()
}
