//! 検証済み画像からの単眼・ペアステレオキャリブレーション

#[cfg(feature = "opencv")]
pub mod solver;

use std::collections::BTreeMap;

use anyhow::Result;
use nalgebra::Point3;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::board::BoardGeometry;
use crate::detection::{intersect_ids, BoardDetector, Detection, Point2};
use crate::error::CalibrationError;
use crate::frame::Frame;
use crate::job::{camera_key, frame_ids, pair_key, JobData, JobPaths};

/// 1ビューで姿勢を拘束するのに必要な最小コーナー数
pub const MIN_VIEW_POINTS: usize = 6;
/// 推定に必要な最小ビュー数
pub const MIN_VIEWS: usize = 3;

// --- データ構造 ---

/// 単一カメラの内部パラメータとビューごとの外部パラメータ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationResult {
    pub image_size: (u32, u32),
    pub reprojection_error: f64,
    /// 内部パラメータ行列 K (row-major 3x3)
    pub camera_matrix: [[f64; 3]; 3],
    pub dist_coeffs: Vec<f64>,
    /// ビューごとの回転ベクトル (Rodrigues)
    pub rvecs: Vec<[f64; 3]>,
    pub tvecs: Vec<[f64; 3]>,
}

/// 左カメラに対する右カメラの姿勢
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StereoExtrinsics {
    pub reprojection_error: f64,
    pub rotation_matrix: [[f64; 3]; 3],
    pub translation: [f64; 3],
    pub essential_matrix: [[f64; 3]; 3],
    pub fundamental_matrix: [[f64; 3]; 3],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StereoCalibrationResult {
    pub cam_left_id: usize,
    pub cam_right_id: usize,
    #[serde(flatten)]
    pub extrinsics: StereoExtrinsics,
}

/// 1画像分のボード平面座標と画素座標
#[derive(Debug, Clone, PartialEq)]
pub struct ViewCorrespondences {
    pub frame_id: u64,
    pub object: Vec<Point3<f32>>,
    pub image: Vec<Point2>,
}

/// 同一フレームセットでペアの両カメラに写ったボード平面座標
#[derive(Debug, Clone, PartialEq)]
pub struct StereoCorrespondences {
    pub frame_id: u64,
    pub object: Vec<Point3<f32>>,
    pub left: Vec<Point2>,
    pub right: Vec<Point2>,
}

// --- ソルバー ---

/// 非線形カメラモデル推定
pub trait CalibrationSolver {
    fn calibrate_camera(&self, views: &[ViewCorrespondences], image_size: (u32, u32)) -> Result<CalibrationResult>;

    /// 両カメラの内部パラメータを固定した相対姿勢推定
    fn stereo_calibrate(
        &self,
        views: &[StereoCorrespondences],
        left: &CalibrationResult,
        right: &CalibrationResult,
        image_size: (u32, u32),
    ) -> Result<StereoExtrinsics>;
}

// --- 画像読み込み ---

/// 検証済み画像を読み込み、キャリブレーション間で検出結果をキャッシュする
struct ViewReader<'a, 'd> {
    job: &'a JobPaths,
    detector: &'d mut dyn BoardDetector,
    min_corners: usize,
    cache: BTreeMap<(usize, u64), Detection>,
    sizes: BTreeMap<usize, (u32, u32)>,
}

impl<'a, 'd> ViewReader<'a, 'd> {
    fn new(job: &'a JobPaths, detector: &'d mut dyn BoardDetector, threshold: usize) -> Self {
        Self {
            job,
            detector,
            min_corners: threshold.max(MIN_VIEW_POINTS),
            cache: BTreeMap::new(),
            sizes: BTreeMap::new(),
        }
    }

    fn frame_ids(&self, camera: usize) -> Result<Vec<u64>> {
        frame_ids(&self.job.verified_camera_dir(camera))
    }

    /// 検証済み画像1枚の検出結果。ボードが使えない場合は空。
    fn detect(&mut self, camera: usize, frame_id: u64) -> Result<&Detection> {
        if !self.cache.contains_key(&(camera, frame_id)) {
            let frame = Frame::load(&self.job.verified_frame(camera, frame_id))?;
            self.sizes.entry(camera).or_insert((frame.width(), frame.height()));
            let gray = frame.to_gray();
            let detection = self.detector.detect(&gray)?;
            let usable = if detection.meets(self.min_corners) { detection } else { Detection::empty() };
            debug!(camera, frame_id, corners = usable.len(), "verified image read");
            self.cache.insert((camera, frame_id), usable);
        }
        Ok(&self.cache[&(camera, frame_id)])
    }

    fn image_size(&self, camera: usize, manifest: &JobData) -> (u32, u32) {
        manifest
            .camera(camera)
            .map(|c| (c.resolution.width, c.resolution.height))
            .filter(|&(w, h)| w > 0 && h > 0)
            .or_else(|| self.sizes.get(&camera).copied())
            .unwrap_or((0, 0))
    }
}

// --- 内部パラメータキャリブレーション ---

/// 検証済み画像からジョブの全カメラをキャリブレーションする。
/// マニフェストは全カメラの推定が終わってから更新する。
pub fn mono_calibrate(
    job: &JobPaths,
    manifest: &mut JobData,
    detector: &mut dyn BoardDetector,
    solver: &dyn CalibrationSolver,
    board: &BoardGeometry,
    threshold: usize,
) -> Result<BTreeMap<usize, CalibrationResult>> {
    job.require_verified()?;
    let cameras = manifest.camera_indices();
    let mut reader = ViewReader::new(job, detector, threshold);

    let mut inputs = Vec::with_capacity(cameras.len());
    for &camera in &cameras {
        let ids = reader.frame_ids(camera)?;
        if ids.is_empty() {
            return Err(CalibrationError::NoImages(job.verified_camera_dir(camera).display().to_string()).into());
        }
        let mut views = Vec::new();
        for id in ids {
            let detection = reader.detect(camera, id)?;
            if !detection.found() {
                continue;
            }
            let (object, image) = board.match_image_points(detection.ids(), detection.corners());
            views.push(ViewCorrespondences { frame_id: id, object, image });
        }
        if views.len() < MIN_VIEWS {
            return Err(CalibrationError::InsufficientViews {
                camera: camera_key(camera),
                usable: views.len(),
                required: MIN_VIEWS,
            }
            .into());
        }
        inputs.push((camera, views));
    }

    let mut results = BTreeMap::new();
    for (camera, views) in inputs {
        let size = reader.image_size(camera, manifest);
        let result = solver.calibrate_camera(&views, size).map_err(|e| CalibrationError::Solver {
            camera: camera_key(camera),
            reason: format!("{:#}", e),
        })?;
        info!(
            camera,
            views = views.len(),
            error = result.reprojection_error,
            "mono calibration done"
        );
        results.insert(camera, result);
    }

    for (camera, result) in &results {
        if let Some(record) = manifest.camera_mut(*camera) {
            record.calibration = Some(result.clone());
        }
    }
    Ok(results)
}

// --- ステレオキャリブレーション ---

/// 全カメラペア (left < right) を単眼の内部パラメータ固定でキャリブレーション
pub fn stereo_calibrate(
    job: &JobPaths,
    manifest: &mut JobData,
    detector: &mut dyn BoardDetector,
    solver: &dyn CalibrationSolver,
    board: &BoardGeometry,
    threshold: usize,
) -> Result<Vec<StereoCalibrationResult>> {
    job.require_verified()?;
    let cameras = manifest.camera_indices();
    let mut intrinsics = BTreeMap::new();
    for &camera in &cameras {
        let record = manifest.camera(camera).ok_or_else(|| CalibrationError::MissingCamera(camera_key(camera)))?;
        let calibration =
            record.calibration.clone().ok_or_else(|| CalibrationError::MissingIntrinsics(camera_key(camera)))?;
        intrinsics.insert(camera, calibration);
    }

    let mut reader = ViewReader::new(job, detector, threshold);
    let min_common = threshold.max(MIN_VIEW_POINTS);
    let mut results = Vec::new();
    for (i, &left) in cameras.iter().enumerate() {
        for &right in &cameras[i + 1..] {
            let left_ids = reader.frame_ids(left)?;
            let right_ids = reader.frame_ids(right)?;
            let common_frames: Vec<u64> = left_ids.iter().filter(|id| right_ids.contains(id)).copied().collect();

            let mut views = Vec::new();
            for frame_id in common_frames {
                let l = reader.detect(left, frame_id)?.clone();
                let r = reader.detect(right, frame_id)?;
                if !l.found() || !r.found() {
                    continue;
                }
                let common = intersect_ids(l.ids(), r.ids());
                if common.len() < min_common {
                    continue;
                }
                let l = l.restrict_to(&common);
                let r = r.restrict_to(&common);
                let (object, left_px) = board.match_image_points(l.ids(), l.corners());
                let (_, right_px) = board.match_image_points(r.ids(), r.corners());
                views.push(StereoCorrespondences { frame_id, object, left: left_px, right: right_px });
            }

            if views.is_empty() {
                return Err(CalibrationError::NoCommonViews { left: camera_key(left), right: camera_key(right) }.into());
            }
            if views.len() < MIN_VIEWS {
                return Err(CalibrationError::InsufficientViews {
                    camera: pair_key(left, right),
                    usable: views.len(),
                    required: MIN_VIEWS,
                }
                .into());
            }

            let size = reader.image_size(left, manifest);
            let extrinsics = solver
                .stereo_calibrate(&views, &intrinsics[&left], &intrinsics[&right], size)
                .map_err(|e| CalibrationError::Solver { camera: pair_key(left, right), reason: format!("{:#}", e) })?;
            info!(
                left,
                right,
                views = views.len(),
                error = extrinsics.reprojection_error,
                "stereo calibration done"
            );
            results.push(StereoCalibrationResult { cam_left_id: left, cam_right_id: right, extrinsics });
        }
    }

    for result in &results {
        manifest.stereo_calib.insert(pair_key(result.cam_left_id, result.cam_right_id), result.clone());
    }
    Ok(results)
}
