//! OpenCV calib3d による `CalibrationSolver`

use anyhow::{bail, Context, Result};
use opencv::{
    calib3d,
    core::{Mat, Point2f, Point3f, Size, TermCriteria, TermCriteria_Type, Vector},
    prelude::*,
};

use super::{CalibrationResult, CalibrationSolver, StereoCorrespondences, StereoExtrinsics, ViewCorrespondences};
use crate::detection::Point2;

#[derive(Debug, Clone, Copy)]
pub struct OpenCvSolver {
    pub max_iterations: i32,
    pub epsilon: f64,
}

impl Default for OpenCvSolver {
    fn default() -> Self {
        Self { max_iterations: 100, epsilon: 1e-6 }
    }
}

impl OpenCvSolver {
    fn criteria(&self) -> Result<TermCriteria> {
        Ok(TermCriteria::new(
            TermCriteria_Type::COUNT as i32 + TermCriteria_Type::EPS as i32,
            self.max_iterations,
            self.epsilon,
        )?)
    }
}

fn pixels(points: &[Point2]) -> Vector<Point2f> {
    points.iter().map(|p| Point2f::new(p.x, p.y)).collect()
}

fn object_points<'a>(views: impl Iterator<Item = &'a [nalgebra::Point3<f32>]>) -> Vector<Vector<Point3f>> {
    views
        .map(|pts| pts.iter().map(|p| Point3f::new(p.x, p.y, p.z)).collect())
        .collect()
}

fn size(image_size: (u32, u32)) -> Result<Size> {
    if image_size.0 == 0 || image_size.1 == 0 {
        bail!("image size unknown");
    }
    Ok(Size::new(image_size.0 as i32, image_size.1 as i32))
}

impl CalibrationSolver for OpenCvSolver {
    fn calibrate_camera(&self, views: &[ViewCorrespondences], image_size: (u32, u32)) -> Result<CalibrationResult> {
        if views.is_empty() {
            bail!("No calibration views provided");
        }
        let all_obj_points = object_points(views.iter().map(|v| v.object.as_slice()));
        let all_img_points: Vector<Vector<Point2f>> = views.iter().map(|v| pixels(&v.image)).collect();

        let mut camera_matrix = Mat::default();
        let mut dist_coeffs = Mat::default();
        let mut rvecs = Vector::<Mat>::new();
        let mut tvecs = Vector::<Mat>::new();

        let error = calib3d::calibrate_camera(
            &all_obj_points,
            &all_img_points,
            size(image_size)?,
            &mut camera_matrix,
            &mut dist_coeffs,
            &mut rvecs,
            &mut tvecs,
            0,
            self.criteria()?,
        )
        .context("calibrate_camera failed")?;

        Ok(CalibrationResult {
            image_size,
            reprojection_error: error,
            camera_matrix: mat3x3_to_rows(&camera_matrix)?,
            dist_coeffs: mat_to_vec(&dist_coeffs)?,
            rvecs: rvecs.iter().map(|m| mat_to_vec3(&m)).collect::<Result<_>>()?,
            tvecs: tvecs.iter().map(|m| mat_to_vec3(&m)).collect::<Result<_>>()?,
        })
    }

    fn stereo_calibrate(
        &self,
        views: &[StereoCorrespondences],
        left: &CalibrationResult,
        right: &CalibrationResult,
        image_size: (u32, u32),
    ) -> Result<StereoExtrinsics> {
        if views.is_empty() {
            bail!("No stereo views provided");
        }
        let obj_points = object_points(views.iter().map(|v| v.object.as_slice()));
        let left_points: Vector<Vector<Point2f>> = views.iter().map(|v| pixels(&v.left)).collect();
        let right_points: Vector<Vector<Point2f>> = views.iter().map(|v| pixels(&v.right)).collect();

        let mut k1 = Mat::from_slice_2d(&left.camera_matrix)?;
        let mut d1 = Mat::from_slice(&left.dist_coeffs)?.try_clone()?;
        let mut k2 = Mat::from_slice_2d(&right.camera_matrix)?;
        let mut d2 = Mat::from_slice(&right.dist_coeffs)?.try_clone()?;
        let mut r = Mat::default();
        let mut t = Mat::default();
        let mut e = Mat::default();
        let mut f = Mat::default();

        let error = calib3d::stereo_calibrate(
            &obj_points,
            &left_points,
            &right_points,
            &mut k1,
            &mut d1,
            &mut k2,
            &mut d2,
            size(image_size)?,
            &mut r,
            &mut t,
            &mut e,
            &mut f,
            calib3d::CALIB_FIX_INTRINSIC,
            self.criteria()?,
        )
        .context("stereo_calibrate failed")?;

        Ok(StereoExtrinsics {
            reprojection_error: error,
            rotation_matrix: mat3x3_to_rows(&r)?,
            translation: mat_to_vec3(&t)?,
            essential_matrix: mat3x3_to_rows(&e)?,
            fundamental_matrix: mat3x3_to_rows(&f)?,
        })
    }
}

// --- Mat変換 ---

/// 3x3 f64 Mat to row-major nested array
pub fn mat3x3_to_rows(mat: &Mat) -> Result<[[f64; 3]; 3]> {
    if mat.rows() != 3 || mat.cols() != 3 {
        bail!("Expected 3x3 matrix, got {}x{}", mat.rows(), mat.cols());
    }
    let mut arr = [[0.0f64; 3]; 3];
    for (r, row) in arr.iter_mut().enumerate() {
        for (c, v) in row.iter_mut().enumerate() {
            *v = *mat.at_2d::<f64>(r as i32, c as i32)?;
        }
    }
    Ok(arr)
}

/// Vec<f64> from an Nx1 or 1xN f64 Mat
pub fn mat_to_vec(mat: &Mat) -> Result<Vec<f64>> {
    let n = mat.rows().max(mat.cols()) as usize;
    let is_row = mat.rows() == 1;
    (0..n)
        .map(|i| -> Result<f64> {
            let v = if is_row { mat.at_2d::<f64>(0, i as i32)? } else { mat.at_2d::<f64>(i as i32, 0)? };
            Ok(*v)
        })
        .collect()
}

fn mat_to_vec3(mat: &Mat) -> Result<[f64; 3]> {
    let v = mat_to_vec(mat)?;
    if v.len() != 3 {
        bail!("Expected 3-vector, got {} values", v.len());
    }
    Ok([v[0], v[1], v[2]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::BoardGeometry;
    use crate::sim::project_board;
    use nalgebra::{Matrix3, Point3, Rotation3, Vector3};

    const POSES: [(f64, f64); 8] = [
        (0.3, 0.0),
        (-0.3, 0.0),
        (0.0, 0.3),
        (0.0, -0.3),
        (0.2, 0.2),
        (-0.2, 0.25),
        (0.25, -0.2),
        (0.1, -0.3),
    ];

    fn intrinsics() -> Matrix3<f64> {
        Matrix3::new(800.0, 0.0, 320.0, 0.0, 810.0, 240.0, 0.0, 0.0, 1.0)
    }

    /// カメラ座標系でのボード姿勢（中心は約0.6m前方）
    fn board_poses(board: &BoardGeometry) -> Vec<(Rotation3<f64>, Vector3<f64>)> {
        poses_at(board, &POSES)
    }

    fn poses_at(board: &BoardGeometry, tilts: &[(f64, f64)]) -> Vec<(Rotation3<f64>, Vector3<f64>)> {
        let s = board.square_length as f64;
        let centre = Vector3::new(board.squares_x as f64 * s / 2.0, board.squares_y as f64 * s / 2.0, 0.0);
        tilts
            .iter()
            .map(|&(rx, ry)| {
                let rot = Rotation3::from_euler_angles(rx, ry, 0.05);
                let t = Vector3::new(0.01, -0.02, 0.6) - rot * centre;
                (rot, t)
            })
            .collect()
    }

    fn views(board: &BoardGeometry, k: &Matrix3<f64>, poses: &[(Rotation3<f64>, Vector3<f64>)]) -> Vec<ViewCorrespondences> {
        poses
            .iter()
            .enumerate()
            .map(|(i, (rot, t))| {
                let det = project_board(board, k, rot, t);
                let (object, image) = board.match_image_points(det.ids(), det.corners());
                ViewCorrespondences { frame_id: i as u64, object, image }
            })
            .collect()
    }

    #[test]
    fn test_recovers_synthetic_intrinsics() {
        let board = BoardGeometry::new(9, 7, 0.03);
        let k = intrinsics();
        let views = views(&board, &k, &board_poses(&board));
        let result = OpenCvSolver::default().calibrate_camera(&views, (640, 480)).unwrap();

        assert!(result.reprojection_error < 0.05, "error {}", result.reprojection_error);
        let m = result.camera_matrix;
        assert!((m[0][0] - 800.0).abs() < 2.0, "fx {}", m[0][0]);
        assert!((m[1][1] - 810.0).abs() < 2.0, "fy {}", m[1][1]);
        assert!((m[0][2] - 320.0).abs() < 2.0, "cx {}", m[0][2]);
        assert!((m[1][2] - 240.0).abs() < 2.0, "cy {}", m[1][2]);
        assert_eq!(result.rvecs.len(), views.len());
        assert_eq!(result.tvecs.len(), views.len());
        assert!((result.tvecs[0][2] - 0.6).abs() < 0.1);
    }

    /// シードごとに再現できる一様画素ノイズ `[-amplitude/2, amplitude/2)`
    fn noisy(mut views: Vec<ViewCorrespondences>, seed: u64, amplitude: f32) -> Vec<ViewCorrespondences> {
        let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
        let mut next = || {
            state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1_442_695_040_888_963_407);
            ((state >> 40) as f32 / (1u64 << 24) as f32 - 0.5) * amplitude
        };
        for view in &mut views {
            for p in &mut view.image {
                p.x += next();
                p.y += next();
            }
        }
        views
    }

    /// 推定モデル（5係数歪み）での `p` の投影画素
    fn project_with(result: &CalibrationResult, rot: &Rotation3<f64>, t: &Vector3<f64>, p: &Point3<f32>) -> (f64, f64) {
        let cam = rot * Vector3::new(p.x as f64, p.y as f64, p.z as f64) + t;
        let (x, y) = (cam.x / cam.z, cam.y / cam.z);
        let d = |i: usize| result.dist_coeffs.get(i).copied().unwrap_or(0.0);
        let (k1, k2, p1, p2, k3) = (d(0), d(1), d(2), d(3), d(4));
        let r2 = x * x + y * y;
        let radial = 1.0 + k1 * r2 + k2 * r2 * r2 + k3 * r2 * r2 * r2;
        let xd = x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
        let yd = y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;
        let m = result.camera_matrix;
        (m[0][0] * xd + m[0][1] * yd + m[0][2], m[1][1] * yd + m[1][2])
    }

    /// ソルバーに渡していないボード姿勢での、推定モデルと真の投影との
    /// 全コーナーRMS画素距離
    fn held_out_error(
        result: &CalibrationResult,
        board: &BoardGeometry,
        k: &Matrix3<f64>,
        poses: &[(Rotation3<f64>, Vector3<f64>)],
    ) -> f64 {
        let mut sum = 0.0;
        let mut n = 0;
        for (rot, t) in poses {
            let truth = project_board(board, k, rot, t);
            for (&id, px) in truth.ids().iter().zip(truth.corners()) {
                let Some(p) = board.object_point(id) else { continue };
                let (u, v) = project_with(result, rot, t, &p);
                sum += (u - px.x as f64).powi(2) + (v - px.y as f64).powi(2);
                n += 1;
            }
        }
        (sum / n as f64).sqrt()
    }

    #[test]
    fn test_model_error_non_increasing_with_more_views() {
        const SEEDS: u64 = 6;
        let board = BoardGeometry::new(9, 7, 0.03);
        let k = intrinsics();
        let poses = board_poses(&board);
        let held_out = poses_at(&board, &[(0.15, 0.1), (-0.1, -0.15), (0.0, 0.0)]);
        let solver = OpenCvSolver::default();

        let mut errors = Vec::new();
        for count in [4, 6, 8] {
            let mut total = 0.0;
            for seed in 0..SEEDS {
                let views = noisy(views(&board, &k, &poses[..count]), seed, 0.6);
                let result = solver.calibrate_camera(&views, (640, 480)).unwrap();
                assert!(result.reprojection_error < 0.3, "fit error {} with {} views", result.reprojection_error, count);
                total += held_out_error(&result, &board, &k, &held_out);
            }
            errors.push(total / SEEDS as f64);
        }
        for pair in errors.windows(2) {
            assert!(pair[1] <= pair[0] * 1.05, "model error grew with more views: {:?}", errors);
        }
        assert!(errors[2] < 1.0, "model error {:?}", errors);
    }

    #[test]
    fn test_recovers_relative_pose() {
        let board = BoardGeometry::new(9, 7, 0.03);
        let k = intrinsics();
        let solver = OpenCvSolver::default();
        let left_poses = board_poses(&board);
        let rel_rot = Rotation3::from_euler_angles(0.0, 0.08, 0.0);
        let rel_t = Vector3::new(-0.1, 0.0, 0.0);
        let right_poses: Vec<_> = left_poses.iter().map(|(r, t)| (rel_rot * r, rel_rot * t + rel_t)).collect();

        let left_views = views(&board, &k, &left_poses);
        let right_views = views(&board, &k, &right_poses);
        let left = solver.calibrate_camera(&left_views, (640, 480)).unwrap();
        let right = solver.calibrate_camera(&right_views, (640, 480)).unwrap();

        let stereo: Vec<StereoCorrespondences> = left_views
            .iter()
            .zip(&right_views)
            .map(|(l, r)| {
                assert_eq!(l.object, r.object);
                StereoCorrespondences { frame_id: l.frame_id, object: l.object.clone(), left: l.image.clone(), right: r.image.clone() }
            })
            .collect();
        let result = solver.stereo_calibrate(&stereo, &left, &right, (640, 480)).unwrap();

        assert!((result.translation[0] + 0.1).abs() < 0.01, "t {:?}", result.translation);
        assert!(result.translation[1].abs() < 0.01);
        let r = result.rotation_matrix;
        assert!((r[0][2] - rel_rot[(0, 2)]).abs() < 0.01, "R {:?}", r);
        assert!(result.reprojection_error < 0.1);
    }

    #[test]
    fn test_empty_views_rejected() {
        assert!(OpenCvSolver::default().calibrate_camera(&[], (640, 480)).is_err());
    }
}
