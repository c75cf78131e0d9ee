//! `BoardDetector` を実装するOpenCV ChArUco検出器

use anyhow::{bail, Context, Result};
use opencv::{
    core::{Mat, Point2f, Size, Vector, CV_8UC1, CV_8UC3, CV_8UC4},
    imgproc,
    objdetect::{
        self, CharucoBoard, CharucoDetector, CharucoDetectorTraitConst, CharucoParameters,
        CharucoParametersTrait, DetectorParameters, DetectorParametersTrait, Dictionary,
        PredefinedDictionaryType, RefineParameters,
    },
    prelude::*,
};

use super::{BoardDetector, Detection, Point2};
use crate::config::{BoardConfig, DetectionConfig};
use crate::frame::{Frame, PixelFormat};

// --- 辞書・ボード ---

pub fn parse_dictionary(name: &str) -> Result<Dictionary> {
    let dict_type = match name {
        "DICT_4X4_50" => PredefinedDictionaryType::DICT_4X4_50,
        "DICT_4X4_100" => PredefinedDictionaryType::DICT_4X4_100,
        "DICT_4X4_250" => PredefinedDictionaryType::DICT_4X4_250,
        "DICT_4X4_1000" => PredefinedDictionaryType::DICT_4X4_1000,
        "DICT_5X5_50" => PredefinedDictionaryType::DICT_5X5_50,
        "DICT_5X5_100" => PredefinedDictionaryType::DICT_5X5_100,
        "DICT_5X5_250" => PredefinedDictionaryType::DICT_5X5_250,
        "DICT_5X5_1000" => PredefinedDictionaryType::DICT_5X5_1000,
        "DICT_6X6_50" => PredefinedDictionaryType::DICT_6X6_50,
        "DICT_6X6_100" => PredefinedDictionaryType::DICT_6X6_100,
        "DICT_6X6_250" => PredefinedDictionaryType::DICT_6X6_250,
        "DICT_6X6_1000" => PredefinedDictionaryType::DICT_6X6_1000,
        "DICT_7X7_50" => PredefinedDictionaryType::DICT_7X7_50,
        "DICT_7X7_100" => PredefinedDictionaryType::DICT_7X7_100,
        "DICT_7X7_250" => PredefinedDictionaryType::DICT_7X7_250,
        "DICT_7X7_1000" => PredefinedDictionaryType::DICT_7X7_1000,
        "DICT_ARUCO_ORIGINAL" => PredefinedDictionaryType::DICT_ARUCO_ORIGINAL,
        _ => bail!("Unknown dictionary: {}", name),
    };
    objdetect::get_predefined_dictionary(dict_type).context("Failed to get predefined dictionary")
}

/// ChArUcoボードを作成
pub fn create_board(config: &BoardConfig) -> Result<CharucoBoard> {
    let dict = parse_dictionary(&config.dictionary)?;
    let size = Size::new(config.squares_x, config.squares_y);
    CharucoBoard::new_def(size, config.square_length, config.marker_length, &dict)
        .context("Failed to create CharucoBoard")
}

/// ChArUcoDetectorを作成（パラメータは設定ファイルから）
pub fn create_detector(board: &CharucoBoard, config: &DetectionConfig) -> Result<CharucoDetector> {
    let mut det_params = DetectorParameters::default()?;
    det_params.set_polygonal_approx_accuracy_rate(config.detector.polygonal_approx_accuracy_rate);
    det_params.set_perspective_remove_pixel_per_cell(config.detector.perspective_remove_pixel_per_cell);
    det_params.set_adaptive_thresh_win_size_max(config.detector.adaptive_thresh_win_size_max);

    let mut charuco_params = CharucoParameters::default()?;
    charuco_params.set_min_markers(config.charuco.min_markers);
    charuco_params.set_try_refine_markers(config.charuco.try_refine_markers);

    let refine_params = RefineParameters::new(10.0, 3.0, true)?;

    CharucoDetector::new(board, &charuco_params, &det_params, refine_params)
        .context("Failed to create CharucoDetector")
}

// --- Mat変換 ---

/// フレームをOpenCV Matにコピー
pub fn frame_to_mat(frame: &Frame) -> Result<Mat> {
    let flat = Mat::from_slice(frame.data())?;
    let shaped = flat.reshape(frame.format().channels() as i32, frame.height() as i32)?;
    shaped.try_clone().context("Failed to copy frame into Mat")
}

/// 8bit Mat（グレー/BGR/BGRA）をフレームにコピー
pub fn mat_to_frame(mat: &Mat) -> Result<Frame> {
    let (width, height) = (mat.cols() as u32, mat.rows() as u32);
    let typ = mat.typ();
    let (source, format) = if typ == CV_8UC1 {
        (mat.try_clone()?, PixelFormat::Gray8)
    } else if typ == CV_8UC3 {
        (mat.try_clone()?, PixelFormat::Bgr8)
    } else if typ == CV_8UC4 {
        let mut bgr = Mat::default();
        imgproc::cvt_color_def(mat, &mut bgr, imgproc::COLOR_BGRA2BGR)?;
        (bgr, PixelFormat::Bgr8)
    } else {
        bail!("Unsupported Mat type {}", typ);
    };
    Frame::new(width, height, format, source.data_bytes()?.to_vec())
}

// --- 検出器 ---

/// `cv::aruco::CharucoDetector` による `BoardDetector`
pub struct CharucoBoardDetector {
    detector: CharucoDetector,
}

impl CharucoBoardDetector {
    pub fn new(board: &BoardConfig, detection: &DetectionConfig) -> Result<Self> {
        let board = create_board(board)?;
        let detector = create_detector(&board, detection)?;
        Ok(Self { detector })
    }
}

impl BoardDetector for CharucoBoardDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Detection> {
        let image = frame_to_mat(frame)?;
        let mut corners = Vector::<Point2f>::new();
        let mut ids = Vector::<i32>::new();
        let mut marker_corners = Vector::<Vector<Point2f>>::new();
        let mut marker_ids = Vector::<i32>::new();

        self.detector
            .detect_board(&image, &mut corners, &mut ids, &mut marker_corners, &mut marker_ids)
            .context("detect_board failed")?;

        let corners = corners.iter().map(|p| Point2::new(p.x, p.y)).collect();
        let markers = marker_corners
            .iter()
            .filter(|quad| quad.len() == 4)
            .map(|quad| {
                let mut out = [Point2::new(0.0, 0.0); 4];
                for (slot, p) in out.iter_mut().zip(quad.iter()) {
                    *slot = Point2::new(p.x, p.y);
                }
                out
            })
            .collect();
        Ok(Detection::new(ids.to_vec(), corners)?.with_markers(marker_ids.to_vec(), markers))
    }
}
