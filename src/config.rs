use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::camera::Backend;
use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub board: BoardConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    pub recording: RecordingConfig,
    #[serde(default)]
    pub viewing: ViewingConfig,
}

/// ChArUcoボード形状
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardConfig {
    /// ArUco辞書タイプ (e.g. "DICT_6X6_50")
    #[serde(default = "default_dictionary")]
    pub dictionary: String,
    #[serde(default = "default_squares_x")]
    pub squares_x: i32,
    #[serde(default = "default_squares_y")]
    pub squares_y: i32,
    /// マス辺長（メートル）
    pub square_length: f32,
    /// マーカー辺長（メートル）
    pub marker_length: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// 同期サンプル間隔（秒）
    #[serde(default = "default_detection_interval")]
    pub detection_interval: f64,
    /// 全カメラが検出すべき内部コーナーの割合
    #[serde(default = "default_minimum_corner_fraction")]
    pub minimum_corner_fraction: f64,
    /// 検証ラウンドの整列を打ち切るまでの秒数
    #[serde(default = "default_alignment_timeout")]
    pub alignment_timeout_secs: f64,
    #[serde(default)]
    pub charuco: CharucoConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharucoConfig {
    #[serde(default = "default_min_markers")]
    pub min_markers: i32,
    #[serde(default)]
    pub try_refine_markers: bool,
}

/// ArUcoマーカー検出パラメータ（広角・斜め検出対応）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    #[serde(default = "default_polygonal_approx_accuracy_rate")]
    pub polygonal_approx_accuracy_rate: f64,
    #[serde(default = "default_perspective_remove_pixel_per_cell")]
    pub perspective_remove_pixel_per_cell: i32,
    #[serde(default = "default_adaptive_thresh_win_size_max")]
    pub adaptive_thresh_win_size_max: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    #[serde(default = "default_fps")]
    pub fps: u32,
    /// 同期スケジュールを駆動するカメラの配置インデックス
    pub master_worker: usize,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// EVT 2.0 記録ファイルを探すディレクトリ
    #[serde(default = "default_event_source_dir")]
    pub event_source_dir: PathBuf,
    pub workers: Vec<WorkerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WorkerConfig {
    Frame(FrameWorkerConfig),
    Event(EventWorkerConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameWorkerConfig {
    /// リグ内の左からの位置
    pub placement: usize,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventWorkerConfig {
    pub placement: usize,
    #[serde(default)]
    pub device_id: Option<String>,
    /// フレーム描画の時間窓（マイクロ秒）
    #[serde(default = "default_accumulation_time")]
    pub accumulation_time: u64,
    /// 立下りエッジを示すトリガー極性
    pub falling_edge_polarity: u8,
    /// この極性のCDイベントのみ残す
    #[serde(default = "default_polarity_filter")]
    pub polarity_filter: Option<u8>,
    #[serde(default)]
    pub save_event_file: bool,
    /// ファイル再生をイベント時刻に合わせる
    #[serde(default)]
    pub realtime: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewingConfig {
    #[serde(default = "default_viewing_enabled")]
    pub enabled: bool,
    #[serde(default = "default_views_horizontal")]
    pub views_horizontal: usize,
    /// ビューア上のカメラタイル1枚の幅
    #[serde(default = "default_tile_width")]
    pub tile_width: usize,
}

// --- デフォルト値 ---

fn default_dictionary() -> String { "DICT_6X6_50".to_string() }
fn default_squares_x() -> i32 { 7 }
fn default_squares_y() -> i32 { 5 }
fn default_detection_interval() -> f64 { 2.0 }
fn default_minimum_corner_fraction() -> f64 { 0.125 }
fn default_alignment_timeout() -> f64 { 30.0 }
fn default_min_markers() -> i32 { 2 }
fn default_polygonal_approx_accuracy_rate() -> f64 { 0.08 }
fn default_perspective_remove_pixel_per_cell() -> i32 { 8 }
fn default_adaptive_thresh_win_size_max() -> i32 { 53 }
fn default_fps() -> u32 { 30 }
fn default_data_dir() -> PathBuf { PathBuf::from("data") }
fn default_event_source_dir() -> PathBuf { PathBuf::from(".") }
fn default_accumulation_time() -> u64 { 33_333 }
fn default_polarity_filter() -> Option<u8> { Some(1) }
fn default_viewing_enabled() -> bool { true }
fn default_views_horizontal() -> usize { 3 }
fn default_tile_width() -> usize { 480 }

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            detection_interval: default_detection_interval(),
            minimum_corner_fraction: default_minimum_corner_fraction(),
            alignment_timeout_secs: default_alignment_timeout(),
            charuco: CharucoConfig::default(),
            detector: DetectorConfig::default(),
        }
    }
}

impl Default for CharucoConfig {
    fn default() -> Self {
        Self { min_markers: default_min_markers(), try_refine_markers: false }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            polygonal_approx_accuracy_rate: default_polygonal_approx_accuracy_rate(),
            perspective_remove_pixel_per_cell: default_perspective_remove_pixel_per_cell(),
            adaptive_thresh_win_size_max: default_adaptive_thresh_win_size_max(),
        }
    }
}

impl Default for ViewingConfig {
    fn default() -> Self {
        Self {
            enabled: default_viewing_enabled(),
            views_horizontal: default_views_horizontal(),
            tile_width: default_tile_width(),
        }
    }
}

impl WorkerConfig {
    pub fn placement(&self) -> usize {
        match self {
            WorkerConfig::Frame(c) => c.placement,
            WorkerConfig::Event(c) => c.placement,
        }
    }

    pub fn device_id(&self) -> Option<&str> {
        match self {
            WorkerConfig::Frame(c) => c.device_id.as_deref(),
            WorkerConfig::Event(c) => c.device_id.as_deref(),
        }
    }

    pub fn backend(&self) -> Backend {
        match self {
            WorkerConfig::Frame(_) => Backend::Frame,
            WorkerConfig::Event(_) => Backend::Event,
        }
    }
}

// --- 読み込み・検証 ---

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config = Self::from_toml(&content)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let workers = &self.recording.workers;
        if workers.is_empty() {
            return Err(ConfigError::NoWorkers);
        }
        if self.recording.master_worker >= workers.len() {
            return Err(ConfigError::MasterOutOfRange {
                master: self.recording.master_worker,
                workers: workers.len(),
            });
        }

        let mut placements: Vec<usize> = workers.iter().map(WorkerConfig::placement).collect();
        placements.sort_unstable();
        if placements.iter().enumerate().any(|(i, &p)| i != p) {
            return Err(ConfigError::Placements { workers: workers.len(), placements });
        }

        for backend in [Backend::Frame, Backend::Event] {
            let of_type: Vec<&WorkerConfig> =
                workers.iter().filter(|w| w.backend() == backend).collect();
            if of_type.len() < 2 {
                continue;
            }
            let ids: HashSet<&str> = of_type.iter().filter_map(|w| w.device_id()).collect();
            if ids.len() != of_type.len() {
                return Err(ConfigError::AmbiguousDevice { backend: backend.as_str() });
            }
        }

        for worker in workers {
            if let WorkerConfig::Event(e) = worker {
                if e.falling_edge_polarity > 1 {
                    return Err(invalid("falling_edge_polarity", "must be 0 or 1"));
                }
                if e.accumulation_time == 0 {
                    return Err(invalid("accumulation_time", "must be positive"));
                }
            }
        }

        if self.recording.fps == 0 {
            return Err(invalid("recording.fps", "must be positive"));
        }
        let interval = self.detection.detection_interval;
        if !(interval.is_finite() && interval > 0.0) {
            return Err(invalid("detection.detection_interval", "must be positive"));
        }
        let fraction = self.detection.minimum_corner_fraction;
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(invalid("detection.minimum_corner_fraction", "must be in (0, 1]"));
        }
        if self.detection.alignment_timeout_secs <= 0.0 {
            return Err(invalid("detection.alignment_timeout_secs", "must be positive"));
        }
        if self.board.squares_x < 2 || self.board.squares_y < 2 {
            return Err(invalid("board", "needs at least 2x2 squares"));
        }
        if !(self.board.marker_length > 0.0 && self.board.marker_length < self.board.square_length) {
            return Err(invalid("board.marker_length", "must be positive and smaller than square_length"));
        }
        if self.viewing.views_horizontal == 0 {
            return Err(invalid("viewing.views_horizontal", "must be positive"));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid { field, reason: reason.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::RecordingParams;

    const SAMPLE: &str = r#"
[board]
square_length = 0.04
marker_length = 0.03

[recording]
master_worker = 0

[[recording.workers]]
type = "frame"
placement = 0

[[recording.workers]]
type = "event"
placement = 1
falling_edge_polarity = 0
save_event_file = true
"#;

    #[test]
    fn test_defaults_applied() {
        let config = Config::from_toml(SAMPLE).unwrap();
        assert_eq!(config.board.dictionary, "DICT_6X6_50");
        assert_eq!((config.board.squares_x, config.board.squares_y), (7, 5));
        assert_eq!(config.detection.detection_interval, 2.0);
        assert_eq!(config.detection.minimum_corner_fraction, 0.125);
        assert_eq!(config.recording.fps, 30);
        assert_eq!(config.viewing.views_horizontal, 3);
        match &config.recording.workers[1] {
            WorkerConfig::Event(e) => {
                assert_eq!(e.accumulation_time, 33_333);
                assert_eq!(e.polarity_filter, Some(1));
                assert!(e.save_event_file);
            }
            other => panic!("unexpected worker {:?}", other),
        }
    }

    #[test]
    fn test_frame_step() {
        let config = Config::from_toml(SAMPLE).unwrap();
        assert_eq!(RecordingParams::from_config(&config).frame_step(), 60);
    }

    #[test]
    fn test_short_interval_samples_every_frame() {
        let mut config = Config::from_toml(SAMPLE).unwrap();
        config.detection.detection_interval = 0.01;
        config.validate().unwrap();
        assert_eq!(RecordingParams::from_config(&config).frame_step(), 1);

        config.detection.detection_interval = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_falling_edge_polarity_rejected() {
        let text = SAMPLE.replace("falling_edge_polarity = 0\n", "");
        assert!(Config::from_toml(&text).is_err());
    }

    #[test]
    fn test_master_out_of_range() {
        let mut config = Config::from_toml(SAMPLE).unwrap();
        config.recording.master_worker = 2;
        assert!(matches!(config.validate(), Err(ConfigError::MasterOutOfRange { .. })));
    }

    #[test]
    fn test_duplicate_placement_rejected() {
        let text = SAMPLE.replace("placement = 1", "placement = 0");
        let err = Config::from_toml(&text).unwrap_err();
        assert!(err.to_string().contains("placements") || format!("{:?}", err).contains("Placements"));
    }

    #[test]
    fn test_same_backend_needs_device_ids() {
        let mut config = Config::from_toml(SAMPLE).unwrap();
        config.recording.workers[1] = WorkerConfig::Frame(FrameWorkerConfig {
            placement: 1,
            device_id: None,
            width: None,
            height: None,
        });
        assert!(matches!(config.validate(), Err(ConfigError::AmbiguousDevice { .. })));

        for (i, w) in config.recording.workers.iter_mut().enumerate() {
            if let WorkerConfig::Frame(f) = w {
                f.device_id = Some(i.to_string());
            }
        }
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_corner_fraction_bounds() {
        let mut config = Config::from_toml(SAMPLE).unwrap();
        config.detection.minimum_corner_fraction = 0.0;
        assert!(config.validate().is_err());
        config.detection.minimum_corner_fraction = 1.0;
        assert!(config.validate().is_ok());
    }
}
