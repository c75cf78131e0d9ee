//! リグのライブ確認表示（カメラタイルと採用済みコーナー）

pub mod compose;
#[cfg(feature = "viewer")]
pub mod window;

pub use compose::{grid_layout, Canvas, Compositor};
#[cfg(feature = "viewer")]
pub use window::{run_viewer, MinifbRenderer};
