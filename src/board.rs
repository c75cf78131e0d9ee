use nalgebra::Point3;

use crate::config::BoardConfig;
use crate::detection::Point2;

/// ChArUcoボードの物理配置。検出コーナーIDをボード平面座標に変換する。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoardGeometry {
    pub squares_x: u32,
    pub squares_y: u32,
    pub square_length: f32,
}

impl BoardGeometry {
    pub fn new(squares_x: u32, squares_y: u32, square_length: f32) -> Self {
        Self { squares_x, squares_y, square_length }
    }

    pub fn from_config(config: &BoardConfig) -> Self {
        Self::new(config.squares_x.max(0) as u32, config.squares_y.max(0) as u32, config.square_length)
    }

    /// 内部チェスボードコーナー数
    pub fn corner_count(&self) -> usize {
        (self.squares_x.saturating_sub(1) * self.squares_y.saturating_sub(1)) as usize
    }

    /// ビューを有効とみなす最小検出コーナー数
    pub fn corner_threshold(&self, fraction: f64) -> usize {
        (self.corner_count() as f64 * fraction).floor() as usize
    }

    /// 内部コーナーのボード平面座標。ボード上にないIDならNone。
    /// コーナーは原点から1マス内側を起点に行ごとに並ぶ。
    pub fn object_point(&self, id: i32) -> Option<Point3<f32>> {
        if id < 0 || id as usize >= self.corner_count() {
            return None;
        }
        let cols = self.squares_x - 1;
        let x = (id as u32 % cols) + 1;
        let y = (id as u32 / cols) + 1;
        Some(Point3::new(x as f32 * self.square_length, y as f32 * self.square_length, 0.0))
    }

    /// 検出コーナーとボード平面座標を対応づける。未知のIDは捨てる。
    pub fn match_image_points(&self, ids: &[i32], corners: &[Point2]) -> (Vec<Point3<f32>>, Vec<Point2>) {
        ids.iter()
            .zip(corners)
            .filter_map(|(&id, &c)| self.object_point(id).map(|p| (p, c)))
            .unzip()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corner_count_and_threshold() {
        let board = BoardGeometry::new(7, 5, 0.04);
        assert_eq!(board.corner_count(), 24);
        assert_eq!(board.corner_threshold(0.125), 3);
        let big = BoardGeometry::new(9, 7, 0.04);
        assert_eq!(big.corner_count(), 48);
        assert_eq!(big.corner_threshold(0.5), 24);
    }

    #[test]
    fn test_object_point_layout() {
        let board = BoardGeometry::new(7, 5, 0.5);
        assert_eq!(board.object_point(0), Some(Point3::new(0.5, 0.5, 0.0)));
        assert_eq!(board.object_point(5), Some(Point3::new(3.0, 0.5, 0.0)));
        assert_eq!(board.object_point(6), Some(Point3::new(0.5, 1.0, 0.0)));
        assert_eq!(board.object_point(24), None);
        assert_eq!(board.object_point(-1), None);
    }

    #[test]
    fn test_match_drops_unknown_ids() {
        let board = BoardGeometry::new(3, 3, 1.0);
        let ids = [0, 9, 3];
        let corners = [Point2::new(1.0, 1.0), Point2::new(2.0, 2.0), Point2::new(3.0, 3.0)];
        let (obj, img) = board.match_image_points(&ids, &corners);
        assert_eq!(obj, vec![Point3::new(1.0, 1.0, 0.0), Point3::new(2.0, 2.0, 0.0)]);
        assert_eq!(img, vec![Point2::new(1.0, 1.0), Point2::new(3.0, 3.0)]);
    }
}
