use rigscan_core::{Point2f, Point3f};
use serde::{Deserialize, Serialize};

/// Number of corners in a marker silhouette.
pub const MARKER_CORNER_COUNT: usize = 5;

/// One detected marker: decoded id, ordered image-space corners (concave
/// vertex first) and the matching canonical 3D template in marker-local
/// space.
#[derive(Clone, Debug, PartialEq)]
pub struct MarkerInfo {
    pub id: i32,
    pub corners: [Point2f; MARKER_CORNER_COUNT],
    pub points: [Point3f; MARKER_CORNER_COUNT],
}

/// Normalized 2D marker silhouette, x right and y down, concave vertex
/// first.
pub fn canonical_corners_2d() -> [Point2f; MARKER_CORNER_COUNT] {
    [
        Point2f::new(0.0, 1.0),     // bottom center (concave)
        Point2f::new(-1.0, 1.6667), // bottom left
        Point2f::new(-1.0, -1.0),   // top left
        Point2f::new(1.0, -1.0),    // top right
        Point2f::new(1.0, 1.6667),  // bottom right
    ]
}

/// The 3D template the calibration solver aligns against: the 2D
/// silhouette with y negated, in the z = 0 plane.
pub fn canonical_corners_3d() -> [Point3f; MARKER_CORNER_COUNT] {
    [
        Point3f::new(0.0, -1.0, 0.0),
        Point3f::new(-1.0, -1.6667, 0.0),
        Point3f::new(-1.0, 1.0, 0.0),
        Point3f::new(1.0, 1.0, 0.0),
        Point3f::new(1.0, -1.6667, 0.0),
    ]
}

/// Detection parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MarkerDetectorParams {
    /// Threshold used to binarize the grayscale frame.
    #[serde(default = "default_bit_threshold")]
    pub bit_threshold: u8,
    /// Contour area gates, in pixels squared.
    #[serde(default = "default_min_area")]
    pub min_area: f64,
    #[serde(default = "default_max_area")]
    pub max_area: f64,
    /// Polygon approximation tolerance as a multiple of sqrt(area).
    #[serde(default = "default_approx_tolerance_scale")]
    pub approx_tolerance_scale: f64,
    /// Refine corners to subpixel positions by intersecting lines fitted
    /// to the contour edges.
    #[serde(default)]
    pub refine_corners: bool,
}

fn default_bit_threshold() -> u8 {
    120
}

fn default_min_area() -> f64 {
    100.0
}

fn default_max_area() -> f64 {
    1e9
}

fn default_approx_tolerance_scale() -> f64 {
    0.12
}

impl Default for MarkerDetectorParams {
    fn default() -> Self {
        Self {
            bit_threshold: default_bit_threshold(),
            min_area: default_min_area(),
            max_area: default_max_area(),
            approx_tolerance_scale: default_approx_tolerance_scale(),
            refine_corners: false,
        }
    }
}
