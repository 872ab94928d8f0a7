use crate::decode::decode_marker_id;
use crate::refine::refine_corners;
use crate::types::{
    canonical_corners_3d, MarkerDetectorParams, MarkerInfo, MARKER_CORNER_COUNT,
};
use image::GrayImage;
use imageproc::contours::find_contours;
use imageproc::geometry::{approximate_polygon_dp, convex_hull};
use imageproc::point::Point;
use rigscan_core::{GrayImageView, Point2f, Rgb};

/// Finds the rig's pentagon markers in a color frame and reports the best
/// one (largest convex-hull area).
#[derive(Clone, Debug, Default)]
pub struct MarkerDetector {
    params: MarkerDetectorParams,
}

impl MarkerDetector {
    pub fn new(params: MarkerDetectorParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &MarkerDetectorParams {
        &self.params
    }

    /// Detect markers in an RGB frame (row-major, `width * height`
    /// samples) and return the one with the largest hull area, or `None`.
    pub fn detect(&self, colors: &[Rgb], width: usize, height: usize) -> Option<MarkerInfo> {
        if colors.len() != width * height || width == 0 || height == 0 {
            return None;
        }

        let binary = binarize(colors, self.params.bit_threshold);
        let bin_img = GrayImage::from_raw(width as u32, height as u32, binary)?;
        let view = GrayImageView {
            width,
            height,
            data: bin_img.as_raw(),
        };

        let contours = find_contours::<i32>(&bin_img);

        let mut best: Option<(f64, MarkerInfo)> = None;
        for contour in &contours {
            let area = polygon_area(&contour.points);
            if area < self.params.min_area || area > self.params.max_area {
                continue;
            }

            let tolerance = area.sqrt() * self.params.approx_tolerance_scale;
            let approx = approximate_polygon_dp(&contour.points, tolerance, true);

            // A marker silhouette is a pentagon with one concave vertex.
            if approx.len() != MARKER_CORNER_COUNT || is_convex(&approx) {
                continue;
            }
            let Some(mut corners) = order_concave_first(&approx) else {
                continue;
            };

            let mut contour_order = true;
            let mut id = decode_marker_id(&view, &corners);
            if id.is_none() {
                // The contour may run the other way around the silhouette.
                corners[1..].reverse();
                id = decode_marker_id(&view, &corners);
                contour_order = false;
            }
            let Some(id) = id else {
                continue;
            };

            if self.params.refine_corners {
                refine_corners(&mut corners, &contour.points, contour_order);
            }

            let hull_area = corner_hull_area(&corners);
            if best.as_ref().map(|(a, _)| hull_area > *a).unwrap_or(true) {
                best = Some((
                    hull_area,
                    MarkerInfo {
                        id,
                        corners,
                        points: canonical_corners_3d(),
                    },
                ));
            }
        }

        best.map(|(_, marker)| marker)
    }
}

fn binarize(colors: &[Rgb], threshold: u8) -> Vec<u8> {
    colors
        .iter()
        .map(|c| {
            let luma = 0.299 * c.r as f32 + 0.587 * c.g as f32 + 0.114 * c.b as f32;
            if luma > threshold as f32 {
                255
            } else {
                0
            }
        })
        .collect()
}

/// Signed shoelace area, absolute value.
fn polygon_area(points: &[Point<i32>]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let mut twice_area = 0i64;
    for i in 0..points.len() {
        let a = points[i];
        let b = points[(i + 1) % points.len()];
        twice_area += a.x as i64 * b.y as i64 - b.x as i64 * a.y as i64;
    }
    (twice_area.abs() as f64) / 2.0
}

/// A closed polygon is convex when every non-degenerate turn has the same
/// orientation.
fn is_convex(points: &[Point<i32>]) -> bool {
    let n = points.len();
    if n < 4 {
        return true;
    }

    let mut sign = 0i64;
    for i in 0..n {
        let a = points[i];
        let b = points[(i + 1) % n];
        let c = points[(i + 2) % n];
        let cross = (b.x - a.x) as i64 * (c.y - b.y) as i64
            - (b.y - a.y) as i64 * (c.x - b.x) as i64;
        if cross == 0 {
            continue;
        }
        if sign == 0 {
            sign = cross.signum();
        } else if sign != cross.signum() {
            return false;
        }
    }
    true
}

/// Reorder so the concave vertex comes first, preserving the cyclic order.
///
/// Exactly one vertex must be off the convex hull; otherwise the shape is
/// not a marker silhouette and `None` is returned.
fn order_concave_first(corners: &[Point<i32>]) -> Option<[Point2f; MARKER_CORNER_COUNT]> {
    let hull = convex_hull(corners);
    if hull.len() != corners.len() - 1 {
        return None;
    }

    let concave = corners
        .iter()
        .position(|c| !hull.contains(c))?;

    let mut out = [Point2f::default(); MARKER_CORNER_COUNT];
    for (i, slot) in out.iter_mut().enumerate() {
        let p = corners[(concave + i) % corners.len()];
        *slot = Point2f::new(p.x as f32, p.y as f32);
    }
    Some(out)
}

/// Marker area metric used to pick the best detection: the area of the
/// convex hull of its corners.
fn corner_hull_area(corners: &[Point2f; MARKER_CORNER_COUNT]) -> f64 {
    let as_points: Vec<Point<i32>> = corners
        .iter()
        .map(|c| Point::new(c.x.round() as i32, c.y.round() as i32))
        .collect();
    let hull = convex_hull(as_points.as_slice());
    polygon_area(&hull)
}
