//! Subpixel corner refinement.
//!
//! Polygon approximation snaps corners to contour pixels. This pass fits a
//! least-squares line to the contour run along each silhouette edge and
//! replaces every corner with the intersection of its two adjacent lines.

use imageproc::point::Point;
use nalgebra::{Matrix2, Vector2};
use rigscan_core::Point2f;

/// A fitted edge line: unit direction plus a point on the line.
#[derive(Clone, Copy, Debug)]
struct EdgeLine {
    direction: Vector2<f32>,
    origin: Vector2<f32>,
}

/// Refine `corners` in place. `contour_order` tells whether the corner
/// sequence follows the contour traversal direction (it is reversed when
/// the decoder had to flip the corner order).
///
/// Leaves the corners untouched when any edge run is too short to fit a
/// line or when two adjacent edges come out parallel.
pub(crate) fn refine_corners(
    corners: &mut [Point2f],
    contour: &[Point<i32>],
    contour_order: bool,
) {
    let n = corners.len();

    // Locate each corner on the contour.
    let mut indices = Vec::with_capacity(n);
    for corner in corners.iter() {
        let found = contour
            .iter()
            .position(|p| p.x as f32 == corner.x && p.y as f32 == corner.y);
        let Some(idx) = found else {
            log::debug!("corner not on contour, skipping refinement");
            return;
        };
        indices.push(idx);
    }

    // Gather the contour run along each edge and fit a line to it.
    let mut lines = Vec::with_capacity(n);
    for i in 0..n {
        let (start, end) = if contour_order {
            (indices[i], indices[(i + 1) % n])
        } else {
            (indices[(i + 1) % n], indices[i])
        };

        let segment: Vec<Point<i32>> = if start < end {
            contour[start..end].to_vec()
        } else {
            contour[start..]
                .iter()
                .chain(&contour[..end])
                .copied()
                .collect()
        };

        let Some(line) = fit_line(&segment) else {
            log::debug!("edge run too short, skipping refinement");
            return;
        };
        lines.push(line);
    }

    // Each corner is the intersection of its two adjacent edge lines.
    let mut refined = Vec::with_capacity(n);
    for i in (n - 1)..(2 * n - 1) {
        let Some(p) = intersect(&lines[(i + 1) % n], &lines[i % n]) else {
            log::debug!("parallel edge lines, skipping refinement");
            return;
        };
        refined.push(p);
    }

    corners.copy_from_slice(&refined);
}

/// Total least squares line through a point run: centroid plus the
/// principal direction of the 2x2 scatter matrix.
fn fit_line(points: &[Point<i32>]) -> Option<EdgeLine> {
    if points.len() < 2 {
        return None;
    }

    let n = points.len() as f32;
    let mut cx = 0.0;
    let mut cy = 0.0;
    for p in points {
        cx += p.x as f32;
        cy += p.y as f32;
    }
    cx /= n;
    cy /= n;

    let (mut sxx, mut sxy, mut syy) = (0.0f32, 0.0f32, 0.0f32);
    for p in points {
        let dx = p.x as f32 - cx;
        let dy = p.y as f32 - cy;
        sxx += dx * dx;
        sxy += dx * dy;
        syy += dy * dy;
    }

    // Largest-eigenvalue direction of [[sxx, sxy], [sxy, syy]].
    let trace_half = (sxx + syy) / 2.0;
    let det = sxx * syy - sxy * sxy;
    let lambda = trace_half + (trace_half * trace_half - det).max(0.0).sqrt();

    let direction = if sxy.abs() > 1e-12 {
        Vector2::new(lambda - syy, sxy)
    } else if sxx >= syy {
        Vector2::new(1.0, 0.0)
    } else {
        Vector2::new(0.0, 1.0)
    };

    let norm = direction.norm();
    if norm < 1e-12 {
        return None;
    }

    Some(EdgeLine {
        direction: direction / norm,
        origin: Vector2::new(cx, cy),
    })
}

fn intersect(a: &EdgeLine, b: &EdgeLine) -> Option<Point2f> {
    // a.origin + t * a.direction == b.origin + s * b.direction
    let m = Matrix2::new(
        a.direction.x,
        -b.direction.x,
        a.direction.y,
        -b.direction.y,
    );
    let rhs = b.origin - a.origin;

    let det = m.determinant();
    if det.abs() < 1e-9 {
        return None;
    }

    let t = (rhs.x * m[(1, 1)] - rhs.y * m[(0, 1)]) / det;
    let p = a.origin + t * a.direction;
    Some(Point2f::new(p.x, p.y))
}
