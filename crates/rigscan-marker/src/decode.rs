//! Marker id decoding through a homography warp of the marker interior.

use crate::types::{canonical_corners_2d, MARKER_CORNER_COUNT};
use rigscan_core::{estimate_homography, warp_perspective_gray, GrayImage, GrayImageView, Point2f};

/// Normalized silhouette spans [-1, 1] per axis.
const NORMALIZED_MARKER_SIZE: f32 = 2.0;
/// Quiet border trimmed off each side, in normalized units.
const NORMALIZED_BORDER_SIZE: f32 = 0.4;
/// Warp resolution per normalized unit.
const RESOLUTION_PER_UNIT: f32 = 50.0;
/// The interior code is a 3x3 cell grid.
const BIT_GRID_SIZE: usize = 3;
/// A warped cell whose mean is at or above this reads as a one.
const BIT_THRESHOLD: u32 = 128;

/// Decode the 4-bit marker id from the binarized frame, given the ordered
/// silhouette corners. Returns `None` when the interior does not carry a
/// valid inverse-protected, parity-checked code.
pub(crate) fn decode_marker_id(
    binary: &GrayImageView<'_>,
    corners: &[Point2f; MARKER_CORNER_COUNT],
) -> Option<i32> {
    let interior = NORMALIZED_MARKER_SIZE - 2.0 * NORMALIZED_BORDER_SIZE;
    let side = (RESOLUTION_PER_UNIT * interior) as usize;

    // Map the normalized silhouette into warp pixel space: shift from
    // [-1, 1] to [0, 2], trim the border, scale to pixels. The warp then
    // covers exactly the interior code square.
    let template: Vec<Point2f> = canonical_corners_2d()
        .iter()
        .map(|p| {
            Point2f::new(
                (p.x - NORMALIZED_BORDER_SIZE + 1.0) * RESOLUTION_PER_UNIT,
                (p.y - NORMALIZED_BORDER_SIZE + 1.0) * RESOLUTION_PER_UNIT,
            )
        })
        .collect();

    let h = estimate_homography(&template, corners)?;
    let warped = warp_perspective_gray(binary, h, side, side);

    let integral = Integral::new(&warped);
    let cell = side / BIT_GRID_SIZE;
    let cell_area = (cell * cell) as u32;

    let mut vals = [0u8; BIT_GRID_SIZE * BIT_GRID_SIZE];
    for row in 0..BIT_GRID_SIZE {
        for col in 0..BIT_GRID_SIZE {
            let sum = integral.sum(col * cell, row * cell, (col + 1) * cell, (row + 1) * cell);
            if sum / cell_area >= BIT_THRESHOLD {
                vals[row * BIT_GRID_SIZE + col] = 1;
            }
        }
    }

    // vals[0..4] carry the id (MSB first), vals[4..8] must be their
    // bitwise inverse, vals[8] is the parity bit: 0 when the id bits hold
    // an even number of ones.
    let mut code = 0;
    let mut ones = 0;
    for i in 0..4 {
        if vals[i] == vals[i + 4] {
            return None;
        }
        if vals[i] == 1 {
            code |= 1 << (3 - i);
            ones += 1;
        }
    }

    let expected_parity = if ones % 2 == 0 { 0 } else { 1 };
    if vals[8] != expected_parity {
        return None;
    }

    Some(code)
}

/// Summed-area table with an inclusive-origin, exclusive-end query.
struct Integral {
    width: usize,
    sums: Vec<u32>,
}

impl Integral {
    fn new(img: &GrayImage) -> Self {
        let (w, h) = (img.width, img.height);
        let mut sums = vec![0u32; (w + 1) * (h + 1)];

        for y in 0..h {
            let mut row_sum = 0u32;
            for x in 0..w {
                row_sum += img.data[y * w + x] as u32;
                sums[(y + 1) * (w + 1) + (x + 1)] = sums[y * (w + 1) + (x + 1)] + row_sum;
            }
        }

        Self { width: w, sums }
    }

    fn sum(&self, x0: usize, y0: usize, x1: usize, y1: usize) -> u32 {
        let w = self.width + 1;
        self.sums[y1 * w + x1] + self.sums[y0 * w + x0]
            - self.sums[y0 * w + x1]
            - self.sums[y1 * w + x0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integral_sums_match_direct_sums() {
        let img = GrayImage {
            width: 4,
            height: 3,
            data: vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12],
        };
        let integral = Integral::new(&img);

        assert_eq!(integral.sum(0, 0, 4, 3), 78);
        assert_eq!(integral.sum(1, 1, 3, 2), 6 + 7);
        assert_eq!(integral.sum(2, 0, 4, 1), 3 + 4);
        assert_eq!(integral.sum(0, 2, 1, 3), 9);
    }
}
