//! Core types and utilities for the rigscan capture client.
//!
//! This crate is intentionally small and purely geometric. It does *not*
//! depend on any concrete sensor, detector or image-processing backend.

mod geometry;
mod homography;
mod image;
mod procrustes;

pub mod logger;

pub use geometry::{AffineTransform, Point2f, Point3f, Point3s, Rgb};
pub use homography::{estimate_homography, warp_perspective_gray, Homography};
pub use image::{GrayImage, GrayImageView};
pub use procrustes::{procrustes, rotation_from_cross_covariance};
