//! Marker-based extrinsic calibration.
//!
//! The engine accumulates marker observations over several frames, fits a
//! rigid transform with Procrustes and composes it with the marker's known
//! world pose. The result maps camera-space points into the shared rig
//! frame and is persisted per device serial number.

use crate::settings::MarkerPose;
use nalgebra::{Matrix3, Vector3};
use rigscan_core::{procrustes, AffineTransform, Point3f, Rgb};
use rigscan_marker::{MarkerDetector, MarkerInfo};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Marker observations averaged before the rigid fit.
pub const REQUIRED_SAMPLES: usize = 20;

#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("no marker detected in the color frame")]
    NoMarkerDetected,
    #[error("detected marker {0} has no configured pose")]
    UnknownMarkerId(i32),
    #[error("invalid depth under a marker corner")]
    InvalidCornerDepth,
    #[error("collected {collected} of {required} marker samples")]
    SamplesPending { collected: usize, required: usize },
    #[error("degenerate marker geometry")]
    DegenerateGeometry,
}

#[derive(Debug, Error)]
pub enum CalibrationIoError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("malformed calibration file")]
    Malformed,
}

/// Per-client calibration state.
pub struct Calibration {
    pub world_rotation: Matrix3<f32>,
    pub world_translation: Vector3<f32>,
    pub used_marker_id: i32,
    pub is_calibrated: bool,
    /// Marker poses pushed through the camera settings.
    pub marker_poses: Vec<MarkerPose>,

    detector: MarkerDetector,
    samples: Vec<Vec<Point3f>>,
    storage_dir: PathBuf,
}

impl Calibration {
    pub fn new(storage_dir: PathBuf) -> Self {
        Self {
            world_rotation: Matrix3::identity(),
            world_translation: Vector3::zeros(),
            used_marker_id: -1,
            is_calibrated: false,
            marker_poses: Vec::new(),
            detector: MarkerDetector::default(),
            samples: Vec::new(),
            storage_dir,
        }
    }

    pub fn world_transform(&self) -> AffineTransform {
        AffineTransform::new(self.world_rotation, self.world_translation)
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Take one calibration sample from a color frame and its aligned
    /// camera-space vertex image. Completes the calibration once
    /// [`REQUIRED_SAMPLES`] samples have been gathered.
    ///
    /// Any error other than [`CalibrationError::SamplesPending`] leaves
    /// the accumulator untouched so the next frame can try again.
    pub fn calibrate(
        &mut self,
        colors: &[Rgb],
        vertices: &[Point3f],
        width: usize,
        height: usize,
    ) -> Result<(), CalibrationError> {
        let marker = self
            .detector
            .detect(colors, width, height)
            .ok_or(CalibrationError::NoMarkerDetected)?;

        let pose = self
            .marker_poses
            .iter()
            .find(|p| p.marker_id == marker.id)
            .copied()
            .ok_or(CalibrationError::UnknownMarkerId(marker.id))?;
        self.used_marker_id = pose.marker_id;

        let sample = marker_corners_3d(&marker, vertices, width, height)
            .ok_or(CalibrationError::InvalidCornerDepth)?;
        self.samples.push(sample);

        if self.samples.len() < REQUIRED_SAMPLES {
            return Err(CalibrationError::SamplesPending {
                collected: self.samples.len(),
                required: REQUIRED_SAMPLES,
            });
        }

        // Corner-wise average over all samples.
        let corner_count = marker.points.len();
        let mut averaged = vec![Point3f::default(); corner_count];
        for sample in &self.samples {
            for (avg, p) in averaged.iter_mut().zip(sample) {
                avg.x += p.x / self.samples.len() as f32;
                avg.y += p.y / self.samples.len() as f32;
                avg.z += p.z / self.samples.len() as f32;
            }
        }

        let (local_rotation, local_translation) = procrustes(&marker.points, &averaged)
            .ok_or(CalibrationError::DegenerateGeometry)?;

        // Compose with the marker's known world pose.
        let pose_rotation = Matrix3::from_row_slice(&[
            pose.rotation[0][0],
            pose.rotation[0][1],
            pose.rotation[0][2],
            pose.rotation[1][0],
            pose.rotation[1][1],
            pose.rotation[1][2],
            pose.rotation[2][0],
            pose.rotation[2][1],
            pose.rotation[2][2],
        ]);

        self.world_rotation = pose_rotation * local_rotation;
        let pose_translation = Vector3::from(pose.translation);
        let increment = self.world_rotation.transpose() * pose_translation;
        self.world_translation = local_translation + increment;

        self.is_calibrated = true;
        self.samples.clear();
        Ok(())
    }

    /// Load calibration state persisted for `serial_number`.
    pub fn load(&mut self, serial_number: &str) -> Result<(), CalibrationIoError> {
        let raw = fs::read_to_string(self.file_path(serial_number))?;
        let mut tokens = raw.split_whitespace();

        let mut next = || -> Result<f32, CalibrationIoError> {
            tokens
                .next()
                .and_then(|t| t.parse::<f32>().ok())
                .ok_or(CalibrationIoError::Malformed)
        };

        let mut translation = Vector3::zeros();
        for i in 0..3 {
            translation[i] = next()?;
        }

        let mut rotation = Matrix3::zeros();
        for row in 0..3 {
            for col in 0..3 {
                rotation[(row, col)] = next()?;
            }
        }

        let marker_id = next()? as i32;
        let calibrated = next()? != 0.0;

        self.world_translation = translation;
        self.world_rotation = rotation;
        self.used_marker_id = marker_id;
        self.is_calibrated = calibrated;
        Ok(())
    }

    /// Persist the current state for `serial_number`. Best effort; the
    /// caller only logs failures.
    pub fn save(&self, serial_number: &str) -> Result<(), CalibrationIoError> {
        let mut out = String::new();
        for i in 0..3 {
            out.push_str(&format!("{} ", self.world_translation[i]));
        }
        out.push('\n');
        for row in 0..3 {
            for col in 0..3 {
                out.push_str(&format!("{} ", self.world_rotation[(row, col)]));
            }
            out.push('\n');
        }
        out.push_str(&format!("{}\n", self.used_marker_id));
        out.push_str(&format!("{}\n", if self.is_calibrated { 1 } else { 0 }));

        fs::write(self.file_path(serial_number), out)?;
        Ok(())
    }

    fn file_path(&self, serial_number: &str) -> PathBuf {
        Path::new(&self.storage_dir).join(format!("calibration_{serial_number}.txt"))
    }
}

/// Bilinearly interpolate the camera-space position of every marker corner
/// from the per-pixel vertex image. Fails when any of the four integer
/// pixel neighbours of a corner carries invalid depth (z <= 0) or falls
/// outside the frame.
fn marker_corners_3d(
    marker: &MarkerInfo,
    vertices: &[Point3f],
    width: usize,
    height: usize,
) -> Option<Vec<Point3f>> {
    let mut corners = Vec::with_capacity(marker.corners.len());

    for corner in &marker.corners {
        let x0 = corner.x as i32;
        let y0 = corner.y as i32;
        let x1 = x0 + 1;
        let y1 = y0 + 1;

        if x0 < 0 || y0 < 0 || x1 >= width as i32 || y1 >= height as i32 {
            return None;
        }

        let dx = corner.x - x0 as f32;
        let dy = corner.y - y0 as f32;

        let at = |x: i32, y: i32| vertices[y as usize * width + x as usize];
        let p00 = at(x0, y0);
        let p10 = at(x1, y0);
        let p01 = at(x0, y1);
        let p11 = at(x1, y1);

        if p00.z <= 0.0 || p10.z <= 0.0 || p01.z <= 0.0 || p11.z <= 0.0 {
            return None;
        }

        let lerp = |a: f32, b: f32, c: f32, d: f32| {
            (1.0 - dx) * (1.0 - dy) * a + dx * (1.0 - dy) * b + (1.0 - dx) * dy * c + dx * dy * d
        };

        corners.push(Point3f::new(
            lerp(p00.x, p10.x, p01.x, p11.x),
            lerp(p00.y, p10.y, p01.y, p11.y),
            lerp(p00.z, p10.z, p01.z, p11.z),
        ));
    }

    Some(corners)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rigscan_core::Point2f;
    use rigscan_marker::canonical_corners_3d;

    fn flat_vertex_image(width: usize, height: usize, z: f32) -> Vec<Point3f> {
        let mut vertices = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                vertices.push(Point3f::new(x as f32 * 0.01, y as f32 * 0.01, z));
            }
        }
        vertices
    }

    fn marker_at(corners: [Point2f; 5]) -> MarkerInfo {
        MarkerInfo {
            id: 7,
            corners,
            points: canonical_corners_3d(),
        }
    }

    #[test]
    fn corner_interpolation_is_bilinear() {
        let vertices = flat_vertex_image(10, 10, 1.0);
        let marker = marker_at([
            Point2f::new(2.5, 3.5),
            Point2f::new(4.0, 4.0),
            Point2f::new(5.0, 5.0),
            Point2f::new(6.0, 4.0),
            Point2f::new(5.0, 3.0),
        ]);

        let corners = marker_corners_3d(&marker, &vertices, 10, 10).expect("corners");
        assert!((corners[0].x - 0.025).abs() < 1e-6);
        assert!((corners[0].y - 0.035).abs() < 1e-6);
        assert!((corners[0].z - 1.0).abs() < 1e-6);
    }

    #[test]
    fn invalid_depth_under_a_corner_fails() {
        let mut vertices = flat_vertex_image(10, 10, 1.0);
        vertices[3 * 10 + 3].z = 0.0;

        let marker = marker_at([
            Point2f::new(2.5, 2.5), // neighbourhood includes (3, 3)
            Point2f::new(5.0, 5.0),
            Point2f::new(6.0, 6.0),
            Point2f::new(7.0, 5.0),
            Point2f::new(6.0, 4.0),
        ]);

        assert!(marker_corners_3d(&marker, &vertices, 10, 10).is_none());
    }

    #[test]
    fn corner_outside_frame_fails() {
        let vertices = flat_vertex_image(10, 10, 1.0);
        let marker = marker_at([
            Point2f::new(9.5, 5.0), // x1 = 10 is out of range
            Point2f::new(5.0, 5.0),
            Point2f::new(6.0, 6.0),
            Point2f::new(7.0, 5.0),
            Point2f::new(6.0, 4.0),
        ]);

        assert!(marker_corners_3d(&marker, &vertices, 10, 10).is_none());
    }

    #[test]
    fn persistence_round_trips_by_serial_number() {
        let dir = tempfile::tempdir().expect("tempdir");

        let mut calibration = Calibration::new(dir.path().to_path_buf());
        calibration.world_translation = Vector3::new(-1.0, -2.0, -3.0);
        calibration.world_rotation = Matrix3::new(0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0);
        calibration.used_marker_id = 7;
        calibration.is_calibrated = true;
        calibration.save("SN1234").expect("save");

        let mut restored = Calibration::new(dir.path().to_path_buf());
        restored.load("SN1234").expect("load");

        assert_eq!(restored.world_translation, calibration.world_translation);
        assert_eq!(restored.world_rotation, calibration.world_rotation);
        assert_eq!(restored.used_marker_id, 7);
        assert!(restored.is_calibrated);
    }

    #[test]
    fn loading_a_missing_file_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut calibration = Calibration::new(dir.path().to_path_buf());
        assert!(calibration.load("absent").is_err());
    }
}
