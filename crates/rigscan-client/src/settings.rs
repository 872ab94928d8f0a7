//! Host-controlled camera settings.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Known world-space pose of one calibration marker.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MarkerPose {
    pub marker_id: i32,
    /// Row-major rotation.
    pub rotation: [[f32; 3]; 3],
    pub translation: [f32; 3],
}

impl MarkerPose {
    /// Marker sitting at the world origin with no rotation.
    pub fn identity(marker_id: i32) -> Self {
        Self {
            marker_id,
            rotation: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            translation: [0.0, 0.0, 0.0],
        }
    }
}

/// Settings pushed by the coordinating server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraSettings {
    /// World-space axis-aligned keep volume.
    #[serde(default = "default_min_bounds")]
    pub min_bounds: [f32; 3],
    #[serde(default = "default_max_bounds")]
    pub max_bounds: [f32; 3],

    /// KNN outlier filter toggle and parameters.
    #[serde(default)]
    pub filter_enabled: bool,
    #[serde(default = "default_filter_neighbors")]
    pub filter_neighbors: i32,
    #[serde(default = "default_filter_threshold")]
    pub filter_threshold: f32,

    /// Marker poses the calibration engine may match against.
    #[serde(default)]
    pub marker_poses: Vec<MarkerPose>,

    #[serde(default = "default_auto_exposure")]
    pub auto_exposure_enabled: bool,
    #[serde(default = "default_exposure_step")]
    pub exposure_step: i32,
}

fn default_min_bounds() -> [f32; 3] {
    [-0.5, -0.5, -0.5]
}

fn default_max_bounds() -> [f32; 3] {
    [0.5, 0.5, 0.5]
}

fn default_filter_neighbors() -> i32 {
    10
}

fn default_filter_threshold() -> f32 {
    0.01
}

fn default_auto_exposure() -> bool {
    true
}

fn default_exposure_step() -> i32 {
    -5
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            min_bounds: default_min_bounds(),
            max_bounds: default_max_bounds(),
            filter_enabled: false,
            filter_neighbors: default_filter_neighbors(),
            filter_threshold: default_filter_threshold(),
            marker_poses: Vec::new(),
            auto_exposure_enabled: default_auto_exposure(),
            exposure_step: default_exposure_step(),
        }
    }
}

impl CameraSettings {
    /// Load settings from a JSON file.
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Write these settings to disk as pretty JSON.
    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<(), SettingsError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_round_trip_preserves_settings() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.json");

        let mut settings = CameraSettings::default();
        settings.filter_enabled = true;
        settings.marker_poses.push(MarkerPose::identity(7));
        settings.write_json(&path).expect("write");

        let loaded = CameraSettings::load_json(&path).expect("load");
        assert_eq!(loaded, settings);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let parsed: CameraSettings = serde_json::from_str("{}").expect("parse");
        assert_eq!(parsed, CameraSettings::default());
    }
}
