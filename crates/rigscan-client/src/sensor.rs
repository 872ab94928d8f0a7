//! Abstraction over the depth+color sensor SDK.
//!
//! The capture adapter only ever talks to these traits, which keeps the
//! geometry pipeline testable without hardware and the SDK binding in one
//! place.

use std::time::Duration;
use thiserror::Error;

/// Multi-device trigger role of one client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    /// Waits for an external trigger from the master.
    Subordinate,
    /// Emits triggers for the subordinates.
    Master,
    /// Free-running, no trigger wiring.
    Standalone,
}

impl SyncState {
    /// Wire code used on the control and event surfaces.
    pub fn code(self) -> i32 {
        match self {
            SyncState::Subordinate => 0,
            SyncState::Master => 1,
            SyncState::Standalone => 2,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(SyncState::Subordinate),
            1 => Some(SyncState::Master),
            2 => Some(SyncState::Standalone),
            _ => None,
        }
    }
}

/// Hardware-level sync configuration derived from [`SyncState`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceSyncMode {
    Primary,
    Secondary { trigger_delay_us: u32 },
    Standalone,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamFormat {
    Rgb888,
    Y16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamProfile {
    pub width: usize,
    pub height: usize,
    pub format: StreamFormat,
    pub fps: u32,
}

/// Pinhole intrinsics of one camera.
#[derive(Clone, Copy, Debug)]
pub struct Intrinsics {
    pub fx: f32,
    pub fy: f32,
    pub cx: f32,
    pub cy: f32,
}

/// Rigid transform taking depth-camera-space points into color camera
/// space. Rotation is row-major; translation is in millimeters, as the
/// SDKs report it.
#[derive(Clone, Copy, Debug)]
pub struct DepthToColorExtrinsics {
    pub rotation: [f32; 9],
    pub translation_mm: [f32; 3],
}

#[derive(Clone, Copy, Debug)]
pub struct CameraParameters {
    pub depth: Intrinsics,
    pub color: Intrinsics,
    pub depth_to_color: DepthToColorExtrinsics,
}

#[derive(Clone, Debug)]
pub struct ColorFrame {
    pub width: usize,
    pub height: usize,
    pub format: StreamFormat,
    /// Packed pixel data; RGB888 means three bytes per pixel, R first.
    pub data: Vec<u8>,
    /// Global (rig-wide) timestamp in microseconds.
    pub timestamp_us: u64,
}

#[derive(Clone, Debug)]
pub struct DepthFrame {
    pub width: usize,
    pub height: usize,
    pub format: StreamFormat,
    /// Depth per pixel in millimeters.
    pub data: Vec<u16>,
    pub timestamp_us: u64,
}

/// One matched color+depth capture.
#[derive(Clone, Debug)]
pub struct FrameSet {
    pub color: ColorFrame,
    pub depth: DepthFrame,
}

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("no device at index {0}")]
    DeviceNotFound(usize),
    #[error("failed to open device: {0}")]
    Open(String),
    #[error("stream configuration rejected: {0}")]
    Configuration(String),
    #[error("device control failed: {0}")]
    Control(String),
    #[error("frame wait failed: {0}")]
    FrameWait(String),
}

/// One opened depth+color device.
pub trait DepthSensor: Send {
    fn serial_number(&self) -> &str;
    fn camera_parameters(&self) -> CameraParameters;

    /// Advertised stream profiles; the first entry is the device default.
    fn color_profiles(&self) -> Vec<StreamProfile>;
    fn depth_profiles(&self) -> Vec<StreamProfile>;

    /// Must be called before `start`.
    fn set_sync_config(&mut self, mode: DeviceSyncMode) -> Result<(), SensorError>;

    fn start(&mut self, color: StreamProfile, depth: StreamProfile) -> Result<(), SensorError>;
    fn stop(&mut self);

    /// Wait up to `timeout` for a matched frameset. `Ok(None)` is a
    /// timeout, not an error.
    fn wait_for_frames(&mut self, timeout: Duration) -> Result<Option<FrameSet>, SensorError>;

    fn set_auto_exposure(&mut self, enabled: bool) -> Result<(), SensorError>;
    fn set_exposure_step(&mut self, step: i32) -> Result<(), SensorError>;
}

/// Enumerates and opens devices.
pub trait SensorDriver: Send {
    fn device_count(&self) -> usize;
    fn open(&mut self, index: usize) -> Result<Box<dyn DepthSensor>, SensorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_state_codes_round_trip() {
        for state in [SyncState::Subordinate, SyncState::Master, SyncState::Standalone] {
            assert_eq!(SyncState::from_code(state.code()), Some(state));
        }
        assert_eq!(SyncState::from_code(3), None);
    }
}
