//! Client-level configuration.
//!
//! These knobs are fixed for the lifetime of one client instance, unlike
//! [`crate::CameraSettings`] which the server may push at any time.

use std::path::PathBuf;
use std::time::Duration;

/// Occupancy-grid geometry used for per-frame voxel deduplication.
#[derive(Clone, Copy, Debug)]
pub struct VoxelGridConfig {
    pub voxel_size: f32,
    pub center: [f32; 3],
    pub half_range: f32,
}

impl Default for VoxelGridConfig {
    fn default() -> Self {
        // 0.3 m working range in front of the camera at the finest
        // precision a byte-quantized range can resolve.
        let range = 0.3;
        Self {
            voxel_size: range / 255.0,
            center: [0.0, 0.0, range / 2.0],
            half_range: range / 2.0,
        }
    }
}

/// Coarse density cull applied after voxel deduplication.
#[derive(Clone, Copy, Debug)]
pub struct DensityConfig {
    pub voxel_size: f32,
    pub min_points_per_voxel: usize,
}

impl Default for DensityConfig {
    fn default() -> Self {
        Self {
            voxel_size: 0.006,
            min_points_per_voxel: 12,
        }
    }
}

/// Change gating applied before forwarding a document detection upstream.
#[derive(Clone, Copy, Debug)]
pub struct DocumentGateConfig {
    /// Resend at least this often even without changes.
    pub send_timeout: Duration,
    /// Normalized mean pixel difference that forces a resend.
    pub diff_threshold: f32,
}

impl Default for DocumentGateConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(30),
            diff_threshold: 0.5,
        }
    }
}

/// Capture adapter timing.
#[derive(Clone, Copy, Debug)]
pub struct CaptureConfig {
    /// Upper bound on one frameset wait.
    pub acquire_timeout: Duration,
    /// A non-subordinate device must produce its first frame within this
    /// budget or initialization fails.
    pub first_frame_deadline: Duration,
    /// Settle time after starting the stream pipeline.
    pub settle_delay: Duration,
    /// Settle time after releasing the device.
    pub close_delay: Duration,
    /// Minimum spacing between document-detector submissions.
    pub document_submit_interval: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_millis(1000),
            first_frame_deadline: Duration::from_secs(5),
            settle_delay: Duration::from_millis(500),
            close_delay: Duration::from_millis(200),
            document_submit_interval: Duration::from_millis(1000),
        }
    }
}

/// Everything a [`crate::Client`] needs beyond its driver and sink.
#[derive(Clone, Debug, Default)]
pub struct ClientConfig {
    pub voxel: VoxelGridConfig,
    pub density: DensityConfig,
    pub document: DocumentGateConfig,
    pub capture: CaptureConfig,
    /// Directory for calibration files and recordings.
    pub storage_dir: PathBuf,
}
