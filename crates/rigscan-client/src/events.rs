//! Outbound callback surface.
//!
//! The host registers one [`EventSink`]; the client's confirmation thread
//! invokes it. Slice arguments are borrows owned by the client and only
//! valid for the duration of the call; the host copies or consumes them
//! synchronously.

use crate::sensor::SyncState;
use image::RgbImage;
use rigscan_core::{Point3s, Rgb};

/// Host-side event surface. Every method has a no-op default so a host
/// only implements what it consumes.
pub trait EventSink: Send + Sync + 'static {
    /// Reported once after the capture device first opens.
    fn send_serial_number(&self, client_index: usize, serial_number: &str) {
        let _ = (client_index, serial_number);
    }

    /// A requested frame recording has been appended to disk.
    fn confirm_recorded(&self, client_index: usize) {
        let _ = client_index;
    }

    /// Calibration succeeded (or a stored calibration was restored).
    /// `rotation` is row-major.
    fn confirm_calibrated(
        &self,
        client_index: usize,
        marker_id: i32,
        rotation: &[f32; 9],
        translation: &[f32; 3],
    ) {
        let _ = (client_index, marker_id, rotation, translation);
    }

    fn send_latest_frame(&self, client_index: usize, vertices: &[Point3s], colors: &[Rgb]) {
        let _ = (client_index, vertices, colors);
    }

    fn send_recorded_frame(
        &self,
        client_index: usize,
        vertices: &[Point3s],
        colors: &[Rgb],
        no_more_frames: bool,
    ) {
        let _ = (client_index, vertices, colors, no_more_frames);
    }

    fn confirm_sync_state(&self, client_index: usize, state: SyncState) {
        let _ = (client_index, state);
    }

    /// The master device restarted and is emitting triggers again.
    fn confirm_master_restart(&self, client_index: usize) {
        let _ = client_index;
    }

    fn send_document(&self, client_index: usize, pixels: &RgbImage, score: f32) {
        let _ = (client_index, pixels, score);
    }
}

/// A sink that drops everything; useful as a placeholder.
pub struct NullEventSink;

impl EventSink for NullEventSink {}
