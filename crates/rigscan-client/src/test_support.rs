//! Deterministic in-memory sensor stack.
//!
//! Implements [`SensorDriver`]/[`DepthSensor`] over a shared frame queue
//! so the full client pipeline can run against scripted frames. Used by
//! the integration tests; also handy for host-side smoke testing without
//! hardware.

use crate::events::EventSink;
use crate::sensor::{
    CameraParameters, ColorFrame, DepthFrame, DepthSensor, DepthToColorExtrinsics,
    DeviceSyncMode, FrameSet, Intrinsics, SensorDriver, SensorError, StreamFormat, StreamProfile,
    SyncState,
};
use rigscan_core::{Point3s, Rgb};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Shared queue the test pushes framesets into and the sensor pops from.
pub struct FrameQueue {
    queue: Mutex<VecDeque<FrameSet>>,
    signal: Condvar,
}

impl FrameQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            signal: Condvar::new(),
        })
    }

    pub fn push(&self, frameset: FrameSet) {
        let mut queue = self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        queue.push_back(frameset);
        self.signal.notify_one();
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn pop_timeout(&self, timeout: Duration) -> Option<FrameSet> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        loop {
            if let Some(frameset) = queue.pop_front() {
                return Some(frameset);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .signal
                .wait_timeout(queue, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            queue = guard;
        }
    }
}

/// Camera model where both cameras share the same intrinsics and the
/// depth-to-color extrinsic is the identity. A depth pixel `(u, v)` with
/// depth `d` unprojects to `((u - cx) d / fx, (v - cy) d / fy, d)` meters
/// and projects back onto color pixel `(u, v)` exactly.
pub fn aligned_camera(fx: f32, fy: f32, cx: f32, cy: f32) -> CameraParameters {
    let intrinsics = Intrinsics { fx, fy, cx, cy };
    CameraParameters {
        depth: intrinsics,
        color: intrinsics,
        depth_to_color: DepthToColorExtrinsics {
            rotation: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
            translation_mm: [0.0, 0.0, 0.0],
        },
    }
}

/// Blueprint for one synthetic device; every `open` clone shares the
/// frame queue and the logs.
#[derive(Clone)]
pub struct SyntheticDevice {
    pub serial: String,
    pub params: CameraParameters,
    pub color_profiles: Vec<StreamProfile>,
    pub depth_profiles: Vec<StreamProfile>,
    pub frames: Arc<FrameQueue>,
    pub sync_log: Arc<Mutex<Vec<DeviceSyncMode>>>,
    pub exposure_log: Arc<Mutex<Vec<(bool, i32)>>>,
    pub started: Arc<AtomicBool>,
}

impl SyntheticDevice {
    /// A device whose color and depth streams share one resolution.
    pub fn with_resolution(serial: &str, width: usize, height: usize, params: CameraParameters) -> Self {
        Self {
            serial: serial.to_string(),
            params,
            color_profiles: vec![StreamProfile {
                width,
                height,
                format: StreamFormat::Rgb888,
                fps: 30,
            }],
            depth_profiles: vec![StreamProfile {
                width,
                height,
                format: StreamFormat::Y16,
                fps: 30,
            }],
            frames: FrameQueue::new(),
            sync_log: Arc::new(Mutex::new(Vec::new())),
            exposure_log: Arc::new(Mutex::new(Vec::new())),
            started: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Queue one frameset built from per-pixel colors and depths (both at
    /// the device resolution) with matching timestamps.
    pub fn push_frame(&self, colors: &[Rgb], depth: &[u16], timestamp_us: u64) {
        let profile = self.color_profiles[0];
        let mut data = Vec::with_capacity(colors.len() * 3);
        for c in colors {
            data.extend_from_slice(&[c.r, c.g, c.b]);
        }

        self.frames.push(FrameSet {
            color: ColorFrame {
                width: profile.width,
                height: profile.height,
                format: StreamFormat::Rgb888,
                data,
                timestamp_us,
            },
            depth: DepthFrame {
                width: self.depth_profiles[0].width,
                height: self.depth_profiles[0].height,
                format: StreamFormat::Y16,
                data: depth.to_vec(),
                timestamp_us,
            },
        });
    }

    pub fn last_sync_mode(&self) -> Option<DeviceSyncMode> {
        self.sync_log
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .last()
            .copied()
    }
}

struct SyntheticSensor {
    device: SyntheticDevice,
}

impl DepthSensor for SyntheticSensor {
    fn serial_number(&self) -> &str {
        &self.device.serial
    }

    fn camera_parameters(&self) -> CameraParameters {
        self.device.params
    }

    fn color_profiles(&self) -> Vec<StreamProfile> {
        self.device.color_profiles.clone()
    }

    fn depth_profiles(&self) -> Vec<StreamProfile> {
        self.device.depth_profiles.clone()
    }

    fn set_sync_config(&mut self, mode: DeviceSyncMode) -> Result<(), SensorError> {
        self.device
            .sync_log
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(mode);
        Ok(())
    }

    fn start(&mut self, _color: StreamProfile, _depth: StreamProfile) -> Result<(), SensorError> {
        self.device.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) {
        self.device.started.store(false, Ordering::SeqCst);
    }

    fn wait_for_frames(&mut self, timeout: Duration) -> Result<Option<FrameSet>, SensorError> {
        Ok(self.device.frames.pop_timeout(timeout))
    }

    fn set_auto_exposure(&mut self, enabled: bool) -> Result<(), SensorError> {
        self.device
            .exposure_log
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((enabled, 0));
        Ok(())
    }

    fn set_exposure_step(&mut self, step: i32) -> Result<(), SensorError> {
        self.device
            .exposure_log
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((false, step));
        Ok(())
    }
}

/// Driver over a fixed set of synthetic devices.
pub struct SyntheticDriver {
    pub devices: Vec<SyntheticDevice>,
}

impl SyntheticDriver {
    pub fn single(device: SyntheticDevice) -> Self {
        Self {
            devices: vec![device],
        }
    }
}

impl SensorDriver for SyntheticDriver {
    fn device_count(&self) -> usize {
        self.devices.len()
    }

    fn open(&mut self, index: usize) -> Result<Box<dyn DepthSensor>, SensorError> {
        let device = self
            .devices
            .get(index)
            .cloned()
            .ok_or(SensorError::DeviceNotFound(index))?;
        Ok(Box::new(SyntheticSensor { device }))
    }
}

/// Everything a sink observed, for assertions.
#[derive(Clone, Debug)]
pub enum SinkEvent {
    SerialNumber(String),
    Recorded,
    Calibrated {
        marker_id: i32,
        rotation: [f32; 9],
        translation: [f32; 3],
    },
    LatestFrame {
        vertices: Vec<Point3s>,
        colors: Vec<Rgb>,
    },
    RecordedFrame {
        vertices: Vec<Point3s>,
        colors: Vec<Rgb>,
        no_more_frames: bool,
    },
    SyncState(SyncState),
    MasterRestart,
    Document {
        score: f32,
        width: u32,
        height: u32,
    },
}

/// An [`EventSink`] that records every callback.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<SinkEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<SinkEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn record(&self, event: SinkEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
    }
}

impl EventSink for RecordingSink {
    fn send_serial_number(&self, _client_index: usize, serial_number: &str) {
        self.record(SinkEvent::SerialNumber(serial_number.to_string()));
    }

    fn confirm_recorded(&self, _client_index: usize) {
        self.record(SinkEvent::Recorded);
    }

    fn confirm_calibrated(
        &self,
        _client_index: usize,
        marker_id: i32,
        rotation: &[f32; 9],
        translation: &[f32; 3],
    ) {
        self.record(SinkEvent::Calibrated {
            marker_id,
            rotation: *rotation,
            translation: *translation,
        });
    }

    fn send_latest_frame(&self, _client_index: usize, vertices: &[Point3s], colors: &[Rgb]) {
        self.record(SinkEvent::LatestFrame {
            vertices: vertices.to_vec(),
            colors: colors.to_vec(),
        });
    }

    fn send_recorded_frame(
        &self,
        _client_index: usize,
        vertices: &[Point3s],
        colors: &[Rgb],
        no_more_frames: bool,
    ) {
        self.record(SinkEvent::RecordedFrame {
            vertices: vertices.to_vec(),
            colors: colors.to_vec(),
            no_more_frames,
        });
    }

    fn confirm_sync_state(&self, _client_index: usize, state: SyncState) {
        self.record(SinkEvent::SyncState(state));
    }

    fn confirm_master_restart(&self, _client_index: usize) {
        self.record(SinkEvent::MasterRestart);
    }

    fn send_document(&self, _client_index: usize, pixels: &image::RgbImage, score: f32) {
        self.record(SinkEvent::Document {
            score,
            width: pixels.width(),
            height: pixels.height(),
        });
    }
}
