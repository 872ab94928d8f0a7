//! Per-client orchestration: the frame pipeline, the sync state machine
//! and the control/event plumbing.
//!
//! Three threads cooperate per client: the pipeline thread (owns the
//! adapter, calibration, voxel grid, recorder), a confirmation thread
//! that drains the outbound event queue into the host's [`EventSink`],
//! and the document worker inside the capture adapter. Control requests
//! arrive over a channel and are executed at frame boundaries, in order.

use crate::calibration::{Calibration, CalibrationError};
use crate::capture::CaptureAdapter;
use crate::config::ClientConfig;
use crate::document::DocumentDetection;
use crate::events::EventSink;
use crate::recording::FrameRecorder;
use crate::sensor::{SensorDriver, SyncState};
use crate::settings::CameraSettings;
use image::imageops::{self, FilterType};
use image::RgbImage;
use rigscan_cloud::{mark_sparse_voxels, remove_outliers, VoxelGrid};
use rigscan_core::{AffineTransform, Point3f, Point3s, Rgb};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Requests from the host control surface. The pipeline thread executes
/// them at frame boundaries; every request is honored exactly once, in
/// submission order.
#[derive(Debug)]
pub enum ControlRequest {
    StartFrameRecording,
    Calibrate,
    SetSettings(CameraSettings),
    RequestRecordedFrame,
    RequestLatestFrame,
    ReceiveCalibration(AffineTransform),
    ClearRecordedFrames,
    EnableSync { state: SyncState, offset: i32 },
    DisableSync,
    StartMaster,
}

/// Immutable snapshot of the last processed frame. Vertex and color
/// counts always match.
#[derive(Clone, Debug, Default)]
pub struct FrameSnapshot {
    pub vertices: Vec<Point3s>,
    pub colors: Vec<Rgb>,
    pub timestamp_us: u64,
}

/// Events queued by the pipeline thread and delivered by the
/// confirmation thread.
enum Outbound {
    SerialNumber(String),
    Recorded,
    Calibrated {
        marker_id: i32,
        rotation: [f32; 9],
        translation: [f32; 3],
    },
    LatestFrame(Arc<FrameSnapshot>),
    RecordedFrame {
        vertices: Vec<Point3s>,
        colors: Vec<Rgb>,
        no_more_frames: bool,
    },
    SyncStateChanged(SyncState),
    MasterRestart,
    Document {
        image: RgbImage,
        score: f32,
    },
}

/// Cloneable handle for submitting control requests.
#[derive(Clone)]
pub struct ClientController {
    control: Sender<ControlRequest>,
}

impl ClientController {
    fn send(&self, request: ControlRequest) {
        // A disconnected pipeline means the client is shutting down; the
        // request is dropped like any other late call.
        let _ = self.control.send(request);
    }

    pub fn start_frame_recording(&self) {
        self.send(ControlRequest::StartFrameRecording);
    }

    pub fn calibrate(&self) {
        self.send(ControlRequest::Calibrate);
    }

    pub fn set_settings(&self, settings: CameraSettings) {
        self.send(ControlRequest::SetSettings(settings));
    }

    pub fn request_recorded_frame(&self) {
        self.send(ControlRequest::RequestRecordedFrame);
    }

    pub fn request_latest_frame(&self) {
        self.send(ControlRequest::RequestLatestFrame);
    }

    pub fn receive_calibration(&self, transform: AffineTransform) {
        self.send(ControlRequest::ReceiveCalibration(transform));
    }

    pub fn clear_recorded_frames(&self) {
        self.send(ControlRequest::ClearRecordedFrames);
    }

    pub fn enable_sync(&self, state: SyncState, offset: i32) {
        self.send(ControlRequest::EnableSync { state, offset });
    }

    pub fn disable_sync(&self) {
        self.send(ControlRequest::DisableSync);
    }

    pub fn start_master(&self) {
        self.send(ControlRequest::StartMaster);
    }
}

/// Handle to a spawned client; stopping joins the pipeline thread.
pub struct ClientHandle {
    controller: ClientController,
    exit: Arc<AtomicBool>,
    thread: thread::JoinHandle<()>,
}

impl ClientHandle {
    pub fn controller(&self) -> &ClientController {
        &self.controller
    }

    /// Request exit and wait for the pipeline (and with it the
    /// confirmation thread) to wind down.
    pub fn stop(self) {
        self.exit.store(true, Ordering::Relaxed);
        let _ = self.thread.join();
    }
}

struct DocumentGate {
    last_image: Option<RgbImage>,
    last_score: f32,
    last_sent: Option<Instant>,
}

/// One per-camera capture client.
pub struct Client {
    client_index: usize,
    config: ClientConfig,
    adapter: CaptureAdapter,
    calibration: Calibration,
    voxel_grid: VoxelGrid,
    recorder: FrameRecorder,

    bounds_min: [f32; 3],
    bounds_max: [f32; 3],
    filter_enabled: bool,
    filter_neighbors: i32,
    filter_threshold: f32,

    sync_state: SyncState,
    calibrate_requested: bool,
    record_frame_requested: bool,

    last_frame: Arc<FrameSnapshot>,
    document_gate: DocumentGate,

    control_tx: Sender<ControlRequest>,
    control_rx: Receiver<ControlRequest>,
    events_tx: Sender<Outbound>,
    events_rx: Option<Receiver<Outbound>>,
    sink: Arc<dyn EventSink>,
    exit: Arc<AtomicBool>,
}

impl Client {
    pub fn new(
        driver: Box<dyn SensorDriver>,
        client_index: usize,
        sink: Arc<dyn EventSink>,
        config: ClientConfig,
    ) -> Self {
        let (control_tx, control_rx) = mpsc::channel();
        let (events_tx, events_rx) = mpsc::channel();

        let adapter = CaptureAdapter::new(driver, client_index, config.capture);
        let calibration = Calibration::new(config.storage_dir.clone());
        let voxel_grid = VoxelGrid::new(
            config.voxel.voxel_size,
            config.voxel.center,
            config.voxel.half_range,
        );
        let recorder = FrameRecorder::new(config.storage_dir.clone());

        Self {
            client_index,
            config,
            adapter,
            calibration,
            voxel_grid,
            recorder,
            bounds_min: [-0.5, -0.5, -0.5],
            bounds_max: [0.5, 0.5, 0.5],
            filter_enabled: false,
            filter_neighbors: 10,
            filter_threshold: 0.01,
            sync_state: SyncState::Standalone,
            calibrate_requested: false,
            record_frame_requested: false,
            last_frame: Arc::new(FrameSnapshot::default()),
            document_gate: DocumentGate {
                last_image: None,
                last_score: 0.0,
                last_sent: None,
            },
            control_tx,
            control_rx,
            events_tx,
            events_rx: Some(events_rx),
            sink,
            exit: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn controller(&self) -> ClientController {
        ClientController {
            control: self.control_tx.clone(),
        }
    }

    pub fn exit_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.exit)
    }

    pub fn sync_state(&self) -> SyncState {
        self.sync_state
    }

    pub fn is_device_initialized(&self) -> bool {
        self.adapter.is_initialized
    }

    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    pub fn latest_frame(&self) -> Arc<FrameSnapshot> {
        Arc::clone(&self.last_frame)
    }

    /// Spawn the pipeline thread and return the control handle.
    pub fn spawn(self) -> std::io::Result<ClientHandle> {
        let controller = self.controller();
        let exit = Arc::clone(&self.exit);
        let thread = thread::Builder::new()
            .name(format!("rigscan-client-{}", self.client_index))
            .spawn(move || self.run())?;

        Ok(ClientHandle {
            controller,
            exit,
            thread,
        })
    }

    /// Pipeline thread body: initialize standalone, start the
    /// confirmation thread, then loop until the exit flag is raised.
    pub fn run(mut self) {
        self.initialize();

        let confirmation = self.events_rx.take().map(|events| {
            let sink = Arc::clone(&self.sink);
            let client_index = self.client_index;
            thread::spawn(move || {
                while let Ok(event) = events.recv() {
                    dispatch_event(event, sink.as_ref(), client_index);
                }
            })
        });

        while !self.exit.load(Ordering::Relaxed) {
            self.process_once();
        }

        // Dropping the client drops the event sender, which lets the
        // confirmation thread drain the queue and exit.
        drop(self);
        if let Some(confirmation) = confirmation {
            let _ = confirmation.join();
        }
    }

    /// First-time startup: open the device free-running, announce the
    /// serial number and restore any stored calibration.
    pub fn initialize(&mut self) {
        if self.adapter.initialize(self.sync_state, 0) {
            let serial = self.adapter.serial_number().to_string();
            self.send_event(Outbound::SerialNumber(serial.clone()));

            match self.calibration.load(&serial) {
                Ok(()) => {
                    if self.calibration.is_calibrated {
                        self.queue_confirm_calibrated();
                    }
                }
                Err(e) => log::debug!("no stored calibration for {serial}: {e}"),
            }

            self.adapter.set_exposure_state(true, 0);
        } else {
            log::error!("failed to initialize capture device");
        }
    }

    /// One pipeline tick: drain control requests, then acquire and
    /// process a frame. Public so a host may drive the pipeline from its
    /// own scheduler instead of [`Client::spawn`].
    pub fn process_once(&mut self) {
        while let Ok(request) = self.control_rx.try_recv() {
            self.handle_request(request);
        }

        if self.adapter.is_initialized {
            self.update_frame();
        } else {
            // Nothing to block on while the device is down; the host may
            // re-enable sync or the exit flag may be raised.
            thread::sleep(Duration::from_millis(10));
        }
    }

    /// Deliver queued events on the calling thread. Only meaningful for
    /// hosts that drive the pipeline synchronously; [`Client::run`] moves
    /// delivery to the confirmation thread instead.
    pub fn dispatch_pending_events(&mut self) {
        if let Some(events) = &self.events_rx {
            while let Ok(event) = events.try_recv() {
                dispatch_event(event, self.sink.as_ref(), self.client_index);
            }
        }
    }

    fn handle_request(&mut self, request: ControlRequest) {
        match request {
            ControlRequest::StartFrameRecording => self.record_frame_requested = true,
            ControlRequest::Calibrate => self.calibrate_requested = true,
            ControlRequest::SetSettings(settings) => self.apply_settings(settings),
            ControlRequest::RequestRecordedFrame => self.reply_recorded_frame(),
            ControlRequest::RequestLatestFrame => {
                self.send_event(Outbound::LatestFrame(Arc::clone(&self.last_frame)));
            }
            ControlRequest::ReceiveCalibration(transform) => {
                self.calibration.world_rotation = transform.rotation;
                self.calibration.world_translation = transform.translation;
            }
            ControlRequest::ClearRecordedFrames => self.recorder.close(),
            ControlRequest::EnableSync { state, offset } => self.enable_sync(state, offset),
            ControlRequest::DisableSync => self.restart_standalone(),
            ControlRequest::StartMaster => self.start_master(),
        }
    }

    fn apply_settings(&mut self, settings: CameraSettings) {
        self.bounds_min = settings.min_bounds;
        self.bounds_max = settings.max_bounds;
        self.filter_enabled = settings.filter_enabled;
        self.filter_neighbors = settings.filter_neighbors;
        self.filter_threshold = settings.filter_threshold;
        self.calibration.marker_poses = settings.marker_poses;
        self.adapter
            .set_exposure_state(settings.auto_exposure_enabled, settings.exposure_step);
    }

    fn reply_recorded_frame(&mut self) {
        match self.recorder.read_frame() {
            Ok(Some((vertices, colors))) => self.send_event(Outbound::RecordedFrame {
                vertices,
                colors,
                no_more_frames: false,
            }),
            Ok(None) => self.send_event(Outbound::RecordedFrame {
                vertices: Vec::new(),
                colors: Vec::new(),
                no_more_frames: true,
            }),
            Err(e) => {
                log::warn!("failed to read recorded frame: {e}");
                self.send_event(Outbound::RecordedFrame {
                    vertices: Vec::new(),
                    colors: Vec::new(),
                    no_more_frames: true,
                });
            }
        }
    }

    fn update_frame(&mut self) {
        if !self.adapter.acquire_frame(self.calibrate_requested) {
            return;
        }

        if self.calibrate_requested {
            self.try_calibrate();
        }

        self.process_frame();

        if let Some(detection) = self.adapter.take_document() {
            self.process_document(detection);
        }

        if self.record_frame_requested {
            let snapshot = Arc::clone(&self.last_frame);
            match self.recorder.write_frame(
                &snapshot.vertices,
                &snapshot.colors,
                self.adapter.timestamp_us(),
                self.adapter.device_index(),
            ) {
                Ok(()) => self.send_event(Outbound::Recorded),
                Err(e) => log::warn!("failed to record frame: {e}"),
            }
            self.record_frame_requested = false;
        }
    }

    fn try_calibrate(&mut self) {
        let (width, height) = self.adapter.depth_resolution();
        let vertices = self.adapter.vertices.clone();
        let colors = self.adapter.colors.clone();

        match self.calibration.calibrate(&colors, &vertices, width, height) {
            Ok(()) => {
                if let Err(e) = self.calibration.save(self.adapter.serial_number()) {
                    log::warn!("failed to persist calibration: {e}");
                }
                self.queue_confirm_calibrated();
                self.calibrate_requested = false;
            }
            Err(CalibrationError::SamplesPending {
                collected,
                required,
            }) => log::debug!("calibration sample {collected}/{required}"),
            Err(e) => log::debug!("calibration attempt failed: {e}"),
        }
    }

    /// Per-frame point processing: world transform, bounds cull, voxel
    /// dedup, density cull, compaction, optional KNN filter, and the
    /// millimeter conversion for the outbound snapshot.
    fn process_frame(&mut self) {
        let world = self.calibration.world_transform();
        let calibrated = self.calibration.is_calibrated;

        self.voxel_grid.reset();

        let mut all = Vec::with_capacity(self.adapter.vertices.len());
        for &vertex in &self.adapter.vertices {
            let p = if calibrated { world.apply(vertex) } else { vertex };

            let outside = p.x < self.bounds_min[0]
                || p.x > self.bounds_max[0]
                || p.y < self.bounds_min[1]
                || p.y > self.bounds_max[1]
                || p.z < self.bounds_min[2]
                || p.z > self.bounds_max[2];
            if outside || !self.voxel_grid.insert(p.x, p.y, p.z) {
                all.push(Point3f::invalid());
                continue;
            }

            all.push(p);
        }

        mark_sparse_voxels(
            &mut all,
            self.config.density.voxel_size,
            self.config.density.min_points_per_voxel,
        );

        let mut vertices = Vec::new();
        let mut colors = Vec::new();
        for (p, &c) in all.iter().zip(&self.adapter.colors) {
            if !p.invalid {
                vertices.push(*p);
                colors.push(c);
            }
        }

        if self.filter_enabled {
            remove_outliers(
                &mut vertices,
                &mut colors,
                self.filter_neighbors,
                self.filter_threshold,
            );
        }

        let packed: Vec<Point3s> = vertices.iter().map(|p| p.to_millimeters()).collect();
        self.last_frame = Arc::new(FrameSnapshot {
            vertices: packed,
            colors,
            timestamp_us: self.adapter.timestamp_us(),
        });
    }

    /// Change gating before a document detection goes upstream: resend on
    /// timeout, on a large pixel difference, or on a better score.
    fn process_document(&mut self, detection: DocumentDetection) {
        let diff = match self.document_gate.last_image.as_ref() {
            Some(previous) => image_difference(previous, &detection.image),
            None => 1.0,
        };
        let first = self.document_gate.last_image.is_none();
        self.document_gate.last_image = Some(detection.image.clone());

        let timed_out = self
            .document_gate
            .last_sent
            .map(|at| at.elapsed() >= self.config.document.send_timeout)
            .unwrap_or(true);

        if first
            || timed_out
            || diff > self.config.document.diff_threshold
            || detection.score > self.document_gate.last_score
        {
            self.document_gate.last_score = detection.score;
            self.document_gate.last_sent = Some(Instant::now());
            self.send_event(Outbound::Document {
                image: detection.image,
                score: detection.score,
            });
        }
    }

    fn enable_sync(&mut self, state: SyncState, offset: i32) {
        match state {
            SyncState::Subordinate => {
                self.sync_state = SyncState::Subordinate;
                if !self.adapter.close() {
                    log::error!("subordinate device failed to close");
                    return;
                }
                if !self.adapter.initialize(SyncState::Subordinate, offset) {
                    log::error!("subordinate device failed to reinitialize");
                    return;
                }
                self.send_event(Outbound::SyncStateChanged(SyncState::Subordinate));
            }
            SyncState::Master => {
                self.sync_state = SyncState::Master;
                if !self.adapter.close() {
                    log::error!("master device failed to close");
                    return;
                }
                // Stays closed until StartMaster arrives; subordinates
                // must be listening before the master emits triggers.
                self.send_event(Outbound::SyncStateChanged(SyncState::Master));
            }
            SyncState::Standalone => self.restart_standalone(),
        }
    }

    fn restart_standalone(&mut self) {
        self.sync_state = SyncState::Standalone;
        if !self.adapter.close() {
            log::error!("capture device failed to close");
            return;
        }
        if !self.adapter.initialize(SyncState::Standalone, 0) {
            log::error!("capture device failed to reinitialize");
            return;
        }
        self.send_event(Outbound::SyncStateChanged(SyncState::Standalone));
    }

    fn start_master(&mut self) {
        if self.sync_state != SyncState::Master {
            return;
        }
        if !self.adapter.initialize(SyncState::Master, 0) {
            log::error!("master device failed to restart");
            return;
        }
        self.send_event(Outbound::MasterRestart);
    }

    fn queue_confirm_calibrated(&mut self) {
        let transform = self.calibration.world_transform();
        self.send_event(Outbound::Calibrated {
            marker_id: self.calibration.used_marker_id,
            rotation: transform.rotation_row_major(),
            translation: transform.translation_array(),
        });
    }

    fn send_event(&self, event: Outbound) {
        let _ = self.events_tx.send(event);
    }
}

/// Invoke the sink for one queued event.
fn dispatch_event(event: Outbound, sink: &dyn EventSink, client_index: usize) {
    match event {
        Outbound::SerialNumber(serial) => sink.send_serial_number(client_index, &serial),
        Outbound::Recorded => sink.confirm_recorded(client_index),
        Outbound::Calibrated {
            marker_id,
            rotation,
            translation,
        } => sink.confirm_calibrated(client_index, marker_id, &rotation, &translation),
        Outbound::LatestFrame(snapshot) => {
            let count = checked_count(snapshot.vertices.len(), snapshot.colors.len());
            sink.send_latest_frame(
                client_index,
                &snapshot.vertices[..count],
                &snapshot.colors[..count],
            );
        }
        Outbound::RecordedFrame {
            vertices,
            colors,
            no_more_frames,
        } => {
            let count = checked_count(vertices.len(), colors.len());
            sink.send_recorded_frame(client_index, &vertices[..count], &colors[..count], no_more_frames);
        }
        Outbound::SyncStateChanged(state) => sink.confirm_sync_state(client_index, state),
        Outbound::MasterRestart => sink.confirm_master_restart(client_index),
        Outbound::Document { image, score } => sink.send_document(client_index, &image, score),
    }
}

/// Vertex and color counts should always match; if they ever diverge,
/// send the shorter prefix rather than reading past a buffer.
fn checked_count(vertices: usize, colors: usize) -> usize {
    if vertices != colors {
        log::warn!("size mismatch: {vertices} vertices vs {colors} colors, sending the smaller");
    }
    vertices.min(colors)
}

/// Normalized mean absolute pixel difference in [0, 1]; the stored image
/// is resized to the new one's dimensions first.
fn image_difference(previous: &RgbImage, current: &RgbImage) -> f32 {
    let (w, h) = (current.width(), current.height());
    if w == 0 || h == 0 {
        return 1.0;
    }

    let resized = imageops::resize(previous, w, h, FilterType::Triangle);

    let mut total = 0.0f64;
    for (a, b) in resized.pixels().zip(current.pixels()) {
        let dr = (a.0[0] as f32 - b.0[0] as f32).abs();
        let dg = (a.0[1] as f32 - b.0[1] as f32).abs();
        let db = (a.0[2] as f32 - b.0[2] as f32).abs();
        total += (0.299 * dr + 0.587 * dg + 0.114 * db) as f64;
    }

    (total / (w as f64 * h as f64) / 255.0) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_images_have_no_difference() {
        let img = RgbImage::from_pixel(8, 8, image::Rgb([120, 50, 10]));
        assert!(image_difference(&img, &img) < 1e-6);
    }

    #[test]
    fn opposite_images_differ_maximally() {
        let black = RgbImage::from_pixel(8, 8, image::Rgb([0, 0, 0]));
        let white = RgbImage::from_pixel(8, 8, image::Rgb([255, 255, 255]));
        assert!(image_difference(&black, &white) > 0.99);
    }

    #[test]
    fn mismatched_sizes_are_resized_before_comparing() {
        let small = RgbImage::from_pixel(4, 4, image::Rgb([200, 200, 200]));
        let large = RgbImage::from_pixel(16, 16, image::Rgb([200, 200, 200]));
        assert!(image_difference(&small, &large) < 0.01);
    }

    #[test]
    fn checked_count_uses_the_smaller_side() {
        assert_eq!(checked_count(5, 5), 5);
        assert_eq!(checked_count(5, 3), 3);
        assert_eq!(checked_count(2, 9), 2);
    }
}
