//! End-to-end pipeline scenarios over the synthetic sensor stack.

use rigscan_client::config::{
    CaptureConfig, ClientConfig, DensityConfig, DocumentGateConfig, VoxelGridConfig,
};
use rigscan_client::test_support::{
    aligned_camera, RecordingSink, SinkEvent, SyntheticDevice, SyntheticDriver,
};
use rigscan_client::{CameraSettings, Client, MarkerPose, SyncState};
use rigscan_core::{Point3s, Rgb};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn fast_capture() -> CaptureConfig {
    CaptureConfig {
        acquire_timeout: Duration::from_millis(50),
        first_frame_deadline: Duration::from_secs(2),
        settle_delay: Duration::ZERO,
        close_delay: Duration::ZERO,
        // Keep the document worker quiet unless a test wants it.
        document_submit_interval: Duration::from_secs(3600),
    }
}

fn test_config(dir: &Path, voxel: VoxelGridConfig, density: DensityConfig) -> ClientConfig {
    ClientConfig {
        voxel,
        density,
        document: DocumentGateConfig::default(),
        capture: fast_capture(),
        storage_dir: dir.to_path_buf(),
    }
}

/// Bounds wide open around the synthetic scene at z = 1.
fn wide_settings() -> CameraSettings {
    CameraSettings {
        min_bounds: [-1.0, -1.0, 0.0],
        max_bounds: [1.0, 1.0, 2.0],
        ..CameraSettings::default()
    }
}

/// A 2x2 device at z = 1 m whose vertex grid is exact in f32:
/// fx = fy = 128 puts the pixels at x,y in {0, 1/128}.
fn tiny_device() -> SyntheticDevice {
    SyntheticDevice::with_resolution("SN-TINY", 2, 2, aligned_camera(128.0, 128.0, 0.0, 0.0))
}

fn push_flat_frames(device: &SyntheticDevice, count: usize, first_timestamp: u64) {
    let (w, h) = (2, 2);
    let colors = vec![Rgb::new(200, 200, 200); w * h];
    let depth = vec![1000u16; w * h];
    for i in 0..count {
        device.push_frame(&colors, &depth, first_timestamp + i as u64);
    }
}

fn latest_frames(sink: &RecordingSink) -> Vec<(Vec<Point3s>, Vec<Rgb>)> {
    sink.events()
        .into_iter()
        .filter_map(|e| match e {
            SinkEvent::LatestFrame { vertices, colors } => Some((vertices, colors)),
            _ => None,
        })
        .collect()
}

#[test]
fn pipeline_produces_exact_millimeter_points() {
    let dir = tempfile::tempdir().expect("tempdir");
    let device = tiny_device();
    push_flat_frames(&device, 4, 100);

    let sink = Arc::new(RecordingSink::default());
    let mut client = Client::new(
        Box::new(SyntheticDriver::single(device)),
        0,
        sink.clone(),
        test_config(
            dir.path(),
            VoxelGridConfig {
                voxel_size: 0.001,
                center: [0.0, 0.0, 1.0],
                half_range: 0.05,
            },
            DensityConfig {
                voxel_size: 0.006,
                min_points_per_voxel: 1,
            },
        ),
    );

    client.initialize();
    let controller = client.controller();
    controller.set_settings(wide_settings());
    client.process_once();
    controller.request_latest_frame();
    client.process_once();
    client.dispatch_pending_events();

    let frames = latest_frames(&sink);
    let (vertices, colors) = frames.last().expect("latest frame event");

    // 1/128 m = 7.8125 mm, truncated to 7 mm; row-major pixel order.
    let expected = vec![
        Point3s::new(0, 0, 1000),
        Point3s::new(7, 0, 1000),
        Point3s::new(0, 7, 1000),
        Point3s::new(7, 7, 1000),
    ];
    assert_eq!(vertices, &expected);
    assert_eq!(colors.len(), 4);
}

#[test]
fn voxel_deduplication_keeps_one_point_per_cell() {
    let dir = tempfile::tempdir().expect("tempdir");
    let device = tiny_device();
    push_flat_frames(&device, 4, 100);

    let sink = Arc::new(RecordingSink::default());
    let mut client = Client::new(
        Box::new(SyntheticDriver::single(device)),
        0,
        sink.clone(),
        test_config(
            dir.path(),
            // One coarse voxel swallows the whole 2x2 neighbourhood.
            VoxelGridConfig {
                voxel_size: 0.1,
                center: [0.0, 0.0, 1.0],
                half_range: 0.2,
            },
            DensityConfig {
                voxel_size: 0.006,
                min_points_per_voxel: 1,
            },
        ),
    );

    client.initialize();
    let controller = client.controller();
    controller.set_settings(wide_settings());
    client.process_once();
    controller.request_latest_frame();
    client.process_once();
    client.dispatch_pending_events();

    let frames = latest_frames(&sink);
    let (vertices, _) = frames.last().expect("latest frame event");
    assert_eq!(vertices.len(), 1);
}

#[test]
fn out_of_bounds_points_never_survive() {
    let dir = tempfile::tempdir().expect("tempdir");
    let device = tiny_device();
    push_flat_frames(&device, 4, 100);

    let sink = Arc::new(RecordingSink::default());
    let mut client = Client::new(
        Box::new(SyntheticDriver::single(device)),
        0,
        sink.clone(),
        test_config(
            dir.path(),
            VoxelGridConfig {
                voxel_size: 0.001,
                center: [0.0, 0.0, 1.0],
                half_range: 0.05,
            },
            DensityConfig {
                voxel_size: 0.006,
                min_points_per_voxel: 1,
            },
        ),
    );

    client.initialize();
    let controller = client.controller();
    // The scene sits at z = 1, outside these bounds.
    controller.set_settings(CameraSettings {
        min_bounds: [-1.0, -1.0, 0.0],
        max_bounds: [1.0, 1.0, 0.5],
        ..CameraSettings::default()
    });
    client.process_once();
    controller.request_latest_frame();
    client.process_once();
    client.dispatch_pending_events();

    let frames = latest_frames(&sink);
    let (vertices, _) = frames.last().expect("latest frame event");
    assert!(vertices.is_empty());
}

#[test]
fn recording_flow_confirms_and_replays_frames() {
    let dir = tempfile::tempdir().expect("tempdir");
    let device = tiny_device();
    push_flat_frames(&device, 8, 100);

    let sink = Arc::new(RecordingSink::default());
    let mut client = Client::new(
        Box::new(SyntheticDriver::single(device)),
        0,
        sink.clone(),
        test_config(
            dir.path(),
            VoxelGridConfig {
                voxel_size: 0.001,
                center: [0.0, 0.0, 1.0],
                half_range: 0.05,
            },
            DensityConfig {
                voxel_size: 0.006,
                min_points_per_voxel: 1,
            },
        ),
    );

    client.initialize();
    let controller = client.controller();
    controller.set_settings(wide_settings());
    client.process_once();

    controller.start_frame_recording();
    client.process_once();

    controller.request_recorded_frame();
    client.process_once();
    controller.request_recorded_frame();
    client.process_once();
    client.dispatch_pending_events();

    let events = sink.events();
    assert!(events.iter().any(|e| matches!(e, SinkEvent::Recorded)));

    let replays: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            SinkEvent::RecordedFrame {
                vertices,
                no_more_frames,
                ..
            } => Some((vertices.len(), *no_more_frames)),
            _ => None,
        })
        .collect();

    assert_eq!(replays.len(), 2);
    assert_eq!(replays[0], (4, false));
    assert_eq!(replays[1], (0, true));
}

#[test]
fn calibration_confirms_exactly_once_with_the_marker_id() {
    let dir = tempfile::tempdir().expect("tempdir");

    let size = 200usize;
    let device = SyntheticDevice::with_resolution(
        "SN-CAL",
        size,
        size,
        aligned_camera(100.0, 100.0, 100.0, 100.0),
    );

    let colors = rigscan_marker::test_utils::render_marker(7, 30.0, (100.0, 100.0), size, size);
    let depth = vec![1000u16; size * size];
    for i in 0..30 {
        device.push_frame(&colors, &depth, 100 + i);
    }

    let sink = Arc::new(RecordingSink::default());
    let mut client = Client::new(
        Box::new(SyntheticDriver::single(device)),
        0,
        sink.clone(),
        test_config(
            dir.path(),
            VoxelGridConfig::default(),
            DensityConfig::default(),
        ),
    );

    client.initialize();
    let controller = client.controller();
    controller.set_settings(CameraSettings {
        marker_poses: vec![MarkerPose::identity(7)],
        ..wide_settings()
    });
    controller.calibrate();

    for _ in 0..25 {
        client.process_once();
    }
    client.dispatch_pending_events();

    let calibrated: Vec<_> = sink
        .events()
        .into_iter()
        .filter_map(|e| match e {
            SinkEvent::Calibrated {
                marker_id,
                rotation,
                ..
            } => Some((marker_id, rotation)),
            _ => None,
        })
        .collect();

    assert_eq!(calibrated.len(), 1, "exactly one calibration confirmation");
    let (marker_id, rotation) = &calibrated[0];
    assert_eq!(*marker_id, 7);

    // The recovered world rotation must be orthonormal with det +1.
    let r = nalgebra::Matrix3::from_row_slice(rotation);
    let orthogonality = (r * r.transpose() - nalgebra::Matrix3::identity()).norm();
    assert!(orthogonality < 1e-3, "R R^T deviates by {orthogonality}");
    assert!((r.determinant() - 1.0).abs() < 1e-3);

    // The calibration is persisted for the device serial.
    assert!(dir.path().join("calibration_SN-CAL.txt").exists());
}

#[test]
fn sync_transitions_confirm_and_reinitialize() {
    let dir = tempfile::tempdir().expect("tempdir");
    let device = tiny_device();
    push_flat_frames(&device, 30, 100);
    let probe = device.clone();

    let sink = Arc::new(RecordingSink::default());
    let mut client = Client::new(
        Box::new(SyntheticDriver::single(device)),
        0,
        sink.clone(),
        test_config(
            dir.path(),
            VoxelGridConfig::default(),
            DensityConfig::default(),
        ),
    );

    client.initialize();
    let controller = client.controller();

    // Subordinate with offset 3: 480 us trigger delay, no first-frame wait.
    controller.enable_sync(SyncState::Subordinate, 3);
    client.process_once();
    assert_eq!(client.sync_state(), SyncState::Subordinate);
    assert!(client.is_device_initialized());
    assert_eq!(
        probe.last_sync_mode(),
        Some(rigscan_client::sensor::DeviceSyncMode::Secondary {
            trigger_delay_us: 480
        })
    );

    // Back to standalone: closed, reopened, confirmed.
    controller.enable_sync(SyncState::Standalone, 0);
    client.process_once();
    assert_eq!(client.sync_state(), SyncState::Standalone);
    assert!(client.is_device_initialized());

    // Master: stays closed until StartMaster.
    controller.enable_sync(SyncState::Master, 0);
    client.process_once();
    assert_eq!(client.sync_state(), SyncState::Master);
    assert!(!client.is_device_initialized());

    controller.start_master();
    client.process_once();
    assert!(client.is_device_initialized());

    // Re-entering the current state still confirms.
    controller.enable_sync(SyncState::Standalone, 0);
    client.process_once();
    controller.enable_sync(SyncState::Standalone, 0);
    client.process_once();
    client.dispatch_pending_events();

    let sync_events: Vec<_> = sink
        .events()
        .into_iter()
        .filter_map(|e| match e {
            SinkEvent::SyncState(state) => Some(state),
            SinkEvent::MasterRestart => Some(SyncState::Master),
            _ => None,
        })
        .collect();

    assert_eq!(
        sync_events,
        vec![
            SyncState::Subordinate,
            SyncState::Standalone,
            SyncState::Master, // confirm-sync-state for the master role
            SyncState::Master, // confirm-master-restart
            SyncState::Standalone,
            SyncState::Standalone,
        ]
    );
}

#[test]
fn spawned_client_reports_its_serial_number() {
    let dir = tempfile::tempdir().expect("tempdir");
    let device = tiny_device();
    push_flat_frames(&device, 50, 100);

    let sink = Arc::new(RecordingSink::default());
    let client = Client::new(
        Box::new(SyntheticDriver::single(device)),
        0,
        sink.clone(),
        test_config(
            dir.path(),
            VoxelGridConfig::default(),
            DensityConfig::default(),
        ),
    );

    let handle = client.spawn().expect("spawn client thread");

    let mut seen = false;
    for _ in 0..200 {
        if sink
            .events()
            .iter()
            .any(|e| matches!(e, SinkEvent::SerialNumber(s) if s == "SN-TINY"))
        {
            seen = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(25));
    }

    handle.stop();
    assert!(seen, "serial number callback was delivered");
}
