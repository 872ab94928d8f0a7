//! The per-camera client of a distributed 3D capture rig.
//!
//! One [`Client`] binds to one depth+color sensor, turns raw frames into a
//! world-space point cloud, optionally detects a planar document in the
//! color frame, and hands results to the coordinating host through the
//! [`EventSink`] callback surface. Multi-device capture is coordinated by
//! the host through the sync control calls (see [`ClientController`]).
//!
//! The sensor SDK itself sits behind the [`sensor::DepthSensor`] and
//! [`sensor::SensorDriver`] traits; [`test_support`] ships a deterministic
//! in-memory implementation.

pub mod calibration;
pub mod capture;
pub mod client;
pub mod config;
pub mod document;
pub mod events;
pub mod recording;
pub mod sensor;
pub mod settings;
pub mod test_support;

pub use calibration::{Calibration, CalibrationError};
pub use capture::CaptureAdapter;
pub use client::{Client, ClientController, ClientHandle, ControlRequest, FrameSnapshot};
pub use config::ClientConfig;
pub use document::{DocumentDetection, DocumentDetector, DocumentFrame};
pub use events::EventSink;
pub use recording::FrameRecorder;
pub use sensor::{DepthSensor, SensorDriver, SyncState};
pub use settings::{CameraSettings, MarkerPose};
