//! High-level facade crate for the `rigscan-*` workspace.
//!
//! Re-exports the client surface plus the geometry and point cloud
//! primitives a host typically touches.

pub use rigscan_client as client;
pub use rigscan_cloud as cloud;
pub use rigscan_core as core;
pub use rigscan_marker as marker;

pub use rigscan_client::{
    CameraSettings, Client, ClientConfig, ClientController, ClientHandle, EventSink, MarkerPose,
    SyncState,
};
pub use rigscan_cloud::{align, VoxelGrid};
pub use rigscan_core::{AffineTransform, Point2f, Point3f, Point3s, Rgb};
pub use rigscan_marker::{MarkerDetector, MarkerInfo};
