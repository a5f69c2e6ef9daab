//! DhruvaLIO - Tightly-coupled LiDAR-inertial odometry
//!
//! Estimates the 6-DoF pose of a LiDAR+IMU platform at scan rate while
//! growing an incremental voxel map used as the registration target.
//!
//! # Architecture
//!
//! The crate is organized into 5 logical layers:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                      io/                            │  ← Messages, persistence
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │                    engine/                          │  ← Orchestration
//! │               (sync, pipeline driver)               │
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │                  algorithms/                        │  ← Core algorithms
//! │            (ieskf, matching, mapping)               │
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │                   sensors/                          │  ← Sensor processing
//! │              (imu, preprocessing)                   │
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │                     core/                           │  ← Foundation
//! │                 (types, math)                       │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! # Data flow per frame
//!
//! raw scan + IMU window → synchroniser → IMU propagation and per-point
//! de-skew → voxel downsampling → iterated error-state Kalman update
//! against point-to-plane correspondences from the incremental voxel map
//! → map increment → odometry, path and registered-scan outputs.
//!
//! # Example
//!
//! ```ignore
//! use dhruva_lio::{LioConfig, LioEngine};
//!
//! let mut engine = LioEngine::new(LioConfig::default())?;
//! let intake = engine.intake();          // hand to the transport layer
//! engine.start();
//! loop {
//!     if let Some(frame) = engine.run_once() {
//!         println!("pose: {}", frame.odometry.position);
//!     }
//! }
//! ```

// ============================================================================
// Layer 1: Core foundation (no internal deps)
// ============================================================================
pub mod core;

// ============================================================================
// Layer 2: Sensor processing (depends on core)
// ============================================================================
pub mod sensors;

// ============================================================================
// Layer 3: Algorithms (depends on core, sensors)
// ============================================================================
pub mod algorithms;

// ============================================================================
// Layer 4: Engine (depends on core, sensors, algorithms)
// ============================================================================
pub mod engine;

// ============================================================================
// Layer 5: I/O (depends on all layers)
// ============================================================================
pub mod io;

pub mod config;
pub mod error;

// ============================================================================
// Convenience re-exports (flat namespace for common use)
// ============================================================================

// Configuration and errors
pub use config::{LidarType, LioConfig, NearbyType};
pub use error::{ConfigError, LioError, Result};

// Core types
pub use crate::core::math;
pub use crate::core::types::{
    ErrorVector, ImuReading, MeasureBundle, NavState, Point3D, PointCloud3D, StateCov,
};

// Sensors
pub use sensors::imu::{ImuProcessor, ImuProcessorConfig};
pub use sensors::preprocessing::{
    PointDecoder, PointDecoderConfig, RawPoint, RawScanFrame, VoxelDownsampler,
};

// Algorithms
pub use algorithms::ieskf::{
    Ieskf, IeskfConfig, Observation, ObservationModel, UpdateOutcome,
};
pub use algorithms::mapping::{IVox, IVoxConfig, VoxelIndex};
pub use algorithms::matching::{
    Correspondence, Plane3D, PointToPlaneConfig, PointToPlaneObserver,
};

// Engine
pub use engine::{EngineState, LioEngine, MeasureSync, SensorIntake, SyncConfig};

// I/O
pub use io::{FrameOutput, FrameTransform, OdometryMessage, PoseStamped};
