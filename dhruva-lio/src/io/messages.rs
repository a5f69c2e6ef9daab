//! Output message types emitted per processed frame.

use nalgebra::{SMatrix, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::core::types::PointCloud3D;

/// A pose with its timestamp, as accumulated into the trajectory.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PoseStamped {
    /// Scan-end time of the frame that produced this pose, seconds.
    pub timestamp: f64,
    /// Position in the world frame, metres.
    pub position: Vector3<f64>,
    /// Orientation in the world frame.
    pub orientation: UnitQuaternion<f64>,
}

/// Odometry estimate for one frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OdometryMessage {
    /// Scan-end time, seconds.
    pub timestamp: f64,
    /// Position in the world frame, metres.
    pub position: Vector3<f64>,
    /// Orientation in the world frame.
    pub orientation: UnitQuaternion<f64>,
    /// Pose covariance, ordered [translation, rotation] row-major.
    pub covariance: SMatrix<f64, 6, 6>,
}

/// The world → base coordinate-frame relation at a frame's end time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FrameTransform {
    pub timestamp: f64,
    pub translation: Vector3<f64>,
    pub rotation: UnitQuaternion<f64>,
}

/// Everything one driver tick emits downstream.
#[derive(Debug, Clone)]
pub struct FrameOutput {
    pub odometry: OdometryMessage,
    pub transform: FrameTransform,
    /// De-skewed scan in the world frame (dense or downsampled per the
    /// publish configuration). `None` when scan publishing is disabled.
    pub scan_world: Option<PointCloud3D>,
    /// De-skewed scan in the IMU body frame.
    pub scan_body: Option<PointCloud3D>,
    /// World-frame points that contributed effective correspondences.
    pub scan_effect: Option<PointCloud3D>,
    /// Observability condition number per filter iteration.
    pub condition_numbers: Vec<f64>,
}
