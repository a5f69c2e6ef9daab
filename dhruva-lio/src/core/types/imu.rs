//! Inertial measurement types.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use super::point::PointCloud3D;

/// One IMU sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImuReading {
    /// Sample timestamp in seconds.
    pub timestamp: f64,
    /// Angular velocity in rad/s, body frame.
    pub angular_velocity: Vector3<f64>,
    /// Specific force in m/s², body frame.
    pub linear_acceleration: Vector3<f64>,
}

impl ImuReading {
    /// Create a reading.
    #[inline]
    pub fn new(
        timestamp: f64,
        angular_velocity: Vector3<f64>,
        linear_acceleration: Vector3<f64>,
    ) -> Self {
        Self {
            timestamp,
            angular_velocity,
            linear_acceleration,
        }
    }
}

/// One LiDAR scan paired with the IMU window that covers it.
///
/// Produced by the synchroniser. `imu` is ordered by timestamp and spans
/// `[scan_time, scan_end_time]`; the scan's points carry per-point time
/// offsets relative to `scan_time`.
#[derive(Debug, Clone, Default)]
pub struct MeasureBundle {
    /// The raw (not yet de-skewed) scan in the lidar frame.
    pub scan: PointCloud3D,
    /// Bag time of the scan start, seconds.
    pub scan_time: f64,
    /// Estimated scan end time, seconds.
    pub scan_end_time: f64,
    /// IMU samples covering the scan interval, oldest first.
    pub imu: Vec<ImuReading>,
}

impl MeasureBundle {
    /// Scan duration in seconds.
    #[inline]
    pub fn duration(&self) -> f64 {
        self.scan_end_time - self.scan_time
    }
}
