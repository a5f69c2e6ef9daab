//! Point and point-cloud types for 3D LiDAR processing.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// A single LiDAR return.
///
/// Positions are metres in whatever frame the surrounding code declares
/// (lidar, IMU body or world); `time_offset` is seconds since the start of
/// the scan the point belongs to and drives motion compensation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point3D {
    /// Position in metres.
    pub position: Vector3<f64>,
    /// Return intensity (sensor units).
    pub intensity: f32,
    /// Seconds since scan start.
    pub time_offset: f64,
}

impl Point3D {
    /// Create a point with zero time offset.
    #[inline]
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self {
            position: Vector3::new(x, y, z),
            intensity: 0.0,
            time_offset: 0.0,
        }
    }

    /// Create a point with an explicit time offset.
    #[inline]
    pub fn with_time(x: f64, y: f64, z: f64, time_offset: f64) -> Self {
        Self {
            position: Vector3::new(x, y, z),
            intensity: 0.0,
            time_offset,
        }
    }

    /// Squared distance to another point (avoids sqrt).
    #[inline]
    pub fn distance_squared(&self, other: &Point3D) -> f64 {
        (self.position - other.position).norm_squared()
    }
}

/// An owned collection of LiDAR points.
///
/// Thin wrapper over `Vec<Point3D>` so clouds read as a domain type rather
/// than a bare vector, mirroring how scans flow through the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PointCloud3D {
    /// The points, in acquisition order.
    pub points: Vec<Point3D>,
}

impl PointCloud3D {
    /// Create an empty cloud.
    #[inline]
    pub fn new() -> Self {
        Self { points: Vec::new() }
    }

    /// Create an empty cloud with reserved capacity.
    #[inline]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            points: Vec::with_capacity(capacity),
        }
    }

    /// Number of points.
    #[inline]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Whether the cloud holds no points.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Append a point.
    #[inline]
    pub fn push(&mut self, point: Point3D) {
        self.points.push(point);
    }

    /// Remove all points, keeping the allocation.
    #[inline]
    pub fn clear(&mut self) {
        self.points.clear();
    }

    /// Iterate over the points.
    #[inline]
    pub fn iter(&self) -> std::slice::Iter<'_, Point3D> {
        self.points.iter()
    }

    /// Largest per-point time offset, or zero for an empty cloud.
    pub fn max_time_offset(&self) -> f64 {
        self.points
            .iter()
            .map(|p| p.time_offset)
            .fold(0.0, f64::max)
    }
}

impl FromIterator<Point3D> for PointCloud3D {
    fn from_iter<I: IntoIterator<Item = Point3D>>(iter: I) -> Self {
        Self {
            points: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a PointCloud3D {
    type Item = &'a Point3D;
    type IntoIter = std::slice::Iter<'a, Point3D>;

    fn into_iter(self) -> Self::IntoIter {
        self.points.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_distance_squared() {
        let a = Point3D::new(0.0, 0.0, 0.0);
        let b = Point3D::new(1.0, 2.0, 2.0);
        assert_relative_eq!(a.distance_squared(&b), 9.0);
    }

    #[test]
    fn test_max_time_offset() {
        let mut cloud = PointCloud3D::new();
        assert_relative_eq!(cloud.max_time_offset(), 0.0);
        cloud.push(Point3D::with_time(0.0, 0.0, 0.0, 0.02));
        cloud.push(Point3D::with_time(1.0, 0.0, 0.0, 0.09));
        cloud.push(Point3D::with_time(2.0, 0.0, 0.0, 0.05));
        assert_relative_eq!(cloud.max_time_offset(), 0.09);
    }

    #[test]
    fn test_collect_from_iterator() {
        let cloud: PointCloud3D = (0..5).map(|i| Point3D::new(i as f64, 0.0, 0.0)).collect();
        assert_eq!(cloud.len(), 5);
    }
}
