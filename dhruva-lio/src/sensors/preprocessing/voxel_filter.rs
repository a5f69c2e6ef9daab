//! Centroid voxel-grid downsampling.

use std::collections::BTreeMap;

use nalgebra::Vector3;

use crate::core::types::{Point3D, PointCloud3D};

/// Downsamples a cloud to one centroid per occupied voxel.
///
/// Output points are ordered by voxel index, which keeps consecutive
/// frames of a static scene sampling the same cells in the same order.
#[derive(Debug, Clone, Copy)]
pub struct VoxelDownsampler {
    leaf_size: f64,
}

impl VoxelDownsampler {
    /// Create a downsampler with the given leaf size in metres.
    /// A non-positive leaf size passes clouds through unchanged.
    pub fn new(leaf_size: f64) -> Self {
        Self { leaf_size }
    }

    /// The configured leaf size.
    #[inline]
    pub fn leaf_size(&self) -> f64 {
        self.leaf_size
    }

    /// Reduce `cloud` to per-voxel centroids.
    pub fn apply(&self, cloud: &PointCloud3D) -> PointCloud3D {
        if self.leaf_size <= 0.0 || cloud.is_empty() {
            return cloud.clone();
        }

        struct Accum {
            position_sum: Vector3<f64>,
            intensity_sum: f64,
            count: usize,
        }

        let mut cells: BTreeMap<(i64, i64, i64), Accum> = BTreeMap::new();
        for point in cloud {
            let key = (
                (point.position.x / self.leaf_size).floor() as i64,
                (point.position.y / self.leaf_size).floor() as i64,
                (point.position.z / self.leaf_size).floor() as i64,
            );
            let cell = cells.entry(key).or_insert(Accum {
                position_sum: Vector3::zeros(),
                intensity_sum: 0.0,
                count: 0,
            });
            cell.position_sum += point.position;
            cell.intensity_sum += point.intensity as f64;
            cell.count += 1;
        }

        let mut out = PointCloud3D::with_capacity(cells.len());
        for cell in cells.values() {
            let inv = 1.0 / cell.count as f64;
            out.push(Point3D {
                position: cell.position_sum * inv,
                intensity: (cell.intensity_sum * inv) as f32,
                time_offset: 0.0,
            });
        }
        out
    }
}
