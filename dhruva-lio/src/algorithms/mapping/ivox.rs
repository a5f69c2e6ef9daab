//! Incremental sparse voxel grid (iVox).
//!
//! The registration target: a hash map from integer voxel coordinates to
//! small unordered point sets. Supports k-nearest-neighbour queries over a
//! configurable neighbourhood of adjacent voxels and downsample-aware point
//! insertion. The map only grows (bounded by the operational area); it is
//! cleared solely by an explicit [`reset`](IVox::reset).
//!
//! Voxel keys hash with the spatial hash of Teschner et al., "Optimized
//! Spatial Hashing for Collision Detection of Deformable Objects", VMV 2003.

use std::collections::BinaryHeap;
use std::hash::{Hash, Hasher};

use nalgebra::Vector3;
use nohash_hasher::IntMap;

use crate::config::NearbyType;
use crate::core::types::Point3D;

/// Distance tolerance of the insertion policy, metres.
const DOWNSAMPLE_EPS: f64 = 1e-6;

/// Construction-time options of the voxel map.
#[derive(Debug, Clone, Copy)]
pub struct IVoxConfig {
    /// Edge length of a voxel in metres.
    pub resolution: f64,
    /// Which adjacent voxels a query searches.
    pub nearby_type: NearbyType,
    /// Neighbour count used by both the kNN queries and the insertion
    /// downsample policy.
    pub max_match_points: usize,
}

impl Default for IVoxConfig {
    fn default() -> Self {
        Self {
            resolution: 0.2,
            nearby_type: NearbyType::Nearby18,
            max_match_points: 5,
        }
    }
}

/// Integer lattice coordinates of a voxel: componentwise `⌊p / r⌋`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoxelIndex {
    pub x: i64,
    pub y: i64,
    pub z: i64,
}

impl VoxelIndex {
    /// Voxel containing `p` at resolution `r`.
    #[inline]
    pub fn of(p: &Vector3<f64>, resolution: f64) -> Self {
        Self {
            x: (p.x / resolution).floor() as i64,
            y: (p.y / resolution).floor() as i64,
            z: (p.z / resolution).floor() as i64,
        }
    }

    /// Centre of this voxel in world coordinates.
    #[inline]
    pub fn centre(&self, resolution: f64) -> Vector3<f64> {
        Vector3::new(
            (self.x as f64 + 0.5) * resolution,
            (self.y as f64 + 0.5) * resolution,
            (self.z as f64 + 0.5) * resolution,
        )
    }

    #[inline]
    fn offset(&self, d: [i64; 3]) -> Self {
        Self {
            x: self.x + d[0],
            y: self.y + d[1],
            z: self.z + d[2],
        }
    }
}

impl Hash for VoxelIndex {
    fn hash<H: Hasher>(&self, hasher: &mut H) {
        hasher.write_i64(
            self.x.wrapping_mul(73_856_093)
                ^ self.y.wrapping_mul(471_943)
                ^ self.z.wrapping_mul(83_492_791),
        );
    }
}

/// The `Hash` implementation above calls `write_i64` exactly once.
impl nohash_hasher::IsEnabled for VoxelIndex {}

/// A point as stored in the map, tagged with its insertion sequence number
/// for stable tie-breaking in queries.
#[derive(Debug, Clone, Copy)]
struct StoredPoint {
    point: Point3D,
    seq: u64,
}

#[derive(Debug, Default)]
struct VoxelNode {
    points: Vec<StoredPoint>,
}

/// Max-heap entry: the worst candidate (largest distance, then latest
/// insertion) sits on top so it can be displaced by better ones.
struct HeapEntry {
    dist_sq: f64,
    seq: u64,
    point: Point3D,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.dist_sq == other.dist_sq && self.seq == other.seq
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.dist_sq
            .total_cmp(&other.dist_sq)
            .then(self.seq.cmp(&other.seq))
    }
}

/// Incremental sparse voxel grid with kNN queries.
pub struct IVox {
    config: IVoxConfig,
    /// Neighbour offsets searched by queries, host voxel first.
    nearby_offsets: Vec<[i64; 3]>,
    voxels: IntMap<VoxelIndex, VoxelNode>,
    next_seq: u64,
}

impl IVox {
    /// Create an empty map. Resolution and neighbourhood are fixed for the
    /// lifetime of the map.
    pub fn new(config: IVoxConfig) -> Self {
        Self {
            nearby_offsets: nearby_offsets(config.nearby_type),
            config,
            voxels: IntMap::default(),
            next_seq: 0,
        }
    }

    /// Insert points, creating voxels as needed.
    ///
    /// A point is appended unconditionally when its voxel is empty or when
    /// it lies farther from the voxel centre than every stored point by
    /// more than the tolerance; otherwise it is kept only while fewer than
    /// `max_match_points` stored points sit at least as close to the
    /// centre.
    pub fn add_points(&mut self, points: &[Point3D]) {
        for point in points {
            let index = VoxelIndex::of(&point.position, self.config.resolution);
            let centre = index.centre(self.config.resolution);
            let node = self.voxels.entry(index).or_default();

            let dist_c = (point.position - centre).norm();
            let accept = if node.points.is_empty() {
                true
            } else {
                let farther_than_all = node.points.iter().all(|s| {
                    dist_c > (s.point.position - centre).norm() + DOWNSAMPLE_EPS
                });
                if farther_than_all {
                    // No need to downsample: the candidate extends the
                    // voxel's coverage outward.
                    true
                } else {
                    let close_count = node
                        .points
                        .iter()
                        .filter(|s| (s.point.position - centre).norm() <= dist_c + DOWNSAMPLE_EPS)
                        .count();
                    close_count < self.config.max_match_points
                }
            };

            if accept {
                node.points.push(StoredPoint {
                    point: *point,
                    seq: self.next_seq,
                });
                self.next_seq += 1;
            }
        }
    }

    /// The up-to-`k` nearest stored points to `q`, searched across the
    /// configured voxel neighbourhood, sorted by ascending squared distance
    /// with insertion-order tie-breaking. Fewer than `k` candidates returns
    /// them all; an empty neighbourhood returns an empty vector.
    pub fn get_closest_point(&self, q: &Vector3<f64>, k: usize) -> Vec<Point3D> {
        if k == 0 {
            return Vec::new();
        }
        let base = VoxelIndex::of(q, self.config.resolution);
        let mut heap: BinaryHeap<HeapEntry> = BinaryHeap::with_capacity(k + 1);

        for offset in &self.nearby_offsets {
            let Some(node) = self.voxels.get(&base.offset(*offset)) else {
                continue;
            };
            for stored in &node.points {
                let entry = HeapEntry {
                    dist_sq: (stored.point.position - q).norm_squared(),
                    seq: stored.seq,
                    point: stored.point,
                };
                if heap.len() < k {
                    heap.push(entry);
                } else if let Some(worst) = heap.peek() {
                    if entry.cmp(worst) == std::cmp::Ordering::Less {
                        heap.pop();
                        heap.push(entry);
                    }
                }
            }
        }

        let mut results = heap.into_vec();
        results.sort_by(|a, b| a.cmp(b));
        results.into_iter().map(|e| e.point).collect()
    }

    /// Drop every voxel.
    pub fn reset(&mut self) {
        self.voxels.clear();
        self.next_seq = 0;
    }

    /// Number of occupied voxels.
    #[inline]
    pub fn num_voxels(&self) -> usize {
        self.voxels.len()
    }

    /// Total number of stored points.
    pub fn num_points(&self) -> usize {
        self.voxels.values().map(|n| n.points.len()).sum()
    }

    /// The map's configuration.
    #[inline]
    pub fn config(&self) -> &IVoxConfig {
        &self.config
    }
}

/// Neighbour offset table for a query mode, host voxel first.
fn nearby_offsets(nearby_type: NearbyType) -> Vec<[i64; 3]> {
    let mut offsets = vec![[0, 0, 0]];
    match nearby_type {
        NearbyType::Center => {}
        NearbyType::Nearby6 => {
            offsets.extend(FACE_OFFSETS);
        }
        NearbyType::Nearby18 => {
            offsets.extend(FACE_OFFSETS);
            offsets.extend(EDGE_OFFSETS);
        }
        NearbyType::Nearby26 => {
            for dx in -1..=1i64 {
                for dy in -1..=1i64 {
                    for dz in -1..=1i64 {
                        if (dx, dy, dz) != (0, 0, 0) {
                            offsets.push([dx, dy, dz]);
                        }
                    }
                }
            }
        }
    }
    offsets
}

const FACE_OFFSETS: [[i64; 3]; 6] = [
    [-1, 0, 0],
    [1, 0, 0],
    [0, -1, 0],
    [0, 1, 0],
    [0, 0, -1],
    [0, 0, 1],
];

const EDGE_OFFSETS: [[i64; 3]; 12] = [
    [-1, -1, 0],
    [-1, 1, 0],
    [1, -1, 0],
    [1, 1, 0],
    [-1, 0, -1],
    [-1, 0, 1],
    [1, 0, -1],
    [1, 0, 1],
    [0, -1, -1],
    [0, -1, 1],
    [0, 1, -1],
    [0, 1, 1],
];

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn config(resolution: f64, nearby_type: NearbyType) -> IVoxConfig {
        IVoxConfig {
            resolution,
            nearby_type,
            max_match_points: 5,
        }
    }

    fn random_cloud(n: usize, extent: f64, seed: u64) -> Vec<Point3D> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| {
                Point3D::new(
                    rng.gen_range(-extent..extent),
                    rng.gen_range(-extent..extent),
                    rng.gen_range(-extent..extent),
                )
            })
            .collect()
    }

    #[test]
    fn test_insertion_key_correctness() {
        let resolution = 0.4;
        let mut ivox = IVox::new(config(resolution, NearbyType::Nearby18));
        let cloud = random_cloud(500, 3.0, 7);
        ivox.add_points(&cloud);

        for (index, node) in &ivox.voxels {
            for stored in &node.points {
                let expected = VoxelIndex::of(&stored.point.position, resolution);
                assert_eq!(*index, expected);
            }
        }
    }

    #[test]
    fn test_knn_matches_brute_force() {
        let resolution = 1.0;
        let mut ivox = IVox::new(config(resolution, NearbyType::Nearby26));
        // One tight cluster so every point is within the searched cube.
        let cloud = random_cloud(200, 1.4, 11);
        ivox.add_points(&cloud);

        let q = Vector3::new(0.1, -0.2, 0.3);
        let k = 7;
        let got = ivox.get_closest_point(&q, k);
        assert_eq!(got.len(), k);

        // Brute force over the stored points (insertion may have dropped
        // some), restricted to the same neighbourhood.
        let base = VoxelIndex::of(&q, resolution);
        let mut candidates: Vec<(f64, u64, Point3D)> = Vec::new();
        for (index, node) in &ivox.voxels {
            let within = (index.x - base.x).abs() <= 1
                && (index.y - base.y).abs() <= 1
                && (index.z - base.z).abs() <= 1;
            if !within {
                continue;
            }
            for stored in &node.points {
                candidates.push((
                    (stored.point.position - q).norm_squared(),
                    stored.seq,
                    stored.point,
                ));
            }
        }
        candidates.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

        for (i, point) in got.iter().enumerate() {
            assert_relative_eq!(
                (point.position - candidates[i].2.position).norm(),
                0.0,
                epsilon = 1e-12
            );
        }
    }

    #[test]
    fn test_knn_fewer_candidates_than_k() {
        let mut ivox = IVox::new(config(0.5, NearbyType::Center));
        ivox.add_points(&[Point3D::new(0.1, 0.1, 0.1), Point3D::new(0.2, 0.2, 0.2)]);
        let got = ivox.get_closest_point(&Vector3::new(0.15, 0.15, 0.15), 5);
        assert_eq!(got.len(), 2);
    }

    #[test]
    fn test_knn_empty_map() {
        let ivox = IVox::new(IVoxConfig::default());
        assert!(ivox
            .get_closest_point(&Vector3::new(1.0, 2.0, 3.0), 5)
            .is_empty());
    }

    #[test]
    fn test_knn_stable_tie_break() {
        let mut ivox = IVox::new(config(10.0, NearbyType::Center));
        // Four points equidistant from the query; expect insertion order.
        let pts = [
            Point3D::new(1.0, 0.0, 0.0),
            Point3D::new(-1.0, 0.0, 0.0),
            Point3D::new(0.0, 1.0, 0.0),
            Point3D::new(0.0, -1.0, 0.0),
        ];
        ivox.add_points(&pts);
        let got = ivox.get_closest_point(&Vector3::new(0.0, 0.0, 0.0), 3);
        assert_eq!(got.len(), 3);
        assert_relative_eq!(got[0].position, pts[0].position);
        assert_relative_eq!(got[1].position, pts[1].position);
        assert_relative_eq!(got[2].position, pts[2].position);
    }

    #[test]
    fn test_downsample_caps_duplicates() {
        let mut ivox = IVox::new(config(1.0, NearbyType::Center));
        let p = Point3D::new(0.5, 0.5, 0.5);
        for _ in 0..100 {
            ivox.add_points(&[p]);
        }
        // Identical points: the match-count rule stops accepting once
        // max_match_points copies sit at the same centre distance.
        assert_eq!(ivox.num_points(), 5);
    }

    #[test]
    fn test_downsample_bound() {
        let mut ivox = IVox::new(config(1.0, NearbyType::Center));
        let cloud: Vec<Point3D> = random_cloud(300, 0.5, 3)
            .into_iter()
            .map(|mut p| {
                // Shift into the [0,1) voxel.
                p.position = p.position.map(|c| (c + 0.5) * 0.999);
                p
            })
            .collect();
        ivox.add_points(&cloud);
        assert_eq!(ivox.num_voxels(), 1);
        assert!(ivox.num_points() <= cloud.len());
    }

    #[test]
    fn test_farther_point_always_accepted() {
        let mut ivox = IVox::new(config(1.0, NearbyType::Center));
        // Saturate the centre.
        let centre = Point3D::new(0.5, 0.5, 0.5);
        for _ in 0..10 {
            ivox.add_points(&[centre]);
        }
        let before = ivox.num_points();
        // A point clearly farther from the centre than everything stored
        // takes the no-downsample lane.
        ivox.add_points(&[Point3D::new(0.95, 0.95, 0.95)]);
        assert_eq!(ivox.num_points(), before + 1);
    }

    #[test]
    fn test_nearby_modes() {
        let mut ivox_center = IVox::new(config(1.0, NearbyType::Center));
        let mut ivox_six = IVox::new(config(1.0, NearbyType::Nearby6));
        // A point in the voxel one step along +x from the query's voxel.
        let pts = [Point3D::new(1.5, 0.5, 0.5)];
        ivox_center.add_points(&pts);
        ivox_six.add_points(&pts);

        let q = Vector3::new(0.9, 0.5, 0.5);
        assert!(ivox_center.get_closest_point(&q, 1).is_empty());
        assert_eq!(ivox_six.get_closest_point(&q, 1).len(), 1);
    }

    #[test]
    fn test_reset() {
        let mut ivox = IVox::new(IVoxConfig::default());
        ivox.add_points(&random_cloud(50, 2.0, 5));
        assert!(ivox.num_voxels() > 0);
        ivox.reset();
        assert_eq!(ivox.num_voxels(), 0);
        assert_eq!(ivox.num_points(), 0);
    }

    #[test]
    fn test_offset_table_sizes() {
        assert_eq!(nearby_offsets(NearbyType::Center).len(), 1);
        assert_eq!(nearby_offsets(NearbyType::Nearby6).len(), 7);
        assert_eq!(nearby_offsets(NearbyType::Nearby18).len(), 19);
        assert_eq!(nearby_offsets(NearbyType::Nearby26).len(), 27);
    }
}
