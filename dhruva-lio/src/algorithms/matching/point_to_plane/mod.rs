//! Point-to-plane observation model for the iterated filter.
//!
//! For every downsampled scan point: transform into the world frame under
//! the current state iterate, look up its nearest map neighbours, fit a
//! local plane and form the signed point-to-plane residual. Selected
//! correspondences become rows of the measurement Jacobian over the
//! twelve observed tangent dimensions.
//!
//! Both per-point passes are embarrassingly parallel over disjoint output
//! slots and run on the rayon pool in ~1k-point chunks.

mod config;
mod correspondence;
mod plane3d;

pub use config::PointToPlaneConfig;
pub use correspondence::Correspondence;
pub use plane3d::Plane3D;

use log::{debug, warn};
use nalgebra::{DMatrix, DVector, Vector3};
use rayon::prelude::*;

use crate::algorithms::ieskf::{Observation, ObservationModel};
use crate::algorithms::mapping::IVox;
use crate::core::math::skew;
use crate::core::types::{NavState, Point3D, PointCloud3D, OBS_DIM};

/// Minimum work-unit size for the parallel fan-outs.
const PAR_CHUNK: usize = 1024;

/// Reusable buffers of the observation model.
///
/// One instance lives across the whole run; [`prepare`](Self::prepare)
/// resizes it for each bundle and [`bind`](Self::bind) borrows it together
/// with the scan and the map for the duration of one iterated update.
pub struct PointToPlaneObserver {
    config: PointToPlaneConfig,
    correspondences: Vec<Correspondence>,
    world: PointCloud3D,
    condition_numbers: Vec<f64>,
}

impl PointToPlaneObserver {
    /// Create the observer with empty buffers.
    pub fn new(config: PointToPlaneConfig) -> Self {
        Self {
            config,
            correspondences: Vec::new(),
            world: PointCloud3D::new(),
            condition_numbers: Vec::new(),
        }
    }

    /// Resize the per-point buffers for a scan of `len` points and clear
    /// the previous bundle's correspondences and diagnostics.
    pub fn prepare(&mut self, len: usize) {
        self.correspondences.resize_with(len, Correspondence::default);
        for corr in &mut self.correspondences {
            corr.clear();
        }
        self.world.points.resize(len, Point3D::new(0.0, 0.0, 0.0));
        self.condition_numbers.clear();
    }

    /// Borrow the observer together with the scan and map it evaluates
    /// against.
    pub fn bind<'a>(
        &'a mut self,
        scan_body: &'a PointCloud3D,
        ivox: &'a IVox,
    ) -> BoundObservation<'a> {
        BoundObservation {
            observer: self,
            scan_body,
            ivox,
        }
    }

    /// The scan transformed into the world frame under the last evaluated
    /// state iterate.
    #[inline]
    pub fn world_cloud(&self) -> &PointCloud3D {
        &self.world
    }

    /// Per-point correspondence records of the last evaluation.
    #[inline]
    pub fn correspondences(&self) -> &[Correspondence] {
        &self.correspondences
    }

    /// Observability condition numbers, one per filter iteration.
    #[inline]
    pub fn condition_numbers(&self) -> &[f64] {
        &self.condition_numbers
    }

    /// The model configuration.
    #[inline]
    pub fn config(&self) -> &PointToPlaneConfig {
        &self.config
    }
}

/// The observer bound to one bundle's scan and the current map.
pub struct BoundObservation<'a> {
    observer: &'a mut PointToPlaneObserver,
    scan_body: &'a PointCloud3D,
    ivox: &'a IVox,
}

impl ObservationModel for BoundObservation<'_> {
    fn evaluate(&mut self, state: &NavState, refresh: bool) -> Option<Observation> {
        let obs = &mut *self.observer;
        let scan_body = self.scan_body;
        let ivox = self.ivox;
        let config = obs.config;
        let n = scan_body.len();
        debug_assert_eq!(obs.correspondences.len(), n);

        // Pass 1: world transform, neighbour lookup, plane fit, residual.
        // Disjoint per-index slots; no shared mutation.
        obs.world
            .points
            .par_iter_mut()
            .zip(obs.correspondences.par_iter_mut())
            .zip(scan_body.points.par_iter())
            .with_min_len(PAR_CHUNK)
            .for_each(|((world, corr), src)| {
                let p_world = state.lidar_to_world(&src.position);
                *world = Point3D {
                    position: p_world,
                    intensity: src.intensity,
                    time_offset: 0.0,
                };
                corr.update(&config, ivox, &src.position, &p_world, refresh);
            });

        // Compact the selected correspondences.
        let effective: Vec<(usize, Plane3D, f64)> = obs
            .correspondences
            .iter()
            .enumerate()
            .filter_map(|(i, corr)| match (corr.selected, corr.plane) {
                (true, Some(plane)) => Some((i, plane, corr.residual)),
                _ => None,
            })
            .collect();

        if effective.is_empty() {
            warn!("no effective correspondences among {n} points");
            return None;
        }
        if refresh {
            debug!(
                "selected {} of {} correspondences",
                effective.len(),
                n
            );
        }

        // Pass 2: Jacobian rows, disjoint per effective correspondence.
        let rot_t = state.rot.inverse();
        let ext_rot_t = state.ext_rot.inverse();
        let rows: Vec<[f64; OBS_DIM]> = effective
            .par_iter()
            .with_min_len(PAR_CHUNK)
            .map(|&(i, plane, _)| {
                let p_body = scan_body.points[i].position;
                let point_imu = state.ext_rot * p_body + state.ext_trans;
                let n_vec = plane.normal;

                let c: Vector3<f64> = rot_t * n_vec;
                let a = skew(&point_imu) * c;
                let (b, c_col) = if config.extrinsic_est_en {
                    (skew(&p_body) * (ext_rot_t * c), c)
                } else {
                    (Vector3::zeros(), Vector3::zeros())
                };

                [
                    n_vec.x, n_vec.y, n_vec.z, a.x, a.y, a.z, b.x, b.y, b.z, c_col.x, c_col.y,
                    c_col.z,
                ]
            })
            .collect();

        let m = rows.len();
        let mut h_x = DMatrix::zeros(m, OBS_DIM);
        let mut h = DVector::zeros(m);
        for (r, row) in rows.iter().enumerate() {
            for (c, value) in row.iter().enumerate() {
                h_x[(r, c)] = *value;
            }
            h[r] = -effective[r].2;
        }

        obs.condition_numbers.push(condition_number(&h_x));

        Some(Observation { h_x, h })
    }
}

/// Observability diagnostic over the pose block of the Jacobian.
///
/// Accumulates JᵀJ over the first six columns, extracts the translation
/// block C and reports √(λ_max/(λ_min + 1e-7)) of CᵀC. Degenerate scenes
/// (a single plane, a long corridor) drive this up by orders of magnitude.
fn condition_number(h_x: &DMatrix<f64>) -> f64 {
    let pose_block = h_x.columns(0, 6);
    let a = pose_block.transpose() * pose_block;
    let c = a.view((0, 0), (3, 3)).into_owned();
    let ctc = c.transpose() * &c;
    let eigenvalues = ctc.symmetric_eigen().eigenvalues;
    let lambda_max = eigenvalues.max().max(0.0);
    let lambda_min = eigenvalues.min().max(0.0);
    (lambda_max / (lambda_min + 1e-7)).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::ieskf::ObservationModel;
    use crate::algorithms::mapping::{IVox, IVoxConfig};
    use crate::config::NearbyType;
    use approx::assert_relative_eq;

    /// Map of three mutually orthogonal planes one metre away on the
    /// negative sides: x = -1, y = -1, z = -1.
    fn corner_map() -> IVox {
        let mut ivox = IVox::new(IVoxConfig {
            resolution: 0.5,
            nearby_type: NearbyType::Nearby18,
            max_match_points: 5,
        });
        let mut points = Vec::new();
        for i in -10..=10 {
            for j in -10..=10 {
                let u = i as f64 * 0.1;
                let v = j as f64 * 0.1;
                points.push(Point3D::new(-1.0, u, v));
                points.push(Point3D::new(u, -1.0, v));
                points.push(Point3D::new(u, v, -1.0));
            }
        }
        ivox.add_points(&points);
        ivox
    }

    /// A scan of the same three planes taken from the origin.
    fn corner_scan() -> PointCloud3D {
        let mut scan = PointCloud3D::new();
        for i in -5..=5 {
            for j in -5..=5 {
                let u = i as f64 * 0.15;
                let v = j as f64 * 0.15;
                scan.push(Point3D::new(-1.0, u, v));
                scan.push(Point3D::new(u, -1.0, v));
                scan.push(Point3D::new(u, v, -1.0));
            }
        }
        scan
    }

    #[test]
    fn test_evaluate_on_aligned_scan() {
        let ivox = corner_map();
        let scan = corner_scan();
        let mut observer = PointToPlaneObserver::new(PointToPlaneConfig::default());
        observer.prepare(scan.len());

        let state = NavState::default();
        let obs = observer
            .bind(&scan, &ivox)
            .evaluate(&state, true)
            .expect("aligned scan must produce correspondences");

        assert_eq!(obs.h_x.nrows(), obs.h.len());
        assert!(obs.h_x.nrows() > scan.len() / 2);
        // Perfectly aligned: residuals vanish.
        assert_relative_eq!(obs.h.amax(), 0.0, epsilon = 1e-9);
        // Extrinsic estimation disabled: columns 6..12 are zero.
        for r in 0..obs.h_x.nrows() {
            for c in 6..12 {
                assert_relative_eq!(obs.h_x[(r, c)], 0.0);
            }
        }
    }

    #[test]
    fn test_evaluate_offset_scan_has_residuals() {
        let ivox = corner_map();
        let scan = corner_scan();
        let mut observer = PointToPlaneObserver::new(PointToPlaneConfig::default());
        observer.prepare(scan.len());

        // Shift the platform 2 cm toward the x wall.
        let mut state = NavState::default();
        state.pos.x = -0.02;
        let obs = observer
            .bind(&scan, &ivox)
            .evaluate(&state, true)
            .expect("offset scan must produce correspondences");

        // Some rows see the x wall: their measurement is the 2 cm error.
        let max_meas = obs.h.amax();
        assert_relative_eq!(max_meas, 0.02, epsilon = 1e-6);
    }

    #[test]
    fn test_evaluate_records_condition_number() {
        let ivox = corner_map();
        let scan = corner_scan();
        let mut observer = PointToPlaneObserver::new(PointToPlaneConfig::default());
        observer.prepare(scan.len());
        observer
            .bind(&scan, &ivox)
            .evaluate(&NavState::default(), true)
            .unwrap();
        assert_eq!(observer.condition_numbers().len(), 1);
        // Three orthogonal planes keep translation fully observable.
        assert!(observer.condition_numbers()[0] < 100.0);
    }

    #[test]
    fn test_evaluate_empty_map_returns_none() {
        let ivox = IVox::new(IVoxConfig::default());
        let scan = corner_scan();
        let mut observer = PointToPlaneObserver::new(PointToPlaneConfig::default());
        observer.prepare(scan.len());
        assert!(observer
            .bind(&scan, &ivox)
            .evaluate(&NavState::default(), true)
            .is_none());
    }

    #[test]
    fn test_world_cloud_follows_state() {
        let ivox = corner_map();
        let scan = corner_scan();
        let mut observer = PointToPlaneObserver::new(PointToPlaneConfig::default());
        observer.prepare(scan.len());

        let mut state = NavState::default();
        state.pos = Vector3::new(0.5, 0.0, 0.0);
        let _ = observer.bind(&scan, &ivox).evaluate(&state, true);

        let src = &scan.points[0];
        let out = &observer.world_cloud().points[0];
        assert_relative_eq!(
            out.position,
            src.position + Vector3::new(0.5, 0.0, 0.0),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_single_plane_condition_number_degenerate() {
        // Ground-plane-only scene: translation in the plane unobservable.
        let mut ivox = IVox::new(IVoxConfig {
            resolution: 0.5,
            nearby_type: NearbyType::Nearby18,
            max_match_points: 5,
        });
        let mut map_points = Vec::new();
        for i in -20..=20 {
            for j in -20..=20 {
                map_points.push(Point3D::new(i as f64 * 0.1, j as f64 * 0.1, -1.0));
            }
        }
        ivox.add_points(&map_points);

        let mut scan = PointCloud3D::new();
        for i in -8..=8 {
            for j in -8..=8 {
                scan.push(Point3D::new(i as f64 * 0.12, j as f64 * 0.12, -1.0));
            }
        }

        let mut observer = PointToPlaneObserver::new(PointToPlaneConfig::default());
        observer.prepare(scan.len());
        observer
            .bind(&scan, &ivox)
            .evaluate(&NavState::default(), true)
            .unwrap();
        assert!(observer.condition_numbers()[0] > 1e3);
    }
}
