//! Correspondence state for point-to-plane registration.

use nalgebra::Vector3;

use super::config::PointToPlaneConfig;
use super::plane3d::Plane3D;
use crate::algorithms::mapping::IVox;
use crate::core::types::Point3D;

/// Per-source-point correspondence record.
///
/// One record per downsampled scan point, reused across filter iterations.
/// The neighbour set and plane are refreshed only while the iterated state
/// is still moving; the residual and the validity gate are re-evaluated
/// every iteration against the current world-frame position.
#[derive(Debug, Clone, Default)]
pub struct Correspondence {
    /// Map neighbours from the last refresh, nearest first.
    pub neighbors: Vec<Point3D>,
    /// Fitted local plane, when the neighbourhood was planar.
    pub plane: Option<Plane3D>,
    /// Signed point-to-plane residual of the last evaluation.
    pub residual: f64,
    /// Whether this point contributes a measurement row.
    pub selected: bool,
}

impl Correspondence {
    /// Reset to the no-correspondence state.
    pub fn clear(&mut self) {
        self.neighbors.clear();
        self.plane = None;
        self.residual = 0.0;
        self.selected = false;
    }

    /// Update this record for the current iterate.
    ///
    /// `p_body` is the source point in the lidar frame, `p_world` its
    /// position under the current state estimate. When `refresh` is set the
    /// map is re-queried and the plane re-fitted; otherwise the cached
    /// plane is re-evaluated.
    pub fn update(
        &mut self,
        config: &PointToPlaneConfig,
        ivox: &IVox,
        p_body: &Vector3<f64>,
        p_world: &Vector3<f64>,
        refresh: bool,
    ) {
        if refresh {
            self.neighbors = ivox.get_closest_point(p_world, config.max_match_points);
            self.plane = if self.neighbors.len() >= config.min_match_points {
                Plane3D::fit(&self.neighbors, config.plane_threshold)
            } else {
                None
            };
        }

        let Some(plane) = &self.plane else {
            self.selected = false;
            return;
        };

        let residual = plane.distance(p_world);
        // Range-vs-residual gate: distant points with large residuals are
        // more likely mismatches than surface evidence.
        if p_body.norm_squared() > config.valid_corr_factor * residual * residual {
            self.residual = residual;
            self.selected = true;
        } else {
            self.selected = false;
        }
    }
}
