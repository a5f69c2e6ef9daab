//! Configuration for the point-to-plane observation model.

/// Tuning of correspondence search and residual gating.
#[derive(Debug, Clone, Copy)]
pub struct PointToPlaneConfig {
    /// Neighbours requested per query point.
    /// Default: 5
    pub max_match_points: usize,

    /// Minimum neighbours required to attempt a plane fit.
    /// Default: 3
    pub min_match_points: usize,

    /// Plane-fit acceptance threshold in metres (τ_plane).
    /// Default: 0.1
    pub plane_threshold: f64,

    /// Factor of the range-vs-residual validity gate:
    /// a correspondence is kept while ‖p_body‖² > factor · r².
    /// Default: 81 (the 9x signal-to-noise heuristic)
    pub valid_corr_factor: f64,

    /// Whether the extrinsic columns of the Jacobian are populated.
    /// Default: false
    pub extrinsic_est_en: bool,
}

impl Default for PointToPlaneConfig {
    fn default() -> Self {
        Self {
            max_match_points: 5,
            min_match_points: 3,
            plane_threshold: 0.1,
            valid_corr_factor: 81.0,
            extrinsic_est_en: false,
        }
    }
}
