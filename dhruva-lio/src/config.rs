//! Unified configuration for the odometry pipeline.
//!
//! The YAML layout follows the conventional LIO parameter tree
//! (`common`, `preprocess`, `mapping`, `publish`, `pcd_save` sections plus
//! a handful of top-level tuning keys). Every key has a default, so a
//! partial file — or none at all — is valid. The loaded record is immutable
//! and threaded through the component constructors; there is no
//! process-wide mutable tuning state.
//!
//! # Example
//!
//! ```ignore
//! let config = LioConfig::load(Path::new("configs/avia.yaml"))?;
//! let engine = LioEngine::new(config)?;
//! ```

use std::path::Path;

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Supported LiDAR sensor families for raw-frame decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LidarType {
    /// Livox Avia (per-point offset time in the raw stream).
    Avia,
    /// Velodyne 32-beam (per-point relative time, may start negative).
    Velo32,
    /// Ouster 64-beam (per-point time in nanoseconds).
    Oust64,
}

/// Voxel neighbourhood searched by the map's k-nearest-neighbour query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NearbyType {
    /// Only the voxel containing the query point.
    Center,
    /// Host voxel plus the six face-adjacent voxels.
    Nearby6,
    /// Host voxel plus face- and edge-adjacent voxels.
    Nearby18,
    /// The full 3x3x3 cube around the host voxel.
    Nearby26,
}

/// Full pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LioConfig {
    /// Maximum iterations of the iterated measurement update. Default: 4
    #[serde(default = "default_max_iteration")]
    pub max_iteration: usize,

    /// Plane-fit acceptance threshold in metres. Default: 0.1
    #[serde(default = "default_esti_plane_threshold")]
    pub esti_plane_threshold: f64,

    /// Voxel leaf size for downsampling the scan, metres. Default: 0.5
    #[serde(default = "default_filter_size_surf")]
    pub filter_size_surf: f64,

    /// Voxel leaf size for map downsampling, metres. Zero disables the
    /// map-increment downsample policy. Default: 0.0
    #[serde(default)]
    pub filter_size_map: f64,

    /// Side length of the operational cube, metres. Default: 200
    #[serde(default = "default_cube_side_length")]
    pub cube_side_length: f64,

    /// Voxel grid resolution of the incremental map, metres. Default: 0.2
    #[serde(default = "default_ivox_grid_resolution")]
    pub ivox_grid_resolution: f64,

    /// Neighbourhood mode for map queries: 0, 6, 18 or 26. Default: 18
    #[serde(default = "default_ivox_nearby_type")]
    pub ivox_nearby_type: i32,

    /// Keep every n-th raw point. Default: 2
    #[serde(default = "default_point_filter_num")]
    pub point_filter_num: usize,

    /// Reserved: surface-feature extraction in the preprocessor.
    /// Default: false
    #[serde(default)]
    pub feature_extract_enable: bool,

    /// Whether the accumulated trajectory may be saved on finish.
    /// Default: true
    #[serde(default = "default_true")]
    pub path_save_en: bool,

    #[serde(default)]
    pub common: CommonSection,

    #[serde(default)]
    pub preprocess: PreprocessSection,

    #[serde(default)]
    pub mapping: MappingSection,

    #[serde(default)]
    pub publish: PublishSection,

    #[serde(default)]
    pub pcd_save: PcdSaveSection,
}

/// Timing options shared by the intake callbacks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonSection {
    /// Apply a constant offset to IMU timestamps. Default: false
    #[serde(default)]
    pub time_sync_en: bool,

    /// Offset added to IMU timestamps when `time_sync_en` is set, seconds.
    /// Default: 0.0
    #[serde(default)]
    pub time_offset_lidar_to_imu: f64,
}

/// Raw-scan decoding options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreprocessSection {
    /// Minimum return range in metres; closer points are dropped.
    /// Default: 0.01
    #[serde(default = "default_blind")]
    pub blind: f64,

    /// Scale from the sensor's per-point time unit to seconds.
    /// Default: 1e-3 (milliseconds)
    #[serde(default = "default_time_scale")]
    pub time_scale: f64,

    /// Sensor family. Default: AVIA
    #[serde(default = "default_lidar_type")]
    pub lidar_type: LidarType,

    /// Number of beams in the sensor. Default: 16
    #[serde(default = "default_scan_line")]
    pub scan_line: usize,
}

/// Filter and extrinsic tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingSection {
    /// Sensor detection range in metres. Default: 300
    #[serde(default = "default_det_range")]
    pub det_range: f64,

    /// Gyroscope noise variance. Default: 0.1
    #[serde(default = "default_gyr_cov")]
    pub gyr_cov: f64,

    /// Accelerometer noise variance. Default: 0.1
    #[serde(default = "default_acc_cov")]
    pub acc_cov: f64,

    /// Gyroscope bias random-walk variance. Default: 1e-4
    #[serde(default = "default_bias_cov")]
    pub b_gyr_cov: f64,

    /// Accelerometer bias random-walk variance. Default: 1e-4
    #[serde(default = "default_bias_cov")]
    pub b_acc_cov: f64,

    /// Estimate the lidar-IMU extrinsic online. Default: false
    #[serde(default)]
    pub extrinsic_est_en: bool,

    /// Lidar-to-IMU extrinsic translation, metres. Default: zero
    #[serde(rename = "extrinsic_T", default = "default_extrinsic_t")]
    pub extrinsic_t: Vec<f64>,

    /// Lidar-to-IMU extrinsic rotation, row-major 3x3. Default: identity
    #[serde(rename = "extrinsic_R", default = "default_extrinsic_r")]
    pub extrinsic_r: Vec<f64>,
}

/// Which outputs a frame carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishSection {
    /// Emit the accumulated path. Default: true
    #[serde(default = "default_true")]
    pub path_publish_en: bool,

    /// Emit the registered scan. Default: true
    #[serde(default = "default_true")]
    pub scan_publish_en: bool,

    /// Use the full de-skewed scan for the world cloud instead of the
    /// downsampled one. Default: false
    #[serde(default)]
    pub dense_publish_en: bool,

    /// Emit the de-skewed scan in the IMU body frame. Default: true
    #[serde(default = "default_true")]
    pub scan_bodyframe_pub_en: bool,

    /// Emit the effective (selected) correspondences. Default: false
    #[serde(default)]
    pub scan_effect_pub_en: bool,
}

/// Point-cloud snapshot options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PcdSaveSection {
    /// Accumulate registered scans and write them as PCD. Default: false
    #[serde(default)]
    pub pcd_save_en: bool,

    /// Dump `scans_<k>.pcd` every this many frames; non-positive keeps a
    /// single accumulation written on finish. Default: -1
    #[serde(default = "default_pcd_interval")]
    pub interval: i64,
}

fn default_max_iteration() -> usize {
    4
}
fn default_esti_plane_threshold() -> f64 {
    0.1
}
fn default_filter_size_surf() -> f64 {
    0.5
}
fn default_cube_side_length() -> f64 {
    200.0
}
fn default_ivox_grid_resolution() -> f64 {
    0.2
}
fn default_ivox_nearby_type() -> i32 {
    18
}
fn default_point_filter_num() -> usize {
    2
}
fn default_true() -> bool {
    true
}
fn default_blind() -> f64 {
    0.01
}
fn default_time_scale() -> f64 {
    1e-3
}
fn default_lidar_type() -> LidarType {
    LidarType::Avia
}
fn default_scan_line() -> usize {
    16
}
fn default_det_range() -> f64 {
    300.0
}
fn default_gyr_cov() -> f64 {
    0.1
}
fn default_acc_cov() -> f64 {
    0.1
}
fn default_bias_cov() -> f64 {
    1e-4
}
fn default_extrinsic_t() -> Vec<f64> {
    vec![0.0; 3]
}
fn default_extrinsic_r() -> Vec<f64> {
    vec![1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0]
}
fn default_pcd_interval() -> i64 {
    -1
}

impl Default for LioConfig {
    fn default() -> Self {
        // Round-trip through serde so defaults live in exactly one place.
        serde_yaml::from_str("{}").expect("empty config must deserialize")
    }
}

impl Default for CommonSection {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty section must deserialize")
    }
}

impl Default for PreprocessSection {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty section must deserialize")
    }
}

impl Default for MappingSection {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty section must deserialize")
    }
}

impl Default for PublishSection {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty section must deserialize")
    }
}

impl Default for PcdSaveSection {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty section must deserialize")
    }
}

impl LioConfig {
    /// Load and validate configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialise to YAML. Serialising, loading and serialising again yields
    /// an identical document.
    pub fn to_yaml(&self) -> String {
        serde_yaml::to_string(self).expect("config serialization cannot fail")
    }

    /// Check every derived quantity once, up front. Configuration problems
    /// are the only fatal errors in the pipeline.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.nearby_type()?;
        self.extrinsic_rotation()?;
        self.extrinsic_translation()?;
        for (key, value) in [
            ("ivox_grid_resolution", self.ivox_grid_resolution),
            ("filter_size_surf", self.filter_size_surf),
            ("esti_plane_threshold", self.esti_plane_threshold),
            ("preprocess/time_scale", self.preprocess.time_scale),
        ] {
            if value <= 0.0 {
                return Err(ConfigError::NonPositive { key, value });
            }
        }
        Ok(())
    }

    /// Neighbourhood mode decoded from the numeric key.
    pub fn nearby_type(&self) -> Result<NearbyType, ConfigError> {
        match self.ivox_nearby_type {
            0 => Ok(NearbyType::Center),
            6 => Ok(NearbyType::Nearby6),
            18 => Ok(NearbyType::Nearby18),
            26 => Ok(NearbyType::Nearby26),
            other => Err(ConfigError::UnknownNearbyType(other)),
        }
    }

    /// Extrinsic rotation as a matrix.
    pub fn extrinsic_rotation(&self) -> Result<Matrix3<f64>, ConfigError> {
        let r = &self.mapping.extrinsic_r;
        if r.len() != 9 {
            return Err(ConfigError::BadExtrinsicRotation(r.len()));
        }
        Ok(Matrix3::from_row_slice(r))
    }

    /// Extrinsic translation as a vector.
    pub fn extrinsic_translation(&self) -> Result<Vector3<f64>, ConfigError> {
        let t = &self.mapping.extrinsic_t;
        if t.len() != 3 {
            return Err(ConfigError::BadExtrinsicTranslation(t.len()));
        }
        Ok(Vector3::new(t[0], t[1], t[2]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_defaults() {
        let config = LioConfig::default();
        assert_eq!(config.max_iteration, 4);
        assert_relative_eq!(config.esti_plane_threshold, 0.1);
        assert_relative_eq!(config.filter_size_surf, 0.5);
        assert_relative_eq!(config.ivox_grid_resolution, 0.2);
        assert_eq!(config.ivox_nearby_type, 18);
        assert_eq!(config.preprocess.lidar_type, LidarType::Avia);
        assert!(!config.mapping.extrinsic_est_en);
        assert!(!config.pcd_save.pcd_save_en);
    }

    #[test]
    fn test_yaml_roundtrip_is_byte_identical() {
        let config = LioConfig::default();
        let first = config.to_yaml();
        let reloaded = LioConfig::from_yaml(&first).unwrap();
        let second = reloaded.to_yaml();
        assert_eq!(first, second);
    }

    #[test]
    fn test_partial_yaml_overrides() {
        let yaml = r#"
max_iteration: 8
preprocess:
  lidar_type: VELO32
  blind: 0.5
mapping:
  gyr_cov: 0.05
"#;
        let config = LioConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.max_iteration, 8);
        assert_eq!(config.preprocess.lidar_type, LidarType::Velo32);
        assert_relative_eq!(config.preprocess.blind, 0.5);
        assert_relative_eq!(config.mapping.gyr_cov, 0.05);
        // Untouched keys keep their defaults.
        assert_relative_eq!(config.mapping.acc_cov, 0.1);
    }

    #[test]
    fn test_unknown_lidar_type_fails() {
        let yaml = "preprocess:\n  lidar_type: HESAI\n";
        assert!(LioConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_unknown_nearby_type_fails() {
        let yaml = "ivox_nearby_type: 7\n";
        let err = LioConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownNearbyType(7)));
    }

    #[test]
    fn test_bad_extrinsic_fails() {
        let yaml = "mapping:\n  extrinsic_T: [1.0, 2.0]\n";
        assert!(LioConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_unparseable_number_fails() {
        let yaml = "filter_size_surf: not_a_number\n";
        assert!(LioConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_extrinsic_conversion() {
        let yaml = r#"
mapping:
  extrinsic_T: [0.1, -0.2, 0.3]
  extrinsic_R: [0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0]
"#;
        let config = LioConfig::from_yaml(yaml).unwrap();
        let t = config.extrinsic_translation().unwrap();
        assert_relative_eq!(t, Vector3::new(0.1, -0.2, 0.3));
        let r = config.extrinsic_rotation().unwrap();
        assert_relative_eq!(r[(0, 1)], -1.0);
        assert_relative_eq!(r[(1, 0)], 1.0);
    }
}
