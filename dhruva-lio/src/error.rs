//! Error types.
//!
//! Only configuration problems are fatal and surface to the caller.
//! Everything else in the pipeline is handled locally: timestamp
//! regressions clear a buffer and log, degenerate geometry deselects the
//! point, an empty correspondence set marks the filter update invalid.
//! No panic crosses a component boundary.

use thiserror::Error;

/// Errors loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("unknown ivox_nearby_type {0}, expected one of 0, 6, 18, 26")]
    UnknownNearbyType(i32),

    #[error("extrinsic_T must have 3 elements, got {0}")]
    BadExtrinsicTranslation(usize),

    #[error("extrinsic_R must have 9 elements (row-major 3x3), got {0}")]
    BadExtrinsicRotation(usize),

    #[error("{key} must be positive, got {value}")]
    NonPositive { key: &'static str, value: f64 },
}

/// Top-level error type.
#[derive(Error, Debug)]
pub enum LioError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LioError>;
