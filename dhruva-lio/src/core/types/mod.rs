//! Core data types shared across the pipeline.

mod imu;
mod point;
mod state;

pub use imu::{ImuReading, MeasureBundle};
pub use point::{Point3D, PointCloud3D};
pub use state::{
    ErrorVector, NavState, StateCov, GRAVITY_NORM, IDX_BA, IDX_BG, IDX_EXT_ROT, IDX_EXT_TRANS,
    IDX_GRAV, IDX_POS, IDX_ROT, IDX_VEL, OBS_DIM, STATE_DIM,
};
