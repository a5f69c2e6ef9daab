//! Scan-to-map registration.

mod point_to_plane;

pub use point_to_plane::{
    BoundObservation, Correspondence, Plane3D, PointToPlaneConfig, PointToPlaneObserver,
};
