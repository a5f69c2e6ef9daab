//! Navigation state on the 23-dimensional product manifold.
//!
//! The state is a sum of components: position, orientation, the
//! lidar-to-IMU extrinsic (rotation + translation), velocity, the two IMU
//! biases, and the gravity vector. Orientations live on SO(3) with
//! 3-dimensional tangents; gravity lives on the 2-sphere of fixed norm with
//! a 2-dimensional tangent, which is what makes the total tangent dimension
//! 12 + 3 + 3 + 3 + 2 = 23.
//!
//! # Tangent layout
//!
//! ```text
//! [ pos 0..3 | rot 3..6 | ext_rot 6..9 | ext_trans 9..12 |
//!   vel 12..15 | bias_gyro 15..18 | bias_acc 18..21 | grav 21..23 ]
//! ```
//!
//! The first twelve components are the ones observed by the point-to-plane
//! measurement Jacobian.

use nalgebra::{SMatrix, SVector, UnitQuaternion, Vector2, Vector3};

use crate::core::math::s2_tangent_basis;

/// Tangent-space dimension of the full state.
pub const STATE_DIM: usize = 23;
/// Tangent dimension observed by the LiDAR measurement model.
pub const OBS_DIM: usize = 12;

/// Tangent offset of the position component.
pub const IDX_POS: usize = 0;
/// Tangent offset of the orientation component.
pub const IDX_ROT: usize = 3;
/// Tangent offset of the extrinsic rotation component.
pub const IDX_EXT_ROT: usize = 6;
/// Tangent offset of the extrinsic translation component.
pub const IDX_EXT_TRANS: usize = 9;
/// Tangent offset of the velocity component.
pub const IDX_VEL: usize = 12;
/// Tangent offset of the gyroscope bias component.
pub const IDX_BG: usize = 15;
/// Tangent offset of the accelerometer bias component.
pub const IDX_BA: usize = 18;
/// Tangent offset of the gravity component (2-dimensional).
pub const IDX_GRAV: usize = 21;

/// Standard gravity magnitude in m/s².
pub const GRAVITY_NORM: f64 = 9.81;

/// Error-state vector in the tangent space.
pub type ErrorVector = SVector<f64, STATE_DIM>;
/// Full state covariance.
pub type StateCov = SMatrix<f64, STATE_DIM, STATE_DIM>;

/// Full navigation state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NavState {
    /// Position of the IMU body in the world frame, metres.
    pub pos: Vector3<f64>,
    /// Orientation of the IMU body in the world frame.
    pub rot: UnitQuaternion<f64>,
    /// Rotation part of the lidar-to-IMU extrinsic.
    pub ext_rot: UnitQuaternion<f64>,
    /// Translation part of the lidar-to-IMU extrinsic, metres.
    pub ext_trans: Vector3<f64>,
    /// Linear velocity in the world frame, m/s.
    pub vel: Vector3<f64>,
    /// Gyroscope bias, rad/s.
    pub bias_gyro: Vector3<f64>,
    /// Accelerometer bias, m/s².
    pub bias_acc: Vector3<f64>,
    /// Gravity vector in the world frame, m/s². Fixed norm.
    pub grav: Vector3<f64>,
}

impl Default for NavState {
    fn default() -> Self {
        Self {
            pos: Vector3::zeros(),
            rot: UnitQuaternion::identity(),
            ext_rot: UnitQuaternion::identity(),
            ext_trans: Vector3::zeros(),
            vel: Vector3::zeros(),
            bias_gyro: Vector3::zeros(),
            bias_acc: Vector3::zeros(),
            grav: Vector3::new(0.0, 0.0, -GRAVITY_NORM),
        }
    }
}

impl NavState {
    /// Retraction: apply a tangent-space increment to the state.
    ///
    /// Vector components add; rotations compose on the right through the
    /// exponential map; gravity rotates within its sphere through the
    /// tangent-plane basis at the current gravity direction.
    pub fn boxplus(&self, delta: &ErrorVector) -> NavState {
        let d_rot = Vector3::new(delta[IDX_ROT], delta[IDX_ROT + 1], delta[IDX_ROT + 2]);
        let d_ext_rot = Vector3::new(
            delta[IDX_EXT_ROT],
            delta[IDX_EXT_ROT + 1],
            delta[IDX_EXT_ROT + 2],
        );
        let d_grav = Vector2::new(delta[IDX_GRAV], delta[IDX_GRAV + 1]);

        let grav = if d_grav.norm_squared() > 0.0 && self.grav.norm_squared() > 0.0 {
            let axis = s2_tangent_basis(&self.grav) * d_grav;
            UnitQuaternion::from_scaled_axis(axis) * self.grav
        } else {
            self.grav
        };

        NavState {
            pos: self.pos + delta.fixed_rows::<3>(IDX_POS).into_owned(),
            rot: self.rot * UnitQuaternion::from_scaled_axis(d_rot),
            ext_rot: self.ext_rot * UnitQuaternion::from_scaled_axis(d_ext_rot),
            ext_trans: self.ext_trans + delta.fixed_rows::<3>(IDX_EXT_TRANS).into_owned(),
            vel: self.vel + delta.fixed_rows::<3>(IDX_VEL).into_owned(),
            bias_gyro: self.bias_gyro + delta.fixed_rows::<3>(IDX_BG).into_owned(),
            bias_acc: self.bias_acc + delta.fixed_rows::<3>(IDX_BA).into_owned(),
            grav,
        }
    }

    /// Lifting: tangent-space difference `self ⊟ other`.
    ///
    /// Inverse of [`boxplus`](Self::boxplus) anchored at `other`:
    /// `(other ⊞ δ) ⊟ other == δ`.
    pub fn boxminus(&self, other: &NavState) -> ErrorVector {
        let mut delta = ErrorVector::zeros();
        delta
            .fixed_rows_mut::<3>(IDX_POS)
            .copy_from(&(self.pos - other.pos));
        delta
            .fixed_rows_mut::<3>(IDX_ROT)
            .copy_from(&(other.rot.inverse() * self.rot).scaled_axis());
        delta
            .fixed_rows_mut::<3>(IDX_EXT_ROT)
            .copy_from(&(other.ext_rot.inverse() * self.ext_rot).scaled_axis());
        delta
            .fixed_rows_mut::<3>(IDX_EXT_TRANS)
            .copy_from(&(self.ext_trans - other.ext_trans));
        delta
            .fixed_rows_mut::<3>(IDX_VEL)
            .copy_from(&(self.vel - other.vel));
        delta
            .fixed_rows_mut::<3>(IDX_BG)
            .copy_from(&(self.bias_gyro - other.bias_gyro));
        delta
            .fixed_rows_mut::<3>(IDX_BA)
            .copy_from(&(self.bias_acc - other.bias_acc));

        let d_grav = sphere_log(&other.grav, &self.grav);
        delta[IDX_GRAV] = d_grav.x;
        delta[IDX_GRAV + 1] = d_grav.y;
        delta
    }

    /// Transform a lidar-frame point into the world frame through the
    /// extrinsic and the body pose.
    #[inline]
    pub fn lidar_to_world(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rot * (self.ext_rot * p + self.ext_trans) + self.pos
    }

    /// Transform a lidar-frame point into the IMU body frame.
    #[inline]
    pub fn lidar_to_body(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.ext_rot * p + self.ext_trans
    }
}

/// Tangent coordinates of the rotation taking `from` to `to` on the sphere,
/// expressed in the tangent basis at `from`.
fn sphere_log(from: &Vector3<f64>, to: &Vector3<f64>) -> Vector2<f64> {
    let cross = from.cross(to);
    let cross_norm = cross.norm();
    if cross_norm < 1e-15 {
        // Parallel (or antipodal, which the filter never reaches for gravity).
        return Vector2::zeros();
    }
    let angle = cross_norm.atan2(from.dot(to));
    let axis = cross * (angle / cross_norm);
    let basis = s2_tangent_basis(from);
    basis.transpose() * axis
}
