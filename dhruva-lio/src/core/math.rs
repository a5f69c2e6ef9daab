//! Mathematical primitives for manifold operations.
//!
//! SO(3) exponential/logarithm maps, the right Jacobian used by the
//! error-state filter, and the tangent-plane basis for the fixed-norm
//! gravity component.

use nalgebra::{Matrix3, Matrix3x2, UnitQuaternion, Vector3};

/// Angle below which Taylor expansions replace the closed forms.
const SMALL_ANGLE: f64 = 1e-11;

/// Skew-symmetric (cross-product) matrix of a 3-vector.
///
/// `skew(a) * b == a.cross(&b)` for all `b`.
#[inline]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// SO(3) exponential map: rotation vector to rotation matrix (Rodrigues).
pub fn so3_exp(phi: &Vector3<f64>) -> Matrix3<f64> {
    let angle = phi.norm();
    if angle < SMALL_ANGLE {
        return Matrix3::identity() + skew(phi);
    }
    let axis = phi / angle;
    let k = skew(&axis);
    Matrix3::identity() + k * angle.sin() + k * k * (1.0 - angle.cos())
}

/// SO(3) logarithm map: rotation matrix to rotation vector.
pub fn so3_log(rot: &Matrix3<f64>) -> Vector3<f64> {
    let q = UnitQuaternion::from_matrix(rot);
    q.scaled_axis()
}

/// Right Jacobian of SO(3).
///
/// Relates additive perturbations of the rotation vector to multiplicative
/// perturbations of the rotation: `Exp(phi + dphi) ≈ Exp(phi) Exp(Jr(phi) dphi)`.
pub fn right_jacobian(phi: &Vector3<f64>) -> Matrix3<f64> {
    let angle = phi.norm();
    if angle < SMALL_ANGLE {
        return Matrix3::identity() - 0.5 * skew(phi);
    }
    let k = skew(phi);
    let a2 = angle * angle;
    Matrix3::identity() - k * ((1.0 - angle.cos()) / a2)
        + k * k * ((angle - angle.sin()) / (a2 * angle))
}

/// Inverse of the right Jacobian of SO(3).
///
/// Used when projecting the manifold difference of two rotations back into
/// the tangent space during the iterated measurement update.
pub fn right_jacobian_inv(phi: &Vector3<f64>) -> Matrix3<f64> {
    let angle = phi.norm();
    if angle < SMALL_ANGLE {
        return Matrix3::identity() + 0.5 * skew(phi);
    }
    let k = skew(phi);
    let half = 0.5 * angle;
    let cot_term = (1.0 - half * angle.sin() / (1.0 - angle.cos())) / (angle * angle);
    Matrix3::identity() + 0.5 * k + k * k * cot_term
}

/// Orthonormal basis of the tangent plane of the 2-sphere at `g`.
///
/// The returned columns `b1, b2` satisfy `b1 ⊥ b2 ⊥ g`. The construction is
/// deterministic in `g` so that retraction and lifting agree between calls.
/// `g` must be non-zero.
pub fn s2_tangent_basis(g: &Vector3<f64>) -> Matrix3x2<f64> {
    let n = g.normalize();
    // Pick the seed axis least aligned with n to avoid a degenerate cross.
    let seed = if n.x.abs() < 0.9 {
        Vector3::x()
    } else {
        Vector3::y()
    };
    let b1 = n.cross(&seed).normalize();
    let b2 = n.cross(&b1);
    Matrix3x2::from_columns(&[b1, b2])
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_skew_cross_product() {
        let a = Vector3::new(1.0, -2.0, 3.0);
        let b = Vector3::new(0.5, 4.0, -1.0);
        assert_relative_eq!(skew(&a) * b, a.cross(&b), epsilon = 1e-14);
    }

    #[test]
    fn test_skew_antisymmetric() {
        let a = Vector3::new(0.3, 0.7, -0.2);
        let s = skew(&a);
        assert_relative_eq!(s + s.transpose(), Matrix3::zeros(), epsilon = 1e-15);
    }

    #[test]
    fn test_exp_log_roundtrip() {
        let phi = Vector3::new(0.2, -0.4, 0.1);
        let rot = so3_exp(&phi);
        assert_relative_eq!(so3_log(&rot), phi, epsilon = 1e-9);
    }

    #[test]
    fn test_exp_zero_is_identity() {
        assert_relative_eq!(
            so3_exp(&Vector3::zeros()),
            Matrix3::identity(),
            epsilon = 1e-15
        );
    }

    #[test]
    fn test_exp_is_orthonormal() {
        let rot = so3_exp(&Vector3::new(1.2, 0.3, -2.1));
        assert_relative_eq!(rot * rot.transpose(), Matrix3::identity(), epsilon = 1e-12);
        assert_relative_eq!(rot.determinant(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_right_jacobian_inverse_pair() {
        let phi = Vector3::new(0.3, -0.1, 0.5);
        let prod = right_jacobian(&phi) * right_jacobian_inv(&phi);
        assert_relative_eq!(prod, Matrix3::identity(), epsilon = 1e-10);
    }

    #[test]
    fn test_right_jacobian_small_angle() {
        let phi = Vector3::new(1e-13, 0.0, 0.0);
        assert_relative_eq!(right_jacobian(&phi), Matrix3::identity(), epsilon = 1e-12);
        assert_relative_eq!(
            right_jacobian_inv(&phi),
            Matrix3::identity(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_s2_basis_orthonormal() {
        let g = Vector3::new(0.1, -0.3, -9.8);
        let basis = s2_tangent_basis(&g);
        let b1 = basis.column(0);
        let b2 = basis.column(1);
        assert_relative_eq!(b1.norm(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(b2.norm(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(b1.dot(&b2), 0.0, epsilon = 1e-12);
        assert_relative_eq!(b1.dot(&g.normalize()), 0.0, epsilon = 1e-12);
        assert_relative_eq!(b2.dot(&g.normalize()), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_s2_basis_near_x_axis() {
        // Gravity almost along +x exercises the alternate seed axis.
        let g = Vector3::new(9.81, 1e-3, 0.0);
        let basis = s2_tangent_basis(&g);
        assert_relative_eq!(
            basis.column(0).dot(&basis.column(1)),
            0.0,
            epsilon = 1e-12
        );
    }
}
