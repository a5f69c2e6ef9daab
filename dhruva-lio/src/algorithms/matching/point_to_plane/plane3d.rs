//! 3D plane representation for point-to-plane registration.

use nalgebra::{Matrix3, Vector3};

use crate::core::types::Point3D;

/// A plane in 3D space represented as n·p + d = 0 with ‖n‖ = 1.
#[derive(Debug, Clone, Copy)]
pub struct Plane3D {
    /// Unit normal.
    pub normal: Vector3<f64>,
    /// Signed offset from the origin.
    pub d: f64,
}

impl Plane3D {
    /// Fit a plane through a set of points by solving `A·x = -1` in least
    /// squares, where the rows of `A` are the point coordinates.
    ///
    /// The fit is accepted only when every input point lies within
    /// `threshold` metres of the plane; otherwise the neighbourhood is not
    /// planar enough to constrain the registration and `None` is returned.
    /// Also returns `None` for fewer than 3 points or a degenerate system.
    pub fn fit(points: &[Point3D], threshold: f64) -> Option<Self> {
        if points.len() < 3 {
            return None;
        }

        // Normal equations of A x = -1: (AᵀA) x = -Σ pᵢ
        let mut ata = Matrix3::zeros();
        let mut atb = Vector3::zeros();
        for p in points {
            ata += p.position * p.position.transpose();
            atb -= p.position;
        }

        let x = ata.try_inverse()? * atb;
        let norm = x.norm();
        if norm < 1e-10 {
            return None;
        }

        let normal = x / norm;
        let d = 1.0 / norm;

        for p in points {
            if (normal.dot(&p.position) + d).abs() > threshold {
                return None;
            }
        }

        Some(Self { normal, d })
    }

    /// Signed distance from a point to the plane.
    #[inline]
    pub fn distance(&self, p: &Vector3<f64>) -> f64 {
        self.normal.dot(p) + self.d
    }
}
