//! SO(3) helpers for the error-state filter.
//!
//! Provides the hat operator, exponential and logarithm maps, and the
//! small-angle Jacobian used to re-anchor the rotation block of the
//! covariance after an error injection. The right-perturbation convention
//! `R ← R · Exp(δθ)` is used throughout the crate.

use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3};

/// Angles below this norm use the first-order series instead of the closed form.
const SMALL_ANGLE: f64 = 1e-8;

/// Constructs the skew-symmetric matrix `[v]×` such that `[v]× u = v × u`.
///
/// ```text
/// [v]× = |  0   -v_z   v_y |
///        |  v_z   0   -v_x |
///        | -v_y  v_x    0  |
/// ```
#[inline]
pub fn hat(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// Exponential map from a rotation vector to a unit quaternion.
#[inline]
pub fn exp(phi: &Vector3<f64>) -> UnitQuaternion<f64> {
    UnitQuaternion::from_scaled_axis(*phi)
}

/// Logarithm map from a unit quaternion to its rotation vector.
#[inline]
pub fn log(q: &UnitQuaternion<f64>) -> Vector3<f64> {
    q.scaled_axis()
}

/// Rotation matrix of `Exp(phi)` via the Rodrigues formula.
pub fn exp_matrix(phi: &Vector3<f64>) -> Matrix3<f64> {
    let theta = phi.norm();
    if theta < SMALL_ANGLE {
        return Matrix3::identity() + hat(phi);
    }
    Rotation3::from_scaled_axis(*phi).into_inner()
}

/// Covariance re-anchoring Jacobian `I − ½[δθ]×`.
///
/// After injecting a rotation error `δθ` the tangent space moves with the
/// nominal rotation; the rotation rows and columns of the covariance must be
/// projected through this matrix to stay consistent over long runs.
#[inline]
pub fn reset_jacobian(dtheta: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::identity() - 0.5 * hat(dtheta)
}
