//! SO(3) helpers for the pose refiner.
//!
//! Provides skew-symmetric matrix construction and the exponential map used
//! by the SE(3) tangent update.

use nalgebra::{Matrix3, UnitQuaternion, Vector3};

/// Constructs the skew-symmetric matrix [v]× such that [v]× u = v × u.
///
/// ```text
/// [v]× = |  0   -v_z   v_y |
///        |  v_z   0   -v_x |
///        | -v_y  v_x    0  |
/// ```
#[inline]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y,
        v.z, 0.0, -v.x,
        -v.y, v.x, 0.0,
    )
}

/// Exponential map of so(3): a rotation-vector to a unit quaternion.
///
/// `nalgebra` handles the small-angle limit internally; this wrapper exists
/// so refinement code reads as `exp(omega) * pose`.
#[inline]
pub fn exp(omega: &Vector3<f64>) -> UnitQuaternion<f64> {
    UnitQuaternion::from_scaled_axis(*omega)
}
