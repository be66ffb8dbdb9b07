//! Rigid-body transform type shared by the whole relocaliser.

use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3};

/// A rigid transform `y = R x + t` from the camera (eye) frame into the
/// scene frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Build from a rotation matrix and translation vector.
    ///
    /// The matrix is re-orthonormalised through the quaternion conversion, so
    /// small numerical drift in the input is absorbed here.
    pub fn from_rt(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation: UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(
                rotation,
            )),
            translation,
        }
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    pub fn inverse(&self) -> Self {
        let inv_rotation = self.rotation.inverse();
        Self {
            rotation: inv_rotation,
            translation: -(inv_rotation * self.translation),
        }
    }

    /// `self ∘ other`: apply `other` first, then `self`.
    pub fn compose(&self, other: &Self) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn inverse_round_trips_points() {
        let t = SE3 {
            rotation: UnitQuaternion::from_euler_angles(0.3, -0.2, 0.9),
            translation: Vector3::new(1.0, -2.0, 0.5),
        };
        let p = Vector3::new(0.4, 0.1, 2.0);
        let q = t.inverse().transform_point(&t.transform_point(&p));
        assert_relative_eq!(p, q, epsilon = 1e-12);
    }

    #[test]
    fn compose_matches_sequential_application() {
        let a = SE3 {
            rotation: UnitQuaternion::from_euler_angles(0.1, 0.2, 0.3),
            translation: Vector3::new(1.0, 0.0, 0.0),
        };
        let b = SE3 {
            rotation: UnitQuaternion::from_euler_angles(-0.4, 0.0, 0.2),
            translation: Vector3::new(0.0, 2.0, -1.0),
        };
        let p = Vector3::new(0.5, 0.6, 0.7);
        let composed = a.compose(&b).transform_point(&p);
        let sequential = a.transform_point(&b.transform_point(&p));
        assert_relative_eq!(composed, sequential, epsilon = 1e-12);
    }

    #[test]
    fn from_rt_preserves_rotation_action() {
        let q = UnitQuaternion::from_euler_angles(0.7, -0.1, 0.4);
        let t = SE3::from_rt(q.to_rotation_matrix().into_inner(), Vector3::zeros());
        let p = Vector3::new(1.0, 2.0, 3.0);
        assert_relative_eq!(t.transform_point(&p), q * p, epsilon = 1e-12);
    }
}
