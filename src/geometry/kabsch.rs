//! Weighted Kabsch alignment between paired 3D point sets.
//!
//! Solves for the rigid transform minimising `Σ wᵢ ‖R xᵢ + t − yᵢ‖²` in
//! closed form: centre both sets on their weighted centroids, take the SVD of
//! the cross-covariance and fix up a possible reflection. Points are fed in
//! through [`PointMoments`] so callers can stream correspondences without
//! materialising them.

use nalgebra::{Matrix3, Vector3};

use super::SE3;

/// Streaming accumulator of the weighted moments Kabsch needs.
///
/// Accumulates `Σw`, `Σw·x`, `Σw·y` and `Σw·x·yᵀ`; the centred
/// cross-covariance is recovered at solve time, so a single pass over the
/// correspondences suffices.
#[derive(Debug, Clone)]
pub struct PointMoments {
    weight: f64,
    camera_sum: Vector3<f64>,
    scene_sum: Vector3<f64>,
    cross_sum: Matrix3<f64>,
}

impl PointMoments {
    pub fn new() -> Self {
        Self {
            weight: 0.0,
            camera_sum: Vector3::zeros(),
            scene_sum: Vector3::zeros(),
            cross_sum: Matrix3::zeros(),
        }
    }

    /// Add one correspondence `camera → scene` with weight `w > 0`.
    pub fn add(&mut self, camera: &Vector3<f64>, scene: &Vector3<f64>, w: f64) {
        self.weight += w;
        self.camera_sum += w * camera;
        self.scene_sum += w * scene;
        self.cross_sum += w * camera * scene.transpose();
    }

    /// Solve for the transform mapping camera points onto scene points.
    ///
    /// Returns `None` when the accumulated weight vanishes or the SVD cannot
    /// produce a proper rotation (degenerate, e.g. collinear, input).
    pub fn solve(&self) -> Option<SE3> {
        if self.weight <= f64::EPSILON {
            return None;
        }
        let finite = self.weight.is_finite()
            && self.camera_sum.iter().all(|v| v.is_finite())
            && self.scene_sum.iter().all(|v| v.is_finite())
            && self.cross_sum.iter().all(|v| v.is_finite());
        if !finite {
            return None;
        }
        let camera_centroid = self.camera_sum / self.weight;
        let scene_centroid = self.scene_sum / self.weight;

        // Centred cross-covariance: Σw·x·yᵀ − Σw · x̄·ȳᵀ.
        let h = self.cross_sum - self.weight * camera_centroid * scene_centroid.transpose();

        let svd = h.svd(true, true);
        let u = svd.u?;
        let v_t = svd.v_t?;

        let mut rotation = v_t.transpose() * u.transpose();
        if rotation.determinant() < 0.0 {
            // Reflection case: flip the singular direction with the smallest
            // singular value (nalgebra orders them descending, column 2).
            let mut v = v_t.transpose();
            for i in 0..3 {
                v[(i, 2)] = -v[(i, 2)];
            }
            rotation = v * u.transpose();
        }

        if !rotation.iter().all(|e| e.is_finite()) {
            return None;
        }

        let translation = scene_centroid - rotation * camera_centroid;
        Some(SE3::from_rt(rotation, translation))
    }
}

impl Default for PointMoments {
    fn default() -> Self {
        Self::new()
    }
}

/// Unit-weight Kabsch over paired slices.
pub fn kabsch(camera: &[Vector3<f64>], scene: &[Vector3<f64>]) -> Option<SE3> {
    debug_assert_eq!(camera.len(), scene.len());
    let mut moments = PointMoments::new();
    for (c, s) in camera.iter().zip(scene.iter()) {
        moments.add(c, s, 1.0);
    }
    moments.solve()
}
