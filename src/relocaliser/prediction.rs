//! Per-keypoint scene-coordinate predictions.
//!
//! After forest evaluation each keypoint holds one leaf per tree; merging
//! gathers the leaf-attached modal clusters and reduces them to at most
//! `max_modes` output modes by greedy radius clustering. The resulting
//! [`ScorePrediction`] is the Gaussian mixture every later stage (candidate
//! sampling, energy scoring, refinement) evaluates.

use nalgebra::{Matrix3, Vector3};

use crate::dispatch::{Dispatch, SharedSlice};
use crate::forest::{Mode, ScoreForest};
use crate::image::{Image, LeafImage};

/// ln(2π), for the Gaussian normalisation constant.
const LN_2PI: f64 = 1.837_877_066_409_345_3;

/// A mixture of at most `max_modes` modal clusters, heaviest first.
///
/// An empty prediction marks the keypoint unusable.
#[derive(Debug, Clone, Default)]
pub struct ScorePrediction {
    pub modes: Vec<Mode>,
}

impl ScorePrediction {
    pub fn is_empty(&self) -> bool {
        self.modes.is_empty()
    }

    /// Total sample count `N` across all modes.
    pub fn total_samples(&self) -> f64 {
        self.modes.iter().map(|m| f64::from(m.samples)).sum()
    }

    /// Mixture likelihood `Σ_k (n_k / N) · 𝒩(point; μ_k, Σ_k)`.
    pub fn mixture_likelihood(&self, point: &Vector3<f64>) -> f64 {
        let total = self.total_samples();
        if total <= 0.0 {
            return 0.0;
        }
        self.modes
            .iter()
            .map(|m| f64::from(m.samples) / total * mode_density(m, point))
            .sum()
    }

    /// The mode maximising `(n_k / N) · 𝒩(point; μ_k, Σ_k)`, with its
    /// mixture weight `n_k / N`.
    pub fn best_mode_for(&self, point: &Vector3<f64>) -> Option<(usize, f64)> {
        let total = self.total_samples();
        if total <= 0.0 {
            return None;
        }
        let mut best: Option<(usize, f64, f64)> = None;
        for (k, mode) in self.modes.iter().enumerate() {
            let weight = f64::from(mode.samples) / total;
            let responsibility = weight * mode_density(mode, point);
            match best {
                Some((_, _, r)) if r >= responsibility => {}
                _ => best = Some((k, weight, responsibility)),
            }
        }
        best.map(|(k, weight, _)| (k, weight))
    }
}

/// Density of one mode at `point`: `(2π)^{-3/2} |Σ|^{-1/2} exp(-½ δᵀΣ⁻¹δ)`.
pub fn mode_density(mode: &Mode, point: &Vector3<f64>) -> f64 {
    let delta = point - mode.mean;
    let mahalanobis = delta.dot(&(mode.inv_cov * delta));
    (-0.5 * (3.0 * LN_2PI + mode.log_det_cov + mahalanobis)).exp()
}

/// Per-pixel predictions for one frame.
pub type ScorePredictionsImage = Image<ScorePrediction>;

/// Parameters of the prediction merger.
#[derive(Debug, Clone, Copy)]
pub struct MergeParams {
    /// Output cap `K` per keypoint.
    pub max_modes: usize,
    /// Gather cap per leaf, `K_in`.
    pub max_modes_per_leaf: usize,
    /// Merge radius between mode means, metres.
    pub merge_radius: f64,
}

/// Merge the per-tree leaf modes of every keypoint into its prediction.
///
/// Keypoints are independent; the work is one dispatch over the raster. Each
/// output prediction is rebuilt in place, so the arena's mode vectors are
/// reused across frames.
pub fn merge_predictions(
    forest: &ScoreForest,
    leaves: &LeafImage,
    params: &MergeParams,
    dispatch: &dyn Dispatch,
    out: &mut ScorePredictionsImage,
) {
    debug_assert_eq!(leaves.dims(), out.dims());
    let predictions = SharedSlice::new(out.as_mut_slice());

    dispatch.for_each(predictions.len(), &|raster| {
        // SAFETY: each dispatch slot touches only its own raster index.
        let prediction = unsafe { predictions.slot_mut(raster) };
        merge_for_keypoint(forest, leaves.leaves(raster), params, prediction);
    });
}

/// Greedy radius clustering of the gathered modes for one keypoint.
fn merge_for_keypoint(
    forest: &ScoreForest,
    leaves: &[u32],
    params: &MergeParams,
    out: &mut ScorePrediction,
) {
    out.modes.clear();

    // Gather up to `tree_count * max_modes_per_leaf` candidates, then order
    // them heaviest-first so clustering favours well-supported modes.
    let mut gathered: Vec<&Mode> = Vec::with_capacity(leaves.len() * params.max_modes_per_leaf);
    for (tree, &leaf) in forest.trees().iter().zip(leaves.iter()) {
        gathered.extend(tree.modes(leaf).iter().take(params.max_modes_per_leaf));
    }
    gathered.sort_by(|a, b| b.samples.cmp(&a.samples));

    let mut clusters: Vec<WorkingCluster> = Vec::with_capacity(params.max_modes);
    let radius_sq = params.merge_radius * params.merge_radius;
    for candidate in gathered {
        let nearest = clusters
            .iter()
            .enumerate()
            .map(|(i, c)| (i, (c.mode.mean - candidate.mean).norm_squared()))
            .min_by(|a, b| a.1.total_cmp(&b.1));
        match nearest {
            Some((i, dist_sq)) if dist_sq <= radius_sq => clusters[i].absorb(candidate),
            _ if clusters.len() < params.max_modes => {
                clusters.push(WorkingCluster::new(*candidate))
            }
            _ => {}
        }
    }

    for mut cluster in clusters {
        cluster.finalise();
        out.modes.push(cluster.mode);
    }
    out.modes.sort_by(|a, b| b.samples.cmp(&a.samples));
}

/// A cluster being built: the running mode plus, once a merge has happened,
/// the running covariance `Σ` (sample-count weighted average).
struct WorkingCluster {
    mode: Mode,
    cov: Matrix3<f64>,
    merged: bool,
}

impl WorkingCluster {
    fn new(mode: Mode) -> Self {
        Self {
            mode,
            cov: Matrix3::zeros(),
            merged: false,
        }
    }

    fn absorb(&mut self, other: &Mode) {
        if !self.merged {
            match self.mode.inv_cov.try_inverse() {
                Some(cov) => self.cov = cov,
                // Singular keeper covariance: keep the heavier operand as is.
                None => return,
            }
        }
        let Some(other_cov) = other.inv_cov.try_inverse() else {
            return;
        };
        let n_self = f64::from(self.mode.samples);
        let n_other = f64::from(other.samples);
        let n = n_self + n_other;
        self.mode.mean = (n_self * self.mode.mean + n_other * other.mean) / n;
        self.cov = (n_self * self.cov + n_other * other_cov) / n;
        for i in 0..3 {
            let blended =
                (n_self * f64::from(self.mode.colour[i]) + n_other * f64::from(other.colour[i])) / n;
            self.mode.colour[i] = blended.round() as u8;
        }
        self.mode.samples += other.samples;
        self.merged = true;
    }

    fn finalise(&mut self) {
        if !self.merged {
            return;
        }
        if let Some(inv) = self.cov.try_inverse() {
            self.mode.inv_cov = inv;
            self.mode.log_det_cov = self.cov.determinant().ln();
        }
        // A singular merged covariance keeps the pre-merge inverse.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Serial;
    use crate::forest::test_support::stump_forest;
    use approx::assert_relative_eq;

    fn params() -> MergeParams {
        MergeParams {
            max_modes: 10,
            max_modes_per_leaf: 50,
            merge_radius: 0.005,
        }
    }

    fn merge_single(forest: &ScoreForest, leaves: &[u32], params: &MergeParams) -> ScorePrediction {
        let mut out = ScorePrediction::default();
        merge_for_keypoint(forest, leaves, params, &mut out);
        out
    }

    #[test]
    fn orders_modes_heaviest_first() {
        let forest = stump_forest(
            vec![
                Mode::isotropic(Vector3::new(0.0, 0.0, 0.0), 3),
                Mode::isotropic(Vector3::new(1.0, 0.0, 0.0), 20),
                Mode::isotropic(Vector3::new(0.0, 1.0, 0.0), 7),
            ],
            vec![],
        );
        let prediction = merge_single(&forest, &[0], &params());
        let counts: Vec<u32> = prediction.modes.iter().map(|m| m.samples).collect();
        assert_eq!(counts, vec![20, 7, 3]);
    }

    #[test]
    fn merges_modes_within_radius() {
        let forest = stump_forest(
            vec![
                Mode::isotropic(Vector3::new(0.0, 0.0, 0.0), 30),
                Mode::isotropic(Vector3::new(0.004, 0.0, 0.0), 10),
            ],
            vec![],
        );
        let prediction = merge_single(&forest, &[0], &params());
        assert_eq!(prediction.modes.len(), 1);
        let merged = &prediction.modes[0];
        assert_eq!(merged.samples, 40);
        // Weighted mean: (30·0 + 10·0.004) / 40.
        assert_relative_eq!(merged.mean.x, 0.001, epsilon = 1e-12);
        // Unit covariances average back to the identity.
        assert_relative_eq!(merged.inv_cov, Matrix3::identity(), epsilon = 1e-12);
        assert_relative_eq!(merged.log_det_cov, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn keeps_distant_modes_separate() {
        let forest = stump_forest(
            vec![
                Mode::isotropic(Vector3::new(0.0, 0.0, 0.0), 5),
                Mode::isotropic(Vector3::new(1.0, 0.0, 0.0), 5),
            ],
            vec![],
        );
        let prediction = merge_single(&forest, &[0], &params());
        assert_eq!(prediction.modes.len(), 2);
    }

    #[test]
    fn caps_output_at_max_modes() {
        let modes: Vec<Mode> = (0..8)
            .map(|i| Mode::isotropic(Vector3::new(i as f64, 0.0, 0.0), 8 - i as u32))
            .collect();
        let forest = stump_forest(modes, vec![]);
        let p = MergeParams {
            max_modes: 3,
            ..params()
        };
        let prediction = merge_single(&forest, &[0], &p);
        assert_eq!(prediction.modes.len(), 3);
        // The heaviest three survive; the rest are discarded.
        assert_eq!(
            prediction.modes.iter().map(|m| m.samples).collect::<Vec<_>>(),
            vec![8, 7, 6]
        );
    }

    #[test]
    fn empty_leaves_yield_unusable_prediction() {
        let forest = stump_forest(vec![], vec![]);
        let prediction = merge_single(&forest, &[1], &params());
        assert!(prediction.is_empty());
    }

    #[test]
    fn dispatch_fills_every_pixel() {
        let forest = stump_forest(
            vec![Mode::isotropic(Vector3::new(1.0, 2.0, 3.0), 4)],
            vec![],
        );
        let mut leaves = LeafImage::new(2, 2, 1);
        leaves.as_mut_slice().fill(0);
        let mut out = ScorePredictionsImage::filled(2, 2, ScorePrediction::default());
        merge_predictions(&forest, &leaves, &params(), &Serial, &mut out);
        assert!(out.as_slice().iter().all(|p| p.modes.len() == 1));
    }

    #[test]
    fn density_matches_closed_form_for_unit_gaussian() {
        let mode = Mode::isotropic(Vector3::zeros(), 1);
        let at_mean = mode_density(&mode, &Vector3::zeros());
        // (2π)^{-3/2} at the mean of a unit Gaussian.
        assert_relative_eq!(at_mean, (2.0 * std::f64::consts::PI).powf(-1.5), epsilon = 1e-12);
        let off = mode_density(&mode, &Vector3::new(1.0, 0.0, 0.0));
        assert_relative_eq!(off, at_mean * (-0.5f64).exp(), epsilon = 1e-12);
    }

    #[test]
    fn best_mode_prefers_responsibility_not_weight() {
        let prediction = ScorePrediction {
            modes: vec![
                Mode::isotropic(Vector3::new(10.0, 0.0, 0.0), 100),
                Mode::isotropic(Vector3::new(0.0, 0.0, 0.0), 1),
            ],
        };
        // Near the light mode, the heavy mode's density is negligible.
        let (k, weight) = prediction.best_mode_for(&Vector3::new(0.1, 0.0, 0.0)).unwrap();
        assert_eq!(k, 1);
        assert_relative_eq!(weight, 1.0 / 101.0, epsilon = 1e-12);
    }
}
