//! Preemptive RANSAC over the candidate pool.
//!
//! Per frame the estimator proceeds strictly: generate the candidate pool,
//! draw the initial unmasked inlier batch, then repeat (grow inliers → score
//! → refine → sort → halve) until one candidate survives. The cancellation
//! flag is polled between phases only; a dispatch in flight always runs to
//! completion.
//!
//! All arenas are sized at construction and reused across frames, so the
//! per-frame path performs no allocation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::RelocConfig;
use crate::dispatch::{AppendList, Dispatch};
use crate::error::RelocError;
use crate::geometry::SE3;
use crate::image::KeypointImage;

use super::candidates::{generate_candidates, CandidateParams, PoseCandidate};
use super::inliers::{sample_inliers, InlierMask};
use super::prediction::ScorePredictionsImage;
use super::refine::{refine_candidates, RefineParams};
use super::score::EnergyScorer;

/// Preemptive RANSAC pose estimator with pre-sized per-frame arenas.
pub struct PreemptiveRansac {
    config: RelocConfig,
    dispatch: Arc<dyn Dispatch>,
    cancel: Arc<AtomicBool>,
    candidates: AppendList<PoseCandidate>,
    pool: Vec<PoseCandidate>,
    inliers: AppendList<usize>,
    mask: InlierMask,
    scorer: EnergyScorer,
    /// Per-candidate mode assignments, one row of `inlier_capacity` per slot.
    assignments: Vec<u8>,
}

impl PreemptiveRansac {
    pub fn new(mut config: RelocConfig, dispatch: Arc<dyn Dispatch>) -> Self {
        // Mode assignments live in a byte arena, so more than 256 modes per
        // keypoint cannot be addressed.
        if config.max_modes > u8::MAX as usize {
            warn!(
                max_modes = config.max_modes,
                "max_modes capped at {}", u8::MAX
            );
            config.max_modes = u8::MAX as usize;
        }
        let inlier_capacity = config.inlier_capacity();
        let max_candidates = config.max_candidates;
        Self {
            dispatch,
            cancel: Arc::new(AtomicBool::new(false)),
            candidates: AppendList::with_capacity(max_candidates),
            pool: Vec::with_capacity(max_candidates),
            inliers: AppendList::with_capacity(inlier_capacity),
            mask: InlierMask::new(0),
            scorer: EnergyScorer::new(max_candidates),
            assignments: vec![0; max_candidates * inlier_capacity],
            config,
        }
    }

    pub fn config(&self) -> &RelocConfig {
        &self.config
    }

    /// The single-writer cancellation flag; raise it to abort between phases.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Estimate the camera-to-scene pose of one frame.
    pub fn estimate_pose(
        &mut self,
        keypoints: &KeypointImage,
        predictions: &ScorePredictionsImage,
    ) -> Result<SE3, RelocError> {
        if keypoints.dims() != predictions.dims() {
            return Err(RelocError::ShapeMismatch {
                expected: keypoints.dims(),
                found: predictions.dims(),
            });
        }
        self.check_cancelled()?;

        // GENERATE: fill the candidate pool.
        let candidate_params = CandidateParams {
            use_all_modes: self.config.use_all_modes,
            check_min_distance: self.config.check_min_distance,
            check_rigid_transform: self.config.check_rigid_transform,
            min_separation: self.config.min_separation,
            rigid_tolerance: self.config.rigid_tolerance,
            retries: self.config.candidate_retries,
            rng_seed: self.config.rng_seed,
        };
        self.candidates.clear();
        generate_candidates(
            keypoints,
            predictions,
            &candidate_params,
            self.dispatch.as_ref(),
            &self.candidates,
        );
        self.pool.clear();
        self.pool.extend_from_slice(self.candidates.as_slice());
        if self.pool.is_empty() {
            return Err(RelocError::EmptyCandidatePool);
        }
        debug!(candidates = self.pool.len(), "generated candidate pool");

        // Initial unmasked inlier batch; later batches honour the mask.
        self.mask.reset(keypoints.len());
        self.inliers.clear();
        sample_inliers(
            keypoints,
            predictions,
            self.config.inlier_batch,
            false,
            0,
            self.config.rng_seed,
            self.dispatch.as_ref(),
            &self.mask,
            &self.inliers,
        );

        let refine_params = RefineParams {
            lm_max_iters: self.config.lm_max_iters,
            lm_tol_rel: self.config.lm_tol_rel,
        };
        let max_rounds = self.config.effective_max_rounds();
        let stride = self.config.inlier_capacity();
        let mut round = 0usize;

        while self.pool.len() > 1 {
            self.check_cancelled()?;
            if round >= max_rounds {
                debug!(round, survivors = self.pool.len(), "round budget exhausted");
                return Err(RelocError::Timeout);
            }
            round += 1;

            sample_inliers(
                keypoints,
                predictions,
                self.config.inlier_batch,
                true,
                round as u64,
                self.config.rng_seed,
                self.dispatch.as_ref(),
                &self.mask,
                &self.inliers,
            );
            let inlier_set = self.inliers.as_slice();

            self.scorer.score(
                &mut self.pool,
                keypoints,
                predictions,
                inlier_set,
                self.dispatch.as_ref(),
            );
            refine_candidates(
                &mut self.pool,
                keypoints,
                predictions,
                inlier_set,
                &refine_params,
                self.dispatch.as_ref(),
                &mut self.assignments,
                stride,
            );

            halve_pool(&mut self.pool);
            debug!(
                round,
                survivors = self.pool.len(),
                inliers = inlier_set.len(),
                best_energy = self.pool[0].energy,
                "halving round complete"
            );
        }

        Ok(self.pool[0].pose)
    }

    fn check_cancelled(&self) -> Result<(), RelocError> {
        if self.cancel.load(Ordering::SeqCst) {
            return Err(RelocError::Cancelled);
        }
        Ok(())
    }
}

/// Sort ascending by energy (ties broken by generation slot, keeping the
/// order stable across backends) and keep the best ⌈n/2⌉.
fn halve_pool(pool: &mut Vec<PoseCandidate>) {
    pool.sort_by(|a, b| a.energy.total_cmp(&b.energy).then(a.slot.cmp(&b.slot)));
    let keep = pool.len().div_ceil(2);
    pool.truncate(keep);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Serial;
    use crate::forest::Mode;
    use crate::image::Keypoint;
    use crate::relocaliser::candidates::Correspondence;
    use crate::relocaliser::prediction::ScorePrediction;
    use approx::assert_relative_eq;
    use nalgebra::{Matrix3, UnitQuaternion, Vector3};

    fn small_config() -> RelocConfig {
        RelocConfig {
            max_candidates: 64,
            inlier_batch: 64,
            candidate_retries: 200,
            ..Default::default()
        }
    }

    fn estimator(config: RelocConfig) -> PreemptiveRansac {
        PreemptiveRansac::new(config, Arc::new(Serial))
    }

    /// A frame whose predictions place every keypoint at `pose(keypoint)`.
    fn frame_under(
        positions: &[Vector3<f64>],
        pose: &SE3,
    ) -> (KeypointImage, ScorePredictionsImage) {
        let keypoints: Vec<Keypoint> = positions
            .iter()
            .map(|p| Keypoint {
                position: *p,
                colour: [0; 3],
                valid: true,
            })
            .collect();
        let predictions: Vec<ScorePrediction> = positions
            .iter()
            .map(|p| ScorePrediction {
                modes: vec![Mode::isotropic(pose.transform_point(p), 10)],
            })
            .collect();
        let n = positions.len();
        (
            KeypointImage::from_raw(n, 1, keypoints).unwrap(),
            ScorePredictionsImage::from_raw(n, 1, predictions).unwrap(),
        )
    }

    fn canonical_triple() -> Vec<Vector3<f64>> {
        vec![
            Vector3::new(0.0, 0.0, 1.0),
            Vector3::new(1.0, 0.0, 1.0),
            Vector3::new(0.0, 1.0, 1.0),
        ]
    }

    #[test]
    fn recovers_pure_translation_exactly() {
        let truth = SE3 {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::new(2.0, 3.0, 4.0),
        };
        let (keypoints, predictions) = frame_under(&canonical_triple(), &truth);
        let pose = estimator(small_config())
            .estimate_pose(&keypoints, &predictions)
            .unwrap();

        assert_relative_eq!(pose.translation, truth.translation, epsilon = 1e-5);
        assert_relative_eq!(
            pose.rotation_matrix(),
            Matrix3::identity(),
            epsilon = 1e-5
        );
    }

    #[test]
    fn recovers_rotation_about_z() {
        let truth = SE3 {
            rotation: UnitQuaternion::from_axis_angle(
                &Vector3::z_axis(),
                std::f64::consts::FRAC_PI_6,
            ),
            translation: Vector3::zeros(),
        };
        let (keypoints, predictions) = frame_under(&canonical_triple(), &truth);
        let pose = estimator(small_config())
            .estimate_pose(&keypoints, &predictions)
            .unwrap();

        let rotation_error = (pose.rotation_matrix() * truth.rotation_matrix().transpose()
            - Matrix3::identity())
        .norm();
        assert!(rotation_error < 1e-4, "rotation error {rotation_error}");
        assert!(pose.translation.norm() < 1e-4);
    }

    #[test]
    fn all_empty_predictions_fail_with_empty_pool() {
        let keypoints = KeypointImage::filled(
            8,
            1,
            Keypoint {
                position: Vector3::new(0.0, 0.0, 1.0),
                colour: [0; 3],
                valid: true,
            },
        );
        let predictions = ScorePredictionsImage::filled(8, 1, ScorePrediction::default());
        let result = estimator(small_config()).estimate_pose(&keypoints, &predictions);
        assert_eq!(result, Err(RelocError::EmptyCandidatePool));
    }

    #[test]
    fn two_usable_keypoints_fail_with_empty_pool() {
        let positions = vec![Vector3::new(0.0, 0.0, 1.0), Vector3::new(1.0, 0.0, 1.0)];
        let (keypoints, predictions) = frame_under(&positions, &SE3::identity());
        let result = estimator(small_config()).estimate_pose(&keypoints, &predictions);
        assert_eq!(result, Err(RelocError::EmptyCandidatePool));
    }

    #[test]
    fn zero_round_budget_times_out() {
        let config = RelocConfig {
            max_rounds: Some(0),
            ..small_config()
        };
        let (keypoints, predictions) = frame_under(&canonical_triple(), &SE3::identity());
        let result = estimator(config).estimate_pose(&keypoints, &predictions);
        assert_eq!(result, Err(RelocError::Timeout));
    }

    #[test]
    fn raised_flag_cancels_before_the_first_dispatch() {
        let (keypoints, predictions) = frame_under(&canonical_triple(), &SE3::identity());
        let mut ransac = estimator(small_config());
        ransac.cancel_flag().store(true, Ordering::SeqCst);
        let result = ransac.estimate_pose(&keypoints, &predictions);
        assert_eq!(result, Err(RelocError::Cancelled));
    }

    #[test]
    fn mismatched_image_shapes_are_rejected() {
        let (keypoints, _) = frame_under(&canonical_triple(), &SE3::identity());
        let predictions = ScorePredictionsImage::filled(2, 1, ScorePrediction::default());
        let result = estimator(small_config()).estimate_pose(&keypoints, &predictions);
        assert_eq!(
            result,
            Err(RelocError::ShapeMismatch {
                expected: (3, 1),
                found: (2, 1),
            })
        );
    }

    #[test]
    fn serial_runs_are_byte_identical_under_a_fixed_seed() {
        let truth = SE3 {
            rotation: UnitQuaternion::from_euler_angles(0.1, -0.2, 0.3),
            translation: Vector3::new(0.4, -1.2, 2.5),
        };
        let positions = vec![
            Vector3::new(0.0, 0.0, 1.0),
            Vector3::new(1.0, 0.0, 1.0),
            Vector3::new(0.0, 1.0, 1.0),
            Vector3::new(1.0, 1.0, 2.0),
            Vector3::new(-0.7, 0.4, 1.3),
        ];
        let (keypoints, predictions) = frame_under(&positions, &truth);

        let first = estimator(small_config())
            .estimate_pose(&keypoints, &predictions)
            .unwrap();
        let second = estimator(small_config())
            .estimate_pose(&keypoints, &predictions)
            .unwrap();

        // Exact equality, not approximate: the serial backend plus the fixed
        // seed makes the whole run deterministic.
        assert_eq!(first.translation, second.translation);
        assert_eq!(
            first.rotation.clone().into_inner().coords,
            second.rotation.clone().into_inner().coords
        );
    }

    #[test]
    fn reusing_the_estimator_across_frames_is_clean() {
        let truth_a = SE3 {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::new(1.0, 0.0, 0.0),
        };
        let truth_b = SE3 {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::new(0.0, 5.0, 0.0),
        };
        let (kp_a, pred_a) = frame_under(&canonical_triple(), &truth_a);
        let (kp_b, pred_b) = frame_under(&canonical_triple(), &truth_b);

        let mut ransac = estimator(small_config());
        let pose_a = ransac.estimate_pose(&kp_a, &pred_a).unwrap();
        let pose_b = ransac.estimate_pose(&kp_b, &pred_b).unwrap();
        let pose_a_again = ransac.estimate_pose(&kp_a, &pred_a).unwrap();

        assert_relative_eq!(pose_a.translation, truth_a.translation, epsilon = 1e-5);
        assert_relative_eq!(pose_b.translation, truth_b.translation, epsilon = 1e-5);
        assert_eq!(pose_a.translation, pose_a_again.translation);
    }

    #[test]
    fn oversized_max_modes_is_capped_to_the_assignment_byte_range() {
        let config = RelocConfig {
            max_modes: 1000,
            ..small_config()
        };
        let ransac = estimator(config);
        assert_eq!(ransac.config().max_modes, u8::MAX as usize);
    }

    #[test]
    fn halving_keeps_the_best_candidate_and_breaks_ties_by_slot() {
        let zero = Correspondence {
            camera: Vector3::zeros(),
            scene: Vector3::zeros(),
            keypoint: 0,
            mode: 0,
        };
        let make = |energy: f64, slot: usize| PoseCandidate {
            pose: SE3::identity(),
            correspondences: [zero; 3],
            energy,
            slot,
        };
        let mut pool = vec![make(3.0, 4), make(1.0, 7), make(1.0, 2), make(9.0, 0), make(2.0, 1)];
        halve_pool(&mut pool);

        // ⌈5/2⌉ = 3 survivors, best energy first, equal energies by slot.
        assert_eq!(pool.len(), 3);
        assert_eq!(pool[0].energy, 1.0);
        assert_eq!(pool[0].slot, 2);
        assert_eq!(pool[1].slot, 7);
        assert_eq!(pool[2].energy, 2.0);

        // The minimum energy never increases across further halvings.
        let best = pool[0].energy;
        halve_pool(&mut pool);
        assert!(pool[0].energy <= best);
    }
}
