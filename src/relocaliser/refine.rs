//! Per-candidate pose refinement over the inlier set.
//!
//! Refinement fixes, for each inlier, the prediction mode with the highest
//! responsibility under the candidate's current pose, reinitialises the pose
//! with a weighted Kabsch solve on those correspondences, and polishes it
//! with a damped Levenberg-Marquardt descent on the SE(3) manifold (tangent
//! update through the exponential map).
//!
//! Numerical failure is local: a candidate that cannot be refined keeps its
//! previous pose and is handed an infinite energy, which demotes it at the
//! next halving.

use nalgebra::{Matrix6, Vector3, Vector6};

use crate::dispatch::{Dispatch, SharedSlice};
use crate::geometry::{so3, PointMoments, SE3};
use crate::image::KeypointImage;

use super::candidates::PoseCandidate;
use super::prediction::ScorePredictionsImage;

/// Levenberg-Marquardt schedule, matching the damping policy used across the
/// optimisation stack: start soft, harden ×10 on rejection, relax ×0.1 on
/// acceptance.
const LM_INITIAL_LAMBDA: f64 = 1e-3;
const LM_LAMBDA_UP: f64 = 10.0;
const LM_LAMBDA_DOWN: f64 = 0.1;
const LM_MIN_LAMBDA: f64 = 1e-10;
const LM_MAX_LAMBDA: f64 = 1e10;

/// Refinement tuning.
#[derive(Debug, Clone, Copy)]
pub struct RefineParams {
    pub lm_max_iters: usize,
    pub lm_tol_rel: f64,
}

/// Refine every candidate in `pool` in one dispatch.
///
/// `assignments` is the pre-sized arena of per-candidate mode choices; row
/// `c` covers `[c * stride, c * stride + inliers.len())`.
#[allow(clippy::too_many_arguments)]
pub fn refine_candidates(
    pool: &mut [PoseCandidate],
    keypoints: &KeypointImage,
    predictions: &ScorePredictionsImage,
    inliers: &[usize],
    params: &RefineParams,
    dispatch: &dyn Dispatch,
    assignments: &mut [u8],
    stride: usize,
) {
    if pool.is_empty() || inliers.is_empty() {
        return;
    }
    debug_assert!(inliers.len() <= stride);
    debug_assert!(pool.len() * stride <= assignments.len());

    let shared_pool = SharedSlice::new(pool);
    let shared_assignments = SharedSlice::new(assignments);

    dispatch.for_each(shared_pool.len(), &|c| {
        // SAFETY: slot `c` exclusively owns candidate `c` and assignment row
        // `[c * stride, (c + 1) * stride)`.
        let candidate = unsafe { shared_pool.slot_mut(c) };
        let row = unsafe { shared_assignments.range_mut(c * stride, inliers.len()) };
        if refine_one(candidate, keypoints, predictions, inliers, row, params).is_none() {
            candidate.energy = f64::INFINITY;
        }
    });
}

/// Refine a single candidate in place; `None` demotes it.
fn refine_one(
    candidate: &mut PoseCandidate,
    keypoints: &KeypointImage,
    predictions: &ScorePredictionsImage,
    inliers: &[usize],
    assignment: &mut [u8],
    params: &RefineParams,
) -> Option<()> {
    // Step 1: pick, per inlier, the mode with the highest responsibility for
    // the current projection.
    for (i, &raster) in inliers.iter().enumerate() {
        let projected = candidate
            .pose
            .transform_point(&keypoints.as_slice()[raster].position);
        let (mode, _) = predictions.as_slice()[raster].best_mode_for(&projected)?;
        assignment[i] = mode as u8;
    }

    // Step 2: weighted Kabsch reinitialisation on the assigned pairs.
    let mut moments = PointMoments::new();
    for (i, &raster) in inliers.iter().enumerate() {
        let (camera, scene, weight) =
            correspondence(keypoints, predictions, raster, assignment[i]);
        moments.add(&camera, &scene, weight);
    }
    let mut pose = moments.solve()?;

    // Step 3: Levenberg-Marquardt on the 6-DoF tangent.
    let mut lambda = LM_INITIAL_LAMBDA;
    let mut cost = weighted_cost(&pose, keypoints, predictions, inliers, assignment);
    if !cost.is_finite() {
        return None;
    }

    for _ in 0..params.lm_max_iters {
        if cost <= 0.0 {
            break;
        }
        let (hessian, gradient) =
            normal_equations(&pose, keypoints, predictions, inliers, assignment);

        let mut damped = hessian;
        for i in 0..6 {
            damped[(i, i)] += lambda * damped[(i, i)].max(1e-12);
        }
        let delta = damped.lu().solve(&(-gradient))?;

        let trial = apply_tangent(&pose, &delta);
        let trial_cost = weighted_cost(&trial, keypoints, predictions, inliers, assignment);

        if trial_cost.is_finite() && trial_cost < cost {
            let relative_drop = (cost - trial_cost) / cost;
            pose = trial;
            cost = trial_cost;
            lambda = (lambda * LM_LAMBDA_DOWN).max(LM_MIN_LAMBDA);
            if relative_drop < params.lm_tol_rel {
                break;
            }
        } else {
            lambda = (lambda * LM_LAMBDA_UP).min(LM_MAX_LAMBDA);
        }
    }

    candidate.pose = pose;
    Some(())
}

/// The assigned correspondence of one inlier: camera point, scene mean and
/// mixture weight `n_k / N`.
fn correspondence(
    keypoints: &KeypointImage,
    predictions: &ScorePredictionsImage,
    raster: usize,
    mode: u8,
) -> (Vector3<f64>, Vector3<f64>, f64) {
    let prediction = &predictions.as_slice()[raster];
    let chosen = &prediction.modes[mode as usize];
    let weight = f64::from(chosen.samples) / prediction.total_samples();
    (keypoints.as_slice()[raster].position, chosen.mean, weight)
}

/// `Σ wᵢ ‖R xᵢ + t − μᵢ‖²` over the assigned correspondences.
fn weighted_cost(
    pose: &SE3,
    keypoints: &KeypointImage,
    predictions: &ScorePredictionsImage,
    inliers: &[usize],
    assignment: &[u8],
) -> f64 {
    inliers
        .iter()
        .enumerate()
        .map(|(i, &raster)| {
            let (camera, scene, weight) =
                correspondence(keypoints, predictions, raster, assignment[i]);
            weight * (pose.transform_point(&camera) - scene).norm_squared()
        })
        .sum()
}

/// Accumulate `H = Σ w JᵀJ` and `g = Σ w Jᵀr` for the residual
/// `r = R x + t − μ` with left-tangent Jacobian `J = [−[y]× | I]`,
/// `y = R x + t`, tangent ordered as (ω, υ).
fn normal_equations(
    pose: &SE3,
    keypoints: &KeypointImage,
    predictions: &ScorePredictionsImage,
    inliers: &[usize],
    assignment: &[u8],
) -> (Matrix6<f64>, Vector6<f64>) {
    let mut hessian = Matrix6::zeros();
    let mut gradient = Vector6::zeros();

    for (i, &raster) in inliers.iter().enumerate() {
        let (camera, scene, weight) =
            correspondence(keypoints, predictions, raster, assignment[i]);
        let projected = pose.transform_point(&camera);
        let residual = projected - scene;
        let y_skew = so3::skew(&projected);

        // Block form of w·JᵀJ and w·Jᵀr with J = [−[y]× | I].
        let h_ww = weight * y_skew.transpose() * y_skew;
        let h_wv = weight * y_skew;
        let g_w = weight * y_skew * residual;
        let g_v = weight * residual;
        for r in 0..3 {
            for c in 0..3 {
                hessian[(r, c)] += h_ww[(r, c)];
                hessian[(r, 3 + c)] += h_wv[(r, c)];
                hessian[(3 + c, r)] += h_wv[(r, c)];
            }
            hessian[(3 + r, 3 + r)] += weight;
            gradient[r] += g_w[r];
            gradient[3 + r] += g_v[r];
        }
    }

    (hessian, gradient)
}

/// Left-multiply the pose by the tangent element `(ω, υ)`.
fn apply_tangent(pose: &SE3, delta: &Vector6<f64>) -> SE3 {
    let omega = Vector3::new(delta[0], delta[1], delta[2]);
    let upsilon = Vector3::new(delta[3], delta[4], delta[5]);
    let rotation_update = so3::exp(&omega);
    SE3 {
        rotation: rotation_update * pose.rotation,
        translation: rotation_update * pose.translation + upsilon,
    }
}
