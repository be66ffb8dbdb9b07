//! Candidate energy scoring over the shared inlier set.
//!
//! The energy of a candidate is the mean negative log-likelihood of its
//! projections of the inlier keypoints under their prediction mixtures. The
//! reduction runs in three separate dispatches (reset, accumulate, finalise)
//! so the per-candidate accumulators are never read and written in the same
//! parallel phase; each dispatch return is the barrier between sub-phases.

use crate::dispatch::{AtomicF64, Dispatch, SharedSlice};
use crate::image::KeypointImage;

use super::candidates::PoseCandidate;
use super::prediction::ScorePredictionsImage;

/// Inliers accumulated per grid cell in the accumulate sub-phase.
const INLIER_CHUNK: usize = 256;

/// Likelihood floor keeping the per-inlier cost finite.
const MIN_LIKELIHOOD: f64 = 1e-300;

/// Reusable per-candidate energy accumulators.
pub struct EnergyScorer {
    accumulators: Vec<AtomicF64>,
}

impl EnergyScorer {
    pub fn new(max_candidates: usize) -> Self {
        Self {
            accumulators: (0..max_candidates).map(|_| AtomicF64::new(0.0)).collect(),
        }
    }

    /// Score every candidate in `pool` against the current inlier set.
    pub fn score(
        &self,
        pool: &mut [PoseCandidate],
        keypoints: &KeypointImage,
        predictions: &ScorePredictionsImage,
        inliers: &[usize],
        dispatch: &dyn Dispatch,
    ) {
        debug_assert!(pool.len() <= self.accumulators.len());
        if pool.is_empty() || inliers.is_empty() {
            return;
        }
        let candidate_count = pool.len();
        let chunk_count = inliers.len().div_ceil(INLIER_CHUNK);

        // Reset.
        dispatch.for_each(candidate_count, &|c| self.accumulators[c].store(0.0));

        // Accumulate partial sums over the (candidate, inlier-chunk) grid.
        let shared_pool = SharedSlice::new(pool);
        dispatch.for_each(candidate_count * chunk_count, &|cell| {
            let c = cell / chunk_count;
            let chunk = cell % chunk_count;
            let start = chunk * INLIER_CHUNK;
            let end = (start + INLIER_CHUNK).min(inliers.len());
            // SAFETY: the accumulate phase only reads candidates; no slot
            // writes the pool until the finalise dispatch below.
            let candidate = unsafe { shared_pool.slot(c) };

            let mut partial = 0.0;
            for &raster in &inliers[start..end] {
                let keypoint = &keypoints.as_slice()[raster];
                let projected = candidate.pose.transform_point(&keypoint.position);
                let likelihood = predictions.as_slice()[raster]
                    .mixture_likelihood(&projected)
                    .max(MIN_LIKELIHOOD);
                partial -= likelihood.ln();
            }
            self.accumulators[c].add(partial);
        });

        // Finalise: mean cost per inlier.
        let inlier_count = inliers.len() as f64;
        dispatch.for_each(candidate_count, &|c| {
            // SAFETY: slot `c` is the only writer of pool[c] in this phase.
            let candidate = unsafe { shared_pool.slot_mut(c) };
            candidate.energy = self.accumulators[c].load() / inlier_count;
        });
    }
}
