//! The full per-frame relocalisation pipeline.
//!
//! `ScoreRelocaliser` owns the frozen forest, the per-frame arenas and the
//! preemptive RANSAC estimator. A frame flows through it as
//! `predict` (forest evaluation + prediction merging) followed by
//! `estimate_pose`; `relocalise` chains the two. Callers only ever receive
//! the final pose by value, every buffer stays inside the relocaliser.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::config::RelocConfig;
use crate::dispatch::Dispatch;
use crate::error::RelocError;
use crate::forest::evaluate::evaluate_forest;
use crate::forest::ScoreForest;
use crate::geometry::SE3;
use crate::image::{DescriptorImage, KeypointImage, LeafImage};

use super::prediction::{
    merge_predictions, MergeParams, ScorePrediction, ScorePredictionsImage,
};
use super::ransac::PreemptiveRansac;

/// SCoRe-forest relocaliser: predictions from the forest, pose from
/// preemptive RANSAC.
pub struct ScoreRelocaliser {
    forest: Arc<ScoreForest>,
    ransac: PreemptiveRansac,
    leaves: LeafImage,
    predictions: ScorePredictionsImage,
    dispatch: Arc<dyn Dispatch>,
}

impl ScoreRelocaliser {
    /// Build a relocaliser around a frozen forest.
    ///
    /// All arenas are sized here from `config`; the per-frame path does not
    /// allocate.
    pub fn new(forest: Arc<ScoreForest>, config: RelocConfig, dispatch: Arc<dyn Dispatch>) -> Self {
        let leaves = LeafImage::new(0, 0, forest.tree_count());
        Self {
            ransac: PreemptiveRansac::new(config, Arc::clone(&dispatch)),
            leaves,
            predictions: ScorePredictionsImage::filled(0, 0, ScorePrediction::default()),
            dispatch,
            forest,
        }
    }

    pub fn forest(&self) -> &ScoreForest {
        &self.forest
    }

    /// The most recent predictions image.
    pub fn predictions(&self) -> &ScorePredictionsImage {
        &self.predictions
    }

    /// The cancellation flag shared with the estimator: single writer (the
    /// caller), single reader (the relocaliser), polled between phases.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.ransac.cancel_flag()
    }

    /// Evaluate the forest and merge the per-tree modes for every keypoint.
    pub fn predict(
        &mut self,
        keypoints: &KeypointImage,
        descriptors: &DescriptorImage,
    ) -> Result<&ScorePredictionsImage, RelocError> {
        if keypoints.dims() != descriptors.dims() {
            return Err(RelocError::ShapeMismatch {
                expected: keypoints.dims(),
                found: descriptors.dims(),
            });
        }
        let feature_count = self.forest.feature_count() as usize;
        if descriptors.feature_count() != feature_count {
            // The disagreeing extents here are pixel count and feature count.
            return Err(RelocError::ShapeMismatch {
                expected: (keypoints.len(), feature_count),
                found: (keypoints.len(), descriptors.feature_count()),
            });
        }

        evaluate_forest(
            &self.forest,
            descriptors,
            self.dispatch.as_ref(),
            &mut self.leaves,
        );

        if self.predictions.dims() != keypoints.dims() {
            let (width, height) = keypoints.dims();
            self.predictions =
                ScorePredictionsImage::filled(width, height, ScorePrediction::default());
        }
        let config = self.ransac.config();
        let params = MergeParams {
            max_modes: config.max_modes,
            max_modes_per_leaf: config.max_modes_per_leaf,
            merge_radius: config.merge_radius,
        };
        merge_predictions(
            &self.forest,
            &self.leaves,
            &params,
            self.dispatch.as_ref(),
            &mut self.predictions,
        );

        let usable = self.predictions.as_slice().iter().filter(|p| !p.is_empty()).count();
        debug!(pixels = self.predictions.len(), usable, "merged forest predictions");
        Ok(&self.predictions)
    }

    /// Run preemptive RANSAC against previously computed predictions.
    pub fn estimate_pose(
        &mut self,
        keypoints: &KeypointImage,
        predictions: &ScorePredictionsImage,
    ) -> Result<SE3, RelocError> {
        self.ransac.estimate_pose(keypoints, predictions)
    }

    /// The complete pipeline for one RGB-D frame.
    pub fn relocalise(
        &mut self,
        keypoints: &KeypointImage,
        descriptors: &DescriptorImage,
    ) -> Result<SE3, RelocError> {
        if self.cancel_flag().load(Ordering::SeqCst) {
            return Err(RelocError::Cancelled);
        }
        self.predict(keypoints, descriptors)?;
        self.ransac.estimate_pose(keypoints, &self.predictions)
    }
}
