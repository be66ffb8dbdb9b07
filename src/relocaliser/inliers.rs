//! Inlier sampling over the keypoint raster.
//!
//! Every halving round grows the shared inlier set by up to one batch of
//! draws. A draw picks a uniformly random raster index and accepts it iff the
//! keypoint is valid and its prediction usable; in masked mode the raster
//! bitmask additionally rejects indices that any earlier draw already took.
//! The first batch of a frame runs unmasked (duplicates are allowed there),
//! every later batch masked.

use rand::Rng;

use crate::dispatch::{slot_rng, AppendList, Dispatch};
use crate::image::KeypointImage;

use super::prediction::ScorePredictionsImage;

/// Stream ids 1.. are per-round inlier streams (0 is candidate generation).
const INLIER_STREAM_BASE: u64 = 1;

/// One bit per raster index, claimable from concurrent dispatch slots.
pub struct InlierMask {
    words: Vec<std::sync::atomic::AtomicU32>,
    len: usize,
}

impl InlierMask {
    pub fn new(len: usize) -> Self {
        let words = (0..len.div_ceil(32))
            .map(|_| std::sync::atomic::AtomicU32::new(0))
            .collect();
        Self { words, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Clear all bits; requires exclusive access, so no draws can race it.
    pub fn reset(&mut self, len: usize) {
        self.len = len;
        let needed = len.div_ceil(32);
        if self.words.len() < needed {
            self.words = (0..needed)
                .map(|_| std::sync::atomic::AtomicU32::new(0))
                .collect();
        } else {
            for word in &self.words {
                word.store(0, std::sync::atomic::Ordering::SeqCst);
            }
        }
    }

    /// Set the bit for `index`, returning whether it was previously clear.
    ///
    /// Once set, a bit stays set for the rest of the frame, so a masked draw
    /// can never return an index twice.
    pub fn claim(&self, index: usize) -> bool {
        debug_assert!(index < self.len);
        let bit = 1u32 << (index % 32);
        let previous =
            self.words[index / 32].fetch_or(bit, std::sync::atomic::Ordering::SeqCst);
        previous & bit == 0
    }

    pub fn is_set(&self, index: usize) -> bool {
        debug_assert!(index < self.len);
        let bit = 1u32 << (index % 32);
        self.words[index / 32].load(std::sync::atomic::Ordering::SeqCst) & bit != 0
    }
}

/// Draw up to `batch` new inlier raster indices into `out`.
///
/// `round` keys the RNG stream: 0 for the initial unmasked batch, then one
/// per halving round. Attempts are independent dispatch slots; the ordering
/// of accepted indices is unspecified under a parallel backend.
#[allow(clippy::too_many_arguments)]
pub fn sample_inliers(
    keypoints: &KeypointImage,
    predictions: &ScorePredictionsImage,
    batch: usize,
    masked: bool,
    round: u64,
    rng_seed: u64,
    dispatch: &dyn Dispatch,
    mask: &InlierMask,
    out: &AppendList<usize>,
) {
    let pixel_count = keypoints.len();
    if pixel_count == 0 {
        return;
    }

    dispatch.for_each(batch, &|attempt| {
        let mut rng = slot_rng(rng_seed, INLIER_STREAM_BASE + round, attempt as u64);
        let raster = rng.gen_range(0..pixel_count);
        let usable = keypoints
            .get(raster)
            .map(|k| k.valid)
            .unwrap_or(false)
            && predictions.get(raster).map(|p| !p.is_empty()).unwrap_or(false);
        if !usable {
            return;
        }
        let fresh = mask.claim(raster);
        if masked && !fresh {
            return;
        }
        out.push(raster);
    });
}
