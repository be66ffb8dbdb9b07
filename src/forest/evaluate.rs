//! Forest evaluation: per-pixel descent of every tree.

use crate::dispatch::{Dispatch, SharedSlice};
use crate::image::{DescriptorImage, LeafImage};

use super::ScoreForest;

/// Descend every tree for every pixel, writing one leaf ordinal per tree
/// into `out`.
///
/// Pixels are independent, so the work is a single dispatch over the raster.
/// The caller has already checked that the descriptor feature count matches
/// the forest; a malformed tree cannot occur here because loading validated
/// the node arrays.
pub fn evaluate_forest(
    forest: &ScoreForest,
    descriptors: &DescriptorImage,
    dispatch: &dyn Dispatch,
    out: &mut LeafImage,
) {
    let (width, height) = descriptors.dims();
    out.reset(width, height);
    let tree_count = forest.tree_count();
    let leaves = SharedSlice::new(out.as_mut_slice());

    dispatch.for_each(width * height, &|raster| {
        let features = descriptors.features(raster);
        for (t, tree) in forest.trees().iter().enumerate() {
            let leaf = tree.descend(features);
            // SAFETY: pixel `raster` owns exactly the index range
            // [raster * tree_count, (raster + 1) * tree_count).
            unsafe {
                *leaves.slot_mut(raster * tree_count + t) = leaf;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Serial;
    use crate::forest::test_support::stump_forest;
    use crate::forest::Mode;
    use nalgebra::Vector3;

    #[test]
    fn routes_pixels_through_the_stump() {
        let forest = stump_forest(
            vec![Mode::isotropic(Vector3::zeros(), 1)],
            vec![Mode::isotropic(Vector3::zeros(), 1)],
        );
        // Feature values straddling the 0.5 threshold.
        let descriptors =
            DescriptorImage::from_raw(2, 2, 1, vec![0.0, 1.0, 0.49, 0.51]).unwrap();
        let mut out = LeafImage::new(1, 1, forest.tree_count());

        evaluate_forest(&forest, &descriptors, &Serial, &mut out);

        assert_eq!(out.dims(), (2, 2));
        assert_eq!(out.leaves(0), &[0]);
        assert_eq!(out.leaves(1), &[1]);
        assert_eq!(out.leaves(2), &[0]);
        assert_eq!(out.leaves(3), &[1]);
    }
}
