//! Pose-candidate generation from keypoint/mode triples.
//!
//! Each candidate slot draws three (keypoint, mode) correspondences, filters
//! the scene-space triple for geometric feasibility and closes the attempt
//! with a Kabsch solve. Slots are independent dispatch items with their own
//! seeded RNGs; successful candidates are appended to a dense prefix through
//! the shared atomic counter.

use nalgebra::Vector3;
use rand::Rng;

use crate::dispatch::{slot_rng, AppendList, Dispatch};
use crate::geometry::{kabsch, SE3};
use crate::image::KeypointImage;

use super::prediction::ScorePredictionsImage;

/// RNG stream id for candidate generation (inlier sampling uses 1 + round).
const CANDIDATE_STREAM: u64 = 0;

/// One keypoint-to-mode correspondence backing a candidate.
#[derive(Debug, Clone, Copy)]
pub struct Correspondence {
    /// Eye-space keypoint position.
    pub camera: Vector3<f64>,
    /// Scene-space mode mean.
    pub scene: Vector3<f64>,
    /// Raster index of the keypoint.
    pub keypoint: usize,
    /// Index of the chosen mode within the keypoint's prediction.
    pub mode: usize,
}

/// A rigid-pose hypothesis with the minimal correspondences that produced it.
#[derive(Debug, Clone, Copy)]
pub struct PoseCandidate {
    pub pose: SE3,
    pub correspondences: [Correspondence; 3],
    /// Mean per-inlier cost; lower is better.
    pub energy: f64,
    /// Generation slot, used as the stable tie-break key when sorting.
    pub slot: usize,
}

/// Tuning for candidate generation.
#[derive(Debug, Clone, Copy)]
pub struct CandidateParams {
    pub use_all_modes: bool,
    pub check_min_distance: bool,
    pub check_rigid_transform: bool,
    /// Minimum pairwise separation of the scene triple, metres.
    pub min_separation: f64,
    /// Pairwise camera/scene distance consistency tolerance, metres.
    pub rigid_tolerance: f64,
    /// Full-triple attempts per slot before the slot is dropped.
    pub retries: usize,
    pub rng_seed: u64,
}

/// Fill `out` with up to its capacity of candidates.
///
/// Slots that exhaust their retry budget contribute nothing; the accepted
/// candidates form a dense prefix whose order is unspecified under a
/// parallel backend.
pub fn generate_candidates(
    keypoints: &KeypointImage,
    predictions: &ScorePredictionsImage,
    params: &CandidateParams,
    dispatch: &dyn Dispatch,
    out: &AppendList<PoseCandidate>,
) {
    let pixel_count = keypoints.len();
    if pixel_count == 0 {
        return;
    }

    dispatch.for_each(out.capacity(), &|slot| {
        let mut rng = slot_rng(params.rng_seed, CANDIDATE_STREAM, slot as u64);
        for _ in 0..params.retries {
            if let Some(candidate) =
                try_sample_candidate(keypoints, predictions, params, slot, &mut rng)
            {
                out.push(candidate);
                break;
            }
        }
    });
}

/// One full triple attempt: draw, filter, solve.
fn try_sample_candidate(
    keypoints: &KeypointImage,
    predictions: &ScorePredictionsImage,
    params: &CandidateParams,
    slot: usize,
    rng: &mut impl Rng,
) -> Option<PoseCandidate> {
    let pixel_count = keypoints.len();
    let mut triple = [Correspondence {
        camera: Vector3::zeros(),
        scene: Vector3::zeros(),
        keypoint: 0,
        mode: 0,
    }; 3];

    for i in 0..3 {
        let raster = rng.gen_range(0..pixel_count);
        let keypoint = keypoints.get(raster)?;
        if !keypoint.valid {
            return None;
        }
        let prediction = predictions.get(raster)?;
        if prediction.is_empty() {
            return None;
        }
        let mode = if params.use_all_modes {
            rng.gen_range(0..prediction.modes.len())
        } else {
            0
        };
        triple[i] = Correspondence {
            camera: keypoint.position,
            scene: prediction.modes[mode].mean,
            keypoint: raster,
            mode,
        };

        // Pairwise tests against the correspondences already chosen.
        for j in 0..i {
            if !pair_is_feasible(params, &triple[i], &triple[j]) {
                return None;
            }
        }
    }

    let camera = [triple[0].camera, triple[1].camera, triple[2].camera];
    let scene = [triple[0].scene, triple[1].scene, triple[2].scene];
    let pose = kabsch(&camera, &scene)?;

    Some(PoseCandidate {
        pose,
        correspondences: triple,
        energy: 0.0,
        slot,
    })
}

fn pair_is_feasible(
    params: &CandidateParams,
    a: &Correspondence,
    b: &Correspondence,
) -> bool {
    let scene_dist_sq = (a.scene - b.scene).norm_squared();
    if params.check_min_distance && scene_dist_sq < params.min_separation * params.min_separation {
        return false;
    }
    if params.check_rigid_transform {
        let camera_dist = (a.camera - b.camera).norm();
        if (scene_dist_sq.sqrt() - camera_dist).abs() > params.rigid_tolerance {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Serial;
    use crate::forest::Mode;
    use crate::image::Keypoint;
    use crate::relocaliser::prediction::ScorePrediction;
    use approx::assert_relative_eq;

    fn params() -> CandidateParams {
        CandidateParams {
            use_all_modes: true,
            check_min_distance: true,
            check_rigid_transform: true,
            min_separation: 0.3,
            rigid_tolerance: 0.05,
            retries: 1000,
            rng_seed: 42,
        }
    }

    /// A frame whose predictions are the keypoints translated by `offset`.
    fn translated_frame(
        positions: &[Vector3<f64>],
        offset: Vector3<f64>,
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
                modes: vec![Mode::isotropic(p + offset, 10)],
            })
            .collect();
        let width = positions.len();
        (
            KeypointImage::from_raw(width, 1, keypoints).unwrap(),
            ScorePredictionsImage::from_raw(width, 1, predictions).unwrap(),
        )
    }

    #[test]
    fn generates_exact_candidates_from_consistent_points() {
        let positions = vec![
            Vector3::new(0.0, 0.0, 1.0),
            Vector3::new(1.0, 0.0, 1.0),
            Vector3::new(0.0, 1.0, 1.0),
            Vector3::new(1.0, 1.0, 2.0),
        ];
        let offset = Vector3::new(2.0, 3.0, 4.0);
        let (keypoints, predictions) = translated_frame(&positions, offset);

        let mut pool = AppendList::with_capacity(64);
        generate_candidates(&keypoints, &predictions, &params(), &Serial, &pool);

        assert!(!pool.is_empty());
        for candidate in pool.as_slice() {
            assert_relative_eq!(candidate.pose.translation, offset, epsilon = 1e-9);
            assert_relative_eq!(candidate.pose.rotation.angle(), 0.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn emitted_candidates_pass_both_geometric_tests() {
        let positions = vec![
            Vector3::new(0.0, 0.0, 1.0),
            Vector3::new(1.0, 0.0, 1.0),
            Vector3::new(0.0, 1.0, 1.0),
            Vector3::new(0.9, 1.1, 1.8),
        ];
        let (keypoints, predictions) =
            translated_frame(&positions, Vector3::new(-1.0, 0.5, 2.0));
        let p = params();

        let mut pool = AppendList::with_capacity(128);
        generate_candidates(&keypoints, &predictions, &p, &Serial, &pool);

        for candidate in pool.as_slice() {
            for i in 0..3 {
                for j in 0..i {
                    let a = &candidate.correspondences[i];
                    let b = &candidate.correspondences[j];
                    let scene_dist = (a.scene - b.scene).norm();
                    let camera_dist = (a.camera - b.camera).norm();
                    assert!(scene_dist * scene_dist >= p.min_separation * p.min_separation);
                    assert!((scene_dist - camera_dist).abs() <= p.rigid_tolerance);
                }
            }
        }
    }

    #[test]
    fn empty_predictions_produce_no_candidates() {
        let keypoints = KeypointImage::filled(
            4,
            1,
            Keypoint {
                position: Vector3::new(0.0, 0.0, 1.0),
                colour: [0; 3],
                valid: true,
            },
        );
        let predictions = ScorePredictionsImage::filled(4, 1, ScorePrediction::default());
        let p = CandidateParams {
            retries: 50,
            ..params()
        };
        let pool = AppendList::with_capacity(16);
        generate_candidates(&keypoints, &predictions, &p, &Serial, &pool);
        assert!(pool.is_empty());
    }

    #[test]
    fn two_usable_keypoints_cannot_form_a_triple() {
        // Any triple drawn from two keypoints repeats one of them; the
        // repeated pair has zero scene separation, so the minimum-distance
        // test rejects every attempt.
        let positions = vec![Vector3::new(0.0, 0.0, 1.0), Vector3::new(1.0, 0.0, 1.0)];
        let (keypoints, predictions) = translated_frame(&positions, Vector3::zeros());
        let p = CandidateParams {
            retries: 200,
            ..params()
        };
        let pool = AppendList::with_capacity(16);
        generate_candidates(&keypoints, &predictions, &p, &Serial, &pool);
        assert!(pool.is_empty());
    }

    #[test]
    fn inconsistent_scene_distances_are_rejected() {
        // Scene points are a stretched copy of the camera points, violating
        // the isometry test for every pair.
        let positions = vec![
            Vector3::new(0.0, 0.0, 1.0),
            Vector3::new(1.0, 0.0, 1.0),
            Vector3::new(0.0, 1.0, 1.0),
        ];
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
                modes: vec![Mode::isotropic(p * 2.0, 10)],
            })
            .collect();
        let keypoints = KeypointImage::from_raw(3, 1, keypoints).unwrap();
        let predictions = ScorePredictionsImage::from_raw(3, 1, predictions).unwrap();

        let p = CandidateParams {
            retries: 200,
            ..params()
        };
        let pool = AppendList::with_capacity(16);
        generate_candidates(&keypoints, &predictions, &p, &Serial, &pool);
        assert!(pool.is_empty());
    }

    #[test]
    fn serial_generation_is_deterministic_under_a_fixed_seed() {
        let positions = vec![
            Vector3::new(0.0, 0.0, 1.0),
            Vector3::new(1.0, 0.0, 1.0),
            Vector3::new(0.0, 1.0, 1.0),
            Vector3::new(1.0, 1.0, 2.0),
        ];
        let (keypoints, predictions) =
            translated_frame(&positions, Vector3::new(0.0, 0.0, 1.0));

        let run = || {
            let mut pool = AppendList::with_capacity(32);
            generate_candidates(&keypoints, &predictions, &params(), &Serial, &pool);
            pool.as_slice()
                .iter()
                .map(|c| (c.slot, c.correspondences.map(|t| t.keypoint)))
                .collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }
}
