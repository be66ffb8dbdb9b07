//! Relocaliser configuration loading from TOML.
//!
//! Every option has a default matching the shipped relocaliser tuning, so an
//! empty file (or no file at all) yields a fully working configuration:
//!
//! ```toml
//! max_candidates = 1024
//! inlier_batch = 500
//! max_modes = 10
//! merge_radius = 0.005   # metres
//! min_separation = 0.3   # metres
//! rigid_tolerance = 0.05 # metres
//! rng_seed = 42
//! ```

use std::fs;
use std::path::Path;

use serde::Deserialize;

/// Tuning parameters for prediction merging and preemptive RANSAC.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelocConfig {
    /// Size of the initial pose-candidate pool.
    pub max_candidates: usize,
    /// Number of inlier draws added per halving round.
    pub inlier_batch: usize,
    /// Maximum modes kept per keypoint after merging. Values above 255 are
    /// capped at construction: refinement stores mode assignments as bytes.
    pub max_modes: usize,
    /// Maximum modes gathered from a single leaf before merging.
    pub max_modes_per_leaf: usize,
    /// Merge radius between mode means, metres.
    pub merge_radius: f64,
    /// Minimum pairwise separation of a candidate's scene triple, metres.
    pub min_separation: f64,
    /// Tolerance for the camera/scene pairwise-distance consistency test, metres.
    pub rigid_tolerance: f64,
    /// Sample candidate modes uniformly instead of always taking the heaviest.
    pub use_all_modes: bool,
    /// Enable the minimum-separation triple test.
    pub check_min_distance: bool,
    /// Enable the rigid-transform consistency triple test.
    pub check_rigid_transform: bool,
    /// Halving-round budget; `None` resolves to ceil(log2(max_candidates)) + 1.
    pub max_rounds: Option<usize>,
    /// Retry budget per candidate slot during generation.
    pub candidate_retries: usize,
    /// Levenberg-Marquardt iteration cap per refinement.
    pub lm_max_iters: usize,
    /// Relative cost-drop threshold for LM convergence.
    pub lm_tol_rel: f64,
    /// Seed for all per-slot random number generators.
    pub rng_seed: u64,
}

impl Default for RelocConfig {
    fn default() -> Self {
        Self {
            max_candidates: 1024,
            inlier_batch: 500,
            max_modes: 10,
            max_modes_per_leaf: 50,
            merge_radius: 0.005,
            min_separation: 0.3,
            rigid_tolerance: 0.05,
            use_all_modes: true,
            check_min_distance: true,
            check_rigid_transform: true,
            max_rounds: None,
            candidate_retries: 1000,
            lm_max_iters: 10,
            lm_tol_rel: 1e-4,
            rng_seed: 42,
        }
    }
}

impl RelocConfig {
    /// Load a configuration from a TOML file.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        let config: Self = toml::from_str(&text)?;
        Ok(config)
    }

    /// The effective halving-round budget.
    ///
    /// A pool of `max_candidates` shrinks to one candidate in
    /// ceil(log2(max_candidates)) rounds; the default budget allows one
    /// extra round of slack.
    pub fn effective_max_rounds(&self) -> usize {
        self.max_rounds.unwrap_or_else(|| {
            let n = self.max_candidates.max(1);
            (usize::BITS - (n - 1).leading_zeros()) as usize + 1
        })
    }

    /// Total inlier-slot capacity: the unmasked batch plus one batch per round.
    pub fn inlier_capacity(&self) -> usize {
        (self.effective_max_rounds() + 1) * self.inlier_batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_shipped_tuning() {
        let c = RelocConfig::default();
        assert_eq!(c.max_candidates, 1024);
        assert_eq!(c.inlier_batch, 500);
        assert_eq!(c.max_modes, 10);
        assert_eq!(c.rng_seed, 42);
        assert!(c.use_all_modes);
        assert_eq!(c.effective_max_rounds(), 11);
    }

    #[test]
    fn effective_rounds_for_non_power_of_two() {
        let c = RelocConfig {
            max_candidates: 100,
            ..Default::default()
        };
        // 100 -> 50 -> 25 -> 13 -> 7 -> 4 -> 2 -> 1 is seven halvings.
        assert_eq!(c.effective_max_rounds(), 8);
    }

    #[test]
    fn parses_partial_toml() {
        let c: RelocConfig = toml::from_str(
            r#"
            max_candidates = 64
            use_all_modes = false
            rng_seed = 7
            "#,
        )
        .unwrap();
        assert_eq!(c.max_candidates, 64);
        assert!(!c.use_all_modes);
        assert_eq!(c.rng_seed, 7);
        // Unset fields keep their defaults.
        assert_eq!(c.inlier_batch, 500);
    }

    #[test]
    fn rejects_unknown_fields() {
        let r: Result<RelocConfig, _> = toml::from_str("no_such_option = 1");
        assert!(r.is_err());
    }
}
