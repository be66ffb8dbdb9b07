//! Frozen SCoRe regression forest.
//!
//! A forest is an ensemble of binary decision trees mapping per-pixel feature
//! vectors to leaves; each leaf carries a small set of Gaussian modal
//! clusters in scene space. Trees are stored as flat node arrays with child
//! indices, matching the on-disk layout, so there is no pointer chasing and
//! no ownership cycle.
//!
//! The forest is loaded once at startup and immutable thereafter; it is
//! shared read-only across all per-frame dispatches.

pub mod evaluate;
pub mod io;

use nalgebra::{Matrix3, Vector3};

use crate::error::ForestLoadError;

/// One modal cluster: a Gaussian over scene-space positions.
///
/// The inverse covariance is stored (scoring only ever needs `Σ⁻¹` and
/// `log|Σ|`) and is symmetric by construction.
#[derive(Debug, Clone, Copy)]
pub struct Mode {
    /// Scene-space mean, metres.
    pub mean: Vector3<f64>,
    /// Inverse covariance `Σ⁻¹`.
    pub inv_cov: Matrix3<f64>,
    /// `log|Σ|` of the covariance determinant.
    pub log_det_cov: f64,
    /// Number of training samples behind this cluster, at least 1.
    pub samples: u32,
    /// Mean colour of the contributing samples; not used for scoring.
    pub colour: [u8; 3],
}

impl Mode {
    /// An isotropic unit-covariance mode, mostly useful in tests.
    pub fn isotropic(mean: Vector3<f64>, samples: u32) -> Self {
        Self {
            mean,
            inv_cov: Matrix3::identity(),
            log_det_cov: 0.0,
            samples,
            colour: [0; 3],
        }
    }
}

/// One split (or leaf) record of a tree.
///
/// Leaf nodes are encoded as `left == -1`; their ordinal position among the
/// tree's leaves, in node-array order, is the leaf index the evaluator emits.
#[derive(Debug, Clone, Copy)]
pub struct SplitNode {
    pub left: i32,
    pub right: i32,
    pub feature: u32,
    pub threshold: f32,
}

impl SplitNode {
    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.left < 0
    }
}

/// A single decision tree plus its per-leaf mode tables.
#[derive(Debug, Clone)]
pub struct Tree {
    nodes: Vec<SplitNode>,
    /// Leaf ordinal per node; `u32::MAX` for internal nodes.
    leaf_ordinal: Vec<u32>,
    /// Mode lists indexed by leaf ordinal, each sorted by sample count.
    leaf_modes: Vec<Vec<Mode>>,
}

impl Tree {
    /// Assemble a tree from its node array and per-leaf mode lists.
    ///
    /// Validates child indices, the leaf/internal encoding and that
    /// `leaf_modes` matches the number of leaves in node order.
    pub fn new(nodes: Vec<SplitNode>, leaf_modes: Vec<Vec<Mode>>) -> Result<Self, ForestLoadError> {
        if nodes.is_empty() {
            return Err(ForestLoadError::Format("tree with no nodes".into()));
        }
        let node_count = nodes.len();
        let mut leaf_ordinal = vec![u32::MAX; node_count];
        let mut leaves = 0u32;
        for (i, node) in nodes.iter().enumerate() {
            if node.is_leaf() {
                leaf_ordinal[i] = leaves;
                leaves += 1;
            } else {
                for child in [node.left, node.right] {
                    let valid = child > i as i32 && (child as usize) < node_count;
                    if !valid {
                        return Err(ForestLoadError::Format(format!(
                            "node {i}: child index {child} out of range"
                        )));
                    }
                }
            }
        }
        if leaf_modes.len() != leaves as usize {
            return Err(ForestLoadError::Format(format!(
                "tree declares {} leaves but carries {} mode lists",
                leaves,
                leaf_modes.len()
            )));
        }
        Ok(Self {
            nodes,
            leaf_ordinal,
            leaf_modes,
        })
    }

    pub fn nodes(&self) -> &[SplitNode] {
        &self.nodes
    }

    pub fn leaf_count(&self) -> usize {
        self.leaf_modes.len()
    }

    /// The modes attached to a leaf ordinal.
    pub fn modes(&self, leaf: u32) -> &[Mode] {
        &self.leaf_modes[leaf as usize]
    }

    /// Walk from the root to a leaf, returning its ordinal.
    ///
    /// `features` must be at least as long as the forest's declared feature
    /// count; this is checked once per frame at the predict entry point.
    pub fn descend(&self, features: &[f32]) -> u32 {
        let mut index = 0usize;
        loop {
            let node = &self.nodes[index];
            if node.is_leaf() {
                return self.leaf_ordinal[index];
            }
            index = if features[node.feature as usize] < node.threshold {
                node.left as usize
            } else {
                node.right as usize
            };
        }
    }
}

/// A frozen ensemble of trees.
#[derive(Debug, Clone)]
pub struct ScoreForest {
    trees: Vec<Tree>,
    max_modes_per_leaf: u32,
    feature_count: u32,
}

impl ScoreForest {
    pub fn new(
        trees: Vec<Tree>,
        max_modes_per_leaf: u32,
        feature_count: u32,
    ) -> Result<Self, ForestLoadError> {
        if trees.is_empty() {
            return Err(ForestLoadError::Format("forest with no trees".into()));
        }
        for (t, tree) in trees.iter().enumerate() {
            for (i, node) in tree.nodes.iter().enumerate() {
                if !node.is_leaf() && node.feature >= feature_count {
                    return Err(ForestLoadError::Format(format!(
                        "tree {t} node {i}: feature index {} exceeds feature count {}",
                        node.feature, feature_count
                    )));
                }
            }
            for modes in &tree.leaf_modes {
                if modes.len() > max_modes_per_leaf as usize {
                    return Err(ForestLoadError::Format(format!(
                        "tree {t}: leaf carries {} modes, more than the declared maximum {}",
                        modes.len(),
                        max_modes_per_leaf
                    )));
                }
            }
        }
        Ok(Self {
            trees,
            max_modes_per_leaf,
            feature_count,
        })
    }

    pub fn trees(&self) -> &[Tree] {
        &self.trees
    }

    pub fn tree_count(&self) -> usize {
        self.trees.len()
    }

    pub fn max_modes_per_leaf(&self) -> u32 {
        self.max_modes_per_leaf
    }

    pub fn feature_count(&self) -> u32 {
        self.feature_count
    }
}
