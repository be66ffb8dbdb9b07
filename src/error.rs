//! Error types for forest loading and relocalisation.

use thiserror::Error;

/// Errors raised while loading a frozen SCoRe forest from disk.
#[derive(Debug, Error)]
pub enum ForestLoadError {
    /// Underlying I/O failure.
    #[error("forest i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Structurally invalid file (bad magic, truncated records, bad indices).
    #[error("invalid forest format: {0}")]
    Format(String),

    /// The file declares a format version this build does not understand.
    #[error("unsupported forest version {found} (expected {expected})")]
    Version { expected: u32, found: u32 },
}

/// Errors raised by `predict` and `relocalise`.
///
/// The three relocalisation-failure variants are per-frame outcomes, not
/// programmer errors: the caller is expected to skip the frame and carry on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelocError {
    /// Input image dimensions disagree with each other or with the forest.
    #[error("image shape mismatch: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        found: (usize, usize),
    },

    /// No pose candidate could be generated from the predictions.
    #[error("empty candidate pool")]
    EmptyCandidatePool,

    /// The halving-round budget ran out with more than one candidate left.
    #[error("round budget exhausted")]
    Timeout,

    /// The cancellation flag was raised between phases.
    #[error("relocalisation cancelled")]
    Cancelled,
}
