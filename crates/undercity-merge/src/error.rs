//! Errors raised by [`crate::MergePipeline`] that are not one of the
//! domain outcomes in [`crate::MergeOutcome`] — i.e. failures in the
//! pipeline's own bookkeeping rather than in the merge itself.

use thiserror::Error;
use undercity_core::error::InvalidInputError;

/// Infrastructure failures distinct from the merge's domain outcomes.
/// A failed rebase, failed verification, or unusable workspace is
/// reported through [`crate::MergeOutcome`], not this enum.
#[derive(Debug, Error)]
pub enum MergeError {
    /// Persisting a quarantine record failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Content read across an interface boundary (conflicted-file content,
    /// a collected diff) failed structural validation.
    #[error(transparent)]
    InvalidInput(#[from] InvalidInputError),
}
