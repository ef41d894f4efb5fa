//! Serial rebase-and-merge pipeline with bounded conflict resolution and
//! verification retry.

pub mod error;
pub mod pipeline;
pub mod traits;
pub mod validate;

pub use error::MergeError;
pub use pipeline::{MergeOutcome, MergePipeline, MergeTask};
pub use traits::{ConflictBundle, ConflictFile, ConflictResolver, VerificationFixer, VerifyResult, Verifier};
