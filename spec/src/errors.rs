//! Validation errors raised while constructing typed requests/targets (§5).

use thiserror::Error;

/// Invariant violations caught at [`crate::model::MutationTarget`] /
/// [`crate::model::MutationRequest`] construction time.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum TargetValidationError {
    /// A target or certificate path was empty.
    #[error("path must not be empty")]
    EmptyPath,
    /// An absolute path, or one under a banned prefix, was supplied.
    #[error("path `{0}` is absolute or under a banned prefix")]
    AbsolutePath(String),
    /// A `..` path segment was found.
    #[error("path `{0}` contains a traversal segment")]
    PathTraversal(String),
    /// `target_type == Dna` but `path != "dna.json"`.
    #[error("dna target must map to `dna.json`, got `{0}`")]
    DnaPathMismatch(String),
}
