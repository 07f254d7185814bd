//! Typed errors for chain construction and chain-file loading
//!
//! Everything above the chain layer propagates with `anyhow`; these variants
//! exist so callers can tell a malformed table from a missing file.

use std::path::PathBuf;
use thiserror::Error;

/// Failure while building, loading or querying a [`ChainProcess`](crate::chain::ChainProcess)
#[derive(Debug, Error)]
pub enum ChainError {
    /// Conditional tables, prior or variable names are malformed
    #[error("invalid chain: {0}")]
    Validation(String),

    /// The interchange file is missing or cannot be parsed
    #[error("failed to load chain from {}: {reason}", path.display())]
    Load { path: PathBuf, reason: String },

    /// A query named a variable that is not part of the chain
    #[error("unknown variable '{0}'")]
    UnknownVariable(String),
}

/// Convenience alias for chain-level results
pub type ChainResult<T> = std::result::Result<T, ChainError>;
