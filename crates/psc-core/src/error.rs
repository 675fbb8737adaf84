//! Core error types for psc-core.
//!
//! Uses `thiserror` for structured, matchable error variants covering the
//! failure modes of the pure model: malformed tags, inconsistent id maps,
//! bad topology input and strategy (de)serialization.

use thiserror::Error;

/// Core errors produced by the psc-core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A tag string could not be parsed.
    #[error("malformed tag: '{tag}'")]
    MalformedTag { tag: String },

    /// The two halves of an id map disagree in length.
    #[error("id map length mismatch: {from} source ids vs {to} target ids")]
    IdMapLengthMismatch { from: usize, to: usize },

    /// A rank outside the id map was requested.
    #[error("rank {rank} out of range for id map of {len} ranks")]
    RankOutOfRange { rank: usize, len: usize },

    /// No registered process was found for a rank.
    #[error("no process registered for rank {rank}")]
    MissingRank { rank: usize },

    /// Topology parameters or input were invalid.
    #[error("invalid topology: {reason}")]
    InvalidTopology { reason: String },

    /// A strategy request could not be encoded or decoded.
    #[error("strategy encoding failed: {0}")]
    Strategy(#[from] serde_json::Error),
}
