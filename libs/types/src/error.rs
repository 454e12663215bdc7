//! Error Taxonomy
//!
//! One error enum covers the whole runtime so command results can carry a
//! typed error across the wire. Variants therefore hold plain strings rather
//! than boxed sources; the message keeps the context.

use crate::ids::{BeeId, CellKey, NodeId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias used across the workspace.
pub type Result<T> = std::result::Result<T, HiveError>;

#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HiveError {
    /// A command the receiver does not understand.
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// An operation issued in the wrong state (stop on a stopped hive,
    /// begin_tx with a transaction already open, ...).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Registry lookup found no such node.
    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    /// Registry lookup found no such bee.
    #[error("unknown bee {0}")]
    UnknownBee(BeeId),

    /// No binding exists for the cell.
    #[error("no binding for cell {0}")]
    UnknownCell(CellKey),

    /// Consensus rejected a mutation: cell already bound, duplicate slave,
    /// node registered under a different address.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Transport failure or timeout; the caller may retry.
    #[error("transient: {0}")]
    Transient(String),

    /// Unregistered or malformed payload.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Unrecoverable local invariant violation.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl HiveError {
    pub fn invalid_command(msg: impl Into<String>) -> Self {
        Self::InvalidCommand(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn encoding(msg: impl Into<String>) -> Self {
        Self::Encoding(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// Whether a retry may succeed without operator intervention.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Conflict(_))
    }

    /// Stable category string for log fields.
    pub fn category(&self) -> &'static str {
        match self {
            Self::InvalidCommand(_) => "invalid_command",
            Self::InvalidState(_) => "invalid_state",
            Self::UnknownNode(_) => "unknown_node",
            Self::UnknownBee(_) => "unknown_bee",
            Self::UnknownCell(_) => "unknown_cell",
            Self::Conflict(_) => "conflict",
            Self::Transient(_) => "transient",
            Self::Encoding(_) => "encoding",
            Self::Fatal(_) => "fatal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::NodeId;

    #[test]
    fn classification() {
        assert!(HiveError::transient("connection refused").is_transient());
        assert!(HiveError::conflict("cell bound").is_retryable());
        assert!(!HiveError::encoding("bad tag").is_retryable());
        assert_eq!(HiveError::UnknownNode(NodeId(3)).category(), "unknown_node");
    }

    #[test]
    fn errors_cross_the_wire() {
        let err = HiveError::conflict("cell c/x already bound");
        let bytes = bincode::serialize(&err).unwrap();
        let back: HiveError = bincode::deserialize(&bytes).unwrap();
        assert_eq!(err, back);
    }
}
