/// Error taxonomy for the proposal-network core.
///
/// All variants are fatal at this level: a structurally incomplete network
/// would produce a nonsensical loss, so the core fails fast and leaves
/// retry/abort decisions to the training driver.

use std::fmt;

use crate::onehot::CapacityError;

#[derive(Clone, Debug, PartialEq)]
pub enum ModelError {
    /// Unsupported observation rank, missing or out-of-order architecture
    /// configuration calls.
    Configuration { reason: String },
    /// One-hot registry overflow: the configured capacity is too small for
    /// the observed program structure.
    Capacity { registry: &'static str, capacity: usize },
    /// A proposal kind the model has no head implementation for.
    UnsupportedProposal { kind: String },
    /// Checkpoint file I/O failure.
    Io { reason: String },
    /// Checkpoint encode/decode failure.
    Serde { reason: String },
}

impl ModelError {
    pub(crate) fn config(reason: impl Into<String>) -> Self {
        ModelError::Configuration { reason: reason.into() }
    }

    pub(crate) fn capacity(registry: &'static str, err: CapacityError) -> Self {
        ModelError::Capacity {
            registry,
            capacity: err.capacity,
        }
    }

    pub(crate) fn unsupported_proposal(kind: &str) -> Self {
        ModelError::UnsupportedProposal { kind: kind.to_string() }
    }
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::Configuration { reason } => {
                write!(f, "configuration error: {reason}")
            }
            ModelError::Capacity { registry, capacity } => {
                write!(f, "one-hot {registry} registry overflow: capacity {capacity} exhausted")
            }
            ModelError::UnsupportedProposal { kind } => {
                write!(f, "unsupported proposal distribution: {kind}")
            }
            ModelError::Io { reason } => write!(f, "checkpoint i/o error: {reason}"),
            ModelError::Serde { reason } => write!(f, "checkpoint serialization error: {reason}"),
        }
    }
}

impl std::error::Error for ModelError {}

impl From<std::io::Error> for ModelError {
    fn from(err: std::io::Error) -> Self {
        ModelError::Io { reason: err.to_string() }
    }
}

impl From<serde_json::Error> for ModelError {
    fn from(err: serde_json::Error) -> Self {
        ModelError::Serde { reason: err.to_string() }
    }
}
