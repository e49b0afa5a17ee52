//! Centralized error types for shardbridge.
//!
//! Uses thiserror for ergonomic error handling with context. Every
//! conversion error aborts the current checkpoint operation; the caller
//! decides whether to stop the run or skip the checkpoint.

use thiserror::Error;

/// Main error type for state-dict conversion.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ShardBridgeError {
    /// Template references a key absent from the loaded checkpoint.
    #[error("Missing key in loaded checkpoint: {key}")]
    MissingKey { key: String },

    /// Number of loaded buffers differs from the number of descriptors.
    #[error("Arity mismatch for '{key}': {buffers} buffer(s) for {descriptors} descriptor(s)")]
    ArityMismatch {
        key: String,
        buffers: usize,
        descriptors: usize,
    },

    /// Shard geometry does not validate.
    #[error("Shape mismatch for '{key}': {reason}")]
    ShapeMismatch { key: String, reason: String },

    /// Layer-stacked keys are missing or carry a malformed layer index.
    #[error("Malformed layer stack: {0}")]
    MalformedLayerStack(String),

    /// Local shards of one tensor disagree on their placement.
    #[error("Inconsistent placement for '{key}': {reason}")]
    InconsistentPlacement { key: String, reason: String },

    /// Checkpoint and template disagree on the kind of a node.
    #[error("Unexpected value at '{key}': expected {expected}, found {found}")]
    UnexpectedValue {
        key: String,
        expected: &'static str,
        found: &'static str,
    },

    /// Invalid configuration detected.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// IO error wrapper.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML deserialization error.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Generic error with context.
    #[error("{0}")]
    Other(String),
}

/// Convenient Result type alias.
pub type Result<T> = std::result::Result<T, ShardBridgeError>;

impl ShardBridgeError {
    /// Shorthand for a [`ShardBridgeError::ShapeMismatch`].
    pub fn shape(key: impl Into<String>, reason: impl Into<String>) -> Self {
        ShardBridgeError::ShapeMismatch {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Check if error is recoverable (can retry).
    ///
    /// Conversion errors describe the checkpoint itself, so retrying the
    /// same conversion cannot succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ShardBridgeError::Io(_))
    }

    /// Get the state-dict key associated with this error (if any).
    pub fn key(&self) -> Option<&str> {
        match self {
            ShardBridgeError::MissingKey { key }
            | ShardBridgeError::ArityMismatch { key, .. }
            | ShardBridgeError::ShapeMismatch { key, .. }
            | ShardBridgeError::InconsistentPlacement { key, .. }
            | ShardBridgeError::UnexpectedValue { key, .. } => Some(key),
            _ => None,
        }
    }
}
