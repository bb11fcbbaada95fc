//! Errors that make a raw record unusable as a whole.

use chaingov_core::SignatureError;
use thiserror::Error;

/// Field-level coercion failures are not errors (the field is kept raw);
/// these variants cover records that cannot be placed or decoded at all.
#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error(transparent)]
    Signature(#[from] SignatureError),

    #[error("Missing column '{column}'")]
    MissingColumn { column: String },

    #[error("Invalid {column} value '{value}'")]
    InvalidMeta { column: String, value: String },

    #[error("Topic0 {got} does not match {expected}")]
    TopicMismatch { expected: String, got: String },

    #[error("Invalid hex in {context}: {reason}")]
    InvalidHex { context: String, reason: String },

    #[error("ABI decode of {signature} failed: {reason}")]
    AbiDecodeFailed { signature: String, reason: String },
}
