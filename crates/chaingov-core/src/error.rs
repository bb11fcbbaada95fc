//! Error types shared by configuration and signature lookup.

use thiserror::Error;

/// Errors raised while resolving event signatures.
#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("Unknown event signature: {0}")]
    Unknown(String),

    #[error("No ABI variant of {signature} matches {topics} topics")]
    NoVariant { signature: String, topics: usize },

    #[error("Invalid ABI declaration '{declaration}': {reason}")]
    InvalidAbi { declaration: String, reason: String },
}

/// Errors raised while loading or validating a deployment descriptor.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}
