//! Harness error type.

use thiserror::Error;

use frankenvalue::ConfigError;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("invalid parameter: {0}")]
    Parameter(String),
    #[error("invariant violated after {step} steps: {detail}")]
    Invariant { step: usize, detail: String },
}
