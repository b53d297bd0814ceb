//! Error taxonomy for the engine boundary.
//!
//! `InvalidInput` and `ToolMissing` abort a run before any attempt exists.
//! Compile failures and timeouts are attempt-local and never surface here once
//! a run has been sealed.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid input image {path}: {reason}")]
    InvalidInput { path: PathBuf, reason: String },

    #[error("required tool '{program}' is not available")]
    ToolMissing { program: String },

    #[error("invalid options: {0}")]
    InvalidOptions(String),

    #[error("generation service failed during {operation}: {source}")]
    Generation {
        operation: &'static str,
        #[source]
        source: GenerationError,
    },

    #[error("scoring failed: {0}")]
    Scoring(#[from] ScoringError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("malformed {operation} response: {reason}")]
    MalformedResponse {
        operation: &'static str,
        reason: String,
    },

    #[error("missing API key for provider '{provider}' (set {env_var})")]
    MissingApiKey {
        provider: String,
        env_var: &'static str,
    },

    #[error("{provider} transport failure: {message}")]
    Transport { provider: String, message: String },

    #[error("{provider} request failed ({status}): {body}")]
    Http {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("{provider} returned an empty response")]
    EmptyResponse { provider: String },

    #[error("unknown generation provider '{name}' (available: {available})")]
    UnknownProvider { name: String, available: String },

    #[error("no usable model: {0}")]
    ModelUnavailable(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl GenerationError {
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::MalformedResponse { .. })
    }
}

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("required tool '{program}' is not available")]
    ToolMissing { program: String },

    #[error("{stage} failed: {diagnostic}")]
    CompileFailed { stage: String, diagnostic: String },

    #[error("{stage} timed out after {seconds}s")]
    Timeout { stage: String, seconds: u64 },

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum ScoringError {
    #[error("cannot read image {path}: {reason}")]
    Unreadable { path: PathBuf, reason: String },
}
