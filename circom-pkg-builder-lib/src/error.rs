use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Status message surfaced for any rejected proving key.
pub const INVALID_FINAL_ZKEY_MSG: &str = "Invalid finalZkey!";

/// Infrastructure error type for the package builder.
#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Configuration parsing error (TOML): {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Serialization error (JSON): {0}")]
    SerdeJsonError(#[from] serde_json::Error),

    #[error("Serialization error (Bincode): {0}")]
    BincodeError(#[from] Box<bincode::ErrorKind>),

    #[error("URL parsing error: {0}")]
    UrlParseError(#[from] url::ParseError),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Archive error: {0}")]
    ZipError(#[from] zip::result::ZipError),

    #[error("State management error: {0}")]
    StateError(#[from] sled::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Object store error: {0}")]
    StoreError(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Invalid request: {0}")]
    InvalidInput(String),

    #[error("Malformed binary file: {0}")]
    Format(String),

    #[error("External tool failed: {0}")]
    ToolError(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Tag naming the pipeline failure class, recorded on terminal status events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    MissingKeyMaterial,
    KeyFetchFailed,
    InvalidKeyMaterial,
    CompileError,
    SetupError,
    PackageError,
}

/// Terminal failure of a build. None of these are retried.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Missing finalZkey: this protocol requires per-circuit key material")]
    MissingKeyMaterial,

    #[error("Failed to fetch finalZkey: {0}")]
    KeyFetchFailed(String),

    /// The reason is only logged; the public message is fixed.
    #[error("Invalid finalZkey!")]
    InvalidKeyMaterial { reason: String },

    /// Compiler diagnostics, verbatim.
    #[error("{0}")]
    CompileError(String),

    #[error("Setup failed: {0}")]
    SetupError(String),

    #[error("Packaging failed: {0}")]
    PackageError(String),
}

impl BuildError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BuildError::MissingKeyMaterial => ErrorKind::MissingKeyMaterial,
            BuildError::KeyFetchFailed(_) => ErrorKind::KeyFetchFailed,
            BuildError::InvalidKeyMaterial { .. } => ErrorKind::InvalidKeyMaterial,
            BuildError::CompileError(_) => ErrorKind::CompileError,
            BuildError::SetupError(_) => ErrorKind::SetupError,
            BuildError::PackageError(_) => ErrorKind::PackageError,
        }
    }

    /// Human-readable message appended to the status log.
    pub fn status_message(&self) -> String {
        self.to_string()
    }

    pub fn invalid_key(reason: impl Into<String>) -> Self {
        BuildError::InvalidKeyMaterial {
            reason: reason.into(),
        }
    }

    pub fn setup(e: impl std::fmt::Display) -> Self {
        BuildError::SetupError(e.to_string())
    }

    pub fn package(e: impl std::fmt::Display) -> Self {
        BuildError::PackageError(e.to_string())
    }
}
