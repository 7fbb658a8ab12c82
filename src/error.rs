use std::io;

use thiserror::Error;

/// Application-wide error type for the crpy CLI.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid image reference '{input}': {reason}")]
    InvalidReference { input: String, reason: String },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Registry returned {status} for {url}: {body}")]
    Registry { status: u16, url: String, body: String },

    #[error("No matching manifest for {platform} in the manifest list entries at {image} (available: {available})")]
    PlatformNotFound { platform: String, image: String, available: String },

    #[error("Unsupported manifest: {0}")]
    UnsupportedManifest(String),

    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("Invalid digest '{digest}': {reason}")]
    InvalidDigest { digest: String, reason: String },

    #[error("Invalid image archive: {0}")]
    InvalidArchive(String),

    #[error("Operation cancelled by user")]
    Cancelled,

    #[error("Failed to launch editor: {0}")]
    Editor(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid URL '{0}'")]
    Url(String),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Failed to write configuration: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    #[error("Prompt failed: {0}")]
    Prompt(#[from] dialoguer::Error),
}

impl AppError {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        AppError::Config(msg.into())
    }

    pub fn invalid_reference<S: Into<String>, R: Into<String>>(input: S, reason: R) -> Self {
        AppError::InvalidReference { input: input.into(), reason: reason.into() }
    }

    pub fn invalid_archive<S: Into<String>>(msg: S) -> Self {
        AppError::InvalidArchive(msg.into())
    }
}
