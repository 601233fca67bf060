use std::path::PathBuf;
use thiserror::Error;

use crate::gitops::error::SyncError;

#[derive(Error, Debug)]
pub enum StacksyncError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Config path not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to parse YAML in '{path}': {message}")]
    ParseYaml { path: PathBuf, message: String },

    #[error("Failed to decode application in '{path}': {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Schema validation failed in '{path}': {errors}")]
    SchemaValidation { path: PathBuf, errors: String },

    #[error("Invalid application '{name}': {reason}")]
    InvalidApplication { name: String, reason: String },

    #[error("Duplicate application '{name}' in '{path}'")]
    DuplicateApplication { name: String, path: PathBuf },

    #[error("Config validation failed: {message}")]
    Validation { message: String },
}

pub type Result<T> = std::result::Result<T, StacksyncError>;
