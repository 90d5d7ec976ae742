use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DrawdiffError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Alignment error: {0}")]
    Align(#[from] AlignError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Job error: {0}")]
    Job(#[from] crate::orchestrator::JobError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Overlay error: {0}")]
    Overlay(#[from] crate::manual_overlay::OverlayError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] crate::pipeline::PipelineError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },
}

/// Unreadable input pages. Never retried.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Page '{reference}' does not exist in storage")]
    Missing { reference: String },

    #[error("Page '{reference}' is empty")]
    Empty { reference: String },

    #[error("Page '{reference}' has unsupported media type '{media_type}'")]
    UnsupportedMediaType {
        reference: String,
        media_type: String,
    },

    #[error("Page '{reference}' could not be decoded: {source}")]
    Corrupt {
        reference: String,
        #[source]
        source: image::ImageError,
    },

    #[error("Failed to read page '{reference}': {source}")]
    Read {
        reference: String,
        #[source]
        source: StorageError,
    },
}

/// Recoverable alignment failures. The stage is retried up to its limit.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AlignError {
    #[error("Insufficient features: {found} accepted correspondences, {required} required")]
    InsufficientFeatures { found: usize, required: usize },

    #[error("Alignment rejected: inlier ratio {inlier_ratio:.3} below threshold {threshold:.3}")]
    Alignment { inlier_ratio: f64, threshold: f64 },

    #[error("Image dimensions differ: {left:?} vs {right:?}")]
    DimensionMismatch { left: (u32, u32), right: (u32, u32) },

    #[error("Estimated transform is degenerate")]
    DegenerateTransform,
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Invalid storage key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("Object '{key}' not found")]
    NotFound { key: String },

    #[error("Failed to create directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write file '{path}': {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode image for '{key}': {source}")]
    Encode {
        key: String,
        #[source]
        source: image::ImageError,
    },
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to spawn worker: {0}")]
    SpawnFailed(String),

    #[error("Worker channel closed unexpectedly")]
    ChannelClosed,

    #[error("Failed to install signal handler: {0}")]
    Signal(String),
}

pub type Result<T> = std::result::Result<T, DrawdiffError>;
