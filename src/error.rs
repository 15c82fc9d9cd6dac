//! Error taxonomy for the tiling pipeline.
//!
//! Every variant names the file, field, feature or object key it concerns so
//! the CLI can print a precise diagnostic without extra context.

use std::path::PathBuf;
use thiserror::Error;

/// Errors produced by pipeline stages.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// A required input field is missing or a key constraint is violated.
    #[error("schema error in {}: {message}", path.display())]
    Schema { path: PathBuf, message: String },

    /// A feature geometry is null, empty, not polygonal or invalid.
    #[error("geometry error in {} (feature id={id}): {message}", path.display())]
    Geometry {
        path: PathBuf,
        id: String,
        message: String,
    },

    /// Requested include-fields exist in neither the source nor the catalog.
    #[error("include field(s) not found in source or catalog: {}", fields.join(", "))]
    NotFound { fields: Vec<String> },

    /// The external tile builder failed.
    #[error("tile build failed ({status}): {diagnostics}")]
    Build { status: String, diagnostics: String },

    /// The tile archive could not be exploded.
    #[error("tile extraction failed for {}: {message}", archive.display())]
    Extraction { archive: PathBuf, message: String },

    /// One or more objects failed to upload.
    #[error("{} object(s) failed to upload: {}", failed.len(), failed.join(", "))]
    Upload { failed: Vec<String> },

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Input could not be read or decoded.
    #[error("failed to read {}: {message}", path.display())]
    Source { path: PathBuf, message: String },

    /// Local filesystem error.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PipelineError {
    /// Wrap an I/O error with the path it occurred on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Io {
            path: path.into(),
            source,
        }
    }

    /// Process exit status for this error.
    ///
    /// Input problems exit with 2, build failures with 3, extraction with 4,
    /// uploads with 5 and everything else with 1.
    pub fn exit_code(&self) -> u8 {
        match self {
            PipelineError::Schema { .. }
            | PipelineError::Geometry { .. }
            | PipelineError::NotFound { .. }
            | PipelineError::Config(_)
            | PipelineError::Source { .. } => 2,
            PipelineError::Build { .. } => 3,
            PipelineError::Extraction { .. } => 4,
            PipelineError::Upload { .. } => 5,
            PipelineError::Io { .. } => 1,
        }
    }
}

/// Result alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;
