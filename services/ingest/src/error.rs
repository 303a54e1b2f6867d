//! Error types for the ingestion stages.

use std::time::Duration;
use thiserror::Error;

/// Errors raised while validating, resolving, counting or loading a
/// shapefile archive.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Archive is {actual} bytes and exceeds the configured limit ({limit} bytes)")]
    TooLarge { actual: u64, limit: u64 },

    #[error("Archive member escapes the extraction directory: {0}")]
    PathTraversal(String),

    #[error("Archive must include .shp, .shx, .dbf and .prj files sharing the same name")]
    IncompleteShapefile,

    #[error("Archive could not be read: {0}")]
    InvalidArchive(String),

    #[error("Coordinate reference system could not be determined from the .prj file")]
    UnknownCrs,

    #[error("Shapefile has {count} features and exceeds the limit ({limit})")]
    TooManyFeatures { count: u64, limit: u64 },

    #[error("Loading into the spatial database failed: {0}")]
    LoadFailed(String),

    #[error("Loading did not finish within {0:?}")]
    LoadTimeout(Duration),

    #[error("Processing was cancelled")]
    Cancelled,

    #[error("Invalid {kind} name: {value}")]
    InvalidIdentifier { kind: &'static str, value: String },

    #[error("External tool is not available: {0}")]
    ToolUnavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl IngestError {
    /// Stable machine-readable error kind
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TooLarge { .. } => "too_large",
            Self::PathTraversal(_) => "path_traversal",
            Self::IncompleteShapefile => "incomplete_shapefile",
            Self::InvalidArchive(_) => "invalid_archive",
            Self::UnknownCrs => "unknown_crs",
            Self::TooManyFeatures { .. } => "too_many_features",
            Self::LoadFailed(_) => "load_failed",
            Self::LoadTimeout(_) => "load_timeout",
            Self::Cancelled => "cancelled",
            Self::InvalidIdentifier { .. } => "invalid_identifier",
            Self::ToolUnavailable(_) => "tool_unavailable",
            Self::Io(_) => "io",
        }
    }

    /// Whether this error is caused by the uploaded data rather than by the
    /// environment the service runs in.
    pub fn is_validation(&self) -> bool {
        !matches!(
            self,
            Self::ToolUnavailable(_) | Self::Io(_) | Self::InvalidIdentifier { .. }
        )
    }
}
