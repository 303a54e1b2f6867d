//! Shapefile ingestion primitives.
//!
//! This crate contains the database-free half of the vector pipeline:
//! - Archive validation and scoped extraction
//! - Coordinate reference system resolution
//! - Feature count prechecks
//! - The GDAL conversion seam
//! - The ingestion state machine

pub mod archive;
pub mod config;
pub mod converter;
pub mod crs;
pub mod error;
pub mod precheck;
pub mod state;
pub mod table;

pub use archive::{ArchiveManifest, ArchiveValidator, ExtractedShapefile, SourceArchive};
pub use config::{ConfigValidationError, IngestConfig};
pub use converter::{GeoConverter, OgrConverter};
pub use crs::{CrsDescriptor, CrsResolver};
pub use error::IngestError;
pub use precheck::FeaturePrechecker;
pub use state::{Effect, InvalidTransition, PipelineEvent, PipelineState, Stage};
pub use table::{BBox, QualifiedTable, TableStats, TARGET_SRID};
