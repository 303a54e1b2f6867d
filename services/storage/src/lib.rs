//! Vector Storage Service
//!
//! Turns zipped ESRI shapefiles attached to datasets into PostGIS tables
//! and serves them back as paginated GeoJSON.
//!
//! ## Features
//!
//! - **Guarded ingestion**: size, path and completeness checks on every
//!   archive, CRS resolution from the `.prj`, and a feature limit enforced
//!   both before and after loading
//! - **Atomic replacement**: runs load into a staging table that is only
//!   promoted once indexed, so queries never see a half-loaded dataset
//! - **Self-healing**: an active dataset whose table disappeared is rebuilt
//!   from the retained archive on the next query
//! - **Query API**: metadata and bbox-filtered, id-ordered feature pages
//!
//! ## Architecture
//!
//! ```text
//!  PUT /vector/{id}/archive          GET /vector/{id}/items
//!          │                                  │
//!          ▼                                  ▼
//! ┌──────────────┐   ogr2ogr   ┌──────────────┐    ┌──────────────┐
//! │ Ingestion    │────────────▶│ PostGIS      │◀───│ Query        │
//! │ Pipeline     │  staging    │ vector_*     │    │ Service      │
//! └──────────────┘  table      └──────────────┘    └──────────────┘
//!        │                            ▲                   │
//!        ▼                            │                   │
//! ┌──────────────┐            ┌──────────────┐            │
//! │ Archive      │───────────▶│ Dataset      │◀───────────┘
//! │ Store        │ reprocess  │ Records      │
//! └──────────────┘            └──────────────┘
//! ```

pub mod api;
pub mod archive_store;
pub mod config;
pub mod error;
pub mod geojson;
pub mod index_builder;
pub mod locks;
pub mod metadata_store;
pub mod pipeline;
pub mod query;

#[cfg(test)]
pub(crate) mod test_support;

pub use api::{create_router, start_api_server, AppState};
pub use archive_store::{ArchiveSource, FsArchiveStore};
pub use config::Config;
pub use error::{ErrorResponse, StoreError, VectorError, VectorResult};
pub use geojson::{Feature, FeatureCollection};
pub use metadata_store::{DatasetRecord, PgVectorStore, VectorStore};
pub use pipeline::IngestionPipeline;
pub use query::{DatasetMetadata, ItemsQuery, QueryService};
