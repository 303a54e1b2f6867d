//! Metadata and paginated feature queries.

use crate::config::ApiConfig;
use crate::error::{VectorError, VectorResult};
use crate::geojson::FeatureCollection;
use crate::metadata_store::VectorStore;
use crate::pipeline::IngestionPipeline;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument};
use vector_ingest::BBox;

/// Raw query parameters for the items endpoint.
///
/// Kept as strings so malformed `limit` and `offset` values fall back to
/// their defaults instead of rejecting the request.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct ItemsQuery {
    pub bbox: Option<String>,
    pub limit: Option<String>,
    pub offset: Option<String>,
}

/// Derived values for an active dataset
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetMetadata {
    pub bbox: Option<Vec<f64>>,
    pub geom_type: Option<String>,
    pub feature_count: Option<i64>,
    pub srid: Option<i32>,
    pub vector_table: Option<String>,
}

/// Parse `minx,miny,maxx,maxy`
pub fn parse_bbox(raw: &str) -> VectorResult<BBox> {
    let invalid = || VectorError::InvalidBBox(raw.to_string());

    let values = raw
        .split(',')
        .map(|part| part.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| invalid())?;

    BBox::from_slice(&values).ok_or_else(invalid)
}

/// Page size: default when absent or unparseable, clamped to `0..=max`
pub fn parse_limit(raw: Option<&str>, default: u32, max: u32) -> i64 {
    let requested = raw
        .and_then(|v| v.trim().parse::<i64>().ok())
        .unwrap_or(i64::from(default));
    requested.clamp(0, i64::from(max))
}

/// Page offset: zero when absent, unparseable or negative
pub fn parse_offset(raw: Option<&str>) -> i64 {
    raw.and_then(|v| v.trim().parse::<i64>().ok())
        .unwrap_or(0)
        .max(0)
}

/// Read side of the service
pub struct QueryService {
    pipeline: Arc<IngestionPipeline>,
    store: Arc<dyn VectorStore>,
    max_items: u32,
    default_limit: u32,
}

impl QueryService {
    pub fn new(pipeline: Arc<IngestionPipeline>, store: Arc<dyn VectorStore>, config: &ApiConfig) -> Self {
        Self {
            pipeline,
            store,
            max_items: config.max_items,
            default_limit: config.default_limit.min(config.max_items),
        }
    }

    #[instrument(skip(self))]
    pub async fn get_metadata(&self, dataset_id: &str) -> VectorResult<DatasetMetadata> {
        let record = self.pipeline.ensure_ready(dataset_id).await?;
        Ok(DatasetMetadata {
            bbox: record.bbox,
            geom_type: record.geom_type,
            feature_count: record.feature_count,
            srid: record.srid,
            vector_table: record.vector_table,
        })
    }

    #[instrument(skip(self, query))]
    pub async fn get_items(&self, dataset_id: &str, query: &ItemsQuery) -> VectorResult<FeatureCollection> {
        // Parameters are checked before touching the dataset
        let bbox = match query.bbox.as_deref().map(str::trim) {
            Some(raw) if !raw.is_empty() => Some(parse_bbox(raw)?),
            _ => None,
        };
        let limit = parse_limit(query.limit.as_deref(), self.default_limit, self.max_items);
        let offset = parse_offset(query.offset.as_deref());

        let record = self.pipeline.ensure_ready(dataset_id).await?;
        let table = record
            .table()?
            .ok_or_else(|| VectorError::NotActivated(dataset_id.to_string()))?;

        let features = self
            .store
            .features(&table, bbox, limit, offset)
            .await
            .map_err(|e| {
                if e.is_missing_table() {
                    VectorError::NotActivated(dataset_id.to_string())
                } else {
                    e.into()
                }
            })?;

        debug!(returned = features.len(), limit, offset, "Served feature page");
        metrics::counter!("vector.query.items").increment(features.len() as u64);

        Ok(FeatureCollection::new(features))
    }
}
