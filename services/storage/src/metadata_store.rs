use crate::config::DatabaseConfig;
use crate::error::StoreError;
use crate::geojson::Feature;
use crate::index_builder::{IndexBuilder, GEOM_INDEX_SUFFIX};
use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoff};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use vector_ingest::converter::{FID_COLUMN, GEOMETRY_COLUMN};
use vector_ingest::{BBox, QualifiedTable, TableStats, TARGET_SRID};

/// Persistent dataset record
#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct DatasetRecord {
    /// Host dataset identifier
    pub dataset_id: String,
    /// Activation flag
    pub enabled: bool,
    /// Qualified table name (`schema.table`)
    pub vector_table: Option<String>,
    pub vector_schema: Option<String>,
    pub srid: Option<i32>,
    /// `[minx, miny, maxx, maxy]`
    pub bbox: Option<Vec<f64>>,
    pub geom_type: Option<String>,
    pub feature_count: Option<i64>,
    pub updated_at: DateTime<Utc>,
}

impl DatasetRecord {
    /// Record for a freshly promoted table
    pub fn persisted(dataset_id: &str, table: &QualifiedTable, stats: &TableStats) -> Self {
        Self {
            dataset_id: dataset_id.to_string(),
            enabled: true,
            vector_table: Some(table.to_string()),
            vector_schema: Some(table.schema().to_string()),
            srid: Some(TARGET_SRID),
            bbox: stats.bbox.map(BBox::to_vec),
            geom_type: stats.geom_type.clone(),
            feature_count: Some(stats.feature_count as i64),
            updated_at: Utc::now(),
        }
    }

    /// Table this record points at, if any
    pub fn table(&self) -> Result<Option<QualifiedTable>, StoreError> {
        self.vector_table
            .as_deref()
            .map(QualifiedTable::parse)
            .transpose()
            .map_err(|e| StoreError::InvalidRecord(e.to_string()))
    }

    /// Derived values, present only on an active record
    pub fn stats(&self) -> Option<TableStats> {
        if !self.enabled {
            return None;
        }
        Some(TableStats {
            bbox: self.bbox.as_deref().and_then(BBox::from_slice),
            geom_type: self.geom_type.clone(),
            feature_count: self.feature_count?.max(0) as u64,
        })
    }

    /// Drop derived fields, keeping the row
    pub fn cleared(mut self) -> Self {
        self.enabled = false;
        self.vector_table = None;
        self.vector_schema = None;
        self.srid = None;
        self.bbox = None;
        self.geom_type = None;
        self.feature_count = None;
        self.updated_at = Utc::now();
        self
    }
}

/// Persistence for dataset records and their spatial tables
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Fetch a dataset record
    async fn dataset(&self, dataset_id: &str) -> Result<Option<DatasetRecord>, StoreError>;

    /// Check whether a table exists
    async fn table_exists(&self, table: &QualifiedTable) -> Result<bool, StoreError>;

    /// Drop a table if it exists
    async fn drop_table(&self, table: &QualifiedTable) -> Result<(), StoreError>;

    /// Index a loaded table and compute its statistics
    async fn build_index(&self, table: &QualifiedTable) -> Result<TableStats, StoreError>;

    /// Atomically replace `target` with `staging` and write the record
    async fn promote(
        &self,
        dataset_id: &str,
        staging: &QualifiedTable,
        target: &QualifiedTable,
        stats: &TableStats,
    ) -> Result<DatasetRecord, StoreError>;

    /// Drop the table and clear the record's derived fields
    async fn deactivate(&self, dataset_id: &str, table: &QualifiedTable) -> Result<(), StoreError>;

    /// Drop the table and delete the record
    async fn remove(&self, dataset_id: &str, table: &QualifiedTable) -> Result<(), StoreError>;

    /// Page through features ordered by internal id
    async fn features(
        &self,
        table: &QualifiedTable,
        bbox: Option<BBox>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Feature>, StoreError>;

    /// Check database connectivity
    async fn ping(&self) -> Result<(), StoreError>;
}

#[derive(Debug, FromRow)]
struct FeatureRow {
    id: i64,
    geometry: Option<serde_json::Value>,
    properties: serde_json::Value,
}

impl From<FeatureRow> for Feature {
    fn from(row: FeatureRow) -> Self {
        let properties = match row.properties {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        Feature::new(row.id, row.geometry, properties)
    }
}

/// PostgreSQL/PostGIS store
#[derive(Debug, Clone)]
pub struct PgVectorStore {
    pool: PgPool,
    index_builder: IndexBuilder,
}

impl PgVectorStore {
    /// Connect with exponential backoff for up to `connect_retry_secs`
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let mut backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(10),
            max_elapsed_time: Some(config.connect_retry()),
            ..Default::default()
        };

        let mut attempts = 0u32;
        let pool = loop {
            let result = PgPoolOptions::new()
                .max_connections(config.max_connections)
                .min_connections(config.min_connections)
                .acquire_timeout(config.connect_timeout())
                .idle_timeout(Some(config.idle_timeout()))
                .connect(&config.url)
                .await;

            match result {
                Ok(pool) => break pool,
                Err(e) => {
                    attempts += 1;
                    match backoff.next_backoff() {
                        Some(delay) => {
                            warn!(
                                attempt = attempts,
                                delay_ms = delay.as_millis(),
                                error = %e,
                                "Database connection failed, retrying"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        None => return Err(e.into()),
                    }
                }
            }
        };

        info!(attempts = attempts + 1, "Connected to PostgreSQL database");

        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            index_builder: IndexBuilder::new(pool.clone()),
            pool,
        }
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations").run(&self.pool).await?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Get the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl VectorStore for PgVectorStore {
    async fn dataset(&self, dataset_id: &str) -> Result<Option<DatasetRecord>, StoreError> {
        let record = sqlx::query_as::<_, DatasetRecord>(
            r#"
            SELECT dataset_id, enabled, vector_table, vector_schema, srid,
                   bbox, geom_type, feature_count, updated_at
            FROM vector_datasets
            WHERE dataset_id = $1
            "#,
        )
        .bind(dataset_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn table_exists(&self, table: &QualifiedTable) -> Result<bool, StoreError> {
        let exists: bool = sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
            .bind(table.quoted())
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    #[instrument(skip(self), fields(table = %table))]
    async fn drop_table(&self, table: &QualifiedTable) -> Result<(), StoreError> {
        sqlx::query(&format!("DROP TABLE IF EXISTS {} CASCADE", table.quoted()))
            .execute(&self.pool)
            .await?;
        debug!("Dropped table");
        Ok(())
    }

    async fn build_index(&self, table: &QualifiedTable) -> Result<TableStats, StoreError> {
        self.index_builder.build(table).await
    }

    #[instrument(skip(self, stats), fields(staging = %staging, target = %target))]
    async fn promote(
        &self,
        dataset_id: &str,
        staging: &QualifiedTable,
        target: &QualifiedTable,
        stats: &TableStats,
    ) -> Result<DatasetRecord, StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!("DROP TABLE IF EXISTS {} CASCADE", target.quoted()))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!(
            "ALTER TABLE {} RENAME TO \"{}\"",
            staging.quoted(),
            target.table()
        ))
        .execute(&mut *tx)
        .await?;

        for (kind, suffix) in [
            ("INDEX", GEOM_INDEX_SUFFIX),
            ("INDEX", "_pkey"),
            ("SEQUENCE", "_ogc_fid_seq"),
        ] {
            sqlx::query(&format!(
                "ALTER {} IF EXISTS {} RENAME TO \"{}\"",
                kind,
                staging.quoted_derived(suffix),
                target.derived_name(suffix)
            ))
            .execute(&mut *tx)
            .await?;
        }

        let record = DatasetRecord::persisted(dataset_id, target, stats);
        let record = sqlx::query_as::<_, DatasetRecord>(
            r#"
            INSERT INTO vector_datasets (
                dataset_id, enabled, vector_table, vector_schema, srid,
                bbox, geom_type, feature_count, updated_at
            ) VALUES ($1, TRUE, $2, $3, $4, $5, $6, $7, NOW())
            ON CONFLICT (dataset_id) DO UPDATE SET
                enabled = TRUE,
                vector_table = EXCLUDED.vector_table,
                vector_schema = EXCLUDED.vector_schema,
                srid = EXCLUDED.srid,
                bbox = EXCLUDED.bbox,
                geom_type = EXCLUDED.geom_type,
                feature_count = EXCLUDED.feature_count,
                updated_at = EXCLUDED.updated_at
            RETURNING dataset_id, enabled, vector_table, vector_schema, srid,
                      bbox, geom_type, feature_count, updated_at
            "#,
        )
        .bind(&record.dataset_id)
        .bind(&record.vector_table)
        .bind(&record.vector_schema)
        .bind(record.srid)
        .bind(&record.bbox)
        .bind(&record.geom_type)
        .bind(record.feature_count)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(feature_count = ?record.feature_count, "Dataset promoted");
        Ok(record)
    }

    #[instrument(skip(self), fields(table = %table))]
    async fn deactivate(&self, dataset_id: &str, table: &QualifiedTable) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!("DROP TABLE IF EXISTS {} CASCADE", table.quoted()))
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            UPDATE vector_datasets SET
                enabled = FALSE,
                vector_table = NULL,
                vector_schema = NULL,
                srid = NULL,
                bbox = NULL,
                geom_type = NULL,
                feature_count = NULL,
                updated_at = NOW()
            WHERE dataset_id = $1
            "#,
        )
        .bind(dataset_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self), fields(table = %table))]
    async fn remove(&self, dataset_id: &str, table: &QualifiedTable) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!("DROP TABLE IF EXISTS {} CASCADE", table.quoted()))
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM vector_datasets WHERE dataset_id = $1")
            .bind(dataset_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self), fields(table = %table))]
    async fn features(
        &self,
        table: &QualifiedTable,
        bbox: Option<BBox>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Feature>, StoreError> {
        let sql = features_sql(table, bbox.is_some());
        let mut query = sqlx::query_as::<_, FeatureRow>(&sql);

        if let Some(bbox) = bbox {
            query = query
                .bind(bbox.minx)
                .bind(bbox.miny)
                .bind(bbox.maxx)
                .bind(bbox.maxy);
        }

        let rows = query
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(Feature::from).collect())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Feature page query; bbox parameters are $1..$4 when filtered
fn features_sql(table: &QualifiedTable, with_bbox: bool) -> String {
    let mut sql = format!(
        "SELECT t.{fid}::bigint AS id, ST_AsGeoJSON(t.{geom})::jsonb AS geometry, \
         to_jsonb(t) - '{geom}' AS properties FROM {table} t",
        fid = FID_COLUMN,
        geom = GEOMETRY_COLUMN,
        table = table.quoted(),
    );

    let next = if with_bbox {
        sql.push_str(&format!(
            " WHERE ST_Intersects(t.{geom}, ST_MakeEnvelope($1, $2, $3, $4, {srid}))",
            geom = GEOMETRY_COLUMN,
            srid = TARGET_SRID,
        ));
        5
    } else {
        1
    };

    sql.push_str(&format!(
        " ORDER BY t.{fid} LIMIT ${} OFFSET ${}",
        next,
        next + 1,
        fid = FID_COLUMN,
    ));
    sql
}
