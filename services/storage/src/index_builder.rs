//! Spatial index and summary statistics for a freshly loaded table.
//!
//! Runs once per pipeline run against the staging table. The derived
//! extent, dominant geometry type and row count are persisted with the
//! dataset record and never recomputed by the query path.

use crate::error::StoreError;
use sqlx::postgres::PgPool;
use tracing::{debug, instrument};
use vector_ingest::converter::GEOMETRY_COLUMN;
use vector_ingest::{BBox, QualifiedTable, TableStats, TARGET_SRID};

/// Suffix of the GIST index on the geometry column
pub const GEOM_INDEX_SUFFIX: &str = "_geom_gist";

/// Builds indexes and statistics on loaded tables
#[derive(Debug, Clone)]
pub struct IndexBuilder {
    pool: PgPool,
}

impl IndexBuilder {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Enforce the target SRID, index the geometry column, refresh planner
    /// statistics and compute the summary values.
    #[instrument(skip(self), fields(table = %table))]
    pub async fn build(&self, table: &QualifiedTable) -> Result<TableStats, StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(&enforce_srid_sql(table))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&spatial_index_sql(table))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!("ANALYZE {}", table.quoted()))
            .execute(&mut *tx)
            .await?;

        let (minx, miny, maxx, maxy, count): (
            Option<f64>,
            Option<f64>,
            Option<f64>,
            Option<f64>,
            i64,
        ) = sqlx::query_as(&extent_sql(table))
            .fetch_one(&mut *tx)
            .await?;

        let geom_type: Option<String> = sqlx::query_scalar(&dominant_type_sql(table))
            .fetch_optional(&mut *tx)
            .await?;

        tx.commit().await?;

        let bbox = match (minx, miny, maxx, maxy) {
            (Some(minx), Some(miny), Some(maxx), Some(maxy)) => BBox::new(minx, miny, maxx, maxy),
            _ => None,
        };

        let stats = TableStats {
            bbox,
            geom_type,
            feature_count: count.max(0) as u64,
        };
        debug!(?stats, "Computed table statistics");
        Ok(stats)
    }
}

fn enforce_srid_sql(table: &QualifiedTable) -> String {
    format!(
        "ALTER TABLE {table} ALTER COLUMN {col} TYPE geometry(Geometry, {srid}) USING ST_SetSRID({col}, {srid})",
        table = table.quoted(),
        col = GEOMETRY_COLUMN,
        srid = TARGET_SRID,
    )
}

fn spatial_index_sql(table: &QualifiedTable) -> String {
    format!(
        "CREATE INDEX IF NOT EXISTS \"{index}\" ON {table} USING GIST ({col})",
        index = table.derived_name(GEOM_INDEX_SUFFIX),
        table = table.quoted(),
        col = GEOMETRY_COLUMN,
    )
}

fn extent_sql(table: &QualifiedTable) -> String {
    format!(
        "SELECT ST_XMin(e), ST_YMin(e), ST_XMax(e), ST_YMax(e), n \
         FROM (SELECT ST_Extent({col}) AS e, COUNT(*) AS n FROM {table}) s",
        table = table.quoted(),
        col = GEOMETRY_COLUMN,
    )
}

/// Most frequent geometry type; ties resolve alphabetically
fn dominant_type_sql(table: &QualifiedTable) -> String {
    format!(
        "SELECT GeometryType({col}) FROM {table} WHERE {col} IS NOT NULL \
         GROUP BY 1 ORDER BY COUNT(*) DESC, 1 LIMIT 1",
        table = table.quoted(),
        col = GEOMETRY_COLUMN,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> QualifiedTable {
        QualifiedTable::new("public", "vector_abc_stage").unwrap()
    }

    #[test]
    fn test_enforce_srid_sql() {
        assert_eq!(
            enforce_srid_sql(&table()),
            "ALTER TABLE \"public\".\"vector_abc_stage\" ALTER COLUMN geom TYPE geometry(Geometry, 4326) USING ST_SetSRID(geom, 4326)"
        );
    }

    #[test]
    fn test_spatial_index_sql() {
        let sql = spatial_index_sql(&table());
        assert!(sql.starts_with("CREATE INDEX IF NOT EXISTS \"vector_abc_stage_geom_gist\""));
        assert!(sql.ends_with("USING GIST (geom)"));
    }

    #[test]
    fn test_statistics_sql() {
        assert!(extent_sql(&table()).contains("ST_Extent(geom)"));
        let sql = dominant_type_sql(&table());
        assert!(sql.contains("GeometryType(geom)"));
        assert!(sql.contains("ORDER BY COUNT(*) DESC"));
    }
}
