//! External GIS conversion utility.
//!
//! [`GeoConverter`] is the narrow seam between the pipeline and GDAL: one
//! call to count features, one to reproject and load into PostGIS. The
//! production implementation shells out to `ogrinfo` and `ogr2ogr`.
//! Child processes are killed when the returned future is dropped, so a
//! timeout or cancellation around a call also stops the subprocess.

use crate::config::IngestConfig;
use crate::error::IngestError;
use crate::table::{QualifiedTable, TARGET_SRID};
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

/// Longest stderr excerpt carried in a load error
const MAX_ERROR_DETAIL: usize = 200;

/// Geometry column name in every loaded table
pub const GEOMETRY_COLUMN: &str = "geom";

/// Internal feature id column in every loaded table
pub const FID_COLUMN: &str = "ogc_fid";

/// Conversion utility used by the pipeline
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GeoConverter: Send + Sync {
    /// Count features in a shapefile without materializing geometries
    async fn count_features(&self, source: &Path) -> Result<u64, IngestError>;

    /// Reproject a shapefile to EPSG:4326 and write it to `target`,
    /// replacing any existing table of the same name
    async fn load_and_reproject(
        &self,
        source: &Path,
        target: &QualifiedTable,
        source_epsg: u32,
    ) -> Result<(), IngestError>;
}

/// GDAL command line implementation
#[derive(Debug, Clone)]
pub struct OgrConverter {
    ogr2ogr_path: String,
    ogrinfo_path: String,
    pg_dsn: String,
}

impl OgrConverter {
    /// Create a converter; the OGR DSN falls back to the database URL
    pub fn new(config: &IngestConfig, database_url: &str) -> Self {
        let pg_dsn = match &config.ogr_pg_dsn {
            Some(dsn) if dsn.starts_with("PG:") => dsn.clone(),
            Some(dsn) => format!("PG:{}", dsn),
            None => format!("PG:{}", database_url),
        };

        Self {
            ogr2ogr_path: config.ogr2ogr_path.clone(),
            ogrinfo_path: config.ogrinfo_path.clone(),
            pg_dsn,
        }
    }

    /// Arguments passed to ogr2ogr for a load
    pub fn load_args(&self, source: &Path, target: &QualifiedTable, source_epsg: u32) -> Vec<OsString> {
        vec![
            "-f".into(),
            "PostgreSQL".into(),
            self.pg_dsn.clone().into(),
            source.as_os_str().to_owned(),
            "-nln".into(),
            target.to_string().into(),
            "-nlt".into(),
            "GEOMETRY".into(),
            "-lco".into(),
            format!("GEOMETRY_NAME={}", GEOMETRY_COLUMN).into(),
            "-lco".into(),
            format!("FID={}", FID_COLUMN).into(),
            "-lco".into(),
            "SPATIAL_INDEX=NONE".into(),
            "-s_srs".into(),
            format!("EPSG:{}", source_epsg).into(),
            "-t_srs".into(),
            format!("EPSG:{}", TARGET_SRID).into(),
            "-overwrite".into(),
        ]
    }

    async fn run(&self, program: &str, args: Vec<OsString>) -> Result<String, IngestError> {
        let output = Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => IngestError::ToolUnavailable(program.to_string()),
                _ => IngestError::Io(e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = error_detail(&stderr)
                .unwrap_or_else(|| format!("{} exited with {}", program, output.status));
            warn!(program, status = %output.status, detail = %detail, "Conversion tool failed");
            return Err(IngestError::LoadFailed(detail));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl GeoConverter for OgrConverter {
    #[instrument(skip(self))]
    async fn count_features(&self, source: &Path) -> Result<u64, IngestError> {
        let args: Vec<OsString> = vec![
            "-ro".into(),
            "-so".into(),
            "-al".into(),
            source.as_os_str().to_owned(),
        ];
        let stdout = self.run(&self.ogrinfo_path, args).await?;

        let count = parse_feature_count(&stdout).ok_or_else(|| {
            IngestError::LoadFailed("ogrinfo output did not report a feature count".to_string())
        })?;
        debug!(count, "Counted features");
        Ok(count)
    }

    #[instrument(skip(self, target), fields(target = %target))]
    async fn load_and_reproject(
        &self,
        source: &Path,
        target: &QualifiedTable,
        source_epsg: u32,
    ) -> Result<(), IngestError> {
        let args = self.load_args(source, target, source_epsg);
        self.run(&self.ogr2ogr_path, args).await?;
        debug!("Load completed");
        Ok(())
    }
}

/// Sum every `Feature Count: N` line of `ogrinfo -so -al` output.
/// Returns `None` when no layer reported a count.
pub fn parse_feature_count(stdout: &str) -> Option<u64> {
    let mut total: Option<u64> = None;
    for line in stdout.lines() {
        let Some(rest) = line.trim().strip_prefix("Feature Count:") else {
            continue;
        };
        let count: u64 = rest.trim().parse().ok()?;
        total = Some(total.unwrap_or(0).saturating_add(count));
    }
    total
}

/// Last non-empty stderr line, shortened
fn error_detail(stderr: &str) -> Option<String> {
    let line = stderr.lines().rev().map(str::trim).find(|l| !l.is_empty())?;
    let mut end = line.len().min(MAX_ERROR_DETAIL);
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    Some(line[..end].to_string())
}
