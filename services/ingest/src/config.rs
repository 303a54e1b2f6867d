//! Configuration for shapefile ingestion.
//!
//! The struct is deserialized as the `ingest` section of the service
//! configuration and passed by reference into every stage constructor.

use crate::table::safe_identifier;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

const MIB: u64 = 1024 * 1024;

/// Ingestion limits, naming and external tool settings.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Master switch; when off nothing is processed
    #[serde(default)]
    pub enabled: bool,

    /// Process every uploaded archive without waiting for activation
    #[serde(default)]
    pub auto_process: bool,

    /// Maximum archive size in megabytes
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u64,

    /// Maximum total uncompressed size of all members in megabytes
    #[serde(default = "default_max_uncompressed_mb")]
    pub max_uncompressed_mb: u64,

    /// Maximum number of features accepted per dataset
    #[serde(default = "default_max_features")]
    pub max_features: u64,

    /// Schema holding the spatial tables
    #[serde(default = "default_schema")]
    pub schema: String,

    /// Prefix of every spatial table name
    #[serde(default = "default_table_prefix")]
    pub table_prefix: String,

    /// OGR PostgreSQL connection string (`PG:...`); derived from the
    /// database URL when absent
    #[serde(default)]
    pub ogr_pg_dsn: Option<String>,

    /// Path or name of the ogr2ogr executable
    #[serde(default = "default_ogr2ogr_path")]
    pub ogr2ogr_path: String,

    /// Path or name of the ogrinfo executable
    #[serde(default = "default_ogrinfo_path")]
    pub ogrinfo_path: String,

    /// Maximum runtime of a single load in seconds
    #[serde(default = "default_load_timeout_secs")]
    pub load_timeout_secs: u64,

    /// Directory retaining uploaded archives for reprocessing
    #[serde(default = "default_archive_dir")]
    pub archive_dir: PathBuf,

    /// Root for temporary extraction directories (system temp when unset)
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

// Default value functions
fn default_max_size_mb() -> u64 {
    200
}
fn default_max_uncompressed_mb() -> u64 {
    1024
}
fn default_max_features() -> u64 {
    50_000
}
fn default_schema() -> String {
    "public".to_string()
}
fn default_table_prefix() -> String {
    "vector_".to_string()
}
fn default_ogr2ogr_path() -> String {
    "ogr2ogr".to_string()
}
fn default_ogrinfo_path() -> String {
    "ogrinfo".to_string()
}
fn default_load_timeout_secs() -> u64 {
    600
}
fn default_archive_dir() -> PathBuf {
    PathBuf::from("/var/lib/vector/archives")
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            auto_process: false,
            max_size_mb: default_max_size_mb(),
            max_uncompressed_mb: default_max_uncompressed_mb(),
            max_features: default_max_features(),
            schema: default_schema(),
            table_prefix: default_table_prefix(),
            ogr_pg_dsn: None,
            ogr2ogr_path: default_ogr2ogr_path(),
            ogrinfo_path: default_ogrinfo_path(),
            load_timeout_secs: default_load_timeout_secs(),
            archive_dir: default_archive_dir(),
            work_dir: None,
        }
    }
}

impl IngestConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        safe_identifier(&self.schema, "schema").map_err(|e| {
            ConfigValidationError::InvalidValue {
                field: "ingest.schema".to_string(),
                message: e.to_string(),
            }
        })?;

        safe_identifier(&self.table_prefix, "table prefix").map_err(|e| {
            ConfigValidationError::InvalidValue {
                field: "ingest.table_prefix".to_string(),
                message: e.to_string(),
            }
        })?;

        if self.max_size_mb == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "ingest.max_size_mb".to_string(),
                message: "Limit must be greater than 0".to_string(),
            });
        }

        if self.load_timeout_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "ingest.load_timeout_secs".to_string(),
                message: "Timeout must be greater than 0".to_string(),
            });
        }

        if self.ogr2ogr_path.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "ingest.ogr2ogr_path".to_string(),
            ));
        }

        if self.ogrinfo_path.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "ingest.ogrinfo_path".to_string(),
            ));
        }

        Ok(())
    }

    /// Get the archive size limit in bytes.
    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_mb.saturating_mul(MIB)
    }

    /// Get the uncompressed size limit in bytes.
    pub fn max_uncompressed_bytes(&self) -> u64 {
        self.max_uncompressed_mb.saturating_mul(MIB)
    }

    /// Get the load timeout as Duration.
    pub fn load_timeout(&self) -> Duration {
        Duration::from_secs(self.load_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = IngestConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_size_bytes(), 200 * MIB);
        assert_eq!(config.max_features, 50_000);
        assert_eq!(config.load_timeout(), Duration::from_secs(600));
    }

    #[test]
    fn test_invalid_schema() {
        let config = IngestConfig {
            schema: "public;drop".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_invalid_prefix() {
        let config = IngestConfig {
            table_prefix: "vector-".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_tool_path() {
        let config = IngestConfig {
            ogrinfo_path: String::new(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::MissingField(_))
        ));
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: IngestConfig =
            serde_json::from_str(r#"{"enabled": true, "max_features": 10}"#).unwrap();
        assert!(config.enabled);
        assert_eq!(config.max_features, 10);
        assert_eq!(config.table_prefix, "vector_");
    }
}
