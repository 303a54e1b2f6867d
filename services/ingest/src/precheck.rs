//! Feature count gate run before any database work.

use crate::converter::GeoConverter;
use crate::error::IngestError;
use std::path::Path;
use tracing::{debug, warn};

/// Rejects shapefiles with more features than the configured limit
#[derive(Debug, Clone, Copy)]
pub struct FeaturePrechecker {
    max_features: u64,
}

impl FeaturePrechecker {
    pub fn new(max_features: u64) -> Self {
        Self { max_features }
    }

    pub fn max_features(&self) -> u64 {
        self.max_features
    }

    /// Count features in `shp` and enforce the limit.
    ///
    /// The returned count is advisory. The row count measured after the
    /// load is what gets persisted.
    pub async fn check<C>(&self, converter: &C, shp: &Path) -> Result<u64, IngestError>
    where
        C: GeoConverter + ?Sized,
    {
        let count = converter.count_features(shp).await?;
        self.enforce(count)?;
        debug!(count, limit = self.max_features, "Feature count within limit");
        Ok(count)
    }

    /// Apply the limit to a count obtained elsewhere
    pub fn enforce(&self, count: u64) -> Result<(), IngestError> {
        if count > self.max_features {
            warn!(count, limit = self.max_features, "Feature count exceeds limit");
            return Err(IngestError::TooManyFeatures {
                count,
                limit: self.max_features,
            });
        }
        Ok(())
    }
}
