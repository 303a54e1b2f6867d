//! Spatial table naming and the summary values derived from a loaded table.

use crate::error::IngestError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// PostgreSQL truncates identifiers beyond this length
const MAX_IDENTIFIER_LEN: usize = 63;

/// Longest generated table name, leaving room for derived object suffixes
const MAX_TABLE_LEN: usize = 50;

/// Suffix of the table a run loads into before it is swapped into place
const STAGING_SUFFIX: &str = "_stage";

/// Target SRID of every loaded table
pub const TARGET_SRID: i32 = 4326;

/// Check that a value is usable as an unquoted SQL identifier
pub fn safe_identifier<'a>(value: &'a str, kind: &'static str) -> Result<&'a str, IngestError> {
    let mut chars = value.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };

    if valid && value.len() <= MAX_IDENTIFIER_LEN {
        Ok(value)
    } else {
        Err(IngestError::InvalidIdentifier {
            kind,
            value: value.to_string(),
        })
    }
}

/// A schema-qualified table name made only of safe identifiers
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QualifiedTable {
    schema: String,
    table: String,
}

impl QualifiedTable {
    /// Build a table reference, validating both identifiers
    pub fn new(schema: &str, table: &str) -> Result<Self, IngestError> {
        safe_identifier(schema, "schema")?;
        safe_identifier(table, "table")?;
        Ok(Self {
            schema: schema.to_string(),
            table: table.to_string(),
        })
    }

    /// Derive the table for a dataset: `<prefix><dataset_id>` with the id
    /// reduced to lowercase alphanumerics.
    pub fn for_dataset(schema: &str, prefix: &str, dataset_id: &str) -> Result<Self, IngestError> {
        safe_identifier(prefix, "table prefix")?;
        let mut safe_id: String = dataset_id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();
        if safe_id.is_empty() {
            safe_id = "resource".to_string();
        }

        let mut table = format!("{}{}", prefix, safe_id).to_lowercase();
        table.truncate(MAX_TABLE_LEN);

        Self::new(schema, &table)
    }

    /// Parse the `schema.table` form stored in dataset records
    pub fn parse(qualified: &str) -> Result<Self, IngestError> {
        match qualified.split_once('.') {
            Some((schema, table)) => Self::new(schema, table),
            None => Self::new("public", qualified),
        }
    }

    /// The table a run loads into before promotion
    pub fn staging(&self) -> Self {
        Self {
            schema: self.schema.clone(),
            table: self.derived_name(STAGING_SUFFIX),
        }
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Name of an object derived from this table (index, sequence, ...),
    /// shortened the same way PostgreSQL shortens generated names.
    pub fn derived_name(&self, suffix: &str) -> String {
        let keep = MAX_IDENTIFIER_LEN.saturating_sub(suffix.len()).min(self.table.len());
        format!("{}{}", &self.table[..keep], suffix)
    }

    /// Quoted form for interpolation into SQL
    pub fn quoted(&self) -> String {
        format!("\"{}\".\"{}\"", self.schema, self.table)
    }

    /// Quoted, schema-qualified name of a derived object
    pub fn quoted_derived(&self, suffix: &str) -> String {
        format!("\"{}\".\"{}\"", self.schema, self.derived_name(suffix))
    }
}

impl fmt::Display for QualifiedTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

/// Axis-aligned bounding rectangle in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub minx: f64,
    pub miny: f64,
    pub maxx: f64,
    pub maxy: f64,
}

impl BBox {
    /// Build a box, rejecting non-finite values and inverted ranges
    pub fn new(minx: f64, miny: f64, maxx: f64, maxy: f64) -> Option<Self> {
        let finite = [minx, miny, maxx, maxy].iter().all(|v| v.is_finite());
        if !finite || minx > maxx || miny > maxy {
            return None;
        }
        Some(Self {
            minx,
            miny,
            maxx,
            maxy,
        })
    }

    pub fn from_slice(values: &[f64]) -> Option<Self> {
        match values {
            [minx, miny, maxx, maxy] => Self::new(*minx, *miny, *maxx, *maxy),
            _ => None,
        }
    }

    pub fn to_vec(self) -> Vec<f64> {
        vec![self.minx, self.miny, self.maxx, self.maxy]
    }

    pub fn intersects(&self, other: &BBox) -> bool {
        self.minx <= other.maxx
            && other.minx <= self.maxx
            && self.miny <= other.maxy
            && other.miny <= self.maxy
    }

    /// Smallest box covering both
    pub fn union(&self, other: &BBox) -> BBox {
        BBox {
            minx: self.minx.min(other.minx),
            miny: self.miny.min(other.miny),
            maxx: self.maxx.max(other.maxx),
            maxy: self.maxy.max(other.maxy),
        }
    }
}

/// Values computed once after a successful load
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableStats {
    /// Extent of all geometries; `None` for an empty table
    pub bbox: Option<BBox>,
    /// Most frequent geometry type (e.g. `POLYGON`)
    pub geom_type: Option<String>,
    /// Number of loaded rows
    pub feature_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_for_dataset() {
        let table =
            QualifiedTable::for_dataset("public", "vector_", "8F2C-11aa-bb").unwrap();
        assert_eq!(table.table(), "vector_8f2c11aabb");
        assert_eq!(table.to_string(), "public.vector_8f2c11aabb");
        assert_eq!(table.quoted(), "\"public\".\"vector_8f2c11aabb\"");
    }

    #[test]
    fn test_table_for_dataset_without_alphanumerics() {
        let table = QualifiedTable::for_dataset("public", "vector_", "--//").unwrap();
        assert_eq!(table.table(), "vector_resource");
    }

    #[test]
    fn test_table_name_is_deterministic_and_bounded() {
        let id = "a".repeat(200);
        let first = QualifiedTable::for_dataset("geo", "vector_", &id).unwrap();
        let second = QualifiedTable::for_dataset("geo", "vector_", &id).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.table().len(), MAX_TABLE_LEN);
    }

    #[test]
    fn test_unsafe_identifiers_rejected() {
        assert!(QualifiedTable::new("public; drop", "t").is_err());
        assert!(QualifiedTable::new("public", "1abc").is_err());
        assert!(QualifiedTable::for_dataset("public", "bad-prefix", "id").is_err());
        assert!(safe_identifier("_ok_1", "table").is_ok());
    }

    #[test]
    fn test_staging_and_derived_names() {
        let table = QualifiedTable::new("public", "vector_abc").unwrap();
        assert_eq!(table.staging().table(), "vector_abc_stage");
        assert_eq!(table.derived_name("_pkey"), "vector_abc_pkey");

        let long = QualifiedTable::new("public", &"t".repeat(60)).unwrap();
        assert_eq!(long.derived_name("_ogc_fid_seq").len(), 63);
        assert!(long.staging().table().ends_with("_stage"));
    }

    #[test]
    fn test_parse_qualified() {
        let table = QualifiedTable::parse("geo.vector_1").unwrap();
        assert_eq!(table.schema(), "geo");
        assert_eq!(table.table(), "vector_1");
        assert_eq!(QualifiedTable::parse("vector_1").unwrap().schema(), "public");
        assert!(QualifiedTable::parse("geo.vec tor").is_err());
    }

    #[test]
    fn test_bbox_validation() {
        assert!(BBox::new(0.0, 0.0, 1.0, 1.0).is_some());
        assert!(BBox::new(10.0, 10.0, 5.0, 5.0).is_none());
        assert!(BBox::new(f64::NAN, 0.0, 1.0, 1.0).is_none());
        assert!(BBox::from_slice(&[1.0, 2.0, 3.0]).is_none());
    }

    #[test]
    fn test_bbox_intersects_and_union() {
        let a = BBox::new(0.0, 0.0, 2.0, 2.0).unwrap();
        let b = BBox::new(1.0, 1.0, 3.0, 3.0).unwrap();
        let c = BBox::new(5.0, 5.0, 6.0, 6.0).unwrap();
        assert!(a.intersects(&b));
        assert!(!a.intersects(&c));
        assert_eq!(a.union(&c), BBox::new(0.0, 0.0, 6.0, 6.0).unwrap());
    }
}
