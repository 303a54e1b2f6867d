//! GeoJSON output types.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single GeoJSON feature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    #[serde(rename = "type")]
    pub kind: String,
    /// Internal feature id
    pub id: i64,
    /// Geometry in EPSG:4326; `null` for features without geometry
    pub geometry: Value,
    pub properties: Map<String, Value>,
}

impl Feature {
    pub fn new(id: i64, geometry: Option<Value>, properties: Map<String, Value>) -> Self {
        Self {
            kind: "Feature".to_string(),
            id,
            geometry: geometry.unwrap_or(Value::Null),
            properties,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureCollection {
    #[serde(rename = "type")]
    pub kind: String,
    pub features: Vec<Feature>,
}

impl FeatureCollection {
    pub fn new(features: Vec<Feature>) -> Self {
        Self {
            kind: "FeatureCollection".to_string(),
            features,
        }
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}
