//! In-memory doubles for pipeline and API tests.

use crate::archive_store::ArchiveSource;
use crate::error::StoreError;
use crate::geojson::Feature;
use crate::metadata_store::{DatasetRecord, VectorStore};
use crate::pipeline::IngestionPipeline;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use vector_ingest::{
    BBox, GeoConverter, IngestConfig, IngestError, QualifiedTable, SourceArchive, TableStats,
};
use zip::write::SimpleFileOptions;

pub(crate) const WGS84_PRJ: &str = r#"GEOGCS["WGS 84",DATUM["WGS_1984",SPHEROID["WGS 84",6378137,298.257223563]],PRIMEM["Greenwich",0],UNIT["degree",0.0174532925199433],AUTHORITY["EPSG","4326"]]"#;

/// Shapefile archive with a WGS84 projection
pub(crate) fn shapefile_archive(dataset_id: &str) -> SourceArchive {
    archive_with_prj(dataset_id, WGS84_PRJ)
}

pub(crate) fn archive_with_prj(dataset_id: &str, prj: &str) -> SourceArchive {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    for (name, content) in [
        ("parcels/parcels.shp", "shp"),
        ("parcels/parcels.shx", "shx"),
        ("parcels/parcels.dbf", "dbf"),
        ("parcels/parcels.prj", prj),
    ] {
        writer.start_file(name, options).unwrap();
        writer.write_all(content.as_bytes()).unwrap();
    }
    let bytes = Bytes::from(writer.finish().unwrap().into_inner());
    SourceArchive::new(dataset_id, bytes)
}

/// Small square polygons along a line, ids starting at 1
pub(crate) fn parcels(count: u64) -> Vec<Feature> {
    (1..=count)
        .map(|id| {
            let x = 144.0 + id as f64 * 0.01;
            let y = -37.0;
            let d = 0.005;
            let mut properties = Map::new();
            properties.insert("ogc_fid".to_string(), json!(id));
            properties.insert("name".to_string(), json!(format!("Parcel {}", id)));
            Feature::new(
                id as i64,
                Some(json!({
                    "type": "Polygon",
                    "coordinates": [[[x, y], [x + d, y], [x + d, y + d], [x, y + d], [x, y]]]
                })),
                properties,
            )
        })
        .collect()
}

fn collect_points(value: &Value, out: &mut Vec<(f64, f64)>) {
    if let Some(items) = value.as_array() {
        match items.as_slice() {
            [Value::Number(x), Value::Number(y), ..] => {
                out.push((x.as_f64().unwrap_or_default(), y.as_f64().unwrap_or_default()))
            }
            _ => items.iter().for_each(|item| collect_points(item, out)),
        }
    }
}

fn geometry_bbox(geometry: &Value) -> Option<BBox> {
    let mut points = Vec::new();
    collect_points(&geometry["coordinates"], &mut points);
    points
        .into_iter()
        .filter_map(|(x, y)| BBox::new(x, y, x, y))
        .reduce(|a, b| a.union(&b))
}

/// A competing write that lands right after the next `table_exists` call
#[derive(Debug, Clone)]
pub(crate) enum Interleave {
    Deactivate(String),
    Remove(String),
}

/// Tables and records kept in memory; table names sort for stable asserts
#[derive(Default)]
pub(crate) struct MemoryStore {
    tables: Mutex<BTreeMap<String, Vec<Feature>>>,
    records: Mutex<HashMap<String, DatasetRecord>>,
    down: AtomicBool,
    interleave: Mutex<Option<Interleave>>,
}

impl MemoryStore {
    pub(crate) fn create_table(&self, table: &QualifiedTable, features: Vec<Feature>) {
        self.tables.lock().insert(table.to_string(), features);
    }

    pub(crate) fn table_names(&self) -> Vec<String> {
        self.tables.lock().keys().cloned().collect()
    }

    pub(crate) fn drop_table_manually(&self, name: &str) {
        self.tables.lock().remove(name);
    }

    pub(crate) fn record(&self, dataset_id: &str) -> Option<DatasetRecord> {
        self.records.lock().get(dataset_id).cloned()
    }

    pub(crate) fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub(crate) fn interleave_after_table_check(&self, write: Interleave) {
        *self.interleave.lock() = Some(write);
    }

    fn apply_interleave(&self) {
        let Some(write) = self.interleave.lock().take() else {
            return;
        };
        let (dataset_id, remove) = match write {
            Interleave::Deactivate(id) => (id, false),
            Interleave::Remove(id) => (id, true),
        };

        let record = self.records.lock().remove(&dataset_id);
        let Some(record) = record else {
            return;
        };
        if let Ok(Some(table)) = record.table() {
            self.tables.lock().remove(&table.to_string());
        }
        if !remove {
            self.records.lock().insert(dataset_id, record.cleared());
        }
    }

    fn missing(table: &QualifiedTable) -> StoreError {
        StoreError::InvalidRecord(format!("relation {} does not exist", table))
    }
}

#[async_trait]
impl VectorStore for MemoryStore {
    async fn dataset(&self, dataset_id: &str) -> Result<Option<DatasetRecord>, StoreError> {
        Ok(self.record(dataset_id))
    }

    async fn table_exists(&self, table: &QualifiedTable) -> Result<bool, StoreError> {
        let exists = self.tables.lock().contains_key(&table.to_string());
        self.apply_interleave();
        Ok(exists)
    }

    async fn drop_table(&self, table: &QualifiedTable) -> Result<(), StoreError> {
        self.tables.lock().remove(&table.to_string());
        Ok(())
    }

    async fn build_index(&self, table: &QualifiedTable) -> Result<TableStats, StoreError> {
        let tables = self.tables.lock();
        let rows = tables.get(&table.to_string()).ok_or_else(|| Self::missing(table))?;

        let bbox = rows
            .iter()
            .filter_map(|f| geometry_bbox(&f.geometry))
            .reduce(|a, b| a.union(&b));

        let mut types: HashMap<String, usize> = HashMap::new();
        for feature in rows {
            if let Some(kind) = feature.geometry["type"].as_str() {
                *types.entry(kind.to_uppercase()).or_default() += 1;
            }
        }
        let geom_type = types
            .into_iter()
            .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
            .map(|(kind, _)| kind);

        Ok(TableStats {
            bbox,
            geom_type,
            feature_count: rows.len() as u64,
        })
    }

    async fn promote(
        &self,
        dataset_id: &str,
        staging: &QualifiedTable,
        target: &QualifiedTable,
        stats: &TableStats,
    ) -> Result<DatasetRecord, StoreError> {
        let mut tables = self.tables.lock();
        let rows = tables
            .remove(&staging.to_string())
            .ok_or_else(|| Self::missing(staging))?;
        tables.insert(target.to_string(), rows);

        let record = DatasetRecord::persisted(dataset_id, target, stats);
        self.records
            .lock()
            .insert(dataset_id.to_string(), record.clone());
        Ok(record)
    }

    async fn deactivate(&self, dataset_id: &str, table: &QualifiedTable) -> Result<(), StoreError> {
        self.tables.lock().remove(&table.to_string());
        let mut records = self.records.lock();
        if let Some(record) = records.remove(dataset_id) {
            records.insert(dataset_id.to_string(), record.cleared());
        }
        Ok(())
    }

    async fn remove(&self, dataset_id: &str, table: &QualifiedTable) -> Result<(), StoreError> {
        self.tables.lock().remove(&table.to_string());
        self.records.lock().remove(dataset_id);
        Ok(())
    }

    async fn features(
        &self,
        table: &QualifiedTable,
        bbox: Option<BBox>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Feature>, StoreError> {
        let tables = self.tables.lock();
        let rows = tables.get(&table.to_string()).ok_or_else(|| Self::missing(table))?;
        Ok(rows
            .iter()
            .filter(|f| match &bbox {
                Some(filter) => geometry_bbox(&f.geometry)
                    .map(|b| b.intersects(filter))
                    .unwrap_or(false),
                None => true,
            })
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::InvalidRecord("connection refused".to_string()));
        }
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct MemoryArchives {
    archives: Mutex<HashMap<String, Bytes>>,
}

impl MemoryArchives {
    pub(crate) fn contains(&self, dataset_id: &str) -> bool {
        self.archives.lock().contains_key(dataset_id)
    }

    pub(crate) fn forget(&self, dataset_id: &str) {
        self.archives.lock().remove(dataset_id);
    }
}

#[async_trait]
impl ArchiveSource for MemoryArchives {
    async fn put(&self, dataset_id: &str, bytes: Bytes) -> Result<(), StoreError> {
        self.archives.lock().insert(dataset_id.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, dataset_id: &str) -> Result<Option<Bytes>, StoreError> {
        Ok(self.archives.lock().get(dataset_id).cloned())
    }

    async fn remove(&self, dataset_id: &str) -> Result<(), StoreError> {
        self.forget(dataset_id);
        Ok(())
    }
}

/// Converter that writes generated parcels straight into a [`MemoryStore`]
pub(crate) struct FakeConverter {
    store: Arc<MemoryStore>,
    features: u64,
    reported: Mutex<Option<u64>>,
    fail_next: Mutex<Option<String>>,
    loads: AtomicUsize,
    counts: AtomicUsize,
    gated: AtomicBool,
    gate: Semaphore,
    entered: Semaphore,
}

impl FakeConverter {
    pub(crate) fn new(store: Arc<MemoryStore>, features: u64) -> Self {
        Self {
            store,
            features,
            reported: Mutex::new(None),
            fail_next: Mutex::new(None),
            loads: AtomicUsize::new(0),
            counts: AtomicUsize::new(0),
            gated: AtomicBool::new(false),
            gate: Semaphore::new(0),
            entered: Semaphore::new(0),
        }
    }

    pub(crate) fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub(crate) fn counts(&self) -> usize {
        self.counts.load(Ordering::SeqCst)
    }

    /// Report a different count from introspection than the load produces
    pub(crate) fn report_count(&self, count: u64) {
        *self.reported.lock() = Some(count);
    }

    pub(crate) fn fail_next_load(&self, message: &str) {
        *self.fail_next.lock() = Some(message.to_string());
    }

    /// Hold loads after the staging table is written until released
    pub(crate) fn hold_loads(&self) {
        self.gated.store(true, Ordering::SeqCst);
    }

    /// Let one held load finish
    pub(crate) fn release(&self) {
        self.gate.add_permits(1);
    }

    /// Wait for one load to write its staging table
    pub(crate) async fn wait_entered(&self) {
        self.entered.acquire().await.unwrap().forget();
    }
}

#[async_trait]
impl GeoConverter for FakeConverter {
    async fn count_features(&self, _shp: &Path) -> Result<u64, IngestError> {
        self.counts.fetch_add(1, Ordering::SeqCst);
        Ok(self.reported.lock().unwrap_or(self.features))
    }

    async fn load_and_reproject(
        &self,
        _shp: &Path,
        target: &QualifiedTable,
        _source_epsg: u32,
    ) -> Result<(), IngestError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.fail_next.lock().take() {
            return Err(IngestError::LoadFailed(message));
        }

        self.store.create_table(target, parcels(self.features));
        self.entered.add_permits(1);
        if self.gated.load(Ordering::SeqCst) {
            self.gate.acquire().await.unwrap().forget();
        }
        Ok(())
    }
}

/// A pipeline wired to in-memory doubles
pub(crate) struct Harness {
    pub pipeline: Arc<IngestionPipeline>,
    pub store: Arc<MemoryStore>,
    pub converter: Arc<FakeConverter>,
    pub archives: Arc<MemoryArchives>,
}

impl Harness {
    pub(crate) fn new(features: u64) -> Self {
        Self::with_config(features, |_| {})
    }

    pub(crate) fn with_config(features: u64, adjust: impl FnOnce(&mut IngestConfig)) -> Self {
        let mut config = IngestConfig {
            enabled: true,
            ..IngestConfig::default()
        };
        adjust(&mut config);

        let store = Arc::new(MemoryStore::default());
        let converter = Arc::new(FakeConverter::new(store.clone(), features));
        let archives = Arc::new(MemoryArchives::default());
        let pipeline = Arc::new(IngestionPipeline::new(
            config,
            converter.clone(),
            store.clone(),
            archives.clone(),
        ));

        Self {
            pipeline,
            store,
            converter,
            archives,
        }
    }

    pub(crate) fn gated(self) -> Self {
        self.converter.hold_loads();
        self
    }
}
