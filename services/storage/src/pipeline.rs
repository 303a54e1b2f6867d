//! Ingestion pipeline.
//!
//! Drives [`PipelineState`] through validation, CRS resolution, the
//! feature precheck, the GDAL load, indexing and promotion. Each run loads
//! into a staging table and only replaces the live table inside the
//! promotion transaction, so a failed, cancelled or timed out run leaves
//! the previously persisted dataset untouched.
//!
//! Runs execute on their own task: a caller that stops waiting does not
//! abort a run halfway. Deactivation and deletion cancel the active run
//! for the dataset and wait for it to clean up before mutating anything.

use crate::archive_store::ArchiveSource;
use crate::error::{VectorError, VectorResult};
use crate::locks::{DatasetSlots, SlotGuard};
use crate::metadata_store::{DatasetRecord, VectorStore};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;
use vector_ingest::{
    ArchiveValidator, CrsResolver, Effect, ExtractedShapefile, FeaturePrechecker, GeoConverter,
    IngestConfig, IngestError, PipelineEvent, PipelineState, QualifiedTable, SourceArchive,
};

/// Why a run was started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    /// Explicit activation; the archive is retained on success
    Activate,
    /// Upload or activation of the retained archive
    Reprocess,
    /// A query found the live table missing
    Heal,
}

/// Mutable data carried through a single run
struct RunContext {
    target: QualifiedTable,
    staging: QualifiedTable,
    extracted: Option<ExtractedShapefile>,
    record: Option<DatasetRecord>,
}

impl RunContext {
    fn extracted(&self) -> VectorResult<&ExtractedShapefile> {
        self.extracted
            .as_ref()
            .ok_or_else(|| VectorError::Internal("archive was not extracted".to_string()))
    }
}

/// Activate, deactivate and reprocess datasets
pub struct IngestionPipeline {
    config: IngestConfig,
    validator: ArchiveValidator,
    resolver: CrsResolver,
    prechecker: FeaturePrechecker,
    converter: Arc<dyn GeoConverter>,
    store: Arc<dyn VectorStore>,
    archives: Arc<dyn ArchiveSource>,
    slots: DatasetSlots,
}

impl IngestionPipeline {
    pub fn new(
        config: IngestConfig,
        converter: Arc<dyn GeoConverter>,
        store: Arc<dyn VectorStore>,
        archives: Arc<dyn ArchiveSource>,
    ) -> Self {
        Self {
            validator: ArchiveValidator::new(&config),
            resolver: CrsResolver::new(),
            prechecker: FeaturePrechecker::new(config.max_features),
            config,
            converter,
            store,
            archives,
            slots: DatasetSlots::new(),
        }
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Deterministic live table for a dataset
    pub fn table_for(&self, dataset_id: &str) -> VectorResult<QualifiedTable> {
        Ok(QualifiedTable::for_dataset(
            &self.config.schema,
            &self.config.table_prefix,
            dataset_id,
        )?)
    }

    /// Process an archive and make the dataset queryable.
    ///
    /// Rejected with `AlreadyProcessing` while another run for the same
    /// dataset is active. On success the archive is retained for
    /// reprocessing.
    pub async fn activate(self: &Arc<Self>, archive: SourceArchive) -> VectorResult<DatasetRecord> {
        self.start(archive, Trigger::Activate).await
    }

    /// Store an uploaded archive. It is processed at once when
    /// auto-processing is on or the dataset is already active.
    pub async fn upload(self: &Arc<Self>, archive: SourceArchive) -> VectorResult<Option<DatasetRecord>> {
        if !self.config.enabled {
            return Err(VectorError::Disabled);
        }
        self.validator.check_size(&archive)?;
        self.archives
            .put(&archive.dataset_id, archive.bytes.clone())
            .await?;
        info!(dataset_id = %archive.dataset_id, size = archive.bytes.len(), "Archive uploaded");

        let active = self
            .store
            .dataset(&archive.dataset_id)
            .await?
            .map(|r| r.enabled)
            .unwrap_or(false);

        if self.config.auto_process || active {
            self.start(archive, Trigger::Reprocess).await.map(Some)
        } else {
            Ok(None)
        }
    }

    /// Process the retained archive of a dataset
    pub async fn activate_retained(self: &Arc<Self>, dataset_id: &str) -> VectorResult<DatasetRecord> {
        if !self.config.enabled {
            return Err(VectorError::Disabled);
        }
        let bytes = self
            .archives
            .get(dataset_id)
            .await?
            .ok_or_else(|| VectorError::SourceUnavailable(dataset_id.to_string()))?;
        self.start(SourceArchive::new(dataset_id, bytes), Trigger::Reprocess)
            .await
    }

    /// Drop the live table and clear the record, cancelling any active run
    pub async fn deactivate(&self, dataset_id: &str) -> VectorResult<()> {
        let guard = self.slots.interrupt(dataset_id).await;
        let result: VectorResult<()> = async {
            let record = self.store.dataset(dataset_id).await?;
            let table = self.recorded_table(dataset_id, record.as_ref())?;

            let state = PipelineState::from_record(
                record.as_ref().map(|r| r.enabled).unwrap_or(false),
                record.as_ref().and_then(DatasetRecord::stats),
            );
            match state.step(PipelineEvent::Deactivate)? {
                (_, Effect::DropTableAndClear) => {
                    self.store.deactivate(dataset_id, &table).await?;
                    self.store.drop_table(&table.staging()).await?;
                }
                (_, effect) => {
                    return Err(VectorError::Internal(format!(
                        "unexpected deactivation effect {:?}",
                        effect
                    )))
                }
            }

            info!(dataset_id, table = %table, "Dataset deactivated");
            Ok(())
        }
        .await;

        self.finish_exclusive(dataset_id, guard);
        result
    }

    /// Remove everything held for a deleted dataset
    pub async fn on_delete(&self, dataset_id: &str) -> VectorResult<()> {
        let guard = self.slots.interrupt(dataset_id).await;
        let result: VectorResult<()> = async {
            let record = self.store.dataset(dataset_id).await?;
            let table = self.recorded_table(dataset_id, record.as_ref())?;

            self.store.remove(dataset_id, &table).await?;
            self.store.drop_table(&table.staging()).await?;
            self.archives.remove(dataset_id).await?;

            info!(dataset_id, table = %table, "Dataset removed");
            Ok(())
        }
        .await;

        self.finish_exclusive(dataset_id, guard);
        result
    }

    /// Return the active record, reprocessing from the retained archive
    /// when the live table has gone missing.
    pub async fn ensure_ready(self: &Arc<Self>, dataset_id: &str) -> VectorResult<DatasetRecord> {
        let not_activated = || VectorError::NotActivated(dataset_id.to_string());

        let record = self
            .store
            .dataset(dataset_id)
            .await?
            .filter(|r| r.enabled)
            .ok_or_else(not_activated)?;
        let table = record.table()?.ok_or_else(not_activated)?;

        if self.store.table_exists(&table).await? {
            return Ok(record);
        }

        warn!(dataset_id, table = %table, "Active dataset has no table");

        // A run in progress is replacing the table
        if !self.config.enabled || self.slots.is_busy(dataset_id) {
            return Err(not_activated());
        }

        let bytes = self
            .archives
            .get(dataset_id)
            .await?
            .ok_or_else(|| VectorError::SourceUnavailable(dataset_id.to_string()))?;

        metrics::counter!("vector.pipeline.reprocessed").increment(1);
        info!(dataset_id, "Reprocessing dataset from retained archive");

        match self
            .start(SourceArchive::new(dataset_id, bytes), Trigger::Heal)
            .await
        {
            Err(VectorError::AlreadyProcessing(_)) => Err(not_activated()),
            other => other,
        }
    }

    fn recorded_table(
        &self,
        dataset_id: &str,
        record: Option<&DatasetRecord>,
    ) -> VectorResult<QualifiedTable> {
        match record.map(DatasetRecord::table).transpose()?.flatten() {
            Some(table) => Ok(table),
            None => self.table_for(dataset_id),
        }
    }

    fn finish_exclusive(&self, dataset_id: &str, guard: SlotGuard) {
        drop(guard);
        self.slots.release(dataset_id);
    }

    /// Re-read the record while holding the slot. A deactivate or delete
    /// may have committed after the drift was observed. `Some` means the
    /// table is back and no run is needed.
    async fn recheck_drift(&self, dataset_id: &str) -> VectorResult<Option<DatasetRecord>> {
        let not_activated = || VectorError::NotActivated(dataset_id.to_string());

        let record = self
            .store
            .dataset(dataset_id)
            .await?
            .filter(|r| r.enabled)
            .ok_or_else(not_activated)?;
        let table = record.table()?.ok_or_else(not_activated)?;

        if self.store.table_exists(&table).await? {
            Ok(Some(record))
        } else {
            Ok(None)
        }
    }

    async fn start(self: &Arc<Self>, archive: SourceArchive, trigger: Trigger) -> VectorResult<DatasetRecord> {
        if !self.config.enabled {
            return Err(VectorError::Disabled);
        }

        let dataset_id = archive.dataset_id.clone();
        let guard = self
            .slots
            .try_acquire(&dataset_id)
            .ok_or_else(|| VectorError::AlreadyProcessing(dataset_id.clone()))?;

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let result = match trigger {
                Trigger::Heal => match this.recheck_drift(&archive.dataset_id).await {
                    Ok(Some(record)) => Ok(record),
                    Ok(None) => this.run(&archive, guard.token()).await,
                    Err(e) => {
                        debug!(dataset_id = %archive.dataset_id, error = %e, "Dataset changed before reprocessing");
                        Err(e)
                    }
                },
                Trigger::Activate | Trigger::Reprocess => this.run(&archive, guard.token()).await,
            };

            if trigger == Trigger::Activate && result.is_ok() {
                if let Err(e) = this
                    .archives
                    .put(&archive.dataset_id, archive.bytes.clone())
                    .await
                {
                    warn!(dataset_id = %archive.dataset_id, error = %e, "Failed to retain archive");
                }
            }

            this.finish_exclusive(&archive.dataset_id, guard);
            result
        });

        handle
            .await
            .map_err(|e| VectorError::Internal(format!("pipeline task failed: {}", e)))?
    }

    async fn run(&self, archive: &SourceArchive, cancel: &CancellationToken) -> VectorResult<DatasetRecord> {
        let run_id = Uuid::new_v4();
        let span = info_span!("pipeline_run", %run_id, dataset_id = %archive.dataset_id);
        self.drive(archive, cancel).instrument(span).await
    }

    async fn drive(&self, archive: &SourceArchive, cancel: &CancellationToken) -> VectorResult<DatasetRecord> {
        let started = Instant::now();
        metrics::counter!("vector.pipeline.runs").increment(1);

        let target = self.table_for(&archive.dataset_id)?;
        let mut ctx = RunContext {
            staging: target.staging(),
            target,
            extracted: None,
            record: None,
        };

        let mut failure: Option<VectorError> = None;
        let (mut state, mut effect) = PipelineState::Idle.step(PipelineEvent::Start)?;

        loop {
            debug!(state = state.name(), ?effect, "Pipeline step");

            let event = match effect {
                Effect::Finish | Effect::Abort => break,
                Effect::DropStaging => {
                    if let Err(e) = self.store.drop_table(&ctx.staging).await {
                        warn!(table = %ctx.staging, error = %e, "Failed to drop staging table");
                    }
                    break;
                }
                effect => match self.perform(effect, archive, &mut ctx, cancel).await {
                    Ok(event) => event,
                    Err(e) => {
                        let kind = e.code();
                        failure = Some(e);
                        PipelineEvent::Failed(kind)
                    }
                },
            };

            (state, effect) = state.step(event)?;
        }

        // Extraction directory is removed here on every path
        ctx.extracted = None;

        metrics::histogram!("vector.pipeline.duration_seconds")
            .record(started.elapsed().as_secs_f64());

        if let Some(err) = failure {
            metrics::counter!("vector.pipeline.failures", "kind" => err.code()).increment(1);
            let stage = match &state {
                PipelineState::Failed { stage, .. } => stage.as_str(),
                other => other.name(),
            };
            if err.is_infrastructure() {
                error!(stage, kind = err.code(), error = %err, "Pipeline run failed");
            } else {
                warn!(stage, kind = err.code(), error = %err, "Pipeline run rejected");
            }
            return Err(err);
        }

        let record = ctx
            .record
            .ok_or_else(|| VectorError::Internal(format!("run ended in state {}", state.name())))?;

        info!(
            table = ?record.vector_table,
            feature_count = ?record.feature_count,
            geom_type = ?record.geom_type,
            elapsed_ms = started.elapsed().as_millis(),
            "Dataset persisted"
        );
        Ok(record)
    }

    async fn perform(
        &self,
        effect: Effect,
        archive: &SourceArchive,
        ctx: &mut RunContext,
        cancel: &CancellationToken,
    ) -> VectorResult<PipelineEvent> {
        if cancel.is_cancelled() {
            return Err(IngestError::Cancelled.into());
        }

        match effect {
            Effect::ValidateArchive => {
                let validator = self.validator.clone();
                let archive = archive.clone();
                let extracted = tokio::task::spawn_blocking(move || validator.validate(&archive))
                    .await
                    .map_err(|e| VectorError::Internal(format!("validation task failed: {}", e)))??;

                debug!(
                    members = extracted.manifest().members.len(),
                    uncompressed = extracted.manifest().total_uncompressed,
                    "Archive validated"
                );
                ctx.extracted = Some(extracted);
                Ok(PipelineEvent::Validated)
            }
            Effect::ResolveCrs => {
                let prj = ctx.extracted()?.read_projection().map_err(IngestError::from)?;
                let crs = self.resolver.resolve(&prj);
                match crs.epsg {
                    Some(epsg) if crs.resolved => {
                        debug!(crs = %crs.code(), "Resolved source CRS");
                        Ok(PipelineEvent::CrsResolved { epsg })
                    }
                    _ => Err(IngestError::UnknownCrs.into()),
                }
            }
            Effect::CountFeatures => {
                let shp = ctx.extracted()?.components().shp.clone();
                let count = self.prechecker.check(self.converter.as_ref(), &shp).await?;
                Ok(PipelineEvent::Counted { count })
            }
            Effect::Load { epsg } => {
                let shp = ctx.extracted()?.components().shp.clone();
                let timeout = self.config.load_timeout();
                let load = self.converter.load_and_reproject(&shp, &ctx.staging, epsg);

                tokio::select! {
                    _ = cancel.cancelled() => Err(IngestError::Cancelled.into()),
                    result = tokio::time::timeout(timeout, load) => match result {
                        Ok(loaded) => {
                            loaded?;
                            Ok(PipelineEvent::Loaded)
                        }
                        Err(_) => Err(IngestError::LoadTimeout(timeout).into()),
                    },
                }
            }
            Effect::BuildIndex => {
                let stats = self.store.build_index(&ctx.staging).await?;
                self.prechecker.enforce(stats.feature_count)?;
                Ok(PipelineEvent::Indexed(stats))
            }
            Effect::Persist(stats) => {
                let record = self
                    .store
                    .promote(&archive.dataset_id, &ctx.staging, &ctx.target, &stats)
                    .await?;
                ctx.record = Some(record);
                Ok(PipelineEvent::Persisted)
            }
            other => Err(VectorError::Internal(format!(
                "unexpected pipeline effect {:?}",
                other
            ))),
        }
    }
}
