//! Ingestion state machine.
//!
//! States carry only the data relevant to them. [`PipelineState::step`]
//! takes an event and returns the next state plus the single side effect
//! the driver must perform next. No I/O happens here, so every transition
//! is testable in memory.

use crate::table::TableStats;
use serde::Serialize;
use thiserror::Error;

/// Stage a run was in when it failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Validating,
    ResolvingCrs,
    Prechecking,
    Loading,
    Indexing,
    Persisting,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Validating => "validating",
            Stage::ResolvingCrs => "resolving_crs",
            Stage::Prechecking => "prechecking",
            Stage::Loading => "loading",
            Stage::Indexing => "indexing",
            Stage::Persisting => "persisting",
        }
    }

    /// Whether a staging table may exist when failing in this stage
    pub fn touches_database(&self) -> bool {
        matches!(self, Stage::Loading | Stage::Indexing | Stage::Persisting)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineState {
    Idle,
    Validating,
    ResolvingCrs,
    Prechecking {
        epsg: u32,
    },
    Loading {
        epsg: u32,
        precheck_count: u64,
    },
    /// `stats` is set once the index is built and the record is being written
    Indexing {
        stats: Option<TableStats>,
    },
    Persisted {
        stats: TableStats,
    },
    Failed {
        stage: Stage,
        kind: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    Start,
    Validated,
    CrsResolved { epsg: u32 },
    Counted { count: u64 },
    Loaded,
    Indexed(TableStats),
    Persisted,
    /// A stage failed with the given error kind
    Failed(&'static str),
    Deactivate,
}

/// Side effect requested by a transition
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    ValidateArchive,
    ResolveCrs,
    CountFeatures,
    Load { epsg: u32 },
    BuildIndex,
    Persist(TableStats),
    /// Run completed; nothing left to do
    Finish,
    /// Drop the staging table, keeping any prior persisted state
    DropStaging,
    /// Stop without touching the database
    Abort,
    /// Drop the live table and clear the record's derived fields
    DropTableAndClear,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid pipeline transition: {event} in state {state}")]
pub struct InvalidTransition {
    pub state: &'static str,
    pub event: &'static str,
}

impl PipelineState {
    /// Starting state for a dataset given its recorded activation
    pub fn from_record(active: bool, stats: Option<TableStats>) -> Self {
        match (active, stats) {
            (true, Some(stats)) => PipelineState::Persisted { stats },
            _ => PipelineState::Idle,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PipelineState::Idle => "idle",
            PipelineState::Validating => "validating",
            PipelineState::ResolvingCrs => "resolving_crs",
            PipelineState::Prechecking { .. } => "prechecking",
            PipelineState::Loading { .. } => "loading",
            PipelineState::Indexing { .. } => "indexing",
            PipelineState::Persisted { .. } => "persisted",
            PipelineState::Failed { .. } => "failed",
        }
    }

    /// Stage a failure in this state is attributed to
    fn stage(&self) -> Option<Stage> {
        match self {
            PipelineState::Validating => Some(Stage::Validating),
            PipelineState::ResolvingCrs => Some(Stage::ResolvingCrs),
            PipelineState::Prechecking { .. } => Some(Stage::Prechecking),
            PipelineState::Loading { .. } => Some(Stage::Loading),
            PipelineState::Indexing { stats: None } => Some(Stage::Indexing),
            PipelineState::Indexing { stats: Some(_) } => Some(Stage::Persisting),
            _ => None,
        }
    }

    /// Queries are only served from this state
    pub fn is_queryable(&self) -> bool {
        matches!(self, PipelineState::Persisted { .. })
    }

    pub fn is_running(&self) -> bool {
        self.stage().is_some()
    }

    /// Apply an event, returning the next state and the effect to perform
    pub fn step(self, event: PipelineEvent) -> Result<(PipelineState, Effect), InvalidTransition> {
        use PipelineEvent as E;
        use PipelineState as S;

        let next = match (self, event) {
            (S::Idle | S::Persisted { .. } | S::Failed { .. }, E::Start) => {
                (S::Validating, Effect::ValidateArchive)
            }
            (S::Validating, E::Validated) => (S::ResolvingCrs, Effect::ResolveCrs),
            (S::ResolvingCrs, E::CrsResolved { epsg }) => {
                (S::Prechecking { epsg }, Effect::CountFeatures)
            }
            (S::Prechecking { epsg }, E::Counted { count }) => (
                S::Loading {
                    epsg,
                    precheck_count: count,
                },
                Effect::Load { epsg },
            ),
            (S::Loading { .. }, E::Loaded) => (S::Indexing { stats: None }, Effect::BuildIndex),
            (S::Indexing { stats: None }, E::Indexed(stats)) => (
                S::Indexing {
                    stats: Some(stats.clone()),
                },
                Effect::Persist(stats),
            ),
            (S::Indexing { stats: Some(stats) }, E::Persisted) => {
                (S::Persisted { stats }, Effect::Finish)
            }
            (S::Idle | S::Persisted { .. } | S::Failed { .. }, E::Deactivate) => {
                (S::Idle, Effect::DropTableAndClear)
            }
            (state, E::Failed(kind)) if state.is_running() => {
                let stage = state.stage().unwrap_or(Stage::Validating);
                let effect = if stage.touches_database() {
                    Effect::DropStaging
                } else {
                    Effect::Abort
                };
                (S::Failed { stage, kind }, effect)
            }
            (state, event) => {
                return Err(InvalidTransition {
                    state: state.name(),
                    event: event_name(&event),
                })
            }
        };

        Ok(next)
    }
}

fn event_name(event: &PipelineEvent) -> &'static str {
    match event {
        PipelineEvent::Start => "start",
        PipelineEvent::Validated => "validated",
        PipelineEvent::CrsResolved { .. } => "crs_resolved",
        PipelineEvent::Counted { .. } => "counted",
        PipelineEvent::Loaded => "loaded",
        PipelineEvent::Indexed(_) => "indexed",
        PipelineEvent::Persisted => "persisted",
        PipelineEvent::Failed(_) => "failed",
        PipelineEvent::Deactivate => "deactivate",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::BBox;

    fn stats() -> TableStats {
        TableStats {
            bbox: BBox::new(144.9, -37.85, 145.0, -37.8),
            geom_type: Some("POLYGON".to_string()),
            feature_count: 120,
        }
    }

    fn run_to_persisted() -> PipelineState {
        let events = [
            PipelineEvent::Start,
            PipelineEvent::Validated,
            PipelineEvent::CrsResolved { epsg: 4326 },
            PipelineEvent::Counted { count: 120 },
            PipelineEvent::Loaded,
            PipelineEvent::Indexed(stats()),
            PipelineEvent::Persisted,
        ];
        let mut state = PipelineState::Idle;
        for event in events {
            state = state.step(event).unwrap().0;
        }
        state
    }

    #[test]
    fn test_happy_path_effects() {
        let (state, effect) = PipelineState::Idle.step(PipelineEvent::Start).unwrap();
        assert_eq!(effect, Effect::ValidateArchive);
        let (state, effect) = state.step(PipelineEvent::Validated).unwrap();
        assert_eq!(effect, Effect::ResolveCrs);
        let (state, effect) = state
            .step(PipelineEvent::CrsResolved { epsg: 28355 })
            .unwrap();
        assert_eq!(effect, Effect::CountFeatures);
        let (state, effect) = state.step(PipelineEvent::Counted { count: 7 }).unwrap();
        assert_eq!(effect, Effect::Load { epsg: 28355 });
        assert_eq!(
            state,
            PipelineState::Loading {
                epsg: 28355,
                precheck_count: 7
            }
        );
        let (state, effect) = state.step(PipelineEvent::Loaded).unwrap();
        assert_eq!(effect, Effect::BuildIndex);
        let (state, effect) = state.step(PipelineEvent::Indexed(stats())).unwrap();
        assert_eq!(effect, Effect::Persist(stats()));
        assert!(!state.is_queryable());
        let (state, effect) = state.step(PipelineEvent::Persisted).unwrap();
        assert_eq!(effect, Effect::Finish);
        assert!(state.is_queryable());
    }

    #[test]
    fn test_validation_failures_abort_without_database_work() {
        let state = PipelineState::Validating;
        let (state, effect) = state.step(PipelineEvent::Failed("path_traversal")).unwrap();
        assert_eq!(effect, Effect::Abort);
        assert_eq!(
            state,
            PipelineState::Failed {
                stage: Stage::Validating,
                kind: "path_traversal"
            }
        );

        let (_, effect) = PipelineState::ResolvingCrs
            .step(PipelineEvent::Failed("unknown_crs"))
            .unwrap();
        assert_eq!(effect, Effect::Abort);
    }

    #[test]
    fn test_load_and_index_failures_drop_staging() {
        let loading = PipelineState::Loading {
            epsg: 4326,
            precheck_count: 1,
        };
        let (state, effect) = loading.step(PipelineEvent::Failed("load_timeout")).unwrap();
        assert_eq!(effect, Effect::DropStaging);
        assert!(matches!(
            state,
            PipelineState::Failed {
                stage: Stage::Loading,
                ..
            }
        ));

        let persisting = PipelineState::Indexing {
            stats: Some(stats()),
        };
        let (state, effect) = persisting.step(PipelineEvent::Failed("database")).unwrap();
        assert_eq!(effect, Effect::DropStaging);
        assert!(matches!(
            state,
            PipelineState::Failed {
                stage: Stage::Persisting,
                ..
            }
        ));
    }

    #[test]
    fn test_unknown_crs_never_reaches_loading() {
        let (state, _) = PipelineState::Idle.step(PipelineEvent::Start).unwrap();
        let (state, _) = state.step(PipelineEvent::Validated).unwrap();
        let (state, _) = state.step(PipelineEvent::Failed("unknown_crs")).unwrap();
        assert!(state.step(PipelineEvent::Loaded).is_err());
    }

    #[test]
    fn test_reprocess_from_persisted() {
        let persisted = run_to_persisted();
        let (state, effect) = persisted.step(PipelineEvent::Start).unwrap();
        assert_eq!(state, PipelineState::Validating);
        assert_eq!(effect, Effect::ValidateArchive);
    }

    #[test]
    fn test_deactivate_is_direct() {
        let persisted = run_to_persisted();
        let (state, effect) = persisted.step(PipelineEvent::Deactivate).unwrap();
        assert_eq!(state, PipelineState::Idle);
        assert_eq!(effect, Effect::DropTableAndClear);
    }

    #[test]
    fn test_invalid_transitions() {
        let err = PipelineState::Idle.step(PipelineEvent::Loaded).unwrap_err();
        assert_eq!(
            err,
            InvalidTransition {
                state: "idle",
                event: "loaded"
            }
        );
        assert!(PipelineState::Loading {
            epsg: 4326,
            precheck_count: 0
        }
        .step(PipelineEvent::Deactivate)
        .is_err());
        assert!(PipelineState::Idle
            .step(PipelineEvent::Failed("x"))
            .is_err());
        assert!(run_to_persisted()
            .step(PipelineEvent::Failed("x"))
            .is_err());
    }

    #[test]
    fn test_from_record() {
        assert!(PipelineState::from_record(true, Some(stats())).is_queryable());
        assert_eq!(PipelineState::from_record(true, None), PipelineState::Idle);
        assert_eq!(
            PipelineState::from_record(false, Some(stats())),
            PipelineState::Idle
        );
    }
}
