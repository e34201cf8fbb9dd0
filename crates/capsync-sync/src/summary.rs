use std::fmt;

use capsync_core::{EntityCounts, PipelineStage, SyncError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::pipeline::{RecordOutcome, RecordResult, RecordSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Directory,
    Metadata,
    Listings,
}

impl SyncPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Directory => "directory",
            Self::Metadata => "metadata",
            Self::Listings => "listings",
        }
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `retried` counts units that needed at least one retry, whatever their
/// final outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct UnitCounts {
    pub succeeded: usize,
    pub retried: usize,
    pub abandoned: usize,
}

impl UnitCounts {
    fn tally(&mut self, succeeded: bool, retried: bool) {
        if succeeded {
            self.succeeded += 1;
        } else {
            self.abandoned += 1;
        }
        if retried {
            self.retried += 1;
        }
    }
}

/// Requests are pages or id batches; records are per-entry pipelines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PhaseSummary {
    pub skipped: bool,
    pub requests: UnitCounts,
    pub records: UnitCounts,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AbandonedUnit {
    pub phase: SyncPhase,
    /// `page 3`, `batch 2` or `cap_id 1027`.
    pub unit: String,
    /// The page or batch the unit came from; `None` for a lost record task.
    pub source: Option<RecordSource>,
    pub cap_id: Option<i64>,
    pub stage: Option<PipelineStage>,
    pub error_kind: &'static str,
    pub error: String,
    pub attempts: usize,
    pub exhausted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub feed: &'static str,
    pub store: &'static str,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub directory: PhaseSummary,
    pub metadata: PhaseSummary,
    pub listings: PhaseSummary,
    pub abandoned: Vec<AbandonedUnit>,
    pub entities: EntityCounts,
}

impl SyncRunSummary {
    pub fn phase(&self, phase: SyncPhase) -> &PhaseSummary {
        match phase {
            SyncPhase::Directory => &self.directory,
            SyncPhase::Metadata => &self.metadata,
            SyncPhase::Listings => &self.listings,
        }
    }

    pub fn records_succeeded(&self) -> usize {
        [&self.directory, &self.metadata, &self.listings]
            .iter()
            .map(|phase| phase.records.succeeded)
            .sum()
    }

    pub fn units_abandoned(&self) -> usize {
        self.abandoned.len()
    }
}

/// Per-phase bookkeeping. Owned by the task collecting outcomes, so no
/// locking is involved.
#[derive(Debug)]
pub(crate) struct PhaseLedger {
    phase: SyncPhase,
    summary: PhaseSummary,
    abandoned: Vec<AbandonedUnit>,
}

impl PhaseLedger {
    pub(crate) fn new(phase: SyncPhase) -> Self {
        Self {
            phase,
            summary: PhaseSummary::default(),
            abandoned: Vec::new(),
        }
    }

    pub(crate) fn skipped(phase: SyncPhase) -> Self {
        let mut ledger = Self::new(phase);
        ledger.summary.skipped = true;
        ledger
    }

    pub(crate) fn request_done(&mut self, attempts: usize) {
        self.summary.requests.tally(true, attempts > 1);
    }

    pub(crate) fn request_abandoned(
        &mut self,
        source: RecordSource,
        error: &SyncError,
        attempts: usize,
        exhausted: bool,
    ) {
        self.summary.requests.tally(false, attempts > 1);
        self.push(source.to_string(), Some(source), None, None, error, attempts, exhausted);
    }

    /// A record that never got a pipeline, e.g. an id missing from a
    /// metadata response.
    pub(crate) fn record_dropped(
        &mut self,
        cap_id: i64,
        source: RecordSource,
        stage: PipelineStage,
        error: &SyncError,
    ) {
        self.summary.records.tally(false, false);
        self.push(format!("cap_id {cap_id}"), Some(source), Some(cap_id), Some(stage), error, 0, false);
    }

    pub(crate) fn record(&mut self, outcome: RecordOutcome) {
        match outcome.result {
            RecordResult::Completed(_) => self.summary.records.tally(true, outcome.retried),
            RecordResult::Abandoned {
                stage,
                error,
                attempts,
                exhausted,
            } => {
                self.summary.records.tally(false, outcome.retried);
                let unit = match outcome.cap_id {
                    Some(cap_id) => format!("cap_id {cap_id}"),
                    None => "record without id".to_string(),
                };
                self.push(
                    unit,
                    Some(outcome.source),
                    outcome.cap_id,
                    Some(stage),
                    &error,
                    attempts,
                    exhausted,
                );
            }
        }
    }

    /// A record task that panicked or was cancelled.
    pub(crate) fn record_lost(&mut self, reason: String) {
        self.summary.records.tally(false, false);
        self.abandoned.push(AbandonedUnit {
            phase: self.phase,
            unit: "record task".to_string(),
            source: None,
            cap_id: None,
            stage: None,
            error_kind: "task",
            error: reason,
            attempts: 0,
            exhausted: false,
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn push(
        &mut self,
        unit: String,
        source: Option<RecordSource>,
        cap_id: Option<i64>,
        stage: Option<PipelineStage>,
        error: &SyncError,
        attempts: usize,
        exhausted: bool,
    ) {
        self.abandoned.push(AbandonedUnit {
            phase: self.phase,
            unit,
            source,
            cap_id,
            stage,
            error_kind: error.kind(),
            error: error.to_string(),
            attempts,
            exhausted,
        });
    }

    pub(crate) fn finish(self) -> (PhaseSummary, Vec<AbandonedUnit>) {
        (self.summary, self.abandoned)
    }
}
