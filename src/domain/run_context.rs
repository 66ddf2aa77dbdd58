//! Per-run state threaded through the sync pipeline
//!
//! `RunContext` is created when a run starts, handed to every step and turned
//! into a `RunSummary` at the end. Nothing about a run lives in globals.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::domain::errors::{MalformedItemError, RarityError};
use crate::domain::repositories::VerificationAggregate;

/// Pipeline steps, in execution order, plus the absorbing `Error` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineStage {
    Load,
    Aggregate,
    Score,
    WritePercentages,
    WriteRanks,
    Verify,
    Export,
    Done,
    Error,
}

impl PipelineStage {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Load => "LOAD",
            Self::Aggregate => "AGGREGATE",
            Self::Score => "SCORE",
            Self::WritePercentages => "WRITE_PERCENTAGES",
            Self::WriteRanks => "WRITE_RANKS",
            Self::Verify => "VERIFY",
            Self::Export => "EXPORT",
            Self::Done => "DONE",
            Self::Error => "ERROR",
        }
    }

    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Load => Some(Self::Aggregate),
            Self::Aggregate => Some(Self::Score),
            Self::Score => Some(Self::WritePercentages),
            Self::WritePercentages => Some(Self::WriteRanks),
            Self::WriteRanks => Some(Self::Verify),
            Self::Verify => Some(Self::Export),
            Self::Export => Some(Self::Done),
            Self::Done | Self::Error => None,
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }

    /// Linear progression only; `Error` is reachable from any live stage.
    pub fn can_transition_to(self, target: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        target == Self::Error || self.next() == Some(target)
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overall outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Success,
    PartialSuccess,
    Failed,
}

impl RunStatus {
    /// Process exit code for the CLI.
    pub const fn exit_code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::PartialSuccess => 2,
            Self::Failed => 1,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Success => "SUCCESS",
            Self::PartialSuccess => "PARTIAL_SUCCESS",
            Self::Failed => "FAILED",
        };
        f.write_str(text)
    }
}

/// Column a batch update writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateTarget {
    RarityRanking,
    RarityPercent,
}

impl UpdateTarget {
    pub const fn column(self) -> &'static str {
        match self {
            Self::RarityRanking => "rarity_ranking",
            Self::RarityPercent => "rarity_percent",
        }
    }
}

impl fmt::Display for UpdateTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

/// A batch whose transaction rolled back.
#[derive(Debug, Clone, Serialize)]
pub struct FailedBatch {
    pub index: usize,
    pub entries: usize,
    pub error: String,
}

/// Outcome of one `apply_*_updates` call.
#[derive(Debug, Clone, Serialize)]
pub struct UpdateReport {
    pub target: UpdateTarget,
    /// Entries handed to the engine, before key resolution.
    pub entries: usize,
    pub batches_planned: usize,
    pub batches_committed: usize,
    pub failed_batches: Vec<FailedBatch>,
    pub rows_updated: u64,
    pub unmatched_keys: Vec<String>,
    /// Whether this call flipped the collection flag.
    pub flag_set: bool,
    pub verification: Option<VerificationAggregate>,
    pub mismatches: Vec<String>,
}

impl UpdateReport {
    pub const fn new(target: UpdateTarget, entries: usize) -> Self {
        Self {
            target,
            entries,
            batches_planned: 0,
            batches_committed: 0,
            failed_batches: Vec::new(),
            rows_updated: 0,
            unmatched_keys: Vec::new(),
            flag_set: false,
            verification: None,
            mismatches: Vec::new(),
        }
    }

    pub fn is_partial(&self) -> bool {
        !self.failed_batches.is_empty()
    }

    pub fn failed_entries(&self) -> usize {
        self.failed_batches.iter().map(|b| b.entries).sum()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageRecord {
    pub stage: PipelineStage,
    pub entered_at: DateTime<Utc>,
}

/// Mutable state of one pipeline run.
#[derive(Debug)]
pub struct RunContext {
    pub run_id: Uuid,
    pub collection: String,
    pub strategy: String,
    stage: PipelineStage,
    history: Vec<StageRecord>,
    started_at: DateTime<Utc>,

    pub loaded: usize,
    pub accepted: usize,
    pub ranked: usize,
    pub malformed: Vec<MalformedItemError>,
    pub snapshot_digest: Option<String>,
    pub percentage_report: Option<UpdateReport>,
    pub rank_report: Option<UpdateReport>,
    pub report_paths: Vec<PathBuf>,
    pub warnings: Vec<String>,
    error: Option<String>,
}

impl RunContext {
    pub fn new(collection: impl Into<String>, strategy: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            collection: collection.into(),
            strategy: strategy.into(),
            stage: PipelineStage::Load,
            history: vec![StageRecord {
                stage: PipelineStage::Load,
                entered_at: now,
            }],
            started_at: now,
            loaded: 0,
            accepted: 0,
            ranked: 0,
            malformed: Vec::new(),
            snapshot_digest: None,
            percentage_report: None,
            rank_report: None,
            report_paths: Vec::new(),
            warnings: Vec::new(),
            error: None,
        }
    }

    pub const fn stage(&self) -> PipelineStage {
        self.stage
    }

    pub fn history(&self) -> &[StageRecord] {
        &self.history
    }

    /// Move to `target`. Illegal transitions are refused and logged.
    pub fn advance(&mut self, target: PipelineStage) -> bool {
        if !self.stage.can_transition_to(target) {
            warn!(from = %self.stage, to = %target, "Refusing illegal stage transition");
            return false;
        }
        self.stage = target;
        self.history.push(StageRecord {
            stage: target,
            entered_at: Utc::now(),
        });
        true
    }

    /// Absorb a fatal error; the stage it happened in stays visible in history.
    pub fn fail(&mut self, error: &RarityError) {
        self.error = Some(error.to_string());
        self.advance(PipelineStage::Error);
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!(collection = %self.collection, stage = %self.stage, "{}", message);
        self.warnings.push(message);
    }

    fn reports(&self) -> impl Iterator<Item = &UpdateReport> {
        self.percentage_report.iter().chain(self.rank_report.iter())
    }

    pub fn status(&self) -> RunStatus {
        if self.stage == PipelineStage::Error {
            RunStatus::Failed
        } else if self.reports().any(UpdateReport::is_partial) {
            RunStatus::PartialSuccess
        } else {
            RunStatus::Success
        }
    }

    pub fn into_summary(self) -> RunSummary {
        let finished_at = Utc::now();
        let counts = RunCounts {
            loaded: self.loaded,
            accepted: self.accepted,
            malformed: self.malformed.len(),
            ranked: self.ranked,
            rows_updated: self.reports().map(|r| r.rows_updated).sum(),
            unmatched_keys: self.reports().map(|r| r.unmatched_keys.len()).sum(),
            failed_batches: self.reports().map(|r| r.failed_batches.len()).sum(),
        };

        // the stage the run died in is the last one before ERROR
        let final_stage = if self.stage == PipelineStage::Error {
            self.history
                .iter()
                .rev()
                .map(|r| r.stage)
                .find(|s| *s != PipelineStage::Error)
                .unwrap_or(PipelineStage::Load)
        } else {
            self.stage
        };

        RunSummary {
            run_id: self.run_id,
            collection: self.collection.clone(),
            status: self.status(),
            final_stage,
            strategy: self.strategy.clone(),
            started_at: self.started_at,
            finished_at,
            duration_ms: (finished_at - self.started_at).num_milliseconds(),
            counts,
            snapshot_digest: self.snapshot_digest.clone(),
            malformed_items: self.malformed.iter().map(ToString::to_string).collect(),
            percentage_report: self.percentage_report.clone(),
            rank_report: self.rank_report.clone(),
            report_paths: self.report_paths.clone(),
            warnings: self.warnings.clone(),
            error: self.error.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunCounts {
    pub loaded: usize,
    pub accepted: usize,
    pub malformed: usize,
    pub ranked: usize,
    pub rows_updated: u64,
    pub unmatched_keys: usize,
    pub failed_batches: usize,
}

/// Final, serialisable account of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub collection: String,
    pub status: RunStatus,
    /// Last stage reached; for failed runs, the stage that failed.
    pub final_stage: PipelineStage,
    pub strategy: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub counts: RunCounts,
    pub snapshot_digest: Option<String>,
    pub malformed_items: Vec<String>,
    pub percentage_report: Option<UpdateReport>,
    pub rank_report: Option<UpdateReport>,
    pub report_paths: Vec<PathBuf>,
    pub warnings: Vec<String>,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(PipelineStage::Load, PipelineStage::Aggregate, true)]
    #[case(PipelineStage::WritePercentages, PipelineStage::WriteRanks, true)]
    #[case(PipelineStage::Export, PipelineStage::Done, true)]
    #[case(PipelineStage::Score, PipelineStage::Error, true)]
    #[case(PipelineStage::Load, PipelineStage::Score, false)]
    #[case(PipelineStage::WriteRanks, PipelineStage::WritePercentages, false)]
    #[case(PipelineStage::Done, PipelineStage::Error, false)]
    #[case(PipelineStage::Error, PipelineStage::Load, false)]
    fn transitions_are_linear(
        #[case] from: PipelineStage,
        #[case] to: PipelineStage,
        #[case] allowed: bool,
    ) {
        assert_eq!(from.can_transition_to(to), allowed);
    }

    #[test]
    fn walking_every_stage_ends_in_success() {
        let mut ctx = RunContext::new("doodles", "trait_sum");
        while let Some(next) = ctx.stage().next() {
            assert!(ctx.advance(next));
        }
        assert_eq!(ctx.stage(), PipelineStage::Done);
        assert_eq!(ctx.history().len(), 8);
        assert_eq!(ctx.status(), RunStatus::Success);
        assert!(!ctx.advance(PipelineStage::Error));
    }

    #[test]
    fn failed_batch_makes_run_partial() {
        let mut ctx = RunContext::new("doodles", "trait_sum");
        let mut report = UpdateReport::new(UpdateTarget::RarityRanking, 10);
        report.failed_batches.push(FailedBatch {
            index: 1,
            entries: 4,
            error: "injected".into(),
        });
        ctx.rank_report = Some(report);
        assert_eq!(ctx.status(), RunStatus::PartialSuccess);

        let summary = ctx.into_summary();
        assert_eq!(summary.counts.failed_batches, 1);
        assert_eq!(summary.status.exit_code(), 2);
    }

    #[test]
    fn fatal_error_records_failing_stage() {
        let mut ctx = RunContext::new("doodles", "trait_sum");
        ctx.advance(PipelineStage::Aggregate);
        ctx.fail(&RarityError::Cancelled { stage: "SCORE" });

        let summary = ctx.into_summary();
        assert_eq!(summary.status, RunStatus::Failed);
        assert_eq!(summary.final_stage, PipelineStage::Aggregate);
        assert!(summary.error.unwrap().contains("cancelled"));
    }
}
