//! Sync Orchestrator
//!
//! Drives one rarity run for one collection:
//! LOAD -> AGGREGATE -> SCORE -> WRITE_PERCENTAGES -> WRITE_RANKS -> VERIFY
//! -> EXPORT -> DONE, with ERROR reachable from every step. Cancellation is
//! honoured between steps only.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::application::batch_update::{BatchUpdateEngine, EngineSettings, with_timeout};
use crate::domain::errors::{RarityError, RarityResult};
use crate::domain::frequency::{CollectionFrequencyTable, aggregate};
use crate::domain::item::{Item, MalformedEncodingPolicy, TokenId, prepare_items, snapshot_digest};
use crate::domain::repositories::{RarityStore, TraitKey};
use crate::domain::run_context::{PipelineStage, RunContext, RunSummary};
use crate::domain::scoring::{ItemRarity, ScoringStrategy, ScoringStrategyKind, rank};

/// Everything a report writer gets to see about a finished run.
pub struct RunReport<'a> {
    pub collection: &'a str,
    pub items: &'a [Item],
    pub rarities: &'a [ItemRarity],
    pub table: &'a CollectionFrequencyTable,
}

/// Writes human-readable artefacts for a run. Failures never fail the run.
pub trait RunReportExporter: Send + Sync {
    fn export(&self, report: &RunReport<'_>) -> std::io::Result<Vec<PathBuf>>;
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub rank_batch_size: usize,
    pub percentage_batch_size: usize,
    pub max_concurrent_batches: usize,
    pub query_timeout: Duration,
    pub strategy: ScoringStrategyKind,
    pub malformed_policy: MalformedEncodingPolicy,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            rank_batch_size: 5000,
            percentage_batch_size: 1000,
            max_concurrent_batches: 1,
            query_timeout: Duration::from_secs(60),
            strategy: ScoringStrategyKind::default(),
            malformed_policy: MalformedEncodingPolicy::default(),
        }
    }
}

pub struct SyncOrchestrator {
    store: Arc<dyn RarityStore>,
    engine: BatchUpdateEngine,
    settings: PipelineSettings,
    strategy: Box<dyn ScoringStrategy>,
    exporter: Option<Box<dyn RunReportExporter>>,
}

impl SyncOrchestrator {
    pub fn new(store: Arc<dyn RarityStore>, settings: PipelineSettings) -> Self {
        let engine = BatchUpdateEngine::new(
            Arc::clone(&store),
            EngineSettings {
                max_concurrent_batches: settings.max_concurrent_batches,
                query_timeout: settings.query_timeout,
            },
        );
        Self {
            store,
            engine,
            settings,
            strategy: settings.strategy.build(),
            exporter: None,
        }
    }

    /// Replace the configured scoring strategy.
    #[must_use]
    pub fn with_strategy(mut self, strategy: Box<dyn ScoringStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    #[must_use]
    pub fn with_exporter(mut self, exporter: impl RunReportExporter + 'static) -> Self {
        self.exporter = Some(Box::new(exporter));
        self
    }

    /// Execute one run. Never returns an error: fatal failures end the run in
    /// the ERROR stage and are described in the summary.
    pub async fn run(&self, collection: &str, cancel: &CancellationToken) -> RunSummary {
        let mut ctx = RunContext::new(collection, self.strategy.name());
        info!(run_id = %ctx.run_id, collection, strategy = self.strategy.name(), "Rarity run started");

        if let Err(err) = self.execute(&mut ctx, cancel).await {
            error!(
                run_id = %ctx.run_id,
                collection,
                stage = %ctx.stage(),
                error = %err,
                "Rarity run failed"
            );
            ctx.fail(&err);
        }

        let summary = ctx.into_summary();
        info!(
            run_id = %summary.run_id,
            collection,
            status = %summary.status,
            loaded = summary.counts.loaded,
            ranked = summary.counts.ranked,
            malformed = summary.counts.malformed,
            unmatched = summary.counts.unmatched_keys,
            failed_batches = summary.counts.failed_batches,
            duration_ms = summary.duration_ms,
            "Rarity run finished"
        );
        summary
    }

    async fn execute(&self, ctx: &mut RunContext, cancel: &CancellationToken) -> RarityResult<()> {
        let collection = ctx.collection.clone();
        let collection = collection.as_str();

        // LOAD
        if cancel.is_cancelled() {
            return Err(RarityError::Cancelled {
                stage: PipelineStage::Load.as_str(),
            });
        }
        info!(stage = %PipelineStage::Load, collection, "Loading collection snapshot");
        let raw_items = with_timeout(
            self.settings.query_timeout,
            "load_items",
            self.store.load_items(collection),
        )
        .await
        .map_err(|e| RarityError::SourceUnavailable {
            collection: collection.to_string(),
            reason: e.to_string(),
        })?
        .ok_or_else(|| RarityError::SourceUnavailable {
            collection: collection.to_string(),
            reason: "collection not found".to_string(),
        })?;

        ctx.loaded = raw_items.len();
        let snapshot = prepare_items(&raw_items, self.settings.malformed_policy);
        let items = snapshot.items;
        ctx.accepted = items.len();
        ctx.malformed = snapshot.malformed;
        ctx.snapshot_digest = Some(snapshot_digest(&items));
        info!(
            collection,
            loaded = ctx.loaded,
            accepted = ctx.accepted,
            malformed = ctx.malformed.len(),
            "Snapshot loaded"
        );

        // AGGREGATE
        Self::enter(ctx, cancel, PipelineStage::Aggregate)?;
        let table = aggregate(&items);
        info!(collection, attribute_values = table.len(), "Attribute frequencies aggregated");

        // SCORE
        Self::enter(ctx, cancel, PipelineStage::Score)?;
        let rarities = rank(&items, &table, self.strategy.as_ref());
        ctx.ranked = rarities.len();

        // WRITE_PERCENTAGES
        Self::enter(ctx, cancel, PipelineStage::WritePercentages)?;
        let percentages: BTreeMap<TraitKey, f64> = table
            .iter()
            .map(|(name, value, stat)| (TraitKey::new(name, value), stat.rounded_percentage()))
            .collect();
        let report = self
            .engine
            .apply_percentage_updates(collection, &percentages, self.settings.percentage_batch_size)
            .await?;
        ctx.percentage_report = Some(report);

        match with_timeout(
            self.settings.query_timeout,
            "refresh_trait_total_counts",
            self.store.refresh_trait_total_counts(collection),
        )
        .await
        {
            Ok(rows) => info!(collection, rows, "Trait total counts refreshed"),
            Err(err) => ctx.warn(format!("trait total_count refresh failed: {err}")),
        }

        // WRITE_RANKS
        Self::enter(ctx, cancel, PipelineStage::WriteRanks)?;
        let ranks: BTreeMap<TokenId, u64> = rarities
            .iter()
            .map(|r| (r.token_id.clone(), r.rank))
            .collect();
        let report = self
            .engine
            .apply_rank_updates(collection, &ranks, self.settings.rank_batch_size)
            .await?;
        ctx.rank_report = Some(report);

        // VERIFY
        Self::enter(ctx, cancel, PipelineStage::Verify)?;
        Self::collect_verification(ctx);

        // EXPORT
        Self::enter(ctx, cancel, PipelineStage::Export)?;
        if let Some(exporter) = &self.exporter {
            let report = RunReport {
                collection,
                items: &items,
                rarities: &rarities,
                table: &table,
            };
            match exporter.export(&report) {
                Ok(paths) => {
                    info!(collection, files = paths.len(), "Run report exported");
                    ctx.report_paths = paths;
                }
                Err(err) => ctx.warn(RarityError::Export(err).to_string()),
            }
        }

        ctx.advance(PipelineStage::Done);
        Ok(())
    }

    /// Check for cancellation, then move to `stage`.
    fn enter(
        ctx: &mut RunContext,
        cancel: &CancellationToken,
        stage: PipelineStage,
    ) -> RarityResult<()> {
        if cancel.is_cancelled() {
            return Err(RarityError::Cancelled {
                stage: stage.as_str(),
            });
        }
        ctx.advance(stage);
        info!(stage = %stage, collection = %ctx.collection, "Entering stage");
        Ok(())
    }

    /// Surface the engine's post-write checks as run warnings.
    fn collect_verification(ctx: &mut RunContext) {
        let mismatches: Vec<String> = ctx
            .percentage_report
            .iter()
            .chain(ctx.rank_report.iter())
            .flat_map(|r| r.mismatches.iter().cloned())
            .collect();

        for mismatch in mismatches {
            ctx.warn(mismatch);
        }

        if let Some(verification) = ctx.rank_report.as_ref().and_then(|r| r.verification) {
            info!(
                collection = %ctx.collection,
                ranked_rows = verification.rows,
                min_rank = ?verification.min,
                max_rank = ?verification.max,
                "Rank verification"
            );
        }
    }
}
