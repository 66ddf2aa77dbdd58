//! Batch Update Engine
//!
//! Turns a key -> value mapping into fixed-size batches and applies each batch
//! as one store transaction. A failed batch rolls back on its own and is
//! recorded; batches committed before it stay committed.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt, stream};
use tracing::{debug, error, info, warn};

use crate::domain::errors::{RarityError, RarityResult, StoreError};
use crate::domain::item::TokenId;
use crate::domain::repositories::{
    PercentageUpdate, RankUpdate, RarityStore, StoreResult, TraitKey, VerificationAggregate,
};
use crate::domain::run_context::{FailedBatch, UpdateReport, UpdateTarget};

/// Run a store call under the configured query timeout.
///
/// On expiry the call's future is dropped. For a batch write that is usually
/// a rollback, but when the timer fires while `COMMIT` is in flight the
/// database may still have committed; callers that need certainty re-read
/// the rows (the post-write verification aggregate does).
pub async fn with_timeout<T>(
    limit: Duration,
    operation: &'static str,
    call: impl Future<Output = StoreResult<T>>,
) -> StoreResult<T> {
    tokio::time::timeout(limit, call)
        .await
        .unwrap_or(Err(StoreError::Timeout {
            operation,
            secs: limit.as_secs(),
        }))
}

/// Consecutive slice of the update set, committed as one transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateBatch<T> {
    pub index: usize,
    pub entries: Vec<T>,
}

/// Split `entries` into batches of at most `batch_size`, ordered by `key` so
/// that batch membership does not depend on input order.
pub fn plan_batches<T, K, F>(mut entries: Vec<T>, batch_size: usize, key: F) -> Vec<UpdateBatch<T>>
where
    K: Ord + ?Sized,
    F: Fn(&T) -> &K,
{
    entries.sort_by(|a, b| key(a).cmp(key(b)));

    let batch_size = batch_size.max(1);
    let mut batches = Vec::with_capacity(entries.len().div_ceil(batch_size));
    let mut remaining = entries.into_iter().peekable();
    while remaining.peek().is_some() {
        let chunk: Vec<T> = remaining.by_ref().take(batch_size).collect();
        batches.push(UpdateBatch {
            index: batches.len(),
            entries: chunk,
        });
    }
    batches
}

#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    /// Batches in flight once the collection flag is settled
    pub max_concurrent_batches: usize,
    pub query_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_concurrent_batches: 1,
            query_timeout: Duration::from_secs(60),
        }
    }
}

struct RankCommit {
    rows: u64,
    entries: usize,
    min_rank: i64,
    max_rank: i64,
    flag_set: bool,
}

struct PercentageCommit {
    rows: u64,
    unmatched: Vec<TraitKey>,
}

/// Outcome of one committed batch.
trait BatchCommit {
    /// The collection flag changed in this batch's transaction.
    fn placed_flag(&self) -> bool {
        false
    }
}

impl BatchCommit for RankCommit {
    fn placed_flag(&self) -> bool {
        self.flag_set
    }
}

impl BatchCommit for PercentageCommit {}

type BatchWriter<T, R> = Box<dyn Fn(Vec<T>, bool) -> BoxFuture<'static, StoreResult<R>> + Send + Sync>;

pub struct BatchUpdateEngine {
    store: Arc<dyn RarityStore>,
    settings: EngineSettings,
}

impl BatchUpdateEngine {
    pub fn new(store: Arc<dyn RarityStore>, settings: EngineSettings) -> Self {
        Self { store, settings }
    }

    pub const fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Write `rarity_ranking` for every token in `updates`.
    ///
    /// Only failures before the first batch (flag read, token resolution)
    /// are returned as errors; everything after that lands in the report.
    pub async fn apply_rank_updates(
        &self,
        collection: &str,
        updates: &BTreeMap<TokenId, u64>,
        batch_size: usize,
    ) -> RarityResult<UpdateReport> {
        let target = UpdateTarget::RarityRanking;
        let mut report = UpdateReport::new(target, updates.len());
        info!(collection, entries = updates.len(), batch_size, "Applying rank updates");

        let flag = with_timeout(
            self.settings.query_timeout,
            "rarity_flag",
            self.store.rarity_flag(collection),
        )
        .await
        .map_err(|source| RarityError::Step {
            stage: "WRITE_RANKS",
            source,
        })?;
        let flag_pending = flag == Some(false);

        let token_ids: Vec<TokenId> = updates.keys().cloned().collect();
        let resolved = with_timeout(
            self.settings.query_timeout,
            "resolve_asset_ids",
            self.store.resolve_asset_ids(collection, &token_ids),
        )
        .await
        .map_err(|source| RarityError::Step {
            stage: "WRITE_RANKS",
            source,
        })?;

        let mut entries = Vec::with_capacity(resolved.len());
        for (token_id, rank) in updates {
            match resolved.get(token_id) {
                Some(asset_id) => entries.push(RankUpdate {
                    asset_id: asset_id.clone(),
                    rank: i64::try_from(*rank).unwrap_or(i64::MAX),
                }),
                None => report.unmatched_keys.push(token_id.to_string()),
            }
        }
        if !report.unmatched_keys.is_empty() {
            warn!(
                collection,
                unmatched = report.unmatched_keys.len(),
                "Tokens without an asset row were skipped"
            );
        }

        let batches = plan_batches(entries, batch_size, |u: &RankUpdate| u.asset_id.as_str());
        report.batches_planned = batches.len();

        let store = Arc::clone(&self.store);
        let owned_collection: Arc<str> = Arc::from(collection);
        let write: BatchWriter<RankUpdate, RankCommit> = Box::new(move |updates, set_flag| {
            let store = Arc::clone(&store);
            let collection = Arc::clone(&owned_collection);
            async move {
                let min_rank = updates.iter().map(|u| u.rank).min().unwrap_or_default();
                let max_rank = updates.iter().map(|u| u.rank).max().unwrap_or_default();
                let outcome = store.write_rank_batch(&collection, &updates, set_flag).await?;
                Ok(RankCommit {
                    rows: outcome.rows_updated,
                    entries: updates.len(),
                    min_rank,
                    max_rank,
                    flag_set: outcome.flag_set,
                })
            }
            .boxed()
        });

        let commits = self
            .run_batches(collection, target, batches, flag_pending, &mut report, &write)
            .await;

        report.rows_updated = commits.iter().map(|c| c.rows).sum();
        let committed_entries: usize = commits.iter().map(|c| c.entries).sum();
        let committed_range = commits
            .iter()
            .map(|c| c.min_rank)
            .min()
            .zip(commits.iter().map(|c| c.max_rank).max());

        match with_timeout(
            self.settings.query_timeout,
            "verify_ranks",
            self.store.verify_ranks(collection),
        )
        .await
        {
            Ok(aggregate) => {
                report.mismatches = rank_mismatches(&aggregate, committed_entries, committed_range);
                report.verification = Some(aggregate);
            }
            Err(err) => report
                .mismatches
                .push(format!("verification query failed: {err}")),
        }

        self.log_report(collection, &report);
        Ok(report)
    }

    /// Write `rarity_percent` for every `(trait_type, value)` in `updates`.
    pub async fn apply_percentage_updates(
        &self,
        collection: &str,
        updates: &BTreeMap<TraitKey, f64>,
        batch_size: usize,
    ) -> RarityResult<UpdateReport> {
        let target = UpdateTarget::RarityPercent;
        let mut report = UpdateReport::new(target, updates.len());
        info!(collection, entries = updates.len(), batch_size, "Applying percentage updates");

        let entries: Vec<PercentageUpdate> = updates
            .iter()
            .map(|(key, percentage)| PercentageUpdate {
                key: key.clone(),
                percentage: *percentage,
            })
            .collect();
        let batches = plan_batches(entries, batch_size, |u: &PercentageUpdate| &u.key);
        report.batches_planned = batches.len();

        let store = Arc::clone(&self.store);
        let owned_collection: Arc<str> = Arc::from(collection);
        let write: BatchWriter<PercentageUpdate, PercentageCommit> =
            Box::new(move |updates, _set_flag| {
                let store = Arc::clone(&store);
                let collection = Arc::clone(&owned_collection);
                async move {
                    let outcome = store.write_percentage_batch(&collection, &updates).await?;
                    let unmatched = updates
                        .into_iter()
                        .map(|u| u.key)
                        .filter(|key| !outcome.matched.contains(key))
                        .collect();
                    Ok(PercentageCommit {
                        rows: outcome.rows_updated,
                        unmatched,
                    })
                }
                .boxed()
            });

        let commits = self
            .run_batches(collection, target, batches, false, &mut report, &write)
            .await;

        report.rows_updated = commits.iter().map(|c| c.rows).sum();
        let mut unmatched: Vec<TraitKey> = commits.into_iter().flat_map(|c| c.unmatched).collect();
        unmatched.sort();
        if !unmatched.is_empty() {
            warn!(
                collection,
                unmatched = unmatched.len(),
                "Trait keys without an asset_traits row were skipped"
            );
        }
        report.unmatched_keys = unmatched.iter().map(ToString::to_string).collect();

        match with_timeout(
            self.settings.query_timeout,
            "verify_percentages",
            self.store.verify_percentages(collection),
        )
        .await
        {
            Ok(aggregate) => {
                report.mismatches = percentage_mismatches(&aggregate, report.rows_updated);
                report.verification = Some(aggregate);
            }
            Err(err) => report
                .mismatches
                .push(format!("verification query failed: {err}")),
        }

        self.log_report(collection, &report);
        Ok(report)
    }

    /// Apply batches in order until one carrying the flag commits, then run
    /// the rest concurrently. Returns the outcomes of committed batches.
    async fn run_batches<T, R: BatchCommit>(
        &self,
        collection: &str,
        target: UpdateTarget,
        batches: Vec<UpdateBatch<T>>,
        mut flag_pending: bool,
        report: &mut UpdateReport,
        write: &BatchWriter<T, R>,
    ) -> Vec<R> {
        let mut committed = Vec::with_capacity(batches.len());
        let mut remaining = batches.into_iter();

        while flag_pending {
            let Some(batch) = remaining.next() else {
                break;
            };
            let (index, entries) = (batch.index, batch.entries.len());
            match self.attempt(collection, target, write, batch, true).await {
                Ok(outcome) => {
                    if outcome.placed_flag() {
                        info!(collection, batch = index, "Collection rarity flag set");
                        report.flag_set = true;
                    } else {
                        warn!(collection, batch = index, "Collection rarity flag row was not updated");
                    }
                    flag_pending = false;
                    report.batches_committed += 1;
                    committed.push(outcome);
                }
                Err(err) => record_failure(report, index, entries, &err),
            }
        }

        let limit = self.settings.max_concurrent_batches.max(1);
        let results: Vec<(usize, usize, RarityResult<R>)> = stream::iter(remaining.map(|batch| {
            let (index, entries) = (batch.index, batch.entries.len());
            let attempt = self.attempt(collection, target, write, batch, false);
            async move { (index, entries, attempt.await) }
        }))
        .buffer_unordered(limit)
        .collect()
        .await;

        for (index, entries, result) in results {
            match result {
                Ok(outcome) => {
                    report.batches_committed += 1;
                    committed.push(outcome);
                }
                Err(err) => record_failure(report, index, entries, &err),
            }
        }
        report.failed_batches.sort_by_key(|b| b.index);

        committed
    }

    async fn attempt<T, R>(
        &self,
        collection: &str,
        target: UpdateTarget,
        write: &BatchWriter<T, R>,
        batch: UpdateBatch<T>,
        set_flag: bool,
    ) -> RarityResult<R> {
        let (index, entries) = (batch.index, batch.entries.len());
        debug!(collection, column = %target, batch = index, entries, set_flag, "Committing batch");

        with_timeout(
            self.settings.query_timeout,
            "write_batch",
            write(batch.entries, set_flag),
        )
        .await
        .map_err(|source| RarityError::BatchWrite {
            target: target.column(),
            batch_index: index,
            entries,
            source,
        })
    }

    fn log_report(&self, collection: &str, report: &UpdateReport) {
        for mismatch in &report.mismatches {
            warn!(collection, column = %report.target, "Verification mismatch: {}", mismatch);
        }
        info!(
            collection,
            column = %report.target,
            planned = report.batches_planned,
            committed = report.batches_committed,
            failed = report.failed_batches.len(),
            rows = report.rows_updated,
            unmatched = report.unmatched_keys.len(),
            "Batch updates finished"
        );
    }
}

fn record_failure(report: &mut UpdateReport, index: usize, entries: usize, err: &RarityError) {
    error!(column = %report.target, batch = index, entries, error = %err, "Batch rolled back");
    report.failed_batches.push(FailedBatch {
        index,
        entries,
        error: err.to_string(),
    });
}

fn rank_mismatches(
    aggregate: &VerificationAggregate,
    committed_entries: usize,
    committed_range: Option<(i64, i64)>,
) -> Vec<String> {
    let mut mismatches = Vec::new();
    let expected_rows = i64::try_from(committed_entries).unwrap_or(i64::MAX);
    if aggregate.rows < expected_rows {
        mismatches.push(
            RarityError::VerificationMismatch {
                target: UpdateTarget::RarityRanking.column(),
                expected: format!("at least {expected_rows} ranked rows"),
                actual: aggregate.rows.to_string(),
            }
            .to_string(),
        );
    }
    if let Some((min, max)) = committed_range {
        let expected = (Some(min as f64), Some(max as f64));
        if (aggregate.min, aggregate.max) != expected {
            mismatches.push(
                RarityError::VerificationMismatch {
                    target: UpdateTarget::RarityRanking.column(),
                    expected: format!("rank range {min}..={max}"),
                    actual: format!("{:?}..={:?}", aggregate.min, aggregate.max),
                }
                .to_string(),
            );
        }
    }
    mismatches
}

fn percentage_mismatches(aggregate: &VerificationAggregate, rows_updated: u64) -> Vec<String> {
    let mut mismatches = Vec::new();
    let expected_rows = i64::try_from(rows_updated).unwrap_or(i64::MAX);
    if aggregate.rows < expected_rows {
        mismatches.push(
            RarityError::VerificationMismatch {
                target: UpdateTarget::RarityPercent.column(),
                expected: format!("at least {expected_rows} rows with a percentage"),
                actual: aggregate.rows.to_string(),
            }
            .to_string(),
        );
    }
    let out_of_bounds = aggregate.min.is_some_and(|min| min < 0.0)
        || aggregate.max.is_some_and(|max| max > 100.0);
    if out_of_bounds {
        mismatches.push(
            RarityError::VerificationMismatch {
                target: UpdateTarget::RarityPercent.column(),
                expected: "percentages within 0..=100".to_string(),
                actual: format!("{:?}..={:?}", aggregate.min, aggregate.max),
            }
            .to_string(),
        );
    }
    mismatches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::item::RawItem;
    use crate::domain::repositories::{PercentageWriteOutcome, RankWriteOutcome};
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-memory store; any batch containing `poison` fails as a whole.
    #[derive(Default)]
    struct MemoryStore {
        assets: HashMap<TokenId, String>,
        traits: HashSet<TraitKey>,
        ranks: Mutex<HashMap<String, i64>>,
        percents: Mutex<HashMap<TraitKey, f64>>,
        flag: Mutex<Option<bool>>,
        poison: Option<String>,
        delay: Option<Duration>,
        rank_commits: AtomicUsize,
        flag_flips: AtomicUsize,
        /// Flag writes match no row, as with a row removed under the run
        flag_row_locked: bool,
    }

    impl MemoryStore {
        fn with_tokens(count: u64) -> Self {
            Self {
                assets: (0..count)
                    .map(|t| (TokenId::from(t), format!("asset-{t:05}")))
                    .collect(),
                flag: Mutex::new(Some(false)),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl RarityStore for MemoryStore {
        async fn load_items(&self, _collection: &str) -> StoreResult<Option<Vec<RawItem>>> {
            Ok(Some(Vec::new()))
        }

        async fn rarity_flag(&self, _collection: &str) -> StoreResult<Option<bool>> {
            Ok(*self.flag.lock().unwrap())
        }

        async fn resolve_asset_ids(
            &self,
            _collection: &str,
            token_ids: &[TokenId],
        ) -> StoreResult<HashMap<TokenId, String>> {
            Ok(token_ids
                .iter()
                .filter_map(|t| self.assets.get(t).map(|a| (t.clone(), a.clone())))
                .collect())
        }

        async fn write_rank_batch(
            &self,
            _collection: &str,
            updates: &[RankUpdate],
            set_flag: bool,
        ) -> StoreResult<RankWriteOutcome> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if updates.iter().any(|u| Some(&u.asset_id) == self.poison.as_ref()) {
                return Err(StoreError::invalid_row("asset_extra", "injected failure"));
            }
            let mut ranks = self.ranks.lock().unwrap();
            for update in updates {
                ranks.insert(update.asset_id.clone(), update.rank);
            }
            let mut flag_set = false;
            if set_flag && !self.flag_row_locked {
                let mut flag = self.flag.lock().unwrap();
                if *flag == Some(false) {
                    *flag = Some(true);
                    flag_set = true;
                    self.flag_flips.fetch_add(1, Ordering::SeqCst);
                }
            }
            self.rank_commits.fetch_add(1, Ordering::SeqCst);
            Ok(RankWriteOutcome {
                rows_updated: updates.len() as u64,
                flag_set,
            })
        }

        async fn write_percentage_batch(
            &self,
            _collection: &str,
            updates: &[PercentageUpdate],
        ) -> StoreResult<PercentageWriteOutcome> {
            let mut outcome = PercentageWriteOutcome::default();
            let mut percents = self.percents.lock().unwrap();
            for key in updates.iter().map(|u| &u.key) {
                if self.traits.contains(key) {
                    outcome.matched.insert(key.clone());
                }
            }
            for update in updates.iter().filter(|u| outcome.matched.contains(&u.key)) {
                percents.insert(update.key.clone(), update.percentage);
                outcome.rows_updated += 1;
            }
            Ok(outcome)
        }

        async fn refresh_trait_total_counts(&self, _collection: &str) -> StoreResult<u64> {
            Ok(0)
        }

        async fn verify_ranks(&self, _collection: &str) -> StoreResult<VerificationAggregate> {
            let ranks = self.ranks.lock().unwrap();
            Ok(VerificationAggregate {
                rows: ranks.len() as i64,
                min: ranks.values().min().map(|r| *r as f64),
                max: ranks.values().max().map(|r| *r as f64),
            })
        }

        async fn verify_percentages(&self, _collection: &str) -> StoreResult<VerificationAggregate> {
            let percents = self.percents.lock().unwrap();
            Ok(VerificationAggregate {
                rows: percents.len() as i64,
                min: percents.values().copied().reduce(f64::min),
                max: percents.values().copied().reduce(f64::max),
            })
        }
    }

    fn rank_map(count: u64) -> BTreeMap<TokenId, u64> {
        (0..count).map(|t| (TokenId::from(t), t + 1)).collect()
    }

    fn engine(store: Arc<MemoryStore>, concurrency: usize) -> BatchUpdateEngine {
        BatchUpdateEngine::new(
            store,
            EngineSettings {
                max_concurrent_batches: concurrency,
                query_timeout: Duration::from_secs(5),
            },
        )
    }

    #[test]
    fn twelve_thousand_updates_make_three_batches() {
        let entries: Vec<u32> = (0..12_000).rev().collect();
        let batches = plan_batches(entries, 5000, |e: &u32| e);

        let sizes: Vec<usize> = batches.iter().map(|b| b.entries.len()).collect();
        assert_eq!(sizes, vec![5000, 5000, 2000]);
        assert_eq!(batches.iter().map(|b| b.index).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(batches[0].entries[0], 0);
        assert_eq!(batches[2].entries[1999], 11_999);
    }

    #[test]
    fn empty_input_plans_no_batches() {
        let batches = plan_batches(Vec::<u32>::new(), 10, |e: &u32| e);
        assert!(batches.is_empty());
    }

    #[tokio::test]
    async fn rank_updates_commit_each_batch_and_flip_flag_once() {
        let store = Arc::new(MemoryStore::with_tokens(12_000));
        let report = engine(Arc::clone(&store), 4)
            .apply_rank_updates("doodles", &rank_map(12_000), 5000)
            .await
            .unwrap();

        assert_eq!(report.batches_planned, 3);
        assert_eq!(report.batches_committed, 3);
        assert_eq!(store.rank_commits.load(Ordering::SeqCst), 3);
        assert_eq!(store.flag_flips.load(Ordering::SeqCst), 1);
        assert!(report.flag_set);
        assert_eq!(report.rows_updated, 12_000);
        assert!(report.mismatches.is_empty(), "{:?}", report.mismatches);
        assert!(!report.is_partial());
    }

    #[tokio::test]
    async fn flag_moves_to_next_batch_when_first_fails() {
        let mut store = MemoryStore::with_tokens(10);
        store.poison = Some("asset-00001".to_string());
        let store = Arc::new(store);

        let report = engine(Arc::clone(&store), 1)
            .apply_rank_updates("doodles", &rank_map(10), 4)
            .await
            .unwrap();

        assert!(report.is_partial());
        assert_eq!(report.failed_batches.len(), 1);
        assert_eq!(report.failed_batches[0].index, 0);
        assert_eq!(report.failed_entries(), 4);
        assert_eq!(report.batches_committed, 2);
        assert!(report.flag_set);
        assert_eq!(*store.flag.lock().unwrap(), Some(true));
        assert_eq!(store.flag_flips.load(Ordering::SeqCst), 1);

        let ranks = store.ranks.lock().unwrap();
        assert_eq!(ranks.len(), 6);
        assert!(!ranks.contains_key("asset-00000"));
    }

    #[tokio::test]
    async fn flag_already_set_is_left_alone() {
        let store = MemoryStore::with_tokens(3);
        *store.flag.lock().unwrap() = Some(true);
        let store = Arc::new(store);

        let report = engine(Arc::clone(&store), 2)
            .apply_rank_updates("doodles", &rank_map(3), 2)
            .await
            .unwrap();
        assert!(!report.flag_set);
        assert_eq!(store.flag_flips.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn flag_reported_only_when_the_row_changed() {
        let mut store = MemoryStore::with_tokens(6);
        store.flag_row_locked = true;
        let store = Arc::new(store);

        let report = engine(Arc::clone(&store), 2)
            .apply_rank_updates("doodles", &rank_map(6), 2)
            .await
            .unwrap();
        assert_eq!(report.batches_committed, 3);
        assert!(!report.flag_set);
        assert_eq!(*store.flag.lock().unwrap(), Some(false));
        assert_eq!(store.flag_flips.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unresolvable_tokens_are_unmatched_not_fatal() {
        let store = Arc::new(MemoryStore::with_tokens(2));
        let mut updates = rank_map(2);
        updates.insert(TokenId::from(99), 3);

        let report = engine(Arc::clone(&store), 1)
            .apply_rank_updates("doodles", &updates, 10)
            .await
            .unwrap();
        assert_eq!(report.unmatched_keys, vec!["99".to_string()]);
        assert_eq!(report.rows_updated, 2);
        assert!(!report.is_partial());
    }

    #[tokio::test]
    async fn rerun_with_same_input_is_idempotent() {
        let store = Arc::new(MemoryStore::with_tokens(50));
        let engine = engine(Arc::clone(&store), 3);

        engine.apply_rank_updates("doodles", &rank_map(50), 7).await.unwrap();
        let first = store.ranks.lock().unwrap().clone();
        let report = engine.apply_rank_updates("doodles", &rank_map(50), 7).await.unwrap();
        let second = store.ranks.lock().unwrap().clone();

        assert_eq!(first, second);
        assert!(report.mismatches.is_empty());
    }

    #[tokio::test]
    async fn slow_batch_times_out_as_batch_failure() {
        let mut store = MemoryStore::with_tokens(2);
        store.delay = Some(Duration::from_millis(500));
        let store = Arc::new(store);
        let engine = BatchUpdateEngine::new(
            store,
            EngineSettings {
                max_concurrent_batches: 1,
                query_timeout: Duration::from_millis(20),
            },
        );

        let report = engine
            .apply_rank_updates("doodles", &rank_map(2), 10)
            .await
            .unwrap();
        assert_eq!(report.failed_batches.len(), 1);
        assert!(report.failed_batches[0].error.contains("timed out"));
        assert!(!report.flag_set);
    }

    #[tokio::test]
    async fn percentage_keys_without_rows_are_unmatched() {
        let mut store = MemoryStore::with_tokens(0);
        store.traits.insert(TraitKey::new("color", "red"));
        store.traits.insert(TraitKey::new("color", "blue"));
        let store = Arc::new(store);

        let updates: BTreeMap<TraitKey, f64> = [
            (TraitKey::new("color", "red"), 66.67),
            (TraitKey::new("color", "blue"), 33.33),
            (TraitKey::new("hat", "cap"), 10.0),
        ]
        .into_iter()
        .collect();

        let report = engine(Arc::clone(&store), 2)
            .apply_percentage_updates("doodles", &updates, 2)
            .await
            .unwrap();
        assert_eq!(report.batches_planned, 2);
        assert_eq!(report.rows_updated, 2);
        assert_eq!(report.unmatched_keys, vec!["hat=cap".to_string()]);
        assert!(report.mismatches.is_empty());
    }

    #[test]
    fn rank_range_disagreement_is_reported() {
        let aggregate = VerificationAggregate {
            rows: 3,
            min: Some(1.0),
            max: Some(4.0),
        };
        let mismatches = rank_mismatches(&aggregate, 3, Some((1, 3)));
        assert_eq!(mismatches.len(), 1);
        assert!(mismatches[0].contains("rank range 1..=3"));
    }
}
