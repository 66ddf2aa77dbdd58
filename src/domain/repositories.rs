//! Store interface for rarity synchronization
//!
//! Contains the trait the pipeline talks to and the value types that cross
//! it. Implementations live in the infrastructure layer.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde::Serialize;

use crate::domain::errors::StoreError;
use crate::domain::item::{RawItem, TokenId};

pub type StoreResult<T> = Result<T, StoreError>;

/// Join key for attribute-level writes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TraitKey {
    pub trait_type: String,
    pub value: String,
}

impl TraitKey {
    pub fn new(trait_type: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            trait_type: trait_type.into(),
            value: value.into(),
        }
    }
}

impl std::fmt::Display for TraitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.trait_type, self.value)
    }
}

/// One resolved `rarity_ranking` write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankUpdate {
    pub asset_id: String,
    pub rank: i64,
}

/// One `rarity_percent` write.
#[derive(Debug, Clone, PartialEq)]
pub struct PercentageUpdate {
    pub key: TraitKey,
    pub percentage: f64,
}

/// Result of one committed rank batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RankWriteOutcome {
    pub rows_updated: u64,
    /// The collection flag row changed inside this transaction.
    pub flag_set: bool,
}

/// Result of one committed percentage batch.
#[derive(Debug, Clone, Default)]
pub struct PercentageWriteOutcome {
    pub rows_updated: u64,
    /// Keys that touched at least one row.
    pub matched: HashSet<TraitKey>,
}

/// Post-write aggregate over non-null values of an updated column.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct VerificationAggregate {
    pub rows: i64,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

#[async_trait]
pub trait RarityStore: Send + Sync {
    /// Snapshot of a collection. `None` when the collection itself does not
    /// exist; `Some(vec![])` for an existing collection without items.
    async fn load_items(&self, collection: &str) -> StoreResult<Option<Vec<RawItem>>>;

    /// Current `is_rarity` flag, `None` when the collection row is missing.
    async fn rarity_flag(&self, collection: &str) -> StoreResult<Option<bool>>;

    /// Resolve token ids to internal row identifiers within the collection.
    async fn resolve_asset_ids(
        &self,
        collection: &str,
        token_ids: &[TokenId],
    ) -> StoreResult<HashMap<TokenId, String>>;

    /// Apply one rank batch atomically; when `set_flag` is true the
    /// collection flag is flipped inside the same transaction. A NULL flag
    /// counts as unset.
    async fn write_rank_batch(
        &self,
        collection: &str,
        updates: &[RankUpdate],
        set_flag: bool,
    ) -> StoreResult<RankWriteOutcome>;

    /// Apply one percentage batch atomically.
    async fn write_percentage_batch(
        &self,
        collection: &str,
        updates: &[PercentageUpdate],
    ) -> StoreResult<PercentageWriteOutcome>;

    /// Recompute `asset_traits.total_count` per `(trait_type, value)`.
    async fn refresh_trait_total_counts(&self, collection: &str) -> StoreResult<u64>;

    async fn verify_ranks(&self, collection: &str) -> StoreResult<VerificationAggregate>;

    async fn verify_percentages(&self, collection: &str) -> StoreResult<VerificationAggregate>;
}
