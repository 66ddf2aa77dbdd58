//! Domain module - Core rarity logic and entities
//!
//! This module contains item parsing, attribute frequency aggregation,
//! scoring strategies with the ranker, the store interface, per-run state
//! and the error taxonomy. Nothing in here performs I/O.

pub mod errors;
pub mod frequency;
pub mod item;
pub mod repositories;
pub mod run_context;
pub mod scoring;

// Re-export commonly used items for convenience
pub use errors::{MalformedItemError, RarityError, RarityResult, StoreError};
pub use frequency::{AttributeStat, CollectionFrequencyTable, aggregate};
pub use item::{
    Attribute, AttributeSet, Item, MalformedEncodingPolicy, PreparedSnapshot, RawItem, TokenId,
    parse_attributes, prepare_items, snapshot_digest,
};
pub use repositories::{
    PercentageUpdate, PercentageWriteOutcome, RankUpdate, RankWriteOutcome, RarityStore, TraitKey,
    VerificationAggregate,
};
pub use run_context::{
    FailedBatch, PipelineStage, RunContext, RunCounts, RunStatus, RunSummary, UpdateReport,
    UpdateTarget,
};
pub use scoring::{
    ItemRarity, ScoringStrategy, ScoringStrategyKind, StatisticalRarityStrategy, TraitSumStrategy,
    rank,
};
