//! Rarity Sync - attribute-frequency rarity ranking for NFT collections
//!
//! Scores every item of a collection from how rare its attributes are,
//! writes ranks and per-attribute percentages back to the marketplace store
//! in batched transactions, and replicates operational tables into a
//! warehouse.

// Module declarations
pub mod application;
pub mod domain;
pub mod infrastructure;

pub use application::{BatchUpdateEngine, PipelineSettings, SyncOrchestrator};
pub use domain::{RarityError, RarityResult, RunStatus, RunSummary};
pub use infrastructure::RaritySyncConfig;
