//! Application layer module
//!
//! This module contains the batch update engine, the sync orchestrator that
//! sequences a rarity run, and the warehouse replication job.

pub mod batch_update;
pub mod replication;
pub mod sync_orchestrator;

pub use batch_update::{BatchUpdateEngine, EngineSettings, UpdateBatch, plan_batches};
pub use replication::{
    ColumnType, ReplicationError, ReplicationJob, ReplicationOutcome, Row, RowSource, TableSpec,
    TimeWindow, WarehouseSink,
};
pub use sync_orchestrator::{PipelineSettings, RunReport, RunReportExporter, SyncOrchestrator};
