//! Batch ingestion, delivery recovery and historical backfill for actlog.

pub mod backfill;
pub mod batch;
pub mod config;
pub mod recovery;
pub mod scheduler;

pub use backfill::{
    BackfillError, BackfillFetcher, BackfillOptions, BackfillSelection, BackfillSummary,
    ProgressSnapshot, ProgressTracker,
};
pub use batch::{BatchConfig, BatchError, BatchPipeline, FlushOutcome, QueuedEvent};
pub use config::{load_source_registry, SourceConfig, SourceRegistry, SyncConfig};
pub use recovery::{
    DeliveryReconciler, ReconcileError, RecoveryConfig, RecoveryRunStats, SourceStats,
};
pub use scheduler::RecoveryScheduler;

pub const CRATE_NAME: &str = "actlog-sync";
