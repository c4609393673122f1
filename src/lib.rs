// Mart Sync - Core Library
// Raw-layer ingestion, temporal dedup, balance reconciliation and mart refresh.
// Exposes all modules for use in the CLI and tests.

pub mod error;
pub mod config;
pub mod db;
pub mod temporal;       // Temporal keys and versioned records
pub mod ingest;         // Raw files → rd_* tables
pub mod deduplication;  // Duplicate versions under a temporal key
pub mod relation;       // Source relations and built-in marts
pub mod gap;            // Gap analysis: source vs mart
pub mod strategy;       // Load strategy selection
pub mod refresh;        // Full / partial mart refresh
pub mod reconciliation; // Balance chain repair
pub mod observer;       // Outcome sinks (tracing, audit events)
pub mod pipeline;       // Run orchestrator

// Re-export commonly used types
pub use config::{MartConfig, RawFileConfig};
pub use db::{
    Session, Event,
    setup_database, count_rows, insert_event, get_events_for_run,
};
pub use error::{MartError, Result, Step};
pub use temporal::{TemporalKey, VersionedRecord};
pub use ingest::{RawTableSpec, RawBatch, LoadReport, read_raw_file, load_batch};
pub use deduplication::{Deduplicator, DedupGranularity, DedupReport, DuplicateGroup};
pub use relation::{MartDefinition, SourceRelation, builtin_marts};
pub use gap::{GapReport, analyze_gap};
pub use strategy::{LoadStrategy, StrategySelector, select_strategy, FULL_RELOAD_THRESHOLD};
pub use refresh::{MartRefresher, PartialReloadMode, RefreshReport};
pub use reconciliation::{
    BalanceReconciler, BalanceReport, BalanceSeries, ChainBreak, PeriodAdjacency,
};
pub use observer::{Observer, TracingObserver, EventLog, Fanout, NullObserver};
pub use pipeline::{RunReport, StatusReport, run, status};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
