// 🚦 Run orchestrator
// ingest → dedup → balance → (gap → strategy → refresh) per mart
//
// Every step runs in its own transaction. The first failure stops the run, is
// reported to the observer with its step, and is returned; steps that already
// committed stay committed.

use crate::config::MartConfig;
use crate::db::{setup_database, Session};
use crate::deduplication::{DedupReport, Deduplicator};
use crate::error::{MartError, Result};
use crate::gap::{analyze_gap, GapReport};
use crate::ingest::{load_batch, read_raw_file, LoadReport, RawTableSpec};
use crate::observer::Observer;
use crate::reconciliation::{BalanceReconciler, BalanceReport, BalanceSeries, ChainBreak};
use crate::refresh::{MartRefresher, RefreshReport};
use crate::relation::builtin_marts;
use crate::strategy::{LoadStrategy, StrategySelector};
use crate::temporal::TemporalKey;
use rusqlite::Connection;
use serde::Serialize;

// ============================================================================
// REPORTS
// ============================================================================

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub loads: Vec<LoadReport>,
    pub dedup: Vec<DedupReport>,
    pub balance: Option<BalanceReport>,
    pub refreshes: Vec<RefreshReport>,
}

impl RunReport {
    pub fn summary(&self) -> String {
        let loaded: usize = self.loads.iter().map(|l| l.inserted).sum();
        let removed: usize = self.dedup.iter().map(|d| d.removed).sum();
        let fixed = self.balance.as_ref().map(|b| b.total_fixed()).unwrap_or(0);
        let refreshed: Vec<String> = self
            .refreshes
            .iter()
            .map(|r| format!("{}={}", r.mart, r.applied))
            .collect();

        format!(
            "loaded {} raw rows, removed {} duplicates, fixed {} balances, marts: {}",
            loaded,
            removed,
            fixed,
            if refreshed.is_empty() {
                "-".to_string()
            } else {
                refreshed.join(", ")
            }
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MartStatus {
    pub mart: String,
    pub gap: GapReport,
    /// What a run would do right now
    pub strategy: LoadStrategy,
}

#[derive(Debug, Clone, Serialize)]
pub struct DuplicateStatus {
    pub table: String,
    pub groups: usize,
    /// Rows a dedup pass would delete
    pub removable: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub marts: Vec<MartStatus>,
    pub duplicates: Vec<DuplicateStatus>,
    pub balance_breaks: Vec<ChainBreak>,
}

// ============================================================================
// STEPS
// ============================================================================

/// Read every configured raw file, then load them. A file that cannot be read
/// aborts before anything is written.
pub fn ingest_raw(
    session: &mut Session,
    config: &MartConfig,
    observer: &mut dyn Observer,
) -> Result<Vec<LoadReport>> {
    let result = load_raw_files(session, config, observer);
    reported(observer, result)
}

pub fn deduplicate(
    session: &mut Session,
    config: &MartConfig,
    observer: &mut dyn Observer,
) -> Result<Vec<DedupReport>> {
    let result = dedup_tables(session, config, observer);
    reported(observer, result)
}

/// Balance reconciliation; `None` when disabled in config
pub fn reconcile_balances(
    session: &mut Session,
    config: &MartConfig,
    observer: &mut dyn Observer,
) -> Result<Option<BalanceReport>> {
    let result = reconcile_series(session, config, observer);
    reported(observer, result)
}

pub fn refresh_marts(
    session: &mut Session,
    config: &MartConfig,
    observer: &mut dyn Observer,
) -> Result<Vec<RefreshReport>> {
    let result = refresh_all(session, config, observer);
    reported(observer, result)
}

/// The whole run, in order
pub fn run(session: &mut Session, config: &MartConfig, observer: &mut dyn Observer) -> Result<RunReport> {
    let result = run_steps(session, config, observer);
    reported(observer, result)
}

/// Read-only view of what a run would find
pub fn status(conn: &Connection, config: &MartConfig) -> Result<StatusReport> {
    let selector = StrategySelector::new(config.load.full_reload_threshold);

    let mut marts = Vec::new();
    for mart in builtin_marts() {
        let gap = analyze_gap(conn, &mart)?;
        marts.push(MartStatus {
            mart: mart.name.to_string(),
            strategy: selector.select(&gap),
            gap,
        });
    }

    let dedup = Deduplicator::new(config.dedup.granularity);
    let mut duplicates = Vec::new();
    for table in &config.dedup.tables {
        let key = temporal_key_of(table)?;
        let groups = dedup.find_duplicates(conn, table, &key)?;
        duplicates.push(DuplicateStatus {
            table: table.clone(),
            groups: groups.len(),
            removable: groups.iter().map(|g| (g.count - 1) as usize).sum(),
        });
    }

    let balance_breaks = BalanceReconciler::new(config.balance.adjacency)
        .find_breaks(conn, &BalanceSeries::account_balance())?;

    Ok(StatusReport {
        marts,
        duplicates,
        balance_breaks,
    })
}

// ============================================================================
// INTERNALS
// ============================================================================

fn reported<T>(observer: &mut dyn Observer, result: Result<T>) -> Result<T> {
    if let Err(err) = &result {
        observer.step_failed(err);
    }
    result
}

fn temporal_key_of(table: &str) -> Result<TemporalKey> {
    RawTableSpec::by_name(table)
        .and_then(|spec| spec.temporal_key)
        .ok_or_else(|| MartError::Config(format!("table '{}' has no temporal key", table)))
}

fn run_steps(session: &mut Session, config: &MartConfig, observer: &mut dyn Observer) -> Result<RunReport> {
    setup_database(session.conn())?;

    let loads = load_raw_files(session, config, observer)?;
    let dedup = dedup_tables(session, config, observer)?;
    let balance = reconcile_series(session, config, observer)?;
    let refreshes = refresh_all(session, config, observer)?;

    Ok(RunReport {
        loads,
        dedup,
        balance,
        refreshes,
    })
}

fn load_raw_files(
    session: &mut Session,
    config: &MartConfig,
    observer: &mut dyn Observer,
) -> Result<Vec<LoadReport>> {
    let mut batches = Vec::with_capacity(config.raw.len());
    for raw in &config.raw {
        let spec = RawTableSpec::by_name(&raw.table)
            .ok_or_else(|| MartError::Config(format!("unknown raw table '{}'", raw.table)))?;
        batches.push((read_raw_file(&config.raw_path(raw), spec)?, raw.replace));
    }

    let mut reports = Vec::with_capacity(batches.len());
    for (batch, replace) in &batches {
        let report = load_batch(session, batch, *replace)?;
        observer.raw_loaded(&report);
        reports.push(report);
    }

    Ok(reports)
}

fn dedup_tables(
    session: &mut Session,
    config: &MartConfig,
    observer: &mut dyn Observer,
) -> Result<Vec<DedupReport>> {
    let dedup = Deduplicator::new(config.dedup.granularity);
    let mut reports = Vec::new();

    for table in &config.dedup.tables {
        let key = temporal_key_of(table)?;

        let groups = dedup.find_duplicates(session.conn(), table, &key)?;
        observer.duplicates_found(table, &groups);

        let report = dedup.remove_duplicates(session, table, &key)?;
        observer.duplicates_removed(&report);
        reports.push(report);
    }

    Ok(reports)
}

fn reconcile_series(
    session: &mut Session,
    config: &MartConfig,
    observer: &mut dyn Observer,
) -> Result<Option<BalanceReport>> {
    if !config.balance.enabled {
        return Ok(None);
    }

    let report = BalanceReconciler::new(config.balance.adjacency)
        .reconcile(session, &BalanceSeries::account_balance())?;
    observer.balance_corrected(&report);

    Ok(Some(report))
}

fn refresh_all(
    session: &mut Session,
    config: &MartConfig,
    observer: &mut dyn Observer,
) -> Result<Vec<RefreshReport>> {
    let selector = StrategySelector::new(config.load.full_reload_threshold);
    let refresher = MartRefresher::new(config.load.partial_mode, config.load.verify);
    let mut reports = Vec::new();

    for mart in builtin_marts() {
        let gap = analyze_gap(session.conn(), &mart)?;
        observer.gap_measured(mart.name, &gap);

        let strategy = selector.select(&gap);
        observer.strategy_selected(mart.name, strategy, &gap);

        let report = refresher.refresh(session, &mart, strategy)?;
        observer.mart_refreshed(&report);
        reports.push(report);
    }

    Ok(reports)
}

// ============================================================================
// TESTS
// ============================================================================
