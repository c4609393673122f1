// 📣 Observer - where run outcomes go
// The engine reports what happened through this trait and never formats or
// routes logs itself. The binary decides which sinks are attached.

use crate::db::{insert_event, Event, Session};
use crate::deduplication::{DedupReport, DuplicateGroup};
use crate::error::{MartError, Result, Step};
use crate::gap::GapReport;
use crate::ingest::LoadReport;
use crate::reconciliation::BalanceReport;
use crate::refresh::RefreshReport;
use crate::strategy::LoadStrategy;
use serde_json::json;
use tracing::{error, info, warn};

pub trait Observer {
    fn raw_loaded(&mut self, _report: &LoadReport) {}

    fn duplicates_found(&mut self, _table: &str, _groups: &[DuplicateGroup]) {}

    fn duplicates_removed(&mut self, _report: &DedupReport) {}

    fn gap_measured(&mut self, _mart: &str, _gap: &GapReport) {}

    fn strategy_selected(&mut self, _mart: &str, _strategy: LoadStrategy, _gap: &GapReport) {}

    fn mart_refreshed(&mut self, _report: &RefreshReport) {}

    fn balance_corrected(&mut self, _report: &BalanceReport) {}

    fn step_failed(&mut self, _error: &MartError) {}
}

/// Discards everything
pub struct NullObserver;

impl Observer for NullObserver {}

// ============================================================================
// TRACING
// ============================================================================

/// Emits one structured tracing event per outcome
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn raw_loaded(&mut self, report: &LoadReport) {
        info!(
            table = %report.table,
            inserted = report.inserted,
            skipped = report.skipped,
            replaced = report.replaced,
            "raw table loaded"
        );
    }

    fn duplicates_found(&mut self, table: &str, groups: &[DuplicateGroup]) {
        if groups.is_empty() {
            return;
        }
        let extra: i64 = groups.iter().map(|g| g.count - 1).sum();
        warn!(table, groups = groups.len(), extra_rows = extra, "duplicate versions found");
    }

    fn duplicates_removed(&mut self, report: &DedupReport) {
        info!(table = %report.table, removed = report.removed, "duplicates removed");
    }

    fn gap_measured(&mut self, mart: &str, gap: &GapReport) {
        info!(
            mart,
            missing = gap.missing,
            total = gap.total,
            ratio = gap.ratio(),
            "gap measured"
        );
    }

    fn strategy_selected(&mut self, mart: &str, strategy: LoadStrategy, _gap: &GapReport) {
        info!(mart, strategy = %strategy, "load strategy selected");
    }

    fn mart_refreshed(&mut self, report: &RefreshReport) {
        info!(
            mart = %report.mart,
            applied = %report.applied,
            deleted = report.deleted,
            inserted = report.inserted,
            verified = report.verified,
            "mart refreshed"
        );
    }

    fn balance_corrected(&mut self, report: &BalanceReport) {
        info!(
            series = %report.series,
            forward = report.forward_fixed,
            backward = report.backward_fixed,
            "balance chain reconciled"
        );
    }

    fn step_failed(&mut self, err: &MartError) {
        let step = err.step().map(|s| s.as_str()).unwrap_or("config");
        error!(step, error = %err, "step failed");
    }
}

// ============================================================================
// AUDIT EVENT LOG
// ============================================================================

/// Collects audit events during a run; `persist` writes them afterwards so the
/// log never competes with the run's own transactions.
pub struct EventLog {
    pub run_id: String,
    events: Vec<Event>,
}

impl EventLog {
    pub fn new() -> Self {
        EventLog {
            run_id: uuid::Uuid::new_v4().to_string(),
            events: Vec::new(),
        }
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    fn record(&mut self, event_type: &str, subject: &str, data: serde_json::Value) {
        self.events
            .push(Event::new(&self.run_id, event_type, subject, data));
    }

    /// Write collected events in one transaction. The buffer is cleared only
    /// once the commit succeeds, so a failed write can be retried.
    pub fn persist(&mut self, session: &mut Session) -> Result<usize> {
        let tx = session.begin(Step::Audit)?;
        for event in &self.events {
            insert_event(&tx, event)?;
        }
        tx.commit().map_err(MartError::store(Step::Audit))?;

        let count = self.events.len();
        self.events.clear();
        Ok(count)
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl Observer for EventLog {
    fn raw_loaded(&mut self, report: &LoadReport) {
        self.record(
            "raw_loaded",
            &report.table,
            json!({
                "inserted": report.inserted,
                "skipped": report.skipped,
                "replaced": report.replaced,
            }),
        );
    }

    fn duplicates_found(&mut self, table: &str, groups: &[DuplicateGroup]) {
        if groups.is_empty() {
            return;
        }
        self.record("duplicates_found", table, json!({ "groups": groups }));
    }

    fn duplicates_removed(&mut self, report: &DedupReport) {
        self.record(
            "duplicates_removed",
            &report.table,
            json!({ "groups": report.groups, "removed": report.removed }),
        );
    }

    fn gap_measured(&mut self, mart: &str, gap: &GapReport) {
        self.record(
            "gap_measured",
            mart,
            json!({ "missing": gap.missing, "total": gap.total, "ratio": gap.ratio() }),
        );
    }

    fn strategy_selected(&mut self, mart: &str, strategy: LoadStrategy, gap: &GapReport) {
        self.record(
            "strategy_selected",
            mart,
            json!({ "strategy": strategy, "ratio": gap.ratio() }),
        );
    }

    fn mart_refreshed(&mut self, report: &RefreshReport) {
        let data = serde_json::to_value(report).unwrap_or_else(|_| json!({}));
        self.record("mart_refreshed", &report.mart, data);
    }

    fn balance_corrected(&mut self, report: &BalanceReport) {
        self.record(
            "balance_corrected",
            &report.series,
            json!({ "forward": report.forward_fixed, "backward": report.backward_fixed }),
        );
    }

    fn step_failed(&mut self, err: &MartError) {
        let step = err.step().map(|s| s.as_str()).unwrap_or("config");
        self.record("step_failed", step, json!({ "error": err.to_string() }));
    }
}

// ============================================================================
// FANOUT
// ============================================================================

/// Forwards every notification to each attached observer in order
pub struct Fanout<'a> {
    observers: Vec<&'a mut dyn Observer>,
}

impl<'a> Fanout<'a> {
    pub fn new(observers: Vec<&'a mut dyn Observer>) -> Self {
        Fanout { observers }
    }
}

impl Observer for Fanout<'_> {
    fn raw_loaded(&mut self, report: &LoadReport) {
        for o in self.observers.iter_mut() {
            o.raw_loaded(report);
        }
    }

    fn duplicates_found(&mut self, table: &str, groups: &[DuplicateGroup]) {
        for o in self.observers.iter_mut() {
            o.duplicates_found(table, groups);
        }
    }

    fn duplicates_removed(&mut self, report: &DedupReport) {
        for o in self.observers.iter_mut() {
            o.duplicates_removed(report);
        }
    }

    fn gap_measured(&mut self, mart: &str, gap: &GapReport) {
        for o in self.observers.iter_mut() {
            o.gap_measured(mart, gap);
        }
    }

    fn strategy_selected(&mut self, mart: &str, strategy: LoadStrategy, gap: &GapReport) {
        for o in self.observers.iter_mut() {
            o.strategy_selected(mart, strategy, gap);
        }
    }

    fn mart_refreshed(&mut self, report: &RefreshReport) {
        for o in self.observers.iter_mut() {
            o.mart_refreshed(report);
        }
    }

    fn balance_corrected(&mut self, report: &BalanceReport) {
        for o in self.observers.iter_mut() {
            o.balance_corrected(report);
        }
    }

    fn step_failed(&mut self, err: &MartError) {
        for o in self.observers.iter_mut() {
            o.step_failed(err);
        }
    }
}
