// ⚖️ Balance Reconciler - keep balance chains continuous
// Ensures closing_value(account, period) = opening_value(account, next period)
//
// Two passes, each a single set-based UPDATE in its own transaction:
//   forward:  opening := previous period's closing
//   backward: closing := next period's opening
//
// A NULL on either side of a pair is never corrected. Each pass runs once; a
// break whose repair creates a new break further along the chain is not
// chased. `find_breaks` reports whatever is left.

use crate::db::Session;
use crate::error::{MartError, Result, Step};
use crate::temporal::value_to_text;
use rusqlite::types::Value;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

// ============================================================================
// SERIES
// ============================================================================

/// Which rows count as neighbours
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodAdjacency {
    /// Previous/next row of the same account ordered by period, gaps allowed
    OrderedSeries,

    /// Only periods exactly one calendar day apart
    CalendarDay,
}

/// A table holding one opening/closing pair per (account, period)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceSeries {
    pub table: &'static str,
    pub account_column: &'static str,
    pub period_column: &'static str,
    pub opening_column: &'static str,
    pub closing_column: &'static str,
}

impl BalanceSeries {
    /// Daily balances of the raw layer
    pub fn account_balance() -> Self {
        BalanceSeries {
            table: "rd_account_balance",
            account_column: "account_rk",
            period_column: "effective_date",
            opening_column: "account_in_sum",
            closing_column: "account_out_sum",
        }
    }
}

// ============================================================================
// REPORTS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceReport {
    pub series: String,
    pub forward_fixed: usize,
    pub backward_fixed: usize,
}

impl BalanceReport {
    pub fn total_fixed(&self) -> usize {
        self.forward_fixed + self.backward_fixed
    }
}

/// Adjacent periods whose values disagree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainBreak {
    pub account_key: String,
    pub period: String,
    pub closing_value: Option<f64>,
    pub next_period: String,
    pub next_opening_value: Option<f64>,
}

// ============================================================================
// RECONCILER
// ============================================================================

pub struct BalanceReconciler {
    pub adjacency: PeriodAdjacency,
}

impl BalanceReconciler {
    pub fn new(adjacency: PeriodAdjacency) -> Self {
        BalanceReconciler { adjacency }
    }

    /// Overwrite opening values that disagree with the previous closing value
    pub fn forward_pass(&self, session: &mut Session, series: &BalanceSeries) -> Result<usize> {
        let sql = self.repair_sql(series, Direction::Forward);
        self.run_pass(session, &sql, Step::ForwardPass)
    }

    /// Overwrite closing values that disagree with the next opening value
    pub fn backward_pass(&self, session: &mut Session, series: &BalanceSeries) -> Result<usize> {
        let sql = self.repair_sql(series, Direction::Backward);
        self.run_pass(session, &sql, Step::BackwardPass)
    }

    /// Forward then backward, once each
    pub fn reconcile(&self, session: &mut Session, series: &BalanceSeries) -> Result<BalanceReport> {
        let forward_fixed = self.forward_pass(session, series)?;
        let backward_fixed = self.backward_pass(session, series)?;

        Ok(BalanceReport {
            series: series.table.to_string(),
            forward_fixed,
            backward_fixed,
        })
    }

    /// Read-only listing of every remaining break. A pair with a NULL on one
    /// side is listed too, although neither pass ever repairs it.
    pub fn find_breaks(&self, conn: &Connection, series: &BalanceSeries) -> Result<Vec<ChainBreak>> {
        let sql = format!(
            "WITH neighbours AS (
                SELECT {account} AS account_key,
                       {period} AS period,
                       {closing} AS closing_value,
                       LEAD({period}) OVER w AS next_period,
                       LEAD({opening}) OVER w AS next_opening_value
                FROM {table}
                WINDOW w AS (PARTITION BY {account} ORDER BY {period})
            )
            SELECT account_key, period, closing_value, next_period, next_opening_value
            FROM neighbours
            WHERE next_period IS NOT NULL
              AND closing_value IS NOT next_opening_value{adjacent}
            ORDER BY account_key, period",
            account = series.account_column,
            period = series.period_column,
            opening = series.opening_column,
            closing = series.closing_column,
            table = series.table,
            adjacent = self.adjacency_filter("next_period = date(period, '+1 day')"),
        );

        let mut stmt = conn.prepare(&sql).map_err(MartError::store(Step::Verification))?;
        let breaks = stmt
            .query_map([], |row| {
                Ok(ChainBreak {
                    account_key: value_to_text(row.get::<_, Value>(0)?).unwrap_or_default(),
                    period: value_to_text(row.get::<_, Value>(1)?).unwrap_or_default(),
                    closing_value: row.get(2)?,
                    next_period: value_to_text(row.get::<_, Value>(3)?).unwrap_or_default(),
                    next_opening_value: row.get(4)?,
                })
            })
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(MartError::store(Step::Verification))?;

        Ok(breaks)
    }

    fn run_pass(&self, session: &mut Session, sql: &str, step: Step) -> Result<usize> {
        let tx = session.begin(step)?;
        let fixed = tx.execute(sql, []).map_err(MartError::store(step))?;
        tx.commit().map_err(MartError::store(step))?;
        Ok(fixed)
    }

    fn adjacency_filter(&self, calendar_condition: &str) -> String {
        match self.adjacency {
            PeriodAdjacency::OrderedSeries => String::new(),
            PeriodAdjacency::CalendarDay => format!(" AND {}", calendar_condition),
        }
    }

    fn repair_sql(&self, series: &BalanceSeries, direction: Direction) -> String {
        // Forward reads the previous row's closing into opening; backward the
        // next row's opening into closing.
        let (window_fn, read, write, day_shift) = match direction {
            Direction::Forward => ("LAG", series.closing_column, series.opening_column, "-1 day"),
            Direction::Backward => ("LEAD", series.opening_column, series.closing_column, "+1 day"),
        };

        format!(
            "WITH neighbours AS MATERIALIZED (
                SELECT rowid AS rid,
                       {period} AS period,
                       {write} AS current_value,
                       {window_fn}({read}) OVER w AS neighbour_value,
                       {window_fn}({period}) OVER w AS neighbour_period
                FROM {table}
                WINDOW w AS (PARTITION BY {account} ORDER BY {period})
            )
            UPDATE {table}
            SET {write} = n.neighbour_value
            FROM neighbours n
            WHERE {table}.rowid = n.rid
              AND n.current_value <> n.neighbour_value{adjacent}",
            period = series.period_column,
            account = series.account_column,
            table = series.table,
            adjacent = self.adjacency_filter(&format!(
                "n.neighbour_period = date(n.period, '{}')",
                day_shift
            )),
        )
    }
}

impl Default for BalanceReconciler {
    fn default() -> Self {
        Self::new(PeriodAdjacency::OrderedSeries)
    }
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Forward,
    Backward,
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::setup_database;

    fn create_test_session(rows: &[(i64, &str, Option<f64>, Option<f64>)]) -> Session {
        let session = Session::in_memory().unwrap();
        setup_database(session.conn()).unwrap();
        for (account, date, opening, closing) in rows {
            session
                .conn()
                .execute(
                    "INSERT INTO rd_account_balance VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![account, date, opening, closing],
                )
                .unwrap();
        }
        session
    }

    fn balances(session: &Session) -> Vec<(i64, String, Option<f64>, Option<f64>)> {
        session
            .conn()
            .prepare(
                "SELECT account_rk, effective_date, account_in_sum, account_out_sum
                 FROM rd_account_balance ORDER BY account_rk, effective_date",
            )
            .unwrap()
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap()
    }

    #[test]
    fn test_forward_pass_copies_previous_closing() {
        let mut session = create_test_session(&[
            (1, "2023-01-01", Some(0.0), Some(100.0)),
            (1, "2023-01-02", Some(90.0), Some(150.0)),
        ]);

        let fixed = BalanceReconciler::default()
            .forward_pass(&mut session, &BalanceSeries::account_balance())
            .unwrap();

        assert_eq!(fixed, 1);
        let rows = balances(&session);
        assert_eq!(rows[0], (1, "2023-01-01".to_string(), Some(0.0), Some(100.0)));
        assert_eq!(rows[1], (1, "2023-01-02".to_string(), Some(100.0), Some(150.0)));
    }

    #[test]
    fn test_consistent_chain_untouched() {
        let mut session = create_test_session(&[
            (1, "2023-01-01", Some(0.0), Some(100.0)),
            (1, "2023-01-02", Some(100.0), Some(150.0)),
            (1, "2023-01-03", Some(150.0), Some(120.0)),
        ]);
        let before = balances(&session);

        let report = BalanceReconciler::default()
            .reconcile(&mut session, &BalanceSeries::account_balance())
            .unwrap();

        assert_eq!(report.total_fixed(), 0);
        assert_eq!(balances(&session), before);
    }

    #[test]
    fn test_lone_period_untouched() {
        let mut session = create_test_session(&[(1, "2023-01-01", Some(5.0), Some(100.0))]);

        let report = BalanceReconciler::default()
            .reconcile(&mut session, &BalanceSeries::account_balance())
            .unwrap();

        assert_eq!(report.total_fixed(), 0);
        assert_eq!(balances(&session)[0].2, Some(5.0));
    }

    #[test]
    fn test_accounts_are_separate_chains() {
        let mut session = create_test_session(&[
            (1, "2023-01-01", Some(0.0), Some(100.0)),
            (2, "2023-01-02", Some(50.0), Some(60.0)),
        ]);

        let report = BalanceReconciler::default()
            .reconcile(&mut session, &BalanceSeries::account_balance())
            .unwrap();

        assert_eq!(report.total_fixed(), 0);
    }

    #[test]
    fn test_gap_in_series_depends_on_adjacency() {
        let rows = [
            (1, "2023-01-01", Some(0.0), Some(100.0)),
            (1, "2023-01-03", Some(90.0), Some(150.0)),
        ];
        let series = BalanceSeries::account_balance();

        let mut calendar = create_test_session(&rows);
        let reconciler = BalanceReconciler::new(PeriodAdjacency::CalendarDay);
        assert_eq!(reconciler.forward_pass(&mut calendar, &series).unwrap(), 0);
        assert!(reconciler.find_breaks(calendar.conn(), &series).unwrap().is_empty());
        assert_eq!(balances(&calendar)[1].2, Some(90.0));

        let mut ordered = create_test_session(&rows);
        let reconciler = BalanceReconciler::new(PeriodAdjacency::OrderedSeries);
        assert_eq!(reconciler.find_breaks(ordered.conn(), &series).unwrap().len(), 1);
        assert_eq!(reconciler.forward_pass(&mut ordered, &series).unwrap(), 1);
        assert_eq!(balances(&ordered)[1].2, Some(100.0));
    }

    #[test]
    fn test_calendar_day_repairs_consecutive_days() {
        let mut session = create_test_session(&[
            (1, "2023-01-31", Some(0.0), Some(100.0)),
            (1, "2023-02-01", Some(90.0), Some(150.0)),
        ]);

        let fixed = BalanceReconciler::new(PeriodAdjacency::CalendarDay)
            .forward_pass(&mut session, &BalanceSeries::account_balance())
            .unwrap();

        assert_eq!(fixed, 1);
        assert_eq!(balances(&session)[1].2, Some(100.0));
    }

    #[test]
    fn test_backward_pass_copies_next_opening() {
        let mut session = create_test_session(&[
            (1, "2023-01-01", Some(0.0), Some(80.0)),
            (1, "2023-01-02", Some(100.0), Some(150.0)),
        ]);

        let fixed = BalanceReconciler::default()
            .backward_pass(&mut session, &BalanceSeries::account_balance())
            .unwrap();

        assert_eq!(fixed, 1);
        let rows = balances(&session);
        assert_eq!(rows[0].3, Some(100.0));
        assert_eq!(rows[1], (1, "2023-01-02".to_string(), Some(100.0), Some(150.0)));
    }

    #[test]
    fn test_null_values_are_never_corrected() {
        let mut session = create_test_session(&[
            // NULL opening after a known closing
            (1, "2023-01-01", Some(0.0), Some(100.0)),
            (1, "2023-01-02", None, Some(150.0)),
            // NULL closing before a known opening
            (2, "2023-01-01", Some(0.0), None),
            (2, "2023-01-02", Some(70.0), Some(80.0)),
        ]);
        let before = balances(&session);

        let report = BalanceReconciler::default()
            .reconcile(&mut session, &BalanceSeries::account_balance())
            .unwrap();

        assert_eq!(report.forward_fixed, 0);
        assert_eq!(report.backward_fixed, 0);
        assert_eq!(balances(&session), before);

        // Still reported, since the chain is not continuous
        let breaks = BalanceReconciler::default()
            .find_breaks(session.conn(), &BalanceSeries::account_balance())
            .unwrap();
        assert_eq!(breaks.len(), 2);
        assert_eq!(breaks[0].next_opening_value, None);
        assert_eq!(breaks[1].closing_value, None);
    }

    #[test]
    fn test_find_breaks_lists_pairs() {
        let session = create_test_session(&[
            (1, "2023-01-01", Some(0.0), Some(100.0)),
            (1, "2023-01-02", Some(90.0), Some(150.0)),
            (1, "2023-01-03", Some(150.0), Some(10.0)),
            (2, "2023-01-01", Some(0.0), Some(5.0)),
            (2, "2023-01-02", Some(6.0), Some(7.0)),
        ]);

        let breaks = BalanceReconciler::default()
            .find_breaks(session.conn(), &BalanceSeries::account_balance())
            .unwrap();

        assert_eq!(breaks.len(), 2);
        assert_eq!(
            breaks[0],
            ChainBreak {
                account_key: "1".to_string(),
                period: "2023-01-01".to_string(),
                closing_value: Some(100.0),
                next_period: "2023-01-02".to_string(),
                next_opening_value: Some(90.0),
            }
        );
        assert_eq!(breaks[1].account_key, "2");
    }

    #[test]
    fn test_missing_table_reports_forward_step() {
        let mut session = Session::in_memory().unwrap();

        let err = BalanceReconciler::default()
            .reconcile(&mut session, &BalanceSeries::account_balance())
            .unwrap_err();

        assert_eq!(err.step(), Some(Step::ForwardPass));
    }
}
