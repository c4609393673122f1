// 🔄 Mart Refresher - bring a mart back in line with its source relation
// Full reload replaces the mart wholesale; partial reload only inserts source
// rows whose key is absent and never touches rows already there. Each refresh
// is one transaction, so a failure leaves the mart exactly as it was.

use crate::db::Session;
use crate::error::{MartError, Result, Step};
use crate::gap::analyze_gap;
use crate::relation::MartDefinition;
use crate::strategy::LoadStrategy;
use rusqlite::types::Value;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ============================================================================
// OPTIONS & REPORT
// ============================================================================

/// What a `PartialReload` decision actually does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialReloadMode {
    /// Insert only the missing rows; existing rows are never overwritten
    Incremental,

    /// Rebuild the whole mart whenever anything is missing
    FullFallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshReport {
    pub mart: String,
    pub requested: LoadStrategy,
    /// Strategy executed after applying the partial reload mode
    pub applied: LoadStrategy,
    pub deleted: usize,
    pub inserted: usize,
    pub verified: bool,
}

// ============================================================================
// REFRESHER
// ============================================================================

pub struct MartRefresher {
    pub partial_mode: PartialReloadMode,
    /// Check post-conditions before committing
    pub verify: bool,
}

impl MartRefresher {
    pub fn new(partial_mode: PartialReloadMode, verify: bool) -> Self {
        MartRefresher {
            partial_mode,
            verify,
        }
    }

    pub fn refresh(
        &self,
        session: &mut Session,
        mart: &MartDefinition,
        strategy: LoadStrategy,
    ) -> Result<RefreshReport> {
        let applied = match (strategy, self.partial_mode) {
            (LoadStrategy::PartialReload, PartialReloadMode::FullFallback) => {
                if analyze_gap(session.conn(), mart)?.is_in_sync() {
                    LoadStrategy::NoAction
                } else {
                    LoadStrategy::FullReload
                }
            }
            (other, _) => other,
        };

        let mut report = RefreshReport {
            mart: mart.name.to_string(),
            requested: strategy,
            applied,
            deleted: 0,
            inserted: 0,
            verified: false,
        };

        match applied {
            LoadStrategy::NoAction => {}
            LoadStrategy::FullReload => {
                let (deleted, inserted) = self.full_reload(session, mart)?;
                report.deleted = deleted;
                report.inserted = inserted;
                report.verified = self.verify;
            }
            LoadStrategy::PartialReload => {
                report.inserted = self.insert_missing(session, mart)?;
                report.verified = self.verify;
            }
        }

        Ok(report)
    }

    /// Delete everything and re-insert the full projection, atomically
    fn full_reload(&self, session: &mut Session, mart: &MartDefinition) -> Result<(usize, usize)> {
        let tx = session.begin(Step::Refresh)?;

        let deleted = tx
            .execute(&format!("DELETE FROM {}", mart.target), [])
            .map_err(MartError::store(Step::Refresh))?;

        let inserted = tx
            .execute(
                &format!(
                    "INSERT INTO {} ({}) {}",
                    mart.target,
                    mart.column_list(),
                    mart.source.to_sql()
                ),
                [],
            )
            .map_err(MartError::store(Step::Refresh))?;

        if self.verify {
            verify_full_reload(&tx, mart)?;
        }

        tx.commit().map_err(MartError::store(Step::Refresh))?;
        Ok((deleted, inserted))
    }

    /// Insert-if-absent for every source row missing from the mart
    fn insert_missing(&self, session: &mut Session, mart: &MartDefinition) -> Result<usize> {
        let tx = session.begin(Step::Refresh)?;

        let inserted = tx
            .execute(
                &format!(
                    "INSERT INTO {} ({}) {}",
                    mart.target,
                    mart.column_list(),
                    mart.missing_rows_sql()
                ),
                [],
            )
            .map_err(MartError::store(Step::Refresh))?;

        if self.verify {
            let gap = analyze_gap(&tx, mart)?;
            if !gap.is_in_sync() {
                return Err(MartError::InvariantViolation {
                    step: Step::Verification,
                    detail: format!("{} still misses {} row(s) after partial reload", mart.name, gap.missing),
                });
            }
        }

        tx.commit().map_err(MartError::store(Step::Refresh))?;
        Ok(inserted)
    }
}

impl Default for MartRefresher {
    fn default() -> Self {
        Self::new(PartialReloadMode::Incremental, false)
    }
}

// ============================================================================
// VERIFICATION
// ============================================================================

/// SHA-256 over every row of `relation_sql`, ordered by all columns
pub fn fingerprint(conn: &Connection, relation_sql: &str, columns: &[&str]) -> Result<String> {
    let order: Vec<String> = (1..=columns.len()).map(|i| i.to_string()).collect();
    let sql = format!(
        "SELECT {} FROM ({}) ORDER BY {}",
        columns.join(", "),
        relation_sql,
        order.join(", ")
    );

    let mut stmt = conn.prepare(&sql).map_err(MartError::store(Step::Verification))?;
    let mut rows = stmt.query([]).map_err(MartError::store(Step::Verification))?;
    let mut hasher = Sha256::new();

    while let Some(row) = rows.next().map_err(MartError::store(Step::Verification))? {
        for idx in 0..columns.len() {
            let value: Value = row.get(idx).map_err(MartError::store(Step::Verification))?;
            match value {
                Value::Null => hasher.update(b"N;"),
                Value::Integer(i) => hasher.update(format!("I{};", i)),
                Value::Real(r) => hasher.update(format!("R{};", r)),
                Value::Text(t) => hasher.update(format!("T{}:{};", t.len(), t)),
                Value::Blob(b) => {
                    hasher.update(format!("B{}:", b.len()));
                    hasher.update(&b);
                }
            }
        }
        hasher.update(b"\n");
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// The mart must now be exactly the projection of its source
pub fn verify_full_reload(conn: &Connection, mart: &MartDefinition) -> Result<()> {
    let columns = mart.source.column_names();
    let source = fingerprint(conn, &mart.source.to_sql(), &columns)?;
    let target = fingerprint(conn, &format!("SELECT * FROM {}", mart.target), &columns)?;

    if source != target {
        return Err(MartError::InvariantViolation {
            step: Step::Verification,
            detail: format!(
                "{} differs from its source after full reload ({} != {})",
                mart.target,
                &target[..12],
                &source[..12]
            ),
        });
    }

    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{count_rows, setup_database};
    use crate::relation::{
        account_balance_turnover, loan_holiday_info, Expr, Projection, SourceRelation,
    };

    fn session() -> Session {
        let session = Session::in_memory().unwrap();
        setup_database(session.conn()).unwrap();
        session
            .conn()
            .execute_batch(
                "INSERT INTO rd_product VALUES (1, 'Mortgage', '2020-01-01', NULL);
                 INSERT INTO rd_deal (deal_rk, deal_num, deal_name, deal_sum, product_rk, effective_from_date)
                     VALUES (1, 'N-1', 'first', 100.0, 1, '2023-01-01');
                 INSERT INTO rd_deal (deal_rk, deal_num, deal_name, deal_sum, product_rk, effective_from_date)
                     VALUES (2, 'N-2', 'second', 200.0, 1, '2023-01-01');
                 INSERT INTO rd_deal (deal_rk, deal_num, deal_name, deal_sum, product_rk, effective_from_date)
                     VALUES (3, 'N-3', 'third', 300.0, 1, '2023-01-01');
                 INSERT INTO rd_loan_holiday (deal_rk, loan_holiday_type_cd, effective_from_date)
                     VALUES (2, 'COVID', '2023-01-01');",
            )
            .unwrap();
        session
    }

    fn mart_rows(session: &Session) -> Vec<(i64, Option<String>, Option<String>, Option<f64>)> {
        session
            .conn()
            .prepare(
                "SELECT deal_rk, deal_name, product_name, deal_sum FROM dm_loan_holiday_info ORDER BY deal_rk",
            )
            .unwrap()
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap()
    }

    #[test]
    fn test_full_reload_replaces_everything() {
        let mut session = session();
        session
            .conn()
            .execute_batch(
                "INSERT INTO dm_loan_holiday_info (deal_rk, effective_from_date, deal_name) VALUES (1, '2023-01-01', 'stale');
                 INSERT INTO dm_loan_holiday_info (deal_rk, effective_from_date, deal_name) VALUES (42, '2023-01-01', 'orphan');",
            )
            .unwrap();

        let report = MartRefresher::new(PartialReloadMode::Incremental, true)
            .refresh(&mut session, &loan_holiday_info(), LoadStrategy::FullReload)
            .unwrap();

        assert_eq!(report.deleted, 2);
        assert_eq!(report.inserted, 3);
        assert!(report.verified);

        let rows = mart_rows(&session);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], (1, Some("first".to_string()), Some("Mortgage".to_string()), Some(100.0)));
        assert!(rows.iter().all(|r| r.0 != 42));

        let holiday: Option<String> = session
            .conn()
            .query_row(
                "SELECT loan_holiday_type_cd FROM dm_loan_holiday_info WHERE deal_rk = 2",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(holiday, Some("COVID".to_string()));
    }

    #[test]
    fn test_full_reload_matches_source_fingerprint() {
        let mut session = session();
        let mart = loan_holiday_info();

        MartRefresher::default()
            .refresh(&mut session, &mart, LoadStrategy::FullReload)
            .unwrap();

        verify_full_reload(session.conn(), &mart).unwrap();
        assert_eq!(analyze_gap(session.conn(), &mart).unwrap().missing, 0);
    }

    #[test]
    fn test_partial_reload_never_overwrites() {
        let mut session = session();
        session
            .conn()
            .execute(
                "INSERT INTO dm_loan_holiday_info (deal_rk, effective_from_date, deal_name, deal_sum)
                 VALUES (1, '2023-01-01', 'hand-edited', 1.0)",
                [],
            )
            .unwrap();

        let report = MartRefresher::default()
            .refresh(&mut session, &loan_holiday_info(), LoadStrategy::PartialReload)
            .unwrap();

        assert_eq!(report.applied, LoadStrategy::PartialReload);
        assert_eq!(report.deleted, 0);
        assert_eq!(report.inserted, 2);

        let rows = mart_rows(&session);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], (1, Some("hand-edited".to_string()), None, Some(1.0)));
        assert_eq!(rows[1].1, Some("second".to_string()));
        assert_eq!(rows[2].1, Some("third".to_string()));
    }

    #[test]
    fn test_partial_reload_with_full_fallback_rebuilds() {
        let mut session = session();
        session
            .conn()
            .execute(
                "INSERT INTO dm_loan_holiday_info (deal_rk, effective_from_date, deal_name)
                 VALUES (1, '2023-01-01', 'hand-edited')",
                [],
            )
            .unwrap();

        let report = MartRefresher::new(PartialReloadMode::FullFallback, false)
            .refresh(&mut session, &loan_holiday_info(), LoadStrategy::PartialReload)
            .unwrap();

        assert_eq!(report.requested, LoadStrategy::PartialReload);
        assert_eq!(report.applied, LoadStrategy::FullReload);
        assert_eq!(mart_rows(&session)[0].1, Some("first".to_string()));
    }

    #[test]
    fn test_full_fallback_skips_when_in_sync() {
        let mut session = session();
        let mart = loan_holiday_info();
        MartRefresher::default()
            .refresh(&mut session, &mart, LoadStrategy::FullReload)
            .unwrap();

        let report = MartRefresher::new(PartialReloadMode::FullFallback, false)
            .refresh(&mut session, &mart, LoadStrategy::PartialReload)
            .unwrap();

        assert_eq!(report.applied, LoadStrategy::NoAction);
        assert_eq!(report.inserted, 0);
    }

    #[test]
    fn test_no_action_touches_nothing() {
        let mut session = session();
        let report = MartRefresher::default()
            .refresh(&mut session, &loan_holiday_info(), LoadStrategy::NoAction)
            .unwrap();

        assert_eq!(report.inserted, 0);
        assert_eq!(count_rows(session.conn(), "dm_loan_holiday_info").unwrap(), 0);
    }

    #[test]
    fn test_source_tables_untouched() {
        let mut session = session();
        let before = fingerprint(session.conn(), "SELECT * FROM rd_deal", &["deal_rk", "deal_name", "deal_sum"]).unwrap();

        let refresher = MartRefresher::default();
        refresher
            .refresh(&mut session, &loan_holiday_info(), LoadStrategy::FullReload)
            .unwrap();
        refresher
            .refresh(&mut session, &loan_holiday_info(), LoadStrategy::PartialReload)
            .unwrap();

        let after = fingerprint(session.conn(), "SELECT * FROM rd_deal", &["deal_rk", "deal_name", "deal_sum"]).unwrap();
        assert_eq!(before, after);
        assert_eq!(count_rows(session.conn(), "rd_deal").unwrap(), 3);
    }

    #[test]
    fn test_failed_full_reload_leaves_mart_unchanged() {
        let mut session = session();
        session
            .conn()
            .execute(
                "INSERT INTO dm_loan_holiday_info (deal_rk, effective_from_date, deal_name)
                 VALUES (7, '2023-01-01', 'keep me')",
                [],
            )
            .unwrap();

        // Source referencing a table that does not exist fails after the DELETE
        let mut broken = loan_holiday_info();
        broken.source.joins[0].table = "rd_missing_table";

        let err = MartRefresher::default()
            .refresh(&mut session, &broken, LoadStrategy::FullReload)
            .unwrap_err();

        assert_eq!(err.step(), Some(Step::Refresh));
        assert_eq!(mart_rows(&session), vec![(7, Some("keep me".to_string()), None, None)]);
    }

    /// Source text lands in an INTEGER mart column and changes type on the way
    fn create_test_affinity_mart(session: &Session) -> MartDefinition {
        session
            .conn()
            .execute_batch(
                "CREATE TABLE rd_code (code_rk INTEGER, code_value TEXT);
                 CREATE TABLE dm_code (code_rk INTEGER, code_value INTEGER);
                 INSERT INTO rd_code VALUES (1, '42'), (2, '43');
                 INSERT INTO dm_code VALUES (9, 9);",
            )
            .unwrap();

        MartDefinition {
            name: "code",
            target: "dm_code",
            key: &["code_rk"],
            source: SourceRelation {
                table: "rd_code",
                alias: "c",
                joins: vec![],
                projection: vec![
                    Projection {
                        name: "code_rk",
                        expr: Expr::Column("c.code_rk"),
                    },
                    Projection {
                        name: "code_value",
                        expr: Expr::Column("c.code_value"),
                    },
                ],
                filters: vec![],
            },
        }
    }

    fn code_rows(session: &Session) -> Vec<(i64, i64)> {
        session
            .conn()
            .prepare("SELECT code_rk, code_value FROM dm_code ORDER BY code_rk")
            .unwrap()
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap()
    }

    #[test]
    fn test_fingerprint_mismatch_rolls_back_full_reload() {
        let mut session = Session::in_memory().unwrap();
        let mart = create_test_affinity_mart(&session);

        let err = MartRefresher::new(PartialReloadMode::Incremental, true)
            .refresh(&mut session, &mart, LoadStrategy::FullReload)
            .unwrap_err();

        assert!(matches!(
            err,
            MartError::InvariantViolation {
                step: Step::Verification,
                ..
            }
        ));
        assert_eq!(code_rows(&session), vec![(9, 9)]);

        // Without verification the same reload goes through
        MartRefresher::new(PartialReloadMode::Incremental, false)
            .refresh(&mut session, &mart, LoadStrategy::FullReload)
            .unwrap();
        assert_eq!(code_rows(&session), vec![(1, 42), (2, 43)]);
    }

    #[test]
    fn test_partial_reload_that_leaves_gap_rolls_back() {
        let mut session = Session::in_memory().unwrap();
        let mart = create_test_affinity_mart(&session);
        session
            .conn()
            .execute_batch(
                "CREATE TRIGGER skip_code_two BEFORE INSERT ON dm_code
                 WHEN NEW.code_rk = 2
                 BEGIN SELECT RAISE(IGNORE); END;",
            )
            .unwrap();

        let err = MartRefresher::new(PartialReloadMode::Incremental, true)
            .refresh(&mut session, &mart, LoadStrategy::PartialReload)
            .unwrap_err();

        assert!(matches!(
            err,
            MartError::InvariantViolation {
                step: Step::Verification,
                ..
            }
        ));
        assert!(err.to_string().contains("still misses 1 row(s)"));
        // Code 1 was inserted inside the transaction and rolled back with it
        assert_eq!(code_rows(&session), vec![(9, 9)]);
    }

    #[test]
    fn test_fingerprint_is_order_independent() {
        let session = Session::in_memory().unwrap();
        session
            .conn()
            .execute_batch(
                "CREATE TABLE a (x INTEGER, y TEXT);
                 CREATE TABLE b (x INTEGER, y TEXT);
                 INSERT INTO a VALUES (1, 'one'), (2, NULL);
                 INSERT INTO b VALUES (2, NULL), (1, 'one');",
            )
            .unwrap();

        let fa = fingerprint(session.conn(), "SELECT * FROM a", &["x", "y"]).unwrap();
        let fb = fingerprint(session.conn(), "SELECT * FROM b", &["x", "y"]).unwrap();
        assert_eq!(fa, fb);
        assert_eq!(fa.len(), 64);

        session.conn().execute("UPDATE b SET y = 'uno' WHERE x = 1", []).unwrap();
        let fb = fingerprint(session.conn(), "SELECT * FROM b", &["x", "y"]).unwrap();
        assert_ne!(fa, fb);
    }

    #[test]
    fn test_balance_mart_full_reload_with_verify() {
        let mut session = session();
        session
            .conn()
            .execute_batch(
                "INSERT INTO rd_account VALUES (1, '40817', 10, '810', 5);
                 INSERT INTO dm_dict_currency VALUES ('810', 'RUB', '2020-01-01', '2030-12-31');
                 INSERT INTO rd_account_balance VALUES (1, '2023-01-01', 0, 50);
                 INSERT INTO rd_account_balance VALUES (1, '2023-01-02', 50, 70);",
            )
            .unwrap();

        let report = MartRefresher::new(PartialReloadMode::Incremental, true)
            .refresh(&mut session, &account_balance_turnover(), LoadStrategy::FullReload)
            .unwrap();

        assert_eq!(report.inserted, 2);
        let name: String = session
            .conn()
            .query_row(
                "SELECT DISTINCT currency_name FROM dm_account_balance_turnover",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(name, "RUB");
    }
}
