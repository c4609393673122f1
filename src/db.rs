use crate::error::{MartError, Result, Step};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::path::Path;

// ============================================================================
// SESSION
// ============================================================================

/// One store session per run. Every component receives it by parameter;
/// dropping it (or calling `close`) releases the connection on every exit path.
pub struct Session {
    conn: Connection,
}

impl Session {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(MartError::store(Step::Schema))?;
        // WAL for crash recovery on file-backed stores
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(MartError::store(Step::Schema))?;
        Ok(Session { conn })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(MartError::store(Step::Schema))?;
        Ok(Session { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Begin the single transaction a logical step runs in
    pub fn begin(&mut self, step: Step) -> Result<Transaction<'_>> {
        self.conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(MartError::store(step))
    }

    /// Release the connection, surfacing any close failure
    pub fn close(self) -> Result<()> {
        self.conn
            .close()
            .map_err(|(_, e)| MartError::store(Step::Schema)(e))
    }
}

// ============================================================================
// SCHEMA
// ============================================================================

pub fn setup_database(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        -- Raw layer
        CREATE TABLE IF NOT EXISTS rd_deal (
            deal_rk INTEGER NOT NULL,
            deal_num TEXT,
            deal_name TEXT,
            deal_sum REAL,
            client_rk INTEGER,
            agreement_rk INTEGER,
            deal_start_date TEXT,
            department_rk INTEGER,
            product_rk INTEGER,
            deal_type_cd TEXT,
            effective_from_date TEXT NOT NULL,
            effective_to_date TEXT,
            account_rk INTEGER,
            PRIMARY KEY (deal_rk, effective_from_date)
        );

        CREATE TABLE IF NOT EXISTS rd_product (
            product_rk INTEGER NOT NULL,
            product_name TEXT,
            effective_from_date TEXT NOT NULL,
            effective_to_date TEXT,
            PRIMARY KEY (product_rk, effective_from_date)
        );

        CREATE TABLE IF NOT EXISTS rd_loan_holiday (
            deal_rk INTEGER NOT NULL,
            loan_holiday_type_cd TEXT,
            loan_holiday_start_date TEXT,
            loan_holiday_finish_date TEXT,
            loan_holiday_fact_finish_date TEXT,
            loan_holiday_finish_flg INTEGER,
            loan_holiday_last_possible_date TEXT,
            effective_from_date TEXT NOT NULL,
            effective_to_date TEXT
        );

        CREATE TABLE IF NOT EXISTS rd_account (
            account_rk INTEGER PRIMARY KEY,
            account_number TEXT,
            client_id INTEGER,
            currency_cd TEXT,
            department_rk INTEGER
        );

        CREATE TABLE IF NOT EXISTS rd_account_balance (
            account_rk INTEGER NOT NULL,
            effective_date TEXT NOT NULL,
            account_in_sum REAL,
            account_out_sum REAL,
            PRIMARY KEY (account_rk, effective_date)
        );

        -- Mart layer
        CREATE TABLE IF NOT EXISTS dm_dict_currency (
            currency_cd TEXT NOT NULL,
            currency_name TEXT,
            effective_from_date TEXT NOT NULL,
            effective_to_date TEXT
        );

        CREATE TABLE IF NOT EXISTS dm_client (
            client_rk INTEGER NOT NULL,
            effective_from_date TEXT NOT NULL,
            effective_to_date TEXT,
            account_rk INTEGER,
            address_rk INTEGER,
            department_rk INTEGER,
            card_type_code TEXT,
            client_id INTEGER,
            counterparty_type_cd TEXT,
            black_list_flag INTEGER,
            client_open_dttm TEXT,
            bankruptcy_rk INTEGER
        );

        CREATE TABLE IF NOT EXISTS dm_loan_holiday_info (
            deal_rk INTEGER NOT NULL,
            effective_from_date TEXT NOT NULL,
            effective_to_date TEXT,
            agreement_rk INTEGER,
            client_rk INTEGER,
            department_rk INTEGER,
            product_rk INTEGER,
            product_name TEXT,
            deal_type_cd TEXT,
            deal_start_date TEXT,
            deal_name TEXT,
            deal_number TEXT,
            deal_sum REAL,
            loan_holiday_type_cd TEXT,
            loan_holiday_start_date TEXT,
            loan_holiday_finish_date TEXT,
            loan_holiday_fact_finish_date TEXT,
            loan_holiday_finish_flg INTEGER,
            loan_holiday_last_possible_date TEXT
        );

        CREATE TABLE IF NOT EXISTS dm_account_balance_turnover (
            account_rk INTEGER NOT NULL,
            currency_name TEXT,
            department_rk INTEGER,
            effective_date TEXT NOT NULL,
            account_in_sum REAL,
            account_out_sum REAL
        );

        -- Audit trail
        CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            run_id TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            subject TEXT NOT NULL,
            data TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );

        CREATE INDEX IF NOT EXISTS idx_client_version ON dm_client(client_rk, effective_from_date);
        CREATE INDEX IF NOT EXISTS idx_lhi_key ON dm_loan_holiday_info(deal_rk, effective_from_date);
        CREATE INDEX IF NOT EXISTS idx_abt_key ON dm_account_balance_turnover(account_rk, effective_date);
        CREATE INDEX IF NOT EXISTS idx_loan_holiday_deal ON rd_loan_holiday(deal_rk);
        CREATE INDEX IF NOT EXISTS idx_events_run ON events(run_id);
        ",
    )
    .map_err(MartError::store(Step::Schema))
}

pub fn count_rows(conn: &Connection, table: &str) -> rusqlite::Result<i64> {
    conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
}

// ============================================================================
// AUDIT EVENTS
// ============================================================================

/// Audit trail entry: one per reported outcome of a run
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    /// Table, mart or series the event is about
    pub subject: String,
    pub data: serde_json::Value,
}

impl Event {
    pub fn new(run_id: &str, event_type: &str, subject: &str, data: serde_json::Value) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            subject: subject.to_string(),
            data,
        }
    }
}

pub fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    let data_json = serde_json::to_string(&event.data)
        .map_err(|e| MartError::store(Step::Audit)(rusqlite::Error::ToSqlConversionFailure(e.into())))?;

    conn.execute(
        "INSERT INTO events (event_id, run_id, timestamp, event_type, subject, data)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            event.event_id,
            event.run_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.subject,
            data_json,
        ],
    )
    .map_err(MartError::store(Step::Audit))?;

    Ok(())
}

pub fn get_events_for_run(conn: &Connection, run_id: &str) -> Result<Vec<Event>> {
    let mut stmt = conn
        .prepare(
            "SELECT event_id, run_id, timestamp, event_type, subject, data
             FROM events
             WHERE run_id = ?1
             ORDER BY id",
        )
        .map_err(MartError::store(Step::Audit))?;

    let events = stmt
        .query_map(params![run_id], |row| {
            let timestamp_str: String = row.get(2)?;
            let data_json: String = row.get(5)?;

            Ok(Event {
                event_id: row.get(0)?,
                run_id: row.get(1)?,
                timestamp: DateTime::parse_from_rfc3339(&timestamp_str)
                    .map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, e.into())
                    })?
                    .with_timezone(&Utc),
                event_type: row.get(3)?,
                subject: row.get(4)?,
                data: serde_json::from_str(&data_json).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, e.into())
                })?,
            })
        })
        .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
        .map_err(MartError::store(Step::Audit))?;

    Ok(events)
}
