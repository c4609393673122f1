// ⏰ Temporal Key Model
// A slowly-changing record is identified by (entity_key, effective_from).
// When several rows claim the same identity, one canonical ordering decides
// which of them survives:
//
//   1. open-ended validity (effective_to IS NULL) first
//   2. then effective_to descending
//   3. then most recently loaded (highest load sequence / rowid)
//
// The ordering exists twice: as `canonical_cmp` for in-memory records and as
// `TemporalKey::sql_order_by` for window functions in the store. Both are
// built from the same rules and tested against each other.

use chrono::NaiveDate;
use rusqlite::types::Value;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

// ============================================================================
// TEMPORAL KEY
// ============================================================================

/// Column names carrying the temporal identity of a table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemporalKey {
    pub entity_column: &'static str,
    pub from_column: &'static str,
    pub to_column: &'static str,
}

impl TemporalKey {
    pub const fn new(
        entity_column: &'static str,
        from_column: &'static str,
        to_column: &'static str,
    ) -> Self {
        TemporalKey {
            entity_column,
            from_column,
            to_column,
        }
    }

    /// `ORDER BY` body ranking the canonical version first
    pub fn sql_order_by(&self) -> String {
        format!(
            "({to} IS NULL) DESC, {iso} DESC, rowid DESC",
            to = self.to_column,
            iso = sql_iso_date(self.to_column)
        )
    }
}

/// SQL expression rewriting the date formats `parse_date` accepts into
/// `YYYY-MM-DD`, so text comparison follows calendar order. Day and month
/// must be zero-padded.
fn sql_iso_date(column: &str) -> String {
    format!(
        "CASE \
         WHEN {c} LIKE '__.__.____%' THEN substr({c}, 7, 4) || '-' || substr({c}, 4, 2) || '-' || substr({c}, 1, 2) \
         WHEN {c} LIKE '__/__/____%' THEN substr({c}, 7, 4) || '-' || substr({c}, 1, 2) || '-' || substr({c}, 4, 2) \
         ELSE substr({c}, 1, 10) END",
        c = column
    )
}

// ============================================================================
// VERSIONED RECORD
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedRecord {
    pub entity_key: String,
    pub effective_from: NaiveDate,
    /// None = still valid
    pub effective_to: Option<NaiveDate>,
    /// Store rowid; higher means loaded later
    pub load_seq: i64,
    pub payload: BTreeMap<String, Option<String>>,
}

impl VersionedRecord {
    pub fn new(entity_key: &str, effective_from: NaiveDate, effective_to: Option<NaiveDate>) -> Self {
        VersionedRecord {
            entity_key: entity_key.to_string(),
            effective_from,
            effective_to,
            load_seq: 0,
            payload: BTreeMap::new(),
        }
    }

    pub fn identity(&self) -> (&str, NaiveDate) {
        (&self.entity_key, self.effective_from)
    }

    /// Same entity and same effective_from
    pub fn same_identity(&self, other: &VersionedRecord) -> bool {
        self.identity() == other.identity()
    }

    pub fn is_open_ended(&self) -> bool {
        self.effective_to.is_none()
    }

    /// Load every row of `table` as a versioned record
    pub fn load_all(
        conn: &Connection,
        table: &str,
        key: &TemporalKey,
    ) -> rusqlite::Result<Vec<VersionedRecord>> {
        let mut stmt = conn.prepare(&format!("SELECT rowid, * FROM {} ORDER BY rowid", table))?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();

        let rows = stmt.query_map([], |row| {
            let mut record = VersionedRecord::new("", NaiveDate::MIN, None);
            record.load_seq = row.get(0)?;

            for (idx, name) in columns.iter().enumerate().skip(1) {
                let text = value_to_text(row.get::<_, Value>(idx)?);

                if name == key.entity_column {
                    record.entity_key = text.unwrap_or_default();
                } else if name == key.from_column {
                    record.effective_from = text
                        .as_deref()
                        .and_then(parse_date)
                        .ok_or_else(|| bad_date(idx, name))?;
                } else if name == key.to_column {
                    record.effective_to = match text.as_deref() {
                        None => None,
                        Some(s) => Some(parse_date(s).ok_or_else(|| bad_date(idx, name))?),
                    };
                } else {
                    record.payload.insert(name.clone(), text);
                }
            }

            Ok(record)
        })?;

        rows.collect()
    }
}

/// The canonical ordering: the record that sorts first is the one kept
pub fn canonical_cmp(a: &VersionedRecord, b: &VersionedRecord) -> Ordering {
    let by_validity_end = match (a.effective_to, b.effective_to) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => y.cmp(&x),
    };

    by_validity_end.then_with(|| b.load_seq.cmp(&a.load_seq))
}

// ============================================================================
// HELPERS
// ============================================================================

/// Parse dates as they appear in raw feeds (ISO, dotted, US)
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    // Timestamps such as "2023-01-01 00:00:00" keep only their date part
    let head = s.get(..10).unwrap_or(s);

    for fmt in ["%Y-%m-%d", "%d.%m.%Y", "%m/%d/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(head, fmt) {
            return Some(date);
        }
    }

    None
}

pub(crate) fn value_to_text(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Integer(i) => Some(i.to_string()),
        Value::Real(r) => Some(r.to_string()),
        Value::Text(t) => Some(t),
        Value::Blob(b) => Some(String::from_utf8_lossy(&b).into_owned()),
    }
}

fn bad_date(idx: usize, name: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        format!("column {} is not a date", name).into(),
    )
}

// ============================================================================
// TESTS
// ============================================================================
