// 📏 Gap Analyzer - how far has a mart drifted from its source?
// Both counts are computed by the store; neither relation is pulled into memory.

use crate::db::count_rows;
use crate::error::{MartError, Result, Step};
use crate::relation::MartDefinition;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapReport {
    /// Source rows whose key is absent from the mart
    pub missing: u64,
    /// Rows currently in the mart
    pub total: u64,
}

impl GapReport {
    pub fn new(missing: u64, total: u64) -> Self {
        GapReport { missing, total }
    }

    /// `missing / (total + 1)`; the +1 keeps an empty mart well-defined
    pub fn ratio(&self) -> f64 {
        self.missing as f64 / (self.total as f64 + 1.0)
    }

    pub fn is_in_sync(&self) -> bool {
        self.missing == 0
    }
}

pub fn analyze_gap(conn: &Connection, mart: &MartDefinition) -> Result<GapReport> {
    let missing: i64 = conn
        .query_row(
            &format!("SELECT COUNT(*) FROM ({})", mart.missing_rows_sql()),
            [],
            |row| row.get(0),
        )
        .map_err(MartError::store(Step::GapAnalysis))?;

    let total = count_rows(conn, mart.target).map_err(MartError::store(Step::GapAnalysis))?;

    Ok(GapReport::new(missing as u64, total as u64))
}
