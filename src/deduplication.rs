// 🔍 Deduplication Engine - collapse duplicate versions of a temporal record
// Rows sharing a partition key are ranked with the canonical temporal order;
// everything below rank 1 is deleted in one transaction.

use crate::db::Session;
use crate::error::{MartError, Result, Step};
use crate::temporal::{canonical_cmp, TemporalKey, VersionedRecord};
use chrono::NaiveDate;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// GRANULARITY
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupGranularity {
    /// One row per entity_key: keeps only the canonical version overall
    Entity,

    /// One row per (entity_key, effective_from)
    EntityVersion,
}

impl DedupGranularity {
    fn partition_by(&self, key: &TemporalKey) -> String {
        match self {
            DedupGranularity::Entity => key.entity_column.to_string(),
            DedupGranularity::EntityVersion => {
                format!("{}, {}", key.entity_column, key.from_column)
            }
        }
    }

    fn partition_of(&self, record: &VersionedRecord) -> (String, Option<NaiveDate>) {
        match self {
            DedupGranularity::Entity => (record.entity_key.clone(), None),
            DedupGranularity::EntityVersion => {
                (record.entity_key.clone(), Some(record.effective_from))
            }
        }
    }
}

// ============================================================================
// RESULTS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub entity_key: String,
    /// None when partitioning by entity only
    pub effective_from: Option<String>,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupReport {
    pub table: String,
    pub groups: usize,
    pub removed: usize,
}

// ============================================================================
// DEDUPLICATOR
// ============================================================================

pub struct Deduplicator {
    pub granularity: DedupGranularity,
}

impl Deduplicator {
    pub fn new(granularity: DedupGranularity) -> Self {
        Deduplicator { granularity }
    }

    /// Groups holding more than one row, without touching the table
    pub fn find_duplicates(
        &self,
        conn: &Connection,
        table: &str,
        key: &TemporalKey,
    ) -> Result<Vec<DuplicateGroup>> {
        let from_expr = match self.granularity {
            DedupGranularity::Entity => "NULL".to_string(),
            DedupGranularity::EntityVersion => key.from_column.to_string(),
        };
        let sql = format!(
            "SELECT CAST({entity} AS TEXT), {from}, COUNT(*)
             FROM {table}
             GROUP BY {partition}
             HAVING COUNT(*) > 1
             ORDER BY 1, 2",
            entity = key.entity_column,
            from = from_expr,
            table = table,
            partition = self.granularity.partition_by(key),
        );

        let mut stmt = conn.prepare(&sql).map_err(MartError::store(Step::Dedup))?;
        let groups = stmt
            .query_map([], |row| {
                Ok(DuplicateGroup {
                    entity_key: row.get(0)?,
                    effective_from: row.get(1)?,
                    count: row.get(2)?,
                })
            })
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(MartError::store(Step::Dedup))?;

        Ok(groups)
    }

    /// Delete every non-canonical row. Runs in a single transaction; on error
    /// nothing is deleted.
    pub fn remove_duplicates(
        &self,
        session: &mut Session,
        table: &str,
        key: &TemporalKey,
    ) -> Result<DedupReport> {
        let tx = session.begin(Step::Dedup)?;

        let groups = self.find_duplicates(&tx, table, key)?;

        let removed = if groups.is_empty() {
            0
        } else {
            let sql = format!(
                "DELETE FROM {table}
                 WHERE rowid IN (
                     SELECT rid FROM (
                         SELECT rowid AS rid,
                                ROW_NUMBER() OVER (
                                    PARTITION BY {partition}
                                    ORDER BY {order}
                                ) AS version_rank
                         FROM {table}
                     )
                     WHERE version_rank > 1
                 )",
                table = table,
                partition = self.granularity.partition_by(key),
                order = key.sql_order_by(),
            );
            tx.execute(&sql, []).map_err(MartError::store(Step::Dedup))?
        };

        tx.commit().map_err(MartError::store(Step::Dedup))?;

        Ok(DedupReport {
            table: table.to_string(),
            groups: groups.len(),
            removed,
        })
    }

    /// Rows `remove_duplicates` would delete, computed in memory
    pub fn preview(
        &self,
        conn: &Connection,
        table: &str,
        key: &TemporalKey,
    ) -> Result<Vec<VersionedRecord>> {
        let records =
            VersionedRecord::load_all(conn, table, key).map_err(MartError::store(Step::Dedup))?;
        Ok(self.canonical_versions(records).1)
    }

    /// Split records into (kept, removed) using the canonical order
    pub fn canonical_versions(
        &self,
        records: Vec<VersionedRecord>,
    ) -> (Vec<VersionedRecord>, Vec<VersionedRecord>) {
        let mut partitions: BTreeMap<(String, Option<NaiveDate>), Vec<VersionedRecord>> =
            BTreeMap::new();
        for record in records {
            partitions
                .entry(self.granularity.partition_of(&record))
                .or_default()
                .push(record);
        }

        let mut kept = Vec::new();
        let mut removed = Vec::new();
        for (_, mut versions) in partitions {
            versions.sort_by(canonical_cmp);
            let mut iter = versions.into_iter();
            if let Some(first) = iter.next() {
                kept.push(first);
            }
            removed.extend(iter);
        }

        (kept, removed)
    }
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new(DedupGranularity::EntityVersion)
    }
}

// ============================================================================
// TESTS
// ============================================================================
