// 📥 Raw ingestion - delimited files → raw tables
// Every raw table has a fixed column order. Files are decoded, checked for the
// required columns, and normalized before anything touches the store; the load
// itself is one prepared statement inside one transaction.

use crate::db::Session;
use crate::error::{MartError, Result, Step};
use crate::temporal::{parse_date, TemporalKey};
use rusqlite::params_from_iter;
use serde::Serialize;
use std::path::{Path, PathBuf};

// ============================================================================
// RAW TABLE SPECS
// ============================================================================

#[derive(Debug)]
pub struct RawTableSpec {
    pub name: &'static str,
    /// Required columns, in insert order
    pub columns: &'static [&'static str],
    /// Columns normalized to ISO dates on load
    pub date_columns: &'static [&'static str],
    pub temporal_key: Option<TemporalKey>,
}

const fn effective(entity_column: &'static str) -> Option<TemporalKey> {
    Some(TemporalKey::new(
        entity_column,
        "effective_from_date",
        "effective_to_date",
    ))
}

pub const RAW_TABLES: &[RawTableSpec] = &[
    RawTableSpec {
        name: "rd_deal",
        columns: &[
            "deal_rk",
            "deal_num",
            "deal_name",
            "deal_sum",
            "client_rk",
            "agreement_rk",
            "deal_start_date",
            "department_rk",
            "product_rk",
            "deal_type_cd",
            "effective_from_date",
            "effective_to_date",
            "account_rk",
        ],
        date_columns: &["deal_start_date", "effective_from_date", "effective_to_date"],
        temporal_key: effective("deal_rk"),
    },
    RawTableSpec {
        name: "rd_product",
        columns: &[
            "product_rk",
            "product_name",
            "effective_from_date",
            "effective_to_date",
        ],
        date_columns: &["effective_from_date", "effective_to_date"],
        temporal_key: effective("product_rk"),
    },
    RawTableSpec {
        name: "rd_loan_holiday",
        columns: &[
            "deal_rk",
            "loan_holiday_type_cd",
            "loan_holiday_start_date",
            "loan_holiday_finish_date",
            "loan_holiday_fact_finish_date",
            "loan_holiday_finish_flg",
            "loan_holiday_last_possible_date",
            "effective_from_date",
            "effective_to_date",
        ],
        date_columns: &[
            "loan_holiday_start_date",
            "loan_holiday_finish_date",
            "loan_holiday_fact_finish_date",
            "loan_holiday_last_possible_date",
            "effective_from_date",
            "effective_to_date",
        ],
        temporal_key: effective("deal_rk"),
    },
    RawTableSpec {
        name: "rd_account",
        columns: &[
            "account_rk",
            "account_number",
            "client_id",
            "currency_cd",
            "department_rk",
        ],
        date_columns: &[],
        temporal_key: None,
    },
    RawTableSpec {
        name: "rd_account_balance",
        columns: &[
            "account_rk",
            "effective_date",
            "account_in_sum",
            "account_out_sum",
        ],
        date_columns: &["effective_date"],
        temporal_key: None,
    },
    RawTableSpec {
        name: "dm_dict_currency",
        columns: &[
            "currency_cd",
            "currency_name",
            "effective_from_date",
            "effective_to_date",
        ],
        date_columns: &["effective_from_date", "effective_to_date"],
        temporal_key: effective("currency_cd"),
    },
    RawTableSpec {
        name: "dm_client",
        columns: &[
            "client_rk",
            "effective_from_date",
            "effective_to_date",
            "account_rk",
            "address_rk",
            "department_rk",
            "card_type_code",
            "client_id",
            "counterparty_type_cd",
            "black_list_flag",
            "client_open_dttm",
            "bankruptcy_rk",
        ],
        date_columns: &["effective_from_date", "effective_to_date"],
        temporal_key: effective("client_rk"),
    },
];

impl RawTableSpec {
    pub fn by_name(name: &str) -> Option<&'static RawTableSpec> {
        RAW_TABLES.iter().find(|spec| spec.name == name)
    }

    fn insert_sql(&self) -> String {
        let placeholders: Vec<String> = (1..=self.columns.len()).map(|i| format!("?{}", i)).collect();
        format!(
            "INSERT OR IGNORE INTO {} ({}) VALUES ({})",
            self.name,
            self.columns.join(", "),
            placeholders.join(", ")
        )
    }
}

// ============================================================================
// READING
// ============================================================================

/// Parsed, validated rows ready to load; cells follow `table.columns` order
#[derive(Debug)]
pub struct RawBatch {
    pub table: &'static RawTableSpec,
    pub path: PathBuf,
    pub encoding: &'static str,
    pub rows: Vec<Vec<Option<String>>>,
}

/// Decode a file as UTF-8, falling back to Windows-1251
pub fn read_text(path: &Path) -> Result<(String, &'static str)> {
    if !path.exists() {
        return Err(MartError::input(path, "file not found"));
    }

    let bytes = std::fs::read(path).map_err(|source| MartError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    match String::from_utf8(bytes) {
        Ok(text) => Ok((strip_bom(text), "utf-8")),
        Err(e) => {
            let bytes = e.into_bytes();
            let (decoded, _, had_errors) = encoding_rs::WINDOWS_1251.decode(&bytes);
            if had_errors {
                return Err(MartError::input(path, "unreadable encoding (not utf-8 or windows-1251)"));
            }
            Ok((decoded.into_owned(), "windows-1251"))
        }
    }
}

fn strip_bom(text: String) -> String {
    if text.starts_with('\u{feff}') {
        text['\u{feff}'.len_utf8()..].to_string()
    } else {
        text
    }
}

pub fn read_raw_file(path: &Path, table: &'static RawTableSpec) -> Result<RawBatch> {
    let (text, encoding) = read_text(path)?;
    tracing::debug!(file = %path.display(), encoding, "decoded raw file");

    let csv_err = |source| MartError::Csv {
        path: path.to_path_buf(),
        source,
    };

    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let headers: Vec<String> = rdr
        .headers()
        .map_err(csv_err)?
        .iter()
        .map(|h| h.to_lowercase())
        .collect();

    // Position of every required column in the file
    let mut positions = Vec::with_capacity(table.columns.len());
    let mut missing = Vec::new();
    for column in table.columns {
        match headers.iter().position(|h| h == column) {
            Some(idx) => positions.push(idx),
            None => missing.push(*column),
        }
    }
    if !missing.is_empty() {
        return Err(MartError::input(
            path,
            format!("missing required column(s): {}", missing.join(", ")),
        ));
    }

    let mut rows = Vec::new();
    for (line, result) in rdr.records().enumerate() {
        let record = result.map_err(csv_err)?;
        let mut row = Vec::with_capacity(positions.len());

        for (column, idx) in table.columns.iter().zip(&positions) {
            let cell = record.get(*idx).unwrap_or("");
            let value = if cell.is_empty() {
                None
            } else if table.date_columns.contains(column) {
                let date = parse_date(cell).ok_or_else(|| {
                    MartError::input(
                        path,
                        format!("line {}: column {} has invalid date '{}'", line + 2, column, cell),
                    )
                })?;
                Some(date.format("%Y-%m-%d").to_string())
            } else {
                Some(cell.to_string())
            };
            row.push(value);
        }

        rows.push(row);
    }

    Ok(RawBatch {
        table,
        path: path.to_path_buf(),
        encoding,
        rows,
    })
}

// ============================================================================
// LOADING
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadReport {
    pub table: String,
    pub inserted: usize,
    /// Rows ignored because their key already existed
    pub skipped: usize,
    pub replaced: bool,
}

/// Load a batch in one transaction. With `replace`, the table is emptied first
/// inside the same transaction.
pub fn load_batch(session: &mut Session, batch: &RawBatch, replace: bool) -> Result<LoadReport> {
    let table = batch.table;
    let tx = session.begin(Step::Ingest)?;

    if replace {
        tx.execute(&format!("DELETE FROM {}", table.name), [])
            .map_err(MartError::store(Step::Ingest))?;
    }

    let mut inserted = 0;
    {
        let mut stmt = tx
            .prepare(&table.insert_sql())
            .map_err(MartError::store(Step::Ingest))?;

        for row in &batch.rows {
            inserted += stmt
                .execute(params_from_iter(row.iter()))
                .map_err(MartError::store(Step::Ingest))?;
        }
    }

    tx.commit().map_err(MartError::store(Step::Ingest))?;

    Ok(LoadReport {
        table: table.name.to_string(),
        inserted,
        skipped: batch.rows.len() - inserted,
        replaced: replace,
    })
}

// ============================================================================
// TESTS
// ============================================================================
