// ⚙️ Run configuration
// One TOML file describes where the store lives, which raw files feed it, and
// how the reconciliation steps behave.

use crate::deduplication::DedupGranularity;
use crate::error::{MartError, Result};
use crate::ingest::RawTableSpec;
use crate::reconciliation::PeriodAdjacency;
use crate::refresh::PartialReloadMode;
use crate::strategy::FULL_RELOAD_THRESHOLD;
use serde::Deserialize;
use std::path::{Path, PathBuf};

// ============================================================================
// TOP-LEVEL CONFIG
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MartConfig {
    /// SQLite file holding the raw and mart layers
    pub database: PathBuf,

    /// Directory raw file names are resolved against
    pub data_dir: PathBuf,

    /// Raw files loaded before reconciliation, in order
    pub raw: Vec<RawFileConfig>,

    pub dedup: DedupConfig,

    pub load: LoadConfig,

    pub balance: BalanceConfig,

    pub logging: LoggingConfig,
}

impl Default for MartConfig {
    fn default() -> Self {
        MartConfig {
            database: PathBuf::from("dwh.db"),
            data_dir: PathBuf::from("."),
            raw: Vec::new(),
            dedup: DedupConfig::default(),
            load: LoadConfig::default(),
            balance: BalanceConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawFileConfig {
    /// Raw table name, e.g. `rd_deal`
    pub table: String,

    /// File name relative to `data_dir` (or absolute)
    pub file: PathBuf,

    /// Truncate the table before loading instead of appending
    #[serde(default)]
    pub replace: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub tables: Vec<String>,
    pub granularity: DedupGranularity,
}

impl Default for DedupConfig {
    fn default() -> Self {
        DedupConfig {
            tables: vec!["dm_client".to_string()],
            granularity: DedupGranularity::EntityVersion,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    /// Gap ratio above which a mart is fully reloaded
    pub full_reload_threshold: f64,

    pub partial_mode: PartialReloadMode,

    /// Compare source and mart fingerprints after a full reload
    pub verify: bool,
}

impl Default for LoadConfig {
    fn default() -> Self {
        LoadConfig {
            full_reload_threshold: FULL_RELOAD_THRESHOLD,
            partial_mode: PartialReloadMode::Incremental,
            verify: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BalanceConfig {
    pub enabled: bool,
    pub adjacency: PeriodAdjacency,
}

impl Default for BalanceConfig {
    fn default() -> Self {
        BalanceConfig {
            enabled: true,
            adjacency: PeriodAdjacency::OrderedSeries,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,

    /// Append log lines to this file instead of stderr
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            file: None,
        }
    }
}

// ============================================================================
// LOADING
// ============================================================================

impl MartConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| MartError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: MartConfig =
            toml::from_str(text).map_err(|e| MartError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let t = self.load.full_reload_threshold;
        if !(t > 0.0 && t <= 1.0) {
            return Err(MartError::Config(format!(
                "full_reload_threshold must be in (0, 1], got {}",
                t
            )));
        }

        for raw in &self.raw {
            if RawTableSpec::by_name(&raw.table).is_none() {
                return Err(MartError::Config(format!("unknown raw table '{}'", raw.table)));
            }
        }

        for table in &self.dedup.tables {
            if RawTableSpec::by_name(table).and_then(|s| s.temporal_key).is_none() {
                return Err(MartError::Config(format!(
                    "table '{}' has no temporal key to deduplicate on",
                    table
                )));
            }
        }

        Ok(())
    }

    /// Resolve a raw file entry against `data_dir`
    pub fn raw_path(&self, raw: &RawFileConfig) -> PathBuf {
        if raw.file.is_absolute() {
            raw.file.clone()
        } else {
            self.data_dir.join(&raw.file)
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_file() {
        let config = MartConfig::from_toml_str("").unwrap();

        assert_eq!(config.database, PathBuf::from("dwh.db"));
        assert_eq!(config.load.full_reload_threshold, 0.3);
        assert_eq!(config.load.partial_mode, PartialReloadMode::Incremental);
        assert_eq!(config.dedup.tables, vec!["dm_client".to_string()]);
        assert_eq!(config.dedup.granularity, DedupGranularity::EntityVersion);
        assert_eq!(config.balance.adjacency, PeriodAdjacency::OrderedSeries);
        assert!(config.raw.is_empty());
    }

    #[test]
    fn test_full_config() {
        let text = r#"
            database = "/var/lib/dwh/mart.db"
            data_dir = "/srv/feeds"

            [[raw]]
            table = "rd_deal"
            file = "deal_info.csv"

            [[raw]]
            table = "rd_product"
            file = "/abs/product_info.csv"
            replace = true

            [dedup]
            tables = ["dm_client"]
            granularity = "entity"

            [load]
            full_reload_threshold = 0.5
            partial_mode = "full_fallback"
            verify = true

            [balance]
            adjacency = "calendar_day"

            [logging]
            level = "debug"
            file = "mart.log"
        "#;

        let config = MartConfig::from_toml_str(text).unwrap();

        assert_eq!(config.raw.len(), 2);
        assert_eq!(
            config.raw_path(&config.raw[0]),
            PathBuf::from("/srv/feeds/deal_info.csv")
        );
        assert_eq!(
            config.raw_path(&config.raw[1]),
            PathBuf::from("/abs/product_info.csv")
        );
        assert!(config.raw[1].replace);
        assert_eq!(config.dedup.granularity, DedupGranularity::Entity);
        assert_eq!(config.load.partial_mode, PartialReloadMode::FullFallback);
        assert!(config.load.verify);
        assert_eq!(config.balance.adjacency, PeriodAdjacency::CalendarDay);
        assert_eq!(config.logging.file, Some(PathBuf::from("mart.log")));
    }

    #[test]
    fn test_rejects_bad_threshold() {
        let err = MartConfig::from_toml_str("[load]\nfull_reload_threshold = 0.0").unwrap_err();
        assert!(matches!(err, MartError::Config(_)));
    }

    #[test]
    fn test_rejects_unknown_raw_table() {
        let text = "[[raw]]\ntable = \"rd_nope\"\nfile = \"x.csv\"";
        let err = MartConfig::from_toml_str(text).unwrap_err();
        assert!(err.to_string().contains("rd_nope"));
    }

    #[test]
    fn test_rejects_dedup_on_table_without_temporal_key() {
        let text = "[dedup]\ntables = [\"rd_account\"]";
        assert!(MartConfig::from_toml_str(text).is_err());
    }
}
