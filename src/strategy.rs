// 🧭 Load Strategy Selector
// Turns a gap into one of three decisions. Stateless: every call stands alone.

use crate::gap::GapReport;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Gap ratio above which the whole mart is rebuilt
pub const FULL_RELOAD_THRESHOLD: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStrategy {
    NoAction,
    PartialReload,
    FullReload,
}

impl LoadStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadStrategy::NoAction => "no_action",
            LoadStrategy::PartialReload => "partial_reload",
            LoadStrategy::FullReload => "full_reload",
        }
    }
}

impl fmt::Display for LoadStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct StrategySelector {
    pub full_reload_threshold: f64,
}

impl StrategySelector {
    pub fn new(full_reload_threshold: f64) -> Self {
        StrategySelector {
            full_reload_threshold,
        }
    }

    pub fn select(&self, gap: &GapReport) -> LoadStrategy {
        if gap.missing == 0 {
            LoadStrategy::NoAction
        } else if gap.ratio() > self.full_reload_threshold {
            LoadStrategy::FullReload
        } else {
            LoadStrategy::PartialReload
        }
    }
}

impl Default for StrategySelector {
    fn default() -> Self {
        Self::new(FULL_RELOAD_THRESHOLD)
    }
}

/// Select with the default threshold
pub fn select_strategy(gap: &GapReport) -> LoadStrategy {
    StrategySelector::default().select(gap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_table() {
        assert_eq!(select_strategy(&GapReport::new(0, 100)), LoadStrategy::NoAction);
        // 40 / 101 ≈ 0.396
        assert_eq!(select_strategy(&GapReport::new(40, 100)), LoadStrategy::FullReload);
        // 10 / 101 ≈ 0.099
        assert_eq!(select_strategy(&GapReport::new(10, 100)), LoadStrategy::PartialReload);
        // 1 / (0 + 1) = 1.0
        assert_eq!(select_strategy(&GapReport::new(1, 0)), LoadStrategy::FullReload);
    }

    #[test]
    fn test_empty_everything_is_no_action() {
        assert_eq!(select_strategy(&GapReport::new(0, 0)), LoadStrategy::NoAction);
    }

    #[test]
    fn test_denominator_keeps_plus_one() {
        // 30 / 101 ≈ 0.297, 31 / 101 ≈ 0.307
        assert_eq!(select_strategy(&GapReport::new(30, 100)), LoadStrategy::PartialReload);
        assert_eq!(select_strategy(&GapReport::new(31, 100)), LoadStrategy::FullReload);
        // 3 / (9 + 1) = 0.3 is not above the threshold; 3 / 9 would be
        assert_eq!(select_strategy(&GapReport::new(3, 9)), LoadStrategy::PartialReload);
    }

    #[test]
    fn test_custom_threshold() {
        let selector = StrategySelector::new(0.5);
        assert_eq!(selector.select(&GapReport::new(40, 100)), LoadStrategy::PartialReload);
        assert_eq!(selector.select(&GapReport::new(60, 100)), LoadStrategy::FullReload);
    }

    #[test]
    fn test_strategy_names() {
        assert_eq!(LoadStrategy::FullReload.to_string(), "full_reload");
        assert_eq!(LoadStrategy::NoAction.as_str(), "no_action");
    }
}
