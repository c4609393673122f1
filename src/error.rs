// 🚨 Error taxonomy for the reconciliation engine
// Store failures, bad raw input, and broken post-conditions are kept apart so the
// caller can tell which step failed and whether anything was committed.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

// ============================================================================
// STEP
// ============================================================================

/// The logical step that was running when an error surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Schema,
    Ingest,
    Dedup,
    GapAnalysis,
    Refresh,
    ForwardPass,
    BackwardPass,
    Verification,
    Audit,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Schema => "schema",
            Step::Ingest => "ingest",
            Step::Dedup => "dedup",
            Step::GapAnalysis => "gap_analysis",
            Step::Refresh => "refresh",
            Step::ForwardPass => "forward_pass",
            Step::BackwardPass => "backward_pass",
            Step::Verification => "verification",
            Step::Audit => "audit",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// MART ERROR
// ============================================================================

#[derive(Debug, Error)]
pub enum MartError {
    /// The store rejected a query or transaction. The enclosing transaction
    /// has been rolled back.
    #[error("store error during {step}: {source}")]
    Store {
        step: Step,
        #[source]
        source: rusqlite::Error,
    },

    /// Raw input is missing or malformed. Raised before any mutation.
    #[error("input error in {}: {reason}", path.display())]
    Input { path: PathBuf, reason: String },

    #[error("csv error in {}: {source}", path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A post-condition check failed. Fatal for the current run.
    #[error("invariant violated during {step}: {detail}")]
    InvariantViolation { step: Step, detail: String },

    #[error("config error: {0}")]
    Config(String),
}

impl MartError {
    pub fn store(step: Step) -> impl FnOnce(rusqlite::Error) -> MartError {
        move |source| MartError::Store { step, source }
    }

    pub fn input(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        MartError::Input {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Step the error is attributed to, if the error belongs to one.
    pub fn step(&self) -> Option<Step> {
        match self {
            MartError::Store { step, .. } => Some(*step),
            MartError::InvariantViolation { step, .. } => Some(*step),
            MartError::Input { .. } | MartError::Csv { .. } | MartError::Io { .. } => {
                Some(Step::Ingest)
            }
            MartError::Config(_) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, MartError>;
