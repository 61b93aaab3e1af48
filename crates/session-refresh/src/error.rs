//! Error types for refresh operations

use acquirer::AcquireError;

/// Why a refresh did not produce usable credentials.
///
/// `Clone` because one outcome is handed to every caller waiting on the same
/// acquisition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RefreshError {
    #[error("credential acquisition timed out after {budget_secs}s")]
    AcquisitionTimeout { budget_secs: u64 },

    #[error("credential acquisition incomplete: {0}")]
    AcquisitionIncomplete(String),

    #[error("credential acquisition failed: {0}")]
    AcquisitionFailed(String),

    #[error("credential acquisition aborted: {0}")]
    Aborted(String),
}

impl RefreshError {
    /// Metric label for this failure.
    pub fn outcome_label(&self) -> &'static str {
        match self {
            RefreshError::AcquisitionTimeout { .. } => "timeout",
            RefreshError::AcquisitionIncomplete(_) => "incomplete",
            RefreshError::AcquisitionFailed(_) => "failed",
            RefreshError::Aborted(_) => "aborted",
        }
    }
}

impl From<AcquireError> for RefreshError {
    fn from(e: AcquireError) -> Self {
        match e {
            AcquireError::Timeout(budget) => RefreshError::AcquisitionTimeout {
                budget_secs: budget.as_secs(),
            },
            AcquireError::Incomplete(msg) => RefreshError::AcquisitionIncomplete(msg),
            AcquireError::Failed(msg) => RefreshError::AcquisitionFailed(msg),
        }
    }
}

/// Result alias for refresh operations.
pub type Result<T> = std::result::Result<T, RefreshError>;
