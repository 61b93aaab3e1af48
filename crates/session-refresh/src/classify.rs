//! Upstream response classification
//!
//! The upstream signals an expired or revoked session with 401 or 403. Those
//! are the only statuses that justify a credential refresh; everything else
//! is either success or an ordinary failed attempt.

/// What a single upstream attempt means for the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// 2xx, hand the response back
    Success,
    /// 401/403, refresh credentials then retry
    AuthRejected,
    /// Anything else, retry without refreshing
    Failed,
}

impl AttemptOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            AttemptOutcome::Success => "success",
            AttemptOutcome::AuthRejected => "auth_rejected",
            AttemptOutcome::Failed => "failed",
        }
    }
}

/// Classify an upstream HTTP status.
pub fn classify_status(status: u16) -> AttemptOutcome {
    match status {
        200..=299 => AttemptOutcome::Success,
        401 | 403 => AttemptOutcome::AuthRejected,
        _ => AttemptOutcome::Failed,
    }
}
