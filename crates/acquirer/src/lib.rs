//! Credential acquisition seam
//!
//! Defines the `CredentialAcquirer` trait that decouples the refresh logic from
//! however a fresh cookie set is actually obtained. The upstream site has no
//! programmatic login, so a real acquirer drives a browser; this crate ships
//! `CommandAcquirer`, which delegates that to an external program and parses
//! the cookies it prints.

pub mod command;
pub mod expiry;

pub use command::{CommandAcquirer, CommandSettings, BUDGET_ENV};
pub use expiry::{jwt_expiry, next_occurrence, resolve_expiry};

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use session_store::CredentialSet;

/// Errors from a single acquisition attempt.
///
/// Acquirers never retry internally; the refresh coordinator surfaces the
/// error to every waiter and the next trigger starts over.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AcquireError {
    #[error("acquisition timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("acquisition incomplete: {0}")]
    Incomplete(String),

    #[error("acquisition failed: {0}")]
    Failed(String),
}

/// Result alias for acquisition.
pub type Result<T> = std::result::Result<T, AcquireError>;

/// Obtains a fresh credential set from the outside world.
///
/// `budget` is the wall-clock allowance for the whole attempt. Implementations
/// should give up on their own once it is spent; the coordinator also wraps
/// the call in a hard timeout.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn CredentialAcquirer>`).
pub trait CredentialAcquirer: Send + Sync {
    /// Identifier for logging (e.g. "command")
    fn id(&self) -> &str;

    fn acquire(
        &self,
        budget: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<CredentialSet>> + Send + '_>>;
}
