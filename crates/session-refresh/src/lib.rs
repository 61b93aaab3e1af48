//! Session refresh coordination
//!
//! Decides when the session cookies must be re-acquired and guarantees that at
//! most one acquisition runs at any instant, no matter how many callers ask.
//!
//! Refresh lifecycle:
//! 1. A trigger fires: the scheduler's maintenance, pre-expiry or preventive
//!    window, a proxied call rejected with 401/403, or a manual request
//! 2. `RefreshCoordinator` starts one acquisition, or joins the one in flight
//! 3. On success the new set replaces the old one in `CredentialStore`
//! 4. Every waiter resumes with the same outcome

pub mod classify;
pub mod coordinator;
pub mod error;
pub mod scheduler;

pub use classify::{AttemptOutcome, classify_status};
pub use coordinator::{CoordinatorSettings, RefreshCoordinator, RefreshRecord};
pub use error::{RefreshError, Result};
pub use scheduler::{ScheduleWindow, Scheduler, Trigger, decide};

use std::future::Future;
use std::pin::Pin;

/// Anything that can bring the session cookies up to date.
///
/// Implemented by `RefreshCoordinator`; the scheduler and the proxy client
/// only see this trait, so tests can substitute their own.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn Refresher>`).
pub trait Refresher: Send + Sync {
    /// Resolve once fresh credentials are in the store, or with the reason
    /// they could not be obtained.
    fn request_refresh(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}
