//! Session credential storage
//!
//! Holds the single cookie set used to talk to the upstream web API, decides
//! whether it is still usable, and persists it across restarts. The store is
//! constructed once at startup and shared by `Arc`; there is no global state.
//!
//! Lifecycle:
//! 1. `CredentialStore::load()` at startup reads the last persisted set
//! 2. The refresh coordinator calls `CredentialStore::replace()` after a
//!    successful acquisition
//! 3. Every outbound call reads `CredentialStore::cookie_header_value()`

pub mod constants;
pub mod credentials;
pub mod error;

pub use constants::*;
pub use credentials::{CredentialSet, CredentialStore, Invalidity};
pub use error::{Error, Result};
