//! Shared types for the session proxy workspace

mod secret;
mod error;

pub use secret::Secret;
pub use error::{Error, Result};
