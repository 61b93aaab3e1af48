//! Error types for credential persistence

/// Errors from loading or saving the credential file.
///
/// None of these are fatal to in-memory operation: a failed save leaves the
/// swapped set in memory and is only logged by the caller.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("credential parse error: {0}")]
    CredentialParse(String),

    #[error("I/O error: {0}")]
    Io(String),
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;
