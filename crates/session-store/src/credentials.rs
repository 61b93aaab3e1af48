//! Session cookie storage
//!
//! Holds exactly one `CredentialSet` behind a reader/writer lock. Readers get
//! an `Arc` snapshot, so a `replace()` is a single pointer swap and no reader
//! can ever observe half of an old set and half of a new one. The set is
//! persisted to a JSON file with atomic temp-file + rename writes.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::Secret;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// One acquired bundle of session cookies.
///
/// `expires_at` is absent when the acquirer could not determine a lifetime;
/// such a set is never considered valid.
#[derive(Clone, Serialize, Deserialize)]
pub struct CredentialSet {
    #[serde(rename = "cookies")]
    values: HashMap<String, Secret<String>>,
    pub acquired_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Why a credential set cannot be used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidity {
    /// No set has ever been acquired (or the persisted one was unreadable)
    Absent,
    /// The set holds zero cookies
    Empty,
    /// The mandatory cookie is missing
    MissingRequired(String),
    /// No expiry is known
    NoExpiry,
    /// Expired at the given instant
    Expired(DateTime<Utc>),
}

impl fmt::Display for Invalidity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Invalidity::Absent => write!(f, "no session credentials stored"),
            Invalidity::Empty => write!(f, "session credentials are empty"),
            Invalidity::MissingRequired(name) => write!(f, "missing required cookie {name}"),
            Invalidity::NoExpiry => write!(f, "session expiry unknown"),
            Invalidity::Expired(at) => write!(f, "session expired at {}", at.to_rfc3339()),
        }
    }
}

impl CredentialSet {
    pub fn new(
        values: HashMap<String, String>,
        acquired_at: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            values: values
                .into_iter()
                .map(|(name, value)| (name, Secret::new(value)))
                .collect(),
            acquired_at,
            expires_at,
        }
    }

    /// Value of a single cookie.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(|v| v.expose().as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Cookie names, in no particular order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// First reason this set is unusable at `now`, or `None` if it is valid.
    pub fn invalidity(&self, required: &str, now: DateTime<Utc>) -> Option<Invalidity> {
        if self.values.is_empty() {
            return Some(Invalidity::Empty);
        }
        if !self.values.contains_key(required) {
            return Some(Invalidity::MissingRequired(required.to_string()));
        }
        match self.expires_at {
            None => Some(Invalidity::NoExpiry),
            Some(at) if now >= at => Some(Invalidity::Expired(at)),
            Some(_) => None,
        }
    }

    pub fn is_valid(&self, required: &str, now: DateTime<Utc>) -> bool {
        self.invalidity(required, now).is_none()
    }

    /// Time left until expiry. Negative once expired, `None` without an expiry.
    pub fn time_remaining(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.expires_at.map(|at| at - now)
    }

    /// `name=value` pairs joined by `"; "`. Order is unspecified.
    pub fn cookie_header_value(&self) -> String {
        self.values
            .iter()
            .map(|(name, value)| format!("{name}={}", value.expose()))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

impl fmt::Debug for CredentialSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.names().collect();
        names.sort_unstable();
        f.debug_struct("CredentialSet")
            .field("cookies", &names)
            .field("acquired_at", &self.acquired_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Thread-safe holder of the current credential set.
///
/// `current` allows concurrent readers with an exclusive writer. `persist`
/// serializes file writes so the file always ends up holding the most
/// recently swapped set.
pub struct CredentialStore {
    path: PathBuf,
    required_key: String,
    current: RwLock<Option<Arc<CredentialSet>>>,
    persist: Mutex<()>,
}

impl CredentialStore {
    /// Load the persisted set from `path`.
    ///
    /// A missing file is a cold start with no credentials. An unparseable file
    /// is logged and treated the same way: the next acquisition overwrites it.
    /// Other I/O failures (permissions, a directory at `path`) are errors.
    pub async fn load(path: PathBuf, required_key: impl Into<String>) -> Result<Self> {
        let current = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => match serde_json::from_str::<CredentialSet>(&contents) {
                Ok(set) => {
                    info!(
                        path = %path.display(),
                        cookies = set.len(),
                        expires_at = ?set.expires_at,
                        "loaded session credentials"
                    );
                    Some(Arc::new(set))
                }
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "credential file unreadable, starting without session"
                    );
                    None
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "credential file not found, starting without session"
                );
                None
            }
            Err(e) => return Err(Error::Io(format!("reading credential file: {e}"))),
        };

        Ok(Self {
            path,
            required_key: required_key.into(),
            current: RwLock::new(current),
            persist: Mutex::new(()),
        })
    }

    /// Snapshot of the current set. Never waits on a refresh.
    pub async fn get(&self) -> Option<Arc<CredentialSet>> {
        self.current.read().await.clone()
    }

    /// Swap in a new set and persist it.
    ///
    /// The in-memory swap always takes effect. An `Err` means only the
    /// durability write failed; callers log it and carry on.
    pub async fn replace(&self, set: CredentialSet) -> Result<()> {
        let set = Arc::new(set);
        let _persist = self.persist.lock().await;
        {
            let mut current = self.current.write().await;
            *current = Some(set.clone());
        }
        debug!(cookies = set.len(), expires_at = ?set.expires_at, "replaced session credentials");
        write_atomic(&self.path, &set).await
    }

    /// Whether the current set is usable at `now`.
    pub async fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.validity_report(now).await.is_none()
    }

    /// Reason the current set is unusable at `now`, or `None` if valid.
    pub async fn validity_report(&self, now: DateTime<Utc>) -> Option<Invalidity> {
        match self.get().await {
            Some(set) => set.invalidity(&self.required_key, now),
            None => Some(Invalidity::Absent),
        }
    }

    /// Cookie header for the current set, empty when none is stored.
    pub async fn cookie_header_value(&self) -> String {
        self.get()
            .await
            .map(|set| set.cookie_header_value())
            .unwrap_or_default()
    }

    /// Name of the cookie every valid set must carry.
    pub fn required_key(&self) -> &str {
        &self.required_key
    }
}

/// Write the credential set to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target, so a crash mid-write leaves the previous file intact. The file
/// holds live session cookies, so permissions are 0600 on unix.
async fn write_atomic(path: &Path, set: &CredentialSet) -> Result<()> {
    let json = serde_json::to_string_pretty(set)
        .map_err(|e| Error::CredentialParse(format!("serializing credentials: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("credential path has no parent directory".into()))?;

    if !dir.as_os_str().is_empty() {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| Error::Io(format!("creating credential directory: {e}")))?;
    }

    let tmp_path = dir.join(format!(".session.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp credential file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting credential file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp credential file: {e}")))?;

    debug!(path = %path.display(), "persisted credentials");
    Ok(())
}
