//! Single-flight refresh coordinator
//!
//! State machine per process:
//! - `Idle`: the next `request_refresh()` becomes the leader and starts an
//!   acquisition
//! - `InProgress`: callers join as waiters and receive the leader's outcome
//! - `Cooldown`: a short window after a successful acquisition during which
//!   requests are answered with that success without acquiring again
//!
//! The acquisition runs on its own task, so a leader whose future is dropped
//! (client disconnect, shutdown) cannot leave the state stuck in `InProgress`.

use std::sync::Arc;
use std::time::Duration;

use acquirer::CredentialAcquirer;
use chrono::{DateTime, Utc};
use serde::Serialize;
use session_store::{CredentialSet, CredentialStore};
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{RefreshError, Result};
use crate::Refresher;

/// Tuning for the coordinator.
#[derive(Debug, Clone, Copy)]
pub struct CoordinatorSettings {
    /// Hard wall-clock limit for one acquisition
    pub acquire_timeout: Duration,
    /// How long a success satisfies later requests. Zero disables cooldown.
    pub cooldown: Duration,
}

/// Summary of the last finished acquisition, for status reporting.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRecord {
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    /// Callers that joined the acquisition after it started
    pub waiters: usize,
}

type Outcome = Result<()>;

enum State {
    Idle,
    InProgress {
        outcome: watch::Receiver<Option<Outcome>>,
        waiters: usize,
    },
    Cooldown {
        until: Instant,
    },
}

struct Shared {
    store: Arc<CredentialStore>,
    acquirer: Arc<dyn CredentialAcquirer>,
    settings: CoordinatorSettings,
    state: Mutex<State>,
    last: Mutex<Option<RefreshRecord>>,
}

/// Process-wide serializer of credential refreshes.
///
/// Cheap to clone; all clones share one state machine.
#[derive(Clone)]
pub struct RefreshCoordinator {
    shared: Arc<Shared>,
}

impl RefreshCoordinator {
    pub fn new(
        store: Arc<CredentialStore>,
        acquirer: Arc<dyn CredentialAcquirer>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                acquirer,
                settings,
                state: Mutex::new(State::Idle),
                last: Mutex::new(None),
            }),
        }
    }

    /// Bring the store up to date, starting an acquisition only if none is
    /// running.
    ///
    /// Every caller overlapping one acquisition receives the identical
    /// outcome. Failures are never retried here.
    pub async fn request_refresh(&self) -> Result<()> {
        let mut outcome = {
            let mut state = self.shared.state.lock().await;
            match &mut *state {
                State::InProgress { outcome, waiters } => {
                    *waiters += 1;
                    debug!(waiters = *waiters, "joining in-flight credential refresh");
                    outcome.clone()
                }
                State::Cooldown { until } if Instant::now() < *until => {
                    debug!("credentials refreshed moments ago, skipping acquisition");
                    return Ok(());
                }
                _ => {
                    let (tx, rx) = watch::channel(None);
                    *state = State::InProgress {
                        outcome: rx.clone(),
                        waiters: 0,
                    };
                    self.spawn_acquisition(tx);
                    rx
                }
            }
        };

        match outcome.wait_for(Option::is_some).await {
            Ok(value) => value
                .clone()
                .unwrap_or_else(|| Err(RefreshError::Aborted("no outcome published".into()))),
            Err(_) => Err(RefreshError::Aborted(
                "refresh task ended without an outcome".into(),
            )),
        }
    }

    /// `idle`, `in_progress` or `cooldown`.
    pub async fn state_label(&self) -> &'static str {
        match &*self.shared.state.lock().await {
            State::Idle => "idle",
            State::InProgress { .. } => "in_progress",
            State::Cooldown { until } if Instant::now() < *until => "cooldown",
            State::Cooldown { .. } => "idle",
        }
    }

    /// The most recent finished acquisition, if any.
    pub async fn last_refresh(&self) -> Option<RefreshRecord> {
        self.shared.last.lock().await.clone()
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.shared.store
    }

    fn spawn_acquisition(&self, tx: watch::Sender<Option<Outcome>>) {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            info!(
                acquirer = shared.acquirer.id(),
                budget_secs = shared.settings.acquire_timeout.as_secs(),
                "starting credential acquisition"
            );

            let outcome = shared.acquire_and_store().await;
            let elapsed = started.elapsed();

            let waiters = {
                let mut state = shared.state.lock().await;
                let waiters = match &*state {
                    State::InProgress { waiters, .. } => *waiters,
                    _ => 0,
                };
                *state = match &outcome {
                    Ok(()) if !shared.settings.cooldown.is_zero() => State::Cooldown {
                        until: Instant::now() + shared.settings.cooldown,
                    },
                    _ => State::Idle,
                };
                waiters
            };

            let label = match &outcome {
                Ok(()) => {
                    info!(
                        duration_ms = elapsed.as_millis() as u64,
                        waiters, "credential refresh succeeded"
                    );
                    "success"
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        duration_ms = elapsed.as_millis() as u64,
                        waiters, "credential refresh failed"
                    );
                    e.outcome_label()
                }
            };
            metrics::counter!("session_refresh_total", "outcome" => label).increment(1);

            *shared.last.lock().await = Some(RefreshRecord {
                finished_at: Utc::now(),
                success: outcome.is_ok(),
                error: outcome.as_ref().err().map(|e| e.to_string()),
                duration_ms: elapsed.as_millis() as u64,
                waiters,
            });

            // Receivers may all be gone if every caller was cancelled
            let _ = tx.send(Some(outcome));
        });
    }
}

impl Shared {
    async fn acquire_and_store(&self) -> Result<()> {
        let budget = self.settings.acquire_timeout;
        let acquirer = self.acquirer.clone();
        let mut task = tokio::spawn(async move { acquirer.acquire(budget).await });

        let set = match tokio::time::timeout(budget, &mut task).await {
            Ok(Ok(Ok(set))) => set,
            Ok(Ok(Err(e))) => return Err(e.into()),
            Ok(Err(join_err)) => {
                let reason = if join_err.is_panic() {
                    "acquirer panicked"
                } else {
                    "acquirer task cancelled"
                };
                return Err(RefreshError::Aborted(reason.into()));
            }
            Err(_) => {
                task.abort();
                return Err(RefreshError::AcquisitionTimeout {
                    budget_secs: budget.as_secs(),
                });
            }
        };

        self.check_complete(&set)?;

        if let Err(e) = self.store.replace(set).await {
            warn!(error = %e, "refreshed credentials kept in memory but not persisted");
        }
        Ok(())
    }

    fn check_complete(&self, set: &CredentialSet) -> Result<()> {
        let required = self.store.required_key();
        if set.is_empty() {
            return Err(RefreshError::AcquisitionIncomplete(
                "acquirer returned no cookies".into(),
            ));
        }
        if !set.contains(required) {
            return Err(RefreshError::AcquisitionIncomplete(format!(
                "missing required cookie {required}"
            )));
        }
        Ok(())
    }
}

impl Refresher for RefreshCoordinator {
    fn request_refresh(
        &self,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + '_>> {
        Box::pin(RefreshCoordinator::request_refresh(self))
    }
}
