//! Proactive refresh scheduler
//!
//! Wakes on a fixed tick and refreshes the session ahead of need. Checks run
//! in priority order and at most one refresh happens per tick:
//!
//! 1. Maintenance: the local time is the maintenance minute (upstream rotates
//!    sessions around midnight), refresh unconditionally
//! 2. Pre-expiry: the stored set expires within the lead time
//! 3. Preventive: the local time is the preventive minute, a safety net ahead
//!    of the default evening expiry
//!
//! All refreshes go through the injected `Refresher`, so scheduled, reactive
//! and manual triggers never run concurrent acquisitions.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use session_store::{CredentialSet, CredentialStore};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::Refresher;
use crate::error::Result;

/// Times of day and lead time driving proactive refreshes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleWindow {
    pub maintenance: NaiveTime,
    pub preventive: NaiveTime,
    pub lead_time: Duration,
}

/// Why the scheduler decided to refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Maintenance,
    PreExpiry { remaining_secs: i64 },
    Preventive,
}

impl Trigger {
    pub fn label(&self) -> &'static str {
        match self {
            Trigger::Maintenance => "maintenance",
            Trigger::PreExpiry { .. } => "pre_expiry",
            Trigger::Preventive => "preventive",
        }
    }

    fn is_time_of_day(&self) -> bool {
        matches!(self, Trigger::Maintenance | Trigger::Preventive)
    }
}

/// Pick the refresh due at `now`, if any.
///
/// A set that is already expired does not count as pre-expiry; it gets
/// renewed reactively on the next rejected call instead. Neither does a set
/// acquired after its own lead window opened: the upstream would hand back the
/// same expiry, so refreshing it again only repeats the acquisition each tick.
pub fn decide<Tz: TimeZone>(
    now: &DateTime<Tz>,
    set: Option<&CredentialSet>,
    window: &ScheduleWindow,
) -> Option<Trigger> {
    if same_minute(now, window.maintenance) {
        return Some(Trigger::Maintenance);
    }

    if let Some(set) = set
        && let Some(remaining) = set.time_remaining(now.with_timezone(&Utc))
    {
        let lead = chrono::Duration::from_std(window.lead_time).unwrap_or(chrono::Duration::MAX);
        let fresh_inside_window = set
            .expires_at
            .and_then(|expires_at| expires_at.checked_sub_signed(lead))
            .is_some_and(|opens| set.acquired_at >= opens);
        if remaining > chrono::Duration::zero() && remaining < lead && !fresh_inside_window {
            return Some(Trigger::PreExpiry {
                remaining_secs: remaining.num_seconds(),
            });
        }
    }

    if same_minute(now, window.preventive) {
        return Some(Trigger::Preventive);
    }

    None
}

fn same_minute<Tz: TimeZone>(now: &DateTime<Tz>, at: NaiveTime) -> bool {
    now.hour() == at.hour() && now.minute() == at.minute()
}

type Slot = (NaiveDate, u32, u32);

enum RunState {
    Stopped,
    Running {
        stop: watch::Sender<bool>,
        _handle: JoinHandle<()>,
    },
}

/// Background timer issuing proactive refreshes.
pub struct Scheduler {
    refresher: Arc<dyn Refresher>,
    store: Arc<CredentialStore>,
    window: ScheduleWindow,
    tick: Duration,
    run: Mutex<RunState>,
    // A tick landing twice in one minute must not fire a time-of-day trigger twice
    last_slot: Mutex<Option<Slot>>,
    last_check: Mutex<Option<DateTime<Utc>>>,
}

impl Scheduler {
    pub fn new(
        refresher: Arc<dyn Refresher>,
        store: Arc<CredentialStore>,
        window: ScheduleWindow,
        tick: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            refresher,
            store,
            window,
            tick,
            run: Mutex::new(RunState::Stopped),
            last_slot: Mutex::new(None),
            last_check: Mutex::new(None),
        })
    }

    /// Start ticking. Returns false if already running.
    pub async fn start(self: &Arc<Self>) -> bool {
        let mut run = self.run.lock().await;
        if matches!(*run, RunState::Running { .. }) {
            return false;
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let scheduler = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scheduler.tick);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // Skip the immediate first tick; startup already checked the session
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stop_rx.wait_for(|stopped| *stopped) => break,
                }
                // Stopping abandons the wait; an acquisition already started
                // still completes inside the coordinator
                let now = Local::now();
                tokio::select! {
                    _ = scheduler.evaluate(&now) => {}
                    _ = stop_rx.wait_for(|stopped| *stopped) => break,
                }
            }
            debug!("scheduler loop exited");
        });

        *run = RunState::Running {
            stop: stop_tx,
            _handle: handle,
        };
        info!(
            tick_secs = self.tick.as_secs(),
            maintenance = %self.window.maintenance.format("%H:%M"),
            preventive = %self.window.preventive.format("%H:%M"),
            lead_secs = self.window.lead_time.as_secs(),
            "scheduler started"
        );
        true
    }

    /// Stop ticking. Idempotent; never waits for an in-flight refresh.
    pub async fn stop(&self) {
        let mut run = self.run.lock().await;
        if let RunState::Running { stop, .. } = std::mem::replace(&mut *run, RunState::Stopped) {
            let _ = stop.send(true);
            info!("scheduler stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        matches!(*self.run.lock().await, RunState::Running { .. })
    }

    /// Run one scheduling check at `now`, refreshing if a trigger is due.
    ///
    /// Returns the trigger acted on. A failed refresh is logged and not
    /// retried until the next tick.
    pub async fn evaluate<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Option<Trigger> {
        *self.last_check.lock().await = Some(now.with_timezone(&Utc));

        let set = self.store.get().await;
        let trigger = decide(now, set.as_deref(), &self.window)?;

        if trigger.is_time_of_day() {
            let slot = (now.date_naive(), now.hour(), now.minute());
            let mut last = self.last_slot.lock().await;
            if *last == Some(slot) {
                debug!(trigger = trigger.label(), "already refreshed in this minute");
                return None;
            }
            *last = Some(slot);
        }

        info!(trigger = trigger.label(), "scheduled credential refresh");
        match self.refresher.request_refresh().await {
            Ok(()) => info!(trigger = trigger.label(), "scheduled refresh completed"),
            Err(e) => warn!(trigger = trigger.label(), error = %e, "scheduled refresh failed"),
        }
        Some(trigger)
    }

    /// On-demand refresh through the same coordinator as scheduled ones.
    pub async fn trigger_refresh(&self) -> Result<()> {
        info!("manual credential refresh requested");
        self.refresher.request_refresh().await
    }

    pub async fn last_check(&self) -> Option<DateTime<Utc>> {
        *self.last_check.lock().await
    }

    pub fn window(&self) -> &ScheduleWindow {
        &self.window
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RefreshError;
    use chrono::FixedOffset;
    use std::collections::HashMap;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Refresher that counts calls.
    struct CountingRefresher {
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingRefresher {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Refresher for CountingRefresher {
        fn request_refresh(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if self.fail {
                    Err(RefreshError::AcquisitionFailed("no browser".into()))
                } else {
                    Ok(())
                }
            })
        }
    }

    /// Refresher whose refresh never finishes.
    struct StuckRefresher {
        calls: AtomicUsize,
    }

    impl Refresher for StuckRefresher {
        fn request_refresh(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                std::future::pending::<Result<()>>().await
            })
        }
    }

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn window() -> ScheduleWindow {
        ScheduleWindow {
            maintenance: hm(0, 5),
            preventive: hm(19, 30),
            lead_time: Duration::from_secs(30 * 60),
        }
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(8 * 3600)
            .unwrap()
            .with_ymd_and_hms(2026, 3, 10, h, m, s)
            .unwrap()
    }

    fn set_expiring(expires_at: DateTime<Utc>) -> CredentialSet {
        let mut values = HashMap::new();
        values.insert("sid".to_string(), "abc".to_string());
        CredentialSet::new(values, expires_at - chrono::Duration::hours(10), Some(expires_at))
    }

    async fn store_with(
        dir: &tempfile::TempDir,
        set: Option<CredentialSet>,
    ) -> Arc<CredentialStore> {
        let store = CredentialStore::load(dir.path().join("session.json"), "sid")
            .await
            .unwrap();
        if let Some(set) = set {
            store.replace(set).await.unwrap();
        }
        Arc::new(store)
    }

    #[test]
    fn maintenance_minute_refreshes_unconditionally() {
        assert_eq!(decide(&at(0, 5, 0), None, &window()), Some(Trigger::Maintenance));
        assert_eq!(decide(&at(0, 5, 59), None, &window()), Some(Trigger::Maintenance));
        assert_eq!(decide(&at(0, 6, 0), None, &window()), None);
    }

    #[test]
    fn maintenance_beats_pre_expiry() {
        let now = at(0, 5, 10);
        let set = set_expiring(now.with_timezone(&Utc) + chrono::Duration::minutes(10));
        assert_eq!(decide(&now, Some(&set), &window()), Some(Trigger::Maintenance));
    }

    #[test]
    fn pre_expiry_inside_lead_time() {
        let now = at(14, 0, 0);
        let set = set_expiring(now.with_timezone(&Utc) + chrono::Duration::minutes(29));
        assert_eq!(
            decide(&now, Some(&set), &window()),
            Some(Trigger::PreExpiry { remaining_secs: 29 * 60 })
        );
    }

    #[test]
    fn pre_expiry_ignores_distant_and_passed_expiry() {
        let now = at(14, 0, 0);
        let utc = now.with_timezone(&Utc);

        let distant = set_expiring(utc + chrono::Duration::minutes(31));
        assert_eq!(decide(&now, Some(&distant), &window()), None);

        let boundary = set_expiring(utc + chrono::Duration::minutes(30));
        assert_eq!(decide(&now, Some(&boundary), &window()), None);

        let expired = set_expiring(utc - chrono::Duration::minutes(1));
        assert_eq!(decide(&now, Some(&expired), &window()), None);

        let exactly_now = set_expiring(utc);
        assert_eq!(decide(&now, Some(&exactly_now), &window()), None);
    }

    #[test]
    fn preventive_minute_as_fallback() {
        let now = at(19, 30, 0);
        let healthy = set_expiring(now.with_timezone(&Utc) + chrono::Duration::hours(12));
        assert_eq!(decide(&now, Some(&healthy), &window()), Some(Trigger::Preventive));
        assert_eq!(decide(&now, None, &window()), Some(Trigger::Preventive));
    }

    #[test]
    fn pre_expiry_skips_set_acquired_inside_lead_time() {
        // Fallback expiry of 20:00 with a refresh at 19:40 local
        let now = at(19, 41, 0);
        let expires_at = at(20, 0, 0).with_timezone(&Utc);
        let mut values = HashMap::new();
        values.insert("sid".to_string(), "abc".to_string());
        let set = CredentialSet::new(
            values,
            at(19, 40, 0).with_timezone(&Utc),
            Some(expires_at),
        );

        assert_eq!(decide(&now, Some(&set), &window()), None);
    }

    #[test]
    fn pre_expiry_beats_preventive() {
        let now = at(19, 30, 0);
        let set = set_expiring(now.with_timezone(&Utc) + chrono::Duration::minutes(5));
        assert!(matches!(
            decide(&now, Some(&set), &window()),
            Some(Trigger::PreExpiry { .. })
        ));
    }

    #[tokio::test]
    async fn evaluate_refreshes_once_when_windows_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let now = at(0, 5, 0);
        let store = store_with(
            &dir,
            Some(set_expiring(now.with_timezone(&Utc) + chrono::Duration::minutes(10))),
        )
        .await;
        let refresher = CountingRefresher::new(false);
        let scheduler = Scheduler::new(refresher.clone(), store, window(), Duration::from_secs(60));

        assert_eq!(scheduler.evaluate(&now).await, Some(Trigger::Maintenance));
        assert_eq!(refresher.calls(), 1);
        assert_eq!(scheduler.last_check().await, Some(now.with_timezone(&Utc)));
    }

    #[tokio::test]
    async fn evaluate_fires_time_of_day_trigger_once_per_minute() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(&dir, None).await;
        let refresher = CountingRefresher::new(false);
        let scheduler = Scheduler::new(refresher.clone(), store, window(), Duration::from_secs(60));

        assert_eq!(scheduler.evaluate(&at(19, 30, 1)).await, Some(Trigger::Preventive));
        assert_eq!(scheduler.evaluate(&at(19, 30, 59)).await, None);
        assert_eq!(refresher.calls(), 1);
    }

    #[tokio::test]
    async fn evaluate_logs_failure_and_moves_on() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(&dir, None).await;
        let refresher = CountingRefresher::new(true);
        let scheduler = Scheduler::new(refresher.clone(), store, window(), Duration::from_secs(60));

        assert_eq!(scheduler.evaluate(&at(0, 5, 0)).await, Some(Trigger::Maintenance));
        assert_eq!(scheduler.evaluate(&at(12, 0, 0)).await, None);
        assert_eq!(refresher.calls(), 1, "failure must not be retried within the tick");
    }

    #[tokio::test]
    async fn trigger_refresh_goes_through_refresher() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(&dir, None).await;
        let refresher = CountingRefresher::new(true);
        let scheduler = Scheduler::new(refresher.clone(), store, window(), Duration::from_secs(60));

        let err = scheduler.trigger_refresh().await.unwrap_err();
        assert_eq!(err, RefreshError::AcquisitionFailed("no browser".into()));
        assert_eq!(refresher.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn running_scheduler_refreshes_on_tick() {
        let dir = tempfile::tempdir().unwrap();
        // Expiry inside the lead window triggers on every tick regardless of
        // the wall-clock minute
        let store = store_with(
            &dir,
            Some(set_expiring(Utc::now() + chrono::Duration::minutes(10))),
        )
        .await;
        let refresher = CountingRefresher::new(false);
        let scheduler = Scheduler::new(refresher.clone(), store, window(), Duration::from_secs(60));

        assert!(scheduler.start().await);
        assert!(!scheduler.start().await, "second start must be rejected");
        assert!(scheduler.is_running().await);

        // The first tick is skipped
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(refresher.calls(), 0);

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(refresher.calls(), 1);

        scheduler.stop().await;
        scheduler.stop().await;
        assert!(!scheduler.is_running().await);

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(refresher.calls(), 1, "no refreshes after stop");
    }

    #[tokio::test(start_paused = true)]
    async fn stop_does_not_wait_for_in_flight_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(
            &dir,
            Some(set_expiring(Utc::now() + chrono::Duration::minutes(10))),
        )
        .await;
        let refresher = Arc::new(StuckRefresher {
            calls: AtomicUsize::new(0),
        });
        let scheduler = Scheduler::new(refresher.clone(), store, window(), Duration::from_secs(60));

        assert!(scheduler.start().await);
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1, "refresh must be in flight");

        tokio::time::timeout(Duration::from_secs(1), scheduler.stop())
            .await
            .expect("stop must return while the refresh is still pending");
        assert!(!scheduler.is_running().await);

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1, "no ticks after stop");
    }
}
