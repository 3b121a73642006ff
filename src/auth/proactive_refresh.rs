//! Proactive token refresh scheduler.
//!
//! Keeps a signed-in user's access token warm by refreshing it ahead of
//! expiry. On transient network failure the next attempt backs off
//! exponentially from 30 seconds up to a 16 minute cap; any successful
//! refresh, from this loop or anywhere else, resets the backoff and
//! realigns the schedule to the new expiry.

use crate::error::AuthError;
use async_trait::async_trait;
use std::sync::{Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How far ahead of expiry the scheduler fires.
pub(crate) const OFFSET_DURATION_MS: i64 = 5 * 60 * 1000;
/// First retry wait after a network failure.
pub(crate) const RETRY_MIN_WAIT_MS: u64 = 30_000;
/// Retry wait cap.
pub(crate) const RETRY_MAX_WAIT_MS: u64 = 16 * 60 * 1000;

/// What the scheduler needs from the thing it refreshes.
#[async_trait]
pub(crate) trait RefreshTarget: Send + Sync + 'static {
    /// Absolute access-token expiry, epoch millis. `None` while there is
    /// no token to keep warm.
    fn expiration_time(&self) -> Option<i64>;

    /// Force a refresh exchange now.
    async fn refresh(&self) -> Result<(), AuthError>;

    /// Bumped whenever the token pair changes through any path, so the
    /// scheduler can realign without being told.
    fn token_changes(&self) -> watch::Receiver<u64>;
}

/// One scheduler per signed-in user. Holds its target weakly; the loop
/// exits on its own once the user is dropped.
pub(crate) struct ProactiveRefresh {
    target: Weak<dyn RefreshTarget>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ProactiveRefresh {
    pub(crate) fn new(target: Weak<dyn RefreshTarget>) -> Self {
        Self {
            target,
            handle: Mutex::new(None),
        }
    }

    /// Start the refresh loop. Idempotent while a loop is running.
    pub(crate) fn start(&self) {
        let mut handle = self
            .handle
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let target = self.target.clone();
        *handle = Some(tokio::spawn(run(target)));
    }

    /// Stop the loop. Safe to call when not running.
    pub(crate) fn stop(&self) {
        let mut handle = self
            .handle
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(handle) = handle.take() {
            handle.abort();
        }
    }

    #[cfg(test)]
    pub(crate) fn is_running(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}

impl Drop for ProactiveRefresh {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run(weak: Weak<dyn RefreshTarget>) {
    let mut changes = match weak.upgrade() {
        Some(target) => target.token_changes(),
        None => return,
    };
    // `retry_wait` is Some while in failure backoff.
    let mut retry_wait: Option<u64> = None;

    loop {
        changes.borrow_and_update();
        let wait_ms = match retry_wait {
            Some(ms) => ms,
            None => {
                let Some(target) = weak.upgrade() else { return };
                match target.expiration_time() {
                    Some(expiration) => {
                        let now = chrono::Utc::now().timestamp_millis();
                        (expiration - now - OFFSET_DURATION_MS).max(0) as u64
                    }
                    // No token yet; park until one appears.
                    None => {
                        drop(target);
                        if changes.changed().await.is_err() {
                            return;
                        }
                        continue;
                    }
                }
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(wait_ms)) => {
                let Some(target) = weak.upgrade() else { return };
                match target.refresh().await {
                    Ok(()) => {
                        retry_wait = None;
                    }
                    Err(err) if err.is_network() => {
                        let next = retry_wait
                            .map_or(RETRY_MIN_WAIT_MS, |w| (w * 2).min(RETRY_MAX_WAIT_MS));
                        debug!(wait_ms = next, "proactive refresh hit a network error, backing off");
                        retry_wait = Some(next);
                    }
                    Err(err) => {
                        // Fatal errors are surfaced by the refresh path
                        // itself; the loop just stands down.
                        warn!(%err, "proactive refresh stopped on fatal error");
                        return;
                    }
                }
            }
            changed = changes.changed() => {
                if changed.is_err() {
                    return;
                }
                // Token rotated underneath us; drop any backoff and
                // realign to the new expiry.
                retry_wait = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FakeTarget {
        refreshes: AtomicUsize,
        results: Mutex<Vec<Result<(), AuthError>>>,
        expiration: Mutex<Option<i64>>,
        generation: watch::Sender<u64>,
    }

    impl FakeTarget {
        fn new(expiration: Option<i64>, results: Vec<Result<(), AuthError>>) -> Arc<Self> {
            Arc::new(Self {
                refreshes: AtomicUsize::new(0),
                results: Mutex::new(results),
                expiration: Mutex::new(expiration),
                generation: watch::channel(0).0,
            })
        }

        fn refresh_count(&self) -> usize {
            self.refreshes.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RefreshTarget for FakeTarget {
        fn expiration_time(&self) -> Option<i64> {
            *self.expiration.lock().unwrap()
        }

        async fn refresh(&self) -> Result<(), AuthError> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            let mut results = self.results.lock().unwrap();
            if results.is_empty() {
                // Successful refresh pushes expiry out an hour.
                *self.expiration.lock().unwrap() =
                    Some(chrono::Utc::now().timestamp_millis() + 3_600_000);
                self.generation.send_modify(|g| *g += 1);
                Ok(())
            } else {
                results.remove(0)
            }
        }

        fn token_changes(&self) -> watch::Receiver<u64> {
            self.generation.subscribe()
        }
    }

    fn network_err() -> AuthError {
        AuthError::NetworkRequestFailed("connection reset".to_string())
    }

    #[tokio::test(start_paused = true)]
    async fn test_refreshes_ahead_of_expiry() {
        let now = chrono::Utc::now().timestamp_millis();
        let target = FakeTarget::new(Some(now + 3_600_000), vec![]);
        let scheduler = ProactiveRefresh::new(Arc::downgrade(&target) as Weak<dyn RefreshTarget>);
        scheduler.start();

        // Just before the offset point nothing has fired.
        tokio::time::sleep(Duration::from_millis(3_600_000 - OFFSET_DURATION_MS as u64 - 1000))
            .await;
        assert_eq!(target.refresh_count(), 0);

        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert_eq!(target.refresh_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_failure_backs_off_exponentially() {
        // Already past the refresh point, every attempt fails.
        let now = chrono::Utc::now().timestamp_millis();
        let target = FakeTarget::new(
            Some(now),
            vec![
                Err(network_err()),
                Err(network_err()),
                Err(network_err()),
                Err(network_err()),
                Err(network_err()),
                Err(network_err()),
                Err(network_err()),
            ],
        );
        let scheduler = ProactiveRefresh::new(Arc::downgrade(&target) as Weak<dyn RefreshTarget>);
        scheduler.start();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(target.refresh_count(), 1);

        // 30s, 60s, 120s, 240s, 480s, then capped at 960s.
        for (wait_secs, expected) in [(30, 2), (60, 3), (120, 4), (240, 5), (480, 6), (960, 7)] {
            tokio::time::sleep(Duration::from_secs(wait_secs - 1)).await;
            assert_eq!(target.refresh_count(), expected - 1);
            tokio::time::sleep(Duration::from_secs(2)).await;
            assert_eq!(target.refresh_count(), expected);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_backoff() {
        let now = chrono::Utc::now().timestamp_millis();
        let target = FakeTarget::new(Some(now), vec![Err(network_err())]);
        let scheduler = ProactiveRefresh::new(Arc::downgrade(&target) as Weak<dyn RefreshTarget>);
        scheduler.start();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(target.refresh_count(), 1);

        // Retry after 30s succeeds and pushes expiry out an hour.
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(target.refresh_count(), 2);

        // Next fire is back on the normal schedule, not in backoff.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(target.refresh_count(), 2);
        tokio::time::sleep(Duration::from_millis(3_600_000 - OFFSET_DURATION_MS as u64)).await;
        assert_eq!(target.refresh_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_token_change_clears_backoff() {
        let now = chrono::Utc::now().timestamp_millis();
        let target = FakeTarget::new(Some(now), vec![Err(network_err())]);
        let scheduler = ProactiveRefresh::new(Arc::downgrade(&target) as Weak<dyn RefreshTarget>);
        scheduler.start();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(target.refresh_count(), 1);

        // A refresh elsewhere rotates the pair mid-backoff.
        *target.expiration.lock().unwrap() =
            Some(chrono::Utc::now().timestamp_millis() + 3_600_000);
        target.generation.send_modify(|g| *g += 1);
        tokio::task::yield_now().await;

        // The 30s retry never fires; the next attempt is at the new
        // expiry minus the offset.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(target.refresh_count(), 1);
        tokio::time::sleep(Duration::from_millis(3_600_000 - OFFSET_DURATION_MS as u64)).await;
        assert_eq!(target.refresh_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_stops_the_loop() {
        let now = chrono::Utc::now().timestamp_millis();
        let target = FakeTarget::new(Some(now), vec![Err(AuthError::UserTokenExpired)]);
        let scheduler = ProactiveRefresh::new(Arc::downgrade(&target) as Weak<dyn RefreshTarget>);
        scheduler.start();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(target.refresh_count(), 1);
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(target.refresh_count(), 1);
        assert!(!scheduler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent_and_stop_halts() {
        let now = chrono::Utc::now().timestamp_millis();
        let target = FakeTarget::new(Some(now + 3_600_000), vec![]);
        let scheduler = ProactiveRefresh::new(Arc::downgrade(&target) as Weak<dyn RefreshTarget>);
        scheduler.start();
        scheduler.start();
        assert!(scheduler.is_running());

        scheduler.stop();
        tokio::time::sleep(Duration::from_millis(3_600_000)).await;
        assert_eq!(target.refresh_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_exits_when_target_dropped() {
        let now = chrono::Utc::now().timestamp_millis();
        let target = FakeTarget::new(Some(now + 3_600_000), vec![]);
        let scheduler = ProactiveRefresh::new(Arc::downgrade(&target) as Weak<dyn RefreshTarget>);
        scheduler.start();

        drop(target);
        tokio::time::sleep(Duration::from_millis(3_600_000)).await;
        assert!(!scheduler.is_running());
    }
}
