use std::time::Duration;

use crate::error::FirestoreError;
use crate::util::DelayedOperation;

/// Failures of the watch stream tolerated before reporting `Offline`.
const MAX_WATCH_STREAM_FAILURES: u32 = 1;

/// How long a connection attempt may stay unanswered before reporting
/// `Offline`.
pub const ONLINE_STATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Best guess of whether the backend is reachable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum OnlineState {
    /// No connection attempt resolved yet. Raised events are not flagged as
    /// coming from cache until a timeout or a failure says otherwise.
    #[default]
    Unknown,
    Online,
    /// Views raise events marked as coming from cache.
    Offline,
}

/// Derives the [`OnlineState`] from watch stream health.
///
/// Each method returns the new state when it changed, so the caller can
/// broadcast it. The connection timeout is scheduled by the caller through
/// the `schedule_timeout` closure and comes back as
/// [`handle_online_state_timeout`](Self::handle_online_state_timeout).
pub struct OnlineStateTracker {
    state: OnlineState,
    watch_stream_failures: u32,
    online_state_timer: Option<DelayedOperation>,
    should_warn_client_is_offline: bool,
}

impl OnlineStateTracker {
    pub fn new() -> Self {
        Self {
            state: OnlineState::Unknown,
            watch_stream_failures: 0,
            online_state_timer: None,
            should_warn_client_is_offline: true,
        }
    }

    pub fn state(&self) -> OnlineState {
        self.state
    }

    /// Called when the watch stream starts connecting. Arms the timeout on the
    /// first attempt after a healthy period.
    pub fn handle_watch_stream_start<F>(&mut self, schedule_timeout: F) -> Option<OnlineState>
    where
        F: FnOnce() -> DelayedOperation,
    {
        if self.watch_stream_failures != 0 {
            return None;
        }
        let changed = self.set_and_report(OnlineState::Unknown);
        self.clear_online_state_timer();
        self.online_state_timer = Some(schedule_timeout());
        changed
    }

    pub fn handle_online_state_timeout(&mut self) -> Option<OnlineState> {
        self.online_state_timer = None;
        if self.state != OnlineState::Unknown {
            return None;
        }
        self.log_client_offline_warning_if_necessary(&format!(
            "Backend didn't respond within {} seconds.",
            ONLINE_STATE_TIMEOUT.as_secs()
        ));
        self.set_and_report(OnlineState::Offline)
    }

    pub fn handle_watch_stream_failure(&mut self, error: &FirestoreError) -> Option<OnlineState> {
        if self.state == OnlineState::Online {
            // A healthy stream dropped; try again before declaring offline.
            self.watch_stream_failures = 0;
            return self.set_and_report(OnlineState::Unknown);
        }

        self.watch_stream_failures += 1;
        if self.watch_stream_failures >= MAX_WATCH_STREAM_FAILURES {
            self.clear_online_state_timer();
            self.log_client_offline_warning_if_necessary(&format!(
                "Connection failed {} times. Most recent error: {}",
                MAX_WATCH_STREAM_FAILURES, error
            ));
            return self.set_and_report(OnlineState::Offline);
        }
        None
    }

    /// Explicit transition, used for `Online` on any watch message and for
    /// `Offline` when the network is disabled.
    pub fn set(&mut self, state: OnlineState) -> Option<OnlineState> {
        self.clear_online_state_timer();
        self.watch_stream_failures = 0;
        if state == OnlineState::Online {
            self.should_warn_client_is_offline = false;
        }
        self.set_and_report(state)
    }

    fn set_and_report(&mut self, state: OnlineState) -> Option<OnlineState> {
        if self.state == state {
            return None;
        }
        log::debug!("online state: {:?} -> {:?}", self.state, state);
        self.state = state;
        Some(state)
    }

    fn log_client_offline_warning_if_necessary(&mut self, details: &str) {
        let message = format!(
            "Could not reach the backend. {details}\nThe client will operate in offline mode until it is able to \
             reach the backend."
        );
        if self.should_warn_client_is_offline {
            log::warn!("{message}");
            self.should_warn_client_is_offline = false;
        } else {
            log::debug!("{message}");
        }
    }

    fn clear_online_state_timer(&mut self) {
        if let Some(timer) = self.online_state_timer.take() {
            timer.cancel();
        }
    }
}

impl Default for OnlineStateTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::unavailable;
    use crate::util::{AsyncQueue, TimerId};

    fn arm(queue: &AsyncQueue) -> impl FnOnce() -> DelayedOperation + '_ {
        move || queue.enqueue_after_delay(TimerId::OnlineStateTimeout, ONLINE_STATE_TIMEOUT, async {})
    }

    #[tokio::test]
    async fn first_failure_reports_offline() {
        let queue = AsyncQueue::new();
        let mut tracker = OnlineStateTracker::new();
        assert_eq!(tracker.handle_watch_stream_start(arm(&queue)), None);
        assert!(queue.contains_delayed_operation(TimerId::OnlineStateTimeout));

        let changed = tracker.handle_watch_stream_failure(&unavailable("connection refused"));
        assert_eq!(changed, Some(OnlineState::Offline));
        assert!(!queue.contains_delayed_operation(TimerId::OnlineStateTimeout));

        // Further restarts stay offline until a message arrives.
        assert_eq!(tracker.handle_watch_stream_start(arm(&queue)), None);
        assert_eq!(tracker.set(OnlineState::Online), Some(OnlineState::Online));
    }

    #[tokio::test]
    async fn timeout_reports_offline_only_from_unknown() {
        let queue = AsyncQueue::new();
        let mut tracker = OnlineStateTracker::new();
        tracker.handle_watch_stream_start(arm(&queue));
        assert_eq!(tracker.handle_online_state_timeout(), Some(OnlineState::Offline));

        tracker.set(OnlineState::Online);
        assert_eq!(tracker.handle_online_state_timeout(), None);
        assert_eq!(tracker.state(), OnlineState::Online);
    }

    #[tokio::test]
    async fn online_stream_failure_retries_before_going_offline() {
        let queue = AsyncQueue::new();
        let mut tracker = OnlineStateTracker::new();
        tracker.set(OnlineState::Online);

        let changed = tracker.handle_watch_stream_failure(&unavailable("reset"));
        assert_eq!(changed, Some(OnlineState::Unknown));
        tracker.handle_watch_stream_start(arm(&queue));
        assert!(queue.contains_delayed_operation(TimerId::OnlineStateTimeout));
        assert_eq!(
            tracker.handle_watch_stream_failure(&unavailable("reset")),
            Some(OnlineState::Offline)
        );
    }
}
