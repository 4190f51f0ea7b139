//! Per-destination quiet interval between outbound actions

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Default)]
pub struct CooldownTracker {
    last_action: Mutex<HashMap<String, Instant>>,
}

impl CooldownTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Suspend until `cooldown` has elapsed since the last action to `destination`,
    /// then record the wake-up time as that destination's last action.
    ///
    /// The slot is reserved before sleeping, so concurrent callers for the same
    /// destination queue up one cooldown apart.
    pub async fn await_cooldown(&self, destination: &str, cooldown: Duration) {
        let now = Instant::now();
        let ready_at = {
            let mut last_action = self.last_action.lock().unwrap_or_else(|e| e.into_inner());
            let ready_at = last_action
                .get(destination)
                .map(|last| *last + cooldown)
                .filter(|ready_at| *ready_at > now)
                .unwrap_or(now);
            last_action.insert(destination.to_string(), ready_at);
            ready_at
        };

        if ready_at > now {
            debug!(
                "Cooldown for {}: waiting {:?}",
                destination,
                ready_at.duration_since(now)
            );
            tokio::time::sleep_until(ready_at).await;
        }
    }

    pub fn last_action(&self, destination: &str) -> Option<Instant> {
        self.last_action
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(destination)
            .copied()
    }

    pub fn tracked(&self) -> usize {
        self.last_action
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::CooldownTracker;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn first_action_is_recorded_without_waiting() {
        let tracker = CooldownTracker::new();
        let start = Instant::now();
        tracker.await_cooldown("a@g.us", Duration::from_secs(3)).await;
        assert_eq!(Instant::now(), start);
        assert_eq!(tracker.last_action("a@g.us"), Some(start));
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_actions_are_separated_by_cooldown() {
        let tracker = CooldownTracker::new();
        let cooldown = Duration::from_secs(3);
        let mut completions = Vec::new();
        for _ in 0..4 {
            tracker.await_cooldown("a@g.us", cooldown).await;
            completions.push(Instant::now());
        }
        for pair in completions.windows(2) {
            assert!(pair[1].duration_since(pair[0]) >= cooldown);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn destinations_do_not_share_cooldown() {
        let tracker = CooldownTracker::new();
        let start = Instant::now();
        tracker.await_cooldown("a@g.us", Duration::from_secs(10)).await;
        tracker.await_cooldown("b@g.us", Duration::from_secs(10)).await;
        assert_eq!(Instant::now(), start);
        assert_eq!(tracker.tracked(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_for_one_destination_are_spaced() {
        let tracker = Arc::new(CooldownTracker::new());
        let cooldown = Duration::from_secs(2);
        let mut handles = Vec::new();
        for _ in 0..3 {
            let tracker = Arc::clone(&tracker);
            handles.push(tokio::spawn(async move {
                tracker.await_cooldown("a@g.us", cooldown).await;
                Instant::now()
            }));
        }
        let mut stamps = Vec::new();
        for handle in handles {
            stamps.push(handle.await.expect("join"));
        }
        stamps.sort();
        for pair in stamps.windows(2) {
            assert!(pair[1].duration_since(pair[0]) >= cooldown);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn elapsed_cooldown_does_not_wait() {
        let tracker = CooldownTracker::new();
        tracker.await_cooldown("a@g.us", Duration::from_secs(3)).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        let before = Instant::now();
        tracker.await_cooldown("a@g.us", Duration::from_secs(3)).await;
        assert_eq!(Instant::now(), before);
    }
}
