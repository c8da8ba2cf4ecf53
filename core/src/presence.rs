/// Presence inference from last-liveness timestamps
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

pub const DEFAULT_FRESHNESS_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Online iff `now - last_seen < window`; a peer never seen is offline
pub fn is_online_at(last_seen: Option<DateTime<Utc>>, now: DateTime<Utc>, window: Duration) -> bool {
    let Some(last_seen) = last_seen else {
        return false;
    };
    let window = TimeDelta::from_std(window).unwrap_or(TimeDelta::MAX);
    now.signed_duration_since(last_seen) < window
}

/// Same as [`is_online_at`] with the wall clock read now
pub fn is_online(last_seen: Option<DateTime<Utc>>, window: Duration) -> bool {
    is_online_at(last_seen, Utc::now(), window)
}

/// Human "last seen" label: Never / Online / 5m ago / 3h ago / 2d ago
pub fn last_seen_text(last_seen: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    let Some(last_seen) = last_seen else {
        return "Never".to_string();
    };
    let minutes = now.signed_duration_since(last_seen).num_minutes();
    if minutes < 1 {
        "Online".to_string()
    } else if minutes < 60 {
        format!("{}m ago", minutes)
    } else if minutes < 24 * 60 {
        format!("{}h ago", minutes / 60)
    } else {
        format!("{}d ago", minutes / (24 * 60))
    }
}

/// Presence estimator bound to one freshness window
#[derive(Debug, Clone, Copy)]
pub struct PresenceEstimator {
    window: Duration,
}

impl PresenceEstimator {
    pub fn new(window: Duration) -> Self {
        Self { window }
    }

    pub fn is_online(&self, last_seen: Option<DateTime<Utc>>) -> bool {
        is_online(last_seen, self.window)
    }

    pub fn is_online_at(&self, last_seen: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        is_online_at(last_seen, now, self.window)
    }
}

impl Default for PresenceEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_FRESHNESS_WINDOW)
    }
}

/// A peer crossing the freshness boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceChange {
    pub peer_id: String,
    pub online: bool,
}

/// Last known heartbeat per peer, with the presence reported at the previous evaluation
#[derive(Debug)]
pub struct PresenceTracker {
    estimator: PresenceEstimator,
    last_seen: HashMap<String, Option<DateTime<Utc>>>,
    reported: HashMap<String, bool>,
}

impl PresenceTracker {
    pub fn new(estimator: PresenceEstimator) -> Self {
        Self {
            estimator,
            last_seen: HashMap::new(),
            reported: HashMap::new(),
        }
    }

    /// Record a heartbeat; an older timestamp never replaces a newer one
    pub fn update_last_seen(&mut self, peer_id: &str, last_seen: Option<DateTime<Utc>>) {
        let slot = self.last_seen.entry(peer_id.to_string()).or_insert(None);
        if last_seen > *slot {
            *slot = last_seen;
        }
    }

    pub fn last_seen(&self, peer_id: &str) -> Option<DateTime<Utc>> {
        self.last_seen.get(peer_id).copied().flatten()
    }

    pub fn is_online_at(&self, peer_id: &str, now: DateTime<Utc>) -> bool {
        self.estimator.is_online_at(self.last_seen(peer_id), now)
    }

    /// Re-evaluate every peer and return the ones whose presence flipped.
    /// A peer evaluated for the first time is reported as a change.
    pub fn evaluate_at(&mut self, now: DateTime<Utc>) -> Vec<PresenceChange> {
        let mut changes = Vec::new();
        for (peer_id, last_seen) in &self.last_seen {
            let online = self.estimator.is_online_at(*last_seen, now);
            if self.reported.insert(peer_id.clone(), online) != Some(online) {
                changes.push(PresenceChange {
                    peer_id: peer_id.clone(),
                    online,
                });
            }
        }
        changes.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        changes
    }
}

/// Re-evaluate presence on a fixed tick and broadcast transitions.
///
/// Runs until the returned handle is aborted. Lives beside the sync core, never inside its event path.
pub fn spawn_presence_ticker(
    tracker: Arc<RwLock<PresenceTracker>>,
    every: Duration,
    tx: broadcast::Sender<PresenceChange>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let changes = tracker.write().await.evaluate_at(Utc::now());
            for change in changes {
                debug!(
                    "Presence: {} is now {}",
                    change.peer_id,
                    if change.online { "online" } else { "offline" }
                );
                // No receivers is fine
                let _ = tx.send(change);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn base() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn test_presence_decays_with_only_now_advancing() {
        let seen = Some(base());
        let window = DEFAULT_FRESHNESS_WINDOW;

        assert!(is_online_at(seen, base() + TimeDelta::seconds(4 * 60 + 59), window));
        assert!(!is_online_at(seen, base() + TimeDelta::seconds(5 * 60), window));
        assert!(!is_online_at(seen, base() + TimeDelta::seconds(5 * 60 + 1), window));
    }

    #[test]
    fn test_never_seen_is_offline() {
        assert!(!is_online_at(None, base(), DEFAULT_FRESHNESS_WINDOW));
        assert!(!PresenceEstimator::default().is_online(None));
        assert!(PresenceEstimator::default().is_online(Some(Utc::now())));
    }

    #[test]
    fn test_last_seen_text_buckets() {
        let now = base();
        assert_eq!(last_seen_text(None, now), "Never");
        assert_eq!(last_seen_text(Some(now - TimeDelta::seconds(59)), now), "Online");
        assert_eq!(last_seen_text(Some(now - TimeDelta::minutes(7)), now), "7m ago");
        assert_eq!(last_seen_text(Some(now - TimeDelta::minutes(119)), now), "1h ago");
        assert_eq!(last_seen_text(Some(now - TimeDelta::hours(50)), now), "2d ago");
    }

    #[test]
    fn test_tracker_reports_only_transitions() {
        let mut tracker = PresenceTracker::new(PresenceEstimator::default());
        tracker.update_last_seen("bob", Some(base()));
        tracker.update_last_seen("carol", None);

        let first = tracker.evaluate_at(base() + TimeDelta::minutes(1));
        assert_eq!(
            first,
            vec![
                PresenceChange { peer_id: "bob".into(), online: true },
                PresenceChange { peer_id: "carol".into(), online: false },
            ]
        );

        assert!(tracker.evaluate_at(base() + TimeDelta::minutes(2)).is_empty());

        let decayed = tracker.evaluate_at(base() + TimeDelta::minutes(6));
        assert_eq!(decayed, vec![PresenceChange { peer_id: "bob".into(), online: false }]);

        // Stale heartbeat does not rewind
        tracker.update_last_seen("bob", Some(base() - TimeDelta::hours(1)));
        assert_eq!(tracker.last_seen("bob"), Some(base()));

        tracker.update_last_seen("bob", Some(base() + TimeDelta::minutes(6)));
        let back = tracker.evaluate_at(base() + TimeDelta::minutes(7));
        assert_eq!(back, vec![PresenceChange { peer_id: "bob".into(), online: true }]);
    }

    #[tokio::test]
    async fn test_ticker_broadcasts_changes() {
        let mut tracker = PresenceTracker::new(PresenceEstimator::default());
        tracker.update_last_seen("bob", Some(Utc::now()));
        let tracker = Arc::new(RwLock::new(tracker));
        let (tx, mut rx) = broadcast::channel(16);

        let handle = spawn_presence_ticker(tracker, Duration::from_millis(10), tx);
        let change = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        handle.abort();

        assert_eq!(change, PresenceChange { peer_id: "bob".into(), online: true });
    }
}
