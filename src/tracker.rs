/// Detection tracking for monitored regions.
///
/// The pipeline reports every match of a monitored region; the tracker turns
/// that stream into edges. The first detection of a key is an entry, repeat
/// detections are suppressed, and a key not seen for the exit period is
/// swept out as an exit.
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, PoisonError};

use crate::defaults::EXIT_PERIOD_MS;

/// Outcome of recording one detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detection {
    /// Key was not inside before this detection
    Entered,
    /// Key was already inside; nothing to report
    Inside,
}

/// Entry/exit bookkeeping keyed by `K`.
pub trait DetectionTracker<K>: Send + Sync {
    /// Record a detection of `key` at `timestamp` (ms).
    fn record_detection(&self, key: &K, timestamp: u64) -> Detection;

    /// Remove and return every key whose last detection is at least the exit
    /// period older than `now` (ms). Each key is returned once per stay.
    fn take_exited(&self, now: u64) -> Vec<K>;

    /// Drop `key` without reporting an exit.
    fn forget(&self, key: &K);

    fn exit_period_ms(&self) -> u64;
}

/// In-memory tracker with a fixed exit period.
pub struct ExitPeriodTracker<K> {
    exit_period_ms: u64,
    last_seen: Mutex<HashMap<K, u64>>,
}

impl<K> ExitPeriodTracker<K> {
    pub fn new(exit_period_ms: u64) -> Self {
        Self {
            exit_period_ms,
            last_seen: Mutex::new(HashMap::new()),
        }
    }
}

impl<K> Default for ExitPeriodTracker<K> {
    fn default() -> Self {
        Self::new(EXIT_PERIOD_MS)
    }
}

impl<K> DetectionTracker<K> for ExitPeriodTracker<K>
where
    K: Clone + Eq + Hash + Send,
{
    fn record_detection(&self, key: &K, timestamp: u64) -> Detection {
        let mut seen = self.last_seen.lock().unwrap_or_else(PoisonError::into_inner);
        match seen.get_mut(key) {
            Some(last) => {
                // Workers finish out of order; keep the newest sighting
                *last = (*last).max(timestamp);
                Detection::Inside
            }
            None => {
                seen.insert(key.clone(), timestamp);
                Detection::Entered
            }
        }
    }

    fn take_exited(&self, now: u64) -> Vec<K> {
        let mut seen = self.last_seen.lock().unwrap_or_else(PoisonError::into_inner);
        let exited: Vec<K> = seen
            .iter()
            .filter(|(_, last)| now.saturating_sub(**last) >= self.exit_period_ms)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &exited {
            seen.remove(key);
        }
        exited
    }

    fn forget(&self, key: &K) {
        self.last_seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    fn exit_period_ms(&self) -> u64 {
        self.exit_period_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_detection_enters() {
        let tracker = ExitPeriodTracker::<&str>::new(1000);
        assert_eq!(tracker.record_detection(&"a", 0), Detection::Entered);
        assert_eq!(tracker.record_detection(&"a", 10), Detection::Inside);
        assert_eq!(tracker.record_detection(&"b", 10), Detection::Entered);
    }

    #[test]
    fn exit_after_quiet_period() {
        let tracker = ExitPeriodTracker::<&str>::new(1000);
        tracker.record_detection(&"a", 0);
        assert!(tracker.take_exited(999).is_empty());
        assert_eq!(tracker.take_exited(1000), vec!["a"]);
        // Reported once
        assert!(tracker.take_exited(5000).is_empty());
    }

    #[test]
    fn fresh_detection_postpones_exit() {
        let tracker = ExitPeriodTracker::<&str>::new(1000);
        tracker.record_detection(&"a", 0);
        tracker.record_detection(&"a", 800);
        assert!(tracker.take_exited(1500).is_empty());
        assert_eq!(tracker.take_exited(1800), vec!["a"]);
    }

    #[test]
    fn late_older_sighting_does_not_rewind() {
        let tracker = ExitPeriodTracker::<&str>::new(1000);
        tracker.record_detection(&"a", 800);
        tracker.record_detection(&"a", 100);
        assert!(tracker.take_exited(1500).is_empty());
    }

    #[test]
    fn reentry_after_exit() {
        let tracker = ExitPeriodTracker::<&str>::new(1000);
        tracker.record_detection(&"a", 0);
        tracker.take_exited(2000);
        assert_eq!(tracker.record_detection(&"a", 2500), Detection::Entered);
    }

    #[test]
    fn forget_suppresses_exit() {
        let tracker = ExitPeriodTracker::<&str>::new(1000);
        tracker.record_detection(&"a", 0);
        tracker.forget(&"a");
        assert!(tracker.take_exited(5000).is_empty());
    }

    #[test]
    fn default_exit_period() {
        assert_eq!(ExitPeriodTracker::<u32>::default().exit_period_ms(), 10_000);
    }
}
