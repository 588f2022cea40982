//! Local interval timers.
//!
//! Timers are driven by the caller's clock through `due(now)`. Cancelling a
//! timer only stops this client's interval; shared state is untouched.

use std::collections::BTreeMap;

use realmsync_doc::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimerKind {
    SeasonCheck,
    Autosave,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Interval {
    every: u64,
    next_at: Timestamp,
}

#[derive(Debug, Clone, Default)]
pub struct IntervalTimers {
    timers: BTreeMap<TimerKind, Interval>,
}

impl IntervalTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// (Re)arm `kind` to fire every `every` ms, first at `now + every`.
    pub fn schedule(&mut self, kind: TimerKind, every: u64, now: Timestamp) {
        self.timers.insert(
            kind,
            Interval {
                every,
                next_at: now.saturating_add(every),
            },
        );
    }

    pub fn cancel(&mut self, kind: TimerKind) -> bool {
        self.timers.remove(&kind).is_some()
    }

    pub fn cancel_all(&mut self) {
        self.timers.clear();
    }

    pub fn is_scheduled(&self, kind: TimerKind) -> bool {
        self.timers.contains_key(&kind)
    }

    /// Timers whose deadline has passed, in `TimerKind` order.
    ///
    /// Each fires at most once per call; missed firings are not replayed.
    pub fn due(&mut self, now: Timestamp) -> Vec<TimerKind> {
        let mut fired = Vec::new();
        for (kind, interval) in &mut self.timers {
            if interval.next_at <= now {
                fired.push(*kind);
                interval.next_at = now.saturating_add(interval.every);
            }
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fires_after_interval() {
        let mut timers = IntervalTimers::new();
        timers.schedule(TimerKind::SeasonCheck, 60_000, 0);
        assert!(timers.due(59_999).is_empty());
        assert_eq!(timers.due(60_000), vec![TimerKind::SeasonCheck]);
        assert!(timers.due(60_001).is_empty());
    }

    #[test]
    fn test_missed_firings_collapse() {
        let mut timers = IntervalTimers::new();
        timers.schedule(TimerKind::Autosave, 100, 0);
        assert_eq!(timers.due(1_000), vec![TimerKind::Autosave]);
        assert!(timers.due(1_099).is_empty());
        assert_eq!(timers.due(1_100), vec![TimerKind::Autosave]);
    }

    #[test]
    fn test_cancel_stops_only_that_timer() {
        let mut timers = IntervalTimers::new();
        timers.schedule(TimerKind::SeasonCheck, 10, 0);
        timers.schedule(TimerKind::Autosave, 10, 0);
        assert!(timers.cancel(TimerKind::SeasonCheck));
        assert!(!timers.cancel(TimerKind::SeasonCheck));
        assert_eq!(timers.due(10), vec![TimerKind::Autosave]);
    }
}
