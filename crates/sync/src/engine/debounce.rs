// Trailing-edge coalescer for change notifications.
//
// Coalesces rapid changes within a configurable window. The latest value
// wins and every push resets the timer. A zero window passes values straight
// through.

use std::time::Duration;

use tokio::time::Instant;

/// Holds at most one pending value and the instant it was last replaced.
#[derive(Debug)]
pub struct Coalescer<T> {
    window: Duration,
    pending: Option<(T, Instant)>,
}

impl<T> Coalescer<T> {
    pub fn new(window: Duration) -> Self {
        Self { window, pending: None }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record a new value. Returns it immediately when the window is zero;
    /// otherwise replaces any pending value and restarts the timer.
    pub fn push(&mut self, value: T) -> Option<T> {
        self.push_at(value, Instant::now())
    }

    pub fn push_at(&mut self, value: T, now: Instant) -> Option<T> {
        self.push_with_at(value, now, |_, newer| newer)
    }

    /// Like `push`, but folds the replaced pending value into the new one
    /// with `combine(pending, newer)` instead of discarding it.
    pub fn push_with(&mut self, value: T, combine: impl FnOnce(T, T) -> T) -> Option<T> {
        self.push_with_at(value, Instant::now(), combine)
    }

    pub fn push_with_at(&mut self, value: T, now: Instant, combine: impl FnOnce(T, T) -> T) -> Option<T> {
        if self.window.is_zero() {
            return Some(value);
        }
        let value = match self.pending.take() {
            Some((pending, _)) => combine(pending, value),
            None => value,
        };
        self.pending = Some((value, now));
        None
    }

    /// Take the pending value if its window has elapsed.
    pub fn take_ready(&mut self) -> Option<T> {
        self.take_ready_at(Instant::now())
    }

    pub fn take_ready_at(&mut self, now: Instant) -> Option<T> {
        let ready = matches!(&self.pending, Some((_, last_seen)) if now.duration_since(*last_seen) >= self.window);
        if ready {
            self.pending.take().map(|(value, _)| value)
        } else {
            None
        }
    }

    /// Take the pending value regardless of the window (drag stop, teardown).
    pub fn flush(&mut self) -> Option<T> {
        self.pending.take().map(|(value, _)| value)
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// When the pending value becomes ready, or None if nothing is pending.
    pub fn deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|(_, last_seen)| *last_seen + self.window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_window_passes_through() {
        let mut coalescer = Coalescer::new(Duration::ZERO);
        assert_eq!(coalescer.push("a"), Some("a"));
        assert_eq!(coalescer.push("b"), Some("b"));
        assert!(!coalescer.is_pending());
    }

    #[test]
    fn value_not_ready_before_window() {
        let mut coalescer = Coalescer::new(Duration::from_millis(300));
        let now = Instant::now();
        assert_eq!(coalescer.push_at(1, now), None);
        assert_eq!(coalescer.take_ready_at(now + Duration::from_millis(150)), None);
        assert!(coalescer.is_pending());
    }

    #[test]
    fn rapid_values_coalesce_last_wins() {
        let mut coalescer = Coalescer::new(Duration::from_millis(500));
        let now = Instant::now();
        coalescer.push_at(1, now);
        coalescer.push_at(2, now + Duration::from_millis(5));

        assert_eq!(coalescer.take_ready_at(now + Duration::from_millis(500)), None);
        assert_eq!(coalescer.take_ready_at(now + Duration::from_millis(505)), Some(2));
        assert_eq!(coalescer.take_ready_at(now + Duration::from_millis(900)), None);
    }

    #[test]
    fn push_resets_deadline() {
        let mut coalescer = Coalescer::new(Duration::from_millis(300));
        let now = Instant::now();
        coalescer.push_at("a", now);
        assert_eq!(coalescer.deadline(), Some(now + Duration::from_millis(300)));
        coalescer.push_at("b", now + Duration::from_millis(200));
        assert_eq!(coalescer.deadline(), Some(now + Duration::from_millis(500)));
    }

    #[test]
    fn combine_folds_replaced_value_into_newer() {
        let mut coalescer = Coalescer::new(Duration::from_millis(300));
        let now = Instant::now();
        let keep_any_remote = |pending: (u32, bool), newer: (u32, bool)| (newer.0, pending.1 || newer.1);
        coalescer.push_with_at((1, true), now, keep_any_remote);
        coalescer.push_with_at((2, false), now + Duration::from_millis(50), keep_any_remote);

        assert_eq!(coalescer.take_ready_at(now + Duration::from_millis(350)), Some((2, true)));
        assert_eq!(coalescer.push_with_at((3, false), now + Duration::from_millis(400), keep_any_remote), None);
        assert_eq!(coalescer.flush(), Some((3, false)));
    }

    #[test]
    fn flush_returns_pending_value_early() {
        let mut coalescer = Coalescer::new(Duration::from_secs(1));
        coalescer.push("final");
        assert_eq!(coalescer.flush(), Some("final"));
        assert_eq!(coalescer.flush(), None);
        assert!(coalescer.deadline().is_none());
    }
}
