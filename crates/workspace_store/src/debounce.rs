use std::time::{Duration, Instant};

/// Trailing-edge debounce with an upper bound on how long a burst can defer work.
///
/// Callers pass `now` explicitly so the schedule can be driven by any clock.
#[derive(Debug, Clone)]
pub struct Debouncer {
    window: Duration,
    max_wait: Duration,
    first_signal: Option<Instant>,
    last_signal: Option<Instant>,
}

impl Debouncer {
    pub const DEFAULT_WINDOW: Duration = Duration::from_millis(300);
    const MAX_WAIT_FACTOR: u32 = 10;

    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            max_wait: window * Self::MAX_WAIT_FACTOR,
            first_signal: None,
            last_signal: None,
        }
    }

    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Records a change. Repeated signals push the deadline out, up to `max_wait`
    /// after the first pending signal.
    pub fn signal(&mut self, now: Instant) {
        self.first_signal.get_or_insert(now);
        self.last_signal = Some(now);
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.last_signal.is_some()
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        let first = self.first_signal?;
        let last = self.last_signal?;
        Some((last + self.window).min(first + self.max_wait))
    }

    /// Returns `true` and resets when the pending work should run now.
    pub fn fire(&mut self, now: Instant) -> bool {
        match self.deadline() {
            Some(deadline) if now >= deadline => {
                self.reset();
                true
            }
            _ => false,
        }
    }

    /// Drops the pending signal, returning whether one existed.
    pub fn take(&mut self) -> bool {
        let pending = self.is_pending();
        self.reset();
        pending
    }

    fn reset(&mut self) {
        self.first_signal = None;
        self.last_signal = None;
    }
}

impl Default for Debouncer {
    fn default() -> Self {
        Self::new(Self::DEFAULT_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(300);

    #[test]
    fn burst_collapses_into_one_trailing_fire() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(WINDOW);

        for step in 0..5 {
            debouncer.signal(start + Duration::from_millis(step * 50));
        }

        assert!(!debouncer.fire(start + Duration::from_millis(400)));
        assert!(debouncer.fire(start + Duration::from_millis(500)));
        assert!(!debouncer.is_pending());
        assert!(!debouncer.fire(start + Duration::from_millis(900)));
    }

    #[test]
    fn steady_stream_still_fires_at_max_wait() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(WINDOW);

        let mut fired_at = None;
        for step in 0..100u64 {
            let now = start + Duration::from_millis(step * 100);
            debouncer.signal(now);
            if debouncer.fire(now) {
                fired_at = Some(step);
                break;
            }
        }

        assert_eq!(fired_at, Some(30));
    }

    #[test]
    fn take_clears_pending_work() {
        let mut debouncer = Debouncer::default();
        assert!(!debouncer.take());
        debouncer.signal(Instant::now());
        assert!(debouncer.take());
        assert_eq!(debouncer.deadline(), None);
    }
}
