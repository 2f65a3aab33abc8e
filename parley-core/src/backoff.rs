//! Bounded linear backoff for reconnection attempts (delay = base × attempt).

use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max_attempts: u32,
    attempt: u32,
    next_at: Option<Instant>,
}

impl Backoff {
    pub fn new(base: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max_attempts,
            attempt: 0,
            next_at: None,
        }
    }

    /// Schedule the next attempt from `now`. Returns `false` once attempts are exhausted.
    pub fn schedule(&mut self, now: Instant) -> bool {
        if self.attempt >= self.max_attempts {
            self.next_at = None;
            return false;
        }
        self.attempt += 1;
        self.next_at = Some(now + self.base * self.attempt);
        true
    }

    /// True (once) when the scheduled attempt is due.
    pub fn due(&mut self, now: Instant) -> bool {
        match self.next_at {
            Some(t) if now >= t => {
                self.next_at = None;
                true
            }
            _ => false,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_with_attempt() {
        let start = Instant::now();
        let mut b = Backoff::new(Duration::from_millis(100), 3);
        assert!(b.schedule(start));
        assert!(!b.due(start + Duration::from_millis(99)));
        assert!(b.due(start + Duration::from_millis(100)));
        assert!(!b.due(start + Duration::from_millis(100)));

        assert!(b.schedule(start));
        assert!(!b.due(start + Duration::from_millis(150)));
        assert!(b.due(start + Duration::from_millis(200)));
        assert_eq!(b.attempt(), 2);
    }

    #[test]
    fn exhausts_after_max_attempts() {
        let now = Instant::now();
        let mut b = Backoff::new(Duration::from_millis(10), 2);
        assert!(b.schedule(now));
        assert!(b.schedule(now));
        assert!(b.is_exhausted());
        assert!(!b.schedule(now));
        assert!(!b.due(now + Duration::from_secs(10)));
    }
}
