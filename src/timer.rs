//! A countdown timer for the upper layer protocol watchdogs.
//!
//! The protocol uses one instance as the association request/release
//! timer (ARTIM) and another as the optional network idle timer.

use std::time::{Duration, Instant};

/// A monotonic countdown timer.
///
/// A timer with no timeout never expires.
/// Until started, the timer reports no expiry
/// and the full timeout as remaining time.
#[derive(Debug, Clone)]
pub struct Timer {
    timeout: Option<Duration>,
    started_at: Option<Instant>,
}

impl Timer {
    /// Create a new timer with the given timeout.
    /// The timer is not started.
    pub fn new(timeout: Option<Duration>) -> Self {
        Timer {
            timeout,
            started_at: None,
        }
    }

    /// Reset and start the timer.
    pub fn start(&mut self) {
        self.started_at = Some(Instant::now());
    }

    /// Restart the timer from the beginning of its timeout.
    pub fn restart(&mut self) {
        self.start();
    }

    /// Stop and reset the timer.
    pub fn stop(&mut self) {
        self.started_at = None;
    }

    /// Whether the timer is currently running.
    pub fn is_running(&self) -> bool {
        self.started_at.is_some()
    }

    /// Whether the timer has been started and its timeout has passed.
    pub fn expired(&self) -> bool {
        match (self.timeout, self.started_at) {
            (Some(timeout), Some(started_at)) => started_at.elapsed() > timeout,
            _ => false,
        }
    }

    /// The time remaining until expiry,
    /// or `None` if the timer never expires.
    /// Returns the full timeout while the timer is not running.
    pub fn remaining(&self) -> Option<Duration> {
        let timeout = self.timeout?;
        match self.started_at {
            Some(started_at) => Some(timeout.saturating_sub(started_at.elapsed())),
            None => Some(timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Timer;
    use std::time::Duration;

    #[test]
    fn timer_without_timeout_never_expires() {
        let mut timer = Timer::new(None);
        assert!(!timer.expired());
        timer.start();
        assert!(!timer.expired());
        assert_eq!(timer.remaining(), None);
    }

    #[test]
    fn timer_expires_only_after_start() {
        let mut timer = Timer::new(Some(Duration::from_millis(1)));
        std::thread::sleep(Duration::from_millis(5));
        // not started yet
        assert!(!timer.expired());
        assert_eq!(timer.remaining(), Some(Duration::from_millis(1)));

        timer.start();
        std::thread::sleep(Duration::from_millis(5));
        assert!(timer.expired());
        assert_eq!(timer.remaining(), Some(Duration::ZERO));

        // stopping resets the expiry
        timer.stop();
        assert!(!timer.expired());
    }

    #[test]
    fn timer_restart_postpones_expiry() {
        let mut timer = Timer::new(Some(Duration::from_secs(3600)));
        timer.start();
        assert!(!timer.expired());
        timer.restart();
        assert!(!timer.expired());
        assert!(timer.is_running());
    }
}
