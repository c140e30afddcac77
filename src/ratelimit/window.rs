//! Time windows and clocks.
//!
//! Window boundaries are a pure function of wall-clock time and the window
//! length: a window starts at `floor(unix_secs / len) * len`. Two processes
//! sharing a counter store therefore agree on which window a request falls
//! into without coordinating.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use crate::error::{Result, TurnstileError};

/// Source of wall-clock time.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
pub(crate) use mock::MockClock;

#[cfg(test)]
mod mock {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{DateTime, TimeZone, Utc};
    use parking_lot::Mutex;

    use super::Clock;

    /// Manually driven clock for tests.
    ///
    /// Clones share the same underlying time, so advancing one advances all.
    #[derive(Debug, Clone)]
    pub struct MockClock {
        current: Arc<Mutex<DateTime<Utc>>>,
    }

    impl MockClock {
        /// Create a mock clock frozen at `start`.
        pub fn new(start: DateTime<Utc>) -> Self {
            Self {
                current: Arc::new(Mutex::new(start)),
            }
        }

        /// Create a mock clock frozen at the given Unix timestamp (seconds).
        pub fn at_unix(secs: i64) -> Self {
            Self::new(Utc.timestamp_opt(secs, 0).single().unwrap_or_default())
        }

        /// Move the clock forward.
        pub fn advance(&self, by: Duration) {
            let mut current = self.current.lock();
            *current += chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
        }
    }

    impl Clock for MockClock {
        fn now(&self) -> DateTime<Utc> {
            *self.current.lock()
        }
    }
}

/// A fixed-length counting window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Window {
    length_secs: u64,
}

impl Window {
    /// One hour, the default window.
    pub const HOUR: Window = Window { length_secs: 3600 };

    /// Create a window of the given length. Sub-second precision is dropped.
    pub fn new(length: Duration) -> Result<Self> {
        Self::from_secs(length.as_secs())
    }

    /// Longest accepted window: 366 days.
    pub const MAX_SECS: u64 = 366 * 24 * 3600;

    /// Create a window of `secs` seconds, between one second and
    /// [`Window::MAX_SECS`].
    pub fn from_secs(secs: u64) -> Result<Self> {
        if secs == 0 || secs > Self::MAX_SECS {
            return Err(TurnstileError::Config(format!(
                "window length must be between 1 and {} seconds, got {}",
                Self::MAX_SECS,
                secs
            )));
        }
        Ok(Self { length_secs: secs })
    }

    /// Length of this window.
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.length_secs)
    }

    /// Length in whole seconds.
    pub fn as_secs(&self) -> u64 {
        self.length_secs
    }

    /// The window containing `now`.
    pub fn bounds(&self, now: DateTime<Utc>) -> WindowBounds {
        let len = self.length_secs as i64;
        let start = now.timestamp().div_euclid(len) * len;
        WindowBounds {
            start,
            reset_at: Utc
                .timestamp_opt(start.saturating_add(len), 0)
                .single()
                .unwrap_or(now),
        }
    }
}

impl Default for Window {
    fn default() -> Self {
        Window::HOUR
    }
}

/// Concrete start/end of one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowBounds {
    /// Window start, Unix seconds
    pub start: i64,
    /// First instant of the next window
    pub reset_at: DateTime<Utc>,
}

impl WindowBounds {
    /// Time left in this window as seen from `now`, zero if already elapsed.
    pub fn remaining_from(&self, now: DateTime<Utc>) -> Duration {
        (self.reset_at - now).to_std().unwrap_or(Duration::ZERO)
    }

    /// Whether the window has fully elapsed at `now`.
    pub fn is_elapsed(&self, now: DateTime<Utc>) -> bool {
        now >= self.reset_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_rejects_zero_length() {
        assert!(Window::from_secs(0).is_err());
        assert!(Window::new(Duration::from_millis(500)).is_err());
        assert_eq!(Window::from_secs(60).unwrap().duration(), Duration::from_secs(60));
    }

    #[test]
    fn test_window_length_is_capped() {
        assert!(Window::from_secs(Window::MAX_SECS).is_ok());
        assert!(Window::from_secs(Window::MAX_SECS + 1).is_err());
        assert!(Window::from_secs(u64::MAX).is_err());
    }

    #[test]
    fn test_longest_window_has_positive_reset() {
        let window = Window::from_secs(Window::MAX_SECS).unwrap();
        let clock = MockClock::at_unix(1_704_067_200);

        let bounds = window.bounds(clock.now());
        let remaining = bounds.remaining_from(clock.now());
        assert!(remaining > Duration::ZERO);
        assert!(remaining <= window.duration());
    }

    #[test]
    fn test_bounds_are_aligned_to_wall_clock() {
        let window = Window::from_secs(3600).unwrap();
        let clock = MockClock::at_unix(7_200 + 1_234);

        let bounds = window.bounds(clock.now());
        assert_eq!(bounds.start, 7_200);
        assert_eq!(bounds.reset_at.timestamp(), 10_800);
        assert_eq!(
            bounds.remaining_from(clock.now()),
            Duration::from_secs(3600 - 1_234)
        );
    }

    #[test]
    fn test_bounds_at_exact_boundary_start_new_window() {
        let window = Window::from_secs(60).unwrap();
        let clock = MockClock::at_unix(120);

        let bounds = window.bounds(clock.now());
        assert_eq!(bounds.start, 120);
        assert_eq!(bounds.remaining_from(clock.now()), Duration::from_secs(60));
    }

    #[test]
    fn test_mock_clock_advance_moves_window() {
        let window = Window::from_secs(10).unwrap();
        let clock = MockClock::at_unix(105);
        let first = window.bounds(clock.now());

        clock.advance(Duration::from_secs(4));
        assert_eq!(window.bounds(clock.now()), first);

        clock.advance(Duration::from_secs(1));
        let second = window.bounds(clock.now());
        assert_eq!(second.start, 110);
        assert!(first.is_elapsed(clock.now()));
    }

    #[test]
    fn test_mock_clock_clones_share_time() {
        let clock = MockClock::at_unix(0);
        let other = clock.clone();
        other.advance(Duration::from_secs(30));
        assert_eq!(clock.now().timestamp(), 30);
    }
}
