//! A hand-rolled sliding-window rate limiter for per-connection message
//! throughput. No new dependency: the algorithm is a handful of lines with
//! exact window/threshold semantics, so pulling in a crate for it would be
//! more ceremony than code.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Tracks timestamps of recent messages in a rolling window; a connection
/// that sends more than `max_messages` within `window` is over limit.
pub struct SlidingWindow {
    max_messages: u32,
    window: Duration,
    timestamps: VecDeque<Instant>,
}

impl SlidingWindow {
    pub fn new(max_messages: u32, window: Duration) -> Self {
        Self { max_messages, window, timestamps: VecDeque::new() }
    }

    /// Records one message at `now` and reports whether the connection is
    /// now over its limit. Evicts timestamps that have aged out of the
    /// window before counting, so the limiter never grows unbounded.
    pub fn record(&mut self, now: Instant) -> bool {
        while let Some(&front) = self.timestamps.front() {
            if now.duration_since(front) > self.window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
        self.timestamps.push_back(now);
        self.timestamps.len() as u32 > self.max_messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stays_under_limit_for_sparse_messages() {
        let mut window = SlidingWindow::new(3, Duration::from_millis(100));
        let start = Instant::now();
        assert!(!window.record(start));
        assert!(!window.record(start + Duration::from_millis(10)));
        assert!(!window.record(start + Duration::from_millis(20)));
    }

    #[test]
    fn trips_once_the_limit_is_exceeded_within_the_window() {
        let mut window = SlidingWindow::new(2, Duration::from_millis(100));
        let start = Instant::now();
        assert!(!window.record(start));
        assert!(!window.record(start + Duration::from_millis(5)));
        assert!(window.record(start + Duration::from_millis(10)));
    }

    #[test]
    fn old_messages_age_out_of_the_window() {
        let mut window = SlidingWindow::new(2, Duration::from_millis(50));
        let start = Instant::now();
        assert!(!window.record(start));
        assert!(!window.record(start + Duration::from_millis(10)));
        // Past the window: the first two timestamps should have aged out.
        assert!(!window.record(start + Duration::from_millis(200)));
    }
}
