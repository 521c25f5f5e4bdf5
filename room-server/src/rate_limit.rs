//! A hand-rolled sliding-window rate limiter, identical in shape to the
//! relay's — the same window/threshold semantics apply per-connection on
//! this server too, since both binaries sit directly on client sockets.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub struct SlidingWindow {
    max_messages: u32,
    window: Duration,
    timestamps: VecDeque<Instant>,
}

impl SlidingWindow {
    pub fn new(max_messages: u32, window: Duration) -> Self {
        Self { max_messages, window, timestamps: VecDeque::new() }
    }

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
