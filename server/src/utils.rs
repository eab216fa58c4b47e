use std::collections::VecDeque;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

// Get current timestamp in milliseconds
pub fn get_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

// Get current timestamp in seconds
pub fn get_timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs()
}

/// Sliding-window rate limiter.
///
/// Tracks the instants of recent events; an acquisition succeeds while fewer
/// than `limit` events fall inside the trailing `period`.
pub struct RateWindow {
    limit: usize,
    period: Duration,
    events: VecDeque<Instant>,
}

impl RateWindow {
    pub fn new(limit: usize, period: Duration) -> Self {
        Self {
            limit,
            period,
            events: VecDeque::new(),
        }
    }

    /// Records an event if the window has room, pruning expired entries first.
    pub fn try_acquire(&mut self) -> bool {
        let now = Instant::now();
        while let Some(front) = self.events.front() {
            if now.duration_since(*front) > self.period {
                self.events.pop_front();
            } else {
                break;
            }
        }
        if self.events.len() >= self.limit {
            return false;
        }
        self.events.push_back(now);
        true
    }
}
