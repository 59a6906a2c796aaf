//! Capture rate limiting.

use std::thread;
use std::time::{Duration, Instant};

/// Caps how often frames are captured.
///
/// Each call to [`RateLimiter::sync`] reserves the next time slot. A caller
/// that falls behind is never made to wait; the schedule restarts from now
/// instead of bursting to catch up.
#[derive(Debug)]
pub struct RateLimiter {
    interval: Option<Duration>,
    next: Option<Instant>,
}

impl RateLimiter {
    /// Limiter allowing at most `fps` calls per second, `0` for unlimited.
    pub fn new(fps: u32) -> Self {
        let interval = (fps > 0).then(|| Duration::from_secs_f64(1.0 / fps as f64));
        Self {
            interval,
            next: None,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.interval.is_none()
    }

    /// Sleep until the current time slot opens, then reserve the next one.
    pub fn sync(&mut self) {
        let Some(interval) = self.interval else {
            return;
        };

        let now = Instant::now();
        match self.next {
            Some(deadline) if deadline > now => {
                thread::sleep(deadline - now);
                self.next = Some(deadline + interval);
            },
            _ => self.next = Some(now + interval),
        }
    }
}
