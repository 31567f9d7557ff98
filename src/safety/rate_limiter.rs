use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;

/// Wall-clock sliding-window limiter.
///
/// Admissions stay counted until they age out of the window, so the count
/// only ever falls when old stamps roll off the front.
#[derive(Debug, Clone)]
pub struct SlidingWindowLimiter {
    max_requests: u32,
    window: Duration,
    stamps: VecDeque<DateTime<Utc>>,
}

impl SlidingWindowLimiter {
    pub fn new(max_requests: u32, window_secs: u64) -> Self {
        Self {
            max_requests,
            window: Duration::seconds(window_secs as i64),
            stamps: VecDeque::new(),
        }
    }

    fn evict(&mut self, now: DateTime<Utc>) {
        while let Some(oldest) = self.stamps.front() {
            if now - *oldest >= self.window {
                self.stamps.pop_front();
            } else {
                break;
            }
        }
    }

    /// Admits one request at `now` if the window has room.
    pub fn try_acquire_at(&mut self, now: DateTime<Utc>) -> bool {
        self.evict(now);
        if self.stamps.len() as u32 >= self.max_requests {
            return false;
        }
        self.stamps.push_back(now);
        true
    }

    pub fn count_at(&mut self, now: DateTime<Utc>) -> usize {
        self.evict(now);
        self.stamps.len()
    }

    /// Seconds until the oldest admission leaves the window.
    pub fn retry_after_at(&mut self, now: DateTime<Utc>) -> Option<i64> {
        self.evict(now);
        if (self.stamps.len() as u32) < self.max_requests {
            return None;
        }
        self.stamps
            .front()
            .map(|oldest| (self.window - (now - *oldest)).num_seconds().max(0))
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    /// Changes the bounds without forgetting admissions already in the window.
    pub fn reconfigure(&mut self, max_requests: u32, window_secs: u64) {
        self.max_requests = max_requests;
        self.window = Duration::seconds(window_secs as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_denies_once_window_is_full() {
        let mut limiter = SlidingWindowLimiter::new(3, 60);
        let now = Utc::now();
        assert!(limiter.try_acquire_at(now));
        assert!(limiter.try_acquire_at(now));
        assert!(limiter.try_acquire_at(now));
        assert!(!limiter.try_acquire_at(now));
        assert_eq!(limiter.count_at(now), 3);
    }

    #[test]
    fn test_window_rolls_over() {
        let mut limiter = SlidingWindowLimiter::new(2, 60);
        let start = Utc::now();
        assert!(limiter.try_acquire_at(start));
        assert!(limiter.try_acquire_at(start + Duration::seconds(30)));
        assert!(!limiter.try_acquire_at(start + Duration::seconds(59)));
        assert_eq!(
            limiter.retry_after_at(start + Duration::seconds(59)),
            Some(1)
        );

        assert!(limiter.try_acquire_at(start + Duration::seconds(60)));
        assert_eq!(limiter.count_at(start + Duration::seconds(60)), 2);
    }

    #[test]
    fn test_reconfigure_keeps_admissions() {
        let mut limiter = SlidingWindowLimiter::new(5, 60);
        let now = Utc::now();
        for _ in 0..3 {
            assert!(limiter.try_acquire_at(now));
        }
        limiter.reconfigure(3, 60);
        assert!(!limiter.try_acquire_at(now));
    }
}
