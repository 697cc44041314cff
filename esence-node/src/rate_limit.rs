//! Per-source-IP sliding window rate limiter for `/anp/message`, grounded on
//! `esence/interface/server.py`'s in-memory `_rate_limit` dict.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(60);
const MAX_REQUESTS: usize = 30;

pub struct RateLimiter {
    hits: Mutex<HashMap<IpAddr, Vec<Instant>>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            hits: Mutex::new(HashMap::new()),
        }
    }

    /// Record a hit from `addr` and report whether it is within the window.
    pub fn check(&self, addr: IpAddr) -> bool {
        let now = Instant::now();
        let mut hits = self.hits.lock().expect("lock poisoned");
        let entry = hits.entry(addr).or_default();
        entry.retain(|t| now.duration_since(*t) < WINDOW);
        if entry.len() >= MAX_REQUESTS {
            return false;
        }
        entry.push(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_requests_under_the_threshold() {
        let limiter = RateLimiter::new();
        let addr: IpAddr = "127.0.0.1".parse().unwrap();
        for _ in 0..MAX_REQUESTS {
            assert!(limiter.check(addr));
        }
        assert!(!limiter.check(addr));
    }

    #[test]
    fn tracks_sources_independently() {
        let limiter = RateLimiter::new();
        let a: IpAddr = "127.0.0.1".parse().unwrap();
        let b: IpAddr = "127.0.0.2".parse().unwrap();
        for _ in 0..MAX_REQUESTS {
            limiter.check(a);
        }
        assert!(!limiter.check(a));
        assert!(limiter.check(b));
    }
}
