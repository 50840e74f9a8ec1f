//! Per-sender rate limiting: sliding window plus cooldown gate.
//!
//! State is process-local and never persisted; a restart forgives all
//! senders. Disabled limiters allow everything and keep no state.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::RateLimitConfig;

#[derive(Debug, Default)]
struct SenderWindow {
    sent: VecDeque<Instant>,
    last_sent: Option<Instant>,
}

pub struct RateLimiter {
    cfg: RateLimitConfig,
    senders: Mutex<HashMap<String, SenderWindow>>,
}

impl RateLimiter {
    pub fn new(cfg: RateLimitConfig) -> Self {
        Self {
            cfg,
            senders: Mutex::new(HashMap::new()),
        }
    }

    /// Gate a send from `sender`. On allow the send is recorded; on
    /// rejection the returned string explains why.
    pub fn check_and_record(&self, sender: &str) -> Result<(), String> {
        self.check_and_record_at(sender, Instant::now())
    }

    fn check_and_record_at(&self, sender: &str, now: Instant) -> Result<(), String> {
        if !self.cfg.enabled {
            return Ok(());
        }

        let window = Duration::from_secs(self.cfg.window_seconds);
        let cooldown = Duration::from_secs(self.cfg.cooldown_seconds);

        let mut senders = self.senders.lock();
        let state = senders.entry(sender.to_string()).or_default();

        if self.cfg.cooldown_seconds > 0 {
            if let Some(last) = state.last_sent {
                let elapsed = now.duration_since(last);
                if elapsed < cooldown {
                    let remaining = (cooldown - elapsed).as_secs();
                    return Err(format!("cooldown: wait {remaining}s before sending again"));
                }
            }
        }

        // Drop timestamps that fell out of the window.
        while state
            .sent
            .front()
            .is_some_and(|t| now.duration_since(*t) >= window)
        {
            state.sent.pop_front();
        }

        if state.sent.len() >= self.cfg.max_messages {
            return Err(format!(
                "rate limit: max {} messages per {}s",
                self.cfg.max_messages, self.cfg.window_seconds
            ));
        }

        state.sent.push_back(now);
        state.last_sent = Some(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(max: usize, window: u64, cooldown: u64) -> RateLimitConfig {
        RateLimitConfig {
            enabled: true,
            max_messages: max,
            window_seconds: window,
            cooldown_seconds: cooldown,
        }
    }

    #[test]
    fn disabled_limiter_always_allows() {
        let limiter = RateLimiter::new(RateLimitConfig {
            enabled: false,
            max_messages: 0,
            window_seconds: 1,
            cooldown_seconds: 100,
        });
        for _ in 0..50 {
            assert!(limiter.check_and_record("alice").is_ok());
        }
    }

    #[test]
    fn window_caps_sends() {
        let limiter = RateLimiter::new(cfg(2, 60, 0));
        let now = Instant::now();
        assert!(limiter.check_and_record_at("alice", now).is_ok());
        assert!(limiter
            .check_and_record_at("alice", now + Duration::from_secs(5))
            .is_ok());
        let err = limiter
            .check_and_record_at("alice", now + Duration::from_secs(10))
            .unwrap_err();
        assert!(err.contains("max 2 messages per 60s"), "{err}");
    }

    #[test]
    fn window_slides() {
        let limiter = RateLimiter::new(cfg(2, 60, 0));
        let now = Instant::now();
        limiter.check_and_record_at("alice", now).unwrap();
        limiter
            .check_and_record_at("alice", now + Duration::from_secs(1))
            .unwrap();
        // Both entries age out after the window passes.
        assert!(limiter
            .check_and_record_at("alice", now + Duration::from_secs(61))
            .is_ok());
    }

    #[test]
    fn cooldown_separates_consecutive_sends() {
        let limiter = RateLimiter::new(cfg(100, 60, 10));
        let now = Instant::now();
        limiter.check_and_record_at("alice", now).unwrap();
        let err = limiter
            .check_and_record_at("alice", now + Duration::from_secs(3))
            .unwrap_err();
        assert!(err.contains("cooldown"), "{err}");
        assert!(limiter
            .check_and_record_at("alice", now + Duration::from_secs(10))
            .is_ok());
    }

    #[test]
    fn rejection_does_not_consume_budget() {
        let limiter = RateLimiter::new(cfg(1, 60, 0));
        let now = Instant::now();
        limiter.check_and_record_at("alice", now).unwrap();
        // Rejected sends must not extend the window or update last_sent.
        for i in 1..5 {
            assert!(limiter
                .check_and_record_at("alice", now + Duration::from_secs(i))
                .is_err());
        }
        assert!(limiter
            .check_and_record_at("alice", now + Duration::from_secs(61))
            .is_ok());
    }

    #[test]
    fn senders_are_independent() {
        let limiter = RateLimiter::new(cfg(1, 60, 0));
        let now = Instant::now();
        assert!(limiter.check_and_record_at("alice", now).is_ok());
        assert!(limiter.check_and_record_at("bob", now).is_ok());
        assert!(limiter.check_and_record_at("alice", now).is_err());
    }
}
