//! Connection throttle
//!
//! Tracks per-IP connection attempts in a fixed window. An IP that goes over
//! the limit is locked out for a while; a scheduler event prunes stale entries.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::config::ServerConfig;
use crate::timer::{EventId, Scheduler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleConfig {
    /// Attempts allowed per window
    pub limit: u32,
    pub window: Duration,
    pub lockout: Duration,
}

impl From<&ServerConfig> for ThrottleConfig {
    fn from(config: &ServerConfig) -> Self {
        Self {
            limit: config.connect_limit,
            window: Duration::from_millis(config.connect_window_ms),
            lockout: Duration::from_secs(config.lockout_secs),
        }
    }
}

struct ConnectEntry {
    window_start: Instant,
    count: u32,
    locked_until: Option<Instant>,
}

pub struct ConnectThrottle {
    entries: Mutex<HashMap<IpAddr, ConnectEntry>>,
    config: ThrottleConfig,
}

impl ConnectThrottle {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Record a connection attempt. Returns false if the IP is refused.
    pub fn check(&self, ip: IpAddr) -> bool {
        self.check_at(ip, Instant::now())
    }

    pub fn check_at(&self, ip: IpAddr, now: Instant) -> bool {
        let mut entries = self.lock();
        let entry = entries.entry(ip).or_insert(ConnectEntry {
            window_start: now,
            count: 0,
            locked_until: None,
        });

        if let Some(until) = entry.locked_until {
            if now < until {
                return false;
            }
            entry.locked_until = None;
            entry.count = 0;
            entry.window_start = now;
        }

        if now.duration_since(entry.window_start) >= self.config.window {
            entry.window_start = now;
            entry.count = 0;
        }

        entry.count += 1;
        if entry.count > self.config.limit {
            entry.locked_until = Some(now + self.config.lockout);
            tracing::warn!(
                "[throttle] lockout ip={} attempts={} secs={}",
                ip,
                entry.count,
                self.config.lockout.as_secs()
            );
            return false;
        }
        true
    }

    /// Returns true if the IP is currently locked out.
    pub fn is_locked(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        self.lock()
            .get(&ip)
            .and_then(|e| e.locked_until)
            .is_some_and(|until| now < until)
    }

    /// Drop entries whose window and lockout have both expired. Returns the
    /// number of remaining entries.
    pub fn prune(&self) -> usize {
        self.prune_at(Instant::now())
    }

    pub fn prune_at(&self, now: Instant) -> usize {
        let window = self.config.window;
        let mut entries = self.lock();
        entries.retain(|_, entry| match entry.locked_until {
            Some(until) => now < until,
            None => now.duration_since(entry.window_start) < window,
        });
        entries.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Prune once per window for as long as the scheduler runs.
    pub fn schedule_pruning(self: &Arc<Self>, scheduler: &Scheduler) -> EventId {
        let throttle = Arc::clone(self);
        let window = self.config.window;
        scheduler.enqueue(
            move || {
                let left = throttle.prune();
                tracing::trace!("[throttle] pruned, remaining={}", left);
                window
            },
            window,
        )
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<IpAddr, ConnectEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn throttle() -> ConnectThrottle {
        ConnectThrottle::new(ThrottleConfig {
            limit: 3,
            window: Duration::from_secs(1),
            lockout: Duration::from_secs(60),
        })
    }

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    #[test]
    fn test_limit_then_lockout() {
        let t = throttle();
        let now = Instant::now();
        for _ in 0..3 {
            assert!(t.check_at(ip(1), now));
        }
        assert!(!t.check_at(ip(1), now));
        // Other IPs are unaffected.
        assert!(t.check_at(ip(2), now));
        // Still locked after the window rolls over.
        assert!(!t.check_at(ip(1), now + Duration::from_secs(5)));
        assert!(t.check_at(ip(1), now + Duration::from_secs(61)));
    }

    #[test]
    fn test_window_resets_count() {
        let t = throttle();
        let now = Instant::now();
        for _ in 0..3 {
            assert!(t.check_at(ip(1), now));
        }
        let later = now + Duration::from_secs(1);
        for _ in 0..3 {
            assert!(t.check_at(ip(1), later));
        }
    }

    #[test]
    fn test_prune_keeps_lockouts() {
        let t = throttle();
        let now = Instant::now();
        assert!(t.check_at(ip(1), now));
        for _ in 0..4 {
            t.check_at(ip(2), now);
        }
        assert_eq!(t.prune_at(now + Duration::from_secs(2)), 1);
        assert_eq!(t.prune_at(now + Duration::from_secs(61)), 0);
        assert!(t.is_empty());
    }

    #[test]
    fn test_scheduled_pruning_repeats() {
        let t = Arc::new(throttle());
        let scheduler = Scheduler::new();
        t.check(ip(1));
        t.schedule_pruning(&scheduler);

        scheduler.tick(Duration::from_millis(500));
        assert_eq!(scheduler.pending(), 1);
        scheduler.tick(Duration::from_millis(500));
        // Re-armed for the next window.
        assert_eq!(scheduler.pending(), 1);
    }
}
