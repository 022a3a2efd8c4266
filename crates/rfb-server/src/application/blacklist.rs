//! Per-host lockout after repeated authentication failures.
//!
//! A host that fails [`BLACKLIST_THRESHOLD`] times in a row is refused for
//! [`INITIAL_TIMEOUT`].  When the block runs out the host gets exactly one
//! more attempt; failing it blocks the host again for twice as long.  A
//! successful authentication forgets the host.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::info;

/// Consecutive failures before a host is blocked.
pub const BLACKLIST_THRESHOLD: u32 = 5;

/// Length of the first block.
pub const INITIAL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
struct HostRecord {
    marks: u32,
    blocked_until: Option<Instant>,
    timeout: Duration,
}

#[derive(Debug)]
pub struct Blacklist {
    hosts: HashMap<String, HostRecord>,
    threshold: u32,
    initial_timeout: Duration,
}

impl Default for Blacklist {
    fn default() -> Self {
        Self::new(BLACKLIST_THRESHOLD, INITIAL_TIMEOUT)
    }
}

impl Blacklist {
    pub fn new(threshold: u32, initial_timeout: Duration) -> Self {
        Self {
            hosts: HashMap::new(),
            threshold: threshold.max(1),
            initial_timeout,
        }
    }

    /// Whether connections from `host` must be refused at `now`.
    ///
    /// Takes `&mut self` because an expiring block arms the host's final
    /// attempt and doubles its next timeout.
    pub fn is_blackmarked(&mut self, host: &str, now: Instant) -> bool {
        let Some(record) = self.hosts.get_mut(host) else {
            return false;
        };
        if record.marks < self.threshold {
            return false;
        }
        match record.blocked_until {
            None => {
                info!("blacklisting {host} for {}s", record.timeout.as_secs());
                record.blocked_until = Some(now + record.timeout);
                true
            }
            Some(until) if now < until => true,
            Some(_) => {
                // One more attempt; failing it re-blocks immediately.
                record.marks = self.threshold - 1;
                record.blocked_until = None;
                record.timeout *= 2;
                false
            }
        }
    }

    /// Records an authentication failure from `host`.
    pub fn add_blackmark(&mut self, host: &str) {
        let initial = self.initial_timeout;
        let record = self.hosts.entry(host.to_string()).or_insert(HostRecord {
            marks: 0,
            blocked_until: None,
            timeout: initial,
        });
        record.marks += 1;
    }

    /// Forgets `host` after a successful authentication.
    pub fn clear_blackmark(&mut self, host: &str) {
        self.hosts.remove(host);
    }

    pub fn failure_count(&self, host: &str) -> u32 {
        self.hosts.get(host).map_or(0, |r| r.marks)
    }
}
