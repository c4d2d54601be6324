//! Typed settings for the relays and clients.
//!
//! The command line fills these in; tests build them directly with shorter
//! durations so timeouts can be observed quickly.

use std::time::Duration;

pub const DEFAULT_TCP_PORT: u16 = 4000;
pub const DEFAULT_UDP_PORT: u16 = 4001;

/// Default bound on a single stream line.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Per-client token bucket parameters.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub capacity: u32,
    pub refill_per_sec: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 3,
            refill_per_sec: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StreamConfig {
    pub rate_limit: RateLimitConfig,
    /// Idle time before the OS starts sending keep-alive probes.
    pub keepalive_idle: Duration,
    /// Gap between unanswered keep-alive probes.
    pub keepalive_interval: Duration,
    /// Longest accepted line, terminator included. Longer lines end the session.
    pub max_line_len: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            rate_limit: RateLimitConfig::default(),
            keepalive_idle: Duration::from_secs(15),
            keepalive_interval: Duration::from_secs(5),
            max_line_len: MAX_LINE_LEN,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DatagramConfig {
    pub rate_limit: RateLimitConfig,
    /// How often the reaper scans for idle clients.
    pub reap_interval: Duration,
    /// Silence after which a client is expired.
    pub inactivity_timeout: Duration,
    /// Upper bound on a single receive wait, so shutdown is observed promptly.
    pub poll_interval: Duration,
    pub max_datagram_size: usize,
}

impl Default for DatagramConfig {
    fn default() -> Self {
        Self {
            rate_limit: RateLimitConfig::default(),
            reap_interval: Duration::from_secs(30),
            inactivity_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_secs(1),
            max_datagram_size: 4096,
        }
    }
}

/// Interval at which the UDP client announces it is still alive.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
