//! Multi-client chat relay over TCP and UDP.
//!
//! Both relays share the same core: a [`registry::ClientRegistry`] of
//! connected peers, a per-client [`rate_limit::RateLimiter`], and
//! [`broadcast::broadcast`], which fans a line out to everyone except its
//! sender. Each module owns one responsibility:
//!
//! - [`stream`] runs the TCP relay, one task per connection. A failed read is
//!   the disconnect signal.
//! - [`datagram`] runs the UDP relay on a single socket with an explicit
//!   `REGISTER`/`HEARTBEAT`/`BYE` protocol and an inactivity reaper.
//! - [`shutdown`] coordinates draining: it flips a shared flag, wakes every
//!   loop, and notifies clients before the process exits.
//! - [`protocol`] holds the wire text: notices, datagram commands and line
//!   framing helpers.
//! - [`client`] contains the interactive terminal clients.
//! - [`cli`], [`config`] and [`netutils`] are the thin outer layer.

pub mod broadcast;
pub mod cli;
pub mod client;
pub mod config;
pub mod datagram;
pub mod netutils;
pub mod protocol;
pub mod rate_limit;
pub mod registry;
pub mod shutdown;
pub mod stream;
