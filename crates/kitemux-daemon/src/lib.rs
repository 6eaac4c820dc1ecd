//! kitemux Daemon Library
//!
//! Core functionality for the kitemux daemon:
//! - Tunnel reactor multiplexing backend streams over frontend tunnels
//! - Backend connection pool with idle eviction
//! - Frontend selection by DNS membership and measured latency
//! - Blocking workers for probes, reconnects and dynamic DNS
//! - PageKite-style frontend handshake

pub mod blocker;
pub mod conn;
pub mod context;
pub mod frontend;
pub mod handshake;
pub mod jobs;
pub mod manager;
pub mod pool;
pub mod selector;

#[cfg(test)]
pub(crate) mod test_helpers;
