//! Process-wide status and counters.
//!
//! The reactor, the blocking workers and outside callers (status queries)
//! all observe these values independently of the event loop phase, so they
//! live behind their own lock and every change is broadcast on a condition
//! variable.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Coarse external health indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    Startup = 10,
    Connecting = 20,
    UpdatingDns = 30,
    Flying = 40,
    Problems = 50,
    Rejected = 60,
    NoNetwork = 90,
}

impl Status {
    /// Numeric code exposed to embedding applications.
    pub const fn code(self) -> u8 {
        self as u8
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Startup => "startup",
            Self::Connecting => "connecting",
            Self::UpdatingDns => "updating-dns",
            Self::Flying => "flying",
            Self::Problems => "problems",
            Self::Rejected => "rejected",
            Self::NoNetwork => "no-network",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time copy of the shared counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub status: Status,
    pub live_tunnels: u32,
    pub live_streams: u32,
    pub force_update: bool,
    /// Incremented on every change; used to wait for the next one.
    pub version: u64,
}

#[derive(Debug)]
struct Inner {
    status: Status,
    live_tunnels: u32,
    live_streams: u32,
    force_update: bool,
    version: u64,
}

/// Shared status, counters and the force-update flag.
#[derive(Debug)]
pub struct SharedState {
    inner: Mutex<Inner>,
    changed: Condvar,
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedState {
    /// Fresh state: `Startup`, no live tunnels or streams, and a pending
    /// forced DNS update.
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                status: Status::Startup,
                live_tunnels: 0,
                live_streams: 0,
                force_update: true,
                version: 0,
            }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `change` under the lock and wake every waiter.
    fn update(&self, change: impl FnOnce(&mut Inner)) {
        let mut inner = self.lock();
        change(&mut inner);
        inner.version = inner.version.wrapping_add(1);
        drop(inner);
        self.changed.notify_all();
    }

    pub fn snapshot(&self) -> Snapshot {
        let inner = self.lock();
        Snapshot {
            status: inner.status,
            live_tunnels: inner.live_tunnels,
            live_streams: inner.live_streams,
            force_update: inner.force_update,
            version: inner.version,
        }
    }

    pub fn status(&self) -> Status {
        self.lock().status
    }

    pub fn set_status(&self, status: Status) {
        self.update(|s| s.status = status);
    }

    pub fn live_tunnels(&self) -> u32 {
        self.lock().live_tunnels
    }

    pub fn live_streams(&self) -> u32 {
        self.lock().live_streams
    }

    pub fn tunnel_up(&self) {
        self.update(|s| s.live_tunnels = s.live_tunnels.saturating_add(1));
    }

    pub fn tunnel_down(&self) {
        self.update(|s| s.live_tunnels = s.live_tunnels.saturating_sub(1));
    }

    pub fn stream_up(&self) {
        self.update(|s| s.live_streams = s.live_streams.saturating_add(1));
    }

    pub fn stream_down(&self) {
        self.update(|s| s.live_streams = s.live_streams.saturating_sub(1));
    }

    pub fn force_update(&self) -> bool {
        self.lock().force_update
    }

    pub fn set_force_update(&self, force: bool) {
        self.update(|s| s.force_update = force);
    }

    /// Block until the state version moves past `seen` or `timeout` elapses.
    pub fn wait_for_change(&self, seen: u64, timeout: Duration) -> Snapshot {
        let guard = self.lock();
        let (guard, _timed_out) = self
            .changed
            .wait_timeout_while(guard, timeout, |inner| inner.version == seen)
            .unwrap_or_else(PoisonError::into_inner);
        drop(guard);
        self.snapshot()
    }
}
