//! Fixed-capacity pool of backend connections addressed by session id.
//!
//! Slots are probed linearly from a start position derived from the sid, so
//! a lookup usually lands on its slot immediately. A slot whose status is
//! [`ConnStatus::UNKNOWN`] is free.

use std::time::{Duration, Instant};

use tracing::{debug, error};

use crate::conn::{ConnStatus, Connection};

/// One multiplexed stream and its local socket.
#[derive(Debug, Default)]
pub struct Backend {
    pub sid: String,
    /// Index of the tunnel carrying this stream.
    pub tunnel: usize,
    /// Index of the kite the stream was routed to.
    pub kite: Option<usize>,
    pub conn: Connection,
}

impl Backend {
    pub fn is_allocated(&self) -> bool {
        self.conn.status.contains(ConnStatus::ALLOCATED)
    }
}

/// A stream pushed out to make room for a new one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evicted {
    pub sid: String,
    pub tunnel: usize,
    /// The stream had a connected socket.
    pub live: bool,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("No free backend slot (capacity {0})")]
    Exhausted(usize),
}

/// Result of a successful [`BackendPool::alloc`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub index: usize,
    pub evicted: Option<Evicted>,
}

/// Fold a sid into a probe start value.
pub fn scramble(sid: &str) -> u8 {
    sid.bytes()
        .fold(0u8, |shift, b| ((shift << 3) | (shift >> 5)) ^ b)
}

#[derive(Debug)]
pub struct BackendPool {
    slots: Vec<Backend>,
}

impl BackendPool {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| Backend::default()).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn probe_order(&self, sid: &str) -> impl Iterator<Item = usize> + use<> {
        let capacity = self.capacity();
        let start = usize::from(scramble(sid));
        (0..capacity).map(move |i| (i + start) % capacity)
    }

    /// Claim a slot for `sid` on `tunnel`.
    ///
    /// With every slot taken, the idlest one is evicted if it has been idle
    /// longer than `eviction_idle`; otherwise allocation fails with
    /// [`PoolError::Exhausted`].
    pub fn alloc(
        &mut self,
        tunnel: usize,
        sid: &str,
        eviction_idle: Option<Duration>,
        now: Instant,
    ) -> Result<Claim, PoolError> {
        let mut oldest: Option<(usize, Instant)> = None;
        for index in self.probe_order(sid) {
            let backend = &self.slots[index];
            if !backend.is_allocated() {
                self.claim(index, tunnel, sid);
                return Ok(Claim {
                    index,
                    evicted: None,
                });
            }
            let activity = backend.conn.activity();
            if oldest.is_none_or(|(_, seen)| activity <= seen) {
                oldest = Some((index, activity));
            }
        }

        let exhausted = PoolError::Exhausted(self.capacity());
        let (index, activity) = oldest.ok_or_else(|| exhausted.clone())?;
        let idle = now.saturating_duration_since(activity);
        let evicting = eviction_idle.is_some_and(|limit| idle > limit);
        let victim = &self.slots[index];
        if evicting {
            error!(
                sid = %victim.sid,
                idle_secs = idle.as_secs(),
                "Pool full, evicting idlest connection"
            );
        } else {
            debug!(
                sid = %victim.sid,
                idle_secs = idle.as_secs(),
                "Pool full, idlest connection kept"
            );
            return Err(exhausted);
        }

        let evicted = Evicted {
            sid: victim.sid.clone(),
            tunnel: victim.tunnel,
            live: victim.conn.is_live(),
        };
        self.claim(index, tunnel, sid);
        Ok(Claim {
            index,
            evicted: Some(evicted),
        })
    }

    fn claim(&mut self, index: usize, tunnel: usize, sid: &str) {
        let backend = &mut self.slots[index];
        backend.conn.reset(ConnStatus::ALLOCATED);
        backend.tunnel = tunnel;
        backend.kite = None;
        sid.clone_into(&mut backend.sid);
    }

    /// Allocated slot for (`tunnel`, `sid`), if any.
    pub fn find(&self, tunnel: usize, sid: &str) -> Option<usize> {
        self.probe_order(sid).find(|&index| {
            let backend = &self.slots[index];
            backend.is_allocated() && backend.tunnel == tunnel && backend.sid == sid
        })
    }

    /// Release a slot. The socket, if any, is closed.
    pub fn free(&mut self, index: usize) {
        if let Some(backend) = self.slots.get_mut(index) {
            backend.conn.close();
            backend.conn.status = ConnStatus::UNKNOWN;
        }
    }

    pub fn get(&self, index: usize) -> Option<&Backend> {
        self.slots.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Backend> {
        self.slots.get_mut(index)
    }

    /// Allocated slots carried by `tunnel`.
    pub fn allocated_on(&self, tunnel: usize) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, b)| b.is_allocated() && b.tunnel == tunnel)
            .map(|(i, _)| i)
            .collect()
    }

    /// Whether any open or connecting backend still uses `tunnel`.
    pub fn has_live_on(&self, tunnel: usize) -> bool {
        self.slots.iter().any(|b| {
            b.tunnel == tunnel
                && (b.conn.is_live() || b.conn.status.contains(ConnStatus::CONNECTING))
        })
    }

    /// Whether a stream on `tunnel` has as much output queued as it may hold.
    pub fn output_full_on(&self, tunnel: usize) -> bool {
        self.slots
            .iter()
            .any(|b| b.is_allocated() && b.tunnel == tunnel && b.conn.out_full())
    }

    pub fn allocated(&self) -> usize {
        self.slots.iter().filter(|b| b.is_allocated()).count()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn scramble_is_stable() {
        assert_eq!(scramble(""), 0);
        assert_eq!(scramble("a"), b'a');
        assert_eq!(scramble("ab"), ((b'a' << 3) | (b'a' >> 5)) ^ b'b');
    }

    #[test]
    fn alloc_then_find_then_free() {
        let mut pool = BackendPool::with_capacity(16);
        let now = Instant::now();
        let claim = pool.alloc(0, "sid-1", None, now).unwrap();
        assert_eq!(claim.evicted, None);
        assert_eq!(pool.find(0, "sid-1"), Some(claim.index));
        assert_eq!(pool.find(1, "sid-1"), None);
        pool.free(claim.index);
        assert_eq!(pool.find(0, "sid-1"), None);
    }

    #[test]
    fn full_pool_without_eviction_fails() {
        let mut pool = BackendPool::with_capacity(2);
        let now = Instant::now();
        pool.alloc(0, "a", None, now).unwrap();
        pool.alloc(0, "b", None, now).unwrap();
        assert_eq!(
            pool.alloc(0, "c", None, now).unwrap_err(),
            PoolError::Exhausted(2)
        );
    }

    #[test]
    fn idle_stream_evicted_only_past_threshold() {
        let mut pool = BackendPool::with_capacity(2);
        let now = Instant::now();
        pool.alloc(3, "a", None, now).unwrap();
        pool.alloc(3, "b", None, now).unwrap();
        let limit = Some(Duration::from_secs(60));

        assert!(pool.alloc(0, "c", limit, now).is_err());

        let later = now + Duration::from_secs(120);
        let claim = pool.alloc(0, "c", limit, later).unwrap();
        let evicted = claim.evicted.unwrap();
        assert_eq!(evicted.tunnel, 3);
        assert!(evicted.sid == "a" || evicted.sid == "b");
        assert_eq!(pool.find(0, "c"), Some(claim.index));
        assert_eq!(pool.find(3, &evicted.sid), None);
        assert_eq!(pool.allocated(), 2);
    }

    #[test]
    fn allocated_on_lists_tunnel_streams() {
        let mut pool = BackendPool::with_capacity(8);
        let now = Instant::now();
        let a = pool.alloc(1, "a", None, now).unwrap().index;
        pool.alloc(2, "b", None, now).unwrap();
        assert_eq!(pool.allocated_on(1), vec![a]);
        assert!(!pool.has_live_on(1));
    }

    #[test]
    fn connecting_stream_keeps_tunnel_in_use() {
        let mut pool = BackendPool::with_capacity(8);
        let a = pool.alloc(1, "a", None, Instant::now()).unwrap().index;
        pool.get_mut(a)
            .unwrap()
            .conn
            .begin_connect(crate::conn::ConnKind::Backend, a);
        assert!(pool.has_live_on(1));
        assert!(!pool.has_live_on(2));

        assert!(!pool.output_full_on(1));
        pool.get_mut(a)
            .unwrap()
            .conn
            .write(&vec![0u8; crate::conn::CONN_OUT_BUFFER_MAX]);
        assert!(pool.output_full_on(1));

        pool.free(a);
        assert!(!pool.has_live_on(1));
        assert!(!pool.output_full_on(1));
    }
}
