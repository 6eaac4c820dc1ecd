//! Frontend relay candidates and their selection bits.
//!
//! Each frontend slot corresponds to one resolved relay address. The slot
//! index doubles as the index of the reactor's tunnel for that address.

use std::net::SocketAddr;
use std::time::Instant;

use bitflags::bitflags;
use tracing::{debug, warn};

use kitemux_core::{Error, Result};

/// Error counts saturate here.
pub const MAX_ERROR_COUNT: u32 = 999;

bitflags! {
    /// Selection state of a frontend.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FeFlags: u32 {
        /// Selected: keep a tunnel open here.
        const WANTED    = 0x01_0000;
        /// Published in DNS for at least one kite.
        const IN_DNS    = 0x02_0000;
        /// Among the fastest probed frontends.
        const IS_FAST   = 0x04_0000;
        /// Refused our kites.
        const REJECTED  = 0x08_0000;
        /// Reported our kites as duplicates.
        const LAME      = 0x10_0000;
        /// Always wanted.
        const NAILED_UP = 0x20_0000;
    }
}

impl FeFlags {
    /// Bits recomputed on every world check.
    pub const TRANSIENT: Self = Self::REJECTED
        .union(Self::LAME)
        .union(Self::IS_FAST)
        .union(Self::IN_DNS);
}

#[derive(Debug, Clone, Default)]
pub struct Frontend {
    pub addr: Option<SocketAddr>,
    pub hostname: Option<String>,
    pub port: u16,
    pub flags: FeFlags,
    /// Latency score in milliseconds; zero means unmeasured.
    pub priority: u32,
    pub error_count: u32,
    /// Last time this address was seen in (or pushed to) DNS.
    pub last_ddnsup: Option<Instant>,
    /// The reactor holds an open tunnel to this frontend.
    pub live: bool,
}

impl Frontend {
    /// A slot with both an address and a hostname is a real frontend.
    pub const fn is_configured(&self) -> bool {
        self.addr.is_some() && self.hostname.is_some()
    }

    pub fn record_error(&mut self) {
        if self.error_count < MAX_ERROR_COUNT {
            self.error_count += 1;
        }
    }

    /// Selection score: lower is better.
    pub const fn score(&self) -> u32 {
        self.priority.saturating_add(self.error_count.saturating_mul(25))
    }
}

/// Fixed-capacity frontend table.
#[derive(Debug, Clone)]
pub struct FrontendTable {
    slots: Vec<Frontend>,
}

impl FrontendTable {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: vec![Frontend::default(); capacity],
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Add one resolved address. Returns `Ok(None)` if the address is
    /// already present.
    pub fn add_frontend_addr(
        &mut self,
        addr: SocketAddr,
        hostname: &str,
        port: u16,
        flags: FeFlags,
    ) -> Result<Option<usize>> {
        if self.slots.iter().any(|fe| fe.addr == Some(addr)) {
            return Ok(None);
        }
        let capacity = self.capacity();
        let (index, slot) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, fe)| fe.addr.is_none())
            .ok_or(Error::NoMoreFrontends(capacity))?;
        *slot = Frontend {
            addr: Some(addr),
            hostname: Some(hostname.to_string()),
            port,
            flags,
            ..Frontend::default()
        };
        Ok(Some(index))
    }

    pub fn get(&self, index: usize) -> Option<&Frontend> {
        self.slots.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Frontend> {
        self.slots.get_mut(index)
    }

    /// Every slot, configured or not, with its index.
    pub fn slots(&self) -> impl Iterator<Item = (usize, &Frontend)> {
        self.slots.iter().enumerate()
    }

    pub fn slots_mut(&mut self) -> impl Iterator<Item = (usize, &mut Frontend)> {
        self.slots.iter_mut().enumerate()
    }

    /// Configured frontends only.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Frontend)> {
        self.slots().filter(|(_, fe)| fe.is_configured())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut Frontend)> {
        self.slots_mut().filter(|(_, fe)| fe.is_configured())
    }

    pub fn clear_transient_flags(&mut self) {
        for fe in &mut self.slots {
            fe.flags.remove(FeFlags::TRANSIENT);
        }
    }

    /// Configured frontend addresses, for probing.
    pub fn targets(&self) -> Vec<(usize, SocketAddr)> {
        self.iter()
            .filter_map(|(i, fe)| fe.addr.map(|addr| (i, addr)))
            .collect()
    }
}

/// Resolve `hostname` and add one frontend per distinct address. Returns
/// how many were added.
pub async fn add_frontend(
    table: &std::sync::Mutex<FrontendTable>,
    hostname: &str,
    port: u16,
    flags: FeFlags,
) -> Result<usize> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((hostname, port)).await?.collect();
    let mut table = table
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    table.add_resolved(addrs, hostname, port, flags)
}

impl FrontendTable {
    /// Add every resolved address of one frontend name. A full table stops
    /// the walk; the addresses added so far are kept.
    pub fn add_resolved(
        &mut self,
        addrs: impl IntoIterator<Item = SocketAddr>,
        hostname: &str,
        port: u16,
        flags: FeFlags,
    ) -> Result<usize> {
        let mut added = 0;
        for addr in addrs {
            match self.add_frontend_addr(addr, hostname, port, flags) {
                Ok(Some(_)) => {
                    debug!(frontend = %addr, hostname, "Front-end IP");
                    added += 1;
                }
                Ok(None) => {}
                Err(Error::NoMoreFrontends(capacity)) => {
                    warn!(hostname, capacity, "No more front-end slots");
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(added)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn addr(last: u8) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, last], 443))
    }

    #[test]
    fn duplicate_addresses_are_skipped() {
        let mut table = FrontendTable::with_capacity(2);
        assert_eq!(
            table
                .add_frontend_addr(addr(1), "fe", 443, FeFlags::empty())
                .unwrap(),
            Some(0)
        );
        assert_eq!(
            table
                .add_frontend_addr(addr(1), "fe", 443, FeFlags::empty())
                .unwrap(),
            None
        );
    }

    #[test]
    fn full_table_is_an_error() {
        let mut table = FrontendTable::with_capacity(1);
        table
            .add_frontend_addr(addr(1), "fe", 443, FeFlags::empty())
            .unwrap();
        let err = table
            .add_frontend_addr(addr(2), "fe", 443, FeFlags::empty())
            .unwrap_err();
        assert!(matches!(err, Error::NoMoreFrontends(1)));
    }

    #[test]
    fn empty_slots_are_not_iterated() {
        let mut table = FrontendTable::with_capacity(4);
        table
            .add_frontend_addr(addr(1), "fe", 443, FeFlags::NAILED_UP)
            .unwrap();
        assert_eq!(table.iter().count(), 1);
        assert_eq!(table.slots().count(), 4);
    }

    #[test]
    fn transient_flags_cleared_but_nailed_kept() {
        let mut table = FrontendTable::with_capacity(2);
        let i = table
            .add_frontend_addr(addr(1), "fe", 443, FeFlags::NAILED_UP | FeFlags::LAME)
            .unwrap()
            .unwrap();
        table.get_mut(i).unwrap().flags |= FeFlags::IN_DNS | FeFlags::WANTED;
        table.clear_transient_flags();
        assert_eq!(
            table.get(i).unwrap().flags,
            FeFlags::NAILED_UP | FeFlags::WANTED
        );
    }

    #[test]
    fn error_count_saturates() {
        let mut fe = Frontend {
            error_count: MAX_ERROR_COUNT,
            ..Frontend::default()
        };
        fe.record_error();
        assert_eq!(fe.error_count, MAX_ERROR_COUNT);
        assert_eq!(fe.score(), MAX_ERROR_COUNT * 25);
    }

    #[tokio::test]
    async fn add_frontend_resolves_literal_addresses() {
        let table = std::sync::Mutex::new(FrontendTable::with_capacity(2));
        let added = add_frontend(&table, "127.0.0.1", 443, FeFlags::empty())
            .await
            .unwrap();
        assert_eq!(added, 1);
        let again = add_frontend(&table, "127.0.0.1", 443, FeFlags::empty())
            .await
            .unwrap();
        assert_eq!(again, 0);
    }

    #[test]
    fn full_table_keeps_addresses_added_so_far() {
        let mut table = FrontendTable::with_capacity(1);
        let added = table
            .add_resolved([addr(1), addr(2)], "fe", 443, FeFlags::empty())
            .unwrap();
        assert_eq!(added, 1);
        assert_eq!(table.iter().count(), 1);
        assert_eq!(table.get(0).unwrap().addr, Some(addr(1)));
    }

    #[tokio::test]
    async fn add_frontend_on_full_table_adds_nothing() {
        let table = std::sync::Mutex::new(FrontendTable::with_capacity(1));
        let first = add_frontend(&table, "127.0.0.1", 443, FeFlags::empty())
            .await
            .unwrap();
        let second = add_frontend(&table, "127.0.0.2", 443, FeFlags::empty())
            .await
            .unwrap();
        assert_eq!((first, second), (1, 0));
    }
}
