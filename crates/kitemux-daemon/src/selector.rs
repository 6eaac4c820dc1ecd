//! Frontend selection.
//!
//! Everything here is a pure function of the frontend table plus whatever
//! the caller looked up (DNS answers, the current time), so the workers can
//! run it under the table lock and tests can drive it directly.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use crate::frontend::{FeFlags, FrontendTable};

/// A frontend seen in DNS (or pushed there) this recently still counts as
/// published.
pub const DDNS_UPDATE_INTERVAL_MIN: Duration = Duration::from_secs(360);

/// Mark frontends whose address one of the kite domains resolves to.
///
/// `resolved` holds the answers for each kite's public domain. Frontends
/// confirmed within [`DDNS_UPDATE_INTERVAL_MIN`] stay marked. If nothing
/// resolves to us at all but something did before, the most recently seen
/// frontend is kept: DNS is more likely broken than changed.
///
/// Returns how many frontends are marked.
pub fn check_kites_dns(
    table: &mut FrontendTable,
    resolved: &[(String, Vec<IpAddr>)],
    now: Instant,
) -> usize {
    for (_, fe) in table.slots_mut() {
        fe.flags.remove(FeFlags::IN_DNS);
    }

    let mut in_dns = 0;
    for (domain, ips) in resolved {
        for ip in ips {
            for (_, fe) in table.iter_mut() {
                if fe.addr.is_some_and(|addr| addr.ip() == *ip) {
                    debug!(domain = %domain, frontend = %ip, "In DNS");
                    fe.flags.insert(FeFlags::IN_DNS);
                    fe.last_ddnsup = Some(now);
                    in_dns += 1;
                }
            }
        }
    }

    let mut recent: Option<(usize, Instant)> = None;
    for (index, fe) in table.iter_mut() {
        let Some(seen) = fe.last_ddnsup else {
            continue;
        };
        if now.saturating_duration_since(seen) < DDNS_UPDATE_INTERVAL_MIN {
            fe.flags.insert(FeFlags::IN_DNS);
            in_dns += 1;
        }
        if recent.is_none_or(|(_, best)| seen > best) {
            recent = Some((index, seen));
        }
    }

    if in_dns == 0
        && let Some((index, _)) = recent
        && let Some(fe) = table.get_mut(index)
    {
        debug!(frontend = ?fe.addr, "Nothing in DNS, keeping most recent");
        fe.flags.insert(FeFlags::IN_DNS);
        return 1;
    }
    in_dns
}

/// Decide which frontends to keep tunnels open to.
///
/// The `spare + 1` fastest unrejected frontends become `IS_FAST`; fast or
/// nailed-up frontends are `WANTED` unless rejected or lame. If that leaves
/// nothing wanted or published, fall back to any usable frontend, then to
/// every frontend we still hold a tunnel to.
///
/// Returns the number of frontends wanted or in DNS.
pub fn choose_tunnels(table: &mut FrontendTable, spare: usize) -> usize {
    for (_, fe) in table.iter_mut() {
        fe.flags.remove(FeFlags::WANTED | FeFlags::IS_FAST);
    }

    let excluded = FeFlags::IS_FAST | FeFlags::REJECTED | FeFlags::LAME;
    for _ in 0..=spare {
        let fastest = table
            .iter()
            .filter(|(_, fe)| fe.priority > 0 && !fe.flags.intersects(excluded))
            .min_by_key(|(_, fe)| fe.score())
            .map(|(i, _)| i);
        if let Some(fe) = fastest.and_then(|i| table.get_mut(i)) {
            fe.flags.insert(FeFlags::IS_FAST);
        }
    }

    let mut wanted = 0;
    for (_, fe) in table.iter_mut() {
        let hostname = fe.hostname.as_deref().unwrap_or_default();
        if fe.flags.intersects(FeFlags::NAILED_UP | FeFlags::IS_FAST) {
            fe.flags.insert(FeFlags::WANTED);
            debug!(hostname, flags = ?fe.flags, "Fast or nailed up, should use");
        } else {
            fe.flags.remove(FeFlags::WANTED);
            if fe.flags.contains(FeFlags::IN_DNS) {
                debug!(hostname, flags = ?fe.flags, "Not wanted, but in DNS (fallback)");
            }
        }
        if fe.flags.intersects(FeFlags::REJECTED | FeFlags::LAME) {
            fe.flags.remove(FeFlags::WANTED);
            debug!(hostname, flags = ?fe.flags, "Lame or rejecting, avoiding");
        }
        if fe.flags.intersects(FeFlags::WANTED | FeFlags::IN_DNS) {
            wanted += 1;
        }
    }
    if wanted > 0 {
        return wanted;
    }

    if let Some((_, fe)) = table
        .iter_mut()
        .find(|(_, fe)| !fe.flags.intersects(FeFlags::REJECTED | FeFlags::LAME))
    {
        fe.flags.insert(FeFlags::WANTED);
        info!(hostname = ?fe.hostname, "No front-end wanted, randomly using one");
        return 1;
    }

    for (_, fe) in table.iter_mut().filter(|(_, fe)| fe.live) {
        fe.flags.insert(FeFlags::WANTED);
        info!(hostname = ?fe.hostname, "No front-end wanted, keeping live tunnel");
        wanted += 1;
    }
    if wanted == 0 {
        error!("No front-end wanted! We are lame.");
    }
    wanted
}

/// The dynamic DNS update a table calls for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DdnsPlan {
    /// Comma-joined addresses of the wanted, connected frontends.
    pub addresses: String,
    /// Frontends named in `addresses`.
    pub members: Vec<usize>,
}

/// Work out whether DNS needs updating.
///
/// An update is due when a wanted live frontend is not yet in DNS (or a
/// forced update is pending) or an unwanted live frontend still is.
pub fn ddns_plan(table: &FrontendTable, force_update: bool) -> Option<DdnsPlan> {
    let mut addresses = Vec::new();
    let mut members = Vec::new();
    let mut stale = false;

    for (index, fe) in table.iter().filter(|(_, fe)| fe.live) {
        let in_dns = fe.flags.contains(FeFlags::IN_DNS);
        if fe.flags.contains(FeFlags::WANTED) {
            if let Some(addr) = fe.addr {
                addresses.push(addr.ip().to_string());
                members.push(index);
            }
            stale |= !in_dns || force_update;
        } else {
            stale |= in_dns;
        }
    }

    (stale && !addresses.is_empty()).then(|| DdnsPlan {
        addresses: addresses.join(","),
        members,
    })
}

/// Record a successful DNS update for `members`.
pub fn mark_published(table: &mut FrontendTable, members: &[usize], now: Instant) {
    for &index in members {
        if let Some(fe) = table.get_mut(index) {
            fe.last_ddnsup = Some(now);
            fe.flags.insert(FeFlags::IN_DNS);
        }
    }
}

/// Debug-log the state of every frontend.
pub fn log_fe_status(table: &FrontendTable, now: Instant) {
    for (_, fe) in table.iter() {
        let Some(addr) = fe.addr else {
            continue;
        };
        let in_dns_ago = fe
            .last_ddnsup
            .map(|seen| now.saturating_duration_since(seen).as_secs());
        debug!(
            frontend = %addr,
            flags = format_args!("{:#010x}", fe.flags.bits()),
            errors = fe.error_count,
            live = fe.live,
            in_dns_ago,
            "Front-end status"
        );
    }
}
