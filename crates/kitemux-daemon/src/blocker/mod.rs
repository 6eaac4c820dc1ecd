//! Blocking workers.
//!
//! Workers take housekeeping jobs from the shared pile and do the slow
//! parts of frontend management: DNS lookups, latency probes and dynamic
//! DNS updates. Anything that touches tunnels is sent to the reactor as an
//! [`Intent`] and awaited, so reactor state is never shared.

mod ddns;
mod probe;

pub use ddns::{DdnsError, accepted, expand_url, update_dns};
pub use probe::{
    FRONTEND_PING, FRONTEND_PONG, biased_priority, check_tunnel_pingtimes, ping, probe_frontend,
};

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use kitemux_core::Status;

use crate::context::Context;
use crate::jobs::JobKind;
use crate::manager::{Intent, IntentSender, request};
use crate::selector::{check_kites_dns, choose_tunnels, log_fe_status};

/// Start `count` workers on the blocking thread pool.
pub fn spawn_workers(
    ctx: &Arc<Context>,
    intents: &IntentSender,
    count: usize,
) -> Vec<JoinHandle<()>> {
    let handle = Handle::current();
    (0..count)
        .map(|id| {
            let ctx = Arc::clone(ctx);
            let intents = intents.clone();
            let handle = handle.clone();
            tokio::task::spawn_blocking(move || run_worker(id, &ctx, &intents, &handle))
        })
        .collect()
}

fn run_worker(id: usize, ctx: &Arc<Context>, intents: &IntentSender, handle: &Handle) {
    let min_interval = ctx.config.housekeeping_interval_min();
    let due = |last: Option<Instant>| last.is_none_or(|t| t.elapsed() >= min_interval);
    let mut last_check_world: Option<Instant> = None;
    let mut last_check_tunnels: Option<Instant> = None;
    debug!(worker = id, "Started blocking worker");

    loop {
        match ctx.jobs.take() {
            JobKind::Noop => {}
            JobKind::CheckWorld => {
                if due(last_check_world) {
                    handle.block_on(async {
                        check_world(ctx).await;
                        check_tunnels(ctx, intents).await;
                    });
                    last_check_world = Some(Instant::now());
                    last_check_tunnels = last_check_world;
                }
            }
            JobKind::CheckFrontends => {
                if due(last_check_tunnels) {
                    handle.block_on(check_tunnels(ctx, intents));
                    last_check_tunnels = Some(Instant::now());
                }
            }
            JobKind::Quit => {
                // Put it back for the other workers.
                if let Err(e) = ctx.jobs.submit(JobKind::Quit) {
                    warn!(worker = id, error = %e, "Failed to requeue quit");
                }
                debug!(worker = id, "Exiting blocking worker");
                return;
            }
        }
    }
}

/// Resolve every kite's public domain and mark the frontends it points at.
async fn refresh_kites_dns(ctx: &Context) -> usize {
    let domains: Vec<String> = ctx
        .kites()
        .iter()
        .map(|(_, kite)| kite.public_domain.clone())
        .collect();

    let mut resolved: Vec<(String, Vec<IpAddr>)> = Vec::with_capacity(domains.len());
    for domain in domains {
        match tokio::net::lookup_host((domain.as_str(), 0)).await {
            Ok(addrs) => {
                let ips = addrs.map(|addr| addr.ip()).collect();
                resolved.push((domain.clone(), ips));
            }
            Err(e) => debug!(domain = %domain, error = %e, "DNS lookup failed"),
        }
    }

    check_kites_dns(&mut ctx.frontends(), &resolved, Instant::now())
}

/// Full re-evaluation: DNS, then latency probes.
pub async fn check_world(ctx: &Arc<Context>) {
    if ctx.state.status() == Status::NoNetwork {
        return;
    }
    debug!("Checking state of world...");
    ctx.frontends().clear_transient_flags();
    refresh_kites_dns(ctx).await;
    check_tunnel_pingtimes(ctx).await;
    log_fe_status(&ctx.frontends(), Instant::now());
    ctx.housekeeping().last_world_update = Some(Instant::now() + ctx.fudge);
}

/// Select frontends, have the reactor connect and disconnect accordingly,
/// push DNS updates and settle the overall status.
pub async fn check_tunnels(ctx: &Arc<Context>, intents: &IntentSender) {
    if ctx.state.status() == Status::NoNetwork {
        return;
    }
    debug!("Checking tunnels...");

    refresh_kites_dns(ctx).await;
    choose_tunnels(&mut ctx.frontends(), ctx.config.spare_frontends);
    log_fe_status(&ctx.frontends(), Instant::now());

    let Some(mut problems) = request(intents, |reply| Intent::Reconnect { reply }).await else {
        debug!("Reactor gone, skipping tunnel check");
        return;
    };
    if problems == 0
        && let Some(closed) = request(intents, |reply| Intent::DisconnectUnused { reply }).await
        && closed > 0
    {
        info!(closed, "Disconnected unused tunnels");
    }

    if ctx.config.dynamic_dns_url.is_some() && ctx.state.status() != Status::Rejected {
        problems += update_dns(ctx).await;
    }

    ctx.state.set_force_update(false);
    if problems == 0 && ctx.state.live_tunnels() > 0 {
        ctx.state.set_status(Status::Flying);
    } else if ctx.state.status() != Status::Rejected {
        ctx.state.set_status(Status::Problems);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    use kitemux_core::ManagerConfig;

    use crate::frontend::FeFlags;
    use crate::manager::Manager;
    use crate::test_helpers::{Answer, DuplexConnector, add_test_frontend, test_context};

    #[tokio::test]
    async fn check_tunnels_connects_nailed_up_frontend() {
        let ctx = test_context(ManagerConfig {
            workers: 0,
            enable_timer: false,
            ..ManagerConfig::default()
        });
        let fe = add_test_frontend(&ctx, 1, FeFlags::NAILED_UP);
        let (connector, mut peers) = DuplexConnector::new(Answer::Accept);
        let handle = Manager::spawn(Arc::clone(&ctx), connector);

        check_tunnels(&ctx, handle.intents()).await;

        let _peer = peers.recv().await.unwrap();
        assert_eq!(ctx.state.status(), Status::Flying);
        assert_eq!(ctx.state.live_tunnels(), 1);
        assert!(!ctx.state.force_update());
        let table = ctx.frontends();
        let fe = table.get(fe).unwrap();
        assert!(fe.live);
        assert!(fe.flags.contains(FeFlags::WANTED));
        drop(table);
        handle.stop().await;
    }

    #[tokio::test]
    async fn rejection_sticks_through_tunnel_check() {
        let ctx = test_context(ManagerConfig {
            workers: 0,
            enable_timer: false,
            ..ManagerConfig::default()
        });
        let fe = add_test_frontend(&ctx, 1, FeFlags::NAILED_UP);
        let (connector, _peers) = DuplexConnector::new(Answer::Reject);
        let handle = Manager::spawn(Arc::clone(&ctx), connector);

        check_tunnels(&ctx, handle.intents()).await;

        assert_eq!(ctx.state.status(), Status::Rejected);
        assert_eq!(ctx.state.live_tunnels(), 0);
        let flags = ctx.frontends().get(fe).unwrap().flags;
        assert!(flags.contains(FeFlags::REJECTED));
        handle.stop().await;
    }

    #[tokio::test]
    async fn no_network_skips_checks() {
        let ctx = test_context(ManagerConfig {
            workers: 0,
            enable_timer: false,
            ..ManagerConfig::default()
        });
        add_test_frontend(&ctx, 1, FeFlags::NAILED_UP);
        ctx.state.set_status(Status::NoNetwork);
        let (connector, _peers) = DuplexConnector::new(Answer::Accept);
        let handle = Manager::spawn(Arc::clone(&ctx), connector);

        check_world(&ctx).await;
        check_tunnels(&ctx, handle.intents()).await;

        assert_eq!(ctx.state.status(), Status::NoNetwork);
        assert_eq!(ctx.state.live_tunnels(), 0);
        assert!(ctx.housekeeping().last_world_update.is_none());
        handle.stop().await;
    }

    #[tokio::test]
    async fn check_world_records_update_time() {
        let ctx = test_context(ManagerConfig {
            fake_ping: true,
            ..ManagerConfig::default()
        });
        add_test_frontend(&ctx, 1, FeFlags::LAME);
        let before = Instant::now();

        check_world(&ctx).await;

        assert!(ctx.housekeeping().last_world_update.unwrap() >= before);
        let fe = ctx.frontends().get(0).cloned().unwrap();
        assert!(!fe.flags.contains(FeFlags::LAME));
    }

    #[tokio::test]
    async fn stopped_reactor_ends_tunnel_check() {
        let ctx = test_context(ManagerConfig::default());
        let (intents, rx) = tokio::sync::mpsc::unbounded_channel();
        drop(rx);
        check_tunnels(&ctx, &intents).await;
        assert_eq!(ctx.state.status(), Status::Startup);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn workers_exit_on_quit() {
        let ctx = test_context(ManagerConfig::default());
        let (intents, _rx) = tokio::sync::mpsc::unbounded_channel();
        let workers = spawn_workers(&ctx, &intents, 3);
        ctx.jobs.submit(JobKind::Noop).unwrap();
        ctx.jobs.submit(JobKind::Quit).unwrap();
        for worker in workers {
            tokio::time::timeout(Duration::from_secs(5), worker)
                .await
                .unwrap()
                .unwrap();
        }
        assert_eq!(ctx.jobs.len(), 1);
    }
}
