//! Tunnel lifecycle: connecting, tearing down, and the housekeeping tick.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use kitemux_core::proto::format_ping;
use kitemux_core::{Kite, Status};

use super::Manager;
use crate::conn::{ConnKind, ConnStatus};
use crate::frontend::FeFlags;
use crate::handshake::{ConnectError, KiteRequest, RequestStatus};
use crate::jobs::JobKind;

impl Manager {
    /// Connect every wanted or published frontend that has no tunnel, or
    /// whose kite registrations are incomplete. Returns how many attempts
    /// failed; duplicate registrations do not count.
    pub(super) async fn reconnect_all(&mut self) -> usize {
        let targets: Vec<(usize, SocketAddr, String)> = self
            .ctx
            .frontends()
            .iter()
            .filter(|(_, fe)| fe.flags.intersects(FeFlags::WANTED | FeFlags::IN_DNS))
            .filter_map(|(index, fe)| Some((index, fe.addr?, fe.hostname.clone()?)))
            .collect();
        let kites: Vec<Kite> = self
            .ctx
            .kites()
            .iter()
            .map(|(_, kite)| kite.clone())
            .collect();

        let mut tried = 0usize;
        let mut connected = 0usize;
        for (index, addr, hostname) in targets {
            let Some(tunnel) = self.tunnels.get_mut(index) else {
                continue;
            };
            if tunnel.requests.len() != kites.len() {
                tunnel.requests = kites.iter().cloned().map(KiteRequest::new).collect();
            }
            let incomplete = tunnel
                .requests
                .iter()
                .any(|r| r.status == RequestStatus::Unknown);
            if tunnel.conn.is_live() && !incomplete {
                continue;
            }

            tried += 1;
            self.ctx.state.set_status(Status::Connecting);
            let requests = std::mem::take(&mut tunnel.requests);
            for backend in self.pool.allocated_on(index) {
                self.free_backend(backend);
            }
            self.reset_tunnel(index);

            match self.connect_tunnel(index, addr, &hostname, requests).await {
                Ok(()) => connected += 1,
                Err(e) => {
                    if self.connect_failed(index, addr, &e) {
                        tried -= 1;
                    }
                }
            }
        }
        tried.saturating_sub(connected)
    }

    async fn connect_tunnel(
        &mut self,
        index: usize,
        addr: SocketAddr,
        hostname: &str,
        mut requests: Vec<KiteRequest>,
    ) -> Result<(), ConnectError> {
        for request in &mut requests {
            request.status = RequestStatus::Unknown;
            request.challenge = None;
        }
        debug!(frontend = %addr, hostname, kites = requests.len(), "Connecting");
        let result = self.connector.connect(addr, hostname, &mut requests).await;

        let Some(tunnel) = self.tunnels.get_mut(index) else {
            return Err(ConnectError::Handshake(format!("no tunnel slot {index}")));
        };
        tunnel.requests = requests;
        let stream = result?;

        tunnel.parser.reset();
        tunnel.conn.reset(ConnStatus::ALLOCATED);
        tunnel
            .conn
            .attach(stream, ConnKind::Tunnel, index, self.events_tx.clone());
        tunnel.conn.arm_read();
        tunnel.last_ping = Instant::now();
        self.ctx.state.tunnel_up();
        if let Some(fe) = self.ctx.frontends().get_mut(index) {
            fe.error_count = 0;
            fe.live = true;
        }
        info!(frontend = %addr, hostname, "Connected");
        Ok(())
    }

    /// Record a failed connect. Returns true if the failure was a duplicate
    /// registration, which is not counted as a problem.
    fn connect_failed(&mut self, index: usize, addr: SocketAddr, error: &ConnectError) -> bool {
        if let Some(tunnel) = self.tunnels.get_mut(index) {
            tunnel.requests.clear();
        }
        let mut table = self.ctx.frontends();
        let Some(fe) = table.get_mut(index) else {
            return false;
        };
        fe.record_error();
        match error {
            ConnectError::Rejected => {
                fe.flags.insert(FeFlags::REJECTED);
                drop(table);
                warn!(frontend = %addr, "Connect failed: rejected");
                self.ctx.state.set_status(Status::Rejected);
                false
            }
            ConnectError::Duplicate => {
                fe.flags.insert(FeFlags::LAME);
                warn!(frontend = %addr, "Connect failed: duplicate kite, marking lame");
                true
            }
            other => {
                warn!(frontend = %addr, error = %other, "Connect failed");
                false
            }
        }
    }

    /// Close tunnels to frontends that are neither wanted nor in DNS and no
    /// longer carry any stream. Returns how many were closed.
    pub(super) fn disconnect_unused(&mut self) -> usize {
        let unused: Vec<usize> = self
            .ctx
            .frontends()
            .iter()
            .filter(|(_, fe)| !fe.flags.intersects(FeFlags::WANTED | FeFlags::IN_DNS))
            .map(|(index, _)| index)
            .collect();

        let mut closed = 0;
        for index in unused {
            let live = self.tunnels.get(index).is_some_and(|t| t.conn.is_live());
            if !live || self.pool.has_live_on(index) {
                continue;
            }
            info!(tunnel = index, "Disconnecting unused tunnel");
            self.reset_tunnel(index);
            closed += 1;
        }
        closed
    }

    /// Drop a tunnel's socket, registrations and parser state.
    pub(super) fn reset_tunnel(&mut self, index: usize) {
        let Some(tunnel) = self.tunnels.get_mut(index) else {
            return;
        };
        let was_live = tunnel.conn.is_live();
        tunnel.conn.reset(ConnStatus::ALLOCATED);
        tunnel.requests.clear();
        tunnel.parser.reset();
        if was_live {
            self.ctx.state.tunnel_down();
            self.set_frontend_live(index, false);
        }
    }

    /// Housekeeping: reschedule, ping idle tunnels, close dead ones, and
    /// queue a world or frontend check for the workers.
    pub(super) fn tick(&mut self) {
        let config = &self.ctx.config;
        let now = Instant::now();
        let min_interval = config.housekeeping_interval_min();
        let reset_interval = min_interval + Duration::from_secs(1);
        let interval = self.next_tick;
        let increment = interval / 3;

        let status = self.ctx.state.status();
        let mut next_tick = interval;
        let settled = matches!(
            status,
            Status::NoNetwork | Status::Rejected | Status::Flying
        );
        if config.enable_timer || !settled {
            self.tick_deadline = Some(tokio::time::Instant::now() + interval);
            debug!(next_secs = interval.as_secs(), "Tick");
            next_tick = (next_tick + increment).min(config.housekeeping_interval_max() + self.ctx.fudge);
        } else {
            self.tick_deadline = None;
            debug!("Tick, timer stopped");
            next_tick = reset_interval;
        }

        let dead_after = min_interval * 4;
        for index in 0..self.tunnels.len() {
            let tunnel = &mut self.tunnels[index];
            if !tunnel.conn.is_live() {
                continue;
            }
            let activity = tunnel.conn.activity();
            if tunnel.last_ping.saturating_duration_since(activity) > dead_after {
                info!(tunnel = index, "Idle, shutting down");
                tunnel.conn.status |= ConnStatus::BROKEN;
                self.update_tunnel_io(index);
            } else if now.saturating_duration_since(activity) > interval + increment {
                tunnel.last_ping = now;
                tunnel.conn.write(&format_ping());
                debug!(tunnel = index, "Sent PING");
                next_tick = reset_interval;
            }
        }

        let last_world = self.ctx.housekeeping().last_world_update;
        let world_due =
            last_world.is_none_or(|t| t + self.ctx.config.check_world_interval() < now);
        let job = if world_due {
            next_tick = reset_interval;
            JobKind::CheckWorld
        } else {
            JobKind::CheckFrontends
        };
        if self.ctx.config.workers > 0
            && let Err(e) = self.ctx.jobs.submit(job)
        {
            warn!(job = ?job, error = %e, "Failed to queue housekeeping");
        }

        self.next_tick = next_tick;
    }
}
