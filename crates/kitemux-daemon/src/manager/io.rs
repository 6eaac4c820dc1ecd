//! Socket events and the per-connection I/O state machine.
//!
//! After anything changes on a connection, `update_*_io` recomputes what
//! it should be doing: whether to keep reading, whether a half-close is due,
//! which EOFs the peer needs to hear about, and whether both directions are
//! finished so the slot can be released.

use std::time::Duration;

use tracing::{debug, trace, warn};

use kitemux_core::Status;
use kitemux_core::proto::{EofFlags, format_eof, format_progress, format_reply, reply_overhead};

use super::Manager;
use crate::conn::{ConnKey, ConnKind, ConnStatus, Connection, FlushMode, IoEvent};

/// Frame `data` from stream `sid` onto a tunnel, forcing a flush first if
/// the chunk header would not fit in the output budget.
fn write_chunked(tunnel: &mut Connection, sid: &str, data: &[u8]) -> bool {
    if tunnel.out_free() < reply_overhead(sid, data.len()) {
        tunnel.flush(FlushMode::Blocking);
    }
    tunnel.write(&format_reply(sid, data))
}

/// Stop or resume reading on a connection whose read side is still open.
fn watch_input(conn: &Connection) {
    if conn.status.intersects(ConnStatus::BLOCKED) && !conn.status.contains(ConnStatus::WANT_READ)
    {
        conn.disarm_read();
    } else {
        conn.arm_read();
    }
}

impl Manager {
    fn conn_mut(&mut self, key: ConnKey) -> Option<&mut Connection> {
        let conn = match key.kind {
            ConnKind::Tunnel => &mut self.tunnels.get_mut(key.index)?.conn,
            ConnKind::Backend => &mut self.pool.get_mut(key.index)?.conn,
        };
        (conn.is_live() && conn.key(key.kind, key.index) == key).then_some(conn)
    }

    fn update_io(&mut self, key: ConnKey) {
        match key.kind {
            ConnKind::Tunnel => self.update_tunnel_io(key.index),
            ConnKind::Backend => self.update_backend_io(key.index),
        }
    }

    pub(super) fn handle_event(&mut self, event: IoEvent) {
        let key = event.key();
        let Some(conn) = self.conn_mut(key) else {
            trace!(?key, "Event for a closed connection");
            return;
        };
        match event {
            IoEvent::Read { data, .. } => match key.kind {
                ConnKind::Tunnel => self.tunnel_readable(key.index, &data),
                ConnKind::Backend => self.backend_readable(key.index, &data),
            },
            IoEvent::Wrote { bytes, .. } => {
                conn.record_wrote(bytes);
                conn.flush(FlushMode::NonBlocking);
                self.update_io(key);
            }
            IoEvent::Eof { .. } => {
                conn.status.insert(ConnStatus::CLS_READ);
                self.update_io(key);
            }
            IoEvent::Failed { error, .. } => {
                debug!(?key, error = %error, "Connection failed");
                conn.status.insert(ConnStatus::BROKEN);
                self.update_io(key);
            }
        }
    }

    fn tunnel_readable(&mut self, index: usize, data: &[u8]) {
        let Some(tunnel) = self.tunnels.get_mut(index) else {
            return;
        };
        tunnel.conn.record_read(data.len());
        let chunks = match tunnel.parser.parse(data) {
            Ok(chunks) => chunks,
            Err(e) => {
                warn!(tunnel = index, error = %e, "Parse error, dropping tunnel");
                tunnel.conn.status.insert(ConnStatus::BROKEN);
                Vec::new()
            }
        };
        for chunk in chunks {
            self.handle_chunk(index, chunk);
        }
        self.update_tunnel_io(index);
    }

    fn backend_readable(&mut self, index: usize, data: &[u8]) {
        let Some(backend) = self.pool.get_mut(index) else {
            return;
        };
        backend.conn.record_read(data.len());
        let tunnel = backend.tunnel;
        if let Some(t) = self.tunnels.get_mut(tunnel) {
            write_chunked(&mut t.conn, &backend.sid, data);
        }
        self.update_tunnel_io(tunnel);
        self.update_backend_io(index);
    }

    pub(super) fn update_backend_io(&mut self, index: usize) {
        let Some(tunnel) = self.pool.get(index).map(|b| b.tunnel) else {
            return;
        };
        self.update_backend_flows(index);
        self.hold_tunnel_input(tunnel);
    }

    fn update_backend_flows(&mut self, index: usize) {
        let Some(backend) = self.pool.get_mut(index) else {
            return;
        };
        let conn = &mut backend.conn;
        if !conn.is_live() {
            return;
        }
        let mut tunnel = self.tunnels.get_mut(backend.tunnel).map(|t| &mut t.conn);
        let sid = backend.sid.as_str();

        if let Some(kb) = conn.progress_due()
            && let Some(tunnel) = tunnel.as_deref_mut()
        {
            tunnel.write(&format_progress(sid, kb));
        }
        if conn.window_exhausted() {
            if !conn.status.contains(ConnStatus::DST_BLOCKED) {
                trace!(sid, "Destination blocked");
                conn.status.insert(ConnStatus::DST_BLOCKED);
            }
        } else if conn.status.contains(ConnStatus::DST_BLOCKED) {
            trace!(sid, "Destination unblocked");
            conn.status.remove(ConnStatus::DST_BLOCKED);
        }

        let mut flows = 2;
        let mut eof = EofFlags::empty();

        if conn
            .status
            .intersects(ConnStatus::CLS_READ | ConnStatus::END_READ)
        {
            if !conn.status.contains(ConnStatus::END_READ) {
                eof |= EofFlags::READ;
            }
            conn.status |= ConnStatus::END_READ | ConnStatus::CLS_READ;
            conn.shutdown_read();
            flows -= 1;
        } else {
            watch_input(conn);
        }

        if conn.status.contains(ConnStatus::CLS_WRITE) {
            if !conn.status.contains(ConnStatus::END_WRITE) {
                eof |= EofFlags::WRITE;
            }
            conn.status |= ConnStatus::END_WRITE | ConnStatus::CLS_WRITE;
            conn.discard_output();
            conn.shutdown_write();
            flows -= 1;
        } else if conn.has_pending_output() || conn.status.contains(ConnStatus::WANT_WRITE) {
            trace!(sid, "Backend blocked");
        } else if conn.status.contains(ConnStatus::END_WRITE) {
            conn.status |= ConnStatus::CLS_WRITE;
            conn.shutdown_write();
            flows -= 1;
        }

        if !eof.is_empty()
            && let Some(tunnel) = tunnel
        {
            tunnel.write(&format_eof(sid, eof));
            trace!(sid, eof = eof.token(), "Sent EOF");
        }

        if flows == 0 {
            debug!(sid, "Stream closed");
            self.free_backend(index);
        }
    }

    pub(super) fn update_tunnel_io(&mut self, index: usize) {
        let held = self.pool.output_full_on(index);
        let Some(tunnel) = self.tunnels.get_mut(index) else {
            return;
        };
        let conn = &mut tunnel.conn;
        if !conn.is_live() {
            return;
        }
        conn.status.set(ConnStatus::DST_BLOCKED, held);

        let mut flows = 2;
        let mut eof = false;

        if conn
            .status
            .intersects(ConnStatus::CLS_READ | ConnStatus::END_READ)
        {
            eof |= !conn.status.contains(ConnStatus::END_READ);
            // A tunnel we cannot read is useless for writing too.
            conn.status |= ConnStatus::END_READ | ConnStatus::CLS_READ | ConnStatus::CLS_WRITE;
            conn.shutdown_read();
            flows -= 1;
        } else {
            watch_input(conn);
        }

        let mut backlogged = None;
        if conn.status.contains(ConnStatus::CLS_WRITE) {
            eof |= !conn.status.contains(ConnStatus::END_WRITE);
            conn.status |= ConnStatus::END_WRITE | ConnStatus::CLS_WRITE;
            conn.discard_output();
            conn.shutdown_write();
            flows -= 1;
        } else if conn.has_pending_output() || conn.status.contains(ConnStatus::WANT_WRITE) {
            backlogged = Some(true);
        } else if conn.status.contains(ConnStatus::END_WRITE) {
            conn.status |= ConnStatus::CLS_WRITE;
            conn.shutdown_write();
            flows -= 1;
        } else {
            backlogged = Some(false);
        }

        match backlogged {
            Some(true) => self.block_backends(index),
            Some(false) => self.unblock_backends(index),
            None => {}
        }

        if eof {
            debug!(tunnel = index, "Shutting down tunnel");
            for backend in self.pool.allocated_on(index) {
                let Some(b) = self.pool.get_mut(backend) else {
                    continue;
                };
                if b.conn.is_live() {
                    b.conn.status |= ConnStatus::END_WRITE | ConnStatus::END_READ;
                    self.update_backend_io(backend);
                } else {
                    self.free_backend(backend);
                }
            }
        }

        if flows == 0 {
            self.tunnel_closed(index);
        }
    }

    /// Stop reading a tunnel while any stream it carries has a full output
    /// buffer, and resume once they have all drained.
    pub(super) fn hold_tunnel_input(&mut self, index: usize) {
        let held = self.pool.output_full_on(index);
        let Some(tunnel) = self.tunnels.get_mut(index) else {
            return;
        };
        let conn = &mut tunnel.conn;
        if held != conn.status.contains(ConnStatus::DST_BLOCKED) {
            trace!(tunnel = index, held, "Tunnel input");
            conn.status.set(ConnStatus::DST_BLOCKED, held);
        }
        if conn.is_live()
            && !conn
                .status
                .intersects(ConnStatus::CLS_READ | ConnStatus::END_READ)
        {
            watch_input(conn);
        }
    }

    fn block_backends(&mut self, tunnel: usize) {
        for index in self.pool.allocated_on(tunnel) {
            if let Some(b) = self.pool.get_mut(index)
                && !b.conn.status.contains(ConnStatus::TNL_BLOCKED)
            {
                trace!(sid = %b.sid, "Tunnel blocked");
                b.conn.status.insert(ConnStatus::TNL_BLOCKED);
                b.conn.disarm_read();
            }
        }
    }

    fn unblock_backends(&mut self, tunnel: usize) {
        let closed = ConnStatus::CLS_READ | ConnStatus::END_READ;
        for index in self.pool.allocated_on(tunnel) {
            if let Some(b) = self.pool.get_mut(index)
                && b.conn.status.contains(ConnStatus::TNL_BLOCKED)
            {
                trace!(sid = %b.sid, "Tunnel unblocked");
                b.conn.status.remove(ConnStatus::TNL_BLOCKED);
                if !b.conn.status.intersects(ConnStatus::BLOCKED | closed) {
                    b.conn.arm_read();
                }
            }
        }
    }

    /// Release a backend slot, closing its socket.
    pub(super) fn free_backend(&mut self, index: usize) {
        if self.pool.get(index).is_some_and(|b| b.conn.is_live()) {
            self.ctx.state.stream_down();
        }
        self.pool.free(index);
    }

    /// Both directions of a tunnel are done: reset it and hurry the next
    /// housekeeping pass along.
    fn tunnel_closed(&mut self, index: usize) {
        debug!(tunnel = index, "Tunnel closed");
        self.reset_tunnel(index);
        self.ctx.state.set_status(Status::Problems);
        if self.ctx.state.live_tunnels() < 1 {
            self.next_tick = self.ctx.config.housekeeping_interval_min() + Duration::from_secs(1);
        }
        self.tick_deadline = Some(tokio::time::Instant::now());
    }
}
