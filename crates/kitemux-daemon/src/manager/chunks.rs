//! Chunks arriving on a tunnel: stream setup, data, EOFs and pings.

use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, trace};

use kitemux_core::proto::{
    Chunk, EofFlags, format_eof, format_pong, format_reply, rejection_payload,
};

use super::{Manager, StreamError};
use crate::conn::{ConnKey, ConnKind, ConnStatus};
use crate::pool::PoolError;

/// Bound on connecting to a local backend.
const BACKEND_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// A backend connect that finished on its own task.
#[derive(Debug)]
pub(super) struct Connected {
    key: ConnKey,
    proto: String,
    host: String,
    backend: String,
    result: Result<TcpStream, StreamError>,
}

/// Record an EOF from the peer on a backend connection.
///
/// `R` means the peer's local input ended, so we end our write side once
/// the buffer drains. `W` means the peer can no longer deliver, so we stop
/// reading.
pub fn apply_eof(status: &mut ConnStatus, token: &str) {
    let eof = EofFlags::from_token(token);
    if eof.contains(EofFlags::WRITE) {
        status.insert(ConnStatus::END_READ);
    }
    if eof.contains(EofFlags::READ) {
        status.insert(ConnStatus::END_WRITE);
    }
}

impl Manager {
    pub(super) fn handle_chunk(&mut self, tunnel: usize, chunk: Chunk) {
        trace!(
            tunnel,
            sid = ?chunk.sid,
            bytes = chunk.data.len(),
            eof = ?chunk.eof,
            noop = chunk.noop,
            "Chunk"
        );

        let mut backend = None;
        if let Some(sid) = chunk.sid.as_deref() {
            backend = self.pool.find(tunnel, sid);
            if backend.is_none() && !chunk.noop && chunk.eof.is_none() {
                match self.start_backend(tunnel, sid, &chunk) {
                    Ok(index) => backend = Some(index),
                    Err(e) => {
                        let proto = chunk.request_proto.as_deref().unwrap_or_default();
                        let host = chunk.request_host.as_deref().unwrap_or_default();
                        self.reject_stream(tunnel, sid, proto, host);
                        info!(sid, proto, host, error = %e, "No stream found");
                    }
                }
            }
        }

        if chunk.noop {
            if chunk.ping
                && let Some(t) = self.tunnels.get_mut(tunnel)
            {
                t.conn.write(&format_pong());
                trace!(tunnel, "Pong");
            }
        } else if let Some(b) = backend.and_then(|index| self.pool.get_mut(index)) {
            match chunk.eof.as_deref() {
                None => {
                    b.conn.write(&chunk.data);
                }
                Some(token) => apply_eof(&mut b.conn.status, token),
            }
        }

        if let Some(index) = backend {
            if let Some(b) = self.pool.get_mut(index) {
                if chunk.throttle_spd > 0 {
                    b.conn.throttle();
                }
                if chunk.remote_sent_kb > 0 {
                    b.conn.sent_kb = chunk.remote_sent_kb;
                }
            }
            self.update_backend_io(index);
        }
    }

    /// Claim a backend slot for a new stream and start connecting it on its
    /// own task. Data for the stream is buffered until the connect finishes
    /// and [`Self::backend_connected`] attaches the socket.
    fn start_backend(
        &mut self,
        tunnel: usize,
        sid: &str,
        chunk: &Chunk,
    ) -> Result<usize, StreamError> {
        let (Some(proto), Some(host)) = (
            chunk.request_proto.as_deref(),
            chunk.request_host.as_deref(),
        ) else {
            return Err(StreamError::MissingRequest);
        };

        let (kite, local_domain, local_port) = {
            let kites = self.ctx.kites();
            let found = kites
                .find_kite(proto, host, chunk.request_port)
                .and_then(|index| kites.get(index).map(|kite| (index, kite)));
            let Some((index, kite)) = found else {
                return Err(StreamError::NoSuchKite {
                    proto: proto.to_string(),
                    host: host.to_string(),
                    port: chunk.request_port,
                });
            };
            (index, kite.local_domain.clone(), kite.local_port)
        };

        let claim = self.pool.alloc(
            tunnel,
            sid,
            self.ctx.config.eviction_idle(),
            Instant::now(),
        )?;
        if let Some(evicted) = &claim.evicted {
            if let Some(t) = self.tunnels.get_mut(evicted.tunnel) {
                t.conn.write(&format_eof(&evicted.sid, EofFlags::all()));
            }
            if evicted.live {
                self.ctx.state.stream_down();
            }
            self.hold_tunnel_input(evicted.tunnel);
        }

        let key = self.pool.get_mut(claim.index).map(|b| {
            b.kite = Some(kite);
            b.conn.begin_connect(ConnKind::Backend, claim.index)
        });
        let Some(key) = key else {
            return Err(PoolError::Exhausted(self.pool.capacity()).into());
        };

        let backend = format!("{local_domain}:{local_port}");
        trace!(sid, tunnel, backend = %backend, "Connecting stream");
        let done = self.connects_tx.clone();
        let (proto, host) = (proto.to_string(), host.to_string());
        tokio::spawn(async move {
            let result = match timeout(
                BACKEND_CONNECT_TIMEOUT,
                TcpStream::connect((local_domain.as_str(), local_port)),
            )
            .await
            {
                Ok(Ok(stream)) => Ok(stream),
                Ok(Err(source)) => Err(StreamError::Connect {
                    backend: backend.clone(),
                    source,
                }),
                Err(_) => Err(StreamError::Timeout(backend.clone())),
            };
            let _ = done.send(Connected {
                key,
                proto,
                host,
                backend,
                result,
            });
        });
        Ok(claim.index)
    }

    /// Attach a finished backend connect, or reject the stream if it failed.
    /// Results for slots that were freed or reused meanwhile are dropped.
    pub(super) fn backend_connected(&mut self, done: Connected) {
        let Connected {
            key,
            proto,
            host,
            backend,
            result,
        } = done;
        let index = key.index;
        let Some(b) = self
            .pool
            .get_mut(index)
            .filter(|b| b.conn.is_connecting(key))
        else {
            trace!(?key, backend = %backend, "Connect for a released stream");
            return;
        };
        let (sid, tunnel) = (b.sid.clone(), b.tunnel);

        match result {
            Ok(stream) => {
                b.conn
                    .attach(stream, ConnKind::Backend, index, self.events_tx.clone());
                self.ctx.state.stream_up();
                debug!(sid, tunnel, backend = %backend, "Stream opened");
                self.update_backend_io(index);
            }
            Err(e) => {
                self.pool.free(index);
                self.reject_stream(tunnel, &sid, &proto, &host);
                info!(sid, proto, host, error = %e, "No stream found");
                self.update_tunnel_io(tunnel);
            }
        }
    }

    /// Answer a stream we cannot serve with a rejection and an EOF.
    fn reject_stream(&mut self, tunnel: usize, sid: &str, proto: &str, host: &str) {
        let payload = rejection_payload(
            proto,
            host,
            &self.ctx.config.app_id,
            self.ctx.config.fancy_rejection,
        );
        if let Some(t) = self.tunnels.get_mut(tunnel) {
            t.conn.write(&format_reply(sid, &payload));
            t.conn.write(&format_eof(sid, EofFlags::all()));
        }
    }
}
