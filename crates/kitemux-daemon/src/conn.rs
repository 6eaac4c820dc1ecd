//! Connection state shared by tunnel and backend sockets.
//!
//! The reactor owns every [`Connection`]. Socket I/O runs in two small tasks
//! per connection (see [`ConnIo`]) that report back over a single event
//! channel, so the reactor itself never awaits a read or write.

use std::sync::Arc;
use std::time::Instant;

use bitflags::bitflags;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::trace;

use kitemux_core::proto::MAX_CHUNK_SIZE;

/// Per-connection output budget and read size.
pub const CONN_IO_BUFFER_SIZE: usize = 16 * 1024;
/// Queued plus unconfirmed output at which a connection counts as full.
pub const CONN_OUT_BUFFER_MAX: usize = 4 * MAX_CHUNK_SIZE;

/// Initial per-stream send window, in kilobytes.
pub const CONN_WINDOW_SIZE_KB_INITIAL: u64 = 256;
/// Throttle hints never shrink the window below this.
pub const CONN_WINDOW_SIZE_KB_MINIMUM: u64 = 16;
/// Interval, in kilobytes written, between progress reports to the peer.
pub const PROGRESS_REPORT_KB: u64 = 16;

bitflags! {
    /// Connection status bits. The empty set marks a free slot.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ConnStatus: u32 {
        const ALLOCATED   = 0x0001;
        /// A connect is in progress. Output is held until the socket attaches.
        const CONNECTING  = 0x0002;
        /// Read side shut down locally.
        const CLS_READ    = 0x0010;
        /// No more data will be read.
        const END_READ    = 0x0020;
        /// Write side shut down locally.
        const CLS_WRITE   = 0x0040;
        /// No more data will be written once the buffer drains.
        const END_WRITE   = 0x0080;
        const WANT_READ   = 0x0100;
        const WANT_WRITE  = 0x0200;
        /// The carrying tunnel is backlogged.
        const TNL_BLOCKED = 0x1000;
        /// The remote end has not caught up with our send window. On a
        /// tunnel: a stream it carries has a full output buffer.
        const DST_BLOCKED = 0x2000;

        const BLOCKED = Self::TNL_BLOCKED.bits() | Self::DST_BLOCKED.bits();
        const BROKEN  = Self::CLS_READ.bits() | Self::CLS_WRITE.bits();
    }
}

impl ConnStatus {
    pub const UNKNOWN: Self = Self::empty();
}

/// Which table a connection lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnKind {
    Tunnel,
    Backend,
}

/// Identifies one attachment of a socket to a slot. The generation changes
/// on every attach so events from a previous socket are recognisable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnKey {
    pub kind: ConnKind,
    pub index: usize,
    pub generation: u64,
}

/// Reports from the per-connection I/O tasks.
#[derive(Debug)]
pub enum IoEvent {
    Read { key: ConnKey, data: Vec<u8> },
    Wrote { key: ConnKey, bytes: usize },
    Eof { key: ConnKey },
    Failed { key: ConnKey, error: String },
}

impl IoEvent {
    pub const fn key(&self) -> ConnKey {
        match self {
            Self::Read { key, .. }
            | Self::Wrote { key, .. }
            | Self::Eof { key }
            | Self::Failed { key, .. } => *key,
        }
    }
}

#[derive(Debug)]
enum Outbound {
    Data(Vec<u8>),
    Shutdown,
}

/// Reader and writer tasks for one socket.
///
/// The reader performs one read per permit on `read_gate`, which is how the
/// reactor starts and stops watching for input. The writer drains queued
/// output in order and reports each completed write.
#[derive(Debug)]
pub struct ConnIo {
    read_gate: Arc<Semaphore>,
    outbound: mpsc::UnboundedSender<Outbound>,
    reader: JoinHandle<()>,
}

impl ConnIo {
    pub fn spawn<S>(stream: S, key: ConnKey, events: mpsc::UnboundedSender<IoEvent>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut rd, mut wr) = tokio::io::split(stream);
        let read_gate = Arc::new(Semaphore::new(0));

        let gate = Arc::clone(&read_gate);
        let read_events = events.clone();
        let reader = tokio::spawn(async move {
            let mut buf = vec![0u8; CONN_IO_BUFFER_SIZE];
            loop {
                match gate.acquire().await {
                    Ok(permit) => permit.forget(),
                    Err(_) => return,
                }
                let event = match rd.read(&mut buf).await {
                    Ok(0) => IoEvent::Eof { key },
                    Ok(n) => IoEvent::Read {
                        key,
                        data: buf[..n].to_vec(),
                    },
                    Err(e) => IoEvent::Failed {
                        key,
                        error: e.to_string(),
                    },
                };
                let done = !matches!(event, IoEvent::Read { .. });
                if read_events.send(event).is_err() || done {
                    return;
                }
            }
        });

        let (outbound, mut queue) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(item) = queue.recv().await {
                match item {
                    Outbound::Data(data) => {
                        if let Err(e) = wr.write_all(&data).await {
                            let _ = events.send(IoEvent::Failed {
                                key,
                                error: e.to_string(),
                            });
                            return;
                        }
                        let _ = events.send(IoEvent::Wrote {
                            key,
                            bytes: data.len(),
                        });
                    }
                    Outbound::Shutdown => {
                        let _ = wr.shutdown().await;
                    }
                }
            }
            let _ = wr.shutdown().await;
            trace!(?key, "Writer finished");
        });

        Self {
            read_gate,
            outbound,
            reader,
        }
    }

    /// Allow the next read. Idempotent.
    pub fn arm_read(&self) {
        if self.read_gate.available_permits() == 0 {
            self.read_gate.add_permits(1);
        }
    }

    /// Withdraw a pending read permission. A read already in progress
    /// still completes.
    pub fn disarm_read(&self) {
        if let Ok(permit) = self.read_gate.try_acquire() {
            permit.forget();
        }
    }

    pub fn shutdown_read(&self) {
        self.read_gate.close();
        self.reader.abort();
    }

    pub fn shutdown_write(&self) {
        let _ = self.outbound.send(Outbound::Shutdown);
    }

    fn send(&self, data: Vec<u8>) -> bool {
        self.outbound.send(Outbound::Data(data)).is_ok()
    }
}

impl Drop for ConnIo {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// How hard [`Connection::flush`] tries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Hand output to the writer only while it is under budget.
    NonBlocking,
    /// Hand everything over regardless of budget.
    Blocking,
}

/// One socket with its buffering, accounting and status bits.
#[derive(Debug)]
pub struct Connection {
    pub status: ConnStatus,
    io: Option<ConnIo>,
    generation: u64,
    out_buffer: Vec<u8>,
    /// Bytes handed to the writer task but not yet confirmed.
    in_flight: usize,
    read_bytes: u64,
    wrote_bytes: u64,
    /// Kilobytes the remote end reports having received from us.
    pub sent_kb: u64,
    reported_kb: u64,
    pub send_window_kb: u64,
    activity: Instant,
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection {
    pub fn new() -> Self {
        Self {
            status: ConnStatus::UNKNOWN,
            io: None,
            generation: 0,
            out_buffer: Vec::new(),
            in_flight: 0,
            read_bytes: 0,
            wrote_bytes: 0,
            sent_kb: 0,
            reported_kb: 0,
            send_window_kb: CONN_WINDOW_SIZE_KB_INITIAL,
            activity: Instant::now(),
        }
    }

    /// Drop any socket and zero buffers and counters.
    pub fn reset(&mut self, status: ConnStatus) {
        self.io = None;
        self.out_buffer.clear();
        self.in_flight = 0;
        self.read_bytes = 0;
        self.wrote_bytes = 0;
        self.sent_kb = 0;
        self.reported_kb = 0;
        self.send_window_kb = CONN_WINDOW_SIZE_KB_INITIAL;
        self.activity = Instant::now();
        self.status = status;
    }

    /// Start I/O tasks for `stream`. Reading stays off until
    /// [`Self::arm_read`].
    pub fn attach<S>(
        &mut self,
        stream: S,
        kind: ConnKind,
        index: usize,
        events: mpsc::UnboundedSender<IoEvent>,
    ) -> ConnKey
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.generation = self.generation.wrapping_add(1);
        let key = self.key(kind, index);
        self.io = Some(ConnIo::spawn(stream, key, events));
        self.activity = Instant::now();
        self.status.remove(ConnStatus::CONNECTING);
        self.flush(FlushMode::NonBlocking);
        key
    }

    /// Mark a connect as started. Writes are buffered until [`Self::attach`],
    /// and the returned key identifies this attempt.
    pub fn begin_connect(&mut self, kind: ConnKind, index: usize) -> ConnKey {
        self.generation = self.generation.wrapping_add(1);
        self.status.insert(ConnStatus::CONNECTING);
        self.key(kind, index)
    }

    /// Whether `key` names the connect started last and still pending.
    pub fn is_connecting(&self, key: ConnKey) -> bool {
        self.status.contains(ConnStatus::CONNECTING) && self.key(key.kind, key.index) == key
    }

    pub const fn key(&self, kind: ConnKind, index: usize) -> ConnKey {
        ConnKey {
            kind,
            index,
            generation: self.generation,
        }
    }

    pub const fn is_live(&self) -> bool {
        self.io.is_some()
    }

    /// Close the socket without touching the status bits.
    pub fn close(&mut self) {
        self.io = None;
    }

    pub const fn activity(&self) -> Instant {
        self.activity
    }

    pub const fn read_kb(&self) -> u64 {
        self.read_bytes / 1024
    }

    pub const fn wrote_kb(&self) -> u64 {
        self.wrote_bytes / 1024
    }

    pub fn record_read(&mut self, bytes: usize) {
        self.read_bytes += bytes as u64;
        self.activity = Instant::now();
    }

    pub fn record_wrote(&mut self, bytes: usize) {
        self.in_flight = self.in_flight.saturating_sub(bytes);
        self.wrote_bytes += bytes as u64;
        self.activity = Instant::now();
    }

    /// Queue `data` and try a non-blocking flush. Data written to a closed
    /// connection is dropped.
    pub fn write(&mut self, data: &[u8]) -> bool {
        if !self.is_live() && !self.status.contains(ConnStatus::CONNECTING) {
            return false;
        }
        self.out_buffer.extend_from_slice(data);
        self.flush(FlushMode::NonBlocking);
        true
    }

    pub fn flush(&mut self, mode: FlushMode) {
        if self.out_buffer.is_empty() {
            return;
        }
        if mode == FlushMode::NonBlocking && self.in_flight >= CONN_IO_BUFFER_SIZE {
            return;
        }
        let Some(io) = &self.io else {
            return;
        };
        let data = std::mem::take(&mut self.out_buffer);
        let len = data.len();
        if io.send(data) {
            self.in_flight += len;
        }
    }

    /// Room left before the connection counts as backlogged.
    pub fn out_free(&self) -> usize {
        CONN_IO_BUFFER_SIZE.saturating_sub(self.out_buffer.len() + self.in_flight)
    }

    /// Output is waiting for the writer to catch up.
    pub fn has_pending_output(&self) -> bool {
        !self.out_buffer.is_empty()
    }

    /// Queued and unconfirmed output together reached [`CONN_OUT_BUFFER_MAX`].
    pub fn out_full(&self) -> bool {
        self.out_buffer.len() + self.in_flight >= CONN_OUT_BUFFER_MAX
    }

    pub fn discard_output(&mut self) {
        self.out_buffer.clear();
    }

    pub fn arm_read(&self) {
        if let Some(io) = &self.io {
            io.arm_read();
        }
    }

    pub fn disarm_read(&self) {
        if let Some(io) = &self.io {
            io.disarm_read();
        }
    }

    pub fn shutdown_read(&self) {
        if let Some(io) = &self.io {
            io.shutdown_read();
        }
    }

    /// Shut down the write side once queued output has been written.
    pub fn shutdown_write(&mut self) {
        self.flush(FlushMode::Blocking);
        if let Some(io) = &self.io {
            io.shutdown_write();
        }
    }

    /// Shrink the send window after a throttle hint.
    pub fn throttle(&mut self) {
        if self.send_window_kb > CONN_WINDOW_SIZE_KB_MINIMUM {
            self.send_window_kb = (self.send_window_kb * 4 / 5).max(CONN_WINDOW_SIZE_KB_MINIMUM);
        }
    }

    /// Kilobytes delivered so far, when another progress report is due.
    pub fn progress_due(&mut self) -> Option<u64> {
        let wrote_kb = self.wrote_kb();
        if wrote_kb >= self.reported_kb + PROGRESS_REPORT_KB {
            self.reported_kb = wrote_kb;
            Some(wrote_kb)
        } else {
            None
        }
    }

    /// Reading is further ahead of the remote than the send window allows.
    pub const fn window_exhausted(&self) -> bool {
        self.read_kb() > self.sent_kb + self.send_window_kb
    }
}
