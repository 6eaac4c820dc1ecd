//! The tunnel reactor.
//!
//! A single task owns every tunnel and backend connection. It reacts to
//! socket events reported by the per-connection I/O tasks, to its own
//! housekeeping timer, and to [`Intent`]s sent by the blocking workers.
//! Nothing outside this task touches tunnel or backend state.

mod chunks;
mod error;
mod io;
mod tunnels;

pub use chunks::apply_eof;

use chunks::Connected;
pub use error::StreamError;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use kitemux_core::Status;
use kitemux_core::proto::{ChunkParse, ChunkParser};
use kitemux_core::state::Snapshot;

use crate::blocker;
use crate::conn::{Connection, IoEvent};
use crate::context::Context;
use crate::handshake::{FrontendConnector, KiteRequest};
use crate::jobs::JobKind;
use crate::pool::BackendPool;

/// Requests other tasks make of the reactor.
#[derive(Debug)]
pub enum Intent {
    /// Run the housekeeping tick now.
    Tick,
    /// Reconnect wanted tunnels. Replies with the number of failures.
    Reconnect { reply: oneshot::Sender<usize> },
    /// Close idle tunnels nobody wants. Replies with how many were closed.
    DisconnectUnused { reply: oneshot::Sender<usize> },
}

pub type IntentSender = mpsc::UnboundedSender<Intent>;

/// Send an intent carrying a reply channel and wait for the answer.
/// Returns `None` if the reactor has stopped.
pub async fn request<T>(
    intents: &IntentSender,
    make: impl FnOnce(oneshot::Sender<T>) -> Intent,
) -> Option<T> {
    let (reply, rx) = oneshot::channel();
    intents.send(make(reply)).ok()?;
    rx.await.ok()
}

/// One frontend connection with its parser and kite registrations.
struct Tunnel {
    conn: Connection,
    parser: Box<dyn ChunkParse + Send>,
    requests: Vec<KiteRequest>,
    last_ping: Instant,
}

impl Tunnel {
    fn new() -> Self {
        Self {
            conn: Connection::new(),
            parser: Box::new(ChunkParser::new()),
            requests: Vec::new(),
            last_ping: Instant::now(),
        }
    }
}

pub struct Manager {
    ctx: Arc<Context>,
    connector: Arc<dyn FrontendConnector>,
    /// Indexed like the frontend table.
    tunnels: Vec<Tunnel>,
    pool: BackendPool,
    events_tx: mpsc::UnboundedSender<IoEvent>,
    events_rx: mpsc::UnboundedReceiver<IoEvent>,
    connects_tx: mpsc::UnboundedSender<Connected>,
    connects_rx: mpsc::UnboundedReceiver<Connected>,
    intents_rx: mpsc::UnboundedReceiver<Intent>,
    /// Current housekeeping interval; grows between ticks.
    next_tick: Duration,
    tick_deadline: Option<tokio::time::Instant>,
}

impl Manager {
    pub fn new(
        ctx: Arc<Context>,
        connector: Arc<dyn FrontendConnector>,
    ) -> (Self, IntentSender) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (connects_tx, connects_rx) = mpsc::unbounded_channel();
        let (intents_tx, intents_rx) = mpsc::unbounded_channel();
        let manager = Self {
            tunnels: (0..ctx.config.max_tunnels).map(|_| Tunnel::new()).collect(),
            pool: BackendPool::with_capacity(ctx.config.max_conns),
            next_tick: ctx.config.housekeeping_interval_min() + Duration::from_secs(1),
            tick_deadline: None,
            events_tx,
            events_rx,
            connects_tx,
            connects_rx,
            intents_rx,
            connector,
            ctx,
        };
        (manager, intents_tx)
    }

    /// Start the reactor and the blocking workers.
    pub fn spawn(ctx: Arc<Context>, connector: Arc<dyn FrontendConnector>) -> ManagerHandle {
        let (manager, intents) = Self::new(Arc::clone(&ctx), connector);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let reactor = tokio::spawn(manager.run(shutdown_rx));
        let workers = blocker::spawn_workers(&ctx, &intents, ctx.config.workers);
        info!(
            tunnels = ctx.config.max_tunnels,
            conns = ctx.config.max_conns,
            workers = workers.len(),
            "Manager started"
        );
        ManagerHandle {
            ctx,
            intents,
            shutdown,
            reactor,
            workers,
        }
    }

    /// Run until `shutdown` turns true or its sender is dropped.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        self.tick_deadline = Some(tokio::time::Instant::now());
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                Some(intent) = self.intents_rx.recv() => self.handle_intent(intent).await,
                Some(event) = self.events_rx.recv() => self.handle_event(event),
                Some(done) = self.connects_rx.recv() => self.backend_connected(done),
                () = sleep_until_opt(self.tick_deadline) => self.tick(),
            }
        }
        self.close_all();
        debug!("Reactor stopped");
    }

    async fn handle_intent(&mut self, intent: Intent) {
        match intent {
            Intent::Tick => self.tick(),
            Intent::Reconnect { reply } => {
                let failures = self.reconnect_all().await;
                let _ = reply.send(failures);
            }
            Intent::DisconnectUnused { reply } => {
                let _ = reply.send(self.disconnect_unused());
            }
        }
    }

    fn close_all(&mut self) {
        for index in 0..self.pool.capacity() {
            if self.pool.get(index).is_some_and(|b| b.is_allocated()) {
                self.free_backend(index);
            }
        }
        for index in 0..self.tunnels.len() {
            self.reset_tunnel(index);
        }
    }

    fn set_frontend_live(&self, index: usize, live: bool) {
        if let Some(fe) = self.ctx.frontends().get_mut(index) {
            fe.live = live;
        }
    }
}

async fn sleep_until_opt(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Control surface for a running manager.
pub struct ManagerHandle {
    ctx: Arc<Context>,
    intents: IntentSender,
    shutdown: watch::Sender<bool>,
    reactor: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

impl ManagerHandle {
    pub const fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    pub const fn intents(&self) -> &IntentSender {
        &self.intents
    }

    /// Ask for a housekeeping tick.
    pub fn tick(&self) {
        let _ = self.intents.send(Intent::Tick);
    }

    /// Reconnect wanted tunnels now. `None` if the reactor has stopped.
    pub async fn reconnect(&self) -> Option<usize> {
        request(&self.intents, |reply| Intent::Reconnect { reply }).await
    }

    pub async fn disconnect_unused(&self) -> Option<usize> {
        request(&self.intents, |reply| Intent::DisconnectUnused { reply }).await
    }

    /// Run a full frontend check on the calling task. Useful when no
    /// workers were started.
    pub async fn check_tunnels(&self) {
        blocker::check_tunnels(&self.ctx, &self.intents).await;
    }

    pub fn status(&self) -> Status {
        self.ctx.state.status()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.ctx.state.snapshot()
    }

    /// Wait until the status differs from the current one, or `timeout`
    /// passes. Returns the latest snapshot either way.
    pub async fn wait_status_change(&self, timeout: Duration) -> Snapshot {
        let ctx = Arc::clone(&self.ctx);
        let initial = ctx.state.status();
        let waited = tokio::task::spawn_blocking(move || {
            let deadline = Instant::now() + timeout;
            let mut snap = ctx.state.snapshot();
            while snap.status == initial {
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    break;
                }
                snap = ctx.state.wait_for_change(snap.version, left);
            }
            snap
        })
        .await;
        waited.unwrap_or_else(|_| self.ctx.state.snapshot())
    }

    /// Stop the reactor and the workers and wait for them.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if !self.workers.is_empty()
            && let Err(e) = self.ctx.jobs.submit(JobKind::Quit)
        {
            warn!(error = %e, "Failed to queue quit for workers");
        }
        if let Err(e) = self.reactor.await {
            warn!(error = %e, "Reactor task failed");
        }
        for worker in self.workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "Worker task failed");
            }
        }
        info!("Manager stopped");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::significant_drop_tightening)]
#[path = "manager_tests.rs"]
mod tests;
