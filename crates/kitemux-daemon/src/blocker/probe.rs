//! Frontend latency probes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::RngExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::debug;

use crate::context::Context;
use crate::frontend::FeFlags;

/// Request sent to a frontend to measure its latency.
pub const FRONTEND_PING: &[u8] = b"GET /ping HTTP/1.1\r\nHost: ping.pagekite\r\n\r\n";
/// Start of the answer a healthy frontend gives.
pub const FRONTEND_PONG: &[u8] = b"HTTP/1.1 503 Unavailable";

const PROBE_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const PROBE_READ_TIMEOUT: Duration = Duration::from_secs(1);
/// Failed probes hold off this long so a success is reported first.
const PROBE_FAILURE_PAUSE: Duration = Duration::from_secs(2);

/// Round-trip a ping to `addr`, returning the elapsed milliseconds.
pub async fn ping(addr: SocketAddr) -> std::io::Result<u32> {
    let started = Instant::now();
    let mut sock = timeout(PROBE_CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))??;
    sock.write_all(FRONTEND_PING).await?;

    let mut pong = vec![0u8; FRONTEND_PONG.len()];
    timeout(PROBE_READ_TIMEOUT, sock.read_exact(&mut pong))
        .await
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))??;
    if pong != FRONTEND_PONG {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "unexpected pong",
        ));
    }
    Ok(u32::try_from(started.elapsed().as_millis()).unwrap_or(u32::MAX))
}

/// Turn a measured round trip into a selection priority.
///
/// Frontends already in use get a 10% discount so choices stay sticky;
/// others get `jitter_percent` (95..=105) applied to spread load.
pub const fn biased_priority(ms: u32, flags: FeFlags, jitter_percent: u32) -> u32 {
    if flags.intersects(FeFlags::WANTED.union(FeFlags::IS_FAST)) {
        ms / 10 * 9
    } else {
        ms.saturating_mul(jitter_percent) / 100
    }
}

fn jitter_percent() -> u32 {
    rand::rng().random_range(95..=105)
}

fn fake_ping_ms() -> u32 {
    rand::rng().random_range(0..500)
}

/// Probe one frontend and store its priority, or count an error.
pub async fn probe_frontend(ctx: Arc<Context>, index: usize, addr: SocketAddr) {
    if let Some(fe) = ctx.frontends().get_mut(index) {
        fe.priority = 0;
    }

    let ms = if ctx.config.fake_ping {
        fake_ping_ms()
    } else {
        match ping(addr).await {
            Ok(ms) => ms,
            Err(e) => {
                if let Some(fe) = ctx.frontends().get_mut(index) {
                    fe.record_error();
                }
                debug!(frontend = %addr, error = %e, "Ping failed");
                sleep(PROBE_FAILURE_PAUSE).await;
                return;
            }
        }
    };

    let jitter = jitter_percent();
    let mut table = ctx.frontends();
    if let Some(fe) = table.get_mut(index) {
        fe.priority = biased_priority(ms, fe.flags, jitter);
        debug!(frontend = %addr, ms, priority = fe.priority, "Ping");
    }
}

/// Probe every configured frontend concurrently and wait for the first
/// probe to finish. The rest complete in the background.
pub async fn check_tunnel_pingtimes(ctx: &Arc<Context>) {
    let targets = ctx.frontends().targets();
    if targets.is_empty() {
        return;
    }

    let (done_tx, mut done_rx) = mpsc::channel(targets.len());
    for (index, addr) in targets {
        let ctx = Arc::clone(ctx);
        let done = done_tx.clone();
        tokio::spawn(async move {
            probe_frontend(ctx, index, addr).await;
            let _ = done.send(index).await;
        });
    }
    drop(done_tx);

    if let Some(first) = done_rx.recv().await {
        debug!(frontend = first, "First probe finished");
    }
}
