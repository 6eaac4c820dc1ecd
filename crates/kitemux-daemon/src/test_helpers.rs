//! Shared test helpers for the reactor and worker test modules.
//!
//! Provides contexts with pre-resolved frontends, an in-memory frontend
//! connector and chunk framing for the far end of a tunnel.
#![allow(clippy::unwrap_used)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

use kitemux_core::ManagerConfig;
use kitemux_core::proto::{Chunk, ChunkParse, ChunkParser};

use crate::context::Context;
use crate::frontend::FeFlags;
use crate::handshake::{BoxedStream, ConnectError, FrontendConnector, KiteRequest, RequestStatus};

/// Build a validated context from `config`.
pub fn test_context(config: ManagerConfig) -> Arc<Context> {
    Arc::new(Context::new(config.validate().unwrap()).unwrap())
}

/// Add frontend `10.0.0.<last>:443` and return its index.
pub fn add_test_frontend(ctx: &Context, last: u8, flags: FeFlags) -> usize {
    let addr = SocketAddr::from(([10, 0, 0, last], 443));
    ctx.frontends()
        .add_frontend_addr(addr, "fe.example.net", 443, flags)
        .unwrap()
        .unwrap()
}

/// How [`DuplexConnector`] answers connect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Answer {
    Accept,
    Reject,
    Duplicate,
}

/// Connector handing out in-memory tunnels. The far end of every accepted
/// tunnel is delivered on the receiver returned by [`Self::new`].
pub struct DuplexConnector {
    answer: Mutex<Answer>,
    peers: mpsc::UnboundedSender<DuplexStream>,
}

impl DuplexConnector {
    pub fn new(answer: Answer) -> (Arc<Self>, mpsc::UnboundedReceiver<DuplexStream>) {
        let (peers, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            answer: Mutex::new(answer),
            peers,
        });
        (connector, rx)
    }

    pub fn set_answer(&self, answer: Answer) {
        *self.answer.lock().unwrap() = answer;
    }
}

#[async_trait]
impl FrontendConnector for DuplexConnector {
    async fn connect(
        &self,
        _addr: SocketAddr,
        _hostname: &str,
        requests: &mut [KiteRequest],
    ) -> Result<BoxedStream, ConnectError> {
        let answer = *self.answer.lock().unwrap();
        let status = match answer {
            Answer::Accept => RequestStatus::Ok,
            Answer::Reject => RequestStatus::Rejected,
            Answer::Duplicate => RequestStatus::Duplicate,
        };
        for request in requests.iter_mut() {
            request.status = status;
        }
        match answer {
            Answer::Accept => {
                let (local, remote) = tokio::io::duplex(64 * 1024);
                self.peers.send(remote).unwrap();
                Ok(Box::new(local))
            }
            Answer::Reject => Err(ConnectError::Rejected),
            Answer::Duplicate => Err(ConnectError::Duplicate),
        }
    }
}

/// Frame one chunk the way a frontend would.
pub fn frame(headers: &str, data: &[u8]) -> Vec<u8> {
    let mut out = format!("{:x}\r\n{headers}\r\n\r\n", headers.len() + 4 + data.len()).into_bytes();
    out.extend_from_slice(data);
    out
}

/// Read from the far end of a tunnel until `count` chunks have arrived.
pub async fn read_chunks(
    peer: &mut DuplexStream,
    parser: &mut ChunkParser,
    count: usize,
) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut buf = vec![0u8; 16 * 1024];
    while chunks.len() < count {
        let n = timeout(Duration::from_secs(5), peer.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(n > 0, "tunnel closed after {} chunks", chunks.len());
        chunks.extend(parser.parse(&buf[..n]).unwrap());
    }
    chunks
}
