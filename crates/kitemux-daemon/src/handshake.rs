//! Frontend tunnel handshake.
//!
//! A tunnel opens with an HTTP-style `CONNECT PageKite:1` request naming
//! every kite we want served. The frontend may answer with a challenge per
//! kite (`X-PageKite-SignThis`), in which case we reconnect and present
//! signed requests. Once every kite has an answer the socket switches to the
//! chunk protocol.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use kitemux_core::Kite;
use kitemux_core::sign::sign;

/// Default bound on connecting and reading the handshake response.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Length of request signatures, salt included.
const SIGNATURE_LEN: usize = 36;

/// Refuse handshake responses larger than this.
const MAX_RESPONSE_BYTES: usize = 16 * 1024;

/// Any bidirectional byte stream a tunnel can run over.
pub trait TunnelStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> TunnelStream for T {}

pub type BoxedStream = Box<dyn TunnelStream>;

/// Registration state of one kite on one tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Unknown,
    Ok,
    Rejected,
    Duplicate,
}

#[derive(Debug, Clone)]
pub struct KiteRequest {
    pub kite: Kite,
    pub status: RequestStatus,
    /// Challenge from the frontend, signed on the next attempt.
    pub challenge: Option<String>,
}

impl KiteRequest {
    pub const fn new(kite: Kite) -> Self {
        Self {
            kite,
            status: RequestStatus::Unknown,
            challenge: None,
        }
    }

    /// Protocol as named on the wire: `http`, or `http-8080` with a port.
    pub fn wire_protocol(&self) -> String {
        if self.kite.public_port == 0 {
            self.kite.protocol.clone()
        } else {
            format!("{}-{}", self.kite.protocol, self.kite.public_port)
        }
    }

    fn matches(&self, proto: &str, domain: &str) -> bool {
        self.wire_protocol().eq_ignore_ascii_case(proto)
            && self.kite.public_domain.eq_ignore_ascii_case(domain)
    }

    fn header(&self) -> String {
        let proto = self.wire_protocol();
        let domain = &self.kite.public_domain;
        match &self.challenge {
            Some(token) => {
                let salt = format!("{:08x}", rand::random::<u32>());
                let payload = format!("{proto}:{domain}:{token}");
                let signature = sign(&self.kite.secret, &payload, &salt, SIGNATURE_LEN);
                format!("X-PageKite: {proto}:{domain}:{token}:{signature}\r\n")
            }
            None => format!("X-PageKite: {proto}:{domain}::\r\n"),
        }
    }
}

/// How a tunnel connect attempt failed.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out")]
    Timeout,

    #[error("Frontend rejected our kites")]
    Rejected,

    #[error("Kite already registered on this frontend")]
    Duplicate,

    #[error("Handshake failed: {0}")]
    Handshake(String),
}

/// Opens tunnels to frontends.
#[async_trait]
pub trait FrontendConnector: Send + Sync {
    /// Connect to `addr` and register `requests`, updating each request's
    /// status. The returned stream carries chunks.
    async fn connect(
        &self,
        addr: SocketAddr,
        hostname: &str,
        requests: &mut [KiteRequest],
    ) -> Result<BoxedStream, ConnectError>;
}

enum Attempt {
    Ready(BufReader<TcpStream>),
    SignThis,
}

/// Plain-TCP connector speaking the PageKite handshake.
#[derive(Debug, Clone)]
pub struct PageKiteConnector {
    timeout: Duration,
    app_id: String,
}

impl PageKiteConnector {
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            timeout: DEFAULT_CONNECT_TIMEOUT,
            app_id: app_id.into(),
        }
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn request(&self, hostname: &str, requests: &[KiteRequest]) -> String {
        let mut request = format!(
            "CONNECT PageKite:1 HTTP/1.0\r\n\
             Host: {hostname}\r\n\
             X-PageKite-Version: {}/{}\r\n\
             X-PageKite-Features: AddKites\r\n",
            self.app_id,
            env!("CARGO_PKG_VERSION"),
        );
        for req in requests {
            request.push_str(&req.header());
        }
        request.push_str("\r\n");
        request
    }

    async fn attempt(
        &self,
        addr: SocketAddr,
        hostname: &str,
        requests: &mut [KiteRequest],
    ) -> Result<Attempt, ConnectError> {
        let stream = timeout(self.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ConnectError::Timeout)??;
        let mut stream = BufReader::new(stream);
        stream
            .get_mut()
            .write_all(self.request(hostname, requests).as_bytes())
            .await?;

        let lines = timeout(self.timeout, read_response(&mut stream))
            .await
            .map_err(|_| ConnectError::Timeout)??;
        let challenged = apply_response(&lines, requests)?;
        if challenged {
            debug!(frontend = %addr, "Frontend wants signed requests");
            return Ok(Attempt::SignThis);
        }
        Ok(Attempt::Ready(stream))
    }
}

#[async_trait]
impl FrontendConnector for PageKiteConnector {
    async fn connect(
        &self,
        addr: SocketAddr,
        hostname: &str,
        requests: &mut [KiteRequest],
    ) -> Result<BoxedStream, ConnectError> {
        for req in requests.iter_mut() {
            req.status = RequestStatus::Unknown;
            req.challenge = None;
        }
        let stream = match self.attempt(addr, hostname, requests).await? {
            Attempt::Ready(stream) => stream,
            Attempt::SignThis => match self.attempt(addr, hostname, requests).await? {
                Attempt::Ready(stream) => stream,
                Attempt::SignThis => {
                    return Err(ConnectError::Handshake(
                        "signed requests challenged again".into(),
                    ));
                }
            },
        };
        info!(frontend = %addr, hostname, kites = requests.len(), "Tunnel connected");
        Ok(Box::new(stream))
    }
}

/// Read the status line and headers, up to the blank line.
async fn read_response<R>(stream: &mut R) -> Result<Vec<String>, ConnectError>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = Vec::new();
    let mut total = 0;
    loop {
        let mut line = String::new();
        let n = stream.read_line(&mut line).await?;
        if n == 0 {
            return Err(ConnectError::Handshake("connection closed mid-handshake".into()));
        }
        total += n;
        if total > MAX_RESPONSE_BYTES {
            return Err(ConnectError::Handshake("response headers too large".into()));
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return Ok(lines);
        }
        lines.push(line.to_string());
    }
}

/// Apply frontend answers to `requests`. Returns whether any kite was
/// challenged.
fn apply_response(lines: &[String], requests: &mut [KiteRequest]) -> Result<bool, ConnectError> {
    let Some(status_line) = lines.first() else {
        return Err(ConnectError::Handshake("empty response".into()));
    };
    let mut status = status_line.split_whitespace();
    let code = status.nth(1).unwrap_or_default();
    if !status_line.starts_with("HTTP/") || code != "200" {
        return Err(ConnectError::Handshake(format!(
            "unexpected response: {status_line}"
        )));
    }

    let mut challenged = false;
    for line in &lines[1..] {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let mut parts = value.trim().split(':');
        let (Some(proto), Some(domain)) = (parts.next(), parts.next()) else {
            continue;
        };
        let Some(req) = requests.iter_mut().find(|r| r.matches(proto, domain)) else {
            continue;
        };
        match name.trim().to_ascii_lowercase().as_str() {
            "x-pagekite-ok" => req.status = RequestStatus::Ok,
            "x-pagekite-duplicate" => req.status = RequestStatus::Duplicate,
            "x-pagekite-rejected" | "x-pagekite-invalid" => req.status = RequestStatus::Rejected,
            "x-pagekite-signthis" => {
                req.challenge = parts.last().map(str::to_string);
                challenged = true;
            }
            _ => {}
        }
    }

    if requests.iter().any(|r| r.status == RequestStatus::Duplicate) {
        return Err(ConnectError::Duplicate);
    }
    if requests.iter().any(|r| r.status == RequestStatus::Rejected) {
        warn!(
            rejected = requests
                .iter()
                .filter(|r| r.status == RequestStatus::Rejected)
                .count(),
            "Frontend rejected kites"
        );
        return Err(ConnectError::Rejected);
    }
    if challenged {
        return Ok(true);
    }
    if let Some(req) = requests.iter().find(|r| r.status == RequestStatus::Unknown) {
        return Err(ConnectError::Handshake(format!(
            "no answer for {}:{}",
            req.wire_protocol(),
            req.kite.public_domain
        )));
    }
    Ok(false)
}
