//! Chunk records and the incremental parser.

use bitflags::bitflags;
use thiserror::Error;

/// Largest chunk (headers plus payload) the parser accepts.
pub const MAX_CHUNK_SIZE: usize = 64 * 1024;

/// Longest acceptable length line, in hex digits.
const MAX_LENGTH_DIGITS: usize = 8;

/// Errors raised when tunnel bytes do not form valid chunks.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid chunk length: {0:?}")]
    BadLength(String),

    #[error("Chunk of {size} bytes exceeds limit of {max}")]
    TooLarge { size: usize, max: usize },

    #[error("Chunk header block is not terminated")]
    MissingHeaderEnd,

    #[error("Malformed chunk header: {0:?}")]
    BadHeader(String),
}

bitflags! {
    /// Directions named by an EOF directive.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EofFlags: u8 {
        /// `R`: the sender's local socket hit end of input, so no more data
        /// follows on the stream. The receiver ends its own write side.
        const READ  = 0b01;
        /// `W`: the sender can no longer deliver data to its local socket.
        /// The receiver stops reading from its own.
        const WRITE = 0b10;
    }
}

impl EofFlags {
    /// Interpret an EOF token. Any `R` or `W` (either case) names a
    /// direction; a token naming neither means both.
    pub fn from_token(token: &str) -> Self {
        let mut flags = Self::empty();
        for c in token.chars() {
            match c {
                'R' | 'r' => flags |= Self::READ,
                'W' | 'w' => flags |= Self::WRITE,
                _ => {}
            }
        }
        if flags.is_empty() { Self::all() } else { flags }
    }

    /// Token form used on the wire.
    pub fn token(self) -> &'static str {
        match (self.contains(Self::READ), self.contains(Self::WRITE)) {
            (true, true) => "RW",
            (true, false) => "R",
            (false, true) => "W",
            (false, false) => "",
        }
    }
}

/// One decoded chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Chunk {
    pub sid: Option<String>,
    pub request_proto: Option<String>,
    pub request_host: Option<String>,
    pub request_port: u16,
    pub remote_ip: Option<String>,
    pub remote_port: u16,
    /// Raw EOF token, if the chunk carries one.
    pub eof: Option<String>,
    pub noop: bool,
    pub ping: bool,
    pub pong: bool,
    /// Remote send-rate hint; non-zero asks us to throttle.
    pub throttle_spd: u64,
    /// Kilobytes the remote side has received for this stream.
    pub remote_sent_kb: u64,
    pub data: Vec<u8>,
}

impl Chunk {
    fn apply_header(&mut self, name: &str, value: &str) {
        let value = value.trim();
        match name.to_ascii_lowercase().as_str() {
            "sid" => self.sid = Some(value.to_string()),
            "proto" => self.request_proto = Some(value.to_string()),
            "host" => self.request_host = Some(value.to_string()),
            "port" => self.request_port = value.parse().unwrap_or(0),
            "rip" => self.remote_ip = Some(value.to_string()),
            "rport" => self.remote_port = value.parse().unwrap_or(0),
            "eof" => self.eof = Some(value.to_string()),
            "noop" => self.noop = true,
            "ping" => self.ping = true,
            "pong" => self.pong = true,
            "spd" => self.throttle_spd = value.parse().unwrap_or(0),
            "skb" => self.remote_sent_kb = value.parse().unwrap_or(0),
            _ => {}
        }
    }
}

/// A tunnel-side chunk decoder fed with raw bytes as they arrive.
pub trait ChunkParse {
    /// Consume `data`, returning every chunk it completes. Partial input is
    /// kept for the next call.
    fn parse(&mut self, data: &[u8]) -> Result<Vec<Chunk>, ProtocolError>;

    /// Drop any partial input, e.g. after a reconnect.
    fn reset(&mut self);
}

/// Default parser for the `<hex length>\r\n<headers>\r\n\r\n<payload>`
/// grammar.
#[derive(Debug)]
pub struct ChunkParser {
    buffer: Vec<u8>,
    max_chunk: usize,
}

impl Default for ChunkParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkParser {
    pub fn new() -> Self {
        Self::with_limit(MAX_CHUNK_SIZE)
    }

    pub fn with_limit(max_chunk: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_chunk,
        }
    }

    /// Bytes held waiting for the rest of a chunk.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    fn next_chunk(&mut self) -> Result<Option<Chunk>, ProtocolError> {
        let Some(line_end) = find(&self.buffer, b"\r\n") else {
            if self.buffer.len() > MAX_LENGTH_DIGITS {
                return Err(ProtocolError::BadLength(
                    String::from_utf8_lossy(&self.buffer[..=MAX_LENGTH_DIGITS]).into_owned(),
                ));
            }
            return Ok(None);
        };

        let line = String::from_utf8_lossy(&self.buffer[..line_end]).into_owned();
        if line.is_empty() || line.len() > MAX_LENGTH_DIGITS {
            return Err(ProtocolError::BadLength(line));
        }
        let size =
            usize::from_str_radix(line.trim(), 16).map_err(|_| ProtocolError::BadLength(line))?;
        if size > self.max_chunk {
            return Err(ProtocolError::TooLarge {
                size,
                max: self.max_chunk,
            });
        }

        let start = line_end + 2;
        if size == 0 {
            // Keepalive filler: nothing follows the length line.
            self.buffer.drain(..start);
            return Ok(Some(Chunk {
                noop: true,
                ..Chunk::default()
            }));
        }
        let total = start + size;
        if self.buffer.len() < total {
            return Ok(None);
        }

        let body: Vec<u8> = self.buffer.drain(..total).skip(start).collect();
        let header_end = find(&body, b"\r\n\r\n").ok_or(ProtocolError::MissingHeaderEnd)?;
        let headers = std::str::from_utf8(&body[..header_end])
            .map_err(|_| ProtocolError::BadHeader("non-UTF-8 header block".into()))?;

        let mut chunk = Chunk::default();
        for line in headers.split("\r\n").filter(|l| !l.is_empty()) {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| ProtocolError::BadHeader(line.to_string()))?;
            chunk.apply_header(name.trim(), value);
        }
        chunk.data = body[header_end + 4..].to_vec();
        Ok(Some(chunk))
    }
}

impl ChunkParse for ChunkParser {
    fn parse(&mut self, data: &[u8]) -> Result<Vec<Chunk>, ProtocolError> {
        self.buffer.extend_from_slice(data);
        let mut chunks = Vec::new();
        while let Some(chunk) = self.next_chunk()? {
            chunks.push(chunk);
        }
        Ok(chunks)
    }

    fn reset(&mut self) {
        self.buffer.clear();
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn frame(headers: &str, data: &[u8]) -> Vec<u8> {
        let body_len = headers.len() + 4 + data.len();
        let mut out = format!("{body_len:x}\r\n{headers}\r\n\r\n").into_bytes();
        out.extend_from_slice(data);
        out
    }

    #[test]
    fn parses_new_stream_request() {
        let mut parser = ChunkParser::new();
        let bytes = frame(
            "SID: 1a\r\nProto: http\r\nHost: x.example.com\r\nPort: 80\r\nRIP: 10.0.0.1",
            b"GET / HTTP/1.0\r\n\r\n",
        );
        let chunks = parser.parse(&bytes).unwrap();
        assert_eq!(chunks.len(), 1);
        let chunk = &chunks[0];
        assert_eq!(chunk.sid.as_deref(), Some("1a"));
        assert_eq!(chunk.request_proto.as_deref(), Some("http"));
        assert_eq!(chunk.request_host.as_deref(), Some("x.example.com"));
        assert_eq!(chunk.request_port, 80);
        assert_eq!(chunk.remote_ip.as_deref(), Some("10.0.0.1"));
        assert_eq!(chunk.data, b"GET / HTTP/1.0\r\n\r\n");
        assert_eq!(parser.pending(), 0);
    }

    #[test]
    fn empty_chunk_is_a_noop() {
        let mut parser = ChunkParser::new();
        let mut bytes = b"0\r\n".to_vec();
        bytes.extend(frame("SID: 3", b"x"));
        let chunks = parser.parse(&bytes).unwrap();
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].noop);
        assert!(chunks[0].sid.is_none() && chunks[0].data.is_empty());
        assert_eq!(chunks[1].sid.as_deref(), Some("3"));
        assert_eq!(parser.pending(), 0);
    }

    #[test]
    fn split_input_is_reassembled() {
        let mut parser = ChunkParser::new();
        let mut bytes = frame("NOOP: 1\r\nPING: 1", b"");
        bytes.extend(frame("SID: 2\r\nEOF: W", b""));

        let (head, tail) = bytes.split_at(5);
        assert!(parser.parse(head).unwrap().is_empty());
        let chunks = parser.parse(tail).unwrap();
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].noop && chunks[0].ping);
        assert_eq!(chunks[1].eof.as_deref(), Some("W"));
    }

    #[test]
    fn throttle_and_progress_fields() {
        let mut parser = ChunkParser::new();
        let chunks = parser
            .parse(&frame("NOOP: 1\r\nSID: 9\r\nSPD: 12\r\nSKB: 48", b""))
            .unwrap();
        assert_eq!(chunks[0].throttle_spd, 12);
        assert_eq!(chunks[0].remote_sent_kb, 48);
    }

    #[test]
    fn rejects_garbage_length() {
        let mut parser = ChunkParser::new();
        assert!(matches!(
            parser.parse(b"zz\r\n"),
            Err(ProtocolError::BadLength(_))
        ));

        let mut parser = ChunkParser::new();
        assert!(matches!(
            parser.parse(b"0123456789abcdef"),
            Err(ProtocolError::BadLength(_))
        ));
    }

    #[test]
    fn rejects_oversized_chunk() {
        let mut parser = ChunkParser::with_limit(16);
        assert_eq!(
            parser.parse(b"ff\r\n"),
            Err(ProtocolError::TooLarge { size: 255, max: 16 })
        );
    }

    #[test]
    fn rejects_unterminated_headers() {
        let mut parser = ChunkParser::new();
        assert_eq!(
            parser.parse(b"5\r\nSID: "),
            Err(ProtocolError::MissingHeaderEnd)
        );
    }

    #[test]
    fn reset_drops_partial_input() {
        let mut parser = ChunkParser::new();
        parser.parse(b"40\r\nSID").unwrap();
        assert!(parser.pending() > 0);
        parser.reset();
        assert_eq!(parser.pending(), 0);
    }

    #[test]
    fn eof_tokens() {
        assert_eq!(EofFlags::from_token(""), EofFlags::READ | EofFlags::WRITE);
        assert_eq!(EofFlags::from_token("R"), EofFlags::READ);
        assert_eq!(EofFlags::from_token("W"), EofFlags::WRITE);
        assert_eq!(EofFlags::from_token("rw"), EofFlags::all());
        assert_eq!(EofFlags::from_token("1"), EofFlags::all());
        assert_eq!(EofFlags::all().token(), "RW");
    }
}
