//! Tunnel chunk protocol.
//!
//! A chunk is `<hex length>\r\n<headers>\r\n\r\n<payload>`, where the length
//! covers the header block and the payload. Headers are `Name: value` lines.

mod chunk;
mod format;
mod reject;

pub use chunk::{Chunk, ChunkParse, ChunkParser, EofFlags, MAX_CHUNK_SIZE, ProtocolError};
pub use format::{
    format_eof, format_ping, format_pong, format_progress, format_reply, format_reply_header,
    reply_overhead,
};
pub use reject::{TLS_REJECTION, html_rejection, rejection_payload};
