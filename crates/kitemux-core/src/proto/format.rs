//! Chunk formatters for everything the connector side sends upstream.

use super::chunk::EofFlags;

fn frame(headers: &str, data: &[u8]) -> Vec<u8> {
    let mut out = format!("{:x}\r\n{headers}\r\n\r\n", headers.len() + 4 + data.len()).into_bytes();
    out.extend_from_slice(data);
    out
}

/// Header for a data chunk carrying `length` payload bytes. The payload is
/// appended by the caller.
pub fn format_reply_header(sid: &str, length: usize) -> Vec<u8> {
    let headers = format!("SID: {sid}");
    format!("{:x}\r\n{headers}\r\n\r\n", headers.len() + 4 + length).into_bytes()
}

/// Complete data chunk.
pub fn format_reply(sid: &str, data: &[u8]) -> Vec<u8> {
    frame(&format!("SID: {sid}"), data)
}

/// Bytes of framing [`format_reply_header`] adds in front of the payload.
pub fn reply_overhead(sid: &str, length: usize) -> usize {
    format_reply_header(sid, length).len()
}

pub fn format_eof(sid: &str, eof: EofFlags) -> Vec<u8> {
    frame(&format!("SID: {sid}\r\nEOF: {}", eof.token()), b"")
}

pub fn format_ping() -> Vec<u8> {
    frame("NOOP: 1\r\nPING: 1", b"")
}

pub fn format_pong() -> Vec<u8> {
    frame("NOOP: 1\r\nPONG: 1", b"")
}

/// Tell the peer how many kilobytes of stream `sid` we have delivered.
pub fn format_progress(sid: &str, wrote_kb: u64) -> Vec<u8> {
    frame(&format!("NOOP: 1\r\nSID: {sid}\r\nSKB: {wrote_kb}"), b"")
}
