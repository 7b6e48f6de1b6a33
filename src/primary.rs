//! The primary HTTP channel.
//!
//! Socket I/O itself is handled by the manager loop through `mio`; this
//! module holds the per-channel state machine and buffer bookkeeping.
//! Parsing and protocol state are collapsed into one type rather than
//! split across a parser/protocol pair, since there is exactly one
//! response shape here (a JPIP reply) rather than a pluggable
//! per-application protocol.

use std::collections::VecDeque;

use httparse;

use crate::error::{Error, Result};
use crate::query::{parse_cnew, CNewHeader};
use crate::version::Version;

/// Declared body framing for an HTTP reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    Fixed(u64),
    Chunked,
    /// Read until the connection closes (legacy HTTP/1.0 response, or no
    /// aux channel and no declared length).
    Eof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimaryState {
    Disconnected,
    Connecting,
    /// A request is sitting in the send buffer, not yet fully written.
    Sending,
    /// Reply headers are being accumulated.
    ReadingHeaders,
    /// Reply body is being read (HTTP-only transport).
    ReadingBody,
    Idle,
}

/// Parsed JPIP reply headers.
#[derive(Debug, Clone, Default)]
pub struct JpipReplyHeaders {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Option<BodyKind>,
    pub persistent: bool,
    pub tid: Option<String>,
    pub cnew: Option<CNewHeader>,
    pub fsiz: Option<String>,
    pub len: Option<u64>,
}

/// One TCP connection carrying JPIP requests/replies for a primary
/// channel. Owns its own send/receive buffers; actual byte transfer is
/// driven by the manager loop feeding bytes in and draining bytes out.
#[derive(Debug)]
pub struct PrimaryChannel {
    pub state: PrimaryState,
    pub host: String,
    pub port: u16,
    send_block: VecDeque<u8>,
    recv_buf: Vec<u8>,
    pub non_persistent: bool,
    pub reconnect_attempted: bool,
    chunk_remaining: usize,
    body_kind: Option<BodyKind>,
    body_consumed: u64,
}

impl PrimaryChannel {
    pub fn new(host: String, port: u16) -> PrimaryChannel {
        PrimaryChannel {
            state: PrimaryState::Disconnected,
            host,
            port,
            send_block: VecDeque::new(),
            recv_buf: Vec::new(),
            non_persistent: false,
            reconnect_attempted: false,
            chunk_remaining: 0,
            body_kind: None,
            body_consumed: 0,
        }
    }

    /// `send_active_request`: queues an already-built request line plus
    /// headers for the manager loop to write out.
    pub fn queue_request(&mut self, path_and_query: &str, host_header: &str, keep_alive: bool) {
        let conn = if keep_alive { "keep-alive" } else { "close" };
        let block = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: {}\r\n\r\n",
            path_and_query, host_header, conn
        );
        self.send_block.extend(block.into_bytes());
        self.state = PrimaryState::Sending;
    }

    /// Same as `queue_request`, but used when the query string is too
    /// large to be a GET: a POST with an
    /// `application/x-www-form-urlencoded` body carrying the query.
    pub fn queue_post_request(&mut self, path: &str, host_header: &str, keep_alive: bool, query: &str) {
        let conn = if keep_alive { "keep-alive" } else { "close" };
        let block = format!(
            "POST {} HTTP/1.1\r\nHost: {}\r\nConnection: {}\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\r\n{}",
            path, host_header, conn, query.len(), query
        );
        self.send_block.extend(block.into_bytes());
        self.state = PrimaryState::Sending;
    }

    pub fn pending_send(&self) -> &VecDeque<u8> {
        &self.send_block
    }

    pub fn send_complete(&mut self, bytes_written: usize) {
        self.send_block.drain(..bytes_written);
        if self.send_block.is_empty() {
            self.state = PrimaryState::ReadingHeaders;
        }
    }

    /// `read_reply`: feeds newly-read bytes in; returns the parsed
    /// headers once a full header block has arrived, else `None` and
    /// waits for more bytes.
    pub fn feed_header_bytes(&mut self, bytes: &[u8], max_header_bytes: usize) -> Result<Option<JpipReplyHeaders>> {
        self.recv_buf.extend_from_slice(bytes);
        if self.recv_buf.len() > max_header_bytes {
            return Err(Error::MalformedResponse("reply header block too large".into()));
        }

        let mut header_storage = [httparse::EMPTY_HEADER; 64];
        let mut response = httparse::Response::new(&mut header_storage);
        let status = match response.parse(&self.recv_buf) {
            Ok(httparse::Status::Complete(n)) => n,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(e) => return Err(Error::MalformedResponse(format!("invalid HTTP reply: {}", e))),
        };

        let mut out = JpipReplyHeaders {
            status: response.code.unwrap_or(0),
            ..JpipReplyHeaders::default()
        };
        let version = Version::parse(response.version.unwrap_or(1));
        let mut connection_close = version == Version::Http10;

        for h in response.headers.iter() {
            let value = std::str::from_utf8(h.value)
                .map_err(|_| Error::MalformedResponse("non-UTF8 header value".into()))?;
            if crate::headers::is_content_type(h.name) {
                out.content_type = Some(value.to_string());
            } else if crate::headers::is_content_length(h.name) {
                let n: u64 = value
                    .trim()
                    .parse()
                    .map_err(|_| Error::MalformedResponse("invalid Content-Length".into()))?;
                out.body = Some(BodyKind::Fixed(n));
            } else if crate::headers::is_transfer_encoding(h.name) {
                if value.eq_ignore_ascii_case("chunked") {
                    out.body = Some(BodyKind::Chunked);
                }
            } else if crate::headers::is_connection(h.name) {
                connection_close = value.eq_ignore_ascii_case("close");
            } else if crate::headers::jpip_field(h.name, "tid") {
                out.tid = Some(value.to_string());
            } else if crate::headers::jpip_field(h.name, "cnew") {
                out.cnew = Some(parse_cnew(value)?);
            } else if crate::headers::jpip_field(h.name, "fsiz") {
                out.fsiz = Some(value.to_string());
            } else if crate::headers::jpip_field(h.name, "len") {
                out.len = value.trim().parse().ok();
            }
        }

        out.persistent = !connection_close;
        self.non_persistent = connection_close;
        self.body_kind = Some(out.body.unwrap_or(BodyKind::Eof));
        self.recv_buf.drain(..status);
        self.state = PrimaryState::ReadingBody;
        Ok(Some(out))
    }

    /// `read_body_chunk`: strips one chunk's worth of payload bytes (or
    /// the whole fixed/EOF body) out of newly-read bytes, handing the
    /// decoded payload to the caller, which forwards it to
    /// `cid::process_return_data`.
    pub fn feed_body_bytes(&mut self, bytes: &[u8]) -> Result<(Vec<u8>, bool)> {
        self.recv_buf.extend_from_slice(bytes);
        match self.body_kind {
            Some(BodyKind::Fixed(total)) => {
                let remaining = total.saturating_sub(self.body_consumed) as usize;
                let take = remaining.min(self.recv_buf.len());
                let payload: Vec<u8> = self.recv_buf.drain(..take).collect();
                self.body_consumed += take as u64;
                let done = self.body_consumed >= total;
                if done {
                    self.finish_body();
                }
                Ok((payload, done))
            }
            Some(BodyKind::Eof) => {
                let payload: Vec<u8> = self.recv_buf.drain(..).collect();
                Ok((payload, false))
            }
            Some(BodyKind::Chunked) => self.feed_chunked(),
            None => Err(Error::InvalidState("read_body_chunk before headers parsed".into())),
        }
    }

    /// Signals EOF on the connection: for `BodyKind::Eof` this completes
    /// the body; for `Fixed`/`Chunked` bodies it's a transport failure.
    pub fn body_eof(&mut self) -> Result<bool> {
        match self.body_kind {
            Some(BodyKind::Eof) => {
                self.finish_body();
                Ok(true)
            }
            _ => Err(Error::MalformedResponse("connection closed mid-body".into())),
        }
    }

    fn feed_chunked(&mut self) -> Result<(Vec<u8>, bool)> {
        let mut payload = Vec::new();
        loop {
            if self.chunk_remaining > 0 {
                let take = self.chunk_remaining.min(self.recv_buf.len());
                payload.extend(self.recv_buf.drain(..take));
                self.chunk_remaining -= take;
                if self.chunk_remaining > 0 {
                    return Ok((payload, false));
                }
                // Trailing CRLF after the chunk data.
                if self.recv_buf.len() < 2 {
                    return Ok((payload, false));
                }
                self.recv_buf.drain(..2);
                continue;
            }
            let Some(line_end) = find_crlf(&self.recv_buf) else { return Ok((payload, false)) };
            let size_line = std::str::from_utf8(&self.recv_buf[..line_end])
                .map_err(|_| Error::MalformedResponse("chunk size is not UTF-8".into()))?;
            let size_str = size_line.split(';').next().unwrap_or("").trim();
            let size = usize::from_str_radix(size_str, 16)
                .map_err(|_| Error::MalformedResponse("invalid chunk size".into()))?;
            self.recv_buf.drain(..line_end + 2);
            if size == 0 {
                self.finish_body();
                return Ok((payload, true));
            }
            self.chunk_remaining = size;
        }
    }

    fn finish_body(&mut self) {
        self.state = PrimaryState::Idle;
        self.body_kind = None;
        self.body_consumed = 0;
        self.chunk_remaining = 0;
        if self.non_persistent {
            self.state = PrimaryState::Disconnected;
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_fixed_length_reply_with_cnew() {
        let mut ch = PrimaryChannel::new("example.org".into(), 80);
        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: image/jpp-stream\r\nContent-Length: 4\r\nJPIP-cnew: cid=C1,transport=http-tcp,host=same,port=80,auxport=81\r\n\r\ndata";
        let headers = ch.feed_header_bytes(raw, 16384).unwrap().unwrap();
        assert_eq!(headers.status, 200);
        assert_eq!(headers.cnew.unwrap().cid.as_deref(), Some("C1"));
        assert!(headers.persistent);
        let (payload, done) = ch.feed_body_bytes(b"").unwrap();
        assert_eq!(payload, b"data");
        assert!(done);
    }

    #[test]
    fn chunked_body_decodes_across_feeds() {
        let mut ch = PrimaryChannel::new("example.org".into(), 80);
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n";
        ch.feed_header_bytes(raw, 16384).unwrap();
        let (p1, done1) = ch.feed_body_bytes(b"4\r\nabcd\r\n").unwrap();
        assert_eq!(p1, b"abcd");
        assert!(!done1);
        let (p2, done2) = ch.feed_body_bytes(b"0\r\n\r\n").unwrap();
        assert!(p2.is_empty());
        assert!(done2);
    }

    #[test]
    fn connection_close_marks_non_persistent() {
        let mut ch = PrimaryChannel::new("example.org".into(), 80);
        let raw = b"HTTP/1.0 200 OK\r\nContent-Length: 0\r\n\r\n";
        let headers = ch.feed_header_bytes(raw, 16384).unwrap().unwrap();
        assert!(!headers.persistent);
        assert!(ch.non_persistent);
    }

    #[test]
    fn oversized_header_block_is_malformed() {
        let mut ch = PrimaryChannel::new("example.org".into(), 80);
        let raw = vec![b'a'; 100];
        assert!(ch.feed_header_bytes(&raw, 10).is_err());
    }
}
