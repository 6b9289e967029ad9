//! HTTP/1.1 message framing over async streams.
//!
//! Messages are buffered for analysis and forwarded verbatim: `raw` holds
//! the exact bytes read off the wire, `body` the de-chunked payload. Bodies
//! beyond the buffering cap mark the message `truncated`; the connection
//! then downgrades to opaque forwarding after the buffered bytes are
//! relayed.

use std::collections::BTreeMap;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Maximum size of a head (request/status line + headers).
const MAX_HEAD: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum Http1Error {
    #[error("connection closed")]
    Closed,
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("head exceeds {MAX_HEAD} bytes")]
    HeadTooLarge,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which side of the exchange a message is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Response,
}

/// One parsed HTTP/1.1 message.
#[derive(Debug, Clone, Default)]
pub struct Http1Message {
    /// Exact wire bytes (head + body as received), for forwarding.
    pub raw: Vec<u8>,
    /// Header fields in order of appearance.
    pub headers: Vec<(String, String)>,
    /// De-chunked body, up to the buffering cap.
    pub body: Vec<u8>,
    /// Body exceeded the cap; `raw`/`body` are partial.
    pub truncated: bool,
    /// Request line fields.
    pub method: String,
    pub path: String,
    /// Status line fields.
    pub status: u16,
    pub reason: String,
    /// HTTP/1.`minor`.
    pub version_minor: u8,
}

impl Http1Message {
    /// First value of a header, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Headers as a map; duplicate fields are comma-joined.
    pub fn header_map(&self) -> BTreeMap<String, String> {
        let mut map: BTreeMap<String, String> = BTreeMap::new();
        for (name, value) in &self.headers {
            map.entry(name.to_ascii_lowercase())
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(value);
                })
                .or_insert_with(|| value.clone());
        }
        map
    }

    pub fn keep_alive(&self) -> bool {
        match self.header("connection") {
            Some(v) if v.eq_ignore_ascii_case("close") => false,
            Some(v) if v.eq_ignore_ascii_case("keep-alive") => true,
            _ => self.version_minor >= 1,
        }
    }
}

enum BodyFraming {
    None,
    Length(u64),
    Chunked,
    /// Response without framing: body runs to EOF.
    ToEof,
}

/// Buffered reader that leaves unconsumed bytes available for the next
/// message (keep-alive) or for opaque piping after a downgrade.
pub struct MessageReader<R> {
    inner: R,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
        }
    }

    /// Start with bytes that were already read (e.g. a peeked ClientHello
    /// is not a case here, but pipelined request bytes are).
    pub fn with_buffer(inner: R, buf: Vec<u8>) -> Self {
        Self { inner, buf }
    }

    /// The stream plus any bytes read past the last message.
    pub fn into_parts(self) -> (R, Vec<u8>) {
        (self.inner, self.buf)
    }

    /// Direct access to the stream, for writing the other direction of the
    /// exchange between reads.
    pub fn inner_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    async fn fill(&mut self) -> Result<usize, Http1Error> {
        let mut chunk = [0u8; 8192];
        let n = self.inner.read(&mut chunk).await?;
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    fn take(&mut self, n: usize) -> Vec<u8> {
        let taken: Vec<u8> = self.buf.drain(..n.min(self.buf.len())).collect();
        taken
    }

    /// Read one message. `cap` bounds body buffering.
    pub async fn read_message(
        &mut self,
        kind: MessageKind,
        cap: usize,
    ) -> Result<Http1Message, Http1Error> {
        // 1. Accumulate the head.
        let head_end = loop {
            if let Some(pos) = find(&self.buf, b"\r\n\r\n") {
                break pos + 4;
            }
            if self.buf.len() > MAX_HEAD {
                return Err(Http1Error::HeadTooLarge);
            }
            if self.fill().await? == 0 {
                if self.buf.is_empty() {
                    return Err(Http1Error::Closed);
                }
                return Err(Http1Error::Malformed("eof inside head".to_string()));
            }
        };

        let head = self.take(head_end);
        let mut msg = parse_head(&head, kind)?;
        msg.raw = head;

        // 2. Determine body framing.
        let framing = framing_for(&msg, kind)?;

        // 3. Read the body.
        match framing {
            BodyFraming::None => {}
            BodyFraming::Length(len) => {
                let mut remaining = len as usize;
                while remaining > 0 {
                    let budget = cap.saturating_sub(msg.body.len());
                    if budget == 0 {
                        // Remaining bytes stay unread for opaque piping.
                        msg.truncated = true;
                        return Ok(msg);
                    }
                    if self.buf.is_empty() && self.fill().await? == 0 {
                        return Err(Http1Error::Malformed("eof inside body".to_string()));
                    }
                    let chunk = self.take(remaining.min(self.buf.len()).min(budget));
                    remaining -= chunk.len();
                    msg.raw.extend_from_slice(&chunk);
                    msg.body.extend_from_slice(&chunk);
                }
            }
            BodyFraming::Chunked => {
                self.read_chunked(&mut msg, cap).await?;
            }
            BodyFraming::ToEof => loop {
                let budget = cap.saturating_sub(msg.body.len());
                if budget == 0 {
                    msg.truncated = true;
                    return Ok(msg);
                }
                if self.buf.is_empty() && self.fill().await? == 0 {
                    break;
                }
                let chunk = self.take(self.buf.len().min(budget));
                msg.raw.extend_from_slice(&chunk);
                msg.body.extend_from_slice(&chunk);
            },
        }
        Ok(msg)
    }

    async fn read_line(&mut self) -> Result<Vec<u8>, Http1Error> {
        loop {
            if let Some(pos) = find(&self.buf, b"\r\n") {
                let mut line = self.take(pos + 2);
                line.truncate(pos);
                return Ok(line);
            }
            if self.fill().await? == 0 {
                return Err(Http1Error::Malformed("eof inside chunk framing".to_string()));
            }
        }
    }

    async fn read_chunked(&mut self, msg: &mut Http1Message, cap: usize) -> Result<(), Http1Error> {
        loop {
            let line = self.read_line().await?;
            msg.raw.extend_from_slice(&line);
            msg.raw.extend_from_slice(b"\r\n");
            let size_str = String::from_utf8_lossy(&line);
            let size_str = size_str.split(';').next().unwrap_or("").trim();
            let size = usize::from_str_radix(size_str, 16)
                .map_err(|_| Http1Error::Malformed(format!("bad chunk size {size_str:?}")))?;

            if size == 0 {
                // Trailers until the blank line.
                loop {
                    let trailer = self.read_line().await?;
                    msg.raw.extend_from_slice(&trailer);
                    msg.raw.extend_from_slice(b"\r\n");
                    if trailer.is_empty() {
                        return Ok(());
                    }
                }
            }

            let mut remaining = size;
            while remaining > 0 {
                let budget = cap.saturating_sub(msg.body.len());
                if budget == 0 {
                    // Mid-chunk cutoff; the rest of the stream is piped
                    // verbatim after the downgrade.
                    msg.truncated = true;
                    return Ok(());
                }
                if self.buf.is_empty() && self.fill().await? == 0 {
                    return Err(Http1Error::Malformed("eof inside chunk".to_string()));
                }
                let chunk = self.take(remaining.min(self.buf.len()).min(budget));
                remaining -= chunk.len();
                msg.raw.extend_from_slice(&chunk);
                msg.body.extend_from_slice(&chunk);
            }
            // Chunk terminator.
            let terminator = self.read_line().await?;
            if !terminator.is_empty() {
                return Err(Http1Error::Malformed("missing chunk terminator".to_string()));
            }
            msg.raw.extend_from_slice(b"\r\n");
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn parse_head(head: &[u8], kind: MessageKind) -> Result<Http1Message, Http1Error> {
    let mut msg = Http1Message::default();
    let mut header_buf = [httparse::EMPTY_HEADER; 64];
    match kind {
        MessageKind::Request => {
            let mut req = httparse::Request::new(&mut header_buf);
            match req.parse(head) {
                Ok(httparse::Status::Complete(_)) => {
                    msg.method = req.method.unwrap_or("").to_string();
                    msg.path = req.path.unwrap_or("/").to_string();
                    msg.version_minor = req.version.unwrap_or(1);
                    msg.headers = req
                        .headers
                        .iter()
                        .map(|h| {
                            (
                                h.name.to_string(),
                                String::from_utf8_lossy(h.value).into_owned(),
                            )
                        })
                        .collect();
                }
                Ok(httparse::Status::Partial) => {
                    return Err(Http1Error::Malformed("partial head".to_string()))
                }
                Err(e) => return Err(Http1Error::Malformed(e.to_string())),
            }
        }
        MessageKind::Response => {
            let mut resp = httparse::Response::new(&mut header_buf);
            match resp.parse(head) {
                Ok(httparse::Status::Complete(_)) => {
                    msg.status = resp.code.unwrap_or(0);
                    msg.reason = resp.reason.unwrap_or("").to_string();
                    msg.version_minor = resp.version.unwrap_or(1);
                    msg.headers = resp
                        .headers
                        .iter()
                        .map(|h| {
                            (
                                h.name.to_string(),
                                String::from_utf8_lossy(h.value).into_owned(),
                            )
                        })
                        .collect();
                }
                Ok(httparse::Status::Partial) => {
                    return Err(Http1Error::Malformed("partial head".to_string()))
                }
                Err(e) => return Err(Http1Error::Malformed(e.to_string())),
            }
        }
    }
    Ok(msg)
}

fn framing_for(msg: &Http1Message, kind: MessageKind) -> Result<BodyFraming, Http1Error> {
    if let Some(te) = msg.header("transfer-encoding") {
        if te.to_ascii_lowercase().contains("chunked") {
            return Ok(BodyFraming::Chunked);
        }
    }
    if let Some(cl) = msg.header("content-length") {
        let len: u64 = cl
            .trim()
            .parse()
            .map_err(|_| Http1Error::Malformed(format!("bad content-length {cl:?}")))?;
        return Ok(if len == 0 {
            BodyFraming::None
        } else {
            BodyFraming::Length(len)
        });
    }
    match kind {
        MessageKind::Request => Ok(BodyFraming::None),
        MessageKind::Response => {
            if msg.status < 200 || msg.status == 204 || msg.status == 304 {
                Ok(BodyFraming::None)
            } else {
                Ok(BodyFraming::ToEof)
            }
        }
    }
}

/// The locally synthesized block page.
pub fn build_403(reason: &str) -> Vec<u8> {
    let body = format!(
        "<html><head><title>403 Forbidden</title></head>\
         <body><h1>Access Blocked</h1><p>{reason}</p></body></html>"
    );
    format!(
        "HTTP/1.1 403 Forbidden\r\n\
         Content-Type: text/html\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n{body}",
        body.len()
    )
    .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn read_one(bytes: &[u8], kind: MessageKind) -> Result<Http1Message, Http1Error> {
        let mut reader = MessageReader::new(bytes);
        reader.read_message(kind, 1024 * 1024).await
    }

    #[tokio::test]
    async fn test_get_without_body() {
        let raw = b"GET /index.html HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n\r\n";
        let msg = read_one(raw, MessageKind::Request).await.unwrap();
        assert_eq!(msg.method, "GET");
        assert_eq!(msg.path, "/index.html");
        assert_eq!(msg.header("host"), Some("example.com"));
        assert!(msg.body.is_empty());
        assert_eq!(msg.raw, raw);
        assert!(msg.keep_alive());
    }

    #[tokio::test]
    async fn test_post_with_content_length() {
        let raw = b"POST /login HTTP/1.1\r\nHost: a.com\r\nContent-Length: 13\r\n\r\nuser=a&pass=b";
        let msg = read_one(raw, MessageKind::Request).await.unwrap();
        assert_eq!(msg.method, "POST");
        assert_eq!(msg.body, b"user=a&pass=b");
        assert_eq!(msg.raw, raw);
    }

    #[tokio::test]
    async fn test_chunked_response() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
                    5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let msg = read_one(raw, MessageKind::Response).await.unwrap();
        assert_eq!(msg.status, 200);
        assert_eq!(msg.body, b"hello world");
        // Raw preserves the chunked framing for verbatim forwarding.
        assert_eq!(msg.raw, raw);
    }

    #[tokio::test]
    async fn test_response_to_eof() {
        let raw = b"HTTP/1.0 200 OK\r\nContent-Type: text/plain\r\n\r\nstream until close";
        let msg = read_one(raw, MessageKind::Response).await.unwrap();
        assert_eq!(msg.body, b"stream until close");
        assert!(!msg.keep_alive());
    }

    #[tokio::test]
    async fn test_keepalive_two_requests() {
        let raw = b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b HTTP/1.1\r\nHost: x\r\n\r\n";
        let mut reader = MessageReader::new(&raw[..]);
        let a = reader.read_message(MessageKind::Request, 1024).await.unwrap();
        let b = reader.read_message(MessageKind::Request, 1024).await.unwrap();
        assert_eq!(a.path, "/a");
        assert_eq!(b.path, "/b");
        assert!(matches!(
            reader.read_message(MessageKind::Request, 1024).await,
            Err(Http1Error::Closed)
        ));
    }

    #[tokio::test]
    async fn test_body_cap_marks_truncated() {
        let body = vec![b'x'; 100];
        let mut raw = format!("POST /up HTTP/1.1\r\nContent-Length: {}\r\n\r\n", body.len())
            .into_bytes();
        raw.extend_from_slice(&body);
        let mut reader = MessageReader::new(&raw[..]);
        let msg = reader.read_message(MessageKind::Request, 10).await.unwrap();
        assert!(msg.truncated);
        assert_eq!(msg.body.len(), 10);
        // The unread remainder stays available for piping.
        let (rest, leftover) = reader.into_parts();
        assert!(!rest.is_empty() || !leftover.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_head() {
        let raw = b"NOT A REQUEST\r\n\r\n";
        assert!(matches!(
            read_one(raw, MessageKind::Request).await,
            Err(Http1Error::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_bad_content_length() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: banana\r\n\r\n";
        assert!(matches!(
            read_one(raw, MessageKind::Request).await,
            Err(Http1Error::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_403_parses_back() {
        let bytes = build_403("Category blocked: gambling");
        let msg = read_one(&bytes, MessageKind::Response).await.unwrap();
        assert_eq!(msg.status, 403);
        assert!(String::from_utf8_lossy(&msg.body).contains("Category blocked"));
        assert!(!msg.keep_alive());
    }

    #[tokio::test]
    async fn test_duplicate_headers_joined_in_map() {
        let raw = b"GET / HTTP/1.1\r\nAccept: a\r\nAccept: b\r\n\r\n";
        let msg = read_one(raw, MessageKind::Request).await.unwrap();
        assert_eq!(msg.header_map().get("accept").map(String::as_str), Some("a, b"));
    }
}
