//! ClientHello peeking: pull the SNI out of the first TLS record(s) without
//! consuming them, so the right leaf certificate can be minted before the
//! handshake.

use tokio::io::{AsyncRead, AsyncReadExt};

/// TLS record content type for handshake messages.
const CONTENT_HANDSHAKE: u8 = 22;
/// Handshake message type for ClientHello.
const HANDSHAKE_CLIENT_HELLO: u8 = 1;
/// server_name extension id.
const EXT_SERVER_NAME: u16 = 0;
/// Upper bound on bytes peeked while looking for the hello.
const MAX_PEEK: usize = 16 * 1024;

fn read_u16(data: &[u8], offset: usize) -> Option<u16> {
    Some(u16::from_be_bytes([*data.get(offset)?, *data.get(offset + 1)?]))
}

/// Extract the SNI host name from raw ClientHello bytes (one or more
/// complete TLS records). `None` when absent or not a ClientHello.
pub fn extract_sni(data: &[u8]) -> Option<String> {
    // Record header: type(1) version(2) length(2).
    if *data.first()? != CONTENT_HANDSHAKE {
        return None;
    }
    let record_len = read_u16(data, 3)? as usize;
    let hello = data.get(5..5 + record_len)?;

    if *hello.first()? != HANDSHAKE_CLIENT_HELLO {
        return None;
    }
    // Handshake header: type(1) length(3), then client_version(2) random(32).
    let mut offset = 4 + 2 + 32;

    // session_id
    let session_len = *hello.get(offset)? as usize;
    offset += 1 + session_len;

    // cipher_suites
    let ciphers_len = read_u16(hello, offset)? as usize;
    offset += 2 + ciphers_len;

    // compression_methods
    let compression_len = *hello.get(offset)? as usize;
    offset += 1 + compression_len;

    // extensions
    let extensions_len = read_u16(hello, offset)? as usize;
    offset += 2;
    let extensions = hello.get(offset..offset + extensions_len)?;

    let mut pos = 0;
    while pos + 4 <= extensions.len() {
        let ext_type = read_u16(extensions, pos)?;
        let ext_len = read_u16(extensions, pos + 2)? as usize;
        let body = extensions.get(pos + 4..pos + 4 + ext_len)?;
        if ext_type == EXT_SERVER_NAME {
            // ServerNameList: list_len(2), then entries of
            // type(1) + name_len(2) + name.
            let mut entry = 2;
            while entry + 3 <= body.len() {
                let name_type = *body.get(entry)?;
                let name_len = read_u16(body, entry + 1)? as usize;
                let name = body.get(entry + 3..entry + 3 + name_len)?;
                if name_type == 0 {
                    let host = String::from_utf8_lossy(name).into_owned();
                    if !host.is_empty() {
                        return Some(host.to_ascii_lowercase());
                    }
                }
                entry += 3 + name_len;
            }
            return None;
        }
        pos += 4 + ext_len;
    }
    None
}

/// Read the first TLS record from `stream` and return (peeked bytes, SNI).
/// The bytes must be replayed to the TLS acceptor afterwards.
pub async fn peek_client_hello<R: AsyncRead + Unpin>(
    stream: &mut R,
) -> std::io::Result<(Vec<u8>, Option<String>)> {
    let mut buf = Vec::with_capacity(2048);
    let mut chunk = [0u8; 2048];

    loop {
        // A complete record header tells us how much to wait for.
        if buf.len() >= 5 {
            let record_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
            if buf[0] != CONTENT_HANDSHAKE || record_len == 0 || record_len > MAX_PEEK {
                return Ok((buf, None));
            }
            if buf.len() >= 5 + record_len {
                let sni = extract_sni(&buf);
                return Ok((buf, sni));
            }
        }
        if buf.len() > MAX_PEEK {
            return Ok((buf, None));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok((buf, None));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Synthesize a minimal ClientHello carrying `sni`. Test helper for the
/// codec; real hellos come from clients.
#[cfg(test)]
pub fn synthetic_client_hello(sni: &str) -> Vec<u8> {
    let name = sni.as_bytes();
    // server_name extension body.
    let mut ext_body = Vec::new();
    ext_body.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
    ext_body.push(0); // host_name
    ext_body.extend_from_slice(&(name.len() as u16).to_be_bytes());
    ext_body.extend_from_slice(name);

    let mut extensions = Vec::new();
    extensions.extend_from_slice(&EXT_SERVER_NAME.to_be_bytes());
    extensions.extend_from_slice(&(ext_body.len() as u16).to_be_bytes());
    extensions.extend_from_slice(&ext_body);

    let mut hello_body = Vec::new();
    hello_body.extend_from_slice(&[0x03, 0x03]); // client_version
    hello_body.extend_from_slice(&[0u8; 32]); // random
    hello_body.push(0); // session_id
    hello_body.extend_from_slice(&2u16.to_be_bytes()); // cipher_suites len
    hello_body.extend_from_slice(&[0x13, 0x01]);
    hello_body.push(1); // compression_methods
    hello_body.push(0);
    hello_body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    hello_body.extend_from_slice(&extensions);

    let mut handshake = Vec::new();
    handshake.push(HANDSHAKE_CLIENT_HELLO);
    let len = hello_body.len() as u32;
    handshake.extend_from_slice(&len.to_be_bytes()[1..]);
    handshake.extend_from_slice(&hello_body);

    let mut record = Vec::new();
    record.push(CONTENT_HANDSHAKE);
    record.extend_from_slice(&[0x03, 0x01]);
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_sni() {
        let hello = synthetic_client_hello("Example.COM");
        assert_eq!(extract_sni(&hello).as_deref(), Some("example.com"));
    }

    #[test]
    fn test_no_sni_in_non_handshake() {
        assert_eq!(extract_sni(b"GET / HTTP/1.1\r\n"), None);
        assert_eq!(extract_sni(&[]), None);
        // Handshake record that is not a ClientHello.
        let mut record = vec![CONTENT_HANDSHAKE, 3, 1, 0, 4];
        record.extend_from_slice(&[2, 0, 0, 0]); // ServerHello type
        assert_eq!(extract_sni(&record), None);
    }

    #[test]
    fn test_truncated_hello_does_not_panic() {
        let hello = synthetic_client_hello("example.com");
        for cut in 0..hello.len() {
            let _ = extract_sni(&hello[..cut]);
        }
    }

    #[tokio::test]
    async fn test_peek_replays_all_bytes() {
        let hello = synthetic_client_hello("peek.example");
        let mut stream = &hello[..];
        let (peeked, sni) = peek_client_hello(&mut stream).await.unwrap();
        assert_eq!(sni.as_deref(), Some("peek.example"));
        assert_eq!(peeked, hello, "peeked bytes must be replayable");
    }

    #[tokio::test]
    async fn test_peek_non_tls_gives_no_sni() {
        let bytes = b"GET / HTTP/1.1\r\nHost: plain\r\n\r\n";
        let mut stream = &bytes[..];
        let (peeked, sni) = peek_client_hello(&mut stream).await.unwrap();
        assert!(sni.is_none());
        assert!(!peeked.is_empty());
    }
}
