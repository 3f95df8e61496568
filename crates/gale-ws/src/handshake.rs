//! HTTP/1.1 upgrade handshake (server side).
//!
//! Reads the request line and headers off the raw stream with a combined
//! 8 KiB cap, validates the upgrade headers, computes the accept key, and
//! writes the 101 response. Bytes read past the blank line are preserved in
//! [`UpgradeRequest::trailing`]; they may already contain WebSocket frames
//! and must be fed to the receive path.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use gale_core::{Error, Result};
use rand::rngs::OsRng;
use rand::RngCore;
use sha1::{Digest, Sha1};
use std::io::{Read, Write};

/// RFC 6455 handshake GUID.
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Combined cap on the request line plus headers, terminator included.
pub const MAX_HEADER_BYTES: usize = 8192;

const READ_CHUNK: usize = 1024;

/// Parsed and validated upgrade request.
#[derive(Debug)]
pub struct UpgradeRequest {
    /// Request path from the request line.
    pub path: String,
    /// Headers in arrival order, names as received.
    pub headers: Vec<(String, String)>,
    /// `Sec-WebSocket-Key` value.
    pub key: String,
    /// Bytes read past the blank line; already part of the frame stream.
    pub trailing: Vec<u8>,
}

impl UpgradeRequest {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Computes `base64(sha1(key || GUID))`.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Returns true when a comma-separated token list contains `token`
/// (case-insensitive).
fn contains_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|part| part.trim().eq_ignore_ascii_case(token))
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn bad_request(detail: impl Into<String>) -> Error {
    Error::InvalidArgument(detail.into())
}

/// Reads until the header-terminating blank line, enforcing the 8 KiB cap.
/// Returns the accumulated bytes and the offset just past the terminator.
fn read_header_block(stream: &mut impl Read) -> Result<(Vec<u8>, usize)> {
    let mut buf: Vec<u8> = Vec::with_capacity(READ_CHUNK);
    loop {
        if let Some(pos) = find_terminator(&buf) {
            let end = pos + 4;
            if end > MAX_HEADER_BYTES {
                return Err(bad_request("handshake header block exceeds 8 KiB"));
            }
            return Ok((buf, end));
        }
        // Any terminator found from here on would end past the cap.
        if buf.len() >= MAX_HEADER_BYTES {
            return Err(bad_request("handshake header block exceeds 8 KiB"));
        }

        let mut chunk = [0u8; READ_CHUNK];
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Err(bad_request("connection closed during handshake"));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Reads and validates an upgrade request from the raw stream.
pub fn read_upgrade_request(stream: &mut impl Read) -> Result<UpgradeRequest> {
    let (buf, header_end) = read_header_block(stream)?;

    let head = std::str::from_utf8(&buf[..header_end - 4])
        .map_err(|_| bad_request("handshake headers are not valid utf-8"))?;
    let mut lines = head.split("\r\n");

    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let (method, path, version) = (
        parts.next().unwrap_or_default(),
        parts.next().unwrap_or_default(),
        parts.next().unwrap_or_default(),
    );
    if method != "GET" {
        return Err(bad_request(format!("handshake method must be GET, got {method:?}")));
    }
    if path.is_empty() {
        return Err(bad_request("handshake request line missing path"));
    }
    if version != "HTTP/1.1" {
        return Err(bad_request(format!("handshake requires HTTP/1.1, got {version:?}")));
    }

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(bad_request(format!("malformed header line {line:?}")));
        };
        headers.push((name.trim().to_owned(), value.trim().to_owned()));
    }

    let request = UpgradeRequest {
        path: path.to_owned(),
        headers,
        key: String::new(),
        trailing: buf[header_end..].to_vec(),
    };

    if request.header("Host").is_none() {
        return Err(bad_request("missing Host header"));
    }
    match request.header("Upgrade") {
        Some(value) if contains_token(value, "websocket") => {}
        _ => return Err(bad_request("Upgrade header must contain websocket")),
    }
    match request.header("Connection") {
        Some(value) if contains_token(value, "Upgrade") => {}
        _ => return Err(bad_request("Connection header must contain Upgrade")),
    }
    match request.header("Sec-WebSocket-Version") {
        Some("13") => {}
        other => {
            return Err(bad_request(format!(
                "unsupported Sec-WebSocket-Version {other:?}"
            )))
        }
    }
    let key = match request.header("Sec-WebSocket-Key") {
        Some(value) if !value.is_empty() => value.to_owned(),
        _ => return Err(bad_request("missing Sec-WebSocket-Key header")),
    };

    Ok(UpgradeRequest { key, ..request })
}

/// Writes the 101 Switching Protocols response for `key`.
pub fn write_accept_response(stream: &mut impl Write, key: &str) -> Result<()> {
    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(key)
    );
    stream.write_all(response.as_bytes())?;
    stream.flush()?;
    Ok(())
}

/// Generates a fresh client nonce: base64 of 16 random bytes.
pub fn generate_key() -> String {
    let mut nonce = [0u8; 16];
    OsRng.fill_bytes(&mut nonce);
    BASE64.encode(nonce)
}

/// Reads and validates the server's 101 response for `key`. Returns any
/// bytes read past the blank line (they belong to the frame stream).
pub fn read_accept_response(stream: &mut impl Read, key: &str) -> Result<Vec<u8>> {
    let (buf, header_end) = read_header_block(stream)?;

    let head = std::str::from_utf8(&buf[..header_end - 4])
        .map_err(|_| bad_request("response headers are not valid utf-8"))?;
    let mut lines = head.split("\r\n");

    let status_line = lines.next().unwrap_or_default();
    let mut parts = status_line.split_whitespace();
    let (version, status) = (
        parts.next().unwrap_or_default(),
        parts.next().unwrap_or_default(),
    );
    if version != "HTTP/1.1" || status != "101" {
        return Err(bad_request(format!(
            "upgrade refused with status line {status_line:?}"
        )));
    }

    let mut accept = None;
    let mut upgrade_ok = false;
    let mut connection_ok = false;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let (name, value) = (name.trim(), value.trim());
        if name.eq_ignore_ascii_case("Sec-WebSocket-Accept") {
            accept = Some(value.to_owned());
        } else if name.eq_ignore_ascii_case("Upgrade") {
            upgrade_ok = contains_token(value, "websocket");
        } else if name.eq_ignore_ascii_case("Connection") {
            connection_ok = contains_token(value, "Upgrade");
        }
    }

    if !upgrade_ok || !connection_ok {
        return Err(bad_request("response missing upgrade headers"));
    }
    match accept {
        Some(value) if value == accept_key(key) => Ok(buf[header_end..].to_vec()),
        Some(_) => Err(bad_request("Sec-WebSocket-Accept mismatch")),
        None => Err(bad_request("missing Sec-WebSocket-Accept header")),
    }
}

/// Builds a client upgrade request (used by tests and client-mode
/// connections).
pub fn client_request(host: &str, path: &str, key: &str) -> String {
    format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

    fn sample_request() -> String {
        client_request("server.example.com", "/chat", SAMPLE_KEY)
    }

    #[test]
    fn test_accept_key_reference_vector() {
        // Known pair from the protocol specification.
        assert_eq!(accept_key(SAMPLE_KEY), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn test_parse_valid_request() {
        let raw = sample_request();
        let request = read_upgrade_request(&mut raw.as_bytes()).unwrap();
        assert_eq!(request.path, "/chat");
        assert_eq!(request.key, SAMPLE_KEY);
        assert_eq!(request.header("host"), Some("server.example.com"));
        assert!(request.trailing.is_empty());
    }

    #[test]
    fn test_trailing_bytes_preserved() {
        let mut raw = sample_request().into_bytes();
        raw.extend_from_slice(&[0x81, 0x85, 1, 2, 3, 4, 5, 6, 7, 8, 9]);

        let request = read_upgrade_request(&mut raw.as_slice()).unwrap();
        assert_eq!(
            request.trailing,
            vec![0x81, 0x85, 1, 2, 3, 4, 5, 6, 7, 8, 9]
        );
    }

    #[test]
    fn test_token_list_matching() {
        let raw = sample_request().replace(
            "Connection: Upgrade",
            "Connection: keep-alive, Upgrade",
        );
        assert!(read_upgrade_request(&mut raw.as_bytes()).is_ok());
    }

    #[test]
    fn test_missing_headers_rejected() {
        let key_line = format!("Sec-WebSocket-Key: {SAMPLE_KEY}\r\n");
        for dropped in [
            "Host: server.example.com\r\n",
            "Upgrade: websocket\r\n",
            "Connection: Upgrade\r\n",
            key_line.as_str(),
            "Sec-WebSocket-Version: 13\r\n",
        ] {
            let raw = sample_request().replace(dropped, "");
            assert!(
                read_upgrade_request(&mut raw.as_bytes()).is_err(),
                "request without {dropped:?} must be rejected"
            );
        }
    }

    #[test]
    fn test_wrong_version_rejected() {
        let raw = sample_request().replace("Version: 13", "Version: 8");
        assert!(read_upgrade_request(&mut raw.as_bytes()).is_err());
    }

    #[test]
    fn test_non_get_rejected() {
        let raw = sample_request().replace("GET ", "POST ");
        assert!(read_upgrade_request(&mut raw.as_bytes()).is_err());
    }

    /// Builds a request padded to exactly `total` header-block bytes.
    fn padded_request(total: usize) -> Vec<u8> {
        let base = sample_request();
        let pad_header = "X-Pad: ";
        let overhead = base.len() + pad_header.len() + 2; // + trailing \r\n
        assert!(total > overhead, "padding target too small");
        let padding = "a".repeat(total - overhead);

        let mut raw = base;
        let insert_at = raw.len() - 2; // before the final blank line
        raw.insert_str(insert_at, &format!("{pad_header}{padding}\r\n"));
        assert_eq!(raw.len(), total);
        raw.into_bytes()
    }

    #[test]
    fn test_header_cap_boundary() {
        // Exactly 8192 bytes: accepted.
        let raw = padded_request(MAX_HEADER_BYTES);
        assert!(read_upgrade_request(&mut raw.as_slice()).is_ok());

        // One byte over: rejected.
        let raw = padded_request(MAX_HEADER_BYTES + 1);
        assert!(read_upgrade_request(&mut raw.as_slice()).is_err());
    }

    #[test]
    fn test_generate_key_is_16_random_bytes() {
        let key = generate_key();
        let decoded = BASE64.decode(&key).unwrap();
        assert_eq!(decoded.len(), 16);
        assert_ne!(generate_key(), key);
    }

    #[test]
    fn test_read_accept_response_roundtrip() {
        let mut raw = Vec::new();
        write_accept_response(&mut raw, SAMPLE_KEY).unwrap();
        raw.extend_from_slice(&[0x81, 0x00]); // early frame bytes

        let trailing = read_accept_response(&mut raw.as_slice(), SAMPLE_KEY).unwrap();
        assert_eq!(trailing, vec![0x81, 0x00]);
    }

    #[test]
    fn test_read_accept_response_rejects_bad_accept() {
        let mut raw = Vec::new();
        write_accept_response(&mut raw, SAMPLE_KEY).unwrap();

        // Validated against a different nonce, the accept value no longer
        // matches.
        assert!(read_accept_response(&mut raw.as_slice(), "b3RoZXIgbm9uY2UgaGVyZQ==").is_err());
    }

    #[test]
    fn test_read_accept_response_rejects_non_101() {
        let raw = b"HTTP/1.1 400 Bad Request\r\n\r\n";
        assert!(read_accept_response(&mut raw.as_slice(), SAMPLE_KEY).is_err());
    }

    #[test]
    fn test_accept_response_contents() {
        let mut out = Vec::new();
        write_accept_response(&mut out, SAMPLE_KEY).unwrap();
        let response = String::from_utf8(out).unwrap();

        assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(response.contains("Upgrade: websocket\r\n"));
        assert!(response.contains("Connection: Upgrade\r\n"));
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(response.ends_with("\r\n\r\n"));
    }
}
