//! HTTP CONNECT bootstrap for `http@` endpoints.
//!
//! The client sends `CONNECT /_muxrpc_ HTTP/1.0`, the server answers
//! `HTTP/1.0 200 Connected to muxrpc`, and from then on the socket carries the
//! ordinary handshake and envelopes. Heads are read one byte at a time so no
//! byte belonging to the RPC stream is consumed.

use std::io::{Read, Write};

use tracing::{debug, warn};

use crate::error::{Result, TransportError};

/// Request path used for the CONNECT upgrade.
pub const DEFAULT_RPC_PATH: &str = "/_muxrpc_";

/// Status line text of a successful upgrade.
pub const CONNECTED_STATUS: &str = "200 Connected to muxrpc";

/// Upper bound on an HTTP head during the upgrade.
pub const MAX_HEAD_SIZE: usize = 8 * 1024;

/// Client side: request the upgrade and check the status line.
pub fn connect_tunnel<S: Read + Write>(stream: &mut S) -> Result<()> {
    write!(stream, "CONNECT {DEFAULT_RPC_PATH} HTTP/1.0\r\n\r\n")?;
    stream.flush()?;

    let head = read_head(stream)?;
    let status_line = head.lines().next().unwrap_or_default();
    let status = status_line
        .split_once(' ')
        .map(|(_, rest)| rest.trim())
        .unwrap_or_default();

    if status != CONNECTED_STATUS {
        return Err(TransportError::Tunnel(format!(
            "unexpected HTTP response: {status_line}"
        )));
    }
    Ok(())
}

/// Server side: read the upgrade request and answer it.
///
/// Anything other than `CONNECT` gets a 405, an unknown path a 404; both
/// return an error and the caller should drop the stream.
pub fn accept_tunnel<S: Read + Write>(stream: &mut S) -> Result<()> {
    let head = read_head(stream)?;
    let request_line = head.lines().next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default();
    let path = parts.next().unwrap_or_default();

    if method != "CONNECT" {
        warn!(method, "rejecting non-CONNECT request");
        reply_plain(stream, "405 Method Not Allowed", "405 must CONNECT\n")?;
        return Err(TransportError::Tunnel(format!(
            "expected CONNECT, got {method:?}"
        )));
    }
    if path != DEFAULT_RPC_PATH {
        warn!(path, "rejecting CONNECT to unknown path");
        reply_plain(stream, "404 Not Found", "404 unknown rpc path\n")?;
        return Err(TransportError::Tunnel(format!("unknown rpc path {path:?}")));
    }

    write!(stream, "HTTP/1.0 {CONNECTED_STATUS}\r\n\r\n")?;
    stream.flush()?;
    debug!("tunnel accepted");
    Ok(())
}

fn reply_plain<S: Write>(stream: &mut S, status: &str, body: &str) -> Result<()> {
    write!(
        stream,
        "HTTP/1.0 {status}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    )?;
    stream.flush()?;
    Ok(())
}

/// Read up to and including the blank line ending an HTTP head.
fn read_head<S: Read>(stream: &mut S) -> Result<String> {
    let mut head = Vec::with_capacity(128);
    let mut byte = [0u8; 1];
    loop {
        if head.len() >= MAX_HEAD_SIZE {
            return Err(TransportError::Tunnel(format!(
                "HTTP head exceeds {MAX_HEAD_SIZE} bytes"
            )));
        }
        match stream.read(&mut byte) {
            Ok(0) => {
                return Err(TransportError::Tunnel(
                    "connection closed during HTTP upgrade".to_string(),
                ))
            }
            Ok(_) => head.push(byte[0]),
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
        if head.ends_with(b"\r\n\r\n") || head.ends_with(b"\n\n") {
            break;
        }
    }
    String::from_utf8(head)
        .map_err(|_| TransportError::Tunnel("HTTP head is not valid UTF-8".to_string()))
}
