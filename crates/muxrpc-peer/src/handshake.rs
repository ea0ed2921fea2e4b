use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use muxrpc_frame::Codec;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, RpcError};

/// Constant every handshake must carry.
pub const MAGIC_NUMBER: u32 = 0x3bef5c;

/// Handle timeout applied when the client sends zero.
pub const DEFAULT_HANDLE_TIMEOUT: Duration = Duration::from_secs(3);

/// Default bound on dial plus handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Connection parameters sent by the client before any envelope.
///
/// On the wire: a u16 big-endian length followed by this struct as JSON.
/// Durations are integer nanoseconds. The server does not answer; a rejected
/// handshake is observed as the connection closing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectOptions {
    #[serde(rename = "MagicNumber")]
    pub magic_number: u32,
    /// Codec identifier, e.g. `application/json`.
    #[serde(rename = "CodecType")]
    pub codec: String,
    /// Bounds dial plus handshake on the client. Zero means unbounded.
    #[serde(rename = "ConnectTimeout", with = "duration_nanos")]
    pub connect_timeout: Duration,
    /// Per-request processing bound on the server. Zero selects the server default.
    #[serde(rename = "HandleTimeout", with = "duration_nanos")]
    pub handle_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            magic_number: MAGIC_NUMBER,
            codec: Codec::default().content_type().to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handle_timeout: Duration::ZERO,
        }
    }
}

impl ConnectOptions {
    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec.content_type().to_string();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_handle_timeout(mut self, timeout: Duration) -> Self {
        self.handle_timeout = timeout;
        self
    }

    /// Resolve the codec identifier.
    pub fn codec(&self) -> Result<Codec> {
        self.codec
            .parse()
            .map_err(|err: muxrpc_frame::CodecError| RpcError::Handshake(err.to_string()))
    }
}

/// What the server settled on for one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    pub codec: Codec,
    pub handle_timeout: Duration,
}

/// Client side: validate and send the options. Returns the codec to use.
pub fn send_handshake<W: Write>(writer: &mut W, options: &ConnectOptions) -> Result<Codec> {
    let codec = options.codec()?;
    let payload = serde_json::to_vec(options)
        .map_err(|err| RpcError::Handshake(format!("options not encodable: {err}")))?;
    let len = u16::try_from(payload.len()).map_err(|_| {
        RpcError::Handshake(format!("options too large: {} bytes", payload.len()))
    })?;

    let mut buf = Vec::with_capacity(2 + payload.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&payload);
    writer.write_all(&buf).map_err(handshake_io)?;
    writer.flush().map_err(handshake_io)?;

    debug!(%codec, "sent handshake");
    Ok(codec)
}

/// Server side: read and validate the client's options.
///
/// Any failure is fatal and the caller closes the connection.
pub fn accept_handshake<R: Read>(
    reader: &mut R,
    default_handle_timeout: Duration,
) -> Result<Negotiated> {
    let mut prefix = [0u8; 2];
    reader.read_exact(&mut prefix).map_err(handshake_io)?;
    let len = u16::from_be_bytes(prefix) as usize;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).map_err(handshake_io)?;
    let options: ConnectOptions = serde_json::from_slice(&payload)
        .map_err(|err| RpcError::Handshake(format!("malformed options: {err}")))?;

    if options.magic_number != MAGIC_NUMBER {
        warn!(magic = options.magic_number, "invalid magic number");
        return Err(RpcError::Handshake(format!(
            "invalid magic number {:#x}",
            options.magic_number
        )));
    }
    let codec = options.codec()?;

    let handle_timeout = if options.handle_timeout.is_zero() {
        default_handle_timeout
    } else {
        options.handle_timeout
    };

    Ok(Negotiated {
        codec,
        handle_timeout,
    })
}

fn handshake_io(err: std::io::Error) -> RpcError {
    match err.kind() {
        ErrorKind::UnexpectedEof => {
            RpcError::Handshake("connection closed during handshake".to_string())
        }
        ErrorKind::WouldBlock | ErrorKind::TimedOut => {
            RpcError::Handshake("timed out waiting for handshake".to_string())
        }
        _ => RpcError::Handshake(err.to_string()),
    }
}

mod duration_nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let nanos = u64::try_from(value.as_nanos()).unwrap_or(u64::MAX);
        serializer.serialize_u64(nanos)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_nanos(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn wire(options: &ConnectOptions) -> Vec<u8> {
        let mut out = Vec::new();
        send_handshake(&mut out, options).expect("handshake should encode");
        out
    }

    #[test]
    fn options_use_nanosecond_durations_on_the_wire() {
        let options = ConnectOptions::default()
            .with_codec(Codec::Json)
            .with_handle_timeout(Duration::from_secs(1));
        let bytes = wire(&options);

        let len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
        assert_eq!(len, bytes.len() - 2);
        let json: serde_json::Value =
            serde_json::from_slice(&bytes[2..]).expect("payload should be json");
        assert_eq!(json["MagicNumber"], MAGIC_NUMBER);
        assert_eq!(json["CodecType"], "application/json");
        assert_eq!(json["ConnectTimeout"], 3_000_000_000u64);
        assert_eq!(json["HandleTimeout"], 1_000_000_000u64);
    }

    #[test]
    fn accept_applies_handle_timeout_fallback() {
        let bytes = wire(&ConnectOptions::default());
        let negotiated = accept_handshake(&mut Cursor::new(bytes), DEFAULT_HANDLE_TIMEOUT)
            .expect("handshake should succeed");
        assert_eq!(negotiated.codec, Codec::Bincode);
        assert_eq!(negotiated.handle_timeout, DEFAULT_HANDLE_TIMEOUT);

        let options = ConnectOptions::default().with_handle_timeout(Duration::from_millis(250));
        let bytes = wire(&options);
        let negotiated = accept_handshake(&mut Cursor::new(bytes), DEFAULT_HANDLE_TIMEOUT)
            .expect("handshake should succeed");
        assert_eq!(negotiated.handle_timeout, Duration::from_millis(250));
    }

    #[test]
    fn accept_rejects_bad_magic() {
        let options = ConnectOptions {
            magic_number: 0x1234,
            ..ConnectOptions::default()
        };
        let err = accept_handshake(&mut Cursor::new(wire(&options)), DEFAULT_HANDLE_TIMEOUT)
            .expect_err("bad magic should fail");
        assert!(matches!(err, RpcError::Handshake(msg) if msg.contains("magic")));
    }

    #[test]
    fn accept_rejects_unknown_codec() {
        let options = ConnectOptions {
            codec: "application/protobuf".to_string(),
            ..ConnectOptions::default()
        };
        let payload = serde_json::to_vec(&options).expect("options should serialize");
        let mut bytes = (payload.len() as u16).to_be_bytes().to_vec();
        bytes.extend_from_slice(&payload);

        let err = accept_handshake(&mut Cursor::new(bytes), DEFAULT_HANDLE_TIMEOUT)
            .expect_err("unknown codec should fail");
        assert!(matches!(err, RpcError::Handshake(_)));
    }

    #[test]
    fn send_rejects_unknown_codec_before_writing() {
        let options = ConnectOptions {
            codec: "xml".to_string(),
            ..ConnectOptions::default()
        };
        let mut out = Vec::new();
        assert!(send_handshake(&mut out, &options).is_err());
        assert!(out.is_empty());
    }

    #[test]
    fn accept_rejects_malformed_and_truncated_input() {
        let mut garbage = 5u16.to_be_bytes().to_vec();
        garbage.extend_from_slice(b"nope!");
        let err = accept_handshake(&mut Cursor::new(garbage), DEFAULT_HANDLE_TIMEOUT)
            .expect_err("garbage options should fail");
        assert!(matches!(err, RpcError::Handshake(msg) if msg.starts_with("malformed options")));

        let mut truncated = wire(&ConnectOptions::default());
        truncated.truncate(10);
        let err = accept_handshake(&mut Cursor::new(truncated), DEFAULT_HANDLE_TIMEOUT)
            .expect_err("truncated options should fail");
        assert!(matches!(err, RpcError::Handshake(msg) if msg.contains("closed")));
    }
}
