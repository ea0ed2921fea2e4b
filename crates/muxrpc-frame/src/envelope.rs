use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

/// Size of the total-length prefix in front of every envelope.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default maximum envelope size: 16 MiB.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Default size of pooled read buffers: 32 KiB.
pub const DEFAULT_POOL_BUFFER_SIZE: usize = 32 * 1024;

/// Default number of buffers kept by a reader's pool.
pub const DEFAULT_POOL_CAPACITY: usize = 4;

/// Routing and status information carried on every envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header {
    /// Target in `Service.Method` form.
    pub method: String,
    /// Correlates a response with its request. Unique per connection and direction.
    pub seq: u64,
    /// Empty on success.
    pub error: String,
    /// Caller-supplied trace identifier, echoed on the response.
    pub trace_id: String,
}

impl Header {
    /// A request header with no error and no trace id.
    pub fn request(method: impl Into<String>, seq: u64) -> Self {
        Self {
            method: method.into(),
            seq,
            ..Self::default()
        }
    }

    /// Header for the response to `self`, keeping seq, method, and trace id.
    pub fn reply(&self) -> Self {
        Self {
            method: self.method.clone(),
            seq: self.seq,
            error: String::new(),
            trace_id: self.trace_id.clone(),
        }
    }

    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }
}

/// Header plus opaque body: the unit exchanged on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub header: Header,
    pub body: Bytes,
}

impl Message {
    pub fn new(header: Header, body: impl Into<Bytes>) -> Self {
        Self {
            header,
            body: body.into(),
        }
    }

    /// Size of the packed envelope, excluding the length prefix.
    pub fn packed_len(&self) -> usize {
        let trace = if self.header.trace_id.is_empty() {
            0
        } else {
            4 + self.header.trace_id.len()
        };
        4 + self.header.method.len() + 8 + 4 + self.header.error.len() + 4 + self.body.len() + trace
    }

    /// Append the envelope fields to `dst`.
    ///
    /// ```text
    /// ┌────────────┬─────────┬─────────┬────────────┬──────────┬───────────┬────────────┐
    /// │ method len │ method  │ seq     │ error len  │ error    │ body len  │ body       │
    /// │ (4B BE)    │ (UTF-8) │ (8B BE) │ (4B BE)    │ (if > 0) │ (4B BE)   │            │
    /// └────────────┴─────────┴─────────┴────────────┴──────────┴───────────┴────────────┘
    ///   [ trace len (4B BE) + trace id ]  only when the trace id is non-empty
    /// ```
    pub fn pack(&self, dst: &mut BytesMut) -> Result<()> {
        dst.reserve(self.packed_len());
        put_field(dst, self.header.method.as_bytes())?;
        dst.put_u64(self.header.seq);
        put_field(dst, self.header.error.as_bytes())?;
        put_field(dst, &self.body)?;
        if !self.header.trace_id.is_empty() {
            put_field(dst, self.header.trace_id.as_bytes())?;
        }
        Ok(())
    }

    /// Parse one envelope occupying all of `src`.
    ///
    /// Fails on truncated or inconsistent length fields and on leftover bytes.
    pub fn unpack(src: &[u8]) -> Result<Self> {
        let mut cursor = src;

        let method = take_string(&mut cursor, "method")?;
        if cursor.remaining() < 8 {
            return Err(FrameError::Truncated {
                field: "seq",
                needed: 8,
                remaining: cursor.remaining(),
            });
        }
        let seq = cursor.get_u64();
        let error = take_string(&mut cursor, "error")?;
        let body = Bytes::copy_from_slice(take_field(&mut cursor, "body")?);

        let trace_id = if cursor.has_remaining() {
            take_string(&mut cursor, "trace id")?
        } else {
            String::new()
        };

        if cursor.has_remaining() {
            return Err(FrameError::TrailingBytes(cursor.remaining()));
        }

        Ok(Self {
            header: Header {
                method,
                seq,
                error,
                trace_id,
            },
            body,
        })
    }
}

fn put_field(dst: &mut BytesMut, field: &[u8]) -> Result<()> {
    let len = u32::try_from(field.len()).map_err(|_| FrameError::FrameTooLarge {
        size: field.len(),
        max: u32::MAX as usize,
    })?;
    dst.put_u32(len);
    dst.put_slice(field);
    Ok(())
}

fn take_field<'a>(cursor: &mut &'a [u8], field: &'static str) -> Result<&'a [u8]> {
    if cursor.remaining() < 4 {
        return Err(FrameError::Truncated {
            field,
            needed: 4,
            remaining: cursor.remaining(),
        });
    }
    let len = cursor.get_u32() as usize;
    if cursor.remaining() < len {
        return Err(FrameError::Truncated {
            field,
            needed: len,
            remaining: cursor.remaining(),
        });
    }
    let (value, rest) = cursor.split_at(len);
    *cursor = rest;
    Ok(value)
}

fn take_string(cursor: &mut &[u8], field: &'static str) -> Result<String> {
    let raw = take_field(cursor, field)?;
    std::str::from_utf8(raw)
        .map(str::to_owned)
        .map_err(|_| FrameError::InvalidUtf8(field))
}

/// Encode a message with its length prefix into `dst`.
pub fn encode_frame(message: &Message, max_frame_size: usize, dst: &mut BytesMut) -> Result<()> {
    let len = message.packed_len();
    if len > max_frame_size || len > u32::MAX as usize {
        return Err(FrameError::FrameTooLarge {
            size: len,
            max: max_frame_size.min(u32::MAX as usize),
        });
    }
    dst.reserve(LENGTH_PREFIX_SIZE + len);
    dst.put_u32(len as u32);
    message.pack(dst)
}

/// Decode one length-prefixed message from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes the frame bytes from the buffer.
pub fn decode_frame(src: &mut BytesMut, max_frame_size: usize) -> Result<Option<Message>> {
    if src.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    prefix.copy_from_slice(&src[..LENGTH_PREFIX_SIZE]);
    let len = u32::from_be_bytes(prefix) as usize;
    if len > max_frame_size {
        return Err(FrameError::FrameTooLarge {
            size: len,
            max: max_frame_size,
        });
    }

    if src.len() < LENGTH_PREFIX_SIZE + len {
        src.reserve(LENGTH_PREFIX_SIZE + len - src.len());
        return Ok(None);
    }

    src.advance(LENGTH_PREFIX_SIZE);
    let envelope = src.split_to(len);
    Message::unpack(&envelope).map(Some)
}

/// Configuration for frame readers and writers.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum envelope size in bytes. Default: 16 MiB.
    pub max_frame_size: usize,
    /// Frames up to this size are read into pooled buffers. Default: 32 KiB.
    pub pool_buffer_size: usize,
    /// Buffers retained by the pool. Default: 4.
    pub pool_capacity: usize,
    /// Read timeout for blocking operations.
    pub read_timeout: Option<std::time::Duration>,
    /// Write timeout for blocking operations.
    pub write_timeout: Option<std::time::Duration>,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            pool_buffer_size: DEFAULT_POOL_BUFFER_SIZE,
            pool_capacity: DEFAULT_POOL_CAPACITY,
            read_timeout: None,
            write_timeout: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(error: &str, trace_id: &str, body_len: usize) -> Message {
        Message {
            header: Header {
                method: "Arith.Sum".to_string(),
                seq: 42,
                error: error.to_string(),
                trace_id: trace_id.to_string(),
            },
            body: Bytes::from(vec![0x5A; body_len]),
        }
    }

    #[test]
    fn pack_layout_matches_wire_format() {
        let msg = Message::new(Header::request("A.B", 7), Bytes::from_static(b"xy"));
        let mut buf = BytesMut::new();
        msg.pack(&mut buf).unwrap();

        let expected: Vec<u8> = [
            &[0, 0, 0, 3][..],
            b"A.B",
            &[0, 0, 0, 0, 0, 0, 0, 7],
            &[0, 0, 0, 0],
            &[0, 0, 0, 2],
            b"xy",
        ]
        .concat();
        assert_eq!(buf.as_ref(), expected.as_slice());
        assert_eq!(msg.packed_len(), expected.len());
    }

    #[test]
    fn unpack_inverts_pack() {
        for body_len in [0, 1, 65536, DEFAULT_POOL_BUFFER_SIZE * 3] {
            for (error, trace) in [("", ""), ("boom", ""), ("", "trace-1"), ("e", "t")] {
                let msg = sample(error, trace, body_len);
                let mut buf = BytesMut::new();
                msg.pack(&mut buf).unwrap();
                assert_eq!(buf.len(), msg.packed_len());
                assert_eq!(Message::unpack(&buf).unwrap(), msg);
            }
        }
    }

    #[test]
    fn unpack_rejects_truncated_input() {
        let msg = sample("err", "", 16);
        let mut buf = BytesMut::new();
        msg.pack(&mut buf).unwrap();

        for cut in 0..buf.len() {
            let result = Message::unpack(&buf[..cut]);
            assert!(result.is_err(), "cut at {cut} should fail");
        }

        // A cut inside the trailing trace id field is also an error.
        let traced = sample("err", "trace", 16);
        let mut buf = BytesMut::new();
        traced.pack(&mut buf).unwrap();
        for cut in msg.packed_len() + 1..buf.len() {
            let result = Message::unpack(&buf[..cut]);
            assert!(result.is_err(), "cut at {cut} should fail");
        }
    }

    #[test]
    fn unpack_rejects_oversized_length_field() {
        let mut buf = BytesMut::new();
        buf.put_u32(1_000_000);
        buf.put_slice(b"short");
        assert!(matches!(
            Message::unpack(&buf),
            Err(FrameError::Truncated { field: "method", .. })
        ));
    }

    #[test]
    fn unpack_rejects_invalid_utf8_method() {
        let mut buf = BytesMut::new();
        buf.put_u32(2);
        buf.put_slice(&[0xFF, 0xFE]);
        buf.put_u64(1);
        buf.put_u32(0);
        buf.put_u32(0);
        assert!(matches!(
            Message::unpack(&buf),
            Err(FrameError::InvalidUtf8("method"))
        ));
    }

    #[test]
    fn frame_prefix_and_partial_decode() {
        let msg = sample("", "", 10);
        let mut wire = BytesMut::new();
        encode_frame(&msg, DEFAULT_MAX_FRAME_SIZE, &mut wire).unwrap();
        assert_eq!(&wire[..4], &(msg.packed_len() as u32).to_be_bytes());

        let mut partial = BytesMut::from(&wire[..wire.len() - 1]);
        assert!(decode_frame(&mut partial, DEFAULT_MAX_FRAME_SIZE)
            .unwrap()
            .is_none());

        let decoded = decode_frame(&mut wire, DEFAULT_MAX_FRAME_SIZE)
            .unwrap()
            .unwrap();
        assert_eq!(decoded, msg);
        assert!(wire.is_empty());
    }

    #[test]
    fn frame_size_limit_applies_both_ways() {
        let msg = sample("", "", 128);
        let mut wire = BytesMut::new();
        assert!(matches!(
            encode_frame(&msg, 64, &mut wire),
            Err(FrameError::FrameTooLarge { .. })
        ));

        encode_frame(&msg, DEFAULT_MAX_FRAME_SIZE, &mut wire).unwrap();
        assert!(matches!(
            decode_frame(&mut wire, 64),
            Err(FrameError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn reply_header_echoes_request() {
        let mut request = Header::request("Arith.Sum", 9);
        request.trace_id = "abc".to_string();
        let reply = request.reply();
        assert_eq!(reply.seq, 9);
        assert_eq!(reply.method, "Arith.Sum");
        assert_eq!(reply.trace_id, "abc");
        assert!(!reply.is_error());
    }
}
