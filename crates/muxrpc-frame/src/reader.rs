use std::io::{ErrorKind, Read};

use muxrpc_transport::RpcStream;
use tracing::trace;

use crate::envelope::{FrameConfig, Message, LENGTH_PREFIX_SIZE};
use crate::error::{FrameError, Result};
use crate::pool::BufferPool;

/// Reads complete envelopes from any `Read` stream.
///
/// Each frame costs exactly two reads at the framing level: the 4-byte length
/// prefix, then the envelope itself. Envelopes that fit the pool's buffer size
/// are read into pooled buffers; larger ones get a one-off allocation.
pub struct FrameReader<T> {
    inner: T,
    pool: BufferPool,
    config: FrameConfig,
}

impl<T: Read> FrameReader<T> {
    /// Create a new frame reader with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame reader with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        let pool = BufferPool::with_capacity(config.pool_capacity, config.pool_buffer_size);
        Self {
            inner,
            pool,
            config,
        }
    }

    /// Read the next complete message (blocking).
    ///
    /// Returns `Err(FrameError::ConnectionClosed)` when EOF is reached, whether
    /// between frames or in the middle of one.
    pub fn read_message(&mut self) -> Result<Message> {
        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        read_full(&mut self.inner, &mut prefix)?;
        let len = u32::from_be_bytes(prefix) as usize;

        if len > self.config.max_frame_size {
            return Err(FrameError::FrameTooLarge {
                size: len,
                max: self.config.max_frame_size,
            });
        }

        let message = if self.pool.fits(len) {
            let mut buf = self.pool.get();
            buf.resize(len, 0);
            read_full(&mut self.inner, &mut buf)?;
            Message::unpack(&buf)?
        } else {
            trace!(len, "frame exceeds pool buffer size; allocating");
            let mut buf = vec![0u8; len];
            read_full(&mut self.inner, &mut buf)?;
            Message::unpack(&buf)?
        };

        trace!(
            seq = message.header.seq,
            method = %message.header.method,
            len,
            "read frame"
        );
        Ok(message)
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Update maximum frame size for subsequent reads.
    pub fn set_max_frame_size(&mut self, max_frame_size: usize) {
        self.config.max_frame_size = max_frame_size;
    }

    /// Current frame reader configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }

    /// The buffer pool backing this reader.
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }
}

impl FrameReader<RpcStream> {
    /// Create a frame reader for `RpcStream` and apply read timeout from config.
    pub fn with_config_stream(inner: RpcStream, config: FrameConfig) -> Result<Self> {
        inner.set_read_timeout(config.read_timeout)?;
        Ok(Self::with_config(inner, config))
    }
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0usize;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Err(FrameError::ConnectionClosed),
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(FrameError::Io(err)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use bytes::{BufMut, Bytes, BytesMut};

    use super::*;
    use crate::envelope::{encode_frame, Header, DEFAULT_MAX_FRAME_SIZE, DEFAULT_POOL_BUFFER_SIZE};
    use crate::writer::FrameWriter;

    fn wire_of(messages: &[Message]) -> Vec<u8> {
        let mut wire = BytesMut::new();
        for message in messages {
            encode_frame(message, DEFAULT_MAX_FRAME_SIZE, &mut wire).unwrap();
        }
        wire.to_vec()
    }

    fn msg(seq: u64, body: &'static [u8]) -> Message {
        Message::new(Header::request("Arith.Sum", seq), Bytes::from_static(body))
    }

    #[test]
    fn read_multiple_messages() {
        let sent = [msg(1, b"one"), msg(2, b"two"), msg(3, b"")];
        let mut reader = FrameReader::new(Cursor::new(wire_of(&sent)));

        for expected in &sent {
            assert_eq!(&reader.read_message().unwrap(), expected);
        }
        assert!(matches!(
            reader.read_message(),
            Err(FrameError::ConnectionClosed)
        ));
    }

    #[test]
    fn large_frame_bypasses_pool() {
        let body = vec![0xAB; DEFAULT_POOL_BUFFER_SIZE * 2];
        let sent = Message::new(Header::request("Blob.Put", 5), body);
        let mut reader = FrameReader::new(Cursor::new(wire_of(&[sent.clone()])));

        let before = reader.pool().available();
        let got = reader.read_message().unwrap();
        assert_eq!(got, sent);
        assert_eq!(reader.pool().available(), before);
    }

    #[test]
    fn partial_reads_are_reassembled() {
        let sent = msg(4, b"slow");
        let byte_reader = ByteByByteReader {
            bytes: wire_of(&[sent.clone()]),
            pos: 0,
        };
        let mut reader = FrameReader::new(byte_reader);
        assert_eq!(reader.read_message().unwrap(), sent);
    }

    #[test]
    fn eof_mid_frame_is_connection_closed() {
        let mut wire = wire_of(&[msg(1, b"truncated-body")]);
        wire.truncate(wire.len() - 3);
        let mut reader = FrameReader::new(Cursor::new(wire));
        assert!(matches!(
            reader.read_message(),
            Err(FrameError::ConnectionClosed)
        ));
    }

    #[test]
    fn oversized_prefix_rejected_before_reading_body() {
        let mut wire = BytesMut::new();
        wire.put_u32(1024);
        let cfg = FrameConfig {
            max_frame_size: 16,
            ..FrameConfig::default()
        };
        let mut reader = FrameReader::with_config(Cursor::new(wire.to_vec()), cfg);
        assert!(matches!(
            reader.read_message(),
            Err(FrameError::FrameTooLarge { size: 1024, max: 16 })
        ));
    }

    #[test]
    fn inconsistent_envelope_is_decode_error() {
        let mut wire = BytesMut::new();
        wire.put_u32(6);
        wire.put_u32(100);
        wire.put_slice(b"ab");
        let mut reader = FrameReader::new(Cursor::new(wire.to_vec()));
        assert!(matches!(
            reader.read_message(),
            Err(FrameError::Truncated { .. })
        ));
    }

    #[test]
    fn interrupted_read_retries() {
        let sent = msg(8, b"ok");
        let reader = InterruptedOnce {
            interrupted: false,
            inner: Cursor::new(wire_of(&[sent.clone()])),
        };
        let mut framed = FrameReader::new(reader);
        assert_eq!(framed.read_message().unwrap(), sent);
    }

    #[test]
    fn roundtrip_over_stream_pair() {
        let (left, right) = RpcStream::pair().unwrap();
        let mut writer = FrameWriter::new(left);
        let mut reader = FrameReader::with_config_stream(right, FrameConfig::default()).unwrap();

        let handle = std::thread::spawn(move || {
            for seq in 0..64u64 {
                let got = reader.read_message().unwrap();
                assert_eq!(got.header.seq, seq);
                assert_eq!(got.body.as_ref(), format!("msg-{seq}").as_bytes());
            }
        });

        for seq in 0..64u64 {
            let message = Message::new(
                Header::request("Echo.Say", seq),
                format!("msg-{seq}").into_bytes(),
            );
            writer.write_message(&message).unwrap();
        }
        handle.join().unwrap();
    }

    #[test]
    fn read_timeout_surfaces_as_io_error() {
        let (_left, right) = RpcStream::pair().unwrap();
        let cfg = FrameConfig {
            read_timeout: Some(std::time::Duration::from_millis(10)),
            ..FrameConfig::default()
        };
        let mut reader = FrameReader::with_config_stream(right, cfg).unwrap();
        let err = reader.read_message().unwrap_err();
        assert!(matches!(
            err,
            FrameError::Io(ref e)
                if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut
        ));
    }

    struct ByteByByteReader {
        bytes: Vec<u8>,
        pos: usize,
    }

    impl Read for ByteByByteReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pos >= self.bytes.len() || buf.is_empty() {
                return Ok(0);
            }
            buf[0] = self.bytes[self.pos];
            self.pos += 1;
            Ok(1)
        }
    }

    struct InterruptedOnce {
        interrupted: bool,
        inner: Cursor<Vec<u8>>,
    }

    impl Read for InterruptedOnce {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if !self.interrupted {
                self.interrupted = true;
                return Err(std::io::Error::from(ErrorKind::Interrupted));
            }
            self.inner.read(buf)
        }
    }
}
