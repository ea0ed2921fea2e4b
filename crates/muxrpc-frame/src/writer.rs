use std::io::{ErrorKind, Write};

use bytes::BytesMut;
use muxrpc_transport::RpcStream;
use tracing::trace;

use crate::envelope::{encode_frame, FrameConfig, Message};
use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Writes complete envelopes to any `Write` stream.
///
/// A frame is assembled in memory and handed to the stream in one pass, so a
/// writer that is used by one thread at a time never interleaves frames.
pub struct FrameWriter<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
}

impl<T: Write> FrameWriter<T> {
    /// Create a new frame writer with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame writer with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Encode and write one message (blocking).
    pub fn write_message(&mut self, message: &Message) -> Result<()> {
        self.buf.clear();
        encode_frame(message, self.config.max_frame_size, &mut self.buf)?;

        let mut offset = 0usize;
        while offset < self.buf.len() {
            match self.inner.write(&self.buf[offset..]) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => offset += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
        trace!(
            seq = message.header.seq,
            method = %message.header.method,
            len = self.buf.len(),
            "wrote frame"
        );

        // Don't pin a huge buffer after a one-off large frame.
        if self.buf.capacity() > self.config.pool_buffer_size.max(INITIAL_BUFFER_CAPACITY) * 4 {
            self.buf = BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY);
        }

        self.flush()
    }

    /// Flush the underlying stream.
    pub fn flush(&mut self) -> Result<()> {
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Update maximum frame size for subsequent writes.
    pub fn set_max_frame_size(&mut self, max_frame_size: usize) {
        self.config.max_frame_size = max_frame_size;
    }

    /// Current frame writer configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl FrameWriter<RpcStream> {
    /// Create a frame writer for `RpcStream` and apply write timeout from config.
    pub fn with_config_stream(inner: RpcStream, config: FrameConfig) -> Result<Self> {
        inner.set_write_timeout(config.write_timeout)?;
        Ok(Self::with_config(inner, config))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use bytes::Bytes;

    use super::*;
    use crate::envelope::{decode_frame, Header};

    fn written(writer: FrameWriter<Cursor<Vec<u8>>>) -> BytesMut {
        BytesMut::from(writer.into_inner().into_inner().as_slice())
    }

    #[test]
    fn writes_length_prefixed_envelopes() {
        let mut writer = FrameWriter::new(Cursor::new(Vec::new()));
        let first = Message::new(Header::request("A.One", 1), Bytes::from_static(b"1"));
        let mut second = Message::new(Header::request("A.Two", 2), Bytes::new());
        second.header.error = "failed".to_string();
        second.header.trace_id = "t-2".to_string();

        writer.write_message(&first).unwrap();
        writer.write_message(&second).unwrap();

        let mut wire = written(writer);
        assert_eq!(decode_frame(&mut wire, usize::MAX).unwrap(), Some(first));
        assert_eq!(decode_frame(&mut wire, usize::MAX).unwrap(), Some(second));
        assert!(wire.is_empty());
    }

    #[test]
    fn frame_too_large_rejected_without_writing() {
        let cfg = FrameConfig {
            max_frame_size: 16,
            ..FrameConfig::default()
        };
        let mut writer = FrameWriter::with_config(Cursor::new(Vec::new()), cfg);
        let big = Message::new(Header::request("A.B", 1), vec![0u8; 64]);

        let err = writer.write_message(&big).unwrap_err();
        assert!(matches!(err, FrameError::FrameTooLarge { .. }));
        assert!(written(writer).is_empty());
    }

    #[test]
    fn zero_length_write_is_connection_closed() {
        let mut writer = FrameWriter::new(ZeroWriter);
        let err = writer
            .write_message(&Message::new(Header::request("A.B", 1), Bytes::new()))
            .unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[test]
    fn flush_propagates() {
        let sink = FlushTrackingWriter::default();
        let flag = Arc::clone(&sink.flushed);
        let mut writer = FrameWriter::new(sink);
        writer
            .write_message(&Message::new(Header::request("A.B", 1), Bytes::new()))
            .unwrap();
        assert!(flag.load(Ordering::SeqCst));
    }

    struct ZeroWriter;

    impl Write for ZeroWriter {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Ok(0)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct FlushTrackingWriter {
        flushed: Arc<AtomicBool>,
    }

    impl Write for FlushTrackingWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            self.flushed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }
}
