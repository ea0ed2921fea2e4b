//! Length-prefixed RPC envelopes for muxrpc.
//!
//! Every message on the wire is one envelope behind a 4-byte big-endian
//! length prefix:
//! - method name (u32 BE length + UTF-8 bytes)
//! - sequence number (u64 BE)
//! - error string (u32 BE length, bytes only when non-empty)
//! - body (u32 BE length + opaque bytes produced by a [`Codec`])
//! - trace id (optional trailing u32 BE length + bytes, omitted when empty)
//!
//! [`FrameReader`] reads a frame with exactly two reads, drawing the buffer
//! from a bounded [`BufferPool`] when the frame fits.

#[cfg(feature = "async")]
pub mod async_codec;
pub mod codec;
pub mod envelope;
pub mod error;
pub mod pool;
pub mod reader;
pub mod writer;

#[cfg(feature = "async")]
pub use async_codec::EnvelopeCodec;
pub use codec::Codec;
pub use envelope::{
    decode_frame, encode_frame, FrameConfig, Header, Message, DEFAULT_MAX_FRAME_SIZE,
    LENGTH_PREFIX_SIZE,
};
pub use error::{CodecError, FrameError, Result};
pub use pool::{BufferPool, PooledBuf};
pub use reader::FrameReader;
pub use writer::FrameWriter;
