//! Byte-stream transports for muxrpc.
//!
//! Provides a unified stream type over the transports an RPC connection can
//! run on:
//! - TCP
//! - Unix domain sockets (Linux/macOS)
//! - HTTP CONNECT tunnels, upgraded to a raw byte stream before the handshake
//!
//! This is the lowest layer of muxrpc. Everything else builds on top of
//! the [`RpcStream`] type provided here; once a stream exists, the upper
//! layers do not care how it was obtained.

pub mod endpoint;
pub mod error;
pub mod listener;
pub mod stream;
pub mod tunnel;

pub use endpoint::Endpoint;
pub use error::{Result, TransportError};
pub use listener::RpcListener;
pub use stream::{connect, RpcStream};
