//! Multiplexed request/response RPC over a single stream.
//!
//! Many concurrent calls share one TCP, Unix-domain, or HTTP-CONNECT
//! connection. Each call is matched to its response by a per-connection
//! sequence number, so responses may arrive in any order.
//!
//! # Crate Structure
//!
//! - [`transport`]: endpoints, listeners, dialing, and the CONNECT tunnel
//! - [`frame`]: the length-prefixed envelope, buffer pool, and body codecs
//! - [`peer`]: handshake, client multiplexer, server pipeline, and discovery
//!   (behind the `peer` feature)
//!
//! ```no_run
//! use muxrpc::peer::{Client, ConnectOptions};
//! use muxrpc::transport::Endpoint;
//!
//! let endpoint = Endpoint::parse("tcp@127.0.0.1:9000")?;
//! let client = Client::dial(&endpoint, ConnectOptions::default())?;
//! let sum: i64 = client.call("Arith.Sum", &(2i64, 3i64))?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

/// Re-export transport types.
pub mod transport {
    pub use muxrpc_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use muxrpc_frame::*;
}

/// Re-export peer types (requires `peer` feature).
#[cfg(feature = "peer")]
pub mod peer {
    pub use muxrpc_peer::*;
}
