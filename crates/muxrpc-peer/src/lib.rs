//! Multiplexed RPC over a single connection.
//!
//! This is the "just works" layer. A [`Client`] carries many concurrent calls
//! over one stream, matched to responses by sequence number. A [`Server`]
//! runs a bounded reader/worker/writer pipeline per connection over a
//! [`ServiceRegistry`] of typed handlers. [`XClient`] spreads calls over the
//! addresses a [`Discovery`] hands out.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod client;
pub mod discovery;
pub mod error;
pub mod handshake;
pub mod server;
pub mod service;
pub mod xclient;

pub use client::{Call, CallContext, CancelToken, Client};
pub use discovery::{Discovery, SelectMode, StaticDiscovery};
pub use error::{Result, RpcError};
pub use handshake::{
    accept_handshake, send_handshake, ConnectOptions, Negotiated, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_HANDLE_TIMEOUT, MAGIC_NUMBER,
};
pub use server::{Server, ServerConfig, ServerHandle};
pub use service::{Invocation, MethodHandler, Service, ServiceRegistry};
pub use xclient::XClient;

/// Lock a mutex, recovering the data if a panicking thread poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
