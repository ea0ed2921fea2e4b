//! Server side: accept loop plus one request pipeline per connection.
//!
//! Each connection runs one reader (the connection thread itself), a fixed
//! pool of workers, and one writer thread. The reader resolves and decodes
//! requests and pushes them onto a bounded queue; when every worker is busy
//! the push blocks and the socket stops being read. Workers run each handler
//! on its own thread under the negotiated handle timeout. The writer is the
//! only thread that writes to the socket.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use muxrpc_frame::{FrameConfig, FrameError, FrameReader, FrameWriter, Header, Message};
use muxrpc_transport::{tunnel, Endpoint, RpcListener, RpcStream};
use tracing::{debug, error, info, warn};

use crate::error::{Result, RpcError};
use crate::handshake::{accept_handshake, Negotiated, DEFAULT_HANDLE_TIMEOUT};
use crate::lock;
use crate::service::{Invocation, ServiceRegistry};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Server tuning.
///
/// Handler timeouts do not cancel the handler: the worker answers with a
/// timeout error and moves on while the handler thread keeps running until it
/// returns. Handlers that never return leak one thread per timed-out request.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Worker threads per connection. Default: 4.
    pub workers: usize,
    /// Decoded requests buffered ahead of the workers. Default: 64.
    pub request_queue: usize,
    /// Responses buffered ahead of the writer. Default: 64.
    pub response_queue: usize,
    /// Bound on tunnel upgrade plus handshake. Default: 5s.
    pub handshake_timeout: Duration,
    /// Handle timeout used when the client sends zero. Default: 3s.
    pub default_handle_timeout: Duration,
    pub frame: FrameConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            request_queue: 64,
            response_queue: 64,
            handshake_timeout: Duration::from_secs(5),
            default_handle_timeout: DEFAULT_HANDLE_TIMEOUT,
            frame: FrameConfig::default(),
        }
    }
}

/// Serves a [`ServiceRegistry`] over any number of connections.
///
/// Cloning is cheap; clones share the registry.
#[derive(Clone)]
pub struct Server {
    registry: Arc<ServiceRegistry>,
    config: Arc<ServerConfig>,
}

impl Server {
    pub fn new(registry: ServiceRegistry) -> Self {
        Self::with_config(registry, ServerConfig::default())
    }

    pub fn with_config(registry: ServiceRegistry, config: ServerConfig) -> Self {
        Self {
            registry: Arc::new(registry),
            config: Arc::new(config),
        }
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Serve one already established stream until it closes.
    ///
    /// Runs the handshake, then the request pipeline. Returns the handshake
    /// error if the client was rejected.
    pub fn serve_conn(&self, stream: RpcStream) -> Result<()> {
        self.serve_stream(stream, false)
    }

    /// Accept connections forever, one thread per connection.
    pub fn serve(&self, listener: &RpcListener) -> Result<()> {
        let tracker = Arc::new(ConnTracker::default());
        self.accept_loop(listener, &tracker);
        Ok(())
    }

    /// Run the accept loop on a background thread.
    pub fn spawn(&self, listener: RpcListener) -> Result<ServerHandle> {
        let endpoint = listener.endpoint().clone();
        let tracker = Arc::new(ConnTracker::default());

        let accept = {
            let server = self.clone();
            let tracker = Arc::clone(&tracker);
            thread::Builder::new()
                .name("muxrpc-accept".to_string())
                .spawn(move || server.accept_loop(&listener, &tracker))
                .map_err(|err| RpcError::Transport(err.to_string()))?
        };

        Ok(ServerHandle {
            endpoint,
            tracker,
            accept: Some(accept),
        })
    }

    fn accept_loop(&self, listener: &RpcListener, tracker: &Arc<ConnTracker>) {
        let tunneled = listener.requires_tunnel();
        loop {
            let stream = match listener.accept() {
                Ok(stream) => stream,
                Err(err) => {
                    if tracker.stopping.load(Ordering::Acquire) {
                        break;
                    }
                    warn!(endpoint = %listener.endpoint(), error = %err, "accept failed");
                    thread::sleep(ACCEPT_BACKOFF);
                    continue;
                }
            };
            if tracker.stopping.load(Ordering::Acquire) {
                break;
            }

            let Some(id) = tracker.track(&stream) else {
                if tracker.stopping.load(Ordering::Acquire) {
                    break;
                }
                continue;
            };
            let server = self.clone();
            let conn_tracker = Arc::clone(tracker);
            let spawned = thread::Builder::new()
                .name("muxrpc-conn".to_string())
                .spawn(move || {
                    let _ = server.serve_stream(stream, tunneled);
                    conn_tracker.untrack(id);
                });
            if let Err(err) = spawned {
                error!(error = %err, "failed to spawn connection thread");
                tracker.untrack(id);
            }
        }
        debug!(endpoint = %listener.endpoint(), "accept loop finished");
    }

    fn serve_stream(&self, mut stream: RpcStream, tunneled: bool) -> Result<()> {
        let peer = stream.peer_label();
        let negotiated = match self.bootstrap(&mut stream, tunneled) {
            Ok(negotiated) => negotiated,
            Err(err) => {
                warn!(%peer, error = %err, "rejecting connection");
                let _ = stream.shutdown();
                return Err(err);
            }
        };
        info!(
            %peer,
            codec = %negotiated.codec,
            handle_timeout = ?negotiated.handle_timeout,
            "accepted connection"
        );
        self.run_pipeline(stream, negotiated, peer)
    }

    fn bootstrap(&self, stream: &mut RpcStream, tunneled: bool) -> Result<Negotiated> {
        let limit = Some(self.config.handshake_timeout).filter(|limit| !limit.is_zero());
        stream.set_read_timeout(limit)?;
        stream.set_write_timeout(limit)?;
        if tunneled {
            tunnel::accept_tunnel(stream)?;
        }
        let negotiated = accept_handshake(stream, self.config.default_handle_timeout)?;
        stream.set_read_timeout(self.config.frame.read_timeout)?;
        stream.set_write_timeout(self.config.frame.write_timeout)?;
        Ok(negotiated)
    }

    fn run_pipeline(&self, stream: RpcStream, negotiated: Negotiated, peer: String) -> Result<()> {
        let mut reader = FrameReader::with_config(stream.try_clone()?, self.config.frame.clone());
        let writer = FrameWriter::with_config(stream.try_clone()?, self.config.frame.clone());

        let (req_tx, req_rx) = mpsc::sync_channel::<Request>(self.config.request_queue.max(1));
        let (resp_tx, resp_rx) = mpsc::sync_channel::<Outbound>(self.config.response_queue.max(1));
        let closing = Arc::new(AtomicBool::new(false));

        let writer_thread = {
            let stream = stream.try_clone()?;
            let peer = peer.clone();
            thread::Builder::new()
                .name("muxrpc-conn-writer".to_string())
                .spawn(move || write_loop(writer, resp_rx, stream, peer))
                .map_err(|err| RpcError::Transport(err.to_string()))?
        };

        let req_rx = Arc::new(Mutex::new(req_rx));
        for _ in 0..self.config.workers.max(1) {
            let worker = Worker {
                requests: Arc::clone(&req_rx),
                responses: resp_tx.clone(),
                closing: Arc::clone(&closing),
                handle_timeout: negotiated.handle_timeout,
            };
            if let Err(err) = thread::Builder::new()
                .name("muxrpc-conn-worker".to_string())
                .spawn(move || worker.run())
            {
                error!(%peer, error = %err, "failed to spawn worker");
            }
        }

        let codec = negotiated.codec;
        let cause = loop {
            let message = match reader.read_message() {
                Ok(message) => message,
                Err(err) => break err,
            };
            let Message { header, body } = message;

            let handler = match self.registry.resolve(&header.method) {
                Ok(handler) => handler,
                Err(err) => {
                    warn!(
                        %peer,
                        seq = header.seq,
                        method = %header.method,
                        error = %err,
                        "unresolved method"
                    );
                    let reply = error_response(&header, err.to_string());
                    if resp_tx.send(Outbound::Response(reply)).is_err() {
                        break FrameError::ConnectionClosed;
                    }
                    continue;
                }
            };

            match handler.prepare(codec, &body) {
                Ok(invocation) => {
                    if req_tx.send(Request { header, invocation }).is_err() {
                        break FrameError::ConnectionClosed;
                    }
                }
                Err(err) => {
                    error!(
                        %peer,
                        seq = header.seq,
                        method = %header.method,
                        error = %err,
                        "undecodable arguments; closing connection"
                    );
                    let text = format!("rpc server: read argv err: {err}");
                    let _ = resp_tx.send(Outbound::Response(error_response(&header, text)));
                    break FrameError::ConnectionClosed;
                }
            }
        };

        if cause.is_disconnect() {
            debug!(%peer, reason = %cause, "connection reader finished");
        } else {
            error!(%peer, error = %cause, "connection reader failed");
        }

        closing.store(true, Ordering::Release);
        drop(req_tx);
        let _ = resp_tx.send(Outbound::Shutdown);
        drop(resp_tx);
        let _ = writer_thread.join();
        info!(%peer, "connection closed");
        Ok(())
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("services", &self.registry.list())
            .field("config", &self.config)
            .finish()
    }
}

struct Request {
    header: Header,
    invocation: Invocation,
}

enum Outbound {
    Response(Message),
    Shutdown,
}

fn error_response(request: &Header, error: String) -> Message {
    let mut header = request.reply();
    header.error = error;
    Message::new(header, Bytes::new())
}

struct Worker {
    requests: Arc<Mutex<Receiver<Request>>>,
    responses: SyncSender<Outbound>,
    closing: Arc<AtomicBool>,
    handle_timeout: Duration,
}

impl Worker {
    fn run(self) {
        loop {
            let request = match lock(&self.requests).recv() {
                Ok(request) => request,
                Err(_) => break,
            };
            if self.closing.load(Ordering::Acquire) {
                debug!(seq = request.header.seq, "dropping request after close");
                continue;
            }

            let response = self.handle(request);
            if self.closing.load(Ordering::Acquire) {
                debug!(seq = response.header.seq, "dropping response computed after close");
                continue;
            }
            if self.responses.send(Outbound::Response(response)).is_err() {
                break;
            }
        }
    }

    fn handle(&self, request: Request) -> Message {
        let Request { header, invocation } = request;
        let (done_tx, done_rx) = mpsc::sync_channel(1);

        let spawned = thread::Builder::new()
            .name("muxrpc-handler".to_string())
            .spawn(move || {
                let _ = done_tx.send(invocation());
            });
        if let Err(err) = spawned {
            return error_response(&header, format!("rpc server: spawn handler: {err}"));
        }

        match done_rx.recv_timeout(self.handle_timeout) {
            Ok(Ok(body)) => Message::new(header.reply(), body),
            Ok(Err(err)) => {
                debug!(
                    seq = header.seq,
                    method = %header.method,
                    error = %err,
                    "handler returned error"
                );
                error_response(&header, err)
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    seq = header.seq,
                    method = %header.method,
                    timeout = ?self.handle_timeout,
                    "handler timed out"
                );
                let text = format!(
                    "rpc server: request handle timeout {:?}",
                    self.handle_timeout
                );
                error_response(&header, text)
            }
            Err(RecvTimeoutError::Disconnected) => {
                warn!(seq = header.seq, method = %header.method, "handler panicked");
                error_response(&header, "rpc server: handler panicked".to_string())
            }
        }
    }
}

fn write_loop(
    mut writer: FrameWriter<RpcStream>,
    responses: Receiver<Outbound>,
    stream: RpcStream,
    peer: String,
) {
    let mut healthy = true;
    while let Ok(Outbound::Response(message)) = responses.recv() {
        write_response(&mut writer, &message, &mut healthy, &stream, &peer);
    }
    // Close requested: flush what is already queued, then hang up.
    while let Ok(outbound) = responses.try_recv() {
        if let Outbound::Response(message) = outbound {
            write_response(&mut writer, &message, &mut healthy, &stream, &peer);
        }
    }
    let _ = stream.shutdown();
}

fn write_response(
    writer: &mut FrameWriter<RpcStream>,
    message: &Message,
    healthy: &mut bool,
    stream: &RpcStream,
    peer: &str,
) {
    if !*healthy {
        return;
    }
    let result = match writer.write_message(message) {
        Err(FrameError::FrameTooLarge { size, max }) => {
            warn!(%peer, seq = message.header.seq, size, max, "reply too large");
            let text = format!("rpc server: reply of {size} bytes exceeds limit of {max}");
            writer.write_message(&error_response(&message.header, text))
        }
        other => other,
    };
    if let Err(err) = result {
        error!(%peer, seq = message.header.seq, error = %err, "write failed; closing connection");
        *healthy = false;
        let _ = stream.shutdown();
    }
}

#[derive(Default)]
struct ConnTracker {
    stopping: AtomicBool,
    next_id: AtomicU64,
    conns: Mutex<HashMap<u64, RpcStream>>,
}

impl ConnTracker {
    fn track(&self, stream: &RpcStream) -> Option<u64> {
        let clone = match stream.try_clone() {
            Ok(clone) => clone,
            Err(err) => {
                warn!(error = %err, "failed to clone accepted stream");
                return None;
            }
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.conns).insert(id, clone);
        // Accepted while stop was draining the table: nobody else will close it.
        if self.stopping.load(Ordering::Acquire) {
            self.untrack(id);
            let _ = stream.shutdown();
            return None;
        }
        Some(id)
    }

    fn untrack(&self, id: u64) {
        lock(&self.conns).remove(&id);
    }

    fn shutdown_all(&self) {
        for (_, stream) in lock(&self.conns).drain() {
            let _ = stream.shutdown();
        }
    }

    fn live(&self) -> usize {
        lock(&self.conns).len()
    }
}

/// Handle to a server started with [`Server::spawn`]. Dropping it stops the
/// server.
pub struct ServerHandle {
    endpoint: Endpoint,
    tracker: Arc<ConnTracker>,
    accept: Option<JoinHandle<()>>,
}

impl ServerHandle {
    /// The endpoint actually bound, with any `:0` port resolved.
    pub fn local_endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Connections currently being served.
    pub fn connections(&self) -> usize {
        self.tracker.live()
    }

    /// Stop accepting, close every open connection, and wait for the accept
    /// loop to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.tracker.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        self.tracker.shutdown_all();

        // Wake the blocking accept with a throwaway connection.
        let wake = match &self.endpoint {
            Endpoint::Http(addr) => Endpoint::Tcp(addr.clone()),
            other => other.clone(),
        };
        if let Err(err) = muxrpc_transport::connect(&wake, Some(Duration::from_secs(1))) {
            debug!(endpoint = %self.endpoint, error = %err, "wake-up dial failed");
        }

        if let Some(accept) = self.accept.take() {
            let _ = accept.join();
        }
        info!(endpoint = %self.endpoint, "server stopped");
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("endpoint", &self.endpoint)
            .field("connections", &self.connections())
            .finish()
    }
}
