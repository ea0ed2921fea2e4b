//! Client side of a connection: many concurrent calls over one stream.
//!
//! Outgoing frames are serialized by the writer lock. A single receive thread
//! reads responses and hands each one to the pending call with the same
//! sequence number. Every registered call is completed exactly once: by its
//! response, by cancellation or timeout on the caller's side, or with
//! [`RpcError::Shutdown`] when the connection goes away.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use muxrpc_frame::{Codec, FrameConfig, FrameError, FrameReader, FrameWriter, Header, Message};
use muxrpc_transport::{Endpoint, RpcStream};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{Result, RpcError};
use crate::handshake::{send_handshake, ConnectOptions};
use crate::lock;

type Completion = SyncSender<Result<Bytes>>;

struct State {
    next_seq: u64,
    pending: HashMap<u64, Completion>,
}

struct Inner {
    writer: Mutex<FrameWriter<RpcStream>>,
    state: Mutex<State>,
    closing: AtomicBool,
    codec: Codec,
    stream: RpcStream,
    peer: String,
}

impl Inner {
    fn register_call(&self, completion: Completion) -> Result<u64> {
        let mut state = lock(&self.state);
        if self.closing.load(Ordering::Acquire) {
            return Err(RpcError::Shutdown);
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.pending.insert(seq, completion);
        Ok(seq)
    }

    fn remove_call(&self, seq: u64) -> Option<Completion> {
        lock(&self.state).pending.remove(&seq)
    }

    fn send(
        &self,
        method: &str,
        trace_id: &str,
        body: Vec<u8>,
        completion: Completion,
    ) -> Result<u64> {
        let mut writer = lock(&self.writer);
        let seq = self.register_call(completion)?;

        let mut header = Header::request(method, seq);
        header.trace_id = trace_id.to_string();
        let message = Message::new(header, body);

        if let Err(err) = writer.write_message(&message) {
            drop(writer);
            // Nothing reached the socket for an oversized frame; otherwise the
            // stream may hold a partial frame and must not be reused.
            if !matches!(err, FrameError::FrameTooLarge { .. }) {
                warn!(peer = %self.peer, seq, error = %err, "write failed; closing connection");
                let _ = self.stream.shutdown();
            }
            self.remove_call(seq);
            return Err(err.into());
        }
        Ok(seq)
    }

    fn deliver(&self, message: Message) {
        let seq = message.header.seq;
        let Some(completion) = self.remove_call(seq) else {
            debug!(peer = %self.peer, seq, "discarding response for unknown or abandoned call");
            return;
        };
        let result = if message.header.is_error() {
            Err(RpcError::Application(message.header.error))
        } else {
            Ok(message.body)
        };
        // A cancellation may already occupy the slot; the caller sees only one.
        let _ = completion.try_send(result);
    }

    fn teardown(&self) {
        let pending = {
            let mut state = lock(&self.state);
            self.closing.store(true, Ordering::Release);
            std::mem::take(&mut state.pending)
        };
        if !pending.is_empty() {
            debug!(peer = %self.peer, count = pending.len(), "failing pending calls");
        }
        for completion in pending.into_values() {
            let _ = completion.try_send(Err(RpcError::Shutdown));
        }
        let _ = self.stream.shutdown();
    }
}

/// A multiplexed connection to one server.
///
/// `Client` is `Send + Sync`; share it behind an `Arc` to issue calls from
/// many threads. Dropping it closes the connection.
pub struct Client {
    inner: Arc<Inner>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Dial `endpoint` and perform the handshake.
    ///
    /// `options.connect_timeout` bounds both; zero means no bound.
    pub fn dial(endpoint: &Endpoint, options: ConnectOptions) -> Result<Self> {
        let limit = (!options.connect_timeout.is_zero()).then_some(options.connect_timeout);
        let started = Instant::now();

        let stream = muxrpc_transport::connect(endpoint, limit)?;
        if let Some(limit) = limit {
            let left = limit
                .checked_sub(started.elapsed())
                .filter(|left| !left.is_zero())
                .ok_or(RpcError::Timeout(limit))?;
            stream.set_write_timeout(Some(left))?;
        }

        let client = Self::with_stream(stream, &options)?;
        info!(%endpoint, codec = %client.codec(), "connected");
        Ok(client)
    }

    /// Run the handshake on an already connected stream and start the
    /// receive thread.
    pub fn with_stream(stream: RpcStream, options: &ConnectOptions) -> Result<Self> {
        Self::with_stream_config(stream, options, FrameConfig::default())
    }

    /// Like [`with_stream`](Self::with_stream) with explicit frame limits.
    pub fn with_stream_config(
        mut stream: RpcStream,
        options: &ConnectOptions,
        frame_config: FrameConfig,
    ) -> Result<Self> {
        let codec = send_handshake(&mut stream, options)?;
        stream.set_write_timeout(None)?;

        let peer = stream.peer_label();
        let reader = FrameReader::with_config(stream.try_clone()?, frame_config.clone());
        let writer = FrameWriter::with_config(stream.try_clone()?, frame_config);

        let inner = Arc::new(Inner {
            writer: Mutex::new(writer),
            state: Mutex::new(State {
                next_seq: 1,
                pending: HashMap::new(),
            }),
            closing: AtomicBool::new(false),
            codec,
            stream,
            peer,
        });

        let receiver = {
            let inner = Arc::clone(&inner);
            thread::Builder::new()
                .name("muxrpc-client-recv".to_string())
                .spawn(move || receive_loop(inner, reader))
                .map_err(|err| RpcError::Transport(err.to_string()))?
        };
        Ok(Self {
            inner,
            receiver: Mutex::new(Some(receiver)),
        })
    }

    /// Start a call and return immediately.
    ///
    /// The returned [`Call`] yields the reply; dropping it abandons the call.
    pub fn go<A, R>(&self, method: &str, args: &A) -> Result<Call<R>>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.start(method, "", args).map(|(call, _)| call)
    }

    /// Call `method` and wait for the reply.
    pub fn call<A, R>(&self, method: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.go(method, args)?.wait()
    }

    /// Call with trace id, deadline, and cancellation from `ctx`.
    ///
    /// Cancellation and deadlines only detach the caller; the server keeps
    /// working and its late response is discarded.
    pub fn call_with<A, R>(&self, ctx: &CallContext, method: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        if ctx.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
            return Err(RpcError::Cancelled);
        }
        let now = Instant::now();
        if ctx.deadline.is_some_and(|deadline| deadline <= now) {
            return Err(RpcError::Timeout(Duration::ZERO));
        }

        let (call, completion) = self.start::<A, R>(method, &ctx.trace_id, args)?;
        let _registration = ctx.cancel.as_ref().map(|token| token.register(completion));
        call.wait_until(ctx.deadline)
    }

    fn start<A, R>(&self, method: &str, trace_id: &str, args: &A) -> Result<(Call<R>, Completion)>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        if self.inner.closing.load(Ordering::Acquire) {
            return Err(RpcError::Shutdown);
        }
        let body = self.inner.codec.encode(args)?;
        let (tx, rx) = mpsc::sync_channel(1);
        let seq = self.inner.send(method, trace_id, body, tx.clone())?;
        debug!(seq, method, "call sent");

        Ok((
            Call {
                seq,
                started: Instant::now(),
                rx,
                inner: Arc::clone(&self.inner),
                _reply: PhantomData,
            },
            tx,
        ))
    }

    /// Close the connection. Pending calls fail with [`RpcError::Shutdown`].
    ///
    /// Only the first close succeeds; later ones return `Shutdown`.
    pub fn close(&self) -> Result<()> {
        if self
            .inner
            .closing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(RpcError::Shutdown);
        }
        debug!(peer = %self.inner.peer, "closing client");
        self.inner.stream.shutdown()?;
        Ok(())
    }

    /// Whether the connection can still accept calls.
    pub fn is_available(&self) -> bool {
        !self.inner.closing.load(Ordering::Acquire)
    }

    /// Codec negotiated for this connection.
    pub fn codec(&self) -> Codec {
        self.inner.codec
    }

    /// Calls awaiting a response.
    pub fn pending_calls(&self) -> usize {
        lock(&self.inner.state).pending.len()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        let _ = self.close();
        if let Some(handle) = lock(&self.receiver).take() {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("peer", &self.inner.peer)
            .field("codec", &self.inner.codec)
            .field("available", &self.is_available())
            .finish()
    }
}

fn receive_loop(inner: Arc<Inner>, mut reader: FrameReader<RpcStream>) {
    let cause = loop {
        match reader.read_message() {
            Ok(message) => inner.deliver(message),
            Err(err) => break err,
        }
    };

    if inner.closing.load(Ordering::Acquire) || cause.is_disconnect() {
        debug!(peer = %inner.peer, reason = %cause, "receive loop finished");
    } else {
        warn!(peer = %inner.peer, error = %cause, "receive loop failed");
    }
    inner.teardown();
}

/// A call in flight. Obtain the reply with [`Call::wait`].
///
/// Dropping a `Call` removes it from the pending table; a response that
/// arrives afterwards is discarded.
pub struct Call<R> {
    seq: u64,
    started: Instant,
    rx: Receiver<Result<Bytes>>,
    inner: Arc<Inner>,
    _reply: PhantomData<fn() -> R>,
}

impl<R: DeserializeOwned> Call<R> {
    /// Sequence number assigned to this call.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Block until the call completes.
    pub fn wait(self) -> Result<R> {
        self.wait_until(None)
    }

    /// Block for at most `timeout`.
    pub fn wait_timeout(self, timeout: Duration) -> Result<R> {
        let deadline = Instant::now() + timeout;
        self.wait_until(Some(deadline))
    }

    fn wait_until(self, deadline: Option<Instant>) -> Result<R> {
        let outcome = match deadline {
            None => self.rx.recv().unwrap_or(Err(RpcError::Shutdown)),
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now());
                match self.rx.recv_timeout(left) {
                    Ok(outcome) => outcome,
                    Err(RecvTimeoutError::Timeout) => {
                        debug!(seq = self.seq, "call timed out");
                        Err(RpcError::Timeout(self.started.elapsed()))
                    }
                    Err(RecvTimeoutError::Disconnected) => Err(RpcError::Shutdown),
                }
            }
        };

        let body = outcome?;
        self.inner.codec.decode(&body).map_err(RpcError::from)
    }
}

impl<R> Drop for Call<R> {
    fn drop(&mut self) {
        if self.inner.remove_call(self.seq).is_some() {
            debug!(seq = self.seq, "call abandoned");
        }
    }
}

impl<R> std::fmt::Debug for Call<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call").field("seq", &self.seq).finish()
    }
}

/// Per-call trace id, deadline, and cancellation.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub trace_id: String,
    pub deadline: Option<Instant>,
    pub cancel: Option<CancelToken>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Cancels every call currently waiting under it. Cheap to clone.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    next_id: AtomicU64,
    waiters: Mutex<HashMap<u64, Completion>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake every waiting call with [`RpcError::Cancelled`]. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        let waiters = std::mem::take(&mut *lock(&self.inner.waiters));
        for completion in waiters.into_values() {
            let _ = completion.try_send(Err(RpcError::Cancelled));
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    fn register(&self, completion: Completion) -> Registration {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.waiters).insert(id, completion);
        // Close the window between the caller's check and the insert.
        if self.is_cancelled() {
            self.cancel();
        }
        Registration {
            token: self.clone(),
            id,
        }
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

struct Registration {
    token: CancelToken,
    id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        lock(&self.token.inner.waiters).remove(&self.id);
    }
}
