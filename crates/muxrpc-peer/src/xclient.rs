//! Discovery-driven client over a pool of multiplexed connections.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

use muxrpc_transport::Endpoint;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::client::{CallContext, CancelToken, Client};
use crate::discovery::{no_servers, Discovery, SelectMode};
use crate::error::{Result, RpcError};
use crate::handshake::ConnectOptions;
use crate::lock;

/// Picks a server per call through a [`Discovery`] and keeps one [`Client`]
/// per address.
pub struct XClient {
    discovery: Arc<dyn Discovery>,
    mode: SelectMode,
    options: ConnectOptions,
    clients: Mutex<HashMap<String, Arc<Client>>>,
}

impl XClient {
    pub fn new(discovery: Arc<dyn Discovery>, mode: SelectMode, options: ConnectOptions) -> Self {
        Self {
            discovery,
            mode,
            options,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Call `method` on one server chosen by the select mode.
    pub fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.call_with(&CallContext::default(), service_method, args)
    }

    pub fn call_with<A, R>(&self, ctx: &CallContext, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let service = service_name(service_method);
        let addr = self.discovery.get(service, self.mode)?;
        self.call_addr(&addr, ctx, service_method, args)
    }

    /// Call `method` on every known server in parallel.
    ///
    /// The first error cancels the remaining calls and is returned. Otherwise
    /// the first reply to arrive is returned.
    pub fn broadcast<A, R>(&self, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize + Sync + ?Sized,
        R: DeserializeOwned + Send,
    {
        let addrs = self.discovery.get_all(service_name(service_method))?;
        if addrs.is_empty() {
            return Err(no_servers());
        }

        let token = CancelToken::new();
        let ctx = CallContext::new().with_cancel(token.clone());
        let outcome: Mutex<(Option<RpcError>, Option<R>)> = Mutex::new((None, None));

        thread::scope(|scope| {
            for addr in &addrs {
                let (ctx, token, outcome) = (&ctx, &token, &outcome);
                scope.spawn(move || {
                    let result = self.call_addr::<A, R>(addr, ctx, service_method, args);
                    let mut outcome = lock(outcome);
                    match result {
                        Err(err) if outcome.0.is_none() => {
                            debug!(
                                %addr,
                                error = %err,
                                "broadcast call failed; cancelling the rest"
                            );
                            outcome.0 = Some(err);
                            token.cancel();
                        }
                        Ok(reply) if outcome.1.is_none() => outcome.1 = Some(reply),
                        _ => {}
                    }
                });
            }
        });

        let (err, reply) = outcome
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match (err, reply) {
            (Some(err), _) => Err(err),
            (None, Some(reply)) => Ok(reply),
            (None, None) => Err(RpcError::Shutdown),
        }
    }

    /// Close every cached connection.
    pub fn close(&self) {
        for (addr, client) in lock(&self.clients).drain() {
            if client.close().is_err() {
                debug!(%addr, "connection already closed");
            }
        }
    }

    /// Addresses with a cached connection.
    pub fn connected(&self) -> Vec<String> {
        let mut addrs: Vec<String> = lock(&self.clients).keys().cloned().collect();
        addrs.sort();
        addrs
    }

    fn call_addr<A, R>(
        &self,
        addr: &str,
        ctx: &CallContext,
        service_method: &str,
        args: &A,
    ) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let client = self.client(addr)?;
        let started = Instant::now();
        let result = client.call_with(ctx, service_method, args);
        if result.is_ok() {
            let nanos = u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX);
            self.discovery.observe(addr, nanos);
        }
        result
    }

    fn client(&self, addr: &str) -> Result<Arc<Client>> {
        let mut clients = lock(&self.clients);
        if let Some(client) = clients.get(addr) {
            if client.is_available() {
                return Ok(Arc::clone(client));
            }
            warn!(%addr, "cached connection unavailable; redialing");
            clients.remove(addr);
        }

        let endpoint = Endpoint::parse(addr)?;
        let client = Arc::new(Client::dial(&endpoint, self.options.clone())?);
        clients.insert(addr.to_string(), Arc::clone(&client));
        Ok(client)
    }
}

impl Drop for XClient {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for XClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XClient")
            .field("mode", &self.mode)
            .field("connected", &self.connected())
            .finish()
    }
}

fn service_name(service_method: &str) -> &str {
    service_method
        .rsplit_once('.')
        .map_or(service_method, |(service, _)| service)
}
