//! Three servers behind a static discovery list: one call per select mode,
//! then a broadcast to all of them.
//!
//! Run with:
//!   cargo run --example broadcast

use std::sync::Arc;

use muxrpc::peer::{
    ConnectOptions, Discovery, SelectMode, Server, ServerHandle, Service, ServiceRegistry,
    StaticDiscovery, XClient,
};
use muxrpc::transport::{Endpoint, RpcListener};

fn start(id: usize) -> Result<ServerHandle, Box<dyn std::error::Error>> {
    let whoami = Service::new("Node").method("Id", move |_: ()| Ok::<_, String>(id));
    let server = Server::new(ServiceRegistry::new().with_service(whoami)?);
    let listener = RpcListener::bind(&Endpoint::parse("tcp@127.0.0.1:0")?)?;
    Ok(server.spawn(listener)?)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let handles = (0..3).map(start).collect::<Result<Vec<_>, _>>()?;
    let addrs: Vec<String> = handles
        .iter()
        .map(|handle| handle.local_endpoint().to_string())
        .collect();
    let discovery: Arc<dyn Discovery> = Arc::new(StaticDiscovery::new(addrs));

    for mode in [
        SelectMode::Random,
        SelectMode::RoundRobin,
        SelectMode::LeastLoaded,
    ] {
        let xclient = XClient::new(Arc::clone(&discovery), mode, ConnectOptions::default());
        let picks = (0..6)
            .map(|_| xclient.call::<_, usize>("Node.Id", &()))
            .collect::<Result<Vec<_>, _>>()?;
        eprintln!("{mode}: {picks:?}");
    }

    let xclient = XClient::new(discovery, SelectMode::Random, ConnectOptions::default());
    let first: usize = xclient.broadcast("Node.Id", &())?;
    eprintln!("broadcast: first reply from node {first}");

    for handle in handles {
        handle.stop();
    }
    Ok(())
}
