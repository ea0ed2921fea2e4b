//! Serve an `Arith` service on a loopback port and call it concurrently.
//!
//! Run with:
//!   cargo run --example arith
//!
//! The same calls work against the CLI server:
//!   cargo run --features cli -- serve tcp@127.0.0.1:9000
//!   cargo run --features cli -- call tcp@127.0.0.1:9000 Arith.Sum --json '{"num1":2,"num2":3}'

use std::sync::Arc;
use std::thread;

use muxrpc::peer::{Client, ConnectOptions, Server, Service, ServiceRegistry};
use muxrpc::transport::{Endpoint, RpcListener};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct Args {
    num1: i64,
    num2: i64,
}

fn sum(args: Args) -> Result<i64, String> {
    Ok(args.num1 + args.num2)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let arith = Service::new("Arith").method("Sum", sum);
    let server = Server::new(ServiceRegistry::new().with_service(arith)?);

    let listener = RpcListener::bind(&Endpoint::parse("tcp@127.0.0.1:0")?)?;
    let handle = server.spawn(listener)?;
    eprintln!("Listening on {}", handle.local_endpoint());

    let client = Arc::new(Client::dial(handle.local_endpoint(), ConnectOptions::default())?);

    // Ten callers share one connection.
    let callers: Vec<_> = (0..10i64)
        .map(|i| {
            let client = Arc::clone(&client);
            let args = Args {
                num1: i,
                num2: i * i,
            };
            thread::spawn(move || client.call::<_, i64>("Arith.Sum", &args))
        })
        .collect();

    for (i, caller) in callers.into_iter().enumerate() {
        let sum = caller.join().map_err(|_| "caller panicked")??;
        eprintln!("{i} + {} = {sum}", i * i);
    }

    handle.stop();
    Ok(())
}
