use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use muxrpc_peer::{Server, ServerConfig, Service, ServiceRegistry};
use muxrpc_transport::RpcListener;
use serde::{Deserialize, Serialize};

use crate::cmd::{parse_duration, parse_endpoint, ServeArgs};
use crate::exit::{rpc_error, transport_error, CliError, CliResult, INTERNAL, SUCCESS, USAGE};
use crate::output::{print_listening, ListeningOutput, OutputFormat};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Serialize, Deserialize)]
pub struct ArithArgs {
    pub num1: i64,
    pub num2: i64,
}

pub fn run(args: ServeArgs, format: OutputFormat) -> CliResult<i32> {
    if args.workers == 0 {
        return Err(CliError::new(USAGE, "--workers must be at least 1"));
    }
    let endpoint = parse_endpoint(&args.endpoint)?;
    let config = ServerConfig {
        workers: args.workers,
        default_handle_timeout: parse_duration(&args.handle_timeout)?,
        ..ServerConfig::default()
    };

    let registry = arith_registry().map_err(|err| rpc_error("register failed", err))?;
    let server = Server::with_config(registry, config);
    let listener = RpcListener::bind(&endpoint).map_err(|err| transport_error("bind failed", err))?;

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let handle = server
        .spawn(listener)
        .map_err(|err| rpc_error("serve failed", err))?;
    print_listening(
        &ListeningOutput {
            event: "listening",
            endpoint: handle.local_endpoint().to_string(),
            methods: server.registry().list(),
            workers: server.config().workers,
            handle_timeout_ms: server.config().default_handle_timeout.as_millis(),
        },
        format,
    );

    while running.load(Ordering::SeqCst) {
        thread::sleep(POLL_INTERVAL);
    }
    tracing::info!("interrupted; stopping server");
    handle.stop();

    Ok(SUCCESS)
}

/// The demo service: `Arith.Sum`, `Arith.Mul`, `Arith.Div`, and `Arith.Sleep`.
pub fn arith_registry() -> muxrpc_peer::Result<ServiceRegistry> {
    let arith = Service::new("Arith")
        .method("Sum", sum)
        .method("Mul", mul)
        .method("Div", div)
        .method("Sleep", sleep);

    ServiceRegistry::new().with_service(arith)
}

fn sum(args: ArithArgs) -> Result<i64, &'static str> {
    args.num1.checked_add(args.num2).ok_or("integer overflow")
}

fn mul(args: ArithArgs) -> Result<i64, &'static str> {
    args.num1.checked_mul(args.num2).ok_or("integer overflow")
}

fn div(args: ArithArgs) -> Result<i64, &'static str> {
    if args.num2 == 0 {
        return Err("divide by zero");
    }
    args.num1.checked_div(args.num2).ok_or("integer overflow")
}

fn sleep(millis: u64) -> Result<u64, &'static str> {
    thread::sleep(Duration::from_millis(millis));
    Ok(millis)
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
