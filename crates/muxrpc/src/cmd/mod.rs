use std::time::Duration;

use clap::{Args, Subcommand};
use muxrpc_transport::Endpoint;

use crate::exit::{transport_error, CliError, CliResult};
use crate::output::OutputFormat;

pub mod call;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the demo Arith service.
    Serve(ServeArgs),
    /// Call one method and print the reply.
    Call(CallArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args, format),
        Command::Call(args) => call::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Endpoint to bind, e.g. tcp@127.0.0.1:9000, unix@/tmp/rpc.sock, http@0.0.0.0:9000.
    pub endpoint: String,
    /// Worker threads per connection.
    #[arg(long, default_value_t = 4)]
    pub workers: usize,
    /// Handle timeout used when a client does not request one (e.g. 3s, 500ms).
    #[arg(long, default_value = "3s")]
    pub handle_timeout: String,
}

#[derive(Args, Debug)]
pub struct CallArgs {
    /// Endpoint to dial.
    pub endpoint: String,
    /// Method as Service.Method.
    pub method: String,
    /// JSON arguments. Default: null.
    #[arg(long)]
    pub json: Option<String>,
    /// Body codec: json or msgpack.
    #[arg(long, default_value = "json")]
    pub codec: String,
    /// Bound on dial plus handshake.
    #[arg(long, default_value = "3s")]
    pub connect_timeout: String,
    /// Server-side processing bound to request. Default: server's choice.
    #[arg(long)]
    pub handle_timeout: Option<String>,
    /// How long to wait for the reply.
    #[arg(long, default_value = "10s")]
    pub timeout: String,
    /// Trace id carried in the request header.
    #[arg(long)]
    pub trace_id: Option<String>,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub fn parse_endpoint(input: &str) -> CliResult<Endpoint> {
    Endpoint::parse(input).map_err(|err| transport_error("bad endpoint", err))
}

/// Parse `500ms`, `3s`, or a bare number of seconds.
pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::usage("duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::usage(format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::usage("duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exit::USAGE;

    #[test]
    fn parse_duration_seconds_and_millis() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn parse_duration_rejects_invalid_values() {
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("bad").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn parse_endpoint_rejects_unknown_protocol() {
        let err = parse_endpoint("ftp@host:21").unwrap_err();
        assert_eq!(err.code, USAGE);
        assert!(matches!(
            parse_endpoint("http@127.0.0.1:9000"),
            Ok(Endpoint::Http(_))
        ));
    }
}
