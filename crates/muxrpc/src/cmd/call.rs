use std::time::{Duration, Instant};

use muxrpc_frame::Codec;
use muxrpc_peer::{CallContext, Client, ConnectOptions};

use crate::cmd::{parse_duration, parse_endpoint, CallArgs};
use crate::exit::{rpc_error, transport_error, CliError, CliResult, SUCCESS, TIMEOUT};
use crate::output::{print_call, CallOutput, OutputFormat};

pub fn run(args: CallArgs, format: OutputFormat) -> CliResult<i32> {
    let endpoint = parse_endpoint(&args.endpoint)?;
    let codec = parse_codec(&args.codec)?;
    let body = parse_body(args.json.as_deref())?;
    let connect_timeout = parse_duration(&args.connect_timeout)?;
    let timeout = parse_duration(&args.timeout)?;

    let mut options = ConnectOptions::default()
        .with_codec(codec)
        .with_connect_timeout(connect_timeout);
    if let Some(handle_timeout) = &args.handle_timeout {
        options = options.with_handle_timeout(parse_duration(handle_timeout)?);
    }

    // Dial separately so socket-level failures keep their I/O kind for the exit code.
    let limit = (!connect_timeout.is_zero()).then_some(connect_timeout);
    let dial_started = Instant::now();
    let stream = muxrpc_transport::connect(&endpoint, limit)
        .map_err(|err| transport_error("connect failed", err))?;
    let budget = handshake_budget(limit, dial_started.elapsed())?;
    stream
        .set_write_timeout(budget)
        .map_err(|err| transport_error("connect failed", err))?;
    let client =
        Client::with_stream(stream, &options).map_err(|err| rpc_error("handshake failed", err))?;

    let mut ctx = CallContext::new().with_timeout(timeout);
    if let Some(trace_id) = &args.trace_id {
        ctx = ctx.with_trace_id(trace_id.clone());
    }

    let started = Instant::now();
    let reply: serde_json::Value = client
        .call_with(&ctx, &args.method, &body)
        .map_err(|err| rpc_error("call failed", err))?;
    let elapsed_ms = started.elapsed().as_millis();

    print_call(
        &CallOutput {
            endpoint: endpoint.to_string(),
            method: args.method,
            codec: codec.content_type().to_string(),
            trace_id: ctx.trace_id,
            elapsed_ms,
            reply,
        },
        format,
    );
    Ok(SUCCESS)
}

/// Arguments and replies travel as `serde_json::Value`, which needs a
/// self-describing codec.
fn parse_codec(input: &str) -> CliResult<Codec> {
    let codec: Codec = input
        .parse()
        .map_err(|err| CliError::usage(format!("--codec: {err}")))?;
    match codec {
        Codec::Json | Codec::MsgPack => Ok(codec),
        Codec::Bincode => Err(CliError::usage(
            "--codec: bincode bodies are not self-describing; use json or msgpack",
        )),
    }
}

/// What the dial left of the connect timeout, to bound the handshake write.
fn handshake_budget(limit: Option<Duration>, spent: Duration) -> CliResult<Option<Duration>> {
    let Some(limit) = limit else {
        return Ok(None);
    };
    match limit.checked_sub(spent).filter(|left| !left.is_zero()) {
        Some(left) => Ok(Some(left)),
        None => Err(CliError::new(TIMEOUT, format!("connect timed out after {limit:?}"))),
    }
}

fn parse_body(json: Option<&str>) -> CliResult<serde_json::Value> {
    match json {
        None => Ok(serde_json::Value::Null),
        Some(text) => serde_json::from_str(text)
            .map_err(|err| CliError::usage(format!("--json is not valid JSON: {err}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exit::USAGE;

    #[test]
    fn codec_must_be_self_describing() {
        assert_eq!(parse_codec("json").unwrap(), Codec::Json);
        assert_eq!(parse_codec("application/msgpack").unwrap(), Codec::MsgPack);
        assert_eq!(parse_codec("gob").unwrap_err().code, USAGE);
        assert_eq!(parse_codec("xml").unwrap_err().code, USAGE);
    }

    #[test]
    fn body_defaults_to_null_and_rejects_bad_json() {
        assert_eq!(parse_body(None).unwrap(), serde_json::Value::Null);
        assert_eq!(
            parse_body(Some("[1,2]")).unwrap(),
            serde_json::json!([1, 2])
        );
        assert_eq!(parse_body(Some("{oops")).unwrap_err().code, USAGE);
    }

    #[test]
    fn handshake_gets_what_the_dial_left() {
        let limit = Some(Duration::from_millis(500));
        let left = handshake_budget(limit, Duration::from_millis(200)).unwrap();
        assert_eq!(left, Some(Duration::from_millis(300)));

        let err = handshake_budget(limit, Duration::from_millis(500)).unwrap_err();
        assert_eq!(err.code, TIMEOUT);

        let unbounded = handshake_budget(None, Duration::from_secs(60)).unwrap();
        assert_eq!(unbounded, None);
    }
}
