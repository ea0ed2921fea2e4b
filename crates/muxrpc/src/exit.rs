use std::fmt;
use std::io;

use muxrpc_peer::RpcError;
use muxrpc_transport::TransportError;

// Exit code constants aligned with sysexits/timeout(1) conventions.
pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn usage(message: impl Into<String>) -> Self {
        Self::new(USAGE, message)
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound => TRANSPORT_ERROR,
        io::ErrorKind::AddrInUse | io::ErrorKind::AddrNotAvailable => TRANSPORT_ERROR,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Bind { source, .. }
        | TransportError::Connect { source, .. }
        | TransportError::Accept(source)
        | TransportError::Io(source) => io_error(context, source),
        TransportError::InvalidEndpoint(_) | TransportError::Unsupported(_) => {
            CliError::new(USAGE, format!("{context}: {err}"))
        }
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn rpc_error(context: &str, err: RpcError) -> CliError {
    let code = match &err {
        RpcError::Transport(_) | RpcError::Handshake(_) => TRANSPORT_ERROR,
        RpcError::Discovery(_) => TRANSPORT_ERROR,
        RpcError::Timeout(_) => TIMEOUT,
        RpcError::Codec(_) => DATA_INVALID,
        RpcError::Application(_) | RpcError::Frame(_) => FAILURE,
        RpcError::Shutdown | RpcError::Cancelled => FAILURE,
        RpcError::IllFormedMethod(_) | RpcError::DuplicateService(_) => USAGE,
        RpcError::ServiceNotFound(_) | RpcError::MethodNotFound(_) => FAILURE,
    };
    CliError::new(code, format!("{context}: {err}"))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn connect_timeout_maps_to_124() {
        let err = transport_error(
            "connect failed",
            TransportError::Connect {
                endpoint: "tcp@10.255.255.1:9".to_string(),
                source: io::Error::from(io::ErrorKind::TimedOut),
            },
        );
        assert_eq!(err.code, TIMEOUT);
    }

    #[test]
    fn rpc_errors_map_to_exit_codes() {
        let cases = [
            (RpcError::Timeout(Duration::from_secs(1)), TIMEOUT),
            (RpcError::Application("boom".into()), FAILURE),
            (RpcError::Codec("bad".into()), DATA_INVALID),
            (RpcError::Handshake("magic".into()), TRANSPORT_ERROR),
        ];
        for (err, code) in cases {
            assert_eq!(rpc_error("c", err).code, code);
        }

        let err = rpc_error("call failed", RpcError::Shutdown);
        assert_eq!(err.to_string(), "call failed: connection is shut down");
    }
}
