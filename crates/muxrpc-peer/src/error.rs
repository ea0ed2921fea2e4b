/// Errors that can occur in RPC operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RpcError {
    /// Transport-level error (dial, bind, tunnel).
    #[error("transport error: {0}")]
    Transport(String),

    /// Frame-level error. Fatal for the connection.
    #[error("frame error: {0}")]
    Frame(String),

    /// Body could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// Handshake rejected or malformed.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The remote handler reported an error.
    #[error("{0}")]
    Application(String),

    /// The caller's deadline passed before a reply arrived.
    #[error("call timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The caller cancelled the call.
    #[error("call cancelled")]
    Cancelled,

    /// The connection is closing or closed.
    #[error("connection is shut down")]
    Shutdown,

    /// No usable server address.
    #[error("discovery error: {0}")]
    Discovery(String),

    /// `Service.Method` is not of that form.
    #[error("rpc server: service/method request ill-formed: {0}")]
    IllFormedMethod(String),

    #[error("rpc server: can't find service {0}")]
    ServiceNotFound(String),

    #[error("rpc server: can't find method {0}")]
    MethodNotFound(String),

    /// A service with this name is already registered.
    #[error("rpc: service already defined: {0}")]
    DuplicateService(String),
}

impl From<muxrpc_transport::TransportError> for RpcError {
    fn from(err: muxrpc_transport::TransportError) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<muxrpc_frame::FrameError> for RpcError {
    fn from(err: muxrpc_frame::FrameError) -> Self {
        match err {
            muxrpc_frame::FrameError::ConnectionClosed => Self::Shutdown,
            muxrpc_frame::FrameError::Transport(err) => err.into(),
            other => Self::Frame(other.to_string()),
        }
    }
}

impl From<muxrpc_frame::CodecError> for RpcError {
    fn from(err: muxrpc_frame::CodecError) -> Self {
        Self::Codec(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
