use std::io;

/// Central error type for the vigil core.
#[derive(Debug)]
pub enum ServerError {
    /// Underlying I/O error from the OS or network.
    Io(io::Error),
    /// Failed to register or deregister a descriptor with the reactor.
    Reactor(io::Error),
    /// Task submitted after the worker pool was shut down.
    PoolStopped,
    /// Malformed WebSocket upgrade or frame.
    WebSocket(String),
    /// Invalid configuration value.
    Config(String),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Io(e) => write!(f, "I/O error: {}", e),
            ServerError::Reactor(e) => write!(f, "reactor registration failed: {}", e),
            ServerError::PoolStopped => write!(f, "submit on stopped worker pool"),
            ServerError::WebSocket(msg) => write!(f, "websocket error: {}", msg),
            ServerError::Config(msg) => write!(f, "config error: {}", msg),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Io(e) | ServerError::Reactor(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ServerError {
    fn from(e: io::Error) -> Self {
        ServerError::Io(e)
    }
}

pub type ServerResult<T> = Result<T, ServerError>;
