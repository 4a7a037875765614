//! Top-level server errors

use std::fmt;
use std::io;

use crate::channel::ChannelError;
use crate::config::ConfigError;
use crate::shell::ShellError;

/// Errors that stop the server
#[derive(Debug)]
pub enum ServerError {
    /// Invalid configuration
    Config(ConfigError),
    /// Certificate or key could not be loaded
    Tls(String),
    /// NAT rule or IP forwarding could not be set up
    Nat(ShellError),
    /// Listening port unusable
    Listen(ChannelError),
    Io(io::Error),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Config(e) => write!(f, "configuration error: {}", e),
            ServerError::Tls(msg) => write!(f, "TLS setup failed: {}", msg),
            ServerError::Nat(e) => write!(f, "NAT setup failed: {}", e),
            ServerError::Listen(e) => write!(f, "cannot accept clients: {}", e),
            ServerError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Config(e) => Some(e),
            ServerError::Tls(_) => None,
            ServerError::Nat(e) => Some(e),
            ServerError::Listen(e) => Some(e),
            ServerError::Io(e) => Some(e),
        }
    }
}

impl From<ConfigError> for ServerError {
    fn from(e: ConfigError) -> Self {
        ServerError::Config(e)
    }
}

impl From<ShellError> for ServerError {
    fn from(e: ShellError) -> Self {
        ServerError::Nat(e)
    }
}

impl From<ChannelError> for ServerError {
    fn from(e: ChannelError) -> Self {
        ServerError::Listen(e)
    }
}

impl From<io::Error> for ServerError {
    fn from(e: io::Error) -> Self {
        ServerError::Io(e)
    }
}
