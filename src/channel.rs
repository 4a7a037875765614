//! Secure channel abstraction
//!
//! A session only needs three things from its encrypted transport: send a
//! datagram, receive a datagram without blocking, and shut down. Accepting
//! a client is split in two so the supervisor only blocks until a client
//! shows up, while the (slower) cryptographic handshake runs on the
//! session's own thread.
//!
//! # Receive Semantics
//!
//! | Result                         | Meaning                                |
//! |--------------------------------|----------------------------------------|
//! | `Ok(n)`, `n > 0`               | one message of `n` bytes               |
//! | `Ok(0)`                        | peer closed the connection             |
//! | `Err(kind == WouldBlock)`      | nothing available right now            |
//! | any other `Err`                | transient I/O error, log and continue  |

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;

/// Errors while accepting a client
#[derive(Debug)]
pub enum ChannelError {
    /// Listening port is held by someone else (after retries)
    AddrInUse(u16),
    /// Listening socket could not be created
    Bind { port: u16, source: io::Error },
    /// No client arrived within the accept poll interval
    NoClient,
    /// Socket-level failure
    Io(io::Error),
    /// TLS/transport handshake failed
    Handshake(String),
    /// Handshake abandoned because the session was cancelled
    Cancelled,
}

impl ChannelError {
    /// The listening port itself is unusable; retrying will not help
    pub fn is_fatal(&self) -> bool {
        matches!(self, ChannelError::AddrInUse(_) | ChannelError::Bind { .. })
    }
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::AddrInUse(port) => write!(f, "port {} is already in use", port),
            ChannelError::Bind { port, source } => {
                write!(f, "cannot bind port {}: {}", port, source)
            }
            ChannelError::NoClient => write!(f, "no client connected"),
            ChannelError::Io(e) => write!(f, "socket error: {}", e),
            ChannelError::Handshake(msg) => write!(f, "handshake failed: {}", msg),
            ChannelError::Cancelled => write!(f, "handshake cancelled"),
        }
    }
}

impl std::error::Error for ChannelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ChannelError::Io(e) => Some(e),
            ChannelError::Bind { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<io::Error> for ChannelError {
    fn from(e: io::Error) -> Self {
        ChannelError::Io(e)
    }
}

/// Established encrypted datagram channel to one client
pub trait SecureChannel: Send {
    /// Send one message
    fn send(&mut self, msg: &[u8]) -> io::Result<usize>;

    /// Receive one message without blocking (see module docs)
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Close the channel; further calls are no-ops
    fn shutdown(&mut self);

    /// Client transport address
    fn peer_addr(&self) -> SocketAddr;

    /// Authenticated client identity, if the client presented a certificate
    fn peer_identity(&self) -> Option<String> {
        None
    }

    /// Largest message `send` can carry, once known
    fn max_message_len(&self) -> Option<usize> {
        None
    }
}

/// A client that has contacted the server but not finished its handshake
pub trait PendingHandshake: Send {
    fn peer_addr(&self) -> SocketAddr;

    /// Complete the handshake (may take several round trips).
    ///
    /// Gives up with [`ChannelError::Cancelled`] once `cancel` is raised.
    fn complete(
        self: Box<Self>,
        cancel: &AtomicBool,
    ) -> Result<Box<dyn SecureChannel>, ChannelError>;
}

/// Waits for clients on the listening port
pub trait SecureChannelListener: Send + Sync {
    /// Block until a client arrives or the poll interval elapses
    /// ([`ChannelError::NoClient`]).
    fn accept(&self) -> Result<Box<dyn PendingHandshake>, ChannelError>;
}
