//! VPN Server
//!
//! Terminates encrypted datagram tunnels from many clients. Each client gets
//! a pair of virtual addresses, a dedicated point-to-point TUN interface and
//! a worker thread forwarding packets between the interface and its QUIC
//! connection. Traffic leaves the host through a single NAT rule.

pub mod address_pool;
pub mod auth;
pub mod channel;
pub mod config;
pub mod error;
pub mod interface;
pub mod liveness;
pub mod metrics;
pub mod nat;
pub mod protocol;
pub mod quic;
pub mod registry;
pub mod session;
pub mod shell;
pub mod slots;
pub mod supervisor;

pub use address_pool::{AddressPool, NetworkSpec, PoolError};
pub use channel::{ChannelError, PendingHandshake, SecureChannel, SecureChannelListener};
pub use config::{ConfigError, ServerConfig};
pub use error::ServerError;
pub use interface::{InterfaceBinder, InterfaceError, PacketDevice};
pub use session::{ExitReason, Session, SessionContext, SessionError, SessionState};
pub use slots::{SlotAllocator, SlotError};
pub use supervisor::{Server, Supervisor};
