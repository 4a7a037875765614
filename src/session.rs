//! Client session lifecycle
//!
//! A session owns everything one client uses: two virtual addresses (server
//! end and client end of the tunnel), one slot, the tunnel interface named
//! after the slot, and the secure channel.
//!
//! # State Machine
//!
//! ```text
//! Allocating ──► InterfaceUp ──► Handshaking ──► ParamsSent ──► Forwarding ──► Draining ──► Closed
//!     │               │               │                                                      ▲
//!     └───────────────┴───────────────┴──────────────── setup failure ───────────────────────┘
//! ```
//!
//! Teardown releases the channel, the interface, the addresses and the slot,
//! in that order, exactly once, from [`Session::close`] or from `Drop`.

use std::fmt;
use std::io;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crate::address_pool::{AddressPool, PoolError};
use crate::channel::{ChannelError, PendingHandshake, SecureChannel};
use crate::config::ServerConfig;
use crate::interface::{interface_name, InterfaceBinder, InterfaceError, PacketDevice};
use crate::liveness::{LivenessAction, LivenessConfig, LivenessTracker, KEEPALIVE_BURST};
use crate::metrics::Metrics;
use crate::protocol::{self, Inbound, SessionParameters, KEEPALIVE};
use crate::slots::SlotAllocator;

// ============================================================================
// Constants
// ============================================================================

/// Packet buffer size for both directions
pub const BUFFER_SIZE: usize = 32767;

/// Times the parameters payload is sent after the handshake
pub const PARAMETER_REPEAT: usize = 3;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Allocating,
    InterfaceUp,
    Handshaking,
    ParamsSent,
    Forwarding,
    Draining,
    Closed,
}

/// Why the forwarding loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Client sent the disconnect control message
    ClientDisconnect,
    /// Channel reported end of stream
    PeerClosed,
    /// Client stopped answering
    PeerTimeout,
    /// Server is shutting down
    Shutdown,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::ClientDisconnect => write!(f, "client disconnected"),
            ExitReason::PeerClosed => write!(f, "connection closed by peer"),
            ExitReason::PeerTimeout => write!(f, "peer timed out"),
            ExitReason::Shutdown => write!(f, "server shutdown"),
        }
    }
}

/// Session setup failures; resources are released before these are returned
#[derive(Debug)]
pub enum SessionError {
    Exhausted(PoolError),
    Interface(InterfaceError),
    Handshake(ChannelError),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Exhausted(e) => write!(f, "cannot allocate addresses: {}", e),
            SessionError::Interface(e) => write!(f, "{}", e),
            SessionError::Handshake(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Exhausted(e) => Some(e),
            SessionError::Interface(e) => Some(e),
            SessionError::Handshake(e) => Some(e),
        }
    }
}

// ============================================================================
// Context
// ============================================================================

/// State shared by all sessions
#[derive(Clone)]
pub struct SessionContext {
    pub config: Arc<ServerConfig>,
    pub addresses: Arc<AddressPool>,
    pub slots: Arc<SlotAllocator>,
    pub binder: Arc<dyn InterfaceBinder>,
    pub metrics: Arc<Metrics>,
    pub liveness: LivenessConfig,
}

impl SessionContext {
    /// Fresh pools for `config.network`
    pub fn new(config: Arc<ServerConfig>, binder: Arc<dyn InterfaceBinder>) -> Self {
        SessionContext {
            addresses: Arc::new(AddressPool::new(config.network)),
            slots: Arc::new(SlotAllocator::new()),
            binder,
            metrics: Arc::new(Metrics::new()),
            liveness: LivenessConfig::with_timeout(config.peer_timeout),
            config,
        }
    }

    pub fn with_liveness(mut self, liveness: LivenessConfig) -> Self {
        self.liveness = liveness;
        self
    }
}

// ============================================================================
// Session
// ============================================================================

pub struct Session {
    ctx: SessionContext,
    state: SessionState,
    slot: Option<u32>,
    server_address: Option<Ipv4Addr>,
    client_address: Option<Ipv4Addr>,
    /// Set once the interface exists and must be destroyed
    interface: Option<String>,
    device: Option<Box<dyn PacketDevice>>,
    channel: Option<Box<dyn SecureChannel>>,
    liveness: LivenessTracker,
    /// Tunnel MTU, lowered to fit the channel after the handshake
    mtu: u16,
    cancel: Arc<AtomicBool>,
    /// Counted in the active-sessions gauge
    counted: bool,
}

impl Session {
    /// Allocate addresses and a slot, then bring up the tunnel interface.
    ///
    /// On failure everything acquired so far has been released.
    pub fn prepare(ctx: SessionContext) -> Result<Session, SessionError> {
        let mtu = ctx.config.mtu;
        let mut session = Session {
            liveness: LivenessTracker::new(ctx.liveness),
            ctx,
            state: SessionState::Allocating,
            slot: None,
            server_address: None,
            client_address: None,
            interface: None,
            device: None,
            channel: None,
            mtu,
            cancel: Arc::new(AtomicBool::new(false)),
            counted: false,
        };

        session.allocate()?;
        session.bring_up()?;
        Ok(session)
    }

    fn allocate(&mut self) -> Result<(), SessionError> {
        let addresses = Arc::clone(&self.ctx.addresses);
        let metrics = Arc::clone(&self.ctx.metrics);
        let acquire = || {
            addresses.acquire().map_err(|e| {
                log::warn!("Cannot start session: {}", e);
                metrics.pool_exhausted_total.fetch_add(1, Ordering::Relaxed);
                SessionError::Exhausted(e)
            })
        };

        self.server_address = Some(acquire()?);
        self.client_address = Some(acquire()?);
        self.slot = Some(self.ctx.slots.acquire());
        Ok(())
    }

    fn bring_up(&mut self) -> Result<(), SessionError> {
        let (Some(slot), Some(server), Some(client)) =
            (self.slot, self.server_address, self.client_address)
        else {
            return Ok(());
        };

        let name = interface_name(&self.ctx.config.interface_prefix, slot);
        let device = self
            .ctx
            .binder
            .create(&name, server, client)
            .map_err(|e| {
                log::error!("[{}] {}", name, e);
                SessionError::Interface(e)
            })?;

        self.interface = Some(name);
        self.device = Some(device);
        self.state = SessionState::InterfaceUp;
        Ok(())
    }

    /// Complete the client handshake, send the parameters and forward
    /// packets until the session ends. Resources are released on return.
    pub fn run(mut self, pending: Box<dyn PendingHandshake>) -> Result<ExitReason, SessionError> {
        self.state = SessionState::Handshaking;
        log::info!("[{}] Handshaking with {}", self.label(), pending.peer_addr());

        let channel = match pending.complete(&self.cancel) {
            Ok(channel) => channel,
            Err(ChannelError::Cancelled) => {
                log::info!("[{}] Handshake abandoned for shutdown", self.label());
                return Ok(ExitReason::Shutdown);
            }
            Err(e) => {
                self.ctx
                    .metrics
                    .handshake_failures_total
                    .fetch_add(1, Ordering::Relaxed);
                log::warn!("[{}] {}", self.label(), e);
                return Err(SessionError::Handshake(e));
            }
        };

        self.ctx.metrics.sessions_total.fetch_add(1, Ordering::Relaxed);
        self.ctx.metrics.active_sessions.fetch_add(1, Ordering::Relaxed);
        self.counted = true;

        log::info!(
            "[{}] Client {}{} assigned {} (server end {})",
            self.label(),
            channel.peer_addr(),
            channel
                .peer_identity()
                .map(|cn| format!(" ({})", cn))
                .unwrap_or_default(),
            display_addr(self.client_address),
            display_addr(self.server_address),
        );
        self.fit_mtu(channel.max_message_len());
        self.channel = Some(channel);

        self.send_parameters();

        self.state = SessionState::Forwarding;
        let reason = self.forward();
        log::info!("[{}] Session ended: {}", self.label(), reason);

        self.state = SessionState::Draining;
        self.close();
        Ok(reason)
    }

    /// Lower the tunnel MTU when the channel cannot carry full-size packets
    fn fit_mtu(&mut self, max_message_len: Option<usize>) {
        let Some(max) = max_message_len else {
            return;
        };
        let limit = u16::try_from(max).unwrap_or(u16::MAX);
        if limit >= self.mtu {
            return;
        }

        log::warn!(
            "[{}] Channel carries at most {} bytes, lowering MTU from {}",
            self.label(),
            limit,
            self.mtu
        );
        self.mtu = limit;
        if let Some(name) = self.interface.as_deref() {
            if let Err(e) = self.ctx.binder.set_mtu(name, limit) {
                log::warn!("[{}] {}", name, e);
            }
        }
    }

    /// Push the tunnel settings to the client
    fn send_parameters(&mut self) {
        let Some(client_address) = self.client_address else {
            return;
        };
        let config = &self.ctx.config;
        let params = SessionParameters {
            mtu: self.mtu,
            client_address,
            dns: config.dns,
            route: config.route,
            route_prefix: config.route_prefix,
        };
        let payload = params.to_payload();

        if let Some(channel) = self.channel.as_mut() {
            for _ in 0..PARAMETER_REPEAT {
                if let Err(e) = channel.send(&payload) {
                    log::warn!("Failed to send parameters: {}", e);
                }
            }
        }

        log::debug!("[{}] Parameters sent: {}", self.label(), params.to_parameter_string());
        self.state = SessionState::ParamsSent;
    }

    /// Shuttle packets between the interface and the channel
    fn forward(&mut self) -> ExitReason {
        let label = self.label().to_string();
        let Session {
            ctx,
            device,
            channel,
            liveness,
            cancel,
            ..
        } = self;

        let (Some(device), Some(channel)) = (device.as_mut(), channel.as_mut()) else {
            return ExitReason::PeerClosed;
        };
        let metrics = &ctx.metrics;

        let mut tun_buf = vec![0u8; BUFFER_SIZE];
        let mut net_buf = vec![0u8; BUFFER_SIZE];

        loop {
            if cancel.load(Ordering::Relaxed) {
                return ExitReason::Shutdown;
            }

            let mut idle = true;

            // Interface → client
            match device.read_packet(&mut tun_buf) {
                Ok(0) => {}
                Ok(len) => {
                    idle = false;
                    match channel.send(&tun_buf[..len]) {
                        Ok(_) => {
                            metrics.packets_to_client_total.fetch_add(1, Ordering::Relaxed);
                            metrics
                                .bytes_to_client_total
                                .fetch_add(len as u64, Ordering::Relaxed);
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            log::trace!("[{}] Channel full, dropped {} bytes", label, len);
                        }
                        Err(e) => log::warn!("[{}] Send to client failed: {}", label, e),
                    }
                    liveness.on_sent();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => log::warn!("[{}] Interface read failed: {}", label, e),
            }

            // Client → interface
            match channel.recv(&mut net_buf) {
                Ok(0) => return ExitReason::PeerClosed,
                Ok(len) => {
                    idle = false;
                    match protocol::classify(&net_buf[..len]) {
                        Inbound::Data(packet) => match device.write_packet(packet) {
                            Ok(_) => {
                                metrics
                                    .packets_from_client_total
                                    .fetch_add(1, Ordering::Relaxed);
                                metrics
                                    .bytes_from_client_total
                                    .fetch_add(len as u64, Ordering::Relaxed);
                            }
                            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                                log::trace!("[{}] Interface busy, dropped {} bytes", label, len);
                            }
                            Err(e) => log::warn!("[{}] Interface write failed: {}", label, e),
                        },
                        Inbound::Disconnect => {
                            metrics.client_disconnects_total.fetch_add(1, Ordering::Relaxed);
                            return ExitReason::ClientDisconnect;
                        }
                        Inbound::Connect => {
                            log::debug!("[{}] Repeated connect request ignored", label);
                        }
                        Inbound::OtherControl(msg) => {
                            log::trace!("[{}] Control message {:02x?} ignored", label, msg);
                        }
                    }
                    liveness.on_received();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => log::warn!("[{}] Receive from client failed: {}", label, e),
            }

            if idle {
                thread::sleep(liveness.config().tick);
                match liveness.on_idle_tick() {
                    LivenessAction::Continue => {}
                    LivenessAction::SendKeepalive => {
                        log::debug!("[{}] Sending keepalive", label);
                        for _ in 0..KEEPALIVE_BURST {
                            if let Err(e) = channel.send(&KEEPALIVE) {
                                log::debug!("[{}] Keepalive send failed: {}", label, e);
                            }
                        }
                        metrics
                            .keepalives_sent_total
                            .fetch_add(KEEPALIVE_BURST as u64, Ordering::Relaxed);
                    }
                    LivenessAction::TimedOut => {
                        metrics.peer_timeouts_total.fetch_add(1, Ordering::Relaxed);
                        return ExitReason::PeerTimeout;
                    }
                }
            }
        }
    }

    /// Release everything the session holds. Idempotent.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }

        if let Some(mut channel) = self.channel.take() {
            channel.shutdown();
        }

        // Close the packet handle before the link goes away
        self.device.take();
        if let Some(name) = self.interface.take() {
            self.ctx.binder.destroy(&name);
            log::info!("[{}] Interface removed", name);
        }

        for addr in [self.client_address.take(), self.server_address.take()]
            .into_iter()
            .flatten()
        {
            if let Err(e) = self.ctx.addresses.release(addr) {
                log::error!("Address release failed: {}", e);
            }
        }

        if let Some(slot) = self.slot.take() {
            if let Err(e) = self.ctx.slots.release(slot) {
                log::error!("Slot release failed: {}", e);
            }
        }

        if self.counted {
            self.counted = false;
            self.ctx.metrics.active_sessions.fetch_sub(1, Ordering::Relaxed);
        }

        self.state = SessionState::Closed;
    }

    /// Flag that makes the forwarding loop exit with [`ExitReason::Shutdown`]
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn slot(&self) -> Option<u32> {
        self.slot
    }

    pub fn server_address(&self) -> Option<Ipv4Addr> {
        self.server_address
    }

    pub fn client_address(&self) -> Option<Ipv4Addr> {
        self.client_address
    }

    /// MTU advertised to the client and set on the interface
    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    pub fn interface_name(&self) -> Option<&str> {
        self.interface.as_deref()
    }

    /// Log prefix
    fn label(&self) -> &str {
        self.interface.as_deref().unwrap_or("session")
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

fn display_addr(addr: Option<Ipv4Addr>) -> String {
    addr.map(|a| a.to_string()).unwrap_or_else(|| "-".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_pool::NetworkSpec;
    use parking_lot::Mutex;

    struct NullDevice;

    impl PacketDevice for NullDevice {
        fn read_packet(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::ErrorKind::WouldBlock.into())
        }

        fn write_packet(&mut self, packet: &[u8]) -> io::Result<usize> {
            Ok(packet.len())
        }
    }

    #[derive(Default)]
    struct Binder {
        fail: bool,
        created: Mutex<Vec<String>>,
        destroyed: Mutex<Vec<String>>,
    }

    impl InterfaceBinder for Binder {
        fn create(
            &self,
            name: &str,
            _local: Ipv4Addr,
            _peer: Ipv4Addr,
        ) -> Result<Box<dyn PacketDevice>, InterfaceError> {
            if self.fail {
                return Err(InterfaceError::InvalidName(name.to_string()));
            }
            self.created.lock().push(name.to_string());
            Ok(Box::new(NullDevice))
        }

        fn set_mtu(&self, _name: &str, _mtu: u16) -> Result<(), InterfaceError> {
            Ok(())
        }

        fn destroy(&self, name: &str) {
            self.destroyed.lock().push(name.to_string());
        }

        fn sweep(&self, _prefix: &str) -> usize {
            0
        }
    }

    fn context(prefix: u8, binder: Arc<Binder>) -> SessionContext {
        let mut config = ServerConfig::new(4433);
        config.network = NetworkSpec::new(Ipv4Addr::new(10, 0, 0, 0), prefix).unwrap();
        SessionContext::new(Arc::new(config), binder)
    }

    #[test]
    fn test_prepare_allocates_in_order() {
        let binder = Arc::new(Binder::default());
        let ctx = context(24, binder.clone());

        let session = Session::prepare(ctx.clone()).unwrap();
        assert_eq!(session.state(), SessionState::InterfaceUp);
        assert_eq!(session.server_address(), Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(session.client_address(), Some(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(session.slot(), Some(0));
        assert_eq!(session.interface_name(), Some("vpn_tun0"));
        assert_eq!(ctx.addresses.leased_count(), 2);
    }

    #[test]
    fn test_drop_releases_everything() {
        let binder = Arc::new(Binder::default());
        let ctx = context(24, binder.clone());

        let session = Session::prepare(ctx.clone()).unwrap();
        drop(session);

        assert_eq!(ctx.addresses.leased_count(), 0);
        assert!(ctx.slots.active_slots().is_empty());
        assert_eq!(binder.destroyed.lock().clone(), vec!["vpn_tun0".to_string()]);
    }

    #[test]
    fn test_close_is_idempotent() {
        let binder = Arc::new(Binder::default());
        let ctx = context(24, binder.clone());

        let mut session = Session::prepare(ctx.clone()).unwrap();
        session.close();
        session.close();
        assert_eq!(session.state(), SessionState::Closed);
        drop(session);

        assert_eq!(binder.destroyed.lock().len(), 1);
        assert_eq!(ctx.addresses.leased_count(), 0);
    }

    #[test]
    fn test_exhaustion_releases_partial_allocation() {
        // A /30 has two hosts; hold one so the session gets only the other
        let binder = Arc::new(Binder::default());
        let ctx = context(30, binder.clone());
        let held = ctx.addresses.acquire().unwrap();

        let result = Session::prepare(ctx.clone());
        assert!(matches!(result, Err(SessionError::Exhausted(PoolError::Exhausted))));
        assert_eq!(ctx.addresses.leased_count(), 1);
        assert!(ctx.addresses.is_leased(held));
        assert!(ctx.slots.active_slots().is_empty());
        assert!(binder.created.lock().is_empty());
        assert_eq!(ctx.metrics.pool_exhausted_total.load(Ordering::Relaxed), 1);

        // Once the held address is back, a session fits
        ctx.addresses.release(held).unwrap();
        let session = Session::prepare(ctx.clone()).unwrap();
        assert_eq!(session.slot(), Some(0));
    }

    #[test]
    fn test_interface_failure_releases_allocation() {
        let binder = Arc::new(Binder {
            fail: true,
            ..Default::default()
        });
        let ctx = context(24, binder.clone());

        let result = Session::prepare(ctx.clone());
        assert!(matches!(result, Err(SessionError::Interface(_))));
        assert_eq!(ctx.addresses.leased_count(), 0);
        assert!(ctx.slots.active_slots().is_empty());
        // Nothing was created, so nothing is destroyed
        assert!(binder.destroyed.lock().is_empty());
    }

    #[test]
    fn test_exit_reason_display() {
        assert_eq!(ExitReason::PeerTimeout.to_string(), "peer timed out");
        assert_eq!(ExitReason::ClientDisconnect.to_string(), "client disconnected");
    }
}
