//! QUIC secure channel
//!
//! Each client gets its own UDP socket and QUIC connection, so a session
//! thread can drive its transport without sharing state with any other
//! session:
//!
//! ```text
//!  supervisor                                   session thread
//!  ──────────                                   ──────────────
//!  bind [::]:port (SO_REUSEADDR)
//!  wait for a QUIC Initial ──► connect(peer)
//!                          └──► PendingHandshake ──► quiche::accept
//!  bind [::]:port again                             drive handshake (mio)
//!  wait for next client ...                         DATAGRAM send/recv
//! ```
//!
//! Once a socket is `connect()`ed to a peer the kernel delivers that peer's
//! datagrams to it rather than to the unconnected listening socket, which is
//! what lets many sessions share one port.
//!
//! Tunnel traffic travels in QUIC DATAGRAM frames (unreliable, unordered).
//! QUIC's idle timeout is disabled: the session's liveness tracker decides
//! when a client is gone.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};
use parking_lot::Mutex;
use ring::rand::{SecureRandom, SystemRandom};
use socket2::{Domain, Protocol, Socket, Type};

use crate::auth;
use crate::channel::{ChannelError, PendingHandshake, SecureChannel, SecureChannelListener};

// ============================================================================
// Constants
// ============================================================================

/// ALPN protocol identifier (must match the client)
pub const ALPN_PROTOCOL: &[u8] = b"vpn-tun-v1";

/// Maximum UDP payload size for QUIC packets (1500 - IPv4 - UDP headers)
pub const MAX_DATAGRAM_SIZE: usize = 1472;

/// Per-packet cost of carrying a DATAGRAM frame: short header with a
/// full-length connection ID and packet number, AEAD tag, frame type and
/// length
pub const DATAGRAM_OVERHEAD: usize = 1 + quiche::MAX_CONN_ID_LEN + 4 + 16 + 3;

/// Largest IP packet a tunnel can carry in one DATAGRAM
pub const MAX_TUNNEL_MTU: u16 = (MAX_DATAGRAM_SIZE - DATAGRAM_OVERHEAD) as u16;

/// How long one `accept` call waits for a client
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Delay between attempts to bind a busy port
const BIND_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Bind attempts before the port is reported as unavailable
const BIND_RETRIES: u32 = 50;

/// Upper bound for completing the TLS handshake
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest handshake poll between checks of the cancel flag
const CANCEL_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// mio token for the session socket
const SOCKET_TOKEN: Token = Token(0);

// ============================================================================
// Configuration
// ============================================================================

/// Build the server-side quiche configuration.
///
/// With `client_ca` set, clients must present a certificate signed by it.
pub fn server_config(
    cert_path: &str,
    key_path: &str,
    client_ca: Option<&str>,
) -> Result<quiche::Config, quiche::Error> {
    let mut config = quiche::Config::new(quiche::PROTOCOL_VERSION)?;

    // Load TLS certificates
    config.load_cert_chain_from_pem_file(cert_path)?;
    config.load_priv_key_from_pem_file(key_path)?;

    config.set_application_protos(&[ALPN_PROTOCOL])?;

    // Enable DATAGRAM support (IP tunneling)
    config.enable_dgram(true, 1000, 1000);

    // 0 disables the QUIC idle timeout
    config.set_max_idle_timeout(0);
    config.set_max_recv_udp_payload_size(MAX_DATAGRAM_SIZE);
    config.set_max_send_udp_payload_size(MAX_DATAGRAM_SIZE);
    config.set_initial_max_data(10_000_000);
    config.set_initial_max_stream_data_bidi_local(1_000_000);
    config.set_initial_max_stream_data_bidi_remote(1_000_000);
    config.set_initial_max_streams_bidi(16);
    config.set_initial_max_streams_uni(16);

    match client_ca {
        Some(ca_path) => {
            config.load_verify_locations_from_file(ca_path)?;
            config.verify_peer(true);
        }
        None => config.verify_peer(false),
    }

    Ok(config)
}

fn quic_err(context: &str, e: quiche::Error) -> ChannelError {
    ChannelError::Handshake(format!("{}: {}", context, e))
}

fn io_other(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::Other, msg)
}

// ============================================================================
// Listener
// ============================================================================

/// Accepts QUIC clients on a single UDP port
pub struct QuicListener {
    port: u16,
    config: Arc<Mutex<quiche::Config>>,
    /// Unconnected socket kept between `accept` calls that saw no client
    waiting: Mutex<Option<std::net::UdpSocket>>,
    poll_interval: Duration,
}

impl QuicListener {
    pub fn new(port: u16, config: quiche::Config) -> Self {
        QuicListener {
            port,
            config: Arc::new(Mutex::new(config)),
            waiting: Mutex::new(None),
            poll_interval: ACCEPT_POLL_INTERVAL,
        }
    }

    /// Override how long a single `accept` waits for a client
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Bind the listening socket, retrying while the port is busy
    fn bind(&self) -> Result<std::net::UdpSocket, ChannelError> {
        let mut attempts = 0;
        loop {
            match bind_socket(self.port) {
                Ok(socket) => return Ok(socket),
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                    attempts += 1;
                    if attempts >= BIND_RETRIES {
                        return Err(ChannelError::AddrInUse(self.port));
                    }
                    log::debug!("Port {} busy, retrying bind", self.port);
                    thread::sleep(BIND_RETRY_INTERVAL);
                }
                Err(source) => {
                    return Err(ChannelError::Bind {
                        port: self.port,
                        source,
                    })
                }
            }
        }
    }
}

/// Dual-stack UDP socket on `port`, falling back to IPv4 when IPv6 is off
fn bind_socket(port: u16) -> io::Result<std::net::UdpSocket> {
    match bind_with(Domain::IPV6, SocketAddr::from((Ipv6Addr::UNSPECIFIED, port))) {
        Ok(socket) => Ok(socket),
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => Err(e),
        Err(e) => {
            log::debug!("IPv6 bind failed ({}), using IPv4 only", e);
            bind_with(Domain::IPV4, SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
        }
    }
}

fn bind_with(domain: Domain, addr: SocketAddr) -> io::Result<std::net::UdpSocket> {
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    if domain == Domain::IPV6 {
        socket.set_only_v6(false)?;
    }
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

impl SecureChannelListener for QuicListener {
    fn accept(&self) -> Result<Box<dyn PendingHandshake>, ChannelError> {
        let socket = match self.waiting.lock().take() {
            Some(socket) => socket,
            None => self.bind()?,
        };
        socket.set_read_timeout(Some(self.poll_interval))?;

        let deadline = Instant::now() + self.poll_interval;
        let mut buf = vec![0u8; 65535];
        let mut out = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            if Instant::now() >= deadline {
                *self.waiting.lock() = Some(socket);
                return Err(ChannelError::NoClient);
            }

            let (len, from) = match socket.recv_from(&mut buf) {
                Ok(v) => v,
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    *self.waiting.lock() = Some(socket);
                    return Err(ChannelError::NoClient);
                }
                Err(e) => return Err(e.into()),
            };

            let hdr = match quiche::Header::from_slice(&mut buf[..len], quiche::MAX_CONN_ID_LEN) {
                Ok(v) => v,
                Err(e) => {
                    log::debug!("Ignoring non-QUIC packet from {}: {:?}", from, e);
                    continue;
                }
            };

            if hdr.ty != quiche::Type::Initial {
                log::debug!("Non-Initial packet from unknown peer {}", from);
                continue;
            }

            if !quiche::version_is_supported(hdr.version) {
                log::debug!("Version negotiation needed for {} ({:#x})", from, hdr.version);
                match quiche::negotiate_version(&hdr.scid, &hdr.dcid, &mut out) {
                    Ok(n) => {
                        if let Err(e) = socket.send_to(&out[..n], from) {
                            log::debug!("Failed to send version negotiation: {}", e);
                        }
                    }
                    Err(e) => log::debug!("Version negotiation failed: {:?}", e),
                }
                continue;
            }

            // Claim this peer: from now on its datagrams arrive on this socket
            socket.connect(from)?;
            log::info!("Client {} is connecting", from);

            buf.truncate(len);
            return Ok(Box::new(QuicHandshake {
                socket,
                peer: from,
                initial: buf,
                config: Arc::clone(&self.config),
            }));
        }
    }
}

// ============================================================================
// Handshake
// ============================================================================

/// Client that sent its first Initial packet
pub struct QuicHandshake {
    socket: std::net::UdpSocket,
    peer: SocketAddr,
    initial: Vec<u8>,
    config: Arc<Mutex<quiche::Config>>,
}

impl PendingHandshake for QuicHandshake {
    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn complete(
        self: Box<Self>,
        cancel: &AtomicBool,
    ) -> Result<Box<dyn SecureChannel>, ChannelError> {
        let QuicHandshake {
            socket,
            peer,
            mut initial,
            config,
        } = *self;

        socket.set_read_timeout(None)?;
        socket.set_nonblocking(true)?;
        // Specific local address now that the socket is connected
        let local = socket.local_addr()?;

        let mut socket = UdpSocket::from_std(socket);
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut socket, SOCKET_TOKEN, Interest::READABLE)?;

        // Generate new connection ID
        let mut scid = [0u8; quiche::MAX_CONN_ID_LEN];
        SystemRandom::new()
            .fill(&mut scid)
            .map_err(|_| ChannelError::Handshake("failed to generate connection ID".into()))?;
        let scid = quiche::ConnectionId::from_ref(&scid);

        let conn = {
            let mut config = config.lock();
            quiche::accept(&scid, None, local, peer, &mut config)
                .map_err(|e| quic_err("accept", e))?
        };

        let mut channel = QuicChannel {
            socket,
            poll,
            events: Events::with_capacity(64),
            conn,
            local,
            peer,
            recv_buf: vec![0u8; 65535],
            send_buf: vec![0u8; MAX_DATAGRAM_SIZE],
            identity: None,
            closed: false,
        };

        let recv_info = quiche::RecvInfo { from: peer, to: local };
        channel
            .conn
            .recv(&mut initial, recv_info)
            .map_err(|e| quic_err("initial packet", e))?;
        channel.flush()?;

        let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
        while !channel.conn.is_established() {
            if cancel.load(Ordering::Relaxed) {
                log::debug!("Handshake with {} cancelled", peer);
                return Err(ChannelError::Cancelled);
            }

            if channel.conn.is_closed() {
                return Err(ChannelError::Handshake(format!(
                    "connection from {} closed during handshake",
                    peer
                )));
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ChannelError::Handshake(format!(
                    "handshake with {} timed out",
                    peer
                )));
            }

            let remaining = (deadline - now).min(CANCEL_CHECK_INTERVAL);
            let wait = channel
                .conn
                .timeout()
                .map_or(remaining, |t| t.min(remaining));

            channel.poll.poll(&mut channel.events, Some(wait))?;
            channel.read_socket()?;
            channel.handle_timeout();
            channel.flush()?;
        }

        if let Some(der) = channel.conn.peer_cert() {
            match auth::common_name(der) {
                Ok(cn) => channel.identity = Some(cn),
                Err(e) => log::warn!("Client {} certificate: {}", peer, e),
            }
        }

        log::info!(
            "Handshake complete with {}{}",
            peer,
            channel
                .identity
                .as_deref()
                .map(|cn| format!(" (CN={})", cn))
                .unwrap_or_default()
        );

        Ok(Box::new(channel))
    }
}

// ============================================================================
// Channel
// ============================================================================

/// Established QUIC connection carrying tunnel DATAGRAMs
pub struct QuicChannel {
    socket: UdpSocket,
    poll: Poll,
    events: Events,
    conn: quiche::Connection,
    local: SocketAddr,
    peer: SocketAddr,
    recv_buf: Vec<u8>,
    send_buf: Vec<u8>,
    identity: Option<String>,
    closed: bool,
}

impl QuicChannel {
    /// Feed every queued UDP packet to the connection
    fn read_socket(&mut self) -> io::Result<()> {
        loop {
            let len = match self.socket.recv(&mut self.recv_buf) {
                Ok(len) => len,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                // ICMP port unreachable on the connected socket: the client
                // is gone, liveness will notice
                Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                    log::debug!("Client {} unreachable: {}", self.peer, e);
                    break;
                }
                Err(e) => return Err(e),
            };

            let recv_info = quiche::RecvInfo {
                from: self.peer,
                to: self.local,
            };
            if let Err(e) = self.conn.recv(&mut self.recv_buf[..len], recv_info) {
                log::debug!("Connection recv error from {}: {:?}", self.peer, e);
            }
        }
        Ok(())
    }

    fn handle_timeout(&mut self) {
        if let Some(timeout) = self.conn.timeout() {
            if timeout.is_zero() {
                self.conn.on_timeout();
            }
        }
    }

    /// Write every packet quiche has ready
    fn flush(&mut self) -> io::Result<()> {
        loop {
            match self.conn.send(&mut self.send_buf) {
                Ok((len, _send_info)) => match self.socket.send(&self.send_buf[..len]) {
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        log::trace!("Socket send would block, {} bytes dropped", len);
                        break;
                    }
                    Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                        log::debug!("Client {} unreachable: {}", self.peer, e);
                        break;
                    }
                    Err(e) => return Err(e),
                },
                Err(quiche::Error::Done) => break,
                Err(e) => {
                    log::debug!("Send error to {}: {:?}", self.peer, e);
                    break;
                }
            }
        }
        Ok(())
    }
}

impl SecureChannel for QuicChannel {
    fn send(&mut self, msg: &[u8]) -> io::Result<usize> {
        if self.closed || self.conn.is_closed() {
            return Err(io::ErrorKind::NotConnected.into());
        }

        match self.conn.dgram_send(msg) {
            Ok(()) => {}
            Err(quiche::Error::Done) => return Err(io::ErrorKind::WouldBlock.into()),
            Err(e) => return Err(io_other(format!("DATAGRAM send of {} bytes: {}", msg.len(), e))),
        }

        self.flush()?;
        Ok(msg.len())
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_socket()?;
        self.handle_timeout();
        // Acks and retransmissions
        self.flush()?;

        loop {
            match self.conn.dgram_recv(buf) {
                // Empty DATAGRAM frames carry nothing; zero is reserved for "closed"
                Ok(0) => continue,
                Ok(len) => return Ok(len),
                Err(quiche::Error::Done) => break,
                Err(e) => return Err(io_other(format!("DATAGRAM recv: {}", e))),
            }
        }

        if self.closed || self.conn.is_closed() || self.conn.is_draining() {
            return Ok(0);
        }

        Err(io::ErrorKind::WouldBlock.into())
    }

    fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        match self.conn.close(true, 0x00, b"tunnel closed") {
            Ok(()) | Err(quiche::Error::Done) => {}
            Err(e) => log::debug!("Close error for {}: {:?}", self.peer, e),
        }
        if let Err(e) = self.flush() {
            log::debug!("Failed to send close to {}: {}", self.peer, e);
        }
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn peer_identity(&self) -> Option<String> {
        self.identity.clone()
    }

    fn max_message_len(&self) -> Option<usize> {
        self.conn.dgram_max_writable_len()
    }
}
