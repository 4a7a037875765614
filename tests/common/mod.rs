//! In-memory collaborators for session and supervisor tests
//!
//! Each mock keeps its state behind an `Arc<Mutex<..>>` so the test can
//! inspect it while a session owns the mock itself.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use vpn_server::channel::{ChannelError, PendingHandshake, SecureChannel, SecureChannelListener};
use vpn_server::interface::{InterfaceBinder, InterfaceError, PacketDevice};
use vpn_server::liveness::LivenessConfig;
use vpn_server::{NetworkSpec, ServerConfig, SessionContext};

// ============================================================================
// Channel
// ============================================================================

#[derive(Default)]
pub struct ChannelState {
    /// Messages the client will send, in order
    pub inbound: VecDeque<Vec<u8>>,
    /// Messages the server sent
    pub sent: Vec<Vec<u8>>,
    /// Report end of stream once `inbound` is empty
    pub peer_closed: bool,
    /// Fail every receive with this error once `inbound` is empty
    pub recv_error: Option<io::ErrorKind>,
    /// Reported by `max_message_len`
    pub max_message_len: Option<usize>,
    pub shutdown_calls: usize,
}

#[derive(Clone, Default)]
pub struct ChannelTap(pub Arc<Mutex<ChannelState>>);

impl ChannelTap {
    pub fn with_inbound(messages: &[&[u8]]) -> Self {
        let tap = ChannelTap::default();
        tap
            .0
            .lock()
            .inbound
            .extend(messages.iter().map(|m| m.to_vec()));
        tap
    }

    pub fn push(&self, msg: &[u8]) {
        self.0.lock().inbound.push_back(msg.to_vec());
    }

    pub fn close_from_peer(&self) {
        self.0.lock().peer_closed = true;
    }

    pub fn fail_receives(&self, kind: io::ErrorKind) {
        self.0.lock().recv_error = Some(kind);
    }

    pub fn limit_message_len(&self, len: usize) {
        self.0.lock().max_message_len = Some(len);
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.0.lock().sent.clone()
    }

    pub fn shutdown_calls(&self) -> usize {
        self.0.lock().shutdown_calls
    }
}

pub struct MockChannel {
    state: ChannelTap,
    peer: SocketAddr,
}

impl SecureChannel for MockChannel {
    fn send(&mut self, msg: &[u8]) -> io::Result<usize> {
        self.state.0.lock().sent.push(msg.to_vec());
        Ok(msg.len())
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.0.lock();
        match state.inbound.pop_front() {
            Some(msg) => {
                buf[..msg.len()].copy_from_slice(&msg);
                Ok(msg.len())
            }
            None if state.peer_closed => Ok(0),
            None => match state.recv_error {
                Some(kind) => Err(io::Error::new(kind, "injected receive failure")),
                None => Err(io::ErrorKind::WouldBlock.into()),
            },
        }
    }

    fn shutdown(&mut self) {
        self.state.0.lock().shutdown_calls += 1;
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn peer_identity(&self) -> Option<String> {
        Some("test-client".to_string())
    }

    fn max_message_len(&self) -> Option<usize> {
        self.state.0.lock().max_message_len
    }
}

pub struct MockPending {
    tap: ChannelTap,
    fail: bool,
    /// Never finish; wait for the cancel flag instead
    stall: bool,
}

impl MockPending {
    pub fn new(tap: ChannelTap) -> Box<dyn PendingHandshake> {
        Box::new(MockPending {
            tap,
            fail: false,
            stall: false,
        })
    }

    pub fn failing() -> Box<dyn PendingHandshake> {
        Box::new(MockPending {
            tap: ChannelTap::default(),
            fail: true,
            stall: false,
        })
    }

    /// A client that never completes its handshake
    pub fn stalled() -> Box<dyn PendingHandshake> {
        Box::new(MockPending {
            tap: ChannelTap::default(),
            fail: false,
            stall: true,
        })
    }
}

impl PendingHandshake for MockPending {
    fn peer_addr(&self) -> SocketAddr {
        peer_addr()
    }

    fn complete(
        self: Box<Self>,
        cancel: &AtomicBool,
    ) -> Result<Box<dyn SecureChannel>, ChannelError> {
        if self.fail {
            return Err(ChannelError::Handshake("bad client hello".to_string()));
        }
        if self.stall {
            while !cancel.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(2));
            }
            return Err(ChannelError::Cancelled);
        }
        Ok(Box::new(MockChannel {
            state: self.tap,
            peer: peer_addr(),
        }))
    }
}

pub fn peer_addr() -> SocketAddr {
    "198.51.100.7:40000".parse().unwrap()
}

// ============================================================================
// Device
// ============================================================================

#[derive(Default)]
pub struct DeviceState {
    /// Packets the kernel will hand to the server
    pub outbound: VecDeque<Vec<u8>>,
    /// Packets the server wrote into the interface
    pub written: Vec<Vec<u8>>,
    /// Panic on the next read
    pub panic_on_read: bool,
    /// Fail every read with this error once `outbound` is empty
    pub read_error: Option<io::ErrorKind>,
}

pub struct MockDevice(Arc<Mutex<DeviceState>>);

impl PacketDevice for MockDevice {
    fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.0.lock();
        if state.panic_on_read {
            drop(state);
            panic!("device read exploded");
        }
        match state.outbound.pop_front() {
            Some(packet) => {
                buf[..packet.len()].copy_from_slice(&packet);
                Ok(packet.len())
            }
            None => match state.read_error {
                Some(kind) => Err(io::Error::new(kind, "injected read failure")),
                None => Err(io::ErrorKind::WouldBlock.into()),
            },
        }
    }

    fn write_packet(&mut self, packet: &[u8]) -> io::Result<usize> {
        self.0.lock().written.push(packet.to_vec());
        Ok(packet.len())
    }
}

// ============================================================================
// Binder
// ============================================================================

#[derive(Default)]
pub struct MockBinder {
    pub created: Mutex<Vec<(String, Ipv4Addr, Ipv4Addr)>>,
    pub destroyed: Mutex<Vec<String>>,
    /// MTU changes after creation
    pub mtu_changes: Mutex<Vec<(String, u16)>>,
    /// Device state per interface name, created on demand
    pub devices: Mutex<Vec<(String, Arc<Mutex<DeviceState>>)>>,
    /// Device state handed to the next created interface
    pub next_device: Mutex<Option<Arc<Mutex<DeviceState>>>>,
    pub fail_create: bool,
}

impl MockBinder {
    pub fn failing() -> Self {
        MockBinder {
            fail_create: true,
            ..Default::default()
        }
    }

    pub fn device(&self, name: &str) -> Option<Arc<Mutex<DeviceState>>> {
        self.devices
            .lock()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, d)| d.clone())
    }

    pub fn created_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.created.lock().iter().map(|c| c.0.clone()).collect();
        names.sort();
        names
    }

    pub fn destroyed_names(&self) -> Vec<String> {
        let mut names = self.destroyed.lock().clone();
        names.sort();
        names
    }
}

impl InterfaceBinder for MockBinder {
    fn create(
        &self,
        name: &str,
        local: Ipv4Addr,
        peer: Ipv4Addr,
    ) -> Result<Box<dyn PacketDevice>, InterfaceError> {
        if self.fail_create {
            return Err(InterfaceError::InvalidName(name.to_string()));
        }
        self.created.lock().push((name.to_string(), local, peer));

        let state = self.next_device.lock().take().unwrap_or_default();
        self.devices.lock().push((name.to_string(), state.clone()));
        Ok(Box::new(MockDevice(state)))
    }

    fn set_mtu(&self, name: &str, mtu: u16) -> Result<(), InterfaceError> {
        self.mtu_changes.lock().push((name.to_string(), mtu));
        Ok(())
    }

    fn destroy(&self, name: &str) {
        self.destroyed.lock().push(name.to_string());
    }

    fn sweep(&self, _prefix: &str) -> usize {
        0
    }
}

// ============================================================================
// Listener
// ============================================================================

/// Hands out queued clients; reports `NoClient` when the queue is empty
#[derive(Clone, Default)]
pub struct MockListener {
    pub queue: Arc<Mutex<VecDeque<Result<Box<dyn PendingHandshake>, ChannelError>>>>,
}

impl MockListener {
    pub fn push_client(&self, pending: Box<dyn PendingHandshake>) {
        self.queue.lock().push_back(Ok(pending));
    }

    pub fn push_error(&self, error: ChannelError) {
        self.queue.lock().push_back(Err(error));
    }
}

impl SecureChannelListener for MockListener {
    fn accept(&self) -> Result<Box<dyn PendingHandshake>, ChannelError> {
        if let Some(next) = self.queue.lock().pop_front() {
            return next;
        }
        thread::sleep(Duration::from_millis(5));
        Err(ChannelError::NoClient)
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Liveness with 1 ms ticks: keepalive after 3 idle ticks, timeout after 5
pub fn fast_liveness() -> LivenessConfig {
    LivenessConfig {
        tick: Duration::from_millis(1),
        keepalive_ticks: 3,
        timeout_ticks: 5,
    }
}

/// Liveness that never times out within a test
pub fn patient_liveness() -> LivenessConfig {
    LivenessConfig {
        tick: Duration::from_millis(1),
        keepalive_ticks: 1_000_000,
        timeout_ticks: 1_000_000,
    }
}

pub fn context(network: &str, prefix: u8, binder: Arc<MockBinder>) -> SessionContext {
    let mut config = ServerConfig::new(4433);
    config.network = NetworkSpec::new(network.parse().unwrap(), prefix).unwrap();
    SessionContext::new(Arc::new(config), binder).with_liveness(fast_liveness())
}

/// Poll `cond` until it holds or five seconds pass
pub fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}
