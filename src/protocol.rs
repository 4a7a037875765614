//! Tunnel wire messages
//!
//! Everything that travels over the secure channel is either a raw IP
//! packet or a control message. Control messages start with the sentinel
//! byte `0`, which can never begin an IPv4/IPv6 packet (the version nibble
//! is never zero).
//!
//! ```text
//! Keepalive   [0x00]
//! Connect     [0x00, 0x01]
//! Disconnect  [0x00, 0x02]
//! Parameters  [0x00, "m,1400 a,10.0.0.2,32 d,8.8.8.8 r,0.0.0.0,0", ' ' ...]  (1024 bytes)
//! ```

use std::net::Ipv4Addr;

// ============================================================================
// Message Codes
// ============================================================================

/// First byte of every control message
pub const CONTROL_SENTINEL: u8 = 0x00;

/// Second byte of the legacy connect request
pub const CLIENT_WANT_CONNECT: u8 = 0x01;

/// Second byte of a client disconnect request
pub const CLIENT_WANT_DISCONNECT: u8 = 0x02;

/// Fixed size of the parameters payload
pub const PARAMETERS_PAYLOAD_SIZE: usize = 1024;

/// Keepalive sent by the server when the client has been silent toward us
pub const KEEPALIVE: [u8; 1] = [CONTROL_SENTINEL];

// ============================================================================
// Classification
// ============================================================================

/// What a message received from the client means to the forwarding loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound<'a> {
    /// Tunneled IP packet
    Data(&'a [u8]),
    /// Client asks to tear the tunnel down
    Disconnect,
    /// Client connect intent (repeated preamble); nothing to do
    Connect,
    /// Keepalive or an unknown control message
    OtherControl(&'a [u8]),
}

/// Classify a non-empty message received from the client
pub fn classify(msg: &[u8]) -> Inbound<'_> {
    match msg {
        [] => Inbound::OtherControl(msg),
        [first, ..] if *first != CONTROL_SENTINEL => Inbound::Data(msg),
        [_, CLIENT_WANT_DISCONNECT] => Inbound::Disconnect,
        [_, CLIENT_WANT_CONNECT] => Inbound::Connect,
        _ => Inbound::OtherControl(msg),
    }
}

/// Build the 2-byte disconnect request (as sent by clients)
pub fn build_disconnect() -> [u8; 2] {
    [CONTROL_SENTINEL, CLIENT_WANT_DISCONNECT]
}

// ============================================================================
// Session Parameters
// ============================================================================

/// Tunnel settings pushed to a client right after its handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParameters {
    pub mtu: u16,
    pub client_address: Ipv4Addr,
    pub dns: Ipv4Addr,
    pub route: Ipv4Addr,
    pub route_prefix: u8,
}

impl SessionParameters {
    /// Parameter string understood by the client
    pub fn to_parameter_string(&self) -> String {
        format!(
            "m,{} a,{},32 d,{} r,{},{}",
            self.mtu, self.client_address, self.dns, self.route, self.route_prefix
        )
    }

    /// Encode into the fixed-size control payload.
    ///
    /// # Format
    ///
    /// ```text
    /// +------+---------------------------+------------------------+
    /// | 0x00 | ASCII parameter string    | ' ' padding            |
    /// +------+---------------------------+------------------------+
    ///   1B     n bytes                     1024 - 1 - n bytes
    /// ```
    pub fn to_payload(&self) -> [u8; PARAMETERS_PAYLOAD_SIZE] {
        let mut payload = [b' '; PARAMETERS_PAYLOAD_SIZE];
        payload[0] = CONTROL_SENTINEL;

        let params = self.to_parameter_string();
        // At most ~60 bytes for IPv4 values, far below the payload size
        let len = params.len().min(PARAMETERS_PAYLOAD_SIZE - 1);
        payload[1..1 + len].copy_from_slice(&params.as_bytes()[..len]);

        payload
    }
}
