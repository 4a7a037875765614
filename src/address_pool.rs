//! Virtual IP address pool
//!
//! Hands out host addresses of the configured virtual subnet to tunnel
//! endpoints and takes them back when a session ends.
//!
//! # Allocation Order
//!
//! ```text
//! acquire():  free list (oldest released first)  →  next sequential host  →  Exhausted
//! release():  pushed to the free-list tail
//! ```
//!
//! The network and broadcast addresses of the subnet are never handed out.
//! A /31 or /32 subnet therefore has no usable host and the pool is always
//! exhausted.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::net::Ipv4Addr;

use parking_lot::Mutex;

// ============================================================================
// Errors
// ============================================================================

/// Errors returned by the address pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// No free address is left in the subnet
    Exhausted,
    /// The address was released without being leased
    NotLeased(Ipv4Addr),
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::Exhausted => write!(f, "no free virtual addresses"),
            PoolError::NotLeased(addr) => write!(f, "address {} is not leased", addr),
        }
    }
}

impl std::error::Error for PoolError {}

// ============================================================================
// Network Spec
// ============================================================================

/// An IPv4 subnet in CIDR form
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkSpec {
    base: u32,
    prefix: u8,
}

impl NetworkSpec {
    /// Create a subnet from any address inside it and a prefix length.
    ///
    /// Returns `None` if `prefix > 32`.
    pub fn new(base: Ipv4Addr, prefix: u8) -> Option<Self> {
        if prefix > 32 {
            return None;
        }
        Some(NetworkSpec {
            base: u32::from(base),
            prefix,
        })
    }

    /// The default virtual network, 10.0.0.0/8
    pub const fn private_class_a() -> Self {
        NetworkSpec {
            base: 0x0a00_0000,
            prefix: 8,
        }
    }

    /// Prefix length (0..=32)
    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Subnet mask in host order
    pub fn mask_bits(&self) -> u32 {
        match self.prefix {
            0 => 0,
            p => u32::MAX << (32 - u32::from(p)),
        }
    }

    /// Subnet mask as a dotted quad
    pub fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.mask_bits())
    }

    /// `base & mask`
    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.network_bits())
    }

    /// `network | !mask`
    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.broadcast_bits())
    }

    /// `broadcast - network`.
    ///
    /// This counts every address above the network address, broadcast
    /// included, so it is 0 for a /32 and 1 for a /31. The number of
    /// addresses the pool can actually hand out is [`Self::host_count`].
    pub fn capacity(&self) -> u32 {
        self.broadcast_bits() - self.network_bits()
    }

    /// Addresses strictly between network and broadcast
    pub fn host_count(&self) -> u32 {
        self.capacity().saturating_sub(1)
    }

    /// Whether `addr` lies in `[network, broadcast]`
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let addr = u32::from(addr);
        addr >= self.network_bits() && addr <= self.broadcast_bits()
    }

    fn network_bits(&self) -> u32 {
        self.base & self.mask_bits()
    }

    fn broadcast_bits(&self) -> u32 {
        self.network_bits() | !self.mask_bits()
    }
}

impl fmt::Display for NetworkSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network(), self.prefix)
    }
}

// ============================================================================
// Address Pool
// ============================================================================

struct PoolState {
    /// Last synthesized address (host order); starts at the network address
    cursor: u32,
    /// Released addresses, oldest first
    free: VecDeque<Ipv4Addr>,
    /// Addresses currently handed out
    leased: HashSet<Ipv4Addr>,
}

/// Thread-safe pool of virtual host addresses
pub struct AddressPool {
    spec: NetworkSpec,
    state: Mutex<PoolState>,
}

impl AddressPool {
    /// Create an empty pool over `spec`
    pub fn new(spec: NetworkSpec) -> Self {
        AddressPool {
            spec,
            state: Mutex::new(PoolState {
                cursor: spec.network_bits(),
                free: VecDeque::new(),
                leased: HashSet::new(),
            }),
        }
    }

    /// The subnet this pool serves
    pub fn spec(&self) -> NetworkSpec {
        self.spec
    }

    /// Lease an address.
    ///
    /// Previously released addresses are reused in release order before a
    /// new address is synthesized.
    pub fn acquire(&self) -> Result<Ipv4Addr, PoolError> {
        let mut state = self.state.lock();

        if let Some(addr) = state.free.pop_front() {
            state.leased.insert(addr);
            log::trace!("Reused address {} ({} leased)", addr, state.leased.len());
            return Ok(addr);
        }

        if (state.leased.len() as u64) < u64::from(self.spec.capacity()) {
            // Hosts end one below broadcast
            let last_host = self.spec.broadcast_bits().saturating_sub(1);
            if state.cursor < last_host {
                state.cursor += 1;
                let addr = Ipv4Addr::from(state.cursor);
                state.leased.insert(addr);
                log::trace!("Issued address {} ({} leased)", addr, state.leased.len());
                return Ok(addr);
            }
        }

        Err(PoolError::Exhausted)
    }

    /// Return a leased address to the pool
    pub fn release(&self, addr: Ipv4Addr) -> Result<(), PoolError> {
        let mut state = self.state.lock();

        if !state.leased.remove(&addr) {
            log::warn!("Attempted to release unleased address {}", addr);
            return Err(PoolError::NotLeased(addr));
        }

        state.free.push_back(addr);
        log::trace!("Released address {} ({} leased)", addr, state.leased.len());
        Ok(())
    }

    /// Number of addresses currently leased
    pub fn leased_count(&self) -> usize {
        self.state.lock().leased.len()
    }

    /// Whether `addr` is currently leased
    pub fn is_leased(&self, addr: Ipv4Addr) -> bool {
        self.state.lock().leased.contains(&addr)
    }

    /// Addresses that can still be leased (free list plus unsynthesized hosts)
    pub fn available(&self) -> u64 {
        let state = self.state.lock();
        let last_host = u64::from(self.spec.broadcast_bits().saturating_sub(1));
        let unsynthesized = last_host.saturating_sub(u64::from(state.cursor));
        state.free.len() as u64 + unsynthesized
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(net: [u8; 4], prefix: u8) -> AddressPool {
        let spec = NetworkSpec::new(Ipv4Addr::from(net), prefix).unwrap();
        AddressPool::new(spec)
    }

    #[test]
    fn test_network_math_slash_8() {
        let spec = NetworkSpec::new(Ipv4Addr::new(10, 1, 2, 3), 8).unwrap();
        assert_eq!(spec.network(), Ipv4Addr::new(10, 0, 0, 0));
        assert_eq!(spec.broadcast(), Ipv4Addr::new(10, 255, 255, 255));
        assert_eq!(spec.netmask(), Ipv4Addr::new(255, 0, 0, 0));
        assert_eq!(spec.capacity(), 16_777_215);
        assert_eq!(spec.to_string(), "10.0.0.0/8");
    }

    #[test]
    fn test_network_math_slash_24() {
        let spec = NetworkSpec::new(Ipv4Addr::new(192, 168, 7, 77), 24).unwrap();
        assert_eq!(spec.network(), Ipv4Addr::new(192, 168, 7, 0));
        assert_eq!(spec.broadcast(), Ipv4Addr::new(192, 168, 7, 255));
        assert_eq!(spec.capacity(), 255);
        assert_eq!(spec.host_count(), 254);
    }

    #[test]
    fn test_network_math_slash_0() {
        let spec = NetworkSpec::new(Ipv4Addr::new(1, 2, 3, 4), 0).unwrap();
        assert_eq!(spec.network(), Ipv4Addr::UNSPECIFIED);
        assert_eq!(spec.broadcast(), Ipv4Addr::BROADCAST);
        assert_eq!(spec.capacity(), u32::MAX);
    }

    #[test]
    fn test_prefix_out_of_range() {
        assert!(NetworkSpec::new(Ipv4Addr::new(10, 0, 0, 0), 33).is_none());
    }

    #[test]
    fn test_contains() {
        let spec = NetworkSpec::new(Ipv4Addr::new(10, 0, 0, 0), 8).unwrap();
        assert!(spec.contains(Ipv4Addr::new(10, 10, 10, 10)));
        assert!(spec.contains(Ipv4Addr::new(10, 255, 255, 255)));
        assert!(!spec.contains(Ipv4Addr::new(1, 255, 255, 255)));
        assert!(!spec.contains(Ipv4Addr::new(192, 168, 0, 1)));
    }

    #[test]
    fn test_sequential_issue_skips_network_address() {
        let pool = pool([10, 0, 0, 0], 8);
        assert_eq!(pool.acquire(), Ok(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(pool.acquire(), Ok(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(pool.leased_count(), 2);
    }

    #[test]
    fn test_released_address_reused_before_new_one() {
        let pool = pool([10, 0, 0, 0], 8);
        let first = pool.acquire().unwrap();
        let _second = pool.acquire().unwrap();

        pool.release(first).unwrap();

        assert_eq!(pool.acquire(), Ok(Ipv4Addr::new(10, 0, 0, 1)));
    }

    #[test]
    fn test_reuse_is_fifo() {
        let pool = pool([10, 0, 0, 0], 24);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        let c = pool.acquire().unwrap();

        pool.release(c).unwrap();
        pool.release(a).unwrap();
        pool.release(b).unwrap();

        assert_eq!(pool.acquire(), Ok(c));
        assert_eq!(pool.acquire(), Ok(a));
        assert_eq!(pool.acquire(), Ok(b));
        assert_eq!(pool.acquire(), Ok(Ipv4Addr::new(10, 0, 0, 4)));
    }

    #[test]
    fn test_exhaustion_skips_broadcast() {
        // /30: network .0, hosts .1 .2, broadcast .3
        let pool = pool([192, 168, 1, 0], 30);
        assert_eq!(pool.acquire(), Ok(Ipv4Addr::new(192, 168, 1, 1)));
        assert_eq!(pool.acquire(), Ok(Ipv4Addr::new(192, 168, 1, 2)));
        assert_eq!(pool.acquire(), Err(PoolError::Exhausted));
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_exhausted_pool_recovers_after_release() {
        let pool = pool([192, 168, 1, 0], 30);
        let a = pool.acquire().unwrap();
        let _b = pool.acquire().unwrap();
        assert!(pool.acquire().is_err());

        pool.release(a).unwrap();
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.acquire(), Ok(a));
    }

    #[test]
    fn test_slash_32_has_no_hosts() {
        let pool = pool([10, 0, 0, 7], 32);
        assert_eq!(pool.spec().capacity(), 0);
        assert_eq!(pool.spec().host_count(), 0);
        assert_eq!(pool.acquire(), Err(PoolError::Exhausted));
    }

    #[test]
    fn test_slash_31_has_no_hosts() {
        let pool = pool([10, 0, 0, 6], 31);
        assert_eq!(pool.spec().capacity(), 1);
        assert_eq!(pool.acquire(), Err(PoolError::Exhausted));
    }

    #[test]
    fn test_release_unleased_is_rejected() {
        let pool = pool([10, 0, 0, 0], 8);
        let addr = Ipv4Addr::new(10, 0, 0, 9);
        assert_eq!(pool.release(addr), Err(PoolError::NotLeased(addr)));
        // The bogus address must not become acquirable
        assert_eq!(pool.acquire(), Ok(Ipv4Addr::new(10, 0, 0, 1)));
    }

    #[test]
    fn test_double_release_is_rejected() {
        let pool = pool([10, 0, 0, 0], 8);
        let addr = pool.acquire().unwrap();
        assert!(pool.release(addr).is_ok());
        assert_eq!(pool.release(addr), Err(PoolError::NotLeased(addr)));
        assert_eq!(pool.acquire(), Ok(addr));
        assert_eq!(pool.acquire(), Ok(Ipv4Addr::new(10, 0, 0, 2)));
    }
}
