//! Session registry
//!
//! Tracks every running session worker so the supervisor can reap finished
//! threads and, on shutdown, cancel and join the rest.
//!
//! Entries are keyed by a monotonically increasing session ID rather than
//! by slot: a finished session releases its slot before its thread exits,
//! so the slot may already belong to a newer session.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// How often `join_all` checks for finished workers
const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(20);

// ============================================================================
// Registry Structure
// ============================================================================

/// A running session worker
pub struct SessionHandle {
    pub interface: String,
    pub peer: SocketAddr,
    pub cancel: Arc<AtomicBool>,
    pub thread: JoinHandle<()>,
}

/// Registry of session workers
pub struct SessionRegistry {
    sessions: HashMap<u64, SessionHandle>,
    next_id: u64,
}

impl SessionRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        SessionRegistry {
            sessions: HashMap::new(),
            next_id: 0,
        }
    }

    /// Register a worker; returns its session ID
    pub fn register(&mut self, handle: SessionHandle) -> u64 {
        let id = self.next_id;
        self.next_id += 1;

        log::debug!(
            "Registering session {} on {} (peer={})",
            id,
            handle.interface,
            handle.peer
        );
        self.sessions.insert(id, handle);
        id
    }

    /// Join workers that have already exited. Returns how many were reaped.
    pub fn reap_finished(&mut self) -> usize {
        let finished: Vec<u64> = self
            .sessions
            .iter()
            .filter(|(_, h)| h.thread.is_finished())
            .map(|(id, _)| *id)
            .collect();

        for id in &finished {
            if let Some(handle) = self.sessions.remove(id) {
                join(*id, handle);
            }
        }
        finished.len()
    }

    /// Ask every session to leave its forwarding loop
    pub fn request_shutdown_all(&self) {
        for handle in self.sessions.values() {
            handle.cancel.store(true, Ordering::Relaxed);
        }
    }

    /// Join workers until all have exited or `timeout` passes.
    ///
    /// Returns the interfaces of sessions still running at the deadline.
    pub fn join_all(&mut self, timeout: Duration) -> Vec<String> {
        let deadline = Instant::now() + timeout;

        while !self.sessions.is_empty() && Instant::now() < deadline {
            if self.reap_finished() == 0 {
                thread::sleep(JOIN_POLL_INTERVAL);
            }
        }

        let mut stuck: Vec<String> = self
            .sessions
            .values()
            .map(|h| h.interface.clone())
            .collect();
        stuck.sort();
        stuck
    }

    /// Get the number of registered sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn join(id: u64, handle: SessionHandle) {
    if handle.thread.join().is_err() {
        log::error!("Session {} on {} panicked", id, handle.interface);
    } else {
        log::debug!("Unregistered session {} on {}", id, handle.interface);
    }
}
