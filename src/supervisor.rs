//! Session supervisor and server assembly
//!
//! The supervisor loop keeps one session prepared (addresses, slot and
//! interface ready), waits for the next client, and hands both to a new
//! worker thread:
//!
//! ```text
//! loop:
//!   reap finished workers
//!   prepare session ──(pool exhausted)──► back off, retry
//!   accept client   ──(no client yet)───► keep the prepared session, retry
//!                   ──(port unusable)───► fatal
//!   spawn worker: handshake → parameters → forwarding → teardown
//! ```
//!
//! On shutdown every worker is cancelled and joined with a bounded wait;
//! interfaces of sessions that did not finish in time are destroyed anyway.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::channel::{ChannelError, PendingHandshake, SecureChannelListener};
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::interface::{interface_name, InterfaceBinder, TunBinder};
use crate::metrics;
use crate::nat::NatRule;
use crate::quic::{self, QuicListener};
use crate::registry::{SessionHandle, SessionRegistry};
use crate::session::{Session, SessionContext, SessionError};
use crate::shell::{CommandRunner, SystemRunner};

// ============================================================================
// Constants
// ============================================================================

/// Wait before retrying when no session can be prepared
const SETUP_BACKOFF: Duration = Duration::from_millis(500);

/// Wait after a transient accept error
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Bounded wait for workers to exit on shutdown
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Supervisor
// ============================================================================

/// Accepts clients and runs one session worker per client
pub struct Supervisor {
    ctx: SessionContext,
    listener: Box<dyn SecureChannelListener>,
    registry: SessionRegistry,
    drain_timeout: Duration,
}

impl Supervisor {
    pub fn new(ctx: SessionContext, listener: Box<dyn SecureChannelListener>) -> Self {
        Supervisor {
            ctx,
            listener,
            registry: SessionRegistry::new(),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    /// Run until `shutdown` is raised or the listening port fails, then
    /// drain all sessions.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<(), ServerError> {
        let result = self.accept_loop(shutdown);
        self.drain();
        result
    }

    fn accept_loop(&mut self, shutdown: &AtomicBool) -> Result<(), ServerError> {
        let mut prepared: Option<Session> = None;

        while !shutdown.load(Ordering::Relaxed) {
            self.registry.reap_finished();

            let session = match prepared.take() {
                Some(session) => session,
                None => match Session::prepare(self.ctx.clone()) {
                    Ok(session) => session,
                    Err(e) => {
                        if !matches!(e, SessionError::Exhausted(_)) {
                            log::error!("Session setup failed: {}", e);
                        }
                        thread::sleep(SETUP_BACKOFF);
                        continue;
                    }
                },
            };

            match self.listener.accept() {
                Ok(pending) => self.spawn(session, pending),
                Err(ChannelError::NoClient) => prepared = Some(session),
                Err(e) if e.is_fatal() => {
                    log::error!("{}", e);
                    return Err(e.into());
                }
                Err(e) => {
                    log::warn!("Accept failed: {}", e);
                    prepared = Some(session);
                    thread::sleep(ACCEPT_BACKOFF);
                }
            }
        }

        log::info!("Shutdown requested");
        Ok(())
    }

    /// Hand a prepared session and its client to a new worker thread
    fn spawn(&mut self, session: Session, pending: Box<dyn PendingHandshake>) {
        let interface = session.interface_name().unwrap_or("session").to_string();
        let peer = pending.peer_addr();
        let cancel = session.cancel_handle();

        let spawned = thread::Builder::new()
            .name(format!("session-{}", interface))
            .spawn(move || match session.run(pending) {
                Ok(reason) => log::debug!("Worker finished: {}", reason),
                Err(e) => log::warn!("Session aborted: {}", e),
            });

        match spawned {
            Ok(thread) => {
                self.registry.register(SessionHandle {
                    interface,
                    peer,
                    cancel,
                    thread,
                });
            }
            // The closure, and the session in it, is dropped and cleaned up
            Err(e) => log::error!("[{}] Cannot spawn session worker: {}", interface, e),
        }
    }

    /// Cancel and join every worker, then remove leftover interfaces
    pub fn drain(&mut self) {
        if !self.registry.is_empty() {
            log::info!("Stopping {} session(s)", self.registry.len());
        }
        self.registry.request_shutdown_all();

        let stuck = self.registry.join_all(self.drain_timeout);
        if !stuck.is_empty() {
            log::warn!("Sessions still running after drain: {}", stuck.join(", "));
        }

        for slot in self.ctx.slots.active_slots() {
            let name = interface_name(&self.ctx.config.interface_prefix, slot);
            log::warn!("[{}] Forcing interface removal", name);
            self.ctx.binder.destroy(&name);
        }
    }

    /// Sessions currently registered
    pub fn session_count(&self) -> usize {
        self.registry.len()
    }
}

// ============================================================================
// Server
// ============================================================================

/// Fully assembled server: QUIC listener, TUN interfaces, NAT
pub struct Server {
    config: Arc<ServerConfig>,
    supervisor: Supervisor,
    nat: NatRule,
}

impl Server {
    /// Load TLS material, clean up leftovers from a previous run, install NAT
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let config = Arc::new(config);

        let tls = quic::server_config(
            &config.cert_path,
            &config.key_path,
            config.ca_path.as_deref(),
        )
        .map_err(|e| {
            ServerError::Tls(format!(
                "{} (cert={}, key={})",
                e, config.cert_path, config.key_path
            ))
        })?;

        let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
        let binder = Arc::new(TunBinder::new(Arc::clone(&runner), config.mtu));

        let stale = binder.sweep(&config.interface_prefix);
        if stale > 0 {
            log::info!("Removed {} stale interface(s)", stale);
        }

        let nat = NatRule::install(
            Arc::clone(&runner),
            config.network,
            &config.physical_interface,
        )?;

        let ctx = SessionContext::new(Arc::clone(&config), binder);
        let listener = QuicListener::new(config.port, tls);
        log::info!(
            "Listening on UDP port {} ({} sessions max)",
            listener.port(),
            config.max_sessions()
        );

        Ok(Server {
            supervisor: Supervisor::new(ctx, Box::new(listener)),
            config,
            nat,
        })
    }

    /// Serve clients until `shutdown` is raised, then tear everything down
    pub fn run(mut self, shutdown: Arc<AtomicBool>) -> Result<(), ServerError> {
        let metrics = Arc::clone(&self.supervisor.context().metrics);

        let metrics_thread = match self.config.metrics_port {
            Some(port) => {
                let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
                match metrics::serve(Arc::clone(&metrics), addr, Arc::clone(&shutdown)) {
                    Ok(handle) => Some(handle),
                    Err(e) => {
                        log::warn!("Metrics endpoint unavailable on {}: {}", addr, e);
                        None
                    }
                }
            }
            None => None,
        };

        let result = self.supervisor.run(&shutdown);

        self.nat.remove();
        self.supervisor
            .context()
            .binder
            .sweep(&self.config.interface_prefix);

        // Stop the metrics thread even when the supervisor failed
        shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = metrics_thread {
            let _ = handle.join();
        }

        log::info!("Final metrics: {}", metrics.summary());
        result
    }
}
