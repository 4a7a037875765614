//! Lightweight Prometheus-compatible metrics for the VPN server.
//!
//! Uses atomic counters for lock-free instrumentation from session threads.
//! Renders metrics in Prometheus text exposition format, served on the
//! optional metrics HTTP endpoint and logged at shutdown.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// How often the metrics thread checks for shutdown
const METRICS_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Lightweight Prometheus-compatible metrics for the VPN server.
pub struct Metrics {
    /// Sessions currently forwarding or setting up (gauge)
    pub active_sessions: AtomicU64,
    /// Sessions that completed their handshake (counter)
    pub sessions_total: AtomicU64,
    /// Packets read from tunnel interfaces and sent to clients (counter)
    pub packets_to_client_total: AtomicU64,
    pub bytes_to_client_total: AtomicU64,
    /// Packets received from clients and written to interfaces (counter)
    pub packets_from_client_total: AtomicU64,
    pub bytes_from_client_total: AtomicU64,
    /// Keepalive messages sent (counter)
    pub keepalives_sent_total: AtomicU64,
    /// Sessions closed because the client went silent (counter)
    pub peer_timeouts_total: AtomicU64,
    /// Sessions closed at the client's request (counter)
    pub client_disconnects_total: AtomicU64,
    /// Session setups refused because the address pool was empty (counter)
    pub pool_exhausted_total: AtomicU64,
    /// Failed client handshakes (counter)
    pub handshake_failures_total: AtomicU64,
    /// Server start time (for uptime calculation)
    pub start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            active_sessions: AtomicU64::new(0),
            sessions_total: AtomicU64::new(0),
            packets_to_client_total: AtomicU64::new(0),
            bytes_to_client_total: AtomicU64::new(0),
            packets_from_client_total: AtomicU64::new(0),
            bytes_from_client_total: AtomicU64::new(0),
            keepalives_sent_total: AtomicU64::new(0),
            peer_timeouts_total: AtomicU64::new(0),
            client_disconnects_total: AtomicU64::new(0),
            pool_exhausted_total: AtomicU64::new(0),
            handshake_failures_total: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Render metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let uptime = self.start_time.elapsed().as_secs();
        format!(
            "# HELP vpn_active_sessions Current number of tunnel sessions\n\
             # TYPE vpn_active_sessions gauge\n\
             vpn_active_sessions {}\n\
             # HELP vpn_sessions_total Total sessions with a completed handshake\n\
             # TYPE vpn_sessions_total counter\n\
             vpn_sessions_total {}\n\
             # HELP vpn_packets_to_client_total Total packets forwarded to clients\n\
             # TYPE vpn_packets_to_client_total counter\n\
             vpn_packets_to_client_total {}\n\
             # HELP vpn_bytes_to_client_total Total bytes forwarded to clients\n\
             # TYPE vpn_bytes_to_client_total counter\n\
             vpn_bytes_to_client_total {}\n\
             # HELP vpn_packets_from_client_total Total packets forwarded from clients\n\
             # TYPE vpn_packets_from_client_total counter\n\
             vpn_packets_from_client_total {}\n\
             # HELP vpn_bytes_from_client_total Total bytes forwarded from clients\n\
             # TYPE vpn_bytes_from_client_total counter\n\
             vpn_bytes_from_client_total {}\n\
             # HELP vpn_keepalives_sent_total Total keepalive messages sent\n\
             # TYPE vpn_keepalives_sent_total counter\n\
             vpn_keepalives_sent_total {}\n\
             # HELP vpn_peer_timeouts_total Total sessions closed by peer timeout\n\
             # TYPE vpn_peer_timeouts_total counter\n\
             vpn_peer_timeouts_total {}\n\
             # HELP vpn_client_disconnects_total Total sessions closed by the client\n\
             # TYPE vpn_client_disconnects_total counter\n\
             vpn_client_disconnects_total {}\n\
             # HELP vpn_pool_exhausted_total Total session setups refused for lack of addresses\n\
             # TYPE vpn_pool_exhausted_total counter\n\
             vpn_pool_exhausted_total {}\n\
             # HELP vpn_handshake_failures_total Total failed client handshakes\n\
             # TYPE vpn_handshake_failures_total counter\n\
             vpn_handshake_failures_total {}\n\
             # HELP vpn_uptime_seconds Server uptime in seconds\n\
             # TYPE vpn_uptime_seconds gauge\n\
             vpn_uptime_seconds {}\n",
            self.active_sessions.load(Ordering::Relaxed),
            self.sessions_total.load(Ordering::Relaxed),
            self.packets_to_client_total.load(Ordering::Relaxed),
            self.bytes_to_client_total.load(Ordering::Relaxed),
            self.packets_from_client_total.load(Ordering::Relaxed),
            self.bytes_from_client_total.load(Ordering::Relaxed),
            self.keepalives_sent_total.load(Ordering::Relaxed),
            self.peer_timeouts_total.load(Ordering::Relaxed),
            self.client_disconnects_total.load(Ordering::Relaxed),
            self.pool_exhausted_total.load(Ordering::Relaxed),
            self.handshake_failures_total.load(Ordering::Relaxed),
            uptime,
        )
    }

    /// One-line summary for logs
    pub fn summary(&self) -> String {
        format!(
            "sessions={} active={} to_client={}pkt/{}B from_client={}pkt/{}B \
             keepalives={} timeouts={} disconnects={} exhausted={} handshake_failures={}",
            self.sessions_total.load(Ordering::Relaxed),
            self.active_sessions.load(Ordering::Relaxed),
            self.packets_to_client_total.load(Ordering::Relaxed),
            self.bytes_to_client_total.load(Ordering::Relaxed),
            self.packets_from_client_total.load(Ordering::Relaxed),
            self.bytes_from_client_total.load(Ordering::Relaxed),
            self.keepalives_sent_total.load(Ordering::Relaxed),
            self.peer_timeouts_total.load(Ordering::Relaxed),
            self.client_disconnects_total.load(Ordering::Relaxed),
            self.pool_exhausted_total.load(Ordering::Relaxed),
            self.handshake_failures_total.load(Ordering::Relaxed),
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// HTTP Endpoint
// ============================================================================

/// Serve `metrics` on `addr` until `shutdown` is raised.
///
/// Any request gets the rendered metrics; the endpoint is for scrapers only.
pub fn serve(
    metrics: Arc<Metrics>,
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
) -> io::Result<JoinHandle<()>> {
    let listener = TcpListener::bind(addr)?;
    listener.set_nonblocking(true)?;

    log::info!("Metrics endpoint listening on http://{}/metrics", addr);

    thread::Builder::new()
        .name("metrics".to_string())
        .spawn(move || {
            while !shutdown.load(Ordering::Relaxed) {
                match listener.accept() {
                    Ok((stream, peer)) => {
                        if let Err(e) = respond(stream, &metrics) {
                            log::debug!("Metrics request from {} failed: {}", peer, e);
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        thread::sleep(METRICS_POLL_INTERVAL);
                    }
                    Err(e) => {
                        log::warn!("Metrics accept failed: {}", e);
                        thread::sleep(METRICS_POLL_INTERVAL);
                    }
                }
            }
        })
}

fn respond(mut stream: TcpStream, metrics: &Metrics) -> io::Result<()> {
    // Short blocking exchange; scrapers send a single small request
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(Duration::from_secs(1)))?;

    let mut request = [0u8; 1024];
    let _ = stream.read(&mut request)?;

    let body = metrics.render();
    let response = format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: text/plain; version=0.0.4\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(response.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_session_counters() {
        let m = Metrics::new();
        m.sessions_total.fetch_add(5, Ordering::Relaxed);
        m.bytes_to_client_total.fetch_add(1024, Ordering::Relaxed);
        let output = m.render();
        assert!(output.contains("vpn_sessions_total 5"));
        assert!(output.contains("vpn_bytes_to_client_total 1024"));
        assert!(output.contains("vpn_active_sessions 0"));
        assert!(output.contains("# TYPE vpn_uptime_seconds gauge"));
    }

    #[test]
    fn test_fresh_counters_are_zero() {
        let m = Metrics::default();
        assert_eq!(m.active_sessions.load(Ordering::Relaxed), 0);
        assert_eq!(m.keepalives_sent_total.load(Ordering::Relaxed), 0);
        assert_eq!(m.peer_timeouts_total.load(Ordering::Relaxed), 0);
        assert_eq!(m.pool_exhausted_total.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_render_forwarding_counters() {
        let m = Metrics::new();
        m.active_sessions.fetch_add(3, Ordering::Relaxed);
        m.packets_from_client_total.fetch_add(100, Ordering::Relaxed);
        m.peer_timeouts_total.fetch_add(2, Ordering::Relaxed);
        let output = m.render();
        assert!(output.contains("vpn_active_sessions 3"));
        assert!(output.contains("vpn_packets_from_client_total 100"));
        assert!(output.contains("vpn_peer_timeouts_total 2"));
    }

    #[test]
    fn test_every_counter_has_help_and_type() {
        let m = Metrics::new();
        let output = m.render();
        for name in [
            "vpn_sessions_total",
            "vpn_packets_to_client_total",
            "vpn_bytes_from_client_total",
            "vpn_keepalives_sent_total",
            "vpn_client_disconnects_total",
            "vpn_handshake_failures_total",
        ] {
            assert!(output.contains(&format!("# HELP {}", name)));
            assert!(output.contains(&format!("# TYPE {} counter", name)));
        }
        assert!(output.contains("# TYPE vpn_active_sessions gauge"));
    }

    #[test]
    fn test_shutdown_summary() {
        let m = Metrics::new();
        m.client_disconnects_total.fetch_add(1, Ordering::Relaxed);
        assert!(m.summary().contains("disconnects=1"));
    }

    #[test]
    fn test_http_endpoint_serves_render() {
        let m = Arc::new(Metrics::new());
        m.sessions_total.fetch_add(7, Ordering::Relaxed);
        let shutdown = Arc::new(AtomicBool::new(false));

        // Bind to an ephemeral port first to learn a free one
        let addr = TcpListener::bind("127.0.0.1:0")
            .and_then(|l| l.local_addr())
            .unwrap();
        let handle = serve(m, addr, shutdown.clone()).unwrap();

        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(b"GET /metrics HTTP/1.1\r\n\r\n").unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("vpn_sessions_total 7"));

        shutdown.store(true, Ordering::Relaxed);
        handle.join().unwrap();
    }
}
