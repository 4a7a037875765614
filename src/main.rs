//! VPN Server
//!
//! A QUIC server that:
//! - Gives every client its own TUN interface and virtual address
//! - Forwards IP packets between the interface and QUIC DATAGRAMs
//! - Masquerades client traffic out of a physical interface

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use signal_hook::consts::{SIGINT, SIGTERM};

use vpn_server::config::{ConfigError, ServerConfig};
use vpn_server::quic::ALPN_PROTOCOL;
use vpn_server::Server;

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .init();

    // Parse command line arguments
    let args: Vec<String> = std::env::args().collect();
    let config = match ServerConfig::from_args(&args) {
        Ok(config) => config,
        Err(ConfigError::HelpRequested) => {
            println!("{}", ConfigError::HelpRequested);
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    config.check_host()?;

    log::info!("VPN Server starting...");
    log::info!("  Port:      {}", config.port);
    log::info!("  MTU:       {}", config.mtu);
    log::info!("  Network:   {}", config.network);
    log::info!("  DNS:       {}", config.dns);
    log::info!("  Route:     {}/{}", config.route, config.route_prefix);
    log::info!("  Interface: {}", config.physical_interface);
    log::info!("  Timeout:   {}s", config.peer_timeout.as_secs());
    log::info!("  Cert:      {}", config.cert_path);
    log::info!("  Key:       {}", config.key_path);
    if let Some(ca) = &config.ca_path {
        log::info!("  Client CA: {}", ca);
    }
    log::info!("  ALPN:      {}", String::from_utf8_lossy(ALPN_PROTOCOL));

    // SIGINT/SIGTERM request a graceful shutdown
    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGINT, Arc::clone(&shutdown))?;
    signal_hook::flag::register(SIGTERM, Arc::clone(&shutdown))?;

    // Create server and run
    let server = Server::new(config)?;
    server.run(shutdown)?;

    log::info!("VPN Server stopped");
    Ok(())
}
