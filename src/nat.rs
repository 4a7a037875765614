//! NAT egress for the virtual network
//!
//! Clients' traffic leaves through the physical interface with a single
//! masquerade rule:
//!
//! ```text
//! iptables -t nat -A POSTROUTING -s 10.0.0.0/8 -o eth0 -j MASQUERADE
//! ```
//!
//! A rule left behind by a crashed run is deleted before the new one is
//! added, so repeated starts never stack duplicate rules.

use std::sync::Arc;

use crate::address_pool::NetworkSpec;
use crate::shell::{CommandRunner, ShellError};

/// Installed masquerade rule plus IPv4 forwarding; removed on drop
pub struct NatRule {
    runner: Arc<dyn CommandRunner>,
    source: String,
    out_interface: String,
    installed: bool,
}

impl NatRule {
    /// Enable forwarding and install the rule for `network` via `out_interface`
    pub fn install(
        runner: Arc<dyn CommandRunner>,
        network: NetworkSpec,
        out_interface: &str,
    ) -> Result<Self, ShellError> {
        let mut rule = NatRule {
            runner,
            source: network.to_string(),
            out_interface: out_interface.to_string(),
            installed: false,
        };

        rule.runner
            .run("sysctl", &["-w", "net.ipv4.ip_forward=1"])?;

        // Stale rule from a previous run; absence is not an error
        if rule.iptables("-D").is_ok() {
            log::info!("Removed stale NAT rule for {}", rule.source);
        }

        rule.iptables("-A")?;
        rule.installed = true;
        log::info!("NAT: {} masqueraded via {}", rule.source, rule.out_interface);

        Ok(rule)
    }

    /// Delete the rule and disable forwarding. Idempotent.
    pub fn remove(&mut self) {
        if !self.installed {
            return;
        }
        self.installed = false;

        if let Err(e) = self.iptables("-D") {
            log::warn!("Failed to remove NAT rule for {}: {}", self.source, e);
        }
        if let Err(e) = self.runner.run("sysctl", &["-w", "net.ipv4.ip_forward=0"]) {
            log::warn!("Failed to disable IP forwarding: {}", e);
        }
    }

    pub fn is_installed(&self) -> bool {
        self.installed
    }

    fn iptables(&self, action: &str) -> Result<(), ShellError> {
        self.runner.run(
            "iptables",
            &[
                "-t",
                "nat",
                action,
                "POSTROUTING",
                "-s",
                &self.source,
                "-o",
                &self.out_interface,
                "-j",
                "MASQUERADE",
            ],
        )
    }
}

impl Drop for NatRule {
    fn drop(&mut self) {
        self.remove();
    }
}
