//! Per-session TUN interfaces
//!
//! Every session gets its own point-to-point TUN device named after its
//! slot (`vpn_tun<slot>`), configured with the server's virtual address on
//! the local end and the client's virtual address on the peer end.
//!
//! # Device Lifecycle
//!
//! ```text
//! ip tuntap add dev vpn_tun3 mode tun
//! ip addr add 10.0.0.5 peer 10.0.0.6/32 dev vpn_tun3
//! ip link set dev vpn_tun3 mtu 1400 up
//! open("/dev/net/tun", O_RDWR | O_NONBLOCK) + TUNSETIFF(IFF_TUN | IFF_NO_PI)
//! ...
//! ip link delete vpn_tun3
//! ```
//!
//! Requires `CAP_NET_ADMIN`.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::net::Ipv4Addr;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::Arc;

use crate::shell::{CommandRunner, ShellError};

// ============================================================================
// Constants
// ============================================================================

/// Path to the TUN clone device
const TUN_DEVICE_PATH: &str = "/dev/net/tun";

/// Where the kernel lists network interfaces
const SYS_CLASS_NET: &str = "/sys/class/net";

/// IFF_TUN flag - TUN device (no Ethernet headers)
const IFF_TUN: libc::c_short = 0x0001;

/// IFF_NO_PI flag - no packet information prefix
const IFF_NO_PI: libc::c_short = 0x1000;

/// TUNSETIFF ioctl number
const TUNSETIFF: libc::c_ulong = 0x4004_54ca;

/// Default interface name prefix
pub const DEFAULT_INTERFACE_PREFIX: &str = "vpn_tun";

// ============================================================================
// Errors
// ============================================================================

/// Errors creating or opening a tunnel interface
#[derive(Debug)]
pub enum InterfaceError {
    /// Name does not fit the kernel limit or contains invalid characters
    InvalidName(String),
    /// A configuration command failed
    Command(ShellError),
    /// The TUN device could not be opened or attached
    Open { name: String, source: io::Error },
}

impl fmt::Display for InterfaceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterfaceError::InvalidName(name) => write!(f, "invalid interface name '{}'", name),
            InterfaceError::Command(e) => write!(f, "interface setup failed: {}", e),
            InterfaceError::Open { name, source } => {
                write!(f, "cannot attach to TUN interface {}: {}", name, source)
            }
        }
    }
}

impl std::error::Error for InterfaceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            InterfaceError::InvalidName(_) => None,
            InterfaceError::Command(e) => Some(e),
            InterfaceError::Open { source, .. } => Some(source),
        }
    }
}

impl From<ShellError> for InterfaceError {
    fn from(e: ShellError) -> Self {
        InterfaceError::Command(e)
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Raw IP packet handle on a tunnel interface.
///
/// Both calls are non-blocking: "no packet right now" is reported as
/// `Ok(0)` or an `ErrorKind::WouldBlock` error.
pub trait PacketDevice: Send {
    fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write_packet(&mut self, packet: &[u8]) -> io::Result<usize>;
}

/// Creates and destroys the kernel side of a session's tunnel
pub trait InterfaceBinder: Send + Sync {
    /// Create `name` as a point-to-point link `local` ↔ `peer` and open it
    fn create(
        &self,
        name: &str,
        local: Ipv4Addr,
        peer: Ipv4Addr,
    ) -> Result<Box<dyn PacketDevice>, InterfaceError>;

    /// Change the MTU of an existing interface
    fn set_mtu(&self, name: &str, mtu: u16) -> Result<(), InterfaceError>;

    /// Remove the interface; failures are logged only
    fn destroy(&self, name: &str);

    /// Remove leftover tunnel interfaces named `<prefix><slot>`.
    /// Returns how many were found.
    fn sweep(&self, prefix: &str) -> usize;
}

/// Interface name for a slot
pub fn interface_name(prefix: &str, slot: u32) -> String {
    format!("{}{}", prefix, slot)
}

/// Whether `name` is acceptable to the kernel (`IFNAMSIZ` includes the NUL)
pub fn is_valid_interface_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() < libc::IFNAMSIZ
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b == b'.')
}

// ============================================================================
// TUN Device
// ============================================================================

/// Interface request structure for the TUNSETIFF ioctl
#[repr(C)]
struct IfReq {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    _padding: [u8; 22],
}

impl IfReq {
    fn new(name: &str, flags: libc::c_short) -> Self {
        let mut ifr = IfReq {
            ifr_name: [0; libc::IFNAMSIZ],
            ifr_flags: flags,
            _padding: [0; 22],
        };
        for (dst, &src) in ifr.ifr_name.iter_mut().zip(name.as_bytes()) {
            *dst = src as libc::c_char;
        }
        ifr
    }
}

/// Non-blocking handle on an existing TUN interface
pub struct TunDevice {
    name: String,
    file: File,
}

impl TunDevice {
    /// Attach to the TUN interface `name`
    pub fn open(name: &str) -> Result<Self, InterfaceError> {
        if !is_valid_interface_name(name) {
            return Err(InterfaceError::InvalidName(name.to_string()));
        }

        let open_err = |source| InterfaceError::Open {
            name: name.to_string(),
            source,
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(TUN_DEVICE_PATH)
            .map_err(open_err)?;

        let mut ifr = IfReq::new(name, IFF_TUN | IFF_NO_PI);

        // SAFETY: `ifr` is a properly sized, initialized ifreq that outlives
        // the call, and the fd is owned by `file`.
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &mut ifr as *mut IfReq) };
        if rc < 0 {
            return Err(open_err(io::Error::last_os_error()));
        }

        Ok(TunDevice {
            name: name.to_string(),
            file,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl PacketDevice for TunDevice {
    fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }

    fn write_packet(&mut self, packet: &[u8]) -> io::Result<usize> {
        self.file.write(packet)
    }
}

// ============================================================================
// TUN Binder
// ============================================================================

/// [`InterfaceBinder`] using `ip` for configuration and `/dev/net/tun` for I/O
pub struct TunBinder {
    runner: Arc<dyn CommandRunner>,
    mtu: u16,
}

impl TunBinder {
    pub fn new(runner: Arc<dyn CommandRunner>, mtu: u16) -> Self {
        TunBinder { runner, mtu }
    }

    fn configure(&self, name: &str, local: Ipv4Addr, peer: Ipv4Addr) -> Result<(), ShellError> {
        let local = local.to_string();
        let peer = format!("{}/32", peer);
        let mtu = self.mtu.to_string();

        self.runner
            .run("ip", &["addr", "add", &local, "peer", &peer, "dev", name])?;
        self.runner
            .run("ip", &["link", "set", "dev", name, "mtu", &mtu, "up"])
    }
}

impl InterfaceBinder for TunBinder {
    fn create(
        &self,
        name: &str,
        local: Ipv4Addr,
        peer: Ipv4Addr,
    ) -> Result<Box<dyn PacketDevice>, InterfaceError> {
        if !is_valid_interface_name(name) {
            return Err(InterfaceError::InvalidName(name.to_string()));
        }

        self.runner
            .run("ip", &["tuntap", "add", "dev", name, "mode", "tun"])?;

        let device = self
            .configure(name, local, peer)
            .map_err(InterfaceError::from)
            .and_then(|()| TunDevice::open(name));

        match device {
            Ok(device) => {
                log::info!("[{}] Interface up: {} <-> {}", name, local, peer);
                Ok(Box::new(device))
            }
            Err(e) => {
                // The link exists at this point; do not leave it behind
                self.destroy(name);
                Err(e)
            }
        }
    }

    fn set_mtu(&self, name: &str, mtu: u16) -> Result<(), InterfaceError> {
        let mtu = mtu.to_string();
        self.runner
            .run("ip", &["link", "set", "dev", name, "mtu", &mtu])?;
        Ok(())
    }

    fn destroy(&self, name: &str) {
        if let Err(e) = self.runner.run("ip", &["link", "delete", name]) {
            log::warn!("[{}] Failed to delete interface: {}", name, e);
        }
    }

    fn sweep(&self, prefix: &str) -> usize {
        let stale = list_interfaces(Path::new(SYS_CLASS_NET), prefix);
        for name in &stale {
            log::info!("Removing stale interface {}", name);
            self.destroy(name);
        }
        stale.len()
    }
}

/// TUN interfaces under `dir` (a `/sys/class/net`-like directory) named
/// `<prefix><slot>`.
///
/// Only entries with a `tun_flags` attribute count, so physical links and
/// other virtual devices are never picked up. An empty prefix matches nothing.
pub fn list_interfaces(dir: &Path, prefix: &str) -> Vec<String> {
    if prefix.is_empty() {
        return Vec::new();
    }

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            log::warn!("Cannot list interfaces in {}: {}", dir.display(), e);
            return Vec::new();
        }
    };

    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| is_slot_name(name, prefix))
        .filter(|name| dir.join(name).join("tun_flags").exists())
        .collect();
    names.sort();
    names
}

/// `name` is `prefix` followed by a decimal slot number
fn is_slot_name(name: &str, prefix: &str) -> bool {
    match name.strip_prefix(prefix) {
        Some(slot) => !slot.is_empty() && slot.bytes().all(|b| b.is_ascii_digit()),
        None => false,
    }
}

/// Whether a network interface with this name exists
pub fn interface_exists(name: &str) -> bool {
    is_valid_interface_name(name) && Path::new(SYS_CLASS_NET).join(name).exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        commands: Mutex<Vec<String>>,
        fail_on: Option<&'static str>,
    }

    impl CommandRunner for Recorder {
        fn run(&self, program: &str, args: &[&str]) -> Result<(), ShellError> {
            let command = crate::shell::command_line(program, args);
            self.commands.lock().push(command.clone());
            match self.fail_on {
                Some(needle) if command.contains(needle) => Err(ShellError::Failed {
                    command,
                    status: Some(2),
                    stderr: "RTNETLINK answers: Operation not permitted".to_string(),
                }),
                _ => Ok(()),
            }
        }
    }

    #[test]
    fn test_interface_name() {
        assert_eq!(interface_name("vpn_tun", 0), "vpn_tun0");
        assert_eq!(interface_name("vpn_tun", 42), "vpn_tun42");
    }

    #[test]
    fn test_interface_name_validation() {
        assert!(is_valid_interface_name("vpn_tun0"));
        assert!(is_valid_interface_name("eth0"));
        assert!(!is_valid_interface_name(""));
        assert!(!is_valid_interface_name("a-very-long-interface"));
        assert!(!is_valid_interface_name("tun0; rm -rf"));
    }

    #[test]
    fn test_create_rolls_back_on_config_failure() {
        let runner = Arc::new(Recorder {
            fail_on: Some("addr add"),
            ..Default::default()
        });
        let binder = TunBinder::new(runner.clone(), 1400);

        let result = binder.create(
            "vpn_tun7",
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
        );
        assert!(matches!(result, Err(InterfaceError::Command(_))));

        let commands = runner.commands.lock().clone();
        assert_eq!(
            commands,
            vec![
                "ip tuntap add dev vpn_tun7 mode tun".to_string(),
                "ip addr add 10.0.0.1 peer 10.0.0.2/32 dev vpn_tun7".to_string(),
                "ip link delete vpn_tun7".to_string(),
            ]
        );
    }

    #[test]
    fn test_create_fails_without_rollback_when_add_fails() {
        let runner = Arc::new(Recorder {
            fail_on: Some("tuntap"),
            ..Default::default()
        });
        let binder = TunBinder::new(runner.clone(), 1400);

        let result = binder.create(
            "vpn_tun1",
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
        );
        assert!(result.is_err());
        assert_eq!(runner.commands.lock().len(), 1);
    }

    #[test]
    fn test_set_mtu() {
        let runner = Arc::new(Recorder::default());
        let binder = TunBinder::new(runner.clone(), 1400);
        binder.set_mtu("vpn_tun3", 1306).unwrap();
        assert_eq!(
            runner.commands.lock().clone(),
            vec!["ip link set dev vpn_tun3 mtu 1306".to_string()]
        );
    }

    #[test]
    fn test_create_rejects_bad_name_before_running_commands() {
        let runner = Arc::new(Recorder::default());
        let binder = TunBinder::new(runner.clone(), 1400);
        let result = binder.create("bad name", Ipv4Addr::LOCALHOST, Ipv4Addr::LOCALHOST);
        assert!(matches!(result, Err(InterfaceError::InvalidName(_))));
        assert!(runner.commands.lock().is_empty());
    }

    /// Fake `/sys/class/net`; `tun` entries get a `tun_flags` attribute
    fn fake_sys_class_net(tag: &str, tun: &[&str], other: &[&str]) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("vpn-server-{}-{}", tag, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        for name in tun {
            std::fs::create_dir_all(dir.join(name)).unwrap();
            std::fs::write(dir.join(name).join("tun_flags"), "0x1001\n").unwrap();
        }
        for name in other {
            std::fs::create_dir_all(dir.join(name)).unwrap();
        }
        dir
    }

    #[test]
    fn test_list_interfaces_only_slot_tunnels() {
        let dir = fake_sys_class_net(
            "ifaces",
            &["vpn_tun1", "vpn_tun0", "vpn_tunnel0", "vpn_tun_x"],
            &["eth0", "lo", "vpn_tun9"],
        );

        // vpn_tun9 exists but is not a TUN device
        let names = list_interfaces(&dir, "vpn_tun");
        assert_eq!(names, vec!["vpn_tun0".to_string(), "vpn_tun1".to_string()]);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_list_interfaces_short_prefixes_spare_host_links() {
        let dir = fake_sys_class_net("ifaces-short", &["tun0"], &["eth0", "eth1", "lo", "ifb0"]);

        assert!(list_interfaces(&dir, "").is_empty());
        assert!(list_interfaces(&dir, "l").is_empty());
        assert!(list_interfaces(&dir, "eth").is_empty());
        assert_eq!(list_interfaces(&dir, "tun"), vec!["tun0".to_string()]);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_list_interfaces_missing_dir() {
        let names = list_interfaces(Path::new("/nonexistent/sys/class/net"), "vpn_tun");
        assert!(names.is_empty());
    }
}
