//! System command execution
//!
//! Interface and NAT setup is delegated to the standard Linux tools
//! (`ip`, `iptables`, `sysctl`). Commands are run directly, never through a
//! shell, so addresses and interface names cannot inject extra commands.

use std::fmt;
use std::io;
use std::process::Command;

/// Errors from running a system command
#[derive(Debug)]
pub enum ShellError {
    /// The program could not be started
    Spawn { command: String, source: io::Error },
    /// The program ran but exited unsuccessfully
    Failed { command: String, status: Option<i32>, stderr: String },
}

impl fmt::Display for ShellError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShellError::Spawn { command, source } => {
                write!(f, "failed to start '{}': {}", command, source)
            }
            ShellError::Failed { command, status, stderr } => match status {
                Some(code) => write!(f, "'{}' exited with {}: {}", command, code, stderr.trim()),
                None => write!(f, "'{}' killed by signal: {}", command, stderr.trim()),
            },
        }
    }
}

impl std::error::Error for ShellError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ShellError::Spawn { source, .. } => Some(source),
            ShellError::Failed { .. } => None,
        }
    }
}

/// Runs system commands on behalf of the interface and NAT managers
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[&str]) -> Result<(), ShellError>;
}

/// Render a command line for logs and errors
pub fn command_line(program: &str, args: &[&str]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

/// [`CommandRunner`] backed by `std::process::Command`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<(), ShellError> {
        let command = command_line(program, args);

        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|source| ShellError::Spawn {
                command: command.clone(),
                source,
            })?;

        if output.status.success() {
            log::info!("{}: (OK: EXECUTED)", command);
            Ok(())
        } else {
            let err = ShellError::Failed {
                command,
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            };
            log::debug!("{}", err);
            Err(err)
        }
    }
}
