//! Privilege elevation for reading packet-filter state
//!
//! `iptables -S` needs root. fwexpect runs as an unprivileged user and only
//! elevates that one call; interface discovery and the VPN client's status
//! commands run as the invoking user.
//!
//! # Elevation Strategy
//!
//! - **Preferred**: `run0` when available (systemd v256+, no SUID)
//! - **Fallback**: `sudo`
//!
//! # Environment Variables
//!
//! - `FWEXPECT_ELEVATION_METHOD`: Force a specific method (`sudo`, `run0`, or
//!   `none`). `none` runs the binary directly, for hosts where the harness user
//!   already holds `CAP_NET_ADMIN`.
//!   Example: `FWEXPECT_ELEVATION_METHOD=sudo fwexpect check --live`
//!
//! - `FWEXPECT_TEST_NO_ELEVATION`: Bypass elevation entirely (for testing only).
//!
//! # Security
//!
//! - Only the configured iptables binary can be elevated
//! - Commands are constructed without shell interpolation
//! - Binaries are checked for availability before use
//!
//! # Example
//!
//! ```no_run
//! use fwexpect::elevation::create_elevated_iptables_command;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut cmd = create_elevated_iptables_command("iptables", &["-t", "mangle", "-S"])?;
//! let output = cmd.output().await?;
//! # Ok(())
//! # }
//! ```

use std::io;
use tokio::process::Command;

pub const ELEVATION_METHOD_ENV: &str = "FWEXPECT_ELEVATION_METHOD";
pub const NO_ELEVATION_ENV: &str = "FWEXPECT_TEST_NO_ELEVATION";

/// Error type for privilege elevation operations
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    /// Neither run0 nor sudo found in PATH
    #[error("no elevation tool found - install sudo or run as root")]
    NoElevationTool,

    /// Requested elevation method is not available (binary not found)
    #[error("Elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(String),

    /// Invalid value for `FWEXPECT_ELEVATION_METHOD`
    #[error("Invalid FWEXPECT_ELEVATION_METHOD '{0}'. Valid options: sudo, run0, none")]
    InvalidMethod(String),

    #[error("Invalid program name '{0}'")]
    InvalidProgram(String),

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// How the iptables call gets root
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ElevationMethod {
    Sudo,
    Run0,
    None,
}

/// Reads `FWEXPECT_ELEVATION_METHOD`. Unset or empty means automatic.
fn method_from_env() -> Result<Option<ElevationMethod>, ElevationError> {
    match std::env::var(ELEVATION_METHOD_ENV) {
        Ok(method) if !method.trim().is_empty() => method
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ElevationError::InvalidMethod(method.to_lowercase())),
        _ => Ok(None),
    }
}

/// Checks if a binary exists in PATH
fn binary_exists(name: &str) -> bool {
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths).find_map(|dir| {
                let full_path = dir.join(name);
                if full_path.is_file() {
                    Some(full_path)
                } else {
                    None
                }
            })
        })
        .is_some()
}

fn direct(program: &str, args: &[&str]) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd
}

fn wrapped(wrapper: &str, program: &str, args: &[&str]) -> Command {
    let mut cmd = Command::new(wrapper);
    cmd.arg(program).args(args);
    cmd
}

fn build_elevated_command(program: &str, args: &[&str]) -> Result<Command, ElevationError> {
    if program.is_empty() || program.chars().any(char::is_whitespace) {
        return Err(ElevationError::InvalidProgram(program.to_string()));
    }

    // 1. Strict test mode override
    if std::env::var(NO_ELEVATION_ENV).is_ok() {
        return Ok(direct(program, args));
    }

    // 2. A bad override is reported even when running as root
    let method = method_from_env()?;

    // 3. Direct root execution
    if nix::unistd::getuid().is_root() {
        return Ok(direct(program, args));
    }

    // 4. Explicit method
    match method {
        Some(ElevationMethod::None) => return Ok(direct(program, args)),
        Some(m @ (ElevationMethod::Sudo | ElevationMethod::Run0)) => {
            let wrapper = m.to_string();
            if !binary_exists(&wrapper) {
                return Err(ElevationError::MethodNotAvailable(wrapper));
            }
            return Ok(wrapped(&wrapper, program, args));
        }
        None => {}
    }

    // 5. Automatic detection - prefer run0, fall back to sudo
    if binary_exists("run0") {
        Ok(wrapped("run0", program, args))
    } else if binary_exists("sudo") {
        Ok(wrapped("sudo", program, args))
    } else {
        Err(ElevationError::NoElevationTool)
    }
}

/// Creates an elevated iptables command.
///
/// `program` is the configured iptables binary (`iptables`, `iptables-legacy`,
/// or a path). Arguments are passed without shell interpretation.
///
/// # Testing
///
/// Set `FWEXPECT_TEST_NO_ELEVATION=1` to run the binary directly.
pub fn create_elevated_iptables_command(program: &str, args: &[&str]) -> Result<Command, ElevationError> {
    build_elevated_command(program, args)
}
