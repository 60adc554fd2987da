//! Adapters for the host state the harness inspects
//!
//! Interface discovery, packet-filter dumps and the VPN client's status
//! surface are all reached through child processes. The parsing halves are
//! plain functions over the captured text so they can be tested without a
//! host.
//!
//! Rule dumps can also be saved as snapshots: JSON files in the state
//! directory carrying a SHA-256 checksum of the dump, of which the newest
//! [`MAX_SNAPSHOTS`] are kept.

use crate::config::HarnessConfig;
use crate::core::context::{FirewallContext, Interface, Port, PortValue, Protocol, Subnet};
use crate::core::error::{Error, Result, SnapshotError};
use crate::core::rules::Table;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

pub const MAX_SNAPSHOTS: usize = 5;

/// What the VPN client reports about the tunnel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionState {
    pub connected: bool,
    pub kill_switch: bool,
}

/// The subset of `settings` output that shapes the firewall
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VpnSettings {
    pub kill_switch: bool,
    pub lan_discovery: bool,
    pub allowlisted_ports: Vec<Port>,
    pub allowlisted_subnets: Vec<Subnet>,
}

async fn run(mut cmd: Command, what: &str) -> Result<String> {
    let output = cmd.output().await.map_err(|e| {
        debug!("Failed to spawn {what}: {e}");
        Error::Io(e)
    })?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        error!("{what} failed: {stderr}");
        Err(Error::Command {
            message: if stderr.is_empty() {
                format!("{what} exited with {}", output.status)
            } else {
                format!("{what}: {stderr}")
            },
            stderr: Some(stderr),
            exit_code: output.status.code(),
        })
    }
}

fn command(program: &str, args: &[&str]) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd
}

/// Device names from `ip route show default`, in listing order, deduplicated
pub fn parse_default_route_devices(text: &str) -> Vec<String> {
    let mut devices: Vec<String> = Vec::new();
    for line in text.lines() {
        let mut tokens = line.split_whitespace();
        while let Some(token) = tokens.next() {
            if token == "dev"
                && let Some(name) = tokens.next()
                && !devices.iter().any(|d| d == name)
            {
                devices.push(name.to_string());
            }
        }
    }
    devices
}

fn to_interfaces(names: Vec<String>) -> Vec<Interface> {
    names
        .into_iter()
        .filter_map(|name| match Interface::new(name.as_str()) {
            Ok(iface) => Some(iface),
            Err(e) => {
                warn!("Ignoring interface '{name}': {e}");
                None
            }
        })
        .collect()
}

/// Non-loopback interfaces with an IPv4 address, in kernel order
fn interfaces_from_os() -> Result<Vec<String>> {
    use network_interface::{Addr, NetworkInterface, NetworkInterfaceConfig};

    let all = NetworkInterface::show().map_err(|e| Error::Internal(format!("listing interfaces: {e}")))?;
    let mut names: Vec<String> = Vec::new();
    for iface in all {
        let has_ipv4 = iface
            .addr
            .iter()
            .any(|a| matches!(a, Addr::V4(v4) if !v4.ip.is_loopback()));
        if has_ipv4 && iface.name != "lo" && !names.contains(&iface.name) {
            names.push(iface.name);
        }
    }
    Ok(names)
}

/// Interfaces that carry a default route, in the order the kernel lists them.
///
/// Falls back to every non-loopback IPv4 interface when the `ip` binary is
/// missing.
///
/// # Errors
///
/// Returns [`Error::NoDefaultRoute`] when nothing is found.
pub async fn discover_interfaces(config: &HarnessConfig) -> Result<Vec<Interface>> {
    let names = match run(command(&config.ip_command, &["route", "show", "default"]), "ip route").await {
        Ok(text) => parse_default_route_devices(&text),
        Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("'{}' not found, listing interfaces from the OS instead", config.ip_command);
            interfaces_from_os()?
        }
        Err(e) => return Err(e),
    };

    let interfaces = to_interfaces(names);
    if interfaces.is_empty() {
        return Err(Error::NoDefaultRoute);
    }
    info!(
        "Discovered interfaces: {}",
        interfaces.iter().map(Interface::as_str).collect::<Vec<_>>().join(", ")
    );
    Ok(interfaces)
}

/// `iptables -t TABLE -S`, elevated
pub async fn snapshot_rules(config: &HarnessConfig, table: Table) -> Result<String> {
    let cmd = crate::elevation::create_elevated_iptables_command(
        &config.iptables_command,
        &["-t", table.as_str(), "-S"],
    )?;
    debug!("Reading {table} table");
    run(cmd, "iptables").await
}

/// `iptables -t TABLE -S CHAIN`, elevated
pub async fn dump_chain(config: &HarnessConfig, table: Table, chain: &str) -> Result<String> {
    let cmd = crate::elevation::create_elevated_iptables_command(
        &config.iptables_command,
        &["-t", table.as_str(), "-S", chain],
    )?;
    debug!("Reading {table} {chain} chain");
    run(cmd, "iptables").await
}

/// Drops the progress spinner the client prints before its output
fn clean_line(line: &str) -> &str {
    line.rsplit('\r')
        .next()
        .unwrap_or(line)
        .trim_start_matches(|c: char| !c.is_ascii_alphanumeric())
        .trim_end()
}

fn enabled(value: &str) -> bool {
    value.trim().eq_ignore_ascii_case("enabled")
}

/// Reads `Status: Connected` from the client's `status` output
pub fn parse_status(text: &str) -> bool {
    text.lines()
        .filter_map(|line| clean_line(line).split_once(':'))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("status"))
        .is_some_and(|(_, value)| value.trim().eq_ignore_ascii_case("connected"))
}

fn parse_port_line(line: &str) -> Result<Port> {
    let (numbers, protocols) = line
        .split_once('(')
        .ok_or_else(|| Error::parse("allowlisted port", format!("no protocol in '{line}'")))?;
    let protocol: Protocol = protocols
        .trim_end_matches(')')
        .trim()
        .parse()
        .map_err(|_| Error::parse("allowlisted port", format!("unknown protocol in '{line}'")))?;
    let value: PortValue = numbers.split_whitespace().collect::<String>().parse()?;
    Ok(Port::new(value, protocol))
}

/// Parses the client's `settings` output.
///
/// Multi-line values (`Allowlisted ports:`, `Allowlisted subnets:`) continue
/// until the next `Key: value` line.
pub fn parse_settings(text: &str) -> Result<VpnSettings> {
    #[derive(PartialEq)]
    enum Section {
        Other,
        Ports,
        Subnets,
    }

    let mut settings = VpnSettings::default();
    let mut section = Section::Other;

    for raw in text.lines() {
        let line = clean_line(raw);
        if line.is_empty() {
            continue;
        }

        let starts_with_letter = line.starts_with(|c: char| c.is_ascii_alphabetic());
        if starts_with_letter && let Some((key, value)) = line.split_once(':') {
            section = Section::Other;
            match key.trim().to_ascii_lowercase().as_str() {
                "kill switch" => settings.kill_switch = enabled(value),
                "lan discovery" => settings.lan_discovery = enabled(value),
                "allowlisted ports" => section = Section::Ports,
                "allowlisted subnets" => section = Section::Subnets,
                _ => {}
            }
            continue;
        }

        match section {
            Section::Ports => settings.allowlisted_ports.push(parse_port_line(line)?),
            Section::Subnets => settings.allowlisted_subnets.push(line.parse()?),
            Section::Other => {}
        }
    }

    Ok(settings)
}

pub async fn vpn_settings(config: &HarnessConfig) -> Result<VpnSettings> {
    let text = run(command(&config.vpn_command, &["settings"]), "settings").await?;
    parse_settings(&text)
}

/// Connection and kill switch state from the client's `status` and
/// `settings`
pub async fn connection_state(config: &HarnessConfig) -> Result<ConnectionState> {
    let status = run(command(&config.vpn_command, &["status"]), "status").await?;
    let settings = vpn_settings(config).await?;
    let state = ConnectionState {
        connected: parse_status(&status),
        kill_switch: settings.kill_switch,
    };
    info!("Connection state: connected={} kill_switch={}", state.connected, state.kill_switch);
    Ok(state)
}

/// Builds the context the daemon should currently be enforcing
pub async fn live_context(config: &HarnessConfig) -> Result<FirewallContext> {
    let interfaces = discover_interfaces(config).await?;
    let status = run(command(&config.vpn_command, &["status"]), "status").await?;
    let settings = vpn_settings(config).await?;

    Ok(FirewallContext::new(interfaces)
        .with_connected(parse_status(&status))
        .with_kill_switch(settings.kill_switch)
        .with_ports(settings.allowlisted_ports)
        .with_subnets(settings.allowlisted_subnets)
        .with_lan_discovery(settings.lan_discovery || config.lan_discovery)
        .with_fwmark(config.fwmark))
}

/// A saved table dump
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSnapshot {
    pub taken_at: DateTime<Utc>,
    pub table: Table,
    pub text: String,
    pub checksum: String,
}

impl RuleSnapshot {
    pub fn new(table: Table, text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            taken_at: Utc::now(),
            table,
            checksum: compute_checksum(&text),
            text,
        }
    }

    pub fn verify(&self) -> std::result::Result<(), SnapshotError> {
        let actual = compute_checksum(&self.text);
        if actual == self.checksum {
            Ok(())
        } else {
            Err(SnapshotError::ChecksumMismatch {
                expected: self.checksum.clone(),
                actual,
            })
        }
    }
}

/// SHA-256 of the dump text, lowercase hex
pub fn compute_checksum(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn snapshot_dir() -> Result<PathBuf> {
    crate::utils::get_state_dir().ok_or(Error::Snapshot(SnapshotError::StateDirUnavailable))
}

/// Saves into the state directory and prunes old snapshots
pub fn save_snapshot_to_disk(snapshot: &RuleSnapshot) -> Result<PathBuf> {
    save_snapshot_in(&snapshot_dir()?, snapshot)
}

/// Writes `snapshot` into `dir` through a temp file (mode 0600) that is
/// persisted under its final name.
pub fn save_snapshot_in(dir: &Path, snapshot: &RuleSnapshot) -> Result<PathBuf> {
    crate::utils::create_private_dir(dir)?;

    let timestamp = snapshot.taken_at.format("%Y%m%d_%H%M%S_%9f");
    let path = dir.join(format!("snapshot_{timestamp}_{}.json", snapshot.table));

    let json = serde_json::to_string_pretty(snapshot)?;
    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(json.as_bytes())?;
    file.as_file().sync_all()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }

    file.persist(&path).map_err(|e| Error::Io(e.error))?;
    info!("Snapshot saved to {}", path.display());

    cleanup_old_snapshots_in(dir)?;
    Ok(path)
}

/// Snapshot files in `dir`, newest first
pub fn list_snapshots_in(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut snapshots: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("snapshot_") && n.ends_with(".json"))
        })
        .collect();

    // Names embed a sortable timestamp
    snapshots.sort_by(|a, b| b.file_name().cmp(&a.file_name()));
    Ok(snapshots)
}

pub fn list_snapshots() -> Result<Vec<PathBuf>> {
    list_snapshots_in(&snapshot_dir()?)
}

fn cleanup_old_snapshots_in(dir: &Path) -> Result<()> {
    let mut snapshots = list_snapshots_in(dir)?;

    if snapshots.len() > MAX_SNAPSHOTS {
        for snapshot in snapshots.drain(MAX_SNAPSHOTS..) {
            if let Err(e) = std::fs::remove_file(&snapshot) {
                warn!("Failed to remove old snapshot {}: {e}", snapshot.display());
            } else {
                debug!("Removed old snapshot: {}", snapshot.display());
            }
        }
    }

    Ok(())
}

/// Reads a snapshot and verifies its checksum
pub fn load_snapshot(path: &Path) -> Result<RuleSnapshot> {
    if !path.exists() {
        return Err(SnapshotError::NotFound(path.display().to_string()).into());
    }
    let json = std::fs::read_to_string(path)?;
    let snapshot: RuleSnapshot = serde_json::from_str(&json)?;
    snapshot.verify()?;
    Ok(snapshot)
}
