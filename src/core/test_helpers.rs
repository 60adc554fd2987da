//! Shared test utilities for core module tests
//!
//! Provides common test helpers to avoid duplication across test suites.
//! This module is only compiled in test mode.

use crate::core::context::{FirewallContext, Interface, LAN_RANGES, Port, Subnet};
use crate::core::permissions::{MESHNET_RANGE, PermissionSet};
use std::net::Ipv4Addr;
use std::sync::{Mutex, Once};

/// Mutex for tests that need exclusive access to environment variables.
///
/// Use this when your test needs to:
/// 1. Temporarily change env vars to different values
/// 2. Restore env vars after the test
/// 3. Test behavior when env vars are absent
///
/// For tests that just need mock iptables, use `setup_mock_iptables()`
/// instead - it's simpler and doesn't require holding a guard.
///
/// # Example
///
/// ```ignore
/// let _guard = ENV_VAR_MUTEX.lock().unwrap();
/// unsafe {
///     std::env::remove_var("FWEXPECT_IPTABLES_COMMAND");
///     std::env::set_var("FWEXPECT_ELEVATION_METHOD", "sudo");
/// }
/// // ... test with custom env state ...
/// unsafe {
///     std::env::remove_var("FWEXPECT_ELEVATION_METHOD");
/// }
/// ```
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

static MOCK_IPTABLES_INIT: Once = Once::new();

/// Points every iptables call at `tests/mock_iptables.sh` and disables
/// elevation.
///
/// Safe to call from any number of tests; the environment is set once.
pub fn setup_mock_iptables() {
    MOCK_IPTABLES_INIT.call_once(|| {
        let mock_path = format!("{}/tests/mock_iptables.sh", env!("CARGO_MANIFEST_DIR"));
        // SAFETY: This is only called once due to Once, and only in test code.
        unsafe {
            std::env::set_var("FWEXPECT_IPTABLES_COMMAND", &mock_path);
            std::env::set_var("FWEXPECT_TEST_NO_ELEVATION", "1");
        }
    });
}

pub fn ifaces(names: &[&str]) -> Vec<Interface> {
    names
        .iter()
        .map(|n| Interface::new(*n).expect("valid interface name"))
        .collect()
}

/// Disconnected context with no allowlist on the given interfaces
pub fn context(names: &[&str]) -> FirewallContext {
    FirewallContext::new(ifaces(names))
}

pub fn subnet(s: &str) -> Subnet {
    s.parse().expect("valid subnet")
}

/// Parses `VALUE[/PROTO]`, e.g. `22/tcp` or `3000:3100`
pub fn port(s: &str) -> Port {
    s.parse().expect("valid port")
}

pub fn perms(routing: bool, local: bool, incoming: bool, fileshare: bool) -> PermissionSet {
    PermissionSet {
        routing,
        local,
        incoming,
        fileshare,
    }
}

/// Builds filter INPUT/FORWARD dumps the way `iptables -S` lists them.
///
/// `insert_*` models `iptables -I` (new rule on top), `append_*` models
/// `iptables -A`.
#[derive(Debug, Clone, Default)]
pub struct ChainDump {
    input: Vec<String>,
    forward: Vec<String>,
}

impl ChainDump {
    pub fn new() -> Self {
        Self::default()
    }

    /// Chains as the daemon leaves them for one peer with `permissions`
    /// (kill switch off).
    pub fn for_peer(peer: Ipv4Addr, permissions: PermissionSet) -> Self {
        let mut dump = Self::new();

        if permissions.incoming {
            dump.insert_input(&format!("-A INPUT -s {peer}/32 -m comment --comment nordvpn -j ACCEPT"));
            if !(permissions.routing && permissions.local) {
                for lan in LAN_RANGES.iter().rev() {
                    dump.insert_input(&format!(
                        "-A INPUT -s {peer}/32 -d {lan} -m comment --comment nordvpn -j DROP"
                    ));
                }
            }
        }
        if permissions.fileshare {
            dump.insert_input(&format!(
                "-A INPUT -s {peer}/32 -p tcp -m tcp --dport 49111 -m comment --comment nordvpn -j ACCEPT"
            ));
        }

        let accept = format!("-A FORWARD -s {peer}/32 -m comment --comment nordvpn-exitnode-transient -j ACCEPT");
        if permissions.routing && !permissions.local {
            dump.insert_forward(&accept);
        }
        if permissions.routing || permissions.local {
            dump = dump.with_forward_lan_drops();
        }
        if permissions.local {
            if permissions.routing {
                dump.insert_forward(&accept);
            } else {
                for lan in LAN_RANGES {
                    dump.insert_forward(&format!(
                        "-A FORWARD -s {peer}/32 -d {lan} -m comment --comment nordvpn-exitnode-transient -j ACCEPT"
                    ));
                }
            }
        }
        dump
    }

    pub fn insert_input(&mut self, rule: &str) {
        self.input.insert(0, rule.to_string());
    }

    pub fn append_input(&mut self, rule: &str) {
        self.input.push(rule.to_string());
    }

    pub fn insert_forward(&mut self, rule: &str) {
        self.forward.insert(0, rule.to_string());
    }

    pub fn with_forward(mut self, rule: &str) -> Self {
        self.insert_forward(rule);
        self
    }

    /// Inserts the Meshnet-range LAN drops on top of the chain
    pub fn with_forward_lan_drops(mut self) -> Self {
        for lan in LAN_RANGES {
            self.insert_forward(&lan_drop(lan));
        }
        self
    }

    pub fn input(&self) -> String {
        render("INPUT", &self.input)
    }

    pub fn forward(&self) -> String {
        render("FORWARD", &self.forward)
    }
}

fn lan_drop(lan: &str) -> String {
    format!("-A FORWARD -s {MESHNET_RANGE} -d {lan} -m comment --comment nordvpn-exitnode-transient -j DROP")
}

fn render(chain: &str, rules: &[String]) -> String {
    let mut out = format!("-P {chain} ACCEPT\n");
    for rule in rules {
        out.push_str(rule);
        out.push('\n');
    }
    out
}
