//! Meshnet per-peer permission checks against live INPUT/FORWARD chains
//!
//! Other peers' rules interleave with the ones under test, so there is no
//! exact expected list to compare with. Instead each permission flag maps to
//! presence, absence and relative-position predicates on the peer's rules.
//! Positions are indices in the `iptables -S` listing: a smaller index means
//! the rule is evaluated first.

use crate::core::context::Subnet;
use crate::core::parse::{ParsedRule, parse_chain_dump};
use crate::core::rules::Tag;
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::net::Ipv4Addr;
use tracing::{debug, warn};

/// TCP port the fileshare service listens on
pub const FILESHARE_PORT: u16 = 49111;

/// Meshnet peer address range (CGNAT)
pub const MESHNET_RANGE: &str = "100.64.0.0/10";

/// What one peer is allowed to do on this machine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSet {
    /// Use this machine as an exit node
    #[serde(default)]
    pub routing: bool,
    /// Reach this machine's local networks
    #[serde(default)]
    pub local: bool,
    /// Open connections to this machine
    #[serde(default)]
    pub incoming: bool,
    /// Send files to this machine
    #[serde(default)]
    pub fileshare: bool,
}

/// Outcome of a permission check
#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub success: bool,
    pub errors: Vec<String>,
    /// Summary, every violation, then both chain dumps verbatim
    pub diagnostic: String,
}

impl ValidationReport {
    pub fn into_pair(self) -> (bool, String) {
        (self.success, self.diagnostic)
    }
}

/// Checks one peer's rules in the filter INPUT and FORWARD chains.
///
/// Never fails and performs no I/O: an empty or garbled dump simply fails the
/// checks that needed the missing rules.
#[derive(Debug, Clone)]
pub struct PermissionChainValidator {
    peer: Ipv4Addr,
    permissions: PermissionSet,
    sole_peer: bool,
}

impl PermissionChainValidator {
    pub fn new(peer: Ipv4Addr, permissions: PermissionSet) -> Self {
        Self {
            peer,
            permissions,
            sole_peer: false,
        }
    }

    /// Declares that no other Meshnet peer exists.
    ///
    /// The FORWARD LAN drops are shared by all peers, so their absence can
    /// only be asserted when this peer is the only one.
    pub fn sole_peer(mut self, sole_peer: bool) -> Self {
        self.sole_peer = sole_peer;
        self
    }

    pub fn validate(&self, input_chain: &str, forward_chain: &str) -> ValidationReport {
        let input = chain_rules(input_chain, "INPUT");
        let forward: Vec<ParsedRule> = chain_rules(forward_chain, "FORWARD")
            .into_iter()
            .filter(|r| r.has_comment(Tag::ExitnodeTransient.as_str()))
            .collect();

        let mut errors = Vec::new();
        self.check_input(&input, &mut errors);
        self.check_forward(&forward, &mut errors);

        let success = errors.is_empty();
        if success {
            debug!(peer = %self.peer, "peer permissions consistent with chains");
        } else {
            warn!(peer = %self.peer, violations = errors.len(), "peer permissions violated");
        }

        let diagnostic = self.diagnostic(&errors, input_chain, forward_chain);
        ValidationReport {
            success,
            errors,
            diagnostic,
        }
    }

    fn peer_net(&self) -> Ipv4Network {
        Ipv4Network::from(self.peer)
    }

    fn is_from_peer(&self, rule: &ParsedRule) -> bool {
        rule.source.is_some_and(|s| s.is(self.peer_net()))
    }

    fn mentions_peer(&self, rule: &ParsedRule) -> bool {
        let peer = self.peer_net();
        self.is_from_peer(rule) || rule.destination.is_some_and(|d| d.network == peer)
    }

    fn is_fileshare(&self, rule: &ParsedRule) -> bool {
        let port = FILESHARE_PORT.to_string();
        self.is_from_peer(rule)
            && rule.destination.is_none()
            && rule.protocol.as_deref() == Some("tcp")
            && rule.dport.as_deref() == Some(port.as_str())
            && rule.sport.is_none()
            && rule.target_is("ACCEPT")
    }

    /// Peer-wide ACCEPT with no address, port or interface narrowing
    fn is_peer_accept(&self, rule: &ParsedRule) -> bool {
        self.is_from_peer(rule)
            && rule.destination.is_none()
            && rule.is_address_only()
            && rule.target_is("ACCEPT")
    }

    fn is_peer_to_lan(&self, rule: &ParsedRule, lan: Ipv4Network, target: &str) -> bool {
        self.is_from_peer(rule)
            && rule.destination.is_some_and(|d| d.is(lan))
            && rule.target_is(target)
    }

    fn check_input(&self, rules: &[ParsedRule], errors: &mut Vec<String>) {
        let perms = self.permissions;
        let peer = self.peer;

        let fileshare = rules.iter().position(|r| self.is_fileshare(r));
        let incoming = rules.iter().position(|r| self.is_peer_accept(r));

        match (perms.fileshare, fileshare) {
            (true, None) => errors.push(format!(
                "fileshare ACCEPT for {peer}:{FILESHARE_PORT}/tcp missing from INPUT chain"
            )),
            (false, Some(_)) => errors.push(format!(
                "fileshare ACCEPT for {peer}:{FILESHARE_PORT}/tcp present without fileshare permission"
            )),
            _ => {}
        }

        match (perms.incoming, incoming) {
            (true, None) => errors.push(format!("incoming ACCEPT for {peer} missing from INPUT chain")),
            (false, Some(_)) => errors.push(format!(
                "incoming ACCEPT for {peer} present without incoming permission"
            )),
            _ => {}
        }

        if !perms.incoming {
            let stray: Vec<&str> = rules
                .iter()
                .filter(|r| self.mentions_peer(r) && !self.is_fileshare(r))
                .map(|r| r.raw.as_str())
                .collect();
            if !stray.is_empty() {
                errors.push(format!(
                    "rules found in INCOMING chain without incoming permission: {}",
                    stray.join(" | ")
                ));
            }
            return;
        }

        let lan_allowed = perms.routing && perms.local;
        for lan in lan_networks() {
            let drop = rules.iter().position(|r| self.is_peer_to_lan(r, lan, "DROP"));
            match (lan_allowed, drop, incoming) {
                (true, Some(_), _) => errors.push(format!(
                    "LAN DROP {peer} -> {lan} present although routing and local access are allowed"
                )),
                (false, None, _) => {
                    errors.push(format!("LAN DROP {peer} -> {lan} missing from INPUT chain"));
                }
                (false, Some(drop), Some(accept)) if drop > accept => errors.push(format!(
                    "LAN rule ineffective: DROP {peer} -> {lan} is listed below the incoming ACCEPT"
                )),
                _ => {}
            }
        }
    }

    fn check_forward(&self, rules: &[ParsedRule], errors: &mut Vec<String>) {
        let perms = self.permissions;
        let peer = self.peer;
        let meshnet = meshnet_network();

        let routing = rules.iter().position(|r| self.is_peer_accept(r));
        match (perms.routing, routing) {
            (true, None) => errors.push(format!("routing ACCEPT for {peer} missing from FORWARD chain")),
            (false, Some(_)) => errors.push(format!(
                "routing ACCEPT for {peer} present without routing permission"
            )),
            _ => {}
        }

        if !perms.routing && !perms.local {
            let stray: Vec<&str> = rules
                .iter()
                .filter(|r| self.is_from_peer(r))
                .map(|r| r.raw.as_str())
                .collect();
            if !stray.is_empty() {
                errors.push(format!(
                    "FORWARD rules found for {peer} without routing or local permission: {}",
                    stray.join(" | ")
                ));
            }
        }

        for lan in lan_networks() {
            let drop = rules.iter().position(|r| {
                r.source.is_some_and(|s| s.is(meshnet))
                    && r.destination.is_some_and(|d| d.is(lan))
                    && r.target_is("DROP")
            });
            let lan_accept = rules.iter().position(|r| self.is_peer_to_lan(r, lan, "ACCEPT"));

            if perms.routing || perms.local {
                if drop.is_none() {
                    errors.push(format!("LAN DROP {meshnet} -> {lan} missing from FORWARD chain"));
                }
            } else if self.sole_peer && drop.is_some() {
                errors.push(format!(
                    "LAN DROP {meshnet} -> {lan} present although no peer has routing or local access"
                ));
            }

            if perms.routing {
                if let (Some(accept), Some(drop)) = (routing, drop) {
                    if perms.local && accept > drop {
                        errors.push(format!(
                            "routing ACCEPT for {peer} is listed below the LAN DROP for {lan}: local networks stay blocked"
                        ));
                    }
                    if !perms.local && accept < drop {
                        errors.push(format!(
                            "routing ACCEPT for {peer} is listed above the LAN DROP for {lan}: peer can reach local networks"
                        ));
                    }
                }
                if !perms.local && lan_accept.is_some() {
                    errors.push(format!(
                        "peer LAN ACCEPT {peer} -> {lan} present without local permission"
                    ));
                }
            } else if perms.local {
                match (lan_accept, drop) {
                    (None, _) => errors.push(format!("peer LAN ACCEPT {peer} -> {lan} missing from FORWARD chain")),
                    (Some(accept), Some(drop)) if accept > drop => errors.push(format!(
                        "peer LAN ACCEPT {peer} -> {lan} is listed below the LAN DROP"
                    )),
                    _ => {}
                }
            }
        }
    }

    fn diagnostic(&self, errors: &[String], input_chain: &str, forward_chain: &str) -> String {
        let PermissionSet {
            routing,
            local,
            incoming,
            fileshare,
        } = self.permissions;

        let mut out = String::new();
        let _ = writeln!(
            out,
            "peer {}: routing={routing} local={local} incoming={incoming} fileshare={fileshare}",
            self.peer
        );
        if errors.is_empty() {
            let _ = writeln!(out, "result: OK");
        } else {
            let _ = writeln!(out, "result: FAILED ({} violation(s))", errors.len());
            for error in errors {
                let _ = writeln!(out, "  - {error}");
            }
        }
        for (name, dump) in [("INPUT", input_chain), ("FORWARD", forward_chain)] {
            let _ = writeln!(out, "{name} chain:");
            if dump.trim().is_empty() {
                let _ = writeln!(out, "(empty)");
            } else {
                let _ = writeln!(out, "{}", dump.trim_end());
            }
        }
        out
    }
}

fn chain_rules(dump: &str, chain: &str) -> Vec<ParsedRule> {
    parse_chain_dump(dump)
        .into_iter()
        .filter(|r| r.chain == chain)
        .collect()
}

fn lan_networks() -> Vec<Ipv4Network> {
    Subnet::lan_ranges().iter().map(Subnet::network).collect()
}

fn meshnet_network() -> Ipv4Network {
    MESHNET_RANGE
        .parse()
        .unwrap_or_else(|_| Ipv4Network::from(Ipv4Addr::new(100, 64, 0, 0)))
}

/// Checks `permissions` for `peer` against the INPUT and FORWARD dumps.
///
/// Returns whether every check passed and a diagnostic that always includes
/// both dumps.
pub fn validate_peer_permissions(
    peer: Ipv4Addr,
    permissions: PermissionSet,
    input_chain: &str,
    forward_chain: &str,
) -> (bool, String) {
    PermissionChainValidator::new(peer, permissions)
        .validate(input_chain, forward_chain)
        .into_pair()
}
