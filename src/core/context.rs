//! The declared VPN/firewall state a scenario is rendered from
//!
//! Every value type here is validated when it is constructed, so the
//! generator downstream is total: it never sees a malformed port, subnet or
//! interface name. Text parsing (`FromStr`, serde) reports bad input as an
//! error; the typed constructors treat bad input as a programming error and
//! panic.

use crate::core::error::Error;
use crate::core::generator::DEFAULT_FWMARK;
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Private LAN ranges in the order the daemon lists them
pub const LAN_RANGES: [&str; 4] = ["10.0.0.0/8", "172.16.0.0/12", "192.168.0.0/16", "169.254.0.0/16"];

/// Transport protocol of an allowlisted port
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum Protocol {
    #[strum(serialize = "udp")]
    Udp,
    #[strum(serialize = "tcp")]
    Tcp,
    /// Both UDP and TCP
    #[strum(to_string = "all", serialize = "udp|tcp", serialize = "tcp|udp")]
    All,
}

impl Protocol {
    pub const fn as_str(self) -> &'static str {
        match self {
            Protocol::Udp => "udp",
            Protocol::Tcp => "tcp",
            Protocol::All => "all",
        }
    }

    pub const fn includes_udp(self) -> bool {
        matches!(self, Protocol::Udp | Protocol::All)
    }

    pub const fn includes_tcp(self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::All)
    }
}

/// Network interface name, validated against kernel naming rules
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Interface(String);

impl Interface {
    /// # Errors
    ///
    /// Returns `Err` if `name` is empty or not a valid kernel interface name.
    pub fn new(name: impl Into<String>) -> Result<Self, Error> {
        let name = name.into();
        crate::validators::validate_interface(&name)
            .map(Self)
            .map_err(|message| Error::parse("interface", message))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Interface {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Interface> for String {
    fn from(iface: Interface) -> Self {
        iface.0
    }
}

impl FromStr for Interface {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single port or an inclusive range, rendered `22` or `3000:3100`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PortValue {
    start: u16,
    end: u16,
}

impl PortValue {
    /// # Panics
    ///
    /// Panics if `port` is 0.
    pub fn single(port: u16) -> Self {
        assert!(port != 0, "port 0 cannot be allowlisted");
        Self {
            start: port,
            end: port,
        }
    }

    /// # Panics
    ///
    /// Panics if either bound is 0 or `start > end`.
    pub fn range(start: u16, end: u16) -> Self {
        assert!(start != 0 && end != 0, "port 0 cannot be allowlisted");
        assert!(start <= end, "port range {start}:{end} is inverted");
        Self { start, end }
    }

    pub fn start(self) -> u16 {
        self.start
    }

    pub fn end(self) -> u16 {
        self.end
    }

    pub fn is_range(self) -> bool {
        self.start != self.end
    }
}

impl fmt::Display for PortValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_range() {
            write!(f, "{}:{}", self.start, self.end)
        } else {
            write!(f, "{}", self.start)
        }
    }
}

impl FromStr for PortValue {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let parse = |part: &str| -> Result<u16, Error> {
            let port = part
                .trim()
                .parse::<u16>()
                .map_err(|_| Error::parse("port", format!("'{part}' is not a port number")))?;
            crate::validators::validate_port(port).map_err(|m| Error::parse("port", m))
        };

        match s.split_once([':', '-']) {
            Some((start, end)) => {
                let (start, end) = crate::validators::validate_port_range(parse(start)?, parse(end)?)
                    .map_err(|m| Error::parse("port", m))?;
                Ok(Self { start, end })
            }
            None => Ok(Self::single(parse(s)?)),
        }
    }
}

impl TryFrom<String> for PortValue {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PortValue> for String {
    fn from(value: PortValue) -> Self {
        value.to_string()
    }
}

/// An allowlisted port: value plus protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Port {
    pub value: PortValue,
    pub protocol: Protocol,
}

impl Port {
    pub fn new(value: PortValue, protocol: Protocol) -> Self {
        Self { value, protocol }
    }

    pub fn tcp(port: u16) -> Self {
        Self::new(PortValue::single(port), Protocol::Tcp)
    }

    pub fn udp(port: u16) -> Self {
        Self::new(PortValue::single(port), Protocol::Udp)
    }

    pub fn all(port: u16) -> Self {
        Self::new(PortValue::single(port), Protocol::All)
    }
}

/// `VALUE[/PROTOCOL]`, e.g. `22/tcp`, `3000:3100/udp` or `53` (both protocols)
impl FromStr for Port {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (value, protocol) = match s.split_once('/') {
            Some((value, proto)) => {
                let protocol = proto
                    .parse::<Protocol>()
                    .map_err(|_| Error::parse("protocol", format!("unknown protocol '{proto}'")))?;
                (value, protocol)
            }
            None => (s, Protocol::All),
        };
        Ok(Self::new(value.parse()?, protocol))
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.value, self.protocol)
    }
}

/// An allowlisted IPv4 subnet, normalized to its network address the way
/// `iptables -S` prints it (`192.168.1.5/24` becomes `192.168.1.0/24`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Subnet(Ipv4Network);

impl Subnet {
    pub fn new(network: Ipv4Network) -> Self {
        // Prefix was already valid for `network`, so this cannot fail
        Self(Ipv4Network::new(network.network(), network.prefix()).unwrap_or(network))
    }

    pub fn network(&self) -> Ipv4Network {
        self.0
    }

    /// The four private LAN ranges, daemon order
    pub fn lan_ranges() -> Vec<Subnet> {
        LAN_RANGES
            .iter()
            .filter_map(|s| s.parse::<Ipv4Network>().ok())
            .map(Self::new)
            .collect()
    }
}

impl FromStr for Subnet {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let network = s
            .trim()
            .parse::<Ipv4Network>()
            .map_err(|e| Error::parse("subnet", format!("'{s}': {e}")))?;
        Ok(Self::new(network))
    }
}

impl TryFrom<String> for Subnet {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Subnet> for String {
    fn from(subnet: Subnet) -> Self {
        subnet.to_string()
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.0.network(), self.0.prefix())
    }
}

/// Which rule-generation branch a context renders through.
///
/// Exactly one variant applies to any [`FirewallContext`]; see
/// [`FirewallContext::render_mode`] for the precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumIter)]
pub enum RenderMode {
    /// Disconnected without kill switch: the daemon has flushed its rules
    Inactive,
    KillSwitch,
    ConnectedBare,
    ConnectedPortsAndSubnets,
    ConnectedSubnetsOnly,
    ConnectedPortsOnly,
}

/// The situation under test
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallContext {
    #[serde(default)]
    pub connected: bool,
    #[serde(default)]
    pub kill_switch: bool,
    /// Discovery order, as the kernel lists them
    #[serde(default)]
    pub interfaces: Vec<Interface>,
    #[serde(default)]
    pub allowlisted_ports: Vec<Port>,
    #[serde(default)]
    pub allowlisted_subnets: Vec<Subnet>,
    /// Folds the private LAN ranges into the subnet allowlist
    #[serde(default)]
    pub lan_discovery: bool,
    #[serde(default = "default_fwmark")]
    pub fwmark: u32,
}

fn default_fwmark() -> u32 {
    DEFAULT_FWMARK
}

impl Default for FirewallContext {
    fn default() -> Self {
        Self {
            connected: false,
            kill_switch: false,
            interfaces: Vec::new(),
            allowlisted_ports: Vec::new(),
            allowlisted_subnets: Vec::new(),
            lan_discovery: false,
            fwmark: DEFAULT_FWMARK,
        }
    }
}

impl FirewallContext {
    pub fn new(interfaces: Vec<Interface>) -> Self {
        Self {
            interfaces,
            ..Self::default()
        }
    }

    pub fn with_connected(mut self, connected: bool) -> Self {
        self.connected = connected;
        self
    }

    pub fn with_kill_switch(mut self, kill_switch: bool) -> Self {
        self.kill_switch = kill_switch;
        self
    }

    pub fn with_ports(mut self, ports: impl IntoIterator<Item = Port>) -> Self {
        self.allowlisted_ports.extend(ports);
        self
    }

    pub fn with_subnets(mut self, subnets: impl IntoIterator<Item = Subnet>) -> Self {
        self.allowlisted_subnets.extend(subnets);
        self
    }

    pub fn with_lan_discovery(mut self, lan_discovery: bool) -> Self {
        self.lan_discovery = lan_discovery;
        self
    }

    pub fn with_fwmark(mut self, fwmark: u32) -> Self {
        self.fwmark = fwmark;
        self
    }

    /// Declared subnets (first occurrence wins) followed by any LAN range
    /// LAN discovery adds that is not already declared
    pub fn effective_subnets(&self) -> Vec<Subnet> {
        let mut subnets: Vec<Subnet> = Vec::with_capacity(self.allowlisted_subnets.len() + 4);
        let extra = if self.lan_discovery {
            Subnet::lan_ranges()
        } else {
            Vec::new()
        };
        for subnet in self.allowlisted_subnets.iter().copied().chain(extra) {
            if !subnets.contains(&subnet) {
                subnets.push(subnet);
            }
        }
        subnets
    }

    /// First matching branch wins:
    /// 1. disconnected with kill switch
    /// 2. connected, nothing allowlisted
    /// 3. connected, subnets and ports
    /// 4. connected, subnets only
    /// 5. connected, ports only
    pub fn render_mode(&self) -> RenderMode {
        let has_ports = !self.allowlisted_ports.is_empty();
        let has_subnets = !self.effective_subnets().is_empty();

        match (self.connected, self.kill_switch, has_ports, has_subnets) {
            (false, true, _, _) => RenderMode::KillSwitch,
            (false, false, _, _) => RenderMode::Inactive,
            (true, _, false, false) => RenderMode::ConnectedBare,
            (true, _, true, true) => RenderMode::ConnectedPortsAndSubnets,
            (true, _, false, true) => RenderMode::ConnectedSubnetsOnly,
            (true, _, true, false) => RenderMode::ConnectedPortsOnly,
        }
    }
}
