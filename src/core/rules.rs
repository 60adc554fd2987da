//! Rule text, rule lists and the comment tags the VPN daemon stamps on its rules
//!
//! Rules are kept as the exact text `iptables -S` prints, because that is what
//! the live snapshot is compared against. [`RuleSpec`] composes that text from
//! structured parts so every generator block emits options in the same order.
//!
//! # Ordering
//!
//! A [`RuleList`] is an ordered sequence. Netfilter evaluates rules top to
//! bottom, so two lists with the same rules in a different order describe
//! different policies and compare unequal.

use crate::core::context::Protocol;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt::{self, Write as _};

/// First comment on every rule the VPN daemon installs in the mangle table
pub const NORDVPN_COMMENT: &str = "nordvpn";

/// Mask used by the daemon for every mark/connmark operation
pub const FULL_MASK: &str = "0xffffffff";

/// Comment tags that identify which daemon feature installed a rule.
///
/// Downstream assertions match on these strings, so the serialized form must
/// stay byte-identical to what the daemon writes.
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
pub enum Tag {
    #[strum(serialize = "drop-IPv4")]
    DropIpv4,
    #[strum(serialize = "api_allowlist")]
    ApiAllowlist,
    #[strum(serialize = "allowlist_subnets")]
    AllowlistSubnets,
    #[strum(serialize = "allowlist_ports_udp")]
    AllowlistPortsUdp,
    #[strum(serialize = "allowlist_ports_tcp")]
    AllowlistPortsTcp,
    #[strum(serialize = "deny-private-dns")]
    DenyPrivateDns,
    /// Sole comment on the `MARK` rules in mangle OUTPUT
    #[strum(serialize = "nordvpn_allowlist")]
    AllowlistMark,
    /// Meshnet exit-node rules in filter FORWARD
    #[strum(serialize = "nordvpn-exitnode-transient")]
    ExitnodeTransient,
}

impl Tag {
    pub const fn as_str(self) -> &'static str {
        match self {
            Tag::DropIpv4 => "drop-IPv4",
            Tag::ApiAllowlist => "api_allowlist",
            Tag::AllowlistSubnets => "allowlist_subnets",
            Tag::AllowlistPortsUdp => "allowlist_ports_udp",
            Tag::AllowlistPortsTcp => "allowlist_ports_tcp",
            Tag::DenyPrivateDns => "deny-private-dns",
            Tag::AllowlistMark => "nordvpn_allowlist",
            Tag::ExitnodeTransient => "nordvpn-exitnode-transient",
        }
    }

    /// Port allowlist tag for a concrete protocol
    ///
    /// # Panics
    ///
    /// Panics on [`Protocol::All`]; callers fan `All` out before tagging.
    pub fn for_ports(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Udp => Tag::AllowlistPortsUdp,
            Protocol::Tcp => Tag::AllowlistPortsTcp,
            Protocol::All => panic!("port rules are tagged per concrete protocol"),
        }
    }
}

/// Netfilter table a rule lives in
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Table {
    Mangle,
    Filter,
}

impl Table {
    pub const fn as_str(self) -> &'static str {
        match self {
            Table::Mangle => "mangle",
            Table::Filter => "filter",
        }
    }
}

/// Built-in chains the model renders or inspects
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
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum Chain {
    Prerouting,
    Input,
    Forward,
    Output,
    Postrouting,
}

impl Chain {
    pub const fn as_str(self) -> &'static str {
        match self {
            Chain::Prerouting => "PREROUTING",
            Chain::Input => "INPUT",
            Chain::Forward => "FORWARD",
            Chain::Output => "OUTPUT",
            Chain::Postrouting => "POSTROUTING",
        }
    }
}

/// Structured description of one rule, rendered in `iptables -S` option order:
/// addresses, interfaces, protocol with its port match, mark matches,
/// comments, then the jump.
#[derive(Debug, Clone)]
pub struct RuleSpec {
    chain: Chain,
    source: Option<String>,
    destination: Option<String>,
    in_interface: Option<String>,
    out_interface: Option<String>,
    protocol: Option<Protocol>,
    sport: Option<String>,
    dport: Option<String>,
    mark: Option<u32>,
    connmark: Option<u32>,
    comments: Vec<&'static str>,
    target: String,
}

impl RuleSpec {
    pub fn new(chain: Chain, target: impl Into<String>) -> Self {
        Self {
            chain,
            source: None,
            destination: None,
            in_interface: None,
            out_interface: None,
            protocol: None,
            sport: None,
            dport: None,
            mark: None,
            connmark: None,
            comments: Vec::new(),
            target: target.into(),
        }
    }

    pub fn source(mut self, source: impl fmt::Display) -> Self {
        self.source = Some(source.to_string());
        self
    }

    pub fn destination(mut self, destination: impl fmt::Display) -> Self {
        self.destination = Some(destination.to_string());
        self
    }

    pub fn in_interface(mut self, iface: impl fmt::Display) -> Self {
        self.in_interface = Some(iface.to_string());
        self
    }

    pub fn out_interface(mut self, iface: impl fmt::Display) -> Self {
        self.out_interface = Some(iface.to_string());
        self
    }

    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn sport(mut self, port: impl fmt::Display) -> Self {
        self.sport = Some(port.to_string());
        self
    }

    pub fn dport(mut self, port: impl fmt::Display) -> Self {
        self.dport = Some(port.to_string());
        self
    }

    pub fn mark(mut self, mark: u32) -> Self {
        self.mark = Some(mark);
        self
    }

    pub fn connmark(mut self, mark: u32) -> Self {
        self.connmark = Some(mark);
        self
    }

    /// Adds the daemon-wide `nordvpn` comment followed by `tag`
    pub fn tagged(mut self, tag: Tag) -> Self {
        self.comments.push(NORDVPN_COMMENT);
        self.comments.push(tag.as_str());
        self
    }

    /// Adds `tag` as the only comment
    pub fn comment(mut self, tag: Tag) -> Self {
        self.comments.push(tag.as_str());
        self
    }

    pub fn into_rule(self, table: Table) -> Rule {
        Rule::new(table, self.to_string())
    }
}

impl fmt::Display for RuleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "-A {}", self.chain.as_str())?;
        if let Some(source) = &self.source {
            write!(f, " -s {source}")?;
        }
        if let Some(destination) = &self.destination {
            write!(f, " -d {destination}")?;
        }
        if let Some(iface) = &self.in_interface {
            write!(f, " -i {iface}")?;
        }
        if let Some(iface) = &self.out_interface {
            write!(f, " -o {iface}")?;
        }
        if let Some(protocol) = self.protocol {
            let proto = protocol.as_str();
            write!(f, " -p {proto}")?;
            if self.sport.is_some() || self.dport.is_some() {
                write!(f, " -m {proto}")?;
            }
            if let Some(port) = &self.sport {
                write!(f, " --sport {port}")?;
            }
            if let Some(port) = &self.dport {
                write!(f, " --dport {port}")?;
            }
        }
        if let Some(mark) = self.mark {
            write!(f, " -m mark --mark {mark:#x}")?;
        }
        if let Some(mark) = self.connmark {
            write!(f, " -m connmark --mark {mark:#x}")?;
        }
        for comment in &self.comments {
            write!(f, " -m comment --comment {comment}")?;
        }
        write!(f, " -j {}", self.target)
    }
}

/// One rule as `iptables -S` prints it, plus the table it belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rule {
    pub table: Table,
    pub text: String,
}

impl Rule {
    pub fn new(table: Table, text: impl Into<String>) -> Self {
        Self {
            table,
            text: text.into(),
        }
    }

    /// Chain name from the leading `-A CHAIN`
    pub fn chain(&self) -> Option<&str> {
        let mut parts = self.text.split_whitespace();
        match parts.next() {
            Some("-A") => parts.next(),
            _ => None,
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Ordered rules, mangle segment first, then filter.
///
/// Equality is sequence equality. Duplicates are kept: the same text at two
/// positions is two rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleList {
    mangle: Vec<Rule>,
    filter: Vec<Rule>,
}

impl RuleList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a rule to the end of its table's segment
    pub fn push(&mut self, rule: Rule) {
        match rule.table {
            Table::Mangle => self.mangle.push(rule),
            Table::Filter => self.filter.push(rule),
        }
    }

    pub fn len(&self) -> usize {
        self.mangle.len() + self.filter.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mangle.is_empty() && self.filter.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.mangle.iter().chain(self.filter.iter())
    }

    pub fn table(&self, table: Table) -> &[Rule] {
        match table {
            Table::Mangle => &self.mangle,
            Table::Filter => &self.filter,
        }
    }

    /// Rule texts of one table, in order
    pub fn texts(&self, table: Table) -> Vec<&str> {
        self.table(table).iter().map(|r| r.text.as_str()).collect()
    }

    /// Rule texts of one chain, in order
    pub fn chain(&self, table: Table, chain: Chain) -> Vec<&str> {
        self.table(table)
            .iter()
            .filter(|r| r.chain() == Some(chain.as_str()))
            .map(|r| r.text.as_str())
            .collect()
    }

    /// Renders the list in `iptables-save` layout, one block per non-empty table
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for table in [Table::Mangle, Table::Filter] {
            let rules = self.table(table);
            if rules.is_empty() {
                continue;
            }
            let _ = writeln!(out, "*{table}");
            for rule in rules {
                let _ = writeln!(out, "{rule}");
            }
            let _ = writeln!(out, "COMMIT");
        }
        out
    }
}

impl Extend<Rule> for RuleList {
    fn extend<I: IntoIterator<Item = Rule>>(&mut self, iter: I) {
        for rule in iter {
            self.push(rule);
        }
    }
}

impl FromIterator<Rule> for RuleList {
    fn from_iter<I: IntoIterator<Item = Rule>>(iter: I) -> Self {
        let mut list = Self::new();
        list.extend(iter);
        list
    }
}

impl fmt::Display for RuleList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}

/// Numeric-aware string ordering: digit runs compare by value, everything
/// else byte-wise. `"3000:3100"` sorts after `"22"`, and `"80"` after `"8"`.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let (mut a, mut b) = (a.as_bytes(), b.as_bytes());
    loop {
        match (a.first(), b.first()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                let (run_a, rest_a) = split_digits(a);
                let (run_b, rest_b) = split_digits(b);
                let ord = compare_digit_runs(run_a, run_b);
                if ord != Ordering::Equal {
                    return ord;
                }
                a = rest_a;
                b = rest_b;
            }
            (Some(x), Some(y)) => {
                if x != y {
                    return x.cmp(y);
                }
                a = &a[1..];
                b = &b[1..];
            }
        }
    }
}

fn split_digits(s: &[u8]) -> (&[u8], &[u8]) {
    let end = s.iter().position(|c| !c.is_ascii_digit()).unwrap_or(s.len());
    s.split_at(end)
}

fn compare_digit_runs(a: &[u8], b: &[u8]) -> Ordering {
    let trim = |s: &'_ [u8]| -> usize { s.iter().take_while(|&&c| c == b'0').count() };
    let a = &a[trim(a)..];
    let b = &b[trim(b)..];
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}
