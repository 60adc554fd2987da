//! Structural parsing of `iptables -S` output
//!
//! Only `-A` lines are parsed; policy (`-P`) and chain creation (`-N`) lines
//! are skipped. Options the model has no use for are kept in `extra` so a
//! rule is never silently mistaken for a simpler one.

use crate::core::error::{Error, Result};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// An address match, possibly negated with `!`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddrMatch {
    pub network: Ipv4Network,
    pub negated: bool,
}

impl AddrMatch {
    /// True for a positive match on exactly `network`
    pub fn is(&self, network: Ipv4Network) -> bool {
        !self.negated && self.network == network
    }
}

/// One `-A` rule broken into the fields the checks care about
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedRule {
    pub chain: String,
    pub source: Option<AddrMatch>,
    pub destination: Option<AddrMatch>,
    pub in_interface: Option<String>,
    pub out_interface: Option<String>,
    pub protocol: Option<String>,
    pub sport: Option<String>,
    pub dport: Option<String>,
    pub mark: Option<String>,
    pub connmark: Option<String>,
    pub comments: Vec<String>,
    pub target: Option<String>,
    pub target_args: Vec<String>,
    /// Options not modelled above, in order
    pub extra: Vec<String>,
    pub raw: String,
}

impl ParsedRule {
    pub fn has_comment(&self, comment: &str) -> bool {
        self.comments.iter().any(|c| c == comment)
    }

    pub fn target_is(&self, target: &str) -> bool {
        self.target.as_deref() == Some(target)
    }

    /// No port, protocol or interface restriction
    pub fn is_address_only(&self) -> bool {
        self.protocol.is_none()
            && self.sport.is_none()
            && self.dport.is_none()
            && self.in_interface.is_none()
            && self.out_interface.is_none()
            && self.extra.is_empty()
    }
}

/// Splits on whitespace, keeping double-quoted comments as one token
fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '"' => in_quotes = !in_quotes,
            '\\' if in_quotes => {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Bare addresses are host routes, as `iptables -S` prints them with `/32`
fn parse_network(value: &str) -> Result<Ipv4Network> {
    let network: Ipv4Network = value
        .parse()
        .map_err(|e| Error::parse("address", format!("'{value}': {e}")))?;
    Ipv4Network::new(network.network(), network.prefix())
        .map_err(|e| Error::parse("address", format!("'{value}': {e}")))
}

/// Parses one line.
///
/// Returns `Ok(None)` for lines that are not `-A` rules.
///
/// # Errors
///
/// Returns `Err` for an `-A` line with a missing option value or an
/// unparsable address.
pub fn parse_rule(line: &str) -> Result<Option<ParsedRule>> {
    let line = line.trim();
    let tokens = tokenize(line);
    let mut iter = tokens.into_iter();

    match iter.next().as_deref() {
        Some("-A" | "--append") => {}
        _ => return Ok(None),
    }
    let chain = iter
        .next()
        .ok_or_else(|| Error::parse("rule", format!("missing chain in '{line}'")))?;

    let mut rule = ParsedRule {
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
        target: None,
        target_args: Vec::new(),
        extra: Vec::new(),
        raw: line.to_string(),
    };

    let mut negate = false;
    let mut module = String::new();

    while let Some(token) = iter.next() {
        let mut value = |name: &str| {
            iter.next()
                .ok_or_else(|| Error::parse("rule", format!("option {name} has no value in '{line}'")))
        };

        match token.as_str() {
            "!" => {
                negate = true;
                continue;
            }
            "-s" | "--source" => {
                let network = parse_network(&value(token.as_str())?)?;
                rule.source = Some(AddrMatch { network, negated: negate });
            }
            "-d" | "--destination" => {
                let network = parse_network(&value(token.as_str())?)?;
                rule.destination = Some(AddrMatch { network, negated: negate });
            }
            "-i" | "--in-interface" => rule.in_interface = Some(value(token.as_str())?),
            "-o" | "--out-interface" => rule.out_interface = Some(value(token.as_str())?),
            "-p" | "--protocol" => rule.protocol = Some(value(token.as_str())?.to_lowercase()),
            "-m" | "--match" => module = value(token.as_str())?,
            "--sport" | "--source-port" => rule.sport = Some(value(token.as_str())?),
            "--dport" | "--destination-port" => rule.dport = Some(value(token.as_str())?),
            "--mark" if module == "connmark" => rule.connmark = Some(value(token.as_str())?),
            "--mark" => rule.mark = Some(value(token.as_str())?),
            "--comment" => rule.comments.push(value(token.as_str())?),
            "-j" | "--jump" => {
                rule.target = Some(value(token.as_str())?);
                rule.target_args = iter.by_ref().collect();
            }
            other => {
                if negate {
                    rule.extra.push("!".to_string());
                }
                rule.extra.push(other.to_string());
            }
        }
        negate = false;
    }

    Ok(Some(rule))
}

/// Parses every `-A` line of a dump, in order.
///
/// Lines that fail to parse are logged and skipped; callers that must not
/// lose them can use [`parse_rule`] directly.
pub fn parse_chain_dump(text: &str) -> Vec<ParsedRule> {
    text.lines()
        .filter_map(|line| match parse_rule(line) {
            Ok(rule) => rule,
            Err(e) => {
                warn!("Skipping unparsable rule line: {e}");
                None
            }
        })
        .collect()
}
