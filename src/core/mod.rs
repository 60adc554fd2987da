//! Expected-ruleset model and the adapters around it
//!
//! - [`context`]: the declared VPN/firewall situation and its value types
//! - [`rules`]: rule text, comment tags and ordered rule lists
//! - [`generator`]: context to expected mangle/filter rules
//! - [`parse`]: structural parsing of `iptables -S` lines
//! - [`permissions`]: Meshnet per-peer checks on live INPUT/FORWARD chains
//! - [`compare`]: expected versus live diffing
//! - [`probe`]: interface discovery, rule dumps, client state, snapshots
//! - [`scenarios`]: named contexts saved on disk
//! - [`error`]: error types for the adapters and CLI

pub mod compare;
pub mod context;
pub mod error;
pub mod generator;
pub mod parse;
pub mod permissions;
pub mod probe;
pub mod rules;
pub mod scenarios;

#[cfg(test)]
pub mod test_helpers;
