//! fwexpect - expected firewall rules for a VPN client test harness
//!
//! Given a declared VPN state (connection, kill switch, allowlisted ports and
//! subnets, network interfaces, LAN discovery) fwexpect computes the exact,
//! ordered iptables rules the VPN daemon should have installed, and diffs
//! them against the live ruleset. Meshnet peer permissions, whose rules
//! interleave with other peers', are checked with positional predicates
//! instead.
//!
//! # Architecture
//!
//! - [`core`] - Rule model, generator, permission validator and host probes
//! - [`validators`] - Input validation for values that reach rule text
//! - [`config`] - Harness configuration persistence
//! - [`elevation`] - Privilege elevation for `iptables -S`
//! - [`utils`] - Utility functions (XDG directories, etc.)
//!
//! # Example
//!
//! ```
//! use fwexpect::{FirewallContext, Interface, Port, generate_expected_rules};
//!
//! let ctx = FirewallContext::new(vec![Interface::new("eth0").unwrap()])
//!     .with_connected(true)
//!     .with_ports([Port::tcp(22)]);
//! let rules = generate_expected_rules(&ctx);
//! assert_eq!(rules.len(), 16);
//! ```

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_lifetimes)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod config;
pub mod core;
pub mod elevation;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use core::compare::{Comparison, compare};
pub use core::context::{FirewallContext, Interface, Port, PortValue, Protocol, RenderMode, Subnet};
pub use core::error::{Error, Result};
pub use core::generator::generate_expected_rules;
pub use core::permissions::{PermissionChainValidator, PermissionSet, validate_peer_permissions};
pub use core::rules::{Rule, RuleList, Table};
