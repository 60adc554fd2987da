//! Expected-versus-live comparison
//!
//! The live dump of a table holds rules from every program on the host. Only
//! rules stamped with one of the VPN daemon's comments take part in the
//! comparison; everything else is ignored.

use crate::core::parse::parse_rule;
use crate::core::rules::{NORDVPN_COMMENT, RuleList, Table, Tag};
use serde::Serialize;
use tracing::{debug, info};

/// Result of comparing one table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Comparison {
    pub table: Table,
    pub matches: bool,
    pub expected: Vec<String>,
    pub actual: Vec<String>,
    /// Unified diff from expected to live, empty when they match
    pub diff: String,
}

fn normalize(line: &str) -> String {
    line.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn is_managed(line: &str) -> bool {
    matches!(parse_rule(line), Ok(Some(rule))
        if rule.has_comment(NORDVPN_COMMENT) || rule.has_comment(Tag::AllowlistMark.as_str()))
}

/// `-A` lines of `live_text` installed by the VPN daemon, in listing order
pub fn managed_rules(live_text: &str) -> Vec<String> {
    live_text
        .lines()
        .map(normalize)
        .filter(|line| line.starts_with("-A ") && is_managed(line))
        .collect()
}

/// Compares the `table` segment of `expected` against a live `iptables -t
/// TABLE -S` dump. Order matters.
pub fn compare(expected: &RuleList, table: Table, live_text: &str) -> Comparison {
    let expected: Vec<String> = expected.texts(table).into_iter().map(normalize).collect();
    let actual = managed_rules(live_text);
    let matches = expected == actual;

    let diff = if matches {
        String::new()
    } else {
        let old = lines_to_text(&expected);
        let new = lines_to_text(&actual);
        similar::TextDiff::from_lines(&old, &new)
            .unified_diff()
            .context_radius(3)
            .header("expected", "live")
            .to_string()
    };

    if matches {
        debug!(%table, rules = actual.len(), "live rules match expectation");
    } else {
        info!(%table, expected = expected.len(), live = actual.len(), "live rules differ from expectation");
    }

    Comparison {
        table,
        matches,
        expected,
        actual,
        diff,
    }
}

/// True if `block` appears in `live_text` as consecutive `-A` lines, in order.
///
/// Unlike [`compare`] this looks at every rule, managed or not. An empty
/// block is always contained.
pub fn contains_in_order<S: AsRef<str>>(live_text: &str, block: &[S]) -> bool {
    if block.is_empty() {
        return true;
    }
    let live: Vec<String> = live_text
        .lines()
        .map(normalize)
        .filter(|line| line.starts_with("-A "))
        .collect();
    let block: Vec<String> = block.iter().map(|l| normalize(l.as_ref())).collect();
    live.windows(block.len()).any(|window| window == block.as_slice())
}

fn lines_to_text(lines: &[String]) -> String {
    let mut text = String::new();
    for line in lines {
        text.push_str(line);
        text.push('\n');
    }
    text
}
