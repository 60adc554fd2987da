//! Expected mangle-table ruleset for a declared VPN state
//!
//! The daemon builds its ruleset with `iptables -I`, so every rule it adds
//! lands on top of the chain. The generator does not simulate the inserts; it
//! writes the resulting top-to-bottom order directly. That is where the
//! reversals below come from:
//!
//! - interfaces are reversed once relative to discovery order before any
//!   per-interface block is rendered (the last interface set up ends up on top)
//! - the connmark blocks are two full passes, all ACCEPTs then all DROPs
//! - subnet blocks are rendered and then reversed as a whole
//!
//! Blocks are grouped by chain in `iptables -S` order (PREROUTING, OUTPUT,
//! POSTROUTING). Within a chain the block order follows the render mode:
//! allowlisted ports, then allowlisted subnets, then the connmark skeleton.
//! The private-DNS block is inserted last by the daemon and therefore sits at
//! the top of POSTROUTING.

use crate::core::context::{FirewallContext, Interface, Port, Protocol, RenderMode, Subnet};
use crate::core::rules::{Chain, FULL_MASK, Rule, RuleList, RuleSpec, Table, Tag, natural_cmp};
use tracing::debug;

/// Packet mark the daemon puts on its own traffic
pub const DEFAULT_FWMARK: u32 = 0xe1f1;

/// Destination order of the deny-private-DNS rules
const PRIVATE_DNS_RANGES: [&str; 4] = ["169.254.0.0/16", "192.168.0.0/16", "172.16.0.0/12", "10.0.0.0/8"];

/// Computes the exact, ordered ruleset the daemon is expected to have
/// installed for `ctx`.
///
/// Pure and total: equal contexts always produce equal lists. An empty
/// interface list leaves every per-interface block empty.
pub fn generate_expected_rules(ctx: &FirewallContext) -> RuleList {
    let mode = ctx.render_mode();
    let interfaces: Vec<&Interface> = ctx.interfaces.iter().rev().collect();
    let mark = ctx.fwmark;

    let (ports, subnets) = match mode {
        RenderMode::Inactive => {
            debug!(%mode, "no rules expected");
            return RuleList::new();
        }
        RenderMode::KillSwitch | RenderMode::ConnectedBare => (None, None),
        RenderMode::ConnectedPortsAndSubnets => {
            (Some(PortLists::new(&ctx.allowlisted_ports)), Some(ctx.effective_subnets()))
        }
        RenderMode::ConnectedSubnetsOnly => (None, Some(ctx.effective_subnets())),
        RenderMode::ConnectedPortsOnly => (Some(PortLists::new(&ctx.allowlisted_ports)), None),
    };

    let mut rules = RuleList::new();

    // PREROUTING
    if let Some(ports) = &ports {
        rules.extend(port_input_block(&interfaces, ports));
    }
    if let Some(subnets) = &subnets {
        rules.extend(subnet_input_block(&interfaces, subnets));
    }
    rules.extend(connmark_prerouting_block(&interfaces, mark));

    // OUTPUT
    if let Some(ports) = &ports {
        rules.extend(port_output_block(ports, mark));
    }

    // POSTROUTING
    rules.extend(private_dns_block());
    if let Some(subnets) = &subnets {
        rules.extend(subnet_output_block(&interfaces, subnets));
    }
    rules.extend(connmark_postrouting_block(&interfaces, mark));

    debug!(%mode, interfaces = interfaces.len(), rules = rules.len(), "generated expected ruleset");
    rules
}

/// Allowlisted port values split per protocol, deduplicated, natural
/// descending order. `All` ports land in both lists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortLists {
    pub udp: Vec<String>,
    pub tcp: Vec<String>,
}

impl PortLists {
    pub fn new(ports: &[Port]) -> Self {
        let mut lists = Self::default();
        for port in ports {
            let value = port.value.to_string();
            if port.protocol.includes_udp() && !lists.udp.contains(&value) {
                lists.udp.push(value.clone());
            }
            if port.protocol.includes_tcp() && !lists.tcp.contains(&value) {
                lists.tcp.push(value);
            }
        }
        lists.udp.sort_by(|a, b| natural_cmp(b, a));
        lists.tcp.sort_by(|a, b| natural_cmp(b, a));
        lists
    }

    fn per_protocol(&self) -> [(Protocol, &[String]); 2] {
        [(Protocol::Udp, &self.udp), (Protocol::Tcp, &self.tcp)]
    }
}

fn mangle(spec: RuleSpec) -> Rule {
    spec.into_rule(Table::Mangle)
}

/// Mark-accept for every interface, then a drop for every interface
pub fn connmark_prerouting_block(interfaces: &[&Interface], mark: u32) -> Vec<Rule> {
    let accepts = interfaces.iter().map(|iface| {
        mangle(
            RuleSpec::new(Chain::Prerouting, "ACCEPT")
                .in_interface(iface)
                .connmark(mark)
                .tagged(Tag::ApiAllowlist),
        )
    });
    let drops = interfaces.iter().map(|iface| {
        mangle(
            RuleSpec::new(Chain::Prerouting, "DROP")
                .in_interface(iface)
                .tagged(Tag::DropIpv4),
        )
    });
    accepts.chain(drops).collect()
}

/// `{save-mark, re-accept}` per interface, then a drop per interface
pub fn connmark_postrouting_block(interfaces: &[&Interface], mark: u32) -> Vec<Rule> {
    let save_mark = format!("CONNMARK --save-mark --nfmask {FULL_MASK} --ctmask {FULL_MASK}");
    let mut rules = Vec::with_capacity(interfaces.len() * 3);
    for iface in interfaces {
        rules.push(mangle(
            RuleSpec::new(Chain::Postrouting, save_mark.clone())
                .out_interface(iface)
                .mark(mark)
                .tagged(Tag::ApiAllowlist),
        ));
        rules.push(mangle(
            RuleSpec::new(Chain::Postrouting, "ACCEPT")
                .out_interface(iface)
                .connmark(mark)
                .tagged(Tag::ApiAllowlist),
        ));
    }
    for iface in interfaces {
        rules.push(mangle(
            RuleSpec::new(Chain::Postrouting, "DROP")
                .out_interface(iface)
                .tagged(Tag::DropIpv4),
        ));
    }
    rules
}

/// Eight fixed rules: port 53 over tcp and udp to each private range
pub fn private_dns_block() -> Vec<Rule> {
    PRIVATE_DNS_RANGES
        .iter()
        .flat_map(|range| {
            [Protocol::Tcp, Protocol::Udp].map(|protocol| {
                mangle(
                    RuleSpec::new(Chain::Postrouting, "DROP")
                        .destination(range)
                        .protocol(protocol)
                        .dport(53)
                        .tagged(Tag::DenyPrivateDns),
                )
            })
        })
        .collect()
}

/// UDP dport/sport pairs for every interface, then TCP pairs for every interface
pub fn port_input_block(interfaces: &[&Interface], ports: &PortLists) -> Vec<Rule> {
    let mut rules = Vec::new();
    for (protocol, values) in ports.per_protocol() {
        let tag = Tag::for_ports(protocol);
        for iface in interfaces {
            for value in values {
                let base = RuleSpec::new(Chain::Prerouting, "ACCEPT")
                    .in_interface(iface)
                    .protocol(protocol);
                rules.push(mangle(base.clone().dport(value).tagged(tag)));
                rules.push(mangle(base.sport(value).tagged(tag)));
            }
        }
    }
    rules
}

/// One `MARK` rule per UDP port, then per TCP port
pub fn port_output_block(ports: &PortLists, mark: u32) -> Vec<Rule> {
    let target = format!("MARK --set-xmark {mark:#x}/{FULL_MASK}");
    ports
        .per_protocol()
        .into_iter()
        .flat_map(|(protocol, values)| {
            values.iter().map(move |value| (protocol, value))
        })
        .map(|(protocol, value)| {
            mangle(
                RuleSpec::new(Chain::Output, target.clone())
                    .protocol(protocol)
                    .sport(value)
                    .comment(Tag::AllowlistMark),
            )
        })
        .collect()
}

/// Interfaces reversed, `{subnet × interface}` accepts, whole list reversed
pub fn subnet_input_block(interfaces: &[&Interface], subnets: &[Subnet]) -> Vec<Rule> {
    let mut rules = Vec::with_capacity(interfaces.len() * subnets.len());
    for subnet in subnets {
        for iface in interfaces.iter().rev() {
            rules.push(mangle(
                RuleSpec::new(Chain::Prerouting, "ACCEPT")
                    .source(subnet)
                    .in_interface(iface)
                    .tagged(Tag::AllowlistSubnets),
            ));
        }
    }
    rules.reverse();
    rules
}

/// `{subnet × interface}` accepts in the given order, whole list reversed
pub fn subnet_output_block(interfaces: &[&Interface], subnets: &[Subnet]) -> Vec<Rule> {
    let mut rules = Vec::with_capacity(interfaces.len() * subnets.len());
    for subnet in subnets {
        for iface in interfaces {
            rules.push(mangle(
                RuleSpec::new(Chain::Postrouting, "ACCEPT")
                    .destination(subnet)
                    .out_interface(iface)
                    .tagged(Tag::AllowlistSubnets),
            ));
        }
    }
    rules.reverse();
    rules
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_helpers::{context, ifaces, subnet};

    fn texts(rules: &[Rule]) -> Vec<&str> {
        rules.iter().map(|r| r.text.as_str()).collect()
    }

    #[test]
    fn test_inactive_renders_nothing() {
        let ctx = context(&["eth0"]).with_ports([Port::tcp(22)]);
        assert!(generate_expected_rules(&ctx).is_empty());
    }

    #[test]
    fn test_connmark_prerouting_two_passes() {
        let eth0 = Interface::new("eth0").unwrap();
        let wlan0 = Interface::new("wlan0").unwrap();
        let rules = connmark_prerouting_block(&[&wlan0, &eth0], DEFAULT_FWMARK);
        assert_eq!(
            texts(&rules),
            vec![
                "-A PREROUTING -i wlan0 -m connmark --mark 0xe1f1 -m comment --comment nordvpn -m comment --comment api_allowlist -j ACCEPT",
                "-A PREROUTING -i eth0 -m connmark --mark 0xe1f1 -m comment --comment nordvpn -m comment --comment api_allowlist -j ACCEPT",
                "-A PREROUTING -i wlan0 -m comment --comment nordvpn -m comment --comment drop-IPv4 -j DROP",
                "-A PREROUTING -i eth0 -m comment --comment nordvpn -m comment --comment drop-IPv4 -j DROP",
            ]
        );
    }

    #[test]
    fn test_connmark_postrouting_pairs_then_drops() {
        let eth0 = Interface::new("eth0").unwrap();
        let eth1 = Interface::new("eth1").unwrap();
        let rules = connmark_postrouting_block(&[&eth1, &eth0], DEFAULT_FWMARK);
        assert_eq!(
            texts(&rules),
            vec![
                "-A POSTROUTING -o eth1 -m mark --mark 0xe1f1 -m comment --comment nordvpn -m comment --comment api_allowlist -j CONNMARK --save-mark --nfmask 0xffffffff --ctmask 0xffffffff",
                "-A POSTROUTING -o eth1 -m connmark --mark 0xe1f1 -m comment --comment nordvpn -m comment --comment api_allowlist -j ACCEPT",
                "-A POSTROUTING -o eth0 -m mark --mark 0xe1f1 -m comment --comment nordvpn -m comment --comment api_allowlist -j CONNMARK --save-mark --nfmask 0xffffffff --ctmask 0xffffffff",
                "-A POSTROUTING -o eth0 -m connmark --mark 0xe1f1 -m comment --comment nordvpn -m comment --comment api_allowlist -j ACCEPT",
                "-A POSTROUTING -o eth1 -m comment --comment nordvpn -m comment --comment drop-IPv4 -j DROP",
                "-A POSTROUTING -o eth0 -m comment --comment nordvpn -m comment --comment drop-IPv4 -j DROP",
            ]
        );
    }

    #[test]
    fn test_private_dns_block_is_fixed() {
        let rules = private_dns_block();
        assert_eq!(rules.len(), 8);
        assert_eq!(
            rules[0].text,
            "-A POSTROUTING -d 169.254.0.0/16 -p tcp -m tcp --dport 53 -m comment --comment nordvpn -m comment --comment deny-private-dns -j DROP"
        );
        assert_eq!(
            rules[7].text,
            "-A POSTROUTING -d 10.0.0.0/8 -p udp -m udp --dport 53 -m comment --comment nordvpn -m comment --comment deny-private-dns -j DROP"
        );
        let destinations: Vec<_> = rules
            .iter()
            .map(|r| r.text.split_whitespace().nth(3).unwrap().to_string())
            .collect();
        assert_eq!(
            destinations,
            vec![
                "169.254.0.0/16", "169.254.0.0/16",
                "192.168.0.0/16", "192.168.0.0/16",
                "172.16.0.0/12", "172.16.0.0/12",
                "10.0.0.0/8", "10.0.0.0/8",
            ]
        );
        assert_eq!(private_dns_block(), rules);
    }

    #[test]
    fn test_port_lists_fan_out_and_sort() {
        let lists = PortLists::new(&[
            Port::tcp(22),
            Port::all(8080),
            "3000:3100/udp".parse().unwrap(),
            Port::udp(53),
            Port::tcp(8080),
        ]);
        assert_eq!(lists.udp, vec!["3000:3100", "8080", "53"]);
        assert_eq!(lists.tcp, vec!["8080", "22"]);
    }

    #[test]
    fn test_port_input_block_udp_pass_then_tcp_pass() {
        let eth0 = Interface::new("eth0").unwrap();
        let eth1 = Interface::new("eth1").unwrap();
        let lists = PortLists::new(&[Port::all(22)]);
        let rules = port_input_block(&[&eth1, &eth0], &lists);
        let summary: Vec<(String, String, String)> = rules
            .iter()
            .map(|r| {
                let t: Vec<&str> = r.text.split_whitespace().collect();
                (t[3].to_string(), t[5].to_string(), t[8].to_string())
            })
            .collect();
        let expected = [
            ("eth1", "udp", "--dport"),
            ("eth1", "udp", "--sport"),
            ("eth0", "udp", "--dport"),
            ("eth0", "udp", "--sport"),
            ("eth1", "tcp", "--dport"),
            ("eth1", "tcp", "--sport"),
            ("eth0", "tcp", "--dport"),
            ("eth0", "tcp", "--sport"),
        ];
        assert_eq!(
            summary,
            expected
                .iter()
                .map(|(a, b, c)| ((*a).to_string(), (*b).to_string(), (*c).to_string()))
                .collect::<Vec<_>>()
        );
        assert!(rules[0].text.ends_with("--comment allowlist_ports_udp -j ACCEPT"));
        assert!(rules[7].text.ends_with("--comment allowlist_ports_tcp -j ACCEPT"));
    }

    #[test]
    fn test_port_output_block() {
        let lists = PortLists::new(&[Port::all(22), Port::udp(1194)]);
        let rules = port_output_block(&lists, DEFAULT_FWMARK);
        assert_eq!(
            texts(&rules),
            vec![
                "-A OUTPUT -p udp -m udp --sport 1194 -m comment --comment nordvpn_allowlist -j MARK --set-xmark 0xe1f1/0xffffffff",
                "-A OUTPUT -p udp -m udp --sport 22 -m comment --comment nordvpn_allowlist -j MARK --set-xmark 0xe1f1/0xffffffff",
                "-A OUTPUT -p tcp -m tcp --sport 22 -m comment --comment nordvpn_allowlist -j MARK --set-xmark 0xe1f1/0xffffffff",
            ]
        );
    }

    #[test]
    fn test_subnet_input_block_double_reversal() {
        let eth0 = Interface::new("eth0").unwrap();
        let eth1 = Interface::new("eth1").unwrap();
        let s1 = subnet("10.1.0.0/16");
        let s2 = subnet("10.2.0.0/16");
        let rules = subnet_input_block(&[&eth0, &eth1], &[s1, s2]);
        let pairs: Vec<(&str, &str)> = rules
            .iter()
            .map(|r| {
                let t: Vec<&str> = r.text.split_whitespace().collect();
                (t[3], t[5])
            })
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("10.2.0.0/16", "eth0"),
                ("10.2.0.0/16", "eth1"),
                ("10.1.0.0/16", "eth0"),
                ("10.1.0.0/16", "eth1"),
            ]
        );
    }

    #[test]
    fn test_subnet_output_block_reversed() {
        let eth0 = Interface::new("eth0").unwrap();
        let eth1 = Interface::new("eth1").unwrap();
        let rules = subnet_output_block(
            &[&eth0, &eth1],
            &[subnet("10.1.0.0/16"), subnet("10.2.0.0/16")],
        );
        let pairs: Vec<(&str, &str)> = rules
            .iter()
            .map(|r| {
                let t: Vec<&str> = r.text.split_whitespace().collect();
                (t[3], t[5])
            })
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("10.2.0.0/16", "eth1"),
                ("10.2.0.0/16", "eth0"),
                ("10.1.0.0/16", "eth1"),
                ("10.1.0.0/16", "eth0"),
            ]
        );
    }

    #[test]
    fn test_kill_switch_matches_connected_bare() {
        let ks = generate_expected_rules(&context(&["eth0", "eth1"]).with_kill_switch(true));
        let bare = generate_expected_rules(&context(&["eth0", "eth1"]).with_connected(true));
        assert_eq!(ks, bare);
        // 4 prerouting + 8 dns + 6 postrouting
        assert_eq!(ks.len(), 18);
    }

    #[test]
    fn test_kill_switch_ignores_allowlist() {
        let plain = generate_expected_rules(&context(&["eth0"]).with_kill_switch(true));
        let allowlisted = generate_expected_rules(
            &context(&["eth0"])
                .with_kill_switch(true)
                .with_ports([Port::tcp(22)])
                .with_subnets([subnet("10.0.0.0/8")]),
        );
        assert_eq!(plain, allowlisted);
    }

    #[test]
    fn test_reversal_of_discovery_order() {
        let rules = generate_expected_rules(&context(&["eth0", "eth1"]).with_connected(true));
        let accepts: Vec<&str> = rules
            .chain(Table::Mangle, Chain::Prerouting)
            .into_iter()
            .filter(|t| t.ends_with("-j ACCEPT"))
            .collect();
        assert!(accepts[0].contains("-i eth1 "));
        assert!(accepts[1].contains("-i eth0 "));
    }

    #[test]
    fn test_chain_grouping() {
        let ctx = context(&["eth0"])
            .with_connected(true)
            .with_ports([Port::tcp(22)])
            .with_subnets([subnet("192.168.1.0/24")]);
        let rules = generate_expected_rules(&ctx);
        let chains: Vec<&str> = rules.iter().filter_map(Rule::chain).collect();
        let first_output = chains.iter().position(|c| *c == "OUTPUT").unwrap();
        let first_post = chains.iter().position(|c| *c == "POSTROUTING").unwrap();
        assert!(chains[..first_output].iter().all(|c| *c == "PREROUTING"));
        assert!(chains[first_output..first_post].iter().all(|c| *c == "OUTPUT"));
        assert!(chains[first_post..].iter().all(|c| *c == "POSTROUTING"));
        assert!(rules.table(Table::Filter).is_empty());
    }

    #[test]
    fn test_combined_block_order_in_prerouting() {
        let ctx = context(&["eth0"])
            .with_connected(true)
            .with_ports([Port::udp(53)])
            .with_subnets([subnet("192.168.1.0/24")]);
        let pre = generate_expected_rules(&ctx).chain(Table::Mangle, Chain::Prerouting)
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>();
        assert_eq!(pre.len(), 5);
        assert!(pre[0].contains("allowlist_ports_udp") && pre[0].contains("--dport 53"));
        assert!(pre[1].contains("allowlist_ports_udp") && pre[1].contains("--sport 53"));
        assert!(pre[2].contains("-s 192.168.1.0/24 -i eth0"));
        assert!(pre[3].contains("api_allowlist"));
        assert!(pre[4].contains("drop-IPv4"));
    }

    #[test]
    fn test_lan_discovery_adds_subnet_rules() {
        let ctx = context(&["eth0"]).with_connected(true).with_lan_discovery(true);
        let rules = generate_expected_rules(&ctx);
        let pre = rules.chain(Table::Mangle, Chain::Prerouting);
        assert_eq!(
            &pre[..4],
            &[
                "-A PREROUTING -s 169.254.0.0/16 -i eth0 -m comment --comment nordvpn -m comment --comment allowlist_subnets -j ACCEPT",
                "-A PREROUTING -s 192.168.0.0/16 -i eth0 -m comment --comment nordvpn -m comment --comment allowlist_subnets -j ACCEPT",
                "-A PREROUTING -s 172.16.0.0/12 -i eth0 -m comment --comment nordvpn -m comment --comment allowlist_subnets -j ACCEPT",
                "-A PREROUTING -s 10.0.0.0/8 -i eth0 -m comment --comment nordvpn -m comment --comment allowlist_subnets -j ACCEPT",
            ]
        );
    }

    #[test]
    fn test_custom_fwmark() {
        let ctx = context(&["eth0"]).with_connected(true).with_fwmark(0x1234);
        let rules = generate_expected_rules(&ctx);
        assert!(rules.iter().any(|r| r.text.contains("--mark 0x1234")));
        assert!(!rules.iter().any(|r| r.text.contains("0xe1f1")));
    }

    #[test]
    fn test_empty_interfaces_keep_static_rules() {
        let rules = generate_expected_rules(
            &FirewallContext::new(ifaces(&[]))
                .with_connected(true)
                .with_ports([Port::tcp(22)]),
        );
        // Only the interface-free blocks remain: one MARK rule and the DNS block
        assert_eq!(rules.len(), 9);
        assert_eq!(rules.chain(Table::Mangle, Chain::Output).len(), 1);
    }
}
