//! fwexpect - expected firewall rules for a VPN client test harness
//!
//! Computes the iptables rules the VPN daemon should have installed for a
//! declared state, compares them with the live tables, and checks Meshnet
//! peer permissions in the filter INPUT/FORWARD chains.
//!
//! # Usage
//!
//! ```bash
//! fwexpect expect --connected -i eth0 -p 22/tcp        # Print expected rules
//! fwexpect expect --scenario connected-ssh --json      # From a saved scenario
//! fwexpect check --live                                # Diff against the live mangle table
//! fwexpect peer 100.64.0.5 --routing --incoming        # Validate peer permissions
//! fwexpect peer 100.64.0.5 --local --input in.txt --forward fwd.txt
//! fwexpect snapshot --table mangle                     # Save a live dump
//! fwexpect scenarios save connected-ssh --connected -i eth0 -p 22/tcp
//! fwexpect scenarios list
//! ```
//!
//! Logs go to `fwexpect.log` in the XDG state directory.

use clap::{Args, Parser, Subcommand};
use fwexpect::config::{self, HarnessConfig};
use fwexpect::core::error::IptablesErrorPattern;
use fwexpect::core::permissions::PermissionChainValidator;
use fwexpect::core::probe::{self, RuleSnapshot};
use fwexpect::core::scenarios::{Scenario, ScenarioStore};
use fwexpect::validators::{check_allowlisted_subnet, check_meshnet_peer};
use fwexpect::{FirewallContext, Interface, PermissionSet, Port, Subnet, Table, compare, generate_expected_rules};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{Level, info, warn};

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(name = "fwexpect")]
#[command(about = "Expected iptables rules for black-box VPN client testing", long_about = None)]
struct Cli {
    /// Log at DEBUG level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the rules expected for a VPN state
    Expect {
        #[command(flatten)]
        source: SourceArgs,
        /// Only print one table
        #[arg(short, long)]
        table: Option<Table>,
        /// Print a JSON array instead of `iptables -S` lines
        #[arg(long)]
        json: bool,
    },
    /// Compare expected rules with the live table
    Check {
        #[command(flatten)]
        source: SourceArgs,
        #[arg(short, long, default_value = "mangle")]
        table: Table,
        /// Also save the live dump as a snapshot
        #[arg(long)]
        save: bool,
    },
    /// Validate a Meshnet peer's rules in the filter INPUT and FORWARD chains
    Peer {
        /// Peer address, normally in 100.64.0.0/10
        ip: Ipv4Addr,
        #[arg(long)]
        routing: bool,
        #[arg(long)]
        local: bool,
        #[arg(long)]
        incoming: bool,
        #[arg(long)]
        fileshare: bool,
        /// `iptables -S INPUT` output to check instead of the live chain
        #[arg(long, value_name = "FILE")]
        input: Option<PathBuf>,
        /// `iptables -S FORWARD` output to check instead of the live chain
        #[arg(long, value_name = "FILE")]
        forward: Option<PathBuf>,
        /// The peer is the only one on the mesh
        #[arg(long)]
        sole_peer: bool,
    },
    /// Save or list snapshots of live tables
    Snapshot {
        #[arg(short, long, default_value = "mangle")]
        table: Table,
        /// List saved snapshots instead of taking one
        #[arg(long)]
        list: bool,
    },
    /// Manage saved scenarios
    Scenarios {
        #[command(subcommand)]
        action: ScenarioCommand,
    },
    /// Show the harness configuration
    Config {
        /// Write the current configuration to the config file
        #[arg(long)]
        init: bool,
    },
}

#[derive(Subcommand)]
enum ScenarioCommand {
    /// List saved scenarios
    List,
    /// Print a scenario and, optionally, its expected rules
    Show {
        name: String,
        #[arg(long)]
        rules: bool,
    },
    /// Save a scenario from flags, a context file or the live state
    Save {
        name: String,
        #[arg(short, long, default_value = "")]
        description: String,
        #[command(flatten)]
        source: SourceArgs,
    },
    /// Delete a saved scenario
    Delete { name: String },
}

/// Where the VPN state comes from. Flags are used when no other source is
/// given.
#[derive(Args, Debug)]
struct SourceArgs {
    /// Saved scenario name
    #[arg(long, value_name = "NAME", conflicts_with_all = ["context", "live"])]
    scenario: Option<String>,
    /// JSON file holding a context
    #[arg(long, value_name = "FILE", conflicts_with = "live")]
    context: Option<PathBuf>,
    /// Discover interfaces and read the VPN client's status and settings
    #[arg(long)]
    live: bool,
    #[command(flatten)]
    flags: ContextArgs,
}

#[derive(Args, Debug)]
struct ContextArgs {
    /// Interface with a default route, in discovery order (repeatable)
    #[arg(short, long = "interface", value_name = "NAME")]
    interfaces: Vec<Interface>,
    #[arg(long)]
    connected: bool,
    #[arg(long)]
    kill_switch: bool,
    /// Allowlisted port, VALUE[/udp|/tcp]; VALUE may be START:END (repeatable)
    #[arg(short, long = "port", value_name = "PORT")]
    ports: Vec<Port>,
    /// Allowlisted subnet in CIDR notation (repeatable)
    #[arg(short, long = "subnet", value_name = "CIDR")]
    subnets: Vec<Subnet>,
    #[arg(long)]
    lan_discovery: bool,
    /// Packet mark, hex (0xe1f1) or decimal
    #[arg(long, value_parser = parse_fwmark)]
    fwmark: Option<u32>,
}

impl ContextArgs {
    fn to_context(&self, config: &HarnessConfig) -> FirewallContext {
        if self.interfaces.is_empty() && (self.connected || self.kill_switch) {
            warn!("No --interface given, per-interface rules will be empty");
            eprintln!("Warning: no --interface given, per-interface rules will be empty");
        }
        for subnet in &self.subnets {
            if let Some(warning) = check_allowlisted_subnet(subnet.network()) {
                eprintln!("Warning: {subnet}: {warning}");
            }
        }

        FirewallContext::new(self.interfaces.clone())
            .with_connected(self.connected)
            .with_kill_switch(self.kill_switch)
            .with_ports(self.ports.iter().copied())
            .with_subnets(self.subnets.iter().copied())
            .with_lan_discovery(self.lan_discovery || config.lan_discovery)
            .with_fwmark(self.fwmark.unwrap_or(config.fwmark))
    }
}

fn parse_fwmark(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid fwmark '{s}': {e}"))
}

async fn resolve_context(source: &SourceArgs, config: &HarnessConfig) -> CliResult<FirewallContext> {
    if let Some(name) = &source.scenario {
        let scenario = ScenarioStore::default_location()?.load(name).await?;
        info!("Using scenario '{name}'");
        return Ok(scenario.context);
    }
    if let Some(path) = &source.context {
        let json = tokio::fs::read_to_string(path).await?;
        return Ok(serde_json::from_str(&json)?);
    }
    if source.live {
        return Ok(probe::live_context(config).await?);
    }
    Ok(source.flags.to_context(config))
}

fn init_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let builder = tracing_subscriber::fmt().with_max_level(level);

    if let Some(mut log_path) = fwexpect::utils::get_state_dir() {
        log_path.push("fwexpect.log");
        if let Ok(file) = std::fs::File::create(log_path) {
            builder.with_writer(std::sync::Mutex::new(file)).with_ansi(false).init();
            return;
        }
    }
    builder.with_writer(std::io::stderr).init();
}

fn main() -> ExitCode {
    let _ = fwexpect::utils::ensure_dirs();
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to create Tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(handle_cli(cli.command)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            if let Some(err) = e.downcast_ref::<fwexpect::Error>()
                && matches!(
                    err,
                    fwexpect::Error::Command { .. } | fwexpect::Error::Io(_) | fwexpect::Error::NoDefaultRoute
                )
            {
                let translation = IptablesErrorPattern::match_error(&err.to_string());
                eprintln!("{}", translation.user_message);
                for suggestion in &translation.suggestions {
                    eprintln!("  - {suggestion}");
                }
                if let Some(url) = &translation.help_url {
                    eprintln!("  See: {url}");
                }
            }
            ExitCode::FAILURE
        }
    }
}

async fn handle_cli(command: Commands) -> CliResult<ExitCode> {
    let config = config::load_config().await;

    match command {
        Commands::Expect { source, table, json } => {
            let ctx = resolve_context(&source, &config).await?;
            let rules = generate_expected_rules(&ctx);
            info!("Expecting {} rules ({})", rules.len(), ctx.render_mode());

            let texts: Vec<&str> = match table {
                Some(table) => rules.texts(table),
                None => rules.iter().map(|r| r.text.as_str()).collect(),
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&texts)?);
            } else {
                for text in texts {
                    println!("{text}");
                }
            }
        }
        Commands::Check { source, table, save } => {
            let ctx = resolve_context(&source, &config).await?;
            let expected = generate_expected_rules(&ctx);
            let live = probe::snapshot_rules(&config, table).await?;

            if save {
                let path = probe::save_snapshot_to_disk(&RuleSnapshot::new(table, live.clone()))?;
                println!("Snapshot saved to {}", path.display());
            }

            let comparison = compare(&expected, table, &live);
            if comparison.matches {
                println!("✓ {table}: {} rules match ({})", comparison.expected.len(), ctx.render_mode());
            } else {
                println!(
                    "✗ {table}: expected {} rules, found {} ({})",
                    comparison.expected.len(),
                    comparison.actual.len(),
                    ctx.render_mode()
                );
                print!("{}", comparison.diff);
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Peer {
            ip,
            routing,
            local,
            incoming,
            fileshare,
            input,
            forward,
            sole_peer,
        } => {
            if let Some(warning) = check_meshnet_peer(ip) {
                eprintln!("Warning: {warning}");
            }
            let input_text = match input {
                Some(path) => tokio::fs::read_to_string(path).await?,
                None => probe::dump_chain(&config, Table::Filter, "INPUT").await?,
            };
            let forward_text = match forward {
                Some(path) => tokio::fs::read_to_string(path).await?,
                None => probe::dump_chain(&config, Table::Filter, "FORWARD").await?,
            };

            let permissions = PermissionSet {
                routing,
                local,
                incoming,
                fileshare,
            };
            let report = PermissionChainValidator::new(ip, permissions)
                .sole_peer(sole_peer)
                .validate(&input_text, &forward_text);
            println!("{}", report.diagnostic);
            if !report.success {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Snapshot { table, list } => {
            if list {
                for path in probe::list_snapshots()? {
                    println!("{}", path.display());
                }
            } else {
                let text = probe::snapshot_rules(&config, table).await?;
                let path = probe::save_snapshot_to_disk(&RuleSnapshot::new(table, text))?;
                println!("✓ Snapshot of {table} saved to {}", path.display());
            }
        }
        Commands::Scenarios { action } => {
            let store = ScenarioStore::default_location()?;
            match action {
                ScenarioCommand::List => {
                    let names = store.list().await?;
                    if names.is_empty() {
                        println!("No scenarios in {}", store.dir().display());
                    }
                    for name in names {
                        println!("  {name}");
                    }
                }
                ScenarioCommand::Show { name, rules } => {
                    let scenario = store.load(&name).await?;
                    println!("{}", serde_json::to_string_pretty(&scenario)?);
                    if rules {
                        println!();
                        print!("{}", generate_expected_rules(&scenario.context).to_text());
                    }
                }
                ScenarioCommand::Save {
                    name,
                    description,
                    source,
                } => {
                    let ctx = resolve_context(&source, &config).await?;
                    let path = store
                        .save(&name, &Scenario::new(ctx).with_description(description))
                        .await?;
                    println!("✓ Saved scenario '{name}' to {}", path.display());
                }
                ScenarioCommand::Delete { name } => {
                    store.delete(&name).await?;
                    println!("✓ Deleted scenario '{name}'");
                }
            }
        }
        Commands::Config { init } => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            if init {
                config::save_config(&config).await?;
                println!("✓ Configuration written");
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}
