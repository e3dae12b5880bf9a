use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use wg_relay::config::{Config, CONFIG_FILE_NAME};
use wg_relay::routing::engine::domain_map;
use wg_relay::wireguard::parse_relay_config;
use wg_relay::{platform, Reconciler, RecordSet, RoutingService, StateStore, SyncReport};

#[derive(Parser)]
#[command(name = "wg-relay")]
#[command(about = "Per-client WireGuard relay routing and split tunneling")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: search ./wg-relay.toml, ~/.wg-relay, /etc/wg-relay)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply the record set to the kernel
    ///
    /// Meant to be run by the record store after every client, relay or
    /// rule change.
    Sync {
        /// Record set JSON (default: records_file from config)
        #[arg(short, long)]
        records: Option<PathBuf>,
    },
    /// Remove every relay, rule, chain and set this host manages
    Teardown,
    /// Show the last applied state
    Status,
    /// Re-sync if any relay interface or target set has gone missing
    Health {
        #[arg(short, long)]
        records: Option<PathBuf>,
    },
    /// Parse a WireGuard config into a relay record
    Import {
        /// WireGuard config file from the relay provider
        file: PathBuf,
        /// Emit a shared relay record with this name
        #[arg(long, requires = "interface")]
        name: Option<String>,
        /// Interface name for the shared relay
        #[arg(long, requires = "name")]
        interface: Option<String>,
        /// Id for the shared relay record
        #[arg(long, default_value_t = 0)]
        id: u32,
    },
    /// Print the domain to target-set mapping as JSON
    Domains {
        #[arg(short, long)]
        records: Option<PathBuf>,
    },
    /// Generate default config file
    Init,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => {
            let (config, found) = Config::discover()?;
            match found {
                Some(path) => info!("Using config {}", path.display()),
                None => info!("No config file found, using defaults"),
            }
            config
        }
    };

    match cli.command {
        Commands::Sync { records } => {
            let service = open_service(&config)?;
            let path = records.unwrap_or_else(|| config.records_file.clone());
            info!("Syncing from {}", path.display());
            let report = service.sync_file(path).await?;
            print_report(&report);
            if report.failed_clients().next().is_some() {
                std::process::exit(1);
            }
        }
        Commands::Teardown => {
            let service = open_service(&config)?;
            let failures = service.teardown().await?;
            if failures.is_empty() {
                println!("All relay routing removed");
            } else {
                println!("Teardown finished with {} failures:", failures.len());
                for failure in &failures {
                    println!("  {}", failure);
                }
                std::process::exit(1);
            }
        }
        Commands::Status => {
            let service = open_service(&config)?;
            let status = service.status().await?;
            if status.state.clients.is_empty() && status.state.upstreams.is_empty() {
                println!("No relay routing applied");
            }
            for upstream in status.state.upstreams.values() {
                let up = status.interfaces.get(&upstream.interface_name).copied();
                println!(
                    "Shared relay {}: {} ({})",
                    upstream.id,
                    upstream.interface_name,
                    link_state(up)
                );
            }
            for client in status.state.clients.values() {
                match &client.upstream_interface {
                    Some(interface) => {
                        let up = status.interfaces.get(interface).copied();
                        println!("Client {}: {} ({})", client.id, interface, link_state(up));
                        println!("  fwmark {:#x}, table {}", client.mark, client.table);
                        for chain in [&client.chain4, &client.chain6].into_iter().flatten() {
                            println!("  chain {}", chain);
                        }
                        for set in [
                            &client.proxy_set4,
                            &client.proxy_set6,
                            &client.direct_set4,
                            &client.direct_set6,
                        ]
                        .into_iter()
                        .flatten()
                        {
                            let present = status.sets.get(set).copied();
                            println!("  set {} ({})", set, set_state(present));
                        }
                    }
                    None => println!("Client {}: direct", client.id),
                }
            }
        }
        Commands::Health { records } => {
            let service = open_service(&config)?;
            let path = records.unwrap_or_else(|| config.records_file.clone());
            let records = RecordSet::load(&path)?;
            let health = service.health(records).await?;
            match health.resync {
                None => println!("All relay interfaces and target sets present"),
                Some(report) => {
                    println!("Missing: {}", health.missing.join(", "));
                    print_report(&report);
                }
            }
        }
        Commands::Import {
            file,
            name,
            interface,
            id,
        } => {
            let content = std::fs::read_to_string(&file)?;
            let relay = parse_relay_config(&content)?;
            let json = match (name, interface) {
                (Some(name), Some(interface)) => serde_json::to_string_pretty(
                    &relay.into_upstream_server(id, &name, &interface),
                )?,
                _ => serde_json::to_string_pretty(&wg_relay::model::UpstreamConfig::from(relay))?,
            };
            println!("{}", json);
        }
        Commands::Domains { records } => {
            let path = records.unwrap_or_else(|| config.records_file.clone());
            let records = RecordSet::load(&path)?;
            println!("{}", serde_json::to_string_pretty(&domain_map(&records))?);
        }
        Commands::Init => {
            info!("Generating default config...");
            let path = PathBuf::from(CONFIG_FILE_NAME);
            if path.exists() {
                error!("{} already exists", CONFIG_FILE_NAME);
                std::process::exit(1);
            }
            Config::default().save(&path)?;
            println!("Created default config: {}", CONFIG_FILE_NAME);
        }
    }

    Ok(())
}

fn open_service(config: &Config) -> Result<RoutingService, Box<dyn std::error::Error>> {
    warn_if_not_root();
    let platform = platform::get_platform(config.command_timeout())?;
    let reconciler = Reconciler::new(
        platform,
        StateStore::new(config.state_file.clone()),
        config.upstream_dir.clone(),
    );
    Ok(RoutingService::new(reconciler))
}

#[cfg(unix)]
fn warn_if_not_root() {
    if !nix::unistd::geteuid().is_root() {
        warn!("Not running as root; network commands will likely fail");
    }
}

#[cfg(not(unix))]
fn warn_if_not_root() {}

fn link_state(up: Option<bool>) -> &'static str {
    match up {
        Some(true) => "up",
        Some(false) => "DOWN",
        None => "unknown",
    }
}

fn set_state(present: Option<bool>) -> &'static str {
    match present {
        Some(true) => "present",
        Some(false) => "MISSING",
        None => "unknown",
    }
}

fn print_report(report: &SyncReport) {
    for upstream in &report.upstreams {
        match &upstream.error {
            None => println!("Shared relay {}: {} up", upstream.id, upstream.interface),
            Some(e) => println!("Shared relay {}: {} FAILED: {}", upstream.id, upstream.interface, e),
        }
    }
    for client in &report.clients {
        match &client.error {
            None => println!("Client {}: {}", client.id, client.stage),
            Some(e) => println!("Client {}: {} FAILED: {}", client.id, client.stage, e),
        }
    }
    if !report.cleanup_failures.is_empty() {
        println!("Cleanup failures:");
        for failure in &report.cleanup_failures {
            println!("  {}", failure);
        }
    }
    let failed = report.failed_clients().count();
    if failed > 0 {
        error!("{} of {} clients failed", failed, report.clients.len());
    } else {
        info!("{} clients synced", report.clients.len());
    }
}
