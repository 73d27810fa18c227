use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use dhcpfailover::{Config, FailoverServer, JsonStorage, Result, Storage};

#[derive(Parser)]
#[command(name = "dhcpfailover")]
#[command(author, version, about = "DHCP failover peer", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "failover.json")]
    config: PathBuf,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the failover peer.
    Run,
    /// Print the effective configuration.
    ShowConfig,
    /// Print the persisted state of every relationship.
    ShowState,
    /// Print the persisted leases.
    ListLeases,
}

fn format_time(time: i64) -> String {
    if time <= 0 {
        return "-".to_string();
    }
    DateTime::<Utc>::from_timestamp(time, 0)
        .map(|time| time.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| time.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let config = Config::load_or_create(&cli.config)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            info!("Starting failover peer with config: {:?}", cli.config);
            let mut server = FailoverServer::new(&config)?;

            let result = tokio::select! {
                result = server.run() => result,
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal, stopping failover peer...");
                    Ok(())
                }
            };
            if let Err(error) = server.shutdown() {
                tracing::error!("Failed to commit state on shutdown: {}", error);
            }
            result
        }
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::ShowState => {
            let storage = JsonStorage::open(&config.state_file)?;
            let states = &storage.snapshot().states;

            if states.is_empty() {
                println!("No failover state recorded.");
            } else {
                println!(
                    "{:<20} {:<26} {:<24} {:<26} {:<24} {:<6}",
                    "Relationship", "Local State", "Since", "Partner State", "Since", "MCLT"
                );
                println!("{}", "-".repeat(130));

                for record in states.values() {
                    println!(
                        "{:<20} {:<26} {:<24} {:<26} {:<24} {:<6}",
                        record.name,
                        record.local_state.to_string(),
                        format_time(record.local_stos),
                        record.partner_state.to_string(),
                        format_time(record.partner_stos),
                        record.mclt
                    );
                }
            }
            Ok(())
        }
        Commands::ListLeases => {
            let storage = JsonStorage::open(&config.state_file)?;
            let leases = &storage.snapshot().leases;

            if leases.is_empty() {
                println!("No leases recorded.");
            } else {
                println!(
                    "{:<16} {:<10} {:<24} {:<24} {:<20}",
                    "IP Address", "State", "Ends", "Partner May Free", "Hardware"
                );
                println!("{}", "-".repeat(98));

                for lease in leases.values() {
                    println!(
                        "{:<16} {:<10} {:<24} {:<24} {:<20}",
                        lease.ip_address.to_string(),
                        lease.binding_state.to_string(),
                        format_time(lease.ends),
                        format_time(lease.tsfp),
                        dhcpfailover::lease::format_hex(&lease.hardware_address)
                    );
                }
            }
            Ok(())
        }
    }
}
