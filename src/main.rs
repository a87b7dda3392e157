use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use meshlink::connection::{Connection, ConnectionConfig, LinkSupervisor, SupervisorConfig, SupervisorEvent};
use meshlink::repository::{Repository, RepositoryConfig};
use meshlink::transport::{BluezCentral, ScanFilter, Scanner};
use meshlink::TransportState;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "meshlink")]
#[command(about = "Bluetooth LE link manager for mesh radios", long_about = None)]
#[command(version)]
struct Cli {
    /// Bluetooth adapter to use (e.g. hci0); the default adapter if omitted
    #[arg(short, long, global = true)]
    adapter: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for mesh radios
    Scan {
        #[arg(short, long, default_value = "5")]
        seconds: u64,
        /// Report every advertising device, not only mesh radios
        #[arg(long)]
        all: bool,
    },
    /// List bonded mesh radios
    Bonded,
    /// Pair with a radio
    Bond { address: String },
    /// Connect to a radio and keep the link up until Ctrl-C
    Connect {
        address: String,
        /// Give up after this many reconnect attempts in a row
        #[arg(short, long)]
        max_attempts: Option<u32>,
    },
    /// Show permission and adapter state
    State,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();
    let central = Arc::new(BluezCentral::new(cli.adapter.as_deref()).await?);

    match cli.command {
        Commands::Scan { seconds, all } => {
            let duration = Duration::from_secs(seconds);
            if all {
                scan_all(central, duration).await
            } else {
                scan_radios(central, duration).await
            }
        }
        Commands::Bonded => {
            let repo = Repository::new(central, RepositoryConfig::default());
            let state = repo.refresh_state().await;
            print_devices("Bonded radios", &state.bonded_devices);
            Ok(())
        }
        Commands::Bond { address } => {
            if !Repository::<BluezCentral>::is_valid_address(&address) {
                bail!("Invalid address {:?}, expected XX:XX:XX:XX:XX:XX", address);
            }

            let device = central.peripheral(&address).await?;
            let repo = Repository::new(central, RepositoryConfig::default());
            repo.bond(&device).await?;
            info!("Bonded with {}", device);
            print_state(&repo.state());
            Ok(())
        }
        Commands::Connect {
            address,
            max_attempts,
        } => connect(central, &address, max_attempts).await,
        Commands::State => {
            let repo = Repository::new(central, RepositoryConfig::default());
            print_state(&repo.refresh_state().await);
            Ok(())
        }
    }
}

async fn scan_radios(central: Arc<BluezCentral>, duration: Duration) -> Result<()> {
    let repo = Repository::new(
        central,
        RepositoryConfig {
            scan_duration: duration,
            ..Default::default()
        },
    );

    let mut scanning = repo.subscribe_is_scanning();
    repo.start_scan();

    tokio::select! {
        result = scanning.wait_for(|scanning| !*scanning) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Scan interrupted");
            repo.stop_scan();
        }
    }

    print_devices("Mesh radios", &repo.scanned_devices());
    Ok(())
}

async fn scan_all(central: Arc<BluezCentral>, duration: Duration) -> Result<()> {
    let scanner = Scanner::new(central);
    let mut results = scanner.scan(duration, Some(ScanFilter::any()));

    loop {
        tokio::select! {
            result = results.next() => match result {
                Some(Ok(device)) => println!("{}", device),
                Some(Err(e)) => bail!("Scan failed: {}", e),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Scan interrupted");
                break;
            }
        }
    }

    Ok(())
}

async fn connect(central: Arc<BluezCentral>, address: &str, max_attempts: Option<u32>) -> Result<()> {
    let device = central.peripheral(address).await?;
    info!("Connecting to {}", device);

    let connection = Arc::new(Connection::new(ConnectionConfig::default()));
    let config = SupervisorConfig {
        max_attempts,
        ..Default::default()
    };
    let mut supervisor = LinkSupervisor::spawn(Arc::clone(&connection), device, config);

    let mut failure = None;
    loop {
        tokio::select! {
            event = supervisor.recv() => match event {
                Some(SupervisorEvent::Ready { endpoints }) => {
                    info!("Link ready, {} endpoint(s) on service {}", endpoints.len(), endpoints.service());
                    for (uuid, _) in endpoints.iter() {
                        info!("  {}", uuid);
                    }
                }
                Some(SupervisorEvent::LinkLost { error }) => {
                    warn!("Link lost: {}", error);
                }
                Some(SupervisorEvent::Reconnecting { attempt, delay }) => {
                    info!("Reconnecting in {:?} (attempt {})", delay, attempt);
                }
                Some(SupervisorEvent::GaveUp { error }) => {
                    error!("Giving up: {}", error);
                    failure = Some(error);
                    break;
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
        }
    }

    supervisor.shutdown().await?;
    info!("Final state: {}", connection.state());

    match failure {
        Some(error) => Err(error.into()),
        None => Ok(()),
    }
}

fn print_devices<H>(title: &str, devices: &[meshlink::DeviceIdentity<H>]) {
    println!("{} ({}):", title, devices.len());
    for device in devices {
        println!("  {}", device);
    }
}

fn print_state<H>(state: &TransportState<H>) {
    println!("Permissions granted: {}", state.has_permissions);
    println!("Adapter enabled:     {}", state.enabled);
    print_devices("Bonded radios", &state.bonded_devices);
}
