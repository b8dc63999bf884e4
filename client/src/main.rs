use clap::Parser;
use client::network::{Client, ClientOptions};
use client::pending::ClaimResponse;
use log::{info, warn};
use shared::{RegistryKind, ResourceId};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Display name shown next to reserved resources
    #[arg(short, long, default_value = "Player")]
    name: String,

    /// Color slot to claim after joining
    #[arg(short, long)]
    color: Option<ResourceId>,

    /// Board spot to claim after joining
    #[arg(long)]
    spot: Option<ResourceId>,

    /// Simulate network latency in milliseconds
    #[arg(short = 'l', long, default_value = "0")]
    fake_ping: u64,

    /// Milliseconds to wait for the server to answer a claim
    #[arg(long, default_value = "2000")]
    request_timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    info!("Starting client...");
    info!("Connecting to: {}", args.server);
    if args.fake_ping > 0 {
        info!("Simulating {}ms latency", args.fake_ping);
    }

    let options = ClientOptions {
        fake_ping_ms: args.fake_ping,
        request_timeout: Duration::from_millis(args.request_timeout_ms),
        ..ClientOptions::default()
    };

    let client = Client::connect(&args.server, &args.name, options).await?;
    client.wait_ready().await?;

    for registry in RegistryKind::ALL {
        client.on_registry_changed(registry, move |mirror| {
            let taken: Vec<String> = mirror
                .reservations()
                .iter()
                .map(|(resource_id, owner)| {
                    let label = mirror.label_of(*resource_id).unwrap_or("?");
                    format!("{}={}({})", resource_id, label, owner)
                })
                .collect();
            info!("{} reservations: [{}]", registry, taken.join(", "));
        });
    }

    let wanted = [
        (RegistryKind::ColorSlot, args.color),
        (RegistryKind::BoardSpot, args.spot),
    ];
    for (registry, resource_id) in wanted {
        let Some(resource_id) = resource_id else {
            continue;
        };
        match client.claim(registry, resource_id).await {
            Ok(ClaimResponse::Granted(payload)) => {
                info!("Reserved {} {}: {:?}", registry, resource_id, payload)
            }
            Ok(ClaimResponse::Rejected(reason)) => {
                info!("{} {} refused: {:?}", registry, resource_id, reason)
            }
            Ok(ClaimResponse::Unexplained) => {
                warn!("{} {} refused without a reason", registry, resource_id)
            }
            Err(e) => warn!("Claim for {} {} failed: {}", registry, resource_id, e),
        }
    }

    info!("Press Ctrl+C to leave");
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, disconnecting...");
    client.disconnect().await?;

    Ok(())
}
