use clap::Parser;
use log::info;
use server::config::ServerConfig;
use server::network::Server;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Maximum number of connected players
    #[arg(short, long, default_value = "8")]
    max_clients: usize,

    /// Number of color slots (taken from the palette)
    #[arg(short, long, default_value = "8")]
    colors: usize,

    /// Number of board spots
    #[arg(short, long, default_value = "12")]
    spots: usize,

    /// Radius of the ring the board spots sit on
    #[arg(long, default_value = "220.0")]
    board_radius: f32,

    /// Seconds of silence before a player is disconnected
    #[arg(long, default_value = "5")]
    client_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let config = ServerConfig {
        bind_addr: format!("{}:{}", args.host, args.port),
        max_clients: args.max_clients,
        colors: args.colors,
        spots: args.spots,
        board_radius: args.board_radius,
        client_timeout: Duration::from_secs(args.client_timeout_secs),
        ..ServerConfig::default()
    };

    info!(
        "Starting server with {} color slots and {} board spots",
        config.colors, config.spots
    );

    let mut server = Server::new(config).await?;
    let shutdown = server.shutdown_handle();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down gracefully...");
            shutdown.shutdown();
        }
    });

    server.run().await?;

    Ok(())
}
