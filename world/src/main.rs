use clap::Parser;
use std::time::Duration;
use world::network::WorldServer;

/// World server for the card-matching game.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Control TCP port
    tcp_port: Option<String>,
    /// UDP game port
    udp_port: Option<String>,
    /// State tick interval in milliseconds
    #[clap(short, long, default_value_t = shared::STATE_TICK_MS)]
    tick_ms: u64,
}

/// Malformed or missing positional ports fall back to the defaults.
fn port_or(arg: Option<&str>, default: u16) -> u16 {
    arg.and_then(|s| s.parse().ok()).unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let args = Args::parse();
    let tcp_port = port_or(args.tcp_port.as_deref(), shared::WORLD_TCP_PORT);
    let udp_port = port_or(args.udp_port.as_deref(), shared::WORLD_UDP_PORT);

    let server = WorldServer::new(
        &format!("0.0.0.0:{}", tcp_port),
        &format!("0.0.0.0:{}", udp_port),
        Duration::from_millis(args.tick_ms),
    )
    .await?;

    server.run().await
}
