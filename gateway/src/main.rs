use clap::Parser;
use gateway::link::WorldLink;
use gateway::session::{GatewayServer, WorldInfo};
use std::collections::HashMap;
use std::sync::Arc;

/// Gateway server for the card-matching game.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Listen port
    port: Option<String>,
    /// Name of the advertised world
    #[clap(long, default_value = "Test1")]
    world_name: String,
    /// Host of the advertised world
    #[clap(long, default_value = "127.0.0.1")]
    world_host: String,
    /// Control TCP port of the advertised world
    #[clap(long, default_value_t = shared::WORLD_TCP_PORT)]
    world_tcp_port: u16,
    /// UDP game port of the advertised world
    #[clap(long, default_value_t = shared::WORLD_UDP_PORT)]
    world_udp_port: u16,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let args = Args::parse();
    let port: u16 = args
        .port
        .as_deref()
        .and_then(|s| s.parse().ok())
        .unwrap_or(shared::GATEWAY_PORT);

    let mut worlds = HashMap::new();
    worlds.insert(
        1,
        WorldInfo {
            id: 1,
            name: args.world_name,
            udp_host: args.world_host.clone(),
            udp_port: args.world_udp_port,
            link: WorldLink::start(args.world_host, args.world_tcp_port),
        },
    );

    let server = GatewayServer::new(&format!("0.0.0.0:{}", port), Arc::new(worlds)).await?;
    server.run().await
}
