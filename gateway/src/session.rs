//! Gateway accept loop and per-client session handling.
//!
//! A session serves LOGIN (world directory) and ENTER_WORLD (one-time UDP
//! token mint + relay to the chosen world). Each session is a single task
//! that reads a line, writes its responses, and loops, so per-connection
//! writes are FIFO by construction.

use crate::link::WorldLink;
use log::{info, warn};
use rand::Rng;
use shared::{GatewayCommand, ENTER_TOKEN_TTL_MS, TOKEN_LEN};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// One entry in the world directory advertised to clients.
pub struct WorldInfo {
    pub id: u32,
    pub name: String,
    pub udp_host: String,
    pub udp_port: u16,
    pub link: WorldLink,
}

pub type WorldTable = Arc<HashMap<u32, WorldInfo>>;

/// Mints a random one-time credential.
pub fn rand_token() -> String {
    const ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
    let mut rng = rand::thread_rng();
    (0..TOKEN_LEN)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// The gateway: client entry point and world directory.
pub struct GatewayServer {
    listener: TcpListener,
    worlds: WorldTable,
}

impl GatewayServer {
    pub async fn new(
        addr: &str,
        worlds: WorldTable,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(addr).await?;
        info!("Gateway listening on {}", listener.local_addr()?);
        Ok(GatewayServer { listener, worlds })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept loop. The future is spawnable, so errors carry the
    /// Send + Sync bounds.
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    info!("Client connected from {}", peer);
                    let worlds = Arc::clone(&self.worlds);
                    tokio::spawn(async move {
                        run_session(stream, worlds).await;
                    });
                }
                Err(e) => warn!("Accept failed: {}", e),
            }
        }
    }
}

async fn run_session(stream: TcpStream, worlds: WorldTable) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) | Err(_) => {
                info!("Client closed");
                return;
            }
        };

        let command = match GatewayCommand::parse(&line) {
            Some(command) => command,
            None => continue,
        };

        for mut reply in respond(command, &worlds).await {
            reply.push('\n');
            if write_half.write_all(reply.as_bytes()).await.is_err() {
                return;
            }
        }
    }
}

/// Computes the response lines for one client command.
pub async fn respond(command: GatewayCommand, worlds: &WorldTable) -> Vec<String> {
    match command {
        GatewayCommand::Login { id } => {
            let login_token = rand_token();
            info!("LOGIN id={}", id);

            let mut replies = vec![format!(
                "LOGIN_OK token={} worldCount={}",
                login_token,
                worlds.len()
            )];
            let mut directory: Vec<&WorldInfo> = worlds.values().collect();
            directory.sort_by_key(|w| w.id);
            for world in directory {
                replies.push(format!(
                    "WORLD id={} name={} udp_host={} udp_port={}",
                    world.id, world.name, world.udp_host, world.udp_port
                ));
            }
            replies
        }

        GatewayCommand::EnterWorld { world, actor } => {
            let info = match worlds.get(&world) {
                Some(info) => info,
                None => {
                    warn!("ENTER_WORLD for unknown world {}", world);
                    return Vec::new();
                }
            };

            if info.link.actor_present(&actor).await {
                return vec!["ERR_ID_EXSIT".to_string()];
            }

            let udp_token = rand_token();
            info.link
                .register_udp_token(&udp_token, &actor, ENTER_TOKEN_TTL_MS)
                .await;
            info!("ENTER actor={} udp_token={}", actor, udp_token);

            vec![format!(
                "ENTER_OK udp_host={} udp_port={} udp_token={} actor={}",
                info.udp_host, info.udp_port, udp_token, actor
            )]
        }

        other => {
            warn!("Unknown gateway command: {:?}", other);
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_worlds() -> WorldTable {
        let mut worlds = HashMap::new();
        worlds.insert(
            1,
            WorldInfo {
                id: 1,
                name: "Test1".to_string(),
                udp_host: "127.0.0.1".to_string(),
                udp_port: 9001,
                link: WorldLink::start("127.0.0.1".to_string(), 1),
            },
        );
        worlds.insert(
            2,
            WorldInfo {
                id: 2,
                name: "Test2".to_string(),
                udp_host: "127.0.0.1".to_string(),
                udp_port: 9002,
                link: WorldLink::start("127.0.0.1".to_string(), 1),
            },
        );
        Arc::new(worlds)
    }

    #[test]
    fn test_rand_token_shape() {
        let token = rand_token();
        assert_eq!(token.len(), TOKEN_LEN);
        assert!(token.chars().all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
        // Two mints should essentially never collide.
        assert_ne!(rand_token(), token);
    }

    #[tokio::test]
    async fn test_login_lists_worlds_in_order() {
        let worlds = test_worlds();
        let replies = respond(
            GatewayCommand::Login {
                id: "alice".to_string(),
            },
            &worlds,
        )
        .await;

        assert_eq!(replies.len(), 3);
        assert!(replies[0].starts_with("LOGIN_OK token="));
        assert!(replies[0].ends_with("worldCount=2"));
        assert_eq!(replies[1], "WORLD id=1 name=Test1 udp_host=127.0.0.1 udp_port=9001");
        assert_eq!(replies[2], "WORLD id=2 name=Test2 udp_host=127.0.0.1 udp_port=9002");
    }

    #[tokio::test]
    async fn test_enter_world_mints_token_once_per_actor() {
        let worlds = test_worlds();
        let replies = respond(
            GatewayCommand::EnterWorld {
                world: 1,
                actor: "alice".to_string(),
            },
            &worlds,
        )
        .await;

        assert_eq!(replies.len(), 1);
        assert!(replies[0].starts_with("ENTER_OK udp_host=127.0.0.1 udp_port=9001 udp_token="));
        assert!(replies[0].ends_with("actor=alice"));

        // Actor now cached as present; re-entry is rejected locally.
        let replies = respond(
            GatewayCommand::EnterWorld {
                world: 1,
                actor: "alice".to_string(),
            },
            &worlds,
        )
        .await;
        assert_eq!(replies, vec!["ERR_ID_EXSIT".to_string()]);

        // Same actor in a different world is a separate admission.
        let replies = respond(
            GatewayCommand::EnterWorld {
                world: 2,
                actor: "alice".to_string(),
            },
            &worlds,
        )
        .await;
        assert!(replies[0].starts_with("ENTER_OK"));
    }

    #[tokio::test]
    async fn test_enter_unknown_world_is_silent() {
        let worlds = test_worlds();
        let replies = respond(
            GatewayCommand::EnterWorld {
                world: 9,
                actor: "alice".to_string(),
            },
            &worlds,
        )
        .await;
        assert!(replies.is_empty());
    }
}
