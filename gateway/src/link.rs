//! Persistent outbound link from the gateway to one world server.
//!
//! The link owns a single TCP connection driven through a
//! DISCONNECTED -> RESOLVING -> CONNECTING -> CONNECTED state machine with
//! exponential reconnect backoff. Outbound messages queue while the link is
//! down and drain strictly in FIFO order once it is up. The only inbound
//! traffic is EXIT_USER, which drops the local "actor admitted to this
//! world" cache entry.

use log::{info, warn};
use shared::{register_udp_token_line, GatewayCommand};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::time::sleep;

pub const BACKOFF_FLOOR_MS: u64 = 500;
pub const BACKOFF_CEIL_MS: u64 = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Resolving,
    Connecting,
    Connected,
}

/// Reconnect delay: doubles from the floor on every failure, capped at the
/// ceiling, reset to the floor by a successful connect.
#[derive(Debug)]
pub struct Backoff {
    current_ms: u64,
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            current_ms: BACKOFF_FLOOR_MS,
        }
    }

    /// Delay to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_ms;
        self.current_ms = (self.current_ms * 2).min(BACKOFF_CEIL_MS);
        Duration::from_millis(delay)
    }

    pub fn reset(&mut self) {
        self.current_ms = BACKOFF_FLOOR_MS;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a running world link.
pub struct WorldLink {
    out_tx: mpsc::UnboundedSender<String>,
    admitted: Arc<RwLock<HashSet<String>>>,
    state: Arc<RwLock<LinkState>>,
}

impl WorldLink {
    /// Spawns the connection task for `host:port` and returns the handle.
    pub fn start(host: String, port: u16) -> Self {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let admitted = Arc::new(RwLock::new(HashSet::new()));
        let state = Arc::new(RwLock::new(LinkState::Disconnected));

        tokio::spawn(run_link(
            host,
            port,
            out_rx,
            Arc::clone(&admitted),
            Arc::clone(&state),
        ));

        WorldLink {
            out_tx,
            admitted,
            state,
        }
    }

    /// Queues a token registration for transmission and remembers the actor
    /// as admitted so duplicate entry checks need no round trip.
    pub async fn register_udp_token(&self, token: &str, actor: &str, ttl_ms: u64) {
        self.admitted.write().await.insert(actor.to_string());
        let _ = self.out_tx.send(register_udp_token_line(token, actor, ttl_ms));
    }

    /// Whether the actor is currently believed present in this world.
    pub async fn actor_present(&self, actor: &str) -> bool {
        self.admitted.read().await.contains(actor)
    }

    pub async fn state(&self) -> LinkState {
        *self.state.read().await
    }
}

async fn run_link(
    host: String,
    port: u16,
    mut out_rx: mpsc::UnboundedReceiver<String>,
    admitted: Arc<RwLock<HashSet<String>>>,
    state: Arc<RwLock<LinkState>>,
) {
    let mut backoff = Backoff::new();

    loop {
        *state.write().await = LinkState::Resolving;
        let addrs = match lookup_host((host.as_str(), port)).await {
            Ok(addrs) => addrs.collect::<Vec<_>>(),
            Err(e) => {
                warn!("World resolve failed: {}", e);
                *state.write().await = LinkState::Disconnected;
                sleep(backoff.next_delay()).await;
                continue;
            }
        };

        *state.write().await = LinkState::Connecting;
        let stream = match connect_any(&addrs).await {
            Some(stream) => stream,
            None => {
                warn!("World connect failed: {}:{}", host, port);
                *state.write().await = LinkState::Disconnected;
                sleep(backoff.next_delay()).await;
                continue;
            }
        };

        backoff.reset();
        *state.write().await = LinkState::Connected;
        info!("World link connected to {}:{}", host, port);

        if let Err(e) = drive_link(stream, &mut out_rx, &admitted).await {
            warn!("World link closed: {}", e);
        }
        *state.write().await = LinkState::Disconnected;
        sleep(backoff.next_delay()).await;
    }
}

async fn connect_any(addrs: &[std::net::SocketAddr]) -> Option<TcpStream> {
    for addr in addrs {
        if let Ok(stream) = TcpStream::connect(addr).await {
            return Some(stream);
        }
    }
    None
}

/// Pumps the connected link: drains the outbound queue in FIFO order and
/// dispatches inbound lines, until either side of the socket fails.
async fn drive_link(
    stream: TcpStream,
    out_rx: &mut mpsc::UnboundedReceiver<String>,
    admitted: &Arc<RwLock<HashSet<String>>>,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    loop {
        tokio::select! {
            msg = out_rx.recv() => {
                match msg {
                    Some(mut msg) => {
                        msg.push('\n');
                        write_half.write_all(msg.as_bytes()).await?;
                    }
                    // All handles dropped; nothing left to relay.
                    None => return Ok(()),
                }
            },
            line = lines.next_line() => {
                match line? {
                    Some(line) => handle_link_line(&line, admitted).await,
                    None => {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "world closed the link",
                        ));
                    }
                }
            },
        }
    }
}

async fn handle_link_line(line: &str, admitted: &Arc<RwLock<HashSet<String>>>) {
    match GatewayCommand::parse(line) {
        Some(GatewayCommand::ExitUser { id }) => {
            admitted.write().await.remove(&id);
            info!("World dropped actor {}", id);
        }
        Some(_) => {}
        None => {}
    }
}
