//! World server network layer: sockets, executors and the main event loop.
//!
//! All state mutation funnels through a single `select!` loop (the state
//! executor) fed by unbounded channels; per-tick UDP fan-out runs on a
//! separate transmission task so snapshotting is never blocked behind the
//! sends. Each TCP control connection gets a reader task forwarding complete
//! lines and a writer task draining a per-connection queue in FIFO order.

use crate::registry::ActorState;
use crate::world::{ConnId, World};
use log::{debug, error, info, warn};
use shared::{Command, SWEEP_INTERVAL_MS};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::interval;

/// Events marshaled onto the state executor. Every mutation path -- TCP
/// line, TCP close, UDP datagram -- arrives here before touching shared
/// state.
#[derive(Debug)]
pub enum WorldEvent {
    CtrlOpened {
        conn_id: ConnId,
        tx: mpsc::UnboundedSender<String>,
    },
    CtrlLine {
        conn_id: ConnId,
        line: String,
    },
    CtrlClosed {
        conn_id: ConnId,
    },
    Datagram {
        payload: String,
        addr: SocketAddr,
    },
}

/// Jobs handed to the transmission executor.
#[derive(Debug)]
enum TxJob {
    PositionBroadcast {
        actors: Vec<(String, ActorState)>,
        endpoints: Vec<SocketAddr>,
    },
}

/// Formats the per-tick position payload, one ACTOR_POS line per actor.
fn format_positions(actors: &[(String, ActorState)]) -> String {
    let mut payload = String::with_capacity(actors.len() * 40);
    for (actor, state) in actors {
        payload.push_str(&format!(
            "ACTOR_POS id={} x={} y={}\n",
            actor, state.x, state.y
        ));
    }
    payload
}

/// The world server: owns the listening sockets and drives the state and
/// transmission executors.
pub struct WorldServer {
    listener: TcpListener,
    socket: Arc<UdpSocket>,
    tick_duration: Duration,
    event_tx: mpsc::UnboundedSender<WorldEvent>,
    event_rx: mpsc::UnboundedReceiver<WorldEvent>,
}

impl WorldServer {
    pub async fn new(
        tcp_addr: &str,
        udp_addr: &str,
        tick_duration: Duration,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(tcp_addr).await?;
        let socket = Arc::new(UdpSocket::bind(udp_addr).await?);
        info!(
            "World listening on tcp {} / udp {}",
            listener.local_addr()?,
            socket.local_addr()?
        );

        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Ok(WorldServer {
            listener,
            socket,
            tick_duration,
            event_tx,
            event_rx,
        })
    }

    pub fn tcp_local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn udp_local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Spawns the task that listens for inbound datagrams.
    fn spawn_udp_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 2048];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        let payload = String::from_utf8_lossy(&buffer[..len]).into_owned();
                        if event_tx
                            .send(WorldEvent::Datagram { payload, addr })
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Error receiving datagram: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns the transmission executor: formats each position snapshot and
    /// fans it out to every bound endpoint.
    fn spawn_transmitter(&self) -> mpsc::UnboundedSender<TxJob> {
        let socket = Arc::clone(&self.socket);
        let (tx_tx, mut tx_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(job) = tx_rx.recv().await {
                match job {
                    TxJob::PositionBroadcast { actors, endpoints } => {
                        if actors.is_empty() || endpoints.is_empty() {
                            continue;
                        }
                        let payload = format_positions(&actors);
                        for ep in endpoints {
                            if let Err(e) = socket.send_to(payload.as_bytes(), ep).await {
                                debug!("Failed to send positions to {}: {}", ep, e);
                            }
                        }
                    }
                }
            }
        });

        tx_tx
    }

    /// Main server loop: the state executor. The future is spawnable, so
    /// errors carry the Send + Sync bounds.
    pub async fn run(mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.spawn_udp_receiver();
        let tx_tx = self.spawn_transmitter();
        spawn_acceptor(self.listener, self.event_tx.clone());

        let mut world = World::new();
        let mut tick_interval = interval(self.tick_duration);
        let mut sweep_interval = interval(Duration::from_millis(SWEEP_INTERVAL_MS));

        info!("World server started");

        loop {
            tokio::select! {
                event = self.event_rx.recv() => {
                    match event {
                        Some(WorldEvent::CtrlOpened { conn_id, tx }) => {
                            world.conn_opened(conn_id, tx);
                        }
                        Some(WorldEvent::CtrlLine { conn_id, line }) => {
                            if let Some(command) = Command::parse(&line) {
                                world.handle_command(conn_id, command);
                            }
                        }
                        Some(WorldEvent::CtrlClosed { conn_id }) => {
                            world.conn_closed(conn_id);
                        }
                        Some(WorldEvent::Datagram { payload, addr }) => {
                            world.handle_datagram(&payload, addr);
                        }
                        None => {
                            info!("World server shutting down");
                            break;
                        }
                    }
                },

                _ = tick_interval.tick() => {
                    world.heart_beat();
                    let (actors, endpoints) = world.position_snapshot();
                    let _ = tx_tx.send(TxJob::PositionBroadcast { actors, endpoints });
                },

                _ = sweep_interval.tick() => {
                    world.sweep();
                },
            }
        }

        Ok(())
    }
}

/// Spawns the accept loop; each connection gets a reader task (lines in)
/// and a writer task (FIFO lines out).
fn spawn_acceptor(listener: TcpListener, event_tx: mpsc::UnboundedSender<WorldEvent>) {
    tokio::spawn(async move {
        let mut next_conn_id: ConnId = 1;

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let conn_id = next_conn_id;
                    next_conn_id += 1;
                    debug!("Control connection {} from {}", conn_id, peer);
                    spawn_ctrl_session(stream, conn_id, event_tx.clone());
                }
                Err(e) => {
                    warn!("Accept failed: {}", e);
                }
            }
        }
    });
}

/// Wires up one control connection: a writer task draining the line queue
/// and a reader loop forwarding lines until disconnect.
fn spawn_ctrl_session(
    stream: TcpStream,
    conn_id: ConnId,
    event_tx: mpsc::UnboundedSender<WorldEvent>,
) {
    let (read_half, write_half) = stream.into_split();
    let (line_tx, line_rx) = mpsc::unbounded_channel();

    if event_tx
        .send(WorldEvent::CtrlOpened {
            conn_id,
            tx: line_tx,
        })
        .is_err()
    {
        return;
    }

    tokio::spawn(drain_writes(write_half, line_rx));

    tokio::spawn(async move {
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();

        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = line.trim_end().to_string();
                    if line.is_empty() {
                        continue;
                    }
                    if event_tx
                        .send(WorldEvent::CtrlLine { conn_id, line })
                        .is_err()
                    {
                        return;
                    }
                }
            }
        }
        let _ = event_tx.send(WorldEvent::CtrlClosed { conn_id });
    });
}

async fn drain_writes(mut write_half: OwnedWriteHalf, mut line_rx: mpsc::UnboundedReceiver<String>) {
    while let Some(mut line) = line_rx.recv().await {
        line.push('\n');
        if write_half.write_all(line.as_bytes()).await.is_err() {
            // Reader side reports the disconnect; just stop draining.
            break;
        }
    }
}
