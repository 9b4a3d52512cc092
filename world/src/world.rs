//! World orchestrator: room table, control sessions and protocol dispatch.
//!
//! One `World` instance owns every room, the actor -> control-transport
//! bindings and the token/session registry. It is mutated exclusively from
//! the state executor task in `network`, so handlers here can touch the maps
//! freely. Transports are held only as per-connection line senders; a send
//! to a connection whose writer has gone away is a normal absent outcome.

use crate::registry::{ActorState, SessionRegistry};
use crate::room::{Phase, Room};
use log::{debug, info, warn};
use shared::{exit_user_line, Command, Datagram};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc::UnboundedSender;

pub type ConnId = u64;

/// Per-connection state tracked by the orchestrator.
struct CtrlConn {
    tx: UnboundedSender<String>,
    actor: Option<String>,
    room: Option<String>,
}

pub struct World {
    rooms: HashMap<String, Room>,
    conns: HashMap<ConnId, CtrlConn>,
    /// actor id -> control connection currently speaking for it.
    ctrl_sessions: HashMap<String, ConnId>,
    /// The single well-known gateway peer, remembered from its last
    /// token registration.
    gateway_conn: Option<ConnId>,
    pub registry: SessionRegistry,
    room_seq: u64,
}

/// Seed for deck shuffle and turn pick, taken from the wall clock at
/// scheduling time.
fn clock_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

impl World {
    pub fn new() -> Self {
        Self {
            rooms: HashMap::new(),
            conns: HashMap::new(),
            ctrl_sessions: HashMap::new(),
            gateway_conn: None,
            registry: SessionRegistry::new(),
            room_seq: 1,
        }
    }

    pub fn room(&self, room_id: &str) -> Option<&Room> {
        self.rooms.get(room_id)
    }

    // --- transport bookkeeping -------------------------------------------

    pub fn conn_opened(&mut self, conn_id: ConnId, tx: UnboundedSender<String>) {
        self.conns.insert(
            conn_id,
            CtrlConn {
                tx,
                actor: None,
                room: None,
            },
        );
    }

    /// Full disconnect cascade: drop the control binding, replay the
    /// room-exit consequences for the room the actor last occupied, announce
    /// the departure, purge the registry and tell the gateway to forget the
    /// actor.
    pub fn conn_closed(&mut self, conn_id: ConnId) {
        let conn = match self.conns.remove(&conn_id) {
            Some(conn) => conn,
            None => return,
        };
        if self.gateway_conn == Some(conn_id) {
            self.gateway_conn = None;
        }

        let actor = match conn.actor {
            Some(actor) => actor,
            None => return,
        };
        info!("Control session closed for {}", actor);

        if self.ctrl_sessions.get(&actor) == Some(&conn_id) {
            self.ctrl_sessions.remove(&actor);
        }
        if let Some(room_id) = conn.room {
            self.room_exit(&room_id, &actor);
        }
        self.send_to_all(&format!("BROADCAST_EXIT_SERVER actor={actor}"));
        self.registry.remove_actor(&actor);
        self.send_to_gateway(&exit_user_line(&actor));
    }

    fn send_to_conn(&self, conn_id: ConnId, line: &str) {
        if let Some(conn) = self.conns.get(&conn_id) {
            // A closed writer means the transport is already gone.
            let _ = conn.tx.send(line.to_string());
        }
    }

    fn send_to_actor(&self, actor: &str, line: &str) {
        if let Some(conn_id) = self.ctrl_sessions.get(actor) {
            self.send_to_conn(*conn_id, line);
        }
    }

    fn send_to_room(&self, room_id: &str, line: &str) {
        if let Some(room) = self.rooms.get(room_id) {
            for actor in &room.members {
                self.send_to_actor(actor, line);
            }
        }
    }

    fn send_to_all(&self, line: &str) {
        for conn_id in self.ctrl_sessions.values() {
            self.send_to_conn(*conn_id, line);
        }
    }

    fn send_to_gateway(&self, line: &str) {
        if let Some(conn_id) = self.gateway_conn {
            self.send_to_conn(conn_id, line);
        }
    }

    // --- periodic work ----------------------------------------------------

    /// State-tick snapshot handed to the transmission executor: every actor
    /// position plus every bound endpoint (undifferentiated fan-out).
    pub fn position_snapshot(&self) -> (Vec<(String, ActorState)>, Vec<SocketAddr>) {
        (self.registry.snapshot(), self.registry.endpoints())
    }

    pub fn heart_beat(&self) {
        self.send_to_all("BROADCAST_HEART_BEAT");
    }

    pub fn sweep(&mut self) {
        self.registry.sweep();
    }

    // --- inbound dispatch -------------------------------------------------

    /// Handles one UDP datagram. No failure replies: UDP has no channel for
    /// them, so bad handshakes and stale moves are dropped silently.
    pub fn handle_datagram(&mut self, payload: &str, addr: SocketAddr) {
        match Datagram::parse(payload) {
            Some(Datagram::Hello { token, actor }) => {
                if !self.registry.hello(&token, &actor, addr) {
                    debug!("Rejected UDP hello from {} for {}", addr, actor);
                }
            }
            Some(Datagram::Move { seq, x, y }) => {
                self.registry.on_move(addr, seq, x, y);
            }
            Some(Datagram::Unknown) => {
                warn!("Unknown datagram from {}", addr);
            }
            None => {}
        }
    }

    /// Handles one decoded control command from a TCP session.
    pub fn handle_command(&mut self, conn_id: ConnId, command: Command) {
        match command {
            Command::Hello { actor } => self.on_hello(conn_id, actor),
            Command::RegisterUdpToken {
                token,
                actor,
                ttl_ms,
            } => {
                self.registry.register_token(token, actor, ttl_ms);
                self.gateway_conn = Some(conn_id);
                self.send_to_conn(conn_id, "OK");
            }
            Command::CreateRoom { title, rows, cols } => {
                self.on_create_room(conn_id, title, rows, cols)
            }
            Command::EnterRoom { room_id } => self.on_enter_room(conn_id, room_id),
            Command::ChangeReady { room_id, is_ready } => {
                if let Some(room) = self.rooms.get_mut(&room_id) {
                    room.is_ready = is_ready;
                    let ready = if is_ready { "True" } else { "False" };
                    self.send_to_room(
                        &room_id,
                        &format!("CAST_CHANGE_READY roomId={room_id} isReady={ready}"),
                    );
                }
            }
            Command::GameStart { room_id } => self.on_game_start(&room_id),
            Command::FirstFlipEnd { room_id, actor } => {
                let done = match self.rooms.get_mut(&room_id) {
                    Some(room) if room.phase == Phase::Playing => room.peek_end(&actor),
                    _ => false,
                };
                if done {
                    self.cast_first_flip_end(&room_id);
                }
            }
            Command::Flip {
                room_id,
                actor,
                index,
            } => self.on_flip(&room_id, &actor, index),
            Command::RoomExit { room_id, actor } => {
                self.room_exit(&room_id, &actor);
                if let Some(conn) = self.conns.get_mut(&conn_id) {
                    conn.room = None;
                }
            }
            Command::ChangeRule {
                room_id,
                master,
                cols,
                rows,
            } => self.on_change_rule(&room_id, &master, cols, rows),
            Command::Unknown => self.send_to_conn(conn_id, "ERR code=UNKNOWN"),
        }
    }

    fn on_hello(&mut self, conn_id: ConnId, actor: String) {
        if actor.is_empty() {
            self.send_to_conn(conn_id, "ERR code=BAD_HELLO");
            return;
        }
        if let Some(conn) = self.conns.get_mut(&conn_id) {
            conn.actor = Some(actor.clone());
        }
        self.ctrl_sessions.insert(actor.clone(), conn_id);
        self.send_to_conn(conn_id, &format!("HELLO_OK actor={actor}"));
    }

    fn on_create_room(&mut self, conn_id: ConnId, title: String, rows: i32, cols: i32) {
        let actor = match self.conns.get(&conn_id).and_then(|c| c.actor.clone()) {
            Some(actor) => actor,
            None => {
                self.send_to_conn(conn_id, "ERR code=BAD_HELLO");
                return;
            }
        };

        let room_id = format!("r{:06}", self.room_seq);
        self.room_seq += 1;

        let room = Room::new(room_id.clone(), actor.clone(), title.clone(), rows, cols);
        self.rooms.insert(room_id.clone(), room);
        if let Some(conn) = self.conns.get_mut(&conn_id) {
            conn.room = Some(room_id.clone());
        }
        info!("Room {} created by {}", room_id, actor);

        self.send_to_conn(
            conn_id,
            &format!("RES_CREATE_ROOM roomId={room_id} master={actor} title={title}"),
        );
        self.send_to_all(&format!(
            "BROADCAST_CREATE_ROOM roomId={room_id} master={actor} title={title}"
        ));
    }

    fn on_enter_room(&mut self, conn_id: ConnId, room_id: String) {
        let actor = match self.conns.get(&conn_id).and_then(|c| c.actor.clone()) {
            Some(actor) => actor,
            None => {
                self.send_to_conn(conn_id, "ERR code=BAD_HELLO");
                return;
            }
        };

        let room = match self.rooms.get_mut(&room_id) {
            Some(room) => room,
            None => {
                self.send_to_conn(conn_id, &format!("ERR code=ROOM_NOT_FOUND roomId={room_id}"));
                return;
            }
        };
        room.members.insert(actor.clone());
        room.challenger = actor.clone();
        let (master, challenger, title, rows, cols) = (
            room.master.clone(),
            room.challenger.clone(),
            room.title.clone(),
            room.rows,
            room.cols,
        );
        if let Some(conn) = self.conns.get_mut(&conn_id) {
            conn.room = Some(room_id.clone());
        }

        self.send_to_room(
            &room_id,
            &format!(
                "CAST_ENTER_ROOM roomId={room_id} master={master} challenger={challenger} \
                 title={title} rows={rows} cols={cols}"
            ),
        );
        self.send_to_all(&format!("BROADCAST_ENTER_ROOM roomId={room_id} title={title}"));
    }

    fn on_game_start(&mut self, room_id: &str) {
        let started = match self.rooms.get_mut(room_id) {
            Some(room) if room.is_ready => room.start_game(clock_seed()),
            _ => false,
        };
        if !started {
            return;
        }

        let room = &self.rooms[room_id];
        let cards = room
            .deck
            .cards
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(",");
        self.send_to_room(
            room_id,
            &format!("CAST_GAME_START roomId={room_id} cards={cards} dur=500 all_dur=500 phase=1"),
        );
    }

    fn cast_first_flip_end(&self, room_id: &str) {
        if let Some(room) = self.rooms.get(room_id) {
            let line = format!(
                "CAST_FIRST_FLIP_END roomId={} turn={} masterScore={} challengerScore={}",
                room_id,
                room.turn,
                room.score_of(&room.master),
                room.score_of(&room.challenger),
            );
            self.send_to_room(room_id, &line);
        }
    }

    fn on_flip(&mut self, room_id: &str, actor: &str, index: i32) {
        let flipped = match self.rooms.get_mut(room_id) {
            Some(room) => room.card_flip(actor, index),
            None => false,
        };
        // A rejected flip is a pure no-op; nothing is cast.
        if !flipped {
            return;
        }

        let room = &self.rooms[room_id];
        // An accepted first flip only records the index; the result is cast
        // once the second flip resolves the pair.
        if room.first_index.is_some() {
            return;
        }
        let card = room.deck.cards[index as usize];
        let scores = format!(
            "turn={} masterScore={} challengerScore={}",
            room.turn,
            room.score_of(&room.master),
            room.score_of(&room.challenger),
        );
        let line = if room.phase == Phase::End {
            format!(
                "CAST_END_GAME roomId={room_id} index={index} card={card} {scores} winner={}",
                room.winner()
            )
        } else {
            format!("CAST_FLIP_RESULT roomId={room_id} index={index} card={card} {scores}")
        };
        self.send_to_room(room_id, &line);
    }

    fn on_change_rule(&mut self, room_id: &str, master: &str, cols: i32, rows: i32) {
        let room = match self.rooms.get_mut(room_id) {
            Some(room) => room,
            None => return,
        };
        // Only the master changes the board; anything else drops silently.
        if room.master != master {
            return;
        }
        room.cols = cols;
        room.rows = rows;
        self.send_to_room(
            room_id,
            &format!("CAST_CHANGE_RULE roomId={room_id} cols={cols} rows={rows}"),
        );
    }

    /// Removes `actor` from the room, running the shared exit cascade:
    /// forced end-game if mid-play, exit cast to the room, master promotion
    /// or challenger removal, and deletion once the room empties under its
    /// master's own exit.
    fn room_exit(&mut self, room_id: &str, actor: &str) {
        let (master, phase) = match self.rooms.get(room_id) {
            Some(room) => (room.master.clone(), room.phase),
            None => return,
        };

        if phase == Phase::Playing {
            self.cast_forced_end_game(room_id);
        }
        self.send_to_room(
            room_id,
            &format!("CAST_EXIT_ROOM roomId={room_id} master={master} exitActor={actor}"),
        );

        if master == actor {
            if let Some(room) = self.rooms.get_mut(room_id) {
                room.score.remove(&master);
                room.peek_acked.remove(&master);
                room.members.remove(&master);
                room.master = std::mem::take(&mut room.challenger);
                let new_master = room.master.clone();
                self.send_to_all(&format!(
                    "BROADCAST_CHANGE_ROOM_MASTER roomId={room_id} master={new_master}"
                ));
            }
        } else if let Some(room) = self.rooms.get_mut(room_id) {
            let challenger = std::mem::take(&mut room.challenger);
            room.score.remove(&challenger);
            room.peek_acked.remove(&challenger);
            room.members.remove(&challenger);
            let title = room.title.clone();
            self.send_to_all(&format!("BROADCAST_EXIT_ROOM roomId={room_id} title={title}"));
        }

        let empty = self
            .rooms
            .get(room_id)
            .map(|room| room.members.is_empty())
            .unwrap_or(false);
        if empty && master == actor {
            self.rooms.remove(room_id);
            info!("Room {} deleted", room_id);
            self.send_to_all(&format!(
                "BROADCAST_DELETE_ROOM roomId={room_id} master={actor}"
            ));
        }
    }

    fn cast_forced_end_game(&mut self, room_id: &str) {
        if let Some(room) = self.rooms.get_mut(room_id) {
            room.phase = Phase::End;
            let phase = room.phase.wire();
            self.send_to_room(
                room_id,
                &format!("CAST_FORCED_END_GAME roomId={room_id} phase={phase}"),
            );
        }
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}
