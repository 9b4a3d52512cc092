use std::collections::HashMap;

pub const GATEWAY_PORT: u16 = 7000;
pub const WORLD_TCP_PORT: u16 = 7100;
pub const WORLD_UDP_PORT: u16 = 9001;

pub const STATE_TICK_MS: u64 = 100;
pub const SWEEP_INTERVAL_MS: u64 = 1000;

/// TTL applied when a GW_REGISTER_UDP_TOKEN line carries no ttl field.
pub const DEFAULT_TOKEN_TTL_MS: u64 = 60_000;
/// TTL the gateway stamps on tokens it mints for ENTER_WORLD.
pub const ENTER_TOKEN_TTL_MS: u64 = 6_000;

/// Maximum accepted straight-line displacement per MOVE update.
pub const MOVE_SPEED_LIMIT: f32 = 5.0;

pub const TOKEN_LEN: usize = 12;

/// Splits a protocol line into its command word and `key=value` fields.
///
/// Tokens without a `=` are ignored; only the first `=` in a token splits
/// key from value. Returns `None` for empty or whitespace-only lines.
pub fn parse_line(line: &str) -> Option<(&str, HashMap<&str, &str>)> {
    let line = line.trim_end_matches(['\r', '\n']);
    let mut parts = line.split_whitespace();
    let cmd = parts.next()?;

    let mut kv = HashMap::new();
    for tok in parts {
        if let Some(pos) = tok.find('=') {
            kv.insert(&tok[..pos], &tok[pos + 1..]);
        }
    }
    Some((cmd, kv))
}

fn kv_str(kv: &HashMap<&str, &str>, key: &str) -> String {
    kv.get(key).map(|v| v.to_string()).unwrap_or_default()
}

fn kv_i32(kv: &HashMap<&str, &str>, key: &str) -> i32 {
    kv.get(key).and_then(|v| v.parse().ok()).unwrap_or(0)
}

fn kv_u32(kv: &HashMap<&str, &str>, key: &str) -> u32 {
    kv.get(key).and_then(|v| v.parse().ok()).unwrap_or(0)
}

fn kv_f32(kv: &HashMap<&str, &str>, key: &str) -> f32 {
    kv.get(key).and_then(|v| v.parse().ok()).unwrap_or(0.0)
}

/// Control commands accepted by the world server over TCP.
///
/// Each inbound line is decoded exactly once at the transport boundary;
/// anything unrecognized lands in `Unknown` and is answered with an ERR.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Hello {
        actor: String,
    },
    RegisterUdpToken {
        token: String,
        actor: String,
        ttl_ms: u64,
    },
    CreateRoom {
        title: String,
        rows: i32,
        cols: i32,
    },
    EnterRoom {
        room_id: String,
    },
    ChangeReady {
        room_id: String,
        is_ready: bool,
    },
    GameStart {
        room_id: String,
    },
    FirstFlipEnd {
        room_id: String,
        actor: String,
    },
    Flip {
        room_id: String,
        actor: String,
        index: i32,
    },
    RoomExit {
        room_id: String,
        actor: String,
    },
    ChangeRule {
        room_id: String,
        master: String,
        cols: i32,
        rows: i32,
    },
    Unknown,
}

impl Command {
    /// Decodes one control line. `None` means the line was empty.
    pub fn parse(line: &str) -> Option<Command> {
        let (cmd, kv) = parse_line(line)?;

        let parsed = match cmd {
            "HELLO" => Command::Hello {
                actor: kv_str(&kv, "actor"),
            },
            "GW_REGISTER_UDP_TOKEN" => Command::RegisterUdpToken {
                token: kv_str(&kv, "token"),
                actor: kv_str(&kv, "actor"),
                ttl_ms: kv
                    .get("ttl")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_TOKEN_TTL_MS),
            },
            "REQ_CREATE_ROOM" => Command::CreateRoom {
                title: kv_str(&kv, "title"),
                rows: kv_i32(&kv, "rows"),
                cols: kv_i32(&kv, "cols"),
            },
            "REQ_ENTER_ROOM" => Command::EnterRoom {
                room_id: kv_str(&kv, "roomId"),
            },
            "REQ_CHANGE_READY" => Command::ChangeReady {
                room_id: kv_str(&kv, "roomId"),
                is_ready: kv.get("isReady").map(|v| *v == "True").unwrap_or(false),
            },
            "REQ_GAME_START" => Command::GameStart {
                room_id: kv_str(&kv, "roomId"),
            },
            "REQ_FIRST_FLIP_END" => Command::FirstFlipEnd {
                room_id: kv_str(&kv, "roomId"),
                actor: kv_str(&kv, "actor"),
            },
            "REQ_FLIP" => Command::Flip {
                room_id: kv_str(&kv, "roomId"),
                actor: kv_str(&kv, "actor"),
                index: kv_i32(&kv, "index"),
            },
            "REQ_ROOM_EXIT" => Command::RoomExit {
                room_id: kv_str(&kv, "roomId"),
                actor: kv_str(&kv, "actor"),
            },
            "REQ_CHANGE_RULE" => Command::ChangeRule {
                room_id: kv_str(&kv, "roomId"),
                master: kv_str(&kv, "master"),
                cols: kv_i32(&kv, "cols"),
                rows: kv_i32(&kv, "rows"),
            },
            _ => Command::Unknown,
        };
        Some(parsed)
    }
}

/// Commands accepted by the gateway over TCP, including the EXIT_USER
/// notification arriving back over the world link.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayCommand {
    Login { id: String },
    EnterWorld { world: u32, actor: String },
    ExitUser { id: String },
    Unknown,
}

impl GatewayCommand {
    pub fn parse(line: &str) -> Option<GatewayCommand> {
        let (cmd, kv) = parse_line(line)?;

        let parsed = match cmd {
            "LOGIN" => GatewayCommand::Login {
                id: kv_str(&kv, "id"),
            },
            "ENTER_WORLD" => GatewayCommand::EnterWorld {
                world: kv_u32(&kv, "world"),
                actor: kv_str(&kv, "actor"),
            },
            "EXIT_USER" => GatewayCommand::ExitUser {
                id: kv_str(&kv, "id"),
            },
            _ => GatewayCommand::Unknown,
        };
        Some(parsed)
    }
}

/// Datagrams accepted on the world's UDP port.
#[derive(Debug, Clone, PartialEq)]
pub enum Datagram {
    Hello { token: String, actor: String },
    Move { seq: u32, x: f32, y: f32 },
    Unknown,
}

impl Datagram {
    pub fn parse(payload: &str) -> Option<Datagram> {
        let (cmd, kv) = parse_line(payload)?;

        let parsed = match cmd {
            "HELLO" => Datagram::Hello {
                token: kv_str(&kv, "token"),
                actor: kv_str(&kv, "actor"),
            },
            "MOVE" => Datagram::Move {
                seq: kv_u32(&kv, "seq"),
                x: kv_f32(&kv, "x"),
                y: kv_f32(&kv, "y"),
            },
            _ => Datagram::Unknown,
        };
        Some(parsed)
    }
}

/// Marshals the token-relay line the gateway sends over the world link.
pub fn register_udp_token_line(token: &str, actor: &str, ttl_ms: u64) -> String {
    format!("GW_REGISTER_UDP_TOKEN token={token} actor={actor} ttl={ttl_ms}")
}

pub fn exit_user_line(actor: &str) -> String {
    format!("EXIT_USER id={actor}")
}
