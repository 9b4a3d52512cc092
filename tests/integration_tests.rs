//! Integration tests for the gateway and world servers
//!
//! These tests run real servers on ephemeral ports and drive them over
//! actual TCP and UDP sockets, validating the wire protocol end to end.

use gateway::link::WorldLink;
use gateway::session::{GatewayServer, WorldInfo};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use world::network::WorldServer;

const RECV_TIMEOUT: Duration = Duration::from_secs(3);

/// Starts a world server on ephemeral ports with a fast tick.
async fn spawn_world() -> (SocketAddr, SocketAddr) {
    let server = WorldServer::new("127.0.0.1:0", "127.0.0.1:0", Duration::from_millis(50))
        .await
        .expect("failed to start world server");
    let tcp = server.tcp_local_addr().unwrap();
    let udp = server.udp_local_addr().unwrap();
    tokio::spawn(server.run());
    (tcp, udp)
}

/// Line-oriented TCP test client.
struct LineClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    write_half: OwnedWriteHalf,
}

impl LineClient {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect failed");
        let (read_half, write_half) = stream.into_split();
        LineClient {
            lines: BufReader::new(read_half).lines(),
            write_half,
        }
    }

    async fn send(&mut self, line: &str) {
        let framed = format!("{line}\n");
        self.write_half
            .write_all(framed.as_bytes())
            .await
            .expect("write failed");
    }

    async fn recv(&mut self) -> String {
        timeout(RECV_TIMEOUT, self.lines.next_line())
            .await
            .expect("timed out waiting for line")
            .expect("read failed")
            .expect("connection closed")
    }

    /// Reads lines until one starts with `prefix`, skipping heartbeats and
    /// unrelated broadcasts.
    async fn recv_until(&mut self, prefix: &str) -> String {
        loop {
            let line = self.recv().await;
            if line.starts_with(prefix) {
                return line;
            }
        }
    }
}

/// Extracts the value of `key=` from a protocol line.
fn field(line: &str, key: &str) -> String {
    let marker = format!("{key}=");
    line.split_whitespace()
        .find_map(|tok| tok.strip_prefix(&marker))
        .unwrap_or_else(|| panic!("missing {key} in: {line}"))
        .to_string()
}

/// WORLD SERVER TESTS
mod world_tests {
    use super::*;

    /// Full two-player match setup: create, enter, ready, start, flip.
    #[tokio::test]
    async fn room_lifecycle_end_to_end() {
        let (tcp, _udp) = spawn_world().await;

        let mut alice = LineClient::connect(tcp).await;
        alice.send("HELLO actor=alice").await;
        assert_eq!(alice.recv_until("HELLO_OK").await, "HELLO_OK actor=alice");

        let mut bob = LineClient::connect(tcp).await;
        bob.send("HELLO actor=bob").await;
        bob.recv_until("HELLO_OK").await;

        alice.send("REQ_CREATE_ROOM title=T rows=4 cols=4").await;
        let res = alice.recv_until("RES_CREATE_ROOM").await;
        let room_id = field(&res, "roomId");
        assert_eq!(room_id, "r000001");
        assert_eq!(field(&res, "master"), "alice");

        bob.send(&format!("REQ_ENTER_ROOM roomId={room_id}")).await;
        let cast = alice.recv_until("CAST_ENTER_ROOM").await;
        assert_eq!(field(&cast, "challenger"), "bob");
        bob.recv_until("CAST_ENTER_ROOM").await;

        alice
            .send(&format!("REQ_CHANGE_READY roomId={room_id} isReady=True"))
            .await;
        let cast = bob.recv_until("CAST_CHANGE_READY").await;
        assert_eq!(field(&cast, "isReady"), "True");

        bob.send(&format!("REQ_GAME_START roomId={room_id}")).await;
        let start = alice.recv_until("CAST_GAME_START").await;
        let cards: Vec<i32> = field(&start, "cards")
            .split(',')
            .map(|c| c.parse().unwrap())
            .collect();
        assert_eq!(cards.len(), 16);
        bob.recv_until("CAST_GAME_START").await;

        // Both acknowledge the initial peek; the completing call reveals
        // whose turn it is.
        alice
            .send(&format!("REQ_FIRST_FLIP_END roomId={room_id} actor=alice"))
            .await;
        bob.send(&format!("REQ_FIRST_FLIP_END roomId={room_id} actor=bob"))
            .await;
        let peek = alice.recv_until("CAST_FIRST_FLIP_END").await;
        let turn = field(&peek, "turn");
        assert!(turn == "alice" || turn == "bob");

        // The turn holder flips a mismatching pair: turn passes, no score.
        let second = cards.iter().position(|&v| v != cards[0]).unwrap();
        alice
            .send(&format!("REQ_FLIP roomId={room_id} actor={turn} index=0"))
            .await;
        alice
            .send(&format!(
                "REQ_FLIP roomId={room_id} actor={turn} index={second}"
            ))
            .await;

        let result = bob.recv_until("CAST_FLIP_RESULT").await;
        assert_eq!(field(&result, "masterScore"), "0");
        assert_eq!(field(&result, "challengerScore"), "0");
        assert_ne!(field(&result, "turn"), turn);
    }

    #[tokio::test]
    async fn enter_unknown_room_is_an_error() {
        let (tcp, _udp) = spawn_world().await;

        let mut client = LineClient::connect(tcp).await;
        client.send("HELLO actor=alice").await;
        client.recv_until("HELLO_OK").await;

        client.send("REQ_ENTER_ROOM roomId=r999999").await;
        let err = client.recv_until("ERR").await;
        assert_eq!(err, "ERR code=ROOM_NOT_FOUND roomId=r999999");
    }

    #[tokio::test]
    async fn unknown_command_is_answered_not_fatal() {
        let (tcp, _udp) = spawn_world().await;

        let mut client = LineClient::connect(tcp).await;
        client.send("BOGUS a=b").await;
        assert_eq!(client.recv_until("ERR").await, "ERR code=UNKNOWN");

        // Connection survives the protocol error.
        client.send("HELLO actor=alice").await;
        assert_eq!(client.recv_until("HELLO_OK").await, "HELLO_OK actor=alice");
    }

    #[tokio::test]
    async fn heartbeat_reaches_control_sessions() {
        let (tcp, _udp) = spawn_world().await;

        let mut client = LineClient::connect(tcp).await;
        client.send("HELLO actor=alice").await;
        client.recv_until("HELLO_OK").await;
        client.recv_until("BROADCAST_HEART_BEAT").await;
    }

    /// Dropping a control connection runs the full exit cascade.
    #[tokio::test]
    async fn disconnect_cascades_to_room_and_gateway() {
        let (tcp, _udp) = spawn_world().await;

        // A link-style gateway session, remembered via token registration.
        let mut gw = LineClient::connect(tcp).await;
        gw.send("GW_REGISTER_UDP_TOKEN token=TOK actor=bob ttl=60000")
            .await;
        assert_eq!(gw.recv().await, "OK");

        let mut alice = LineClient::connect(tcp).await;
        alice.send("HELLO actor=alice").await;
        alice.recv_until("HELLO_OK").await;
        let mut bob = LineClient::connect(tcp).await;
        bob.send("HELLO actor=bob").await;
        bob.recv_until("HELLO_OK").await;

        alice.send("REQ_CREATE_ROOM title=T rows=4 cols=4").await;
        alice.recv_until("RES_CREATE_ROOM").await;
        bob.send("REQ_ENTER_ROOM roomId=r000001").await;
        bob.recv_until("CAST_ENTER_ROOM").await;

        drop(bob);

        let cast = alice.recv_until("CAST_EXIT_ROOM").await;
        assert_eq!(field(&cast, "exitActor"), "bob");
        alice.recv_until("BROADCAST_EXIT_ROOM").await;
        let exit = alice.recv_until("BROADCAST_EXIT_SERVER").await;
        assert_eq!(field(&exit, "actor"), "bob");

        // The upstream gateway is told to drop its cache entry.
        assert_eq!(gw.recv_until("EXIT_USER").await, "EXIT_USER id=bob");
    }
}

/// UDP SESSION TESTS
mod udp_tests {
    use super::*;

    /// Registers a token over TCP, redeems it over UDP, and watches the
    /// position broadcast reflect an accepted move.
    #[tokio::test]
    async fn token_handshake_and_position_broadcast() {
        let (tcp, udp) = spawn_world().await;

        let mut gw = LineClient::connect(tcp).await;
        gw.send("GW_REGISTER_UDP_TOKEN token=TOK123 actor=alice ttl=60000")
            .await;
        assert_eq!(gw.recv().await, "OK");

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket
            .send_to(b"HELLO token=TOK123 actor=alice", udp)
            .await
            .unwrap();
        socket
            .send_to(b"MOVE seq=1 x=1.5 y=2.5", udp)
            .await
            .unwrap();

        let mut buf = [0u8; 2048];
        let expected = "ACTOR_POS id=alice x=1.5 y=2.5";
        loop {
            let (len, _) = timeout(RECV_TIMEOUT, socket.recv_from(&mut buf))
                .await
                .expect("no position broadcast")
                .unwrap();
            let payload = String::from_utf8_lossy(&buf[..len]).into_owned();
            if payload.lines().any(|l| l == expected) {
                break;
            }
        }
    }

    /// A consumed token cannot bind a second endpoint.
    #[tokio::test]
    async fn token_redeems_exactly_once() {
        let (tcp, udp) = spawn_world().await;

        let mut gw = LineClient::connect(tcp).await;
        gw.send("GW_REGISTER_UDP_TOKEN token=ONESHOT actor=alice ttl=60000")
            .await;
        assert_eq!(gw.recv().await, "OK");

        let first = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        first
            .send_to(b"HELLO token=ONESHOT actor=alice", udp)
            .await
            .unwrap();

        // Wait until the first endpoint is bound (broadcast arrives).
        let mut buf = [0u8; 2048];
        timeout(RECV_TIMEOUT, first.recv_from(&mut buf))
            .await
            .expect("first endpoint never bound")
            .unwrap();

        let second = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        second
            .send_to(b"HELLO token=ONESHOT actor=alice", udp)
            .await
            .unwrap();

        // The second endpoint stays unbound: no broadcast within a few ticks.
        let silent = timeout(Duration::from_millis(400), second.recv_from(&mut buf)).await;
        assert!(silent.is_err(), "consumed token bound a second endpoint");
    }
}

/// GATEWAY TESTS
mod gateway_tests {
    use super::*;

    async fn spawn_gateway(world_tcp: SocketAddr, world_udp: SocketAddr) -> SocketAddr {
        let mut worlds = HashMap::new();
        worlds.insert(
            1,
            WorldInfo {
                id: 1,
                name: "Test1".to_string(),
                udp_host: world_udp.ip().to_string(),
                udp_port: world_udp.port(),
                link: WorldLink::start(world_tcp.ip().to_string(), world_tcp.port()),
            },
        );

        let server = GatewayServer::new("127.0.0.1:0", Arc::new(worlds))
            .await
            .expect("failed to start gateway");
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());
        addr
    }

    /// Login, pick a world, redeem the minted token directly at the world.
    #[tokio::test]
    async fn login_enter_world_and_redeem_token() {
        let (world_tcp, world_udp) = spawn_world().await;
        let gateway_addr = spawn_gateway(world_tcp, world_udp).await;

        let mut client = LineClient::connect(gateway_addr).await;
        client.send("LOGIN id=alice").await;
        let login = client.recv().await;
        assert!(login.starts_with("LOGIN_OK token="));
        assert_eq!(field(&login, "worldCount"), "1");
        let world_line = client.recv().await;
        assert_eq!(field(&world_line, "id"), "1");
        assert_eq!(field(&world_line, "name"), "Test1");

        client.send("ENTER_WORLD world=1 actor=alice").await;
        let enter = client.recv().await;
        assert!(enter.starts_with("ENTER_OK"));
        let token = field(&enter, "udp_token");
        let udp_addr: SocketAddr = format!(
            "{}:{}",
            field(&enter, "udp_host"),
            field(&enter, "udp_port")
        )
        .parse()
        .unwrap();

        // Give the link a moment to relay the registration to the world.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket
            .send_to(format!("HELLO token={token} actor=alice").as_bytes(), udp_addr)
            .await
            .unwrap();

        let mut buf = [0u8; 2048];
        let (len, _) = timeout(RECV_TIMEOUT, socket.recv_from(&mut buf))
            .await
            .expect("token was not honored by the world")
            .unwrap();
        let payload = String::from_utf8_lossy(&buf[..len]).into_owned();
        assert!(payload.contains("ACTOR_POS id=alice"));
    }

    #[tokio::test]
    async fn duplicate_world_entry_is_rejected() {
        let (world_tcp, world_udp) = spawn_world().await;
        let gateway_addr = spawn_gateway(world_tcp, world_udp).await;

        let mut client = LineClient::connect(gateway_addr).await;
        client.send("ENTER_WORLD world=1 actor=alice").await;
        assert!(client.recv().await.starts_with("ENTER_OK"));

        client.send("ENTER_WORLD world=1 actor=alice").await;
        assert_eq!(client.recv().await, "ERR_ID_EXSIT");
    }
}
