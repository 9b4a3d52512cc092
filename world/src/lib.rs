//! # World Server Library
//!
//! Authoritative backend for the card-matching game: room lifecycle, the
//! matching rules themselves, and real-time position sync over UDP.
//!
//! ## Architecture
//!
//! All shared state (rooms, control sessions, the token/session registry)
//! is owned by a single [`world::World`] instance mutated exclusively from
//! the state-executor loop in [`network`]. Network tasks never touch the
//! maps directly; they forward events over channels. A second, dedicated
//! task handles the per-tick UDP position fan-out so state snapshotting is
//! never blocked behind the sends.
//!
//! ## Modules
//!
//! - [`room`]: the per-match game state machine (deck, turns, scoring,
//!   READY/PLAYING/END phases).
//! - [`registry`]: one-time token table, UDP endpoint bindings and movement
//!   state with sequence and speed gating.
//! - [`world`]: the orchestrator owning all state, protocol dispatch and
//!   response/broadcast emission.
//! - [`network`]: sockets, per-connection read/write tasks and the two
//!   serialized executors.
//!
//! ## Admission flow
//!
//! The gateway relays `GW_REGISTER_UDP_TOKEN` over its persistent link; a
//! client then redeems the token with a UDP `HELLO`, which binds its
//! endpoint to the authenticated actor. Control commands ride a separate
//! TCP connection opened with `HELLO actor=<id>`.

pub mod network;
pub mod registry;
pub mod room;
pub mod world;
