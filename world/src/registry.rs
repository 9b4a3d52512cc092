//! Token and UDP session registry for the world server
//!
//! Tracks three things: outstanding one-time tokens minted by the gateway,
//! which UDP endpoint speaks for which actor, and the last accepted position
//! per actor. Pure state plus expiry logic; it owns no sockets and is only
//! ever driven from the world's state executor, so it needs no locking.

use log::{debug, info};
use shared::MOVE_SPEED_LIMIT;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Last accepted position and movement sequence for one actor.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ActorState {
    pub x: f32,
    pub y: f32,
    pub last_seq: u32,
}

#[derive(Debug)]
struct TokenRow {
    actor: String,
    expires: Instant,
}

/// Maps one-time tokens to pending actor bindings, bound endpoints to
/// actors, and actors to live movement state.
#[derive(Default)]
pub struct SessionRegistry {
    tokens: HashMap<String, TokenRow>,
    ep_to_actor: HashMap<SocketAddr, String>,
    actors: HashMap<String, ActorState>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites a token row expiring `ttl_ms` from now.
    pub fn register_token(&mut self, token: String, actor: String, ttl_ms: u64) {
        info!("REGISTER token={} actor={}", token, actor);
        self.tokens.insert(
            token,
            TokenRow {
                actor,
                expires: Instant::now() + Duration::from_millis(ttl_ms),
            },
        );
    }

    /// Redeems a token, binding `ep` to the actor it was minted for.
    ///
    /// Succeeds only for a matching, unexpired row for that exact actor; the
    /// row is consumed on success and also deleted when found expired.
    pub fn hello(&mut self, token: &str, actor: &str, ep: SocketAddr) -> bool {
        let row = match self.tokens.get(token) {
            Some(row) => row,
            None => return false,
        };
        if row.actor != actor {
            return false;
        }
        if row.expires < Instant::now() {
            self.tokens.remove(token);
            return false;
        }

        self.ep_to_actor.insert(ep, actor.to_string());
        self.actors.entry(actor.to_string()).or_default();
        self.tokens.remove(token);
        info!("Actor {} bound to {}", actor, ep);
        true
    }

    /// Applies a movement update from a bound endpoint.
    ///
    /// Out-of-order or duplicate sequences are dropped without mutation.
    /// For a fresh sequence, the position is stored only if the straight-line
    /// displacement stays under the speed clamp, but the sequence number
    /// advances either way to track liveness.
    pub fn on_move(&mut self, ep: SocketAddr, seq: u32, x: f32, y: f32) -> bool {
        let actor = match self.ep_to_actor.get(&ep) {
            Some(actor) => actor.clone(),
            None => return false,
        };

        let state = self.actors.entry(actor).or_default();
        if seq <= state.last_seq {
            return false;
        }
        state.last_seq = seq;

        let dx = x - state.x;
        let dy = y - state.y;
        if (dx * dx + dy * dy).sqrt() < MOVE_SPEED_LIMIT {
            state.x = x;
            state.y = y;
        }
        true
    }

    /// Purges movement state plus every token row and endpoint binding
    /// referencing the actor. The inverse of admission, run on disconnect.
    pub fn remove_actor(&mut self, actor: &str) {
        self.actors.remove(actor);
        self.tokens.retain(|_, row| row.actor != actor);
        self.ep_to_actor.retain(|_, bound| bound != actor);
        debug!("Removed actor {} from registry", actor);
    }

    /// Deletes every expired token row. Endpoint bindings never expire on
    /// their own; only `remove_actor` clears them.
    pub fn sweep(&mut self) {
        let now = Instant::now();
        self.tokens.retain(|_, row| row.expires > now);
    }

    /// Snapshot of all actor positions, taken each state tick.
    pub fn snapshot(&self) -> Vec<(String, ActorState)> {
        self.actors
            .iter()
            .map(|(actor, state)| (actor.clone(), *state))
            .collect()
    }

    /// Every bound UDP endpoint, the fan-out targets for the position
    /// broadcast.
    pub fn endpoints(&self) -> Vec<SocketAddr> {
        self.ep_to_actor.keys().copied().collect()
    }

    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }
}
