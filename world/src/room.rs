//! Card-matching game state machine, one instance per active match.

use log::{debug, info};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::{HashMap, HashSet};

/// Position of a room in its game lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Ready,
    Playing,
    End,
}

impl Phase {
    /// Numeric form used on the wire (0=READY, 1=PLAYING, 2=END).
    pub fn wire(self) -> i32 {
        match self {
            Phase::Ready => 0,
            Phase::Playing => 1,
            Phase::End => 2,
        }
    }
}

/// The board: card values plus a parallel revealed flag per cell.
#[derive(Debug, Clone, Default)]
pub struct Deck {
    pub cards: Vec<i32>,
    pub revealed: Vec<bool>,
}

/// One pending or in-progress match between at most two actors.
///
/// The creator is the master; the second joiner is the challenger. Score and
/// the initial-peek acknowledgment are tracked in separate maps so the score
/// field never doubles as a readiness sentinel.
#[derive(Debug, Clone)]
pub struct Room {
    pub room_id: String,
    pub master: String,
    pub challenger: String,
    pub title: String,
    pub rows: i32,
    pub cols: i32,
    pub members: HashSet<String>,
    pub is_ready: bool,
    pub deck: Deck,
    pub first_index: Option<usize>,
    pub turn: String,
    pub score: HashMap<String, u32>,
    pub peek_acked: HashMap<String, bool>,
    pub phase: Phase,
}

impl Room {
    pub fn new(room_id: String, master: String, title: String, rows: i32, cols: i32) -> Self {
        let mut members = HashSet::new();
        members.insert(master.clone());

        Self {
            room_id,
            master,
            challenger: String::new(),
            title,
            rows,
            cols,
            members,
            is_ready: false,
            deck: Deck::default(),
            first_index: None,
            turn: String::new(),
            score: HashMap::new(),
            peek_acked: HashMap::new(),
            phase: Phase::Ready,
        }
    }

    /// Builds a shuffled deck of `rows*cols` cards with every value in
    /// `[0, rows*cols/2)` appearing exactly twice. Fails on odd or
    /// non-positive cell counts.
    fn create_deck(&mut self, seed: u64) -> bool {
        let n = self.rows * self.cols;
        if n <= 0 || n % 2 != 0 {
            return false;
        }
        let n = n as usize;

        let mut cards = Vec::with_capacity(n);
        for v in 0..(n as i32 / 2) {
            cards.push(v);
            cards.push(v);
        }

        let mut rng = StdRng::seed_from_u64(seed);
        cards.shuffle(&mut rng);

        self.deck = Deck {
            cards,
            revealed: vec![false; n],
        };
        true
    }

    /// Transitions READY -> PLAYING: builds the deck, picks the starting
    /// turn and resets per-member score and peek tracking.
    ///
    /// The seed is the caller's clock at scheduling time; tests inject a
    /// fixed value for a deterministic card order.
    pub fn start_game(&mut self, seed: u64) -> bool {
        if self.members.len() < 2 {
            return false;
        }
        if !self.create_deck(seed) {
            return false;
        }

        self.turn = if seed % 2 == 0 {
            self.challenger.clone()
        } else {
            self.master.clone()
        };

        self.score.clear();
        self.peek_acked.clear();
        for member in &self.members {
            self.score.insert(member.clone(), 0);
            self.peek_acked.insert(member.clone(), false);
        }

        self.first_index = None;
        self.phase = Phase::Playing;
        info!("Room {} started, {} goes first", self.room_id, self.turn);
        true
    }

    /// Applies one card-flip attempt.
    ///
    /// Rejected without mutation unless the game is live, the caller holds
    /// the turn, and the index is a valid, distinct second card. The first
    /// flip of a pair only records the index; the second resolves it:
    /// a match reveals both cards and scores the turn holder (who keeps the
    /// turn), a miss passes the turn. Full reveal ends the game.
    pub fn card_flip(&mut self, actor: &str, index: i32) -> bool {
        if self.phase != Phase::Playing {
            return false;
        }
        if actor != self.turn {
            return false;
        }
        if index < 0 || index as usize >= self.deck.cards.len() {
            return false;
        }
        let index = index as usize;
        if self.first_index == Some(index) {
            return false;
        }

        let first = match self.first_index {
            None => {
                self.first_index = Some(index);
                return true;
            }
            Some(first) => first,
        };

        if self.deck.cards[first] == self.deck.cards[index] {
            self.deck.revealed[first] = true;
            self.deck.revealed[index] = true;
            if let Some(score) = self.score.get_mut(&self.turn) {
                *score += 1;
            }
        } else {
            self.turn = if self.turn == self.master {
                self.challenger.clone()
            } else {
                self.master.clone()
            };
        }
        self.first_index = None;

        if self.deck.revealed.iter().all(|&r| r) {
            self.phase = Phase::End;
            info!("Room {} board complete", self.room_id);
        }
        true
    }

    /// Readiness gate after the initial full-board reveal animation.
    ///
    /// The first call from each tracked actor flips its flag; the return is
    /// true only on the call that completes the set. Repeat calls from an
    /// already-acknowledged actor and calls from untracked actors return
    /// false.
    pub fn peek_end(&mut self, actor: &str) -> bool {
        match self.peek_acked.get_mut(actor) {
            None => {
                debug!("Room {}: {} peek_end without a seat", self.room_id, actor);
                false
            }
            Some(acked) if *acked => false,
            Some(acked) => {
                *acked = true;
                self.peek_acked.values().all(|&a| a)
            }
        }
    }

    /// Winner by score, or "-" on a tie. Only meaningful once phase is END.
    pub fn winner(&self) -> String {
        let master = self.score.get(&self.master).copied().unwrap_or(0);
        let challenger = self.score.get(&self.challenger).copied().unwrap_or(0);
        if master == challenger {
            "-".to_string()
        } else if master > challenger {
            self.master.clone()
        } else {
            self.challenger.clone()
        }
    }

    pub fn score_of(&self, actor: &str) -> u32 {
        self.score.get(actor).copied().unwrap_or(0)
    }
}
