//! # Gateway Server Library
//!
//! Client entry point for the card-matching game backend. The gateway
//! authenticates logins, advertises the world directory, and brokers world
//! entry: it mints a one-time UDP token, registers it with the chosen world
//! over a persistent link, and hands the client the world's UDP coordinates
//! so it can be trusted there without re-authenticating.
//!
//! - [`link`]: the per-world outbound connection with its
//!   resolve/connect/reconnect state machine and FIFO relay queue.
//! - [`session`]: the accept loop and LOGIN / ENTER_WORLD handling.

pub mod link;
pub mod session;
