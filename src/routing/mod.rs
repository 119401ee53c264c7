//! Routing conventions
//!
//! Keys are dot-delimited `<category>.<identifier>`. Subscriptions that want
//! every identifier in a category bind with a single-segment wildcard
//! (`<category>.*`). Per-subscriber queues are named the same way so that a
//! restart with the same identifier lands on the same logical queue.

mod models;

pub use models::{GameLog, PlayingState};

/// Control signal key on the direct exchange.
pub const PAUSE_KEY: &str = "pause";
pub const ARMY_MOVES_PREFIX: &str = "army_moves";
pub const WAR_RECOGNITIONS_PREFIX: &str = "war";
pub const GAME_LOG_SLUG: &str = "game_logs";

/// `<prefix>.<identifier>`
pub fn routing_key(prefix: &str, identifier: &str) -> String {
    format!("{prefix}.{identifier}")
}

/// Binding pattern matching every identifier under `prefix`.
pub fn wildcard(prefix: &str) -> String {
    format!("{prefix}.*")
}

/// Deterministic queue name for one subscriber's `purpose` queue.
pub fn queue_name(purpose: &str, identifier: &str) -> String {
    routing_key(purpose, identifier)
}
