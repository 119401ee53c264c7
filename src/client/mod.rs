//! The `client` module bundles one broker connection, the loaded `Settings`
//! and a shared publisher into a single handle.
//!
//! Exchange and dead-letter names always come from `Settings`, so a client
//! pointed at another exchange set only needs another configuration.

pub mod pubsub_client;
pub use pubsub_client::PubSubClient;
