//! In-memory broker
//!
//! An exchange/queue broker that runs inside the process and implements the
//! `crate::transport` seam. Used to exercise the consumer loop, topology and
//! publisher without a RabbitMQ instance, and usable by embedders that want
//! the same pub/sub API in a single process.

pub mod connection;
pub mod engine;
pub mod message;
pub mod topic;

pub use connection::{MemoryBroker, MemoryChannel, MemoryConnection};
pub use engine::Broker;

#[cfg(test)]
mod tests;
