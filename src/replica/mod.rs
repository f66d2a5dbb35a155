//! Replica implementation
//!
//! A replica is a 2PC participant:
//! - Votes on ready requests after logging them
//! - Applies decisions after logging them
//! - Rebuilds its store from the participant log on start
//! - Serves reads of committed values

pub mod log;
pub mod participant;
pub mod server;
pub mod store;

pub use log::{LogEntry, LogPhase, ParticipantLog};
pub use participant::Participant;
pub use server::ReplicaServer;
pub use store::{KvStore, MemStore};
