//! Coordinator implementation
//!
//! The coordinator is responsible for:
//! - Replica placement (consistent-hash ring)
//! - Write orchestration (2PC with replicas)
//! - Per-key serialization of writes
//! - A bounded read cache in front of the replicas

pub mod cache;
pub mod locks;
pub mod placement;
pub mod server;
pub mod tpc;
pub mod transport;

pub use cache::ReadCache;
pub use placement::{Node, ReplicaRing};
pub use server::CoordinatorServer;
pub use tpc::Coordinator;
pub use transport::{ReplicaTransport, TcpTransport};
