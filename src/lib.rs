//! # tpckv
//!
//! A replicated key-value store with:
//! - Two-phase commit across the two replicas owning each key
//! - Consistent-hash placement of keys on replicas
//! - A participant log at every replica for crash recovery
//! - A bounded LRU read cache at the coordinator
//!
//! ## Architecture
//!
//! ```text
//!            clients
//!               │ getreq / putreq / delreq
//!       ┌───────▼────────┐
//!       │  Coordinator   │  ring + per-key locks + LRU cache
//!       └───┬────────┬───┘
//!   ready / │        │ commit / abort
//!     ┌─────▼───┐ ┌──▼──────┐
//!     │Replica 1│ │Replica 2│  ... primary and successor on the ring
//!     │  + log  │ │  + log  │
//!     └─────────┘ └─────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start a coordinator
//! ```bash
//! tpckv-coord serve \
//!   --bind 0.0.0.0:8080 \
//!   --registration 0.0.0.0:9090 \
//!   --replicas 2
//! ```
//!
//! ### Start replicas
//! ```bash
//! tpckv-replica serve \
//!   --id 1000 \
//!   --bind 0.0.0.0:7001 \
//!   --coordinator localhost:9090 \
//!   --log ./replica-1/participant.log
//! ```
//!
//! ### Use the CLI
//! ```bash
//! tpckv put my-key my-value --coordinator localhost:8080
//! tpckv get my-key
//! tpckv delete my-key
//! ```

#![allow(clippy::result_large_err)]

pub mod client;
pub mod common;
pub mod coordinator;
pub mod replica;

// Re-export commonly used types
pub use client::KvClient;
pub use common::{Config, Error, Result};
pub use coordinator::{Coordinator, CoordinatorServer};
pub use replica::ReplicaServer;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
