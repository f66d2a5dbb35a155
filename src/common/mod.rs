//! Common utilities and types shared across tpckv

pub mod config;
pub mod crypt;
pub mod error;
pub mod executor;
pub mod hash;
pub mod message;
pub mod metrics;
pub mod utils;

pub use config::{ClientConfig, Config, CoordinatorConfig, NodeRole, ReplicaConfig, WalSyncPolicy};
pub use crypt::ValueCipher;
pub use error::{Error, Result};
pub use executor::TaskExecutor;
pub use hash::ring_hash;
pub use message::{Message, MessageType, OpKind};
pub use metrics::{CoordinatorMetrics, Counter, Gauge};
pub use utils::{crc32, display_key, parse_duration, retry_forever, retry_with_backoff};
