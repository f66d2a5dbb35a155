//! Replica placement on a consistent-hash ring
//!
//! Each key maps to an ordered pair of replicas: the primary is the ring's
//! ceiling of `ring_hash(key)` and the secondary is the next node clockwise.
//! Both lookups wrap to the smallest id. The ring is filled during bootstrap
//! and only read afterwards.

use crate::common::{ring_hash, Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::RwLock;
use tokio::sync::watch;

/// A registered replica.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    pub id: u64,
    pub host: String,
    pub port: u16,
}

impl Node {
    pub fn new(id: u64, host: impl Into<String>, port: u16) -> Self {
        Self {
            id,
            host: host.into(),
            port,
        }
    }

    /// `host:port` for dialing.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Registration form: `<nodeID>@<host>:<port>`.
impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.id, self.host, self.port)
    }
}

impl FromStr for Node {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || Error::Validation(format!("Registration Error: unparseable node {:?}", s));

        let (id, rest) = s.split_once('@').ok_or_else(bad)?;
        let (host, port) = rest.rsplit_once(':').ok_or_else(bad)?;
        if host.is_empty() {
            return Err(bad());
        }

        let id = match id.strip_prefix("0x").or_else(|| id.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => id.parse::<u64>(),
        }
        .map_err(|_| bad())?;
        let port = port.parse::<u16>().map_err(|_| bad())?;

        Ok(Node::new(id, host, port))
    }
}

/// Consistent-hash ring of replicas.
pub struct ReplicaRing {
    nodes: RwLock<BTreeMap<u64, Node>>,
    size_tx: watch::Sender<usize>,
}

impl Default for ReplicaRing {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicaRing {
    pub fn new() -> Self {
        let (size_tx, _) = watch::channel(0);
        Self {
            nodes: RwLock::new(BTreeMap::new()),
            size_tx,
        }
    }

    /// Insert a node. Meant for bootstrap, before client traffic is admitted.
    /// Re-registering an id replaces its address.
    pub fn register(&self, node: Node) -> Result<()> {
        let size = {
            let mut nodes = self
                .nodes
                .write()
                .map_err(|_| Error::Internal("ring lock poisoned".into()))?;
            if let Some(previous) = nodes.insert(node.id, node.clone()) {
                tracing::warn!(id = node.id, old = %previous.addr(), new = %node.addr(), "Replica re-registered");
            }
            nodes.len()
        };
        tracing::info!(id = node.id, addr = %node.addr(), size, "Replica registered");
        self.size_tx.send_replace(size);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.nodes.read().map(|n| n.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve once at least `expected` nodes have registered.
    pub async fn wait_for(&self, expected: usize) {
        let mut rx = self.size_tx.subscribe();
        // The sender lives as long as the ring, so this only ends on success.
        let _ = rx.wait_for(|size| *size >= expected).await;
    }

    /// Primary replica for `key`.
    pub fn primary(&self, key: &[u8]) -> Result<Node> {
        self.primary_for_hash(ring_hash(key))
    }

    /// Node owning ring position `hash`: smallest id >= hash, wrapping.
    pub fn primary_for_hash(&self, hash: u64) -> Result<Node> {
        let nodes = self
            .nodes
            .read()
            .map_err(|_| Error::Internal("ring lock poisoned".into()))?;
        Self::ceiling(&nodes, Some(hash)).ok_or(Error::NoNodes)
    }

    /// Successor of `primary`: smallest id > primary.id, wrapping.
    /// With a single node this is the primary itself.
    pub fn secondary(&self, primary: &Node) -> Result<Node> {
        let nodes = self
            .nodes
            .read()
            .map_err(|_| Error::Internal("ring lock poisoned".into()))?;
        Self::ceiling(&nodes, primary.id.checked_add(1)).ok_or(Error::NoNodes)
    }

    /// Both replicas for `key`, in (primary, secondary) order.
    pub fn replicas(&self, key: &[u8]) -> Result<(Node, Node)> {
        let primary = self.primary(key)?;
        let secondary = self.secondary(&primary)?;
        Ok((primary, secondary))
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.nodes
            .read()
            .map(|n| n.values().cloned().collect())
            .unwrap_or_default()
    }

    /// `from == None` means the search start overflowed past `u64::MAX`.
    fn ceiling(nodes: &BTreeMap<u64, Node>, from: Option<u64>) -> Option<Node> {
        from.and_then(|from| nodes.range(from..).next())
            .or_else(|| nodes.iter().next())
            .map(|(_, node)| node.clone())
    }
}
