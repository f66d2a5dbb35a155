//! Coordinator-to-replica RPC
//!
//! The coordinator talks to replicas through `ReplicaTransport` so the 2PC
//! engine can run over TCP in production and in-process in tests.

use crate::common::{Message, Result};
use crate::coordinator::placement::Node;
use async_trait::async_trait;
use std::time::Duration;

#[async_trait]
pub trait ReplicaTransport: Send + Sync {
    /// Send `request` to `node` and return its reply. Must give up with
    /// `Error::Timeout` once `deadline` has passed and report connection
    /// failures as `Error::Network`.
    async fn call(&self, node: &Node, request: &Message, deadline: Duration) -> Result<Message>;
}

/// One TCP connection per request, closed after the reply.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ReplicaTransport for TcpTransport {
    async fn call(&self, node: &Node, request: &Message, deadline: Duration) -> Result<Message> {
        tracing::debug!(node = node.id, msg_type = %request.msg_type, op_id = ?request.op_id, "Sending to replica");
        let reply = request.exchange(&node.addr(), deadline).await?;
        tracing::debug!(node = node.id, msg_type = %reply.msg_type, op_id = ?reply.op_id, "Replica replied");
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Error;

    #[tokio::test]
    async fn test_unreachable_replica_is_network_error() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let node = Node::new(1, "127.0.0.1", port);
        let result = TcpTransport::new()
            .call(&node, &Message::ready(1), Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(Error::Network(_))));
    }
}
