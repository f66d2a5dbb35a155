//! Coordinator server
//!
//! Two listeners: replicas announce themselves on the registration endpoint,
//! clients send `getreq`/`putreq`/`delreq` to the client endpoint. The client
//! endpoint opens only after the expected number of replicas has registered.

use crate::common::message::{MAX_CLIENT_FRAME_SIZE, OVERSIZED_VALUE, SUCCESS};
use crate::common::{CoordinatorConfig, Error, Message, MessageType, Result, TaskExecutor};
use crate::coordinator::placement::{Node, ReplicaRing};
use crate::coordinator::tpc::Coordinator;
use crate::coordinator::transport::ReplicaTransport;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};

pub struct CoordinatorServer {
    config: CoordinatorConfig,
    node_id: String,
}

impl CoordinatorServer {
    pub fn new(config: CoordinatorConfig, node_id: String) -> Self {
        Self { config, node_id }
    }

    /// Run until Ctrl-C.
    pub async fn serve(self) -> Result<()> {
        let shutdown = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
        };
        self.serve_with_shutdown(shutdown).await
    }

    /// Run until `shutdown` resolves.
    pub async fn serve_with_shutdown<S>(self, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        tracing::info!("Starting coordinator: {}", self.node_id);
        tracing::info!("  Client API: {}", self.config.bind_addr);
        tracing::info!("  Registration: {}", self.config.registration_addr);
        tracing::info!("  Expected replicas: {}", self.config.expected_replicas);
        tracing::info!("  Cache capacity: {}", self.config.cache_capacity);

        let registration = TcpListener::bind(self.config.registration_addr).await?;
        let clients = TcpListener::bind(self.config.bind_addr).await?;
        let ring = Arc::new(ReplicaRing::new());
        let coordinator = Arc::new(Coordinator::new(self.config.clone(), ring.clone()));

        serve_listeners(registration, clients, coordinator, shutdown).await
    }
}

/// Drive both accept loops on already-bound listeners until `shutdown` resolves.
pub async fn serve_listeners<T, S>(
    registration: TcpListener,
    clients: TcpListener,
    coordinator: Arc<Coordinator<T>>,
    shutdown: S,
) -> Result<()>
where
    T: ReplicaTransport + 'static,
    S: Future<Output = ()>,
{
    let config = coordinator.config().clone();
    let ring = coordinator.ring().clone();

    let registrations = registration_loop(
        registration,
        ring.clone(),
        TaskExecutor::new("registration", config.registration_workers),
    );
    let requests = async {
        ring.wait_for(config.expected_replicas).await;
        tracing::info!(replicas = ring.len(), "Ring complete, accepting client requests");
        client_loop(
            clients,
            coordinator.clone(),
            TaskExecutor::new("client", config.workers),
        )
        .await
    };

    tracing::info!("✓ Coordinator ready");

    let result = tokio::select! {
        res = registrations => res,
        res = requests => res,
        _ = shutdown => {
            tracing::info!("Shutdown signal received");
            Ok(())
        }
    };

    let snapshot = coordinator.metrics().snapshot();
    match serde_json::to_string(&snapshot) {
        Ok(json) => tracing::info!(metrics = %json, "Coordinator stopped"),
        Err(_) => tracing::info!(?snapshot, "Coordinator stopped"),
    }
    result
}

async fn registration_loop(listener: TcpListener, ring: Arc<ReplicaRing>, executor: TaskExecutor) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let ring = ring.clone();
        executor.execute(async move {
            if let Err(e) = handle_registration(stream, &ring).await {
                tracing::warn!(%peer, error = %e, "Registration failed");
            }
        });
    }
}

async fn handle_registration(mut stream: TcpStream, ring: &ReplicaRing) -> Result<()> {
    let (mut reader, mut writer) = stream.split();
    let request = Message::receive(&mut reader).await?;
    if request.msg_type != MessageType::Register {
        return Err(Error::Protocol(format!(
            "expected register on the registration endpoint, got {}",
            request.msg_type
        )));
    }

    let reply = match register(ring, &request) {
        Ok(node) => Message::response(format!("Successfully registered{}", node)),
        Err(e) => Message::response(e.wire_message()),
    };
    reply.send(&mut writer).await
}

fn register(ring: &ReplicaRing, request: &Message) -> Result<Node> {
    let registration = request
        .message
        .as_deref()
        .ok_or_else(|| Error::Validation("Registration Error: empty registration".into()))?;
    let node: Node = registration.parse()?;
    ring.register(node.clone())?;
    Ok(node)
}

async fn client_loop<T>(listener: TcpListener, coordinator: Arc<Coordinator<T>>, executor: TaskExecutor) -> Result<()>
where
    T: ReplicaTransport + 'static,
{
    loop {
        let (stream, peer) = listener.accept().await?;
        let coordinator = coordinator.clone();
        executor.execute(async move {
            if let Err(e) = handle_client(stream, peer, &coordinator).await {
                tracing::warn!(%peer, error = %e, "Dropped client connection");
            }
        });
    }
}

async fn handle_client<T: ReplicaTransport>(
    mut stream: TcpStream,
    peer: SocketAddr,
    coordinator: &Coordinator<T>,
) -> Result<()> {
    let (mut reader, mut writer) = stream.split();
    let request = match Message::receive_within(&mut reader, MAX_CLIENT_FRAME_SIZE).await {
        Ok(request) => request,
        Err(Error::FrameTooLarge(limit)) => {
            // Only a value can push a request this far; refuse it like a replica would.
            tracing::warn!(%peer, limit, "Client request over the frame limit");
            tokio::io::copy(&mut reader, &mut tokio::io::sink()).await?;
            return Message::response(OVERSIZED_VALUE).send(&mut writer).await;
        }
        Err(e) => return Err(e),
    };
    tracing::debug!(%peer, msg_type = %request.msg_type, "Client request");

    let reply = dispatch(coordinator, &request).await?;
    reply.send(&mut writer).await
}

/// Map one client request to its reply. Unexpected types are protocol errors
/// and close the connection without a reply.
pub async fn dispatch<T: ReplicaTransport>(coordinator: &Coordinator<T>, request: &Message) -> Result<Message> {
    let reply = match request.msg_type {
        MessageType::GetReq => {
            let key = request.decode_key()?;
            match coordinator.get(&key).await {
                Ok(value) => Message::value_response(&key, &value),
                Err(e) => Message::response(e.wire_message()),
            }
        }
        MessageType::PutReq => {
            let key = request.decode_key()?;
            let value = request
                .decode_value()?
                .ok_or_else(|| Error::Protocol("putreq without value".into()))?;
            match coordinator.put(&key, &value).await {
                Ok(existed) => Message::response(SUCCESS).with_status(existed),
                Err(e) => Message::response(e.wire_message()),
            }
        }
        MessageType::DelReq => {
            let key = request.decode_key()?;
            match coordinator.delete(&key).await {
                Ok(()) => Message::response(SUCCESS),
                Err(e) => Message::response(e.wire_message()),
            }
        }
        other => {
            return Err(Error::Protocol(format!(
                "unexpected {} on the client endpoint",
                other
            )))
        }
    };
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::transport::TcpTransport;

    #[test]
    fn test_register_parses_and_inserts() {
        let ring = ReplicaRing::new();
        let node = register(&ring, &Message::register("7@localhost:7001")).unwrap();
        assert_eq!(node, Node::new(7, "localhost", 7001));
        assert_eq!(ring.len(), 1);
    }

    #[test]
    fn test_register_rejects_garbage() {
        let ring = ReplicaRing::new();
        let err = register(&ring, &Message::register("localhost")).unwrap_err();
        assert!(err.wire_message().starts_with("Registration Error"));
        assert!(register(&ring, &Message::new(MessageType::Register)).is_err());
        assert!(ring.is_empty());
    }

    #[tokio::test]
    async fn test_registration_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let ring = Arc::new(ReplicaRing::new());
        tokio::spawn(registration_loop(
            listener,
            ring.clone(),
            TaskExecutor::new("registration", 1),
        ));

        let reply = Message::register("0x10@127.0.0.1:7001")
            .exchange(&addr, std::time::Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(reply.msg_type, MessageType::Resp);
        assert_eq!(reply.message.as_deref(), Some("Successfully registered16@127.0.0.1:7001"));
        assert_eq!(ring.nodes(), vec![Node::new(16, "127.0.0.1", 7001)]);
    }

    #[tokio::test]
    async fn test_dispatch_rejects_unexpected_type() {
        let ring = Arc::new(ReplicaRing::new());
        let coordinator: Coordinator<TcpTransport> = Coordinator::new(CoordinatorConfig::default(), ring);
        let result = dispatch(&coordinator, &Message::ack(1)).await;
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn test_oversized_client_frame_gets_a_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let coordinator = Arc::new(Coordinator::new(
            CoordinatorConfig::default(),
            Arc::new(ReplicaRing::new()),
        ));
        tokio::spawn(client_loop(listener, coordinator, TaskExecutor::new("client", 1)));

        let value = vec![0u8; MAX_CLIENT_FRAME_SIZE as usize];
        let reply = Message::put_request(b"k", &value)
            .exchange(&addr, std::time::Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(reply.msg_type, MessageType::Resp);
        assert_eq!(reply.message.as_deref(), Some(OVERSIZED_VALUE));
    }
}
