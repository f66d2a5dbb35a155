//! Replica server

use crate::common::{retry_with_backoff, Error, Message, MessageType, ReplicaConfig, Result, TaskExecutor};
use crate::coordinator::placement::Node;
use crate::replica::participant::Participant;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

/// How long to wait for the coordinator to confirm a registration.
const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(15);
const REGISTRATION_ATTEMPTS: usize = 10;

pub struct ReplicaServer {
    config: ReplicaConfig,
}

impl ReplicaServer {
    pub fn new(config: ReplicaConfig) -> Self {
        Self { config }
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

    pub async fn serve_with_shutdown<S>(self, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        let config = self.config;
        tracing::info!("Starting replica: {}", config.node_id);
        tracing::info!("  Bind: {}", config.bind_addr);
        tracing::info!("  Coordinator: {}", config.coordinator_addr);
        tracing::info!("  Log path: {}", config.log_path.display());
        tracing::info!("  Log sync: {:?}", config.wal_sync);

        // The log is replayed in full before any traffic is accepted.
        let participant = Arc::new(Participant::open(
            config.node_id,
            &config.log_path,
            config.wal_sync,
            config.ready_wait,
        )?);

        let listener = TcpListener::bind(config.bind_addr).await?;
        let port = listener.local_addr()?.port();
        let me = Node::new(config.node_id, config.advertise_host.clone(), port);
        register_with_coordinator(&config.coordinator_addr, &me).await?;

        tracing::info!("✓ Replica ready");
        serve_participant(listener, participant, config.workers, shutdown).await
    }
}

/// Announce `me` to the coordinator, retrying while it is unreachable.
pub async fn register_with_coordinator(coordinator_addr: &str, me: &Node) -> Result<()> {
    let request = Message::register(me.to_string());
    let reply = retry_with_backoff(
        || request.exchange(coordinator_addr, REGISTRATION_TIMEOUT),
        REGISTRATION_ATTEMPTS,
        Duration::from_millis(100),
    )
    .await?;

    let confirmation = reply.message.unwrap_or_default();
    if reply.msg_type != MessageType::Resp || !confirmation.starts_with("Successfully registered") {
        return Err(Error::Validation(format!(
            "coordinator refused registration of {}: {}",
            me, confirmation
        )));
    }
    tracing::info!(coordinator = coordinator_addr, "{}", confirmation);
    Ok(())
}

/// Accept coordinator connections until `shutdown` resolves.
pub async fn serve_participant<S>(
    listener: TcpListener,
    participant: Arc<Participant>,
    workers: usize,
    shutdown: S,
) -> Result<()>
where
    S: Future<Output = ()>,
{
    let executor = TaskExecutor::new("participant", workers);
    let node = participant.node_id();
    tokio::select! {
        res = accept_loop(listener, participant, executor) => res,
        _ = shutdown => {
            tracing::info!(node, "Replica stopped");
            Ok(())
        }
    }
}

async fn accept_loop(listener: TcpListener, participant: Arc<Participant>, executor: TaskExecutor) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let participant = participant.clone();
        executor.execute(async move {
            if let Err(e) = handle_connection(stream, &participant).await {
                tracing::warn!(node = participant.node_id(), %peer, error = %e, "Dropped coordinator connection");
            }
        });
    }
}

async fn handle_connection(mut stream: TcpStream, participant: &Participant) -> Result<()> {
    let (mut reader, mut writer) = stream.split();
    let request = Message::receive(&mut reader).await?;
    let reply = participant.handle(&request).await?;
    reply.send(&mut writer).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::message::KEY_NOT_FOUND;
    use crate::common::{OpKind, WalSyncPolicy};
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_serves_coordinator_messages() {
        let dir = tempdir().unwrap();
        let participant = Arc::new(
            Participant::open(1, dir.path().join("p.log"), WalSyncPolicy::Always, Duration::from_millis(50)).unwrap(),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(serve_participant(listener, participant, 2, async move {
            let _ = stop_rx.await;
        }));

        let deadline = Duration::from_secs(2);
        let vote = Message::ready_request(1, OpKind::Put, b"k", Some(b"v"))
            .exchange(&addr, deadline)
            .await
            .unwrap();
        assert_eq!(vote, Message::ready(1));
        let ack = Message::decision(1, true).exchange(&addr, deadline).await.unwrap();
        assert_eq!(ack.msg_type, MessageType::Ack);

        let read = Message::get_request(b"k").exchange(&addr, deadline).await.unwrap();
        assert_eq!(read.decode_value().unwrap(), Some(b"v".to_vec()));
        let miss = Message::get_request(b"x").exchange(&addr, deadline).await.unwrap();
        assert_eq!(miss.message.as_deref(), Some(KEY_NOT_FOUND));

        // A protocol error closes the connection without a reply.
        let bad = Message::register("1@h:1").exchange(&addr, deadline).await;
        assert!(bad.is_err());

        stop_tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_registration_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let (mut r, mut w) = stream.split();
            Message::receive(&mut r).await.unwrap();
            Message::response("Registration Error: no").send(&mut w).await.unwrap();
        });
        let me = Node::new(1, "127.0.0.1", 7000);
        assert!(matches!(
            register_with_coordinator(&addr, &me).await,
            Err(Error::Validation(_))
        ));
    }
}
