//! Two-phase commit orchestration
//!
//! Every write is a transaction against the key's two replicas:
//!   1. Vote: send a ready request to both replicas concurrently and wait for
//!      both outcomes. A timeout or network failure counts as an abort vote.
//!   2. Decide: commit iff both voted ready, then deliver the decision to both
//!      replicas, retrying until each has acknowledged it.
//!
//! Writes to one key are serialized by that key's lock, which is held until
//! both acks are in and the read cache reflects the outcome. A replica votes on
//! one operation at a time, so each transaction also holds its replicas' gates
//! from phase 1 until the last ack. The op id is drawn once all of them are
//! held, so every replica sees op ids in increasing order.

use crate::common::message::KEY_NOT_FOUND;
use crate::common::utils::timestamp_now_millis;
use crate::common::{
    display_key, retry_forever, CoordinatorConfig, CoordinatorMetrics, Error, Message,
    MessageType, OpKind, Result,
};
use crate::coordinator::cache::ReadCache;
use crate::coordinator::locks::{KeyLocks, ReplicaGates};
use crate::coordinator::placement::{Node, ReplicaRing};
use crate::coordinator::transport::{ReplicaTransport, TcpTransport};
use futures_util::future::join_all;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A phase-1 outcome from one replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Vote {
    Ready,
    Abort(String),
}

/// Final outcome of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Commit,
    Abort,
}

/// A write admitted under its key lock.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub op_id: u64,
    pub kind: OpKind,
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
    pub primary: Node,
    pub secondary: Node,
}

impl Transaction {
    /// Distinct replicas taking part. A one-node ring yields a single participant.
    pub fn participants(&self) -> Vec<&Node> {
        if self.primary == self.secondary {
            vec![&self.primary]
        } else {
            vec![&self.primary, &self.secondary]
        }
    }

    fn ready_request(&self) -> Message {
        Message::ready_request(self.op_id, self.kind, &self.key, self.value.as_deref())
    }
}

/// Tracks one in-flight transaction in the metrics gauge.
struct InflightGuard<'a>(&'a CoordinatorMetrics);

impl<'a> InflightGuard<'a> {
    fn new(metrics: &'a CoordinatorMetrics) -> Self {
        metrics.inflight_transactions.inc();
        Self(metrics)
    }
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.0.inflight_transactions.dec();
    }
}

/// Render one replica's failure as `@<id>=><reason>`.
fn replica_reason(node: &Node, reason: &str) -> String {
    format!("@{}=>{}", node.id, reason)
}

pub struct Coordinator<T: ReplicaTransport = TcpTransport> {
    config: CoordinatorConfig,
    ring: Arc<ReplicaRing>,
    cache: ReadCache,
    locks: KeyLocks,
    gates: ReplicaGates,
    next_op_id: AtomicU64,
    transport: Arc<T>,
    metrics: Arc<CoordinatorMetrics>,
}

impl Coordinator<TcpTransport> {
    /// Coordinator talking to replicas over TCP.
    pub fn new(config: CoordinatorConfig, ring: Arc<ReplicaRing>) -> Self {
        Self::with_transport(config, ring, Arc::new(TcpTransport::new()))
    }
}

impl<T: ReplicaTransport> Coordinator<T> {
    pub fn with_transport(config: CoordinatorConfig, ring: Arc<ReplicaRing>, transport: Arc<T>) -> Self {
        let cache = ReadCache::new(config.cache_capacity);
        // Seeded from the clock so ids keep increasing across coordinator restarts.
        let first_op_id = timestamp_now_millis() << 20;
        Self {
            config,
            ring,
            cache,
            locks: KeyLocks::new(),
            gates: ReplicaGates::new(),
            next_op_id: AtomicU64::new(first_op_id.max(1)),
            transport,
            metrics: Arc::new(CoordinatorMetrics::new()),
        }
    }

    pub fn ring(&self) -> &Arc<ReplicaRing> {
        &self.ring
    }

    pub fn cache(&self) -> &ReadCache {
        &self.cache
    }

    pub fn metrics(&self) -> &Arc<CoordinatorMetrics> {
        &self.metrics
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Store `value` under `key` on both replicas.
    /// Returns whether the key already existed.
    pub async fn put(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        let acks = self.run(OpKind::Put, key, Some(value.to_vec())).await?;
        Ok(acks.into_iter().any(|existed| existed))
    }

    /// Remove `key` from both replicas. Fails with `NotFound` when every
    /// refusing replica reported the key absent.
    pub async fn delete(&self, key: &[u8]) -> Result<()> {
        self.run(OpKind::Delete, key, None).await.map(|_| ())
    }

    /// Read `key`, from the cache when possible, else primary then secondary.
    pub async fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        let _guard = self.locks.read(key).await;

        if let Some(value) = self.cache.get(key) {
            self.metrics.cache_hits.inc();
            return Ok(value);
        }
        self.metrics.cache_misses.inc();

        let (primary, secondary) = self.ring.replicas(key)?;
        let value = match self.read_from(&primary, key).await {
            Ok(value) => value,
            Err(first) if primary == secondary => return Err(Self::read_failure(&[(&primary, first)])),
            Err(first) => {
                self.metrics.replica_read_failovers.inc();
                tracing::debug!(key = %display_key(key), primary = primary.id, error = %first, "Primary read failed, trying secondary");
                match self.read_from(&secondary, key).await {
                    Ok(value) => value,
                    Err(second) => {
                        return Err(Self::read_failure(&[(&primary, first), (&secondary, second)]))
                    }
                }
            }
        };

        // Writers are excluded by the shared lock, so this cannot race a commit.
        if self.cache.put(key, value.clone()) {
            self.metrics.cache_overwrites.inc();
        }
        Ok(value)
    }

    // === Two-Phase Commit ===

    /// Drive one transaction to completion. Returns each participant's
    /// "existed" flag from its commit ack.
    async fn run(&self, kind: OpKind, key: &[u8], value: Option<Vec<u8>>) -> Result<Vec<bool>> {
        let _inflight = InflightGuard::new(&self.metrics);
        let _guard = self.locks.write(key).await;

        let (primary, secondary) = self.ring.replicas(key)?;
        let _gates = self.gates.acquire(&[primary.id, secondary.id]).await;
        let txn = Transaction {
            op_id: self.next_op_id.fetch_add(1, Ordering::SeqCst),
            kind,
            key: key.to_vec(),
            value,
            primary,
            secondary,
        };
        tracing::debug!(
            op_id = txn.op_id,
            kind = %txn.kind,
            key = %display_key(key),
            primary = %txn.primary,
            secondary = %txn.secondary,
            "Transaction admitted"
        );

        // Phase 1: both votes must be in before deciding.
        let votes = self.collect_votes(&txn).await;
        let decision = if votes.iter().all(|(_, vote)| *vote == Vote::Ready) {
            Decision::Commit
        } else {
            Decision::Abort
        };

        // Phase 2: the decision is final; deliver it everywhere.
        let acks = self.deliver_decision(&txn, decision).await;

        match decision {
            Decision::Commit => {
                match txn.kind {
                    OpKind::Put => {
                        if let Some(value) = &txn.value {
                            if self.cache.put(key, value.clone()) {
                                self.metrics.cache_overwrites.inc();
                            }
                        }
                    }
                    OpKind::Delete => self.cache.del(key),
                }
                self.metrics.commits.inc();
                tracing::info!(op_id = txn.op_id, kind = %txn.kind, key = %display_key(key), "Transaction committed");
                Ok(acks)
            }
            Decision::Abort => {
                self.metrics.aborts.inc();
                let refusals: Vec<(&Node, &str)> = votes
                    .iter()
                    .filter_map(|(node, vote)| match vote {
                        Vote::Abort(reason) => Some((*node, reason.as_str())),
                        Vote::Ready => None,
                    })
                    .collect();
                tracing::info!(op_id = txn.op_id, kind = %txn.kind, key = %display_key(key), refusals = refusals.len(), "Transaction aborted");

                if txn.kind == OpKind::Delete && refusals.iter().all(|(_, reason)| *reason == KEY_NOT_FOUND) {
                    return Err(Error::NotFound(display_key(key)));
                }
                let reason = refusals
                    .iter()
                    .map(|(node, reason)| replica_reason(node, reason))
                    .collect::<Vec<_>>()
                    .join("\n");
                Err(Error::Aborted(reason))
            }
        }
    }

    async fn collect_votes<'t>(&self, txn: &'t Transaction) -> Vec<(&'t Node, Vote)> {
        let request = txn.ready_request();
        let participants = txn.participants();
        let votes = join_all(participants.iter().map(|node| self.vote(node, &request))).await;
        participants.into_iter().zip(votes).collect()
    }

    async fn vote(&self, node: &Node, request: &Message) -> Vote {
        let op_id = request.op_id;
        match self.call(node, request, self.config.phase1_timeout).await {
            Ok(reply) => match reply.msg_type {
                MessageType::Ready if reply.op_id == op_id => Vote::Ready,
                MessageType::Abort => Vote::Abort(
                    reply
                        .message
                        .unwrap_or_else(|| "aborted without a reason".to_string()),
                ),
                other => {
                    tracing::warn!(node = node.id, op_id = ?op_id, reply = %other, "Unexpected phase-1 reply");
                    Vote::Abort(format!("unexpected {} reply during the first phase of 2PC", other))
                }
            },
            Err(Error::Timeout(_)) => {
                tracing::warn!(node = node.id, op_id = ?op_id, "Replica timed out in phase 1");
                Vote::Abort(format!(
                    "Timeout Error: SlaveServer {} has timed out during the first phase of 2PC",
                    node.id
                ))
            }
            Err(e) => {
                tracing::warn!(node = node.id, op_id = ?op_id, error = %e, "Replica unreachable in phase 1");
                Vote::Abort(e.to_string())
            }
        }
    }

    async fn deliver_decision(&self, txn: &Transaction, decision: Decision) -> Vec<bool> {
        let participants = txn.participants();
        join_all(
            participants
                .iter()
                .map(|node| self.deliver_to(node, txn.op_id, decision)),
        )
        .await
    }

    /// Send `decision` to `node` until it acks. Returns the ack's status flag.
    async fn deliver_to(&self, node: &Node, op_id: u64, decision: Decision) -> bool {
        let request = Message::decision(op_id, decision == Decision::Commit);
        let request = &request;
        retry_forever(
            move |attempt| async move {
                if attempt > 0 {
                    self.metrics.phase2_retries.inc();
                }
                let reply = self.call(node, request, self.config.phase2_timeout).await?;
                match reply.msg_type {
                    MessageType::Ack if reply.op_id == Some(op_id) => Ok(reply.status.unwrap_or(false)),
                    other => Err(Error::Protocol(format!(
                        "expected ack for op {} from {}, got {}",
                        op_id, node, other
                    ))),
                }
            },
            self.config.retry_interval,
            self.config.max_retry_interval,
        )
        .await
    }

    /// One bounded request/reply with a replica.
    async fn call(&self, node: &Node, request: &Message, deadline: Duration) -> Result<Message> {
        tokio::time::timeout(deadline, self.transport.call(node, request, deadline))
            .await
            .map_err(|_| {
                Error::Timeout(format!("replica {} did not answer within {:?}", node, deadline))
            })?
    }

    async fn read_from(&self, node: &Node, key: &[u8]) -> Result<Vec<u8>> {
        let reply = self
            .call(node, &Message::get_request(key), self.config.read_timeout)
            .await?;
        if reply.msg_type != MessageType::Resp {
            return Err(Error::Protocol(format!("expected resp to getreq, got {}", reply.msg_type)));
        }
        match reply.decode_value()? {
            Some(value) => Ok(value),
            None => match reply.message {
                Some(msg) if msg == KEY_NOT_FOUND => Err(Error::NotFound(display_key(key))),
                Some(msg) => Err(Error::ReadFailed(msg)),
                None => Err(Error::Protocol("resp without value or message".into())),
            },
        }
    }

    /// `NotFound` if every replica said so, otherwise all reasons combined.
    fn read_failure(failures: &[(&Node, Error)]) -> Error {
        if failures.iter().all(|(_, e)| matches!(e, Error::NotFound(_))) {
            if let Some((_, Error::NotFound(key))) = failures.first() {
                return Error::NotFound(key.clone());
            }
        }
        let reason = failures
            .iter()
            .map(|(node, e)| replica_reason(node, &e.wire_message()))
            .collect::<Vec<_>>()
            .join("\n");
        Error::ReadFailed(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Scripted replica behaviour keyed by node id.
    #[derive(Clone, Copy, PartialEq)]
    enum Behaviour {
        Vote,
        Refuse,
        Silent,
    }

    #[derive(Default)]
    struct ScriptedTransport {
        behaviour: Mutex<HashMap<u64, Behaviour>>,
        seen: Mutex<Vec<(u64, MessageType, Option<u64>)>>,
        store: Mutex<HashMap<(u64, Vec<u8>), Vec<u8>>>,
        pending: Mutex<HashMap<(u64, u64), Message>>,
    }

    impl ScriptedTransport {
        fn set(&self, node: u64, behaviour: Behaviour) {
            self.behaviour.lock().unwrap().insert(node, behaviour);
        }

        fn seen(&self, msg_type: MessageType) -> usize {
            self.seen.lock().unwrap().iter().filter(|(_, t, _)| *t == msg_type).count()
        }
    }

    #[async_trait]
    impl ReplicaTransport for ScriptedTransport {
        async fn call(&self, node: &Node, request: &Message, _deadline: Duration) -> Result<Message> {
            self.seen.lock().unwrap().push((node.id, request.msg_type, request.op_id));
            let behaviour = *self.behaviour.lock().unwrap().get(&node.id).unwrap_or(&Behaviour::Vote);
            match request.msg_type {
                MessageType::PutReq | MessageType::DelReq => {
                    let op_id = request.require_op_id()?;
                    let key = request.decode_key()?;
                    let absent = !self.store.lock().unwrap().contains_key(&(node.id, key));
                    if request.msg_type == MessageType::DelReq && absent {
                        return Ok(Message::abort(op_id, KEY_NOT_FOUND));
                    }
                    match behaviour {
                        Behaviour::Vote => {
                            self.pending.lock().unwrap().insert((node.id, op_id), request.clone());
                            Ok(Message::ready(op_id))
                        }
                        Behaviour::Refuse => Ok(Message::abort(op_id, "Oversized value")),
                        Behaviour::Silent => {
                            tokio::time::sleep(Duration::from_secs(60)).await;
                            Ok(Message::ready(op_id))
                        }
                    }
                }
                MessageType::Commit | MessageType::Abort => {
                    let op_id = request.require_op_id()?;
                    let pending = self.pending.lock().unwrap().remove(&(node.id, op_id));
                    let mut existed = false;
                    if let (MessageType::Commit, Some(ready)) = (request.msg_type, pending) {
                        let key = ready.decode_key()?;
                        let mut store = self.store.lock().unwrap();
                        existed = match ready.decode_value()? {
                            Some(value) => store.insert((node.id, key), value).is_some(),
                            None => store.remove(&(node.id, key)).is_some(),
                        };
                    }
                    Ok(Message::ack(op_id).with_status(existed))
                }
                MessageType::GetReq => {
                    let key = request.decode_key()?;
                    match self.store.lock().unwrap().get(&(node.id, key.clone())) {
                        Some(value) => Ok(Message::value_response(&key, value)),
                        None => Ok(Message::response(KEY_NOT_FOUND)),
                    }
                }
                other => Err(Error::Protocol(format!("unexpected {}", other))),
            }
        }
    }

    fn coordinator(transport: Arc<ScriptedTransport>) -> Coordinator<ScriptedTransport> {
        let ring = Arc::new(ReplicaRing::new());
        ring.register(Node::new(10, "a", 1)).unwrap();
        ring.register(Node::new(u64::MAX / 2, "b", 2)).unwrap();
        let config = CoordinatorConfig {
            phase1_timeout: Duration::from_millis(100),
            retry_interval: Duration::from_millis(1),
            ..Default::default()
        };
        Coordinator::with_transport(config, ring, transport)
    }

    #[tokio::test]
    async fn test_commit_updates_cache() {
        let transport = Arc::new(ScriptedTransport::default());
        let coord = coordinator(transport.clone());

        assert!(!coord.put(b"k", b"v").await.unwrap());
        assert!(coord.put(b"k", b"v2").await.unwrap());
        assert_eq!(coord.cache().get(b"k"), Some(b"v2".to_vec()));
        assert_eq!(transport.seen(MessageType::Commit), 4);
        assert_eq!(coord.metrics().commits.get(), 2);
        assert_eq!(coord.metrics().inflight_transactions.get(), 0);
    }

    #[tokio::test]
    async fn test_single_refusal_aborts_both() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.set(10, Behaviour::Refuse);
        let coord = coordinator(transport.clone());

        let err = coord.put(b"k", b"v").await.unwrap_err();
        match err {
            Error::Aborted(reason) => assert_eq!(reason, "@10=>Oversized value"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(transport.seen(MessageType::Abort), 2);
        assert!(transport.store.lock().unwrap().is_empty());
        assert!(coord.cache().is_empty());
    }

    #[tokio::test]
    async fn test_both_refusals_are_joined() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.set(10, Behaviour::Refuse);
        transport.set(u64::MAX / 2, Behaviour::Refuse);
        let coord = coordinator(transport);

        let Error::Aborted(reason) = coord.put(b"k", b"v").await.unwrap_err() else {
            panic!("expected abort");
        };
        assert_eq!(reason.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_phase1_timeout_is_abort_vote() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.set(10, Behaviour::Silent);
        let coord = coordinator(transport);

        let Error::Aborted(reason) = coord.put(b"k", b"v").await.unwrap_err() else {
            panic!("expected abort");
        };
        assert!(reason.contains("SlaveServer 10 has timed out"));
    }

    #[tokio::test]
    async fn test_get_fails_over_and_reports_not_found() {
        let transport = Arc::new(ScriptedTransport::default());
        let coord = coordinator(transport.clone());

        assert!(matches!(coord.get(b"missing").await, Err(Error::NotFound(_))));

        coord.put(b"k", b"v").await.unwrap();
        coord.cache().del(b"k");
        // Only the secondary still has the value.
        let (primary, _) = coord.ring().replicas(b"k").unwrap();
        transport.store.lock().unwrap().remove(&(primary.id, b"k".to_vec()));

        assert_eq!(coord.get(b"k").await.unwrap(), b"v");
        assert_eq!(coord.metrics().replica_read_failovers.get(), 2);
        assert_eq!(coord.cache().get(b"k"), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn test_delete() {
        let transport = Arc::new(ScriptedTransport::default());
        let coord = coordinator(transport);

        assert!(matches!(coord.delete(b"k").await, Err(Error::NotFound(_))));
        coord.put(b"k", b"v").await.unwrap();
        coord.delete(b"k").await.unwrap();
        assert!(coord.cache().get(b"k").is_none());
        assert!(matches!(coord.get(b"k").await, Err(Error::NotFound(_))));
        assert!(matches!(coord.delete(b"k").await, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_read_failure_merges_reasons() {
        let a = Node::new(1, "a", 1);
        let b = Node::new(2, "b", 2);
        let err = Coordinator::<ScriptedTransport>::read_failure(&[
            (&a, Error::NotFound("k".into())),
            (&b, Error::Timeout("slow".into())),
        ]);
        let Error::ReadFailed(reason) = err else {
            panic!("expected read failure");
        };
        assert_eq!(reason, "@1=>Does not exist\n@2=>Timeout error: slow");
    }

    #[tokio::test]
    async fn test_op_ids_increase() {
        let transport = Arc::new(ScriptedTransport::default());
        let coord = coordinator(transport.clone());
        for key in [b"a", b"b", b"a"] {
            coord.put(key, b"v").await.unwrap();
        }
        let ids: Vec<u64> = transport
            .seen
            .lock()
            .unwrap()
            .iter()
            .filter(|(node, t, _)| *node == 10 && *t == MessageType::PutReq)
            .filter_map(|(_, _, op_id)| *op_id)
            .collect();
        assert_eq!(ids.len(), 3);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }
}
