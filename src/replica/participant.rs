//! Replica side of two-phase commit
//!
//! A replica keeps at most one undecided operation. A ready request is
//! validated, logged and only then voted for; a decision is logged before it
//! is applied and acknowledged.

use crate::common::message::{KEY_NOT_FOUND, MAX_KEY_SIZE, MAX_VALUE_SIZE, OVERSIZED_KEY, OVERSIZED_VALUE};
use crate::common::{display_key, Error, Message, MessageType, OpKind, Result, WalSyncPolicy};
use crate::replica::log::{ClosedOperation, LogEntry, ParticipantLog};
use crate::replica::store::{KvStore, MemStore};
use std::collections::VecDeque;
use std::path::Path;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard, Notify};
use tokio::time::Instant;

/// Decided operations remembered for idempotent re-delivery.
const RECENT_DECISIONS: usize = 1024;

pub const REPLICA_BUSY: &str = "replica busy";
pub const ALREADY_DECIDED: &str = "operation already decided";

struct State {
    log: ParticipantLog,
    store: MemStore,
    /// The single logged Ready still waiting for its decision.
    pending: Option<LogEntry>,
    /// Newest last. Includes aborts for operations never logged here.
    recent: VecDeque<ClosedOperation>,
}

impl State {
    fn remember(&mut self, closed: ClosedOperation) {
        if self.recent.len() == RECENT_DECISIONS {
            self.recent.pop_front();
        }
        self.recent.push_back(closed);
    }

    fn recent(&self, op_id: u64) -> Option<ClosedOperation> {
        self.recent.iter().rev().find(|c| c.op_id == op_id).copied()
    }
}

pub struct Participant {
    node_id: u64,
    state: Mutex<State>,
    slot_freed: Notify,
    ready_wait: Duration,
}

impl Participant {
    /// Open the log at `path` and rebuild the store from it.
    pub fn open(node_id: u64, path: impl AsRef<Path>, sync_policy: WalSyncPolicy, ready_wait: Duration) -> Result<Self> {
        let log = ParticipantLog::open(path, sync_policy)?;
        Self::recover(node_id, log, ready_wait)
    }

    /// Rebuild from `log`. An interrupted operation becomes the pending one
    /// again, so the coordinator's retried decision resolves it.
    pub fn recover(node_id: u64, mut log: ParticipantLog, ready_wait: Duration) -> Result<Self> {
        let mut store = MemStore::new();
        log.rebuild(&mut store)?;

        let mut recent = VecDeque::new();
        if let Some(closed) = log.last_closed() {
            recent.push_back(closed);
        }
        let pending = log.take_interrupted_operation();
        if let Some(op) = &pending {
            tracing::warn!(
                node = node_id,
                op_id = op.op_id,
                kind = %op.kind,
                key = %display_key(&op.key),
                "Resuming interrupted operation, awaiting coordinator decision"
            );
        }

        Ok(Self {
            node_id,
            state: Mutex::new(State {
                log,
                store,
                pending,
                recent,
            }),
            slot_freed: Notify::new(),
            ready_wait,
        })
    }

    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    /// Op id of the undecided operation, if any.
    pub async fn pending_op(&self) -> Option<u64> {
        self.state.lock().await.pending.as_ref().map(|op| op.op_id)
    }

    /// Committed value for `key` on this replica.
    pub async fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.state.lock().await.store.get(key)
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.store.len()
    }

    /// Handle one coordinator message and produce the reply.
    /// Messages that make no sense for a replica are protocol errors.
    pub async fn handle(&self, request: &Message) -> Result<Message> {
        match request.msg_type {
            MessageType::GetReq => self.handle_get(request).await,
            MessageType::PutReq | MessageType::DelReq => self.handle_ready(request).await,
            MessageType::Commit => self.handle_decision(request, true).await,
            MessageType::Abort => self.handle_decision(request, false).await,
            other => Err(Error::Protocol(format!(
                "replica {} does not accept {}",
                self.node_id, other
            ))),
        }
    }

    async fn handle_get(&self, request: &Message) -> Result<Message> {
        let key = request.decode_key()?;
        let state = self.state.lock().await;
        Ok(match state.store.get(&key) {
            Some(value) => Message::value_response(&key, &value),
            None => Message::response(KEY_NOT_FOUND),
        })
    }

    // === Phase 1 ===

    async fn handle_ready(&self, request: &Message) -> Result<Message> {
        let op_id = request.require_op_id()?;
        let kind = match request.msg_type {
            MessageType::PutReq => OpKind::Put,
            _ => OpKind::Delete,
        };
        let key = request.decode_key()?;
        let value = request.decode_value()?;

        if key.len() > MAX_KEY_SIZE {
            return Ok(Message::abort(op_id, OVERSIZED_KEY));
        }
        let value = match (kind, value) {
            (OpKind::Put, Some(value)) if value.len() > MAX_VALUE_SIZE => {
                return Ok(Message::abort(op_id, OVERSIZED_VALUE))
            }
            (OpKind::Put, Some(value)) => Some(value),
            (OpKind::Put, None) => return Err(Error::Protocol("putreq without value".into())),
            (OpKind::Delete, _) => None,
        };

        let mut state = match self.acquire_slot(op_id).await? {
            Slot::Free(state) => state,
            Slot::AlreadyReady => return Ok(Message::ready(op_id)),
            Slot::Refused(reason) => {
                tracing::info!(node = self.node_id, op_id, reason, "Refusing ready request");
                return Ok(Message::abort(op_id, reason));
            }
        };

        if kind == OpKind::Delete && !state.store.contains(&key) {
            return Ok(Message::abort(op_id, KEY_NOT_FOUND));
        }

        let entry = LogEntry::ready(op_id, kind, key, value);
        if let Err(e) = state.log.append_and_flush(&entry) {
            tracing::error!(node = self.node_id, op_id, error = %e, "Could not log ready entry");
            return Ok(Message::abort(op_id, e.to_string()));
        }
        tracing::debug!(node = self.node_id, op_id, kind = %kind, key = %display_key(&entry.key), "Voted ready");
        state.pending = Some(entry);
        Ok(Message::ready(op_id))
    }

    /// Wait until no other operation is undecided, up to `ready_wait`.
    async fn acquire_slot(&self, op_id: u64) -> Result<Slot<'_>> {
        let deadline = Instant::now() + self.ready_wait;
        loop {
            let state = self.state.lock().await;
            if state.recent(op_id).is_some() {
                return Ok(Slot::Refused(ALREADY_DECIDED));
            }
            match &state.pending {
                None => return Ok(Slot::Free(state)),
                Some(op) if op.op_id == op_id => return Ok(Slot::AlreadyReady),
                Some(_) => {}
            }

            // Registered before the lock is released, so a decision in
            // between still wakes us.
            let freed = self.slot_freed.notified();
            drop(state);
            if tokio::time::timeout_at(deadline, freed).await.is_err() {
                return Ok(Slot::Refused(REPLICA_BUSY));
            }
        }
    }

    // === Phase 2 ===

    async fn handle_decision(&self, request: &Message, commit: bool) -> Result<Message> {
        let op_id = request.require_op_id()?;
        let mut state = self.state.lock().await;

        let pending_matches = state.pending.as_ref().is_some_and(|op| op.op_id == op_id);
        if pending_matches {
            let Some(ready) = state.pending.clone() else {
                return Err(Error::Internal("pending operation vanished".into()));
            };
            state.log.append_and_flush(&LogEntry::decision(&ready, commit))?;
            let existed = if commit { ready.apply(&mut state.store) } else { false };
            state.pending = None;
            state.remember(ClosedOperation {
                op_id,
                committed: commit,
                existed,
            });
            drop(state);
            self.slot_freed.notify_waiters();

            tracing::debug!(
                node = self.node_id,
                op_id,
                committed = commit,
                key = %display_key(&ready.key),
                "Decision applied"
            );
            return Ok(Message::ack(op_id).with_status(existed));
        }

        if let Some(closed) = state.recent(op_id) {
            if closed.committed != commit {
                return Err(Error::Protocol(format!(
                    "op {} was already {}, got {}",
                    op_id,
                    if closed.committed { "committed" } else { "aborted" },
                    request.msg_type
                )));
            }
            return Ok(Message::ack(op_id).with_status(closed.existed));
        }

        if commit {
            return Err(Error::Protocol(format!(
                "commit for op {} which was never voted ready",
                op_id
            )));
        }

        // Abort for an operation this replica refused or never saw.
        state.remember(ClosedOperation {
            op_id,
            committed: false,
            existed: false,
        });
        Ok(Message::ack(op_id).with_status(false))
    }
}

enum Slot<'a> {
    Free(MutexGuard<'a, State>),
    AlreadyReady,
    Refused(&'static str),
}
