//! Participant log
//!
//! Append-only record of every 2PC phase a replica goes through. Each entry is
//! flushed (per `WalSyncPolicy`) before the replica answers the coordinator.
//! Record format, little endian:
//!
//! ```text
//! [MAGIC "TPL1"][PHASE u8][OP_ID u64][KIND u8][KEY_LEN u32]
//! [HAS_VALUE u8][VALUE_LEN u32][KEY][VALUE][CRC32]
//! ```
//!
//! The CRC covers everything between the magic and the checksum. On open a torn
//! tail (crash mid-append) is cut off: such an entry was never acknowledged.
//!
//! Replay walks entries in pairs. A Ready followed by its decision is closed
//! and applied (Commit) or skipped (Abort). A trailing Ready without a decision
//! is the interrupted operation, held back for the caller to resolve.

use crate::common::message::{MAX_KEY_SIZE, MAX_VALUE_SIZE};
use crate::common::{crc32, display_key, Error, OpKind, Result, WalSyncPolicy};
use crate::replica::store::KvStore;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const LOG_MAGIC: [u8; 4] = *b"TPL1";

const PHASE_READY: u8 = 1;
const PHASE_COMMIT: u8 = 2;
const PHASE_ABORT: u8 = 3;

const KIND_PUT: u8 = 1;
const KIND_DELETE: u8 = 2;

/// Bytes before the key: magic, phase, op id, kind, key len, has-value, value len.
const HEADER_LEN: usize = 4 + 1 + 8 + 1 + 4 + 1 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogPhase {
    Ready,
    Commit,
    Abort,
}

impl LogPhase {
    fn code(self) -> u8 {
        match self {
            LogPhase::Ready => PHASE_READY,
            LogPhase::Commit => PHASE_COMMIT,
            LogPhase::Abort => PHASE_ABORT,
        }
    }

    fn from_code(code: u8) -> Result<Self> {
        match code {
            PHASE_READY => Ok(LogPhase::Ready),
            PHASE_COMMIT => Ok(LogPhase::Commit),
            PHASE_ABORT => Ok(LogPhase::Abort),
            other => Err(Error::Wal(format!("Unknown phase code: {}", other))),
        }
    }
}

fn kind_code(kind: OpKind) -> u8 {
    match kind {
        OpKind::Put => KIND_PUT,
        OpKind::Delete => KIND_DELETE,
    }
}

fn kind_from_code(code: u8) -> Result<OpKind> {
    match code {
        KIND_PUT => Ok(OpKind::Put),
        KIND_DELETE => Ok(OpKind::Delete),
        other => Err(Error::Wal(format!("Unknown kind code: {}", other))),
    }
}

/// One phase transition of one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub phase: LogPhase,
    pub op_id: u64,
    pub kind: OpKind,
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
}

impl LogEntry {
    pub fn ready(op_id: u64, kind: OpKind, key: Vec<u8>, value: Option<Vec<u8>>) -> Self {
        Self {
            phase: LogPhase::Ready,
            op_id,
            kind,
            key,
            value,
        }
    }

    /// Decision closing `ready`. Carries the key but not the value.
    pub fn decision(ready: &LogEntry, commit: bool) -> Self {
        Self {
            phase: if commit { LogPhase::Commit } else { LogPhase::Abort },
            op_id: ready.op_id,
            kind: ready.kind,
            key: ready.key.clone(),
            value: None,
        }
    }

    /// Apply this operation to `store`. Returns whether the key existed.
    pub fn apply(&self, store: &mut dyn KvStore) -> bool {
        match (self.kind, &self.value) {
            (OpKind::Put, Some(value)) => store.put(&self.key, value.clone()),
            (OpKind::Put, None) => store.contains(&self.key),
            (OpKind::Delete, _) => store.delete(&self.key),
        }
    }

    fn encode(&self) -> Vec<u8> {
        let value = self.value.as_deref().unwrap_or(&[]);
        let mut buf = Vec::with_capacity(HEADER_LEN + self.key.len() + value.len() + 4);
        buf.extend_from_slice(&LOG_MAGIC);
        buf.push(self.phase.code());
        buf.extend_from_slice(&self.op_id.to_le_bytes());
        buf.push(kind_code(self.kind));
        buf.extend_from_slice(&(self.key.len() as u32).to_le_bytes());
        buf.push(self.value.is_some() as u8);
        buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.key);
        buf.extend_from_slice(value);
        let checksum = crc32(&buf[LOG_MAGIC.len()..]);
        buf.extend_from_slice(&checksum.to_le_bytes());
        buf
    }

    /// Read one entry. `Ok(None)` at a clean end of file. Returns the entry and
    /// its encoded length.
    fn decode<R: Read>(reader: &mut R) -> Result<Option<(Self, usize)>> {
        let mut header = [0u8; HEADER_LEN];
        let mut filled = 0;
        while filled < HEADER_LEN {
            let n = reader.read(&mut header[filled..])?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(Error::Wal(format!("Torn header ({} of {} bytes)", filled, HEADER_LEN)));
            }
            filled += n;
        }

        if header[..4] != LOG_MAGIC {
            return Err(Error::Wal("Invalid log magic".into()));
        }
        let phase = LogPhase::from_code(header[4])?;
        let op_id = u64::from_le_bytes(header[5..13].try_into().map_err(|_| Error::Wal("short op id".into()))?);
        let kind = kind_from_code(header[13])?;
        let key_len = u32::from_le_bytes(header[14..18].try_into().map_err(|_| Error::Wal("short key length".into()))?) as usize;
        let has_value = header[18] != 0;
        let value_len = u32::from_le_bytes(header[19..23].try_into().map_err(|_| Error::Wal("short value length".into()))?) as usize;

        if key_len > MAX_KEY_SIZE || value_len > MAX_VALUE_SIZE {
            return Err(Error::Wal(format!(
                "Implausible lengths: key {} value {}",
                key_len, value_len
            )));
        }

        let mut payload = vec![0u8; key_len + value_len + 4];
        reader
            .read_exact(&mut payload)
            .map_err(|e| Error::Wal(format!("Torn entry for op {}: {}", op_id, e)))?;

        let body_end = key_len + value_len;
        let stored = u32::from_le_bytes(
            payload[body_end..]
                .try_into()
                .map_err(|_| Error::Wal("short checksum".into()))?,
        );
        let mut checked = header[LOG_MAGIC.len()..].to_vec();
        checked.extend_from_slice(&payload[..body_end]);
        if crc32(&checked) != stored {
            return Err(Error::Wal(format!("Checksum mismatch for op {}", op_id)));
        }

        let key = payload[..key_len].to_vec();
        let value = has_value.then(|| payload[key_len..body_end].to_vec());

        let entry = LogEntry {
            phase,
            op_id,
            kind,
            key,
            value,
        };
        Ok(Some((entry, HEADER_LEN + body_end + 4)))
    }
}

/// Last operation closed during replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClosedOperation {
    pub op_id: u64,
    pub committed: bool,
    /// For a commit: whether the key existed before it was applied.
    pub existed: bool,
}

pub struct ParticipantLog {
    path: PathBuf,
    writer: BufWriter<File>,
    sync_policy: WalSyncPolicy,
    interrupted: Option<LogEntry>,
    last_closed: Option<ClosedOperation>,
}

impl ParticipantLog {
    /// Open or create the log, cutting off a torn tail if there is one.
    pub fn open(path: impl AsRef<Path>, sync_policy: WalSyncPolicy) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let valid_len = Self::valid_length(&path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;

        let actual_len = file.metadata()?.len();
        if actual_len > valid_len {
            tracing::warn!(
                path = %path.display(),
                valid_len,
                dropped = actual_len - valid_len,
                "Truncating torn participant log tail"
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }

        Ok(Self {
            path,
            writer: BufWriter::new(file),
            sync_policy,
            interrupted: None,
            last_closed: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Byte length of the longest prefix made of intact entries.
    fn valid_length(path: &Path) -> Result<u64> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut reader = BufReader::new(file);
        let mut valid = 0u64;
        loop {
            match LogEntry::decode(&mut reader) {
                Ok(Some((_, len))) => valid += len as u64,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Participant log scan stopped at offset {}: {}", valid, e);
                    break;
                }
            }
        }
        Ok(valid)
    }

    /// Durably append one entry.
    pub fn append_and_flush(&mut self, entry: &LogEntry) -> Result<()> {
        self.writer.write_all(&entry.encode())?;
        self.maybe_sync()?;
        tracing::debug!(
            op_id = entry.op_id,
            phase = ?entry.phase,
            kind = %entry.kind,
            key = %display_key(&entry.key),
            "Logged"
        );
        Ok(())
    }

    fn maybe_sync(&mut self) -> Result<()> {
        match self.sync_policy {
            WalSyncPolicy::Always => {
                self.writer.flush()?;
                self.writer.get_ref().sync_data()?;
            }
            WalSyncPolicy::Interval => {
                self.writer.flush()?;
            }
            WalSyncPolicy::Never => {}
        }
        Ok(())
    }

    /// Flush and fsync regardless of policy.
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Every entry in the log, in order.
    pub fn read_all(&mut self) -> Result<Vec<LogEntry>> {
        self.writer.flush()?;
        let file = File::open(&self.path)?;
        let mut reader = BufReader::new(file);
        let mut entries = Vec::new();
        while let Some((entry, _)) = LogEntry::decode(&mut reader)? {
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Replay the whole log into `store`, which should start empty.
    ///
    /// Closed operations are applied in order; a trailing undecided Ready
    /// becomes the interrupted operation and is not applied.
    pub fn rebuild(&mut self, store: &mut dyn KvStore) -> Result<()> {
        let entries = self.read_all()?;
        let mut pending: Option<LogEntry> = None;
        let mut applied = 0usize;

        for entry in entries {
            match entry.phase {
                LogPhase::Ready => {
                    if let Some(open) = &pending {
                        return Err(Error::Corrupted(format!(
                            "op {} logged ready while op {} was undecided",
                            entry.op_id, open.op_id
                        )));
                    }
                    pending = Some(entry);
                }
                LogPhase::Commit | LogPhase::Abort => {
                    let ready = match pending.take() {
                        Some(ready) if ready.op_id == entry.op_id => ready,
                        Some(ready) => {
                            return Err(Error::Corrupted(format!(
                                "decision for op {} follows ready for op {}",
                                entry.op_id, ready.op_id
                            )))
                        }
                        None => {
                            return Err(Error::Corrupted(format!(
                                "decision for op {} without a ready entry",
                                entry.op_id
                            )))
                        }
                    };
                    let committed = entry.phase == LogPhase::Commit;
                    let existed = if committed {
                        applied += 1;
                        ready.apply(store)
                    } else {
                        false
                    };
                    self.last_closed = Some(ClosedOperation {
                        op_id: ready.op_id,
                        committed,
                        existed,
                    });
                }
            }
        }

        if let Some(open) = &pending {
            tracing::warn!(op_id = open.op_id, kind = %open.kind, key = %display_key(&open.key), "Found interrupted operation");
        }
        self.interrupted = pending;
        tracing::info!(path = %self.path.display(), applied, keys = store.len(), "Participant log replayed");
        Ok(())
    }

    pub fn has_interrupted_operation(&self) -> bool {
        self.interrupted.is_some()
    }

    /// Hand over the interrupted operation; `None` on every later call.
    pub fn take_interrupted_operation(&mut self) -> Option<LogEntry> {
        self.interrupted.take()
    }

    /// The last operation closed during replay, if any.
    pub fn last_closed(&self) -> Option<ClosedOperation> {
        self.last_closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::store::MemStore;
    use tempfile::tempdir;

    fn put(op_id: u64, key: &[u8], value: &[u8]) -> LogEntry {
        LogEntry::ready(op_id, OpKind::Put, key.to_vec(), Some(value.to_vec()))
    }

    #[test]
    fn test_encode_decode() {
        let entry = put(9, b"key", &[0, 1, 2]);
        let bytes = entry.encode();
        let (decoded, len) = LogEntry::decode(&mut bytes.as_slice()).unwrap().unwrap();
        assert_eq!(decoded, entry);
        assert_eq!(len, bytes.len());

        let decision = LogEntry::decision(&entry, false);
        let (decoded, _) = LogEntry::decode(&mut decision.encode().as_slice()).unwrap().unwrap();
        assert_eq!(decoded.phase, LogPhase::Abort);
        assert_eq!(decoded.value, None);
    }

    #[test]
    fn test_empty_value_is_not_absent() {
        let entry = put(1, b"k", b"");
        let (decoded, _) = LogEntry::decode(&mut entry.encode().as_slice()).unwrap().unwrap();
        assert_eq!(decoded.value, Some(Vec::new()));
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let mut bytes = put(1, b"key", b"value").encode();
        let last = bytes.len() - 6;
        bytes[last] ^= 0xff;
        assert!(LogEntry::decode(&mut bytes.as_slice()).is_err());
    }

    #[test]
    fn test_replay_commit_applies() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("p.log");
        {
            let mut log = ParticipantLog::open(&path, WalSyncPolicy::Always).unwrap();
            let ready = put(1, b"k1", b"v1");
            log.append_and_flush(&ready).unwrap();
            log.append_and_flush(&LogEntry::decision(&ready, true)).unwrap();
        }

        let mut log = ParticipantLog::open(&path, WalSyncPolicy::Always).unwrap();
        let mut store = MemStore::new();
        log.rebuild(&mut store).unwrap();
        assert_eq!(store.get(b"k1"), Some(b"v1".to_vec()));
        assert!(!log.has_interrupted_operation());
        assert_eq!(
            log.last_closed(),
            Some(ClosedOperation {
                op_id: 1,
                committed: true,
                existed: false
            })
        );
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("torn.log");
        let ready = put(1, b"k", b"v");
        {
            let mut log = ParticipantLog::open(&path, WalSyncPolicy::Always).unwrap();
            log.append_and_flush(&ready).unwrap();
            log.append_and_flush(&LogEntry::decision(&ready, true)).unwrap();
        }
        let intact = std::fs::metadata(&path).unwrap().len();
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            let half = put(2, b"k", b"v2").encode();
            file.write_all(&half[..half.len() / 2]).unwrap();
        }

        let mut log = ParticipantLog::open(&path, WalSyncPolicy::Always).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), intact);

        let mut store = MemStore::new();
        log.rebuild(&mut store).unwrap();
        assert_eq!(store.get(b"k"), Some(b"v".to_vec()));
        assert!(!log.has_interrupted_operation());

        // Appends continue after the cut.
        let next = put(3, b"k", b"v3");
        log.append_and_flush(&next).unwrap();
        assert_eq!(log.read_all().unwrap().last(), Some(&next));
    }

    #[test]
    fn test_mismatched_decision_is_corruption() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.log");
        let mut log = ParticipantLog::open(&path, WalSyncPolicy::Never).unwrap();
        let ready = put(1, b"k", b"v");
        log.append_and_flush(&ready).unwrap();
        log.append_and_flush(&LogEntry::decision(&put(2, b"k", b"v"), true))
            .unwrap();
        log.sync().unwrap();

        let mut store = MemStore::new();
        assert!(matches!(log.rebuild(&mut store), Err(Error::Corrupted(_))));
    }

    #[test]
    fn test_creates_parent_directories() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/deeper/p.log");
        let log = ParticipantLog::open(&path, WalSyncPolicy::Always).unwrap();
        assert!(log.path().exists());
    }
}
