use crate::error::{KvError, KvResult};
use crate::messages::{KvMessage, OpId};
use crate::server::KvServer;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const LOG_MAGIC: &[u8; 4] = b"TPCL";
const LOG_VERSION: u8 = 1;

/// magic(4) + version(1) + payload_len(4)
const HEADER_SIZE: usize = 9;
const CRC_SIZE: usize = 4;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Put { key: String, value: String },
    Del { key: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogEntry {
    // phase-1 request, written before voting
    Operation { op_id: OpId, op: Operation },
    // phase-2 decision, written before acking
    Decision { op_id: OpId, commit: bool },
}

impl LogEntry {
    /// The record for a put/del request carrying an operation id, or for a
    /// commit/abort decision. Anything else is not logged.
    pub fn from_message(msg: &KvMessage) -> Option<Self> {
        let entry = match msg {
            KvMessage::PutReq {
                key,
                value,
                op_id: Some(op_id),
            } => LogEntry::Operation {
                op_id: *op_id,
                op: Operation::Put {
                    key: key.clone(),
                    value: value.clone(),
                },
            },
            KvMessage::DelReq {
                key,
                op_id: Some(op_id),
            } => LogEntry::Operation {
                op_id: *op_id,
                op: Operation::Del { key: key.clone() },
            },
            KvMessage::Commit { op_id } => LogEntry::Decision {
                op_id: *op_id,
                commit: true,
            },
            KvMessage::Abort { op_id, .. } => LogEntry::Decision {
                op_id: *op_id,
                commit: false,
            },
            _ => return None,
        };
        Some(entry)
    }

    fn encode(&self) -> KvResult<Vec<u8>> {
        let payload = bincode::serialize(self).map_err(log_error)?;
        let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        buf.extend_from_slice(LOG_MAGIC);
        buf.push(LOG_VERSION);
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&payload);
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    fn decode(data: &[u8]) -> Result<(Self, usize), FrameError> {
        if data.len() < HEADER_SIZE {
            return Err(FrameError::Truncated);
        }
        if &data[0..4] != LOG_MAGIC {
            return Err(FrameError::Corrupt("bad magic".into()));
        }
        if data[4] != LOG_VERSION {
            return Err(FrameError::Corrupt(format!("unsupported version {}", data[4])));
        }
        let len = u32::from_le_bytes([data[5], data[6], data[7], data[8]]) as usize;
        let total = HEADER_SIZE + len + CRC_SIZE;
        if data.len() < total {
            return Err(FrameError::Truncated);
        }

        let stored = u32::from_le_bytes([
            data[total - 4],
            data[total - 3],
            data[total - 2],
            data[total - 1],
        ]);
        let calculated = crc32fast::hash(&data[..total - CRC_SIZE]);
        if stored != calculated {
            return Err(FrameError::Corrupt(format!(
                "crc mismatch: stored={stored}, calculated={calculated}"
            )));
        }

        let entry = bincode::deserialize(&data[HEADER_SIZE..total - CRC_SIZE])
            .map_err(|e| FrameError::Corrupt(e.to_string()))?;
        Ok((entry, total))
    }
}

impl Operation {
    fn to_request(&self, op_id: OpId) -> KvMessage {
        match self {
            Operation::Put { key, value } => KvMessage::PutReq {
                key: key.clone(),
                value: value.clone(),
                op_id: Some(op_id),
            },
            Operation::Del { key } => KvMessage::DelReq {
                key: key.clone(),
                op_id: Some(op_id),
            },
        }
    }

    async fn apply(&self, server: &KvServer) -> KvResult<()> {
        match self {
            Operation::Put { key, value } => server.put(key, value).await,
            Operation::Del { key } => match server.del(key).await {
                Err(KvError::NotFound) => Ok(()),
                other => other,
            },
        }
    }
}

enum FrameError {
    // torn write at the end of the file
    Truncated,
    Corrupt(String),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Truncated => write!(f, "truncated frame"),
            FrameError::Corrupt(reason) => write!(f, "{reason}"),
        }
    }
}

/// Append-only log of 2PC records for one slave.
pub struct TpcLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl TpcLog {
    pub async fn open(path: impl AsRef<Path>) -> KvResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(log_error)?;
            }
        }

        // a crash mid-append leaves a partial frame; cut it so new records
        // land right after the last good one
        let existing = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(log_error(e)),
        };
        let (_, clean_len) = scan(&existing);
        if clean_len < existing.len() {
            warn!(
                "Truncating {} unreadable byte(s) at the end of {:?}",
                existing.len() - clean_len,
                path
            );
            let file = OpenOptions::new()
                .write(true)
                .open(&path)
                .await
                .map_err(log_error)?;
            file.set_len(clean_len as u64).await.map_err(log_error)?;
            file.sync_all().await.map_err(log_error)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(log_error)?;
        info!("Log opened at {:?}", path);
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the entry and syncs it to disk before returning.
    pub async fn append(&self, entry: &LogEntry) -> KvResult<()> {
        let frame = entry.encode()?;
        let mut file = self.file.lock().await;
        file.write_all(&frame).await.map_err(log_error)?;
        file.flush().await.map_err(log_error)?;
        file.sync_data().await.map_err(log_error)?;
        Ok(())
    }

    /// Every readable entry in append order.
    pub async fn entries(&self) -> KvResult<Vec<LogEntry>> {
        // keeps a concurrent append from showing up half written
        let _file = self.file.lock().await;
        let data = tokio::fs::read(&self.path).await.map_err(log_error)?;
        let (entries, _) = scan(&data);
        Ok(entries)
    }

    /// Replays the log into `server` and returns the operations that never
    /// saw a decision, keyed by operation id.
    ///
    /// An operation is applied when its commit is reached, so decisions may
    /// arrive in any order relative to the operations they close. Read
    /// failures are logged and leave nothing to recover.
    pub async fn rebuild(&self, server: &KvServer) -> HashMap<OpId, KvMessage> {
        let entries = match self.entries().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Could not read log {:?}: {}", self.path, e);
                return HashMap::new();
            }
        };

        let mut pending: HashMap<OpId, Operation> = HashMap::new();
        for entry in entries {
            match entry {
                LogEntry::Operation { op_id, op } => {
                    pending.insert(op_id, op);
                }
                LogEntry::Decision { op_id, commit } => {
                    let Some(op) = pending.remove(&op_id) else {
                        debug!("Ignoring decision for unknown op {}", op_id);
                        continue;
                    };
                    if !commit {
                        continue;
                    }
                    if let Err(e) = op.apply(server).await {
                        warn!("Could not replay op {}: {}", op_id, e);
                    }
                }
            }
        }

        if !pending.is_empty() {
            info!("{} interrupted operation(s) found in log", pending.len());
        }
        pending
            .into_iter()
            .map(|(op_id, op)| (op_id, op.to_request(op_id)))
            .collect()
    }
}

// Decodes every readable frame. A bad frame is skipped by jumping to the next
// magic; with no magic after it, the rest of the file is an unusable tail.
// Returns the entries and the length of the data up to the last good frame.
fn scan(data: &[u8]) -> (Vec<LogEntry>, usize) {
    let mut entries = Vec::new();
    let mut offset = 0;
    let mut clean_len = 0;
    while offset < data.len() {
        match LogEntry::decode(&data[offset..]) {
            Ok((entry, consumed)) => {
                entries.push(entry);
                offset += consumed;
                clean_len = offset;
            }
            Err(e) => match next_magic(data, offset + 1) {
                Some(next) => {
                    warn!("Skipping bad log entry at offset {}: {}", offset, e);
                    offset = next;
                }
                None => {
                    warn!("Ignoring log tail at offset {}: {}", offset, e);
                    break;
                }
            },
        }
    }
    (entries, clean_len)
}

fn next_magic(data: &[u8], from: usize) -> Option<usize> {
    data.get(from..)?
        .windows(LOG_MAGIC.len())
        .position(|window| window == LOG_MAGIC)
        .map(|pos| from + pos)
}

fn log_error(e: impl fmt::Display) -> KvError {
    KvError::Unknown(format!("log: {e}"))
}
