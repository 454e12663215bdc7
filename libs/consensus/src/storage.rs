//! Durable consensus state under the node's state directory.
//!
//! Layout inside `<state_path>/raft/`:
//! - `hardstate.bin` — current term and vote, rewritten atomically.
//! - `log.bin`       — length-prefixed bincode frames, appended per entry.
//! - `snapshot.bin`  — the latest compaction image of the registry.
//!
//! The directory is owned exclusively by the consensus node. Formats are
//! internal; no cross-version compatibility is promised.

use crate::message::LogEntry;
use hivemind_types::{HiveError, NodeId, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HardState {
    pub term: u64,
    pub voted_for: Option<NodeId>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub index: u64,
    pub term: u64,
}

pub struct RaftStorage {
    dir: PathBuf,
}

impl RaftStorage {
    pub fn open(state_path: &Path) -> Result<Self> {
        let dir = state_path.join("raft");
        fs::create_dir_all(&dir)
            .map_err(|e| HiveError::fatal(format!("cannot create {}: {e}", dir.display())))?;
        Ok(Self { dir })
    }

    /// Loads everything persisted so far. A missing file means a fresh node.
    pub fn load(&self) -> Result<(HardState, Vec<LogEntry>, Option<(SnapshotMeta, Vec<u8>)>)> {
        let hard = match self.read_file("hardstate.bin")? {
            Some(bytes) => hivemind_codec::decode_frame(&bytes)?,
            None => HardState::default(),
        };
        let snapshot = match self.read_file("snapshot.bin")? {
            Some(bytes) => {
                let (meta, data): (SnapshotMeta, Vec<u8>) = hivemind_codec::decode_frame(&bytes)?;
                Some((meta, data))
            }
            None => None,
        };
        let entries = self.read_log()?;
        info!(
            term = hard.term,
            entries = entries.len(),
            snapshot_index = snapshot.as_ref().map(|(m, _)| m.index).unwrap_or(0),
            dir = %self.dir.display(),
            "loaded consensus state"
        );
        Ok((hard, entries, snapshot))
    }

    pub fn save_hardstate(&self, hard: &HardState) -> Result<()> {
        self.write_file("hardstate.bin", &hivemind_codec::encode_frame(hard)?)
    }

    /// Appends entries at the end of the log file.
    pub fn append_entries(&self, entries: &[LogEntry]) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join("log.bin"))
            .map_err(|e| HiveError::fatal(format!("open log: {e}")))?;
        for entry in entries {
            write_frame(&mut file, &hivemind_codec::encode_frame(entry)?)?;
        }
        file.flush()
            .map_err(|e| HiveError::fatal(format!("flush log: {e}")))?;
        Ok(())
    }

    /// Rewrites the whole log; used after truncating a conflicting suffix
    /// or compacting a committed prefix.
    pub fn rewrite_log(&self, entries: &[LogEntry]) -> Result<()> {
        let tmp = self.dir.join("log.bin.tmp");
        {
            let mut file =
                File::create(&tmp).map_err(|e| HiveError::fatal(format!("create log: {e}")))?;
            for entry in entries {
                write_frame(&mut file, &hivemind_codec::encode_frame(entry)?)?;
            }
            file.flush()
                .map_err(|e| HiveError::fatal(format!("flush log: {e}")))?;
        }
        fs::rename(&tmp, self.dir.join("log.bin"))
            .map_err(|e| HiveError::fatal(format!("replace log: {e}")))?;
        debug!(entries = entries.len(), "rewrote consensus log");
        Ok(())
    }

    pub fn save_snapshot(&self, meta: SnapshotMeta, data: &[u8]) -> Result<()> {
        let bytes = hivemind_codec::encode_frame(&(meta, data.to_vec()))?;
        self.write_file("snapshot.bin", &bytes)?;
        info!(index = meta.index, term = meta.term, "saved registry snapshot");
        Ok(())
    }

    fn read_log(&self) -> Result<Vec<LogEntry>> {
        let bytes = match self.read_file("log.bin")? {
            Some(bytes) => bytes,
            None => return Ok(Vec::new()),
        };
        let mut entries = Vec::new();
        let mut at = 0usize;
        while at + 4 <= bytes.len() {
            let len = u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
                as usize;
            at += 4;
            if at + len > bytes.len() {
                // Torn tail from a crash mid-append; everything before it
                // is intact.
                debug!("dropping torn frame at log tail");
                break;
            }
            entries.push(hivemind_codec::decode_frame(&bytes[at..at + len])?);
            at += len;
        }
        Ok(entries)
    }

    fn read_file(&self, name: &str) -> Result<Option<Vec<u8>>> {
        match File::open(self.dir.join(name)) {
            Ok(mut file) => {
                let mut bytes = Vec::new();
                file.read_to_end(&mut bytes)
                    .map_err(|e| HiveError::fatal(format!("read {name}: {e}")))?;
                Ok(Some(bytes))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(HiveError::fatal(format!("open {name}: {e}"))),
        }
    }

    fn write_file(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let tmp = self.dir.join(format!("{name}.tmp"));
        fs::write(&tmp, bytes).map_err(|e| HiveError::fatal(format!("write {name}: {e}")))?;
        fs::rename(&tmp, self.dir.join(name))
            .map_err(|e| HiveError::fatal(format!("replace {name}: {e}")))?;
        Ok(())
    }
}

fn write_frame(file: &mut File, bytes: &[u8]) -> Result<()> {
    file.write_all(&(bytes.len() as u32).to_le_bytes())
        .and_then(|_| file.write_all(bytes))
        .map_err(|e| HiveError::fatal(format!("append log frame: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::EntryPayload;
    use hivemind_registry::RegistryCommand;

    fn entry(term: u64, index: u64) -> LogEntry {
        LogEntry {
            term,
            index,
            payload: EntryPayload::Registry(RegistryCommand::NoOp),
        }
    }

    #[test]
    fn fresh_directory_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage = RaftStorage::open(dir.path()).unwrap();
        let (hard, entries, snapshot) = storage.load().unwrap();
        assert_eq!(hard, HardState::default());
        assert!(entries.is_empty());
        assert!(snapshot.is_none());
    }

    #[test]
    fn hardstate_and_log_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = RaftStorage::open(dir.path()).unwrap();
            storage
                .save_hardstate(&HardState {
                    term: 3,
                    voted_for: Some(NodeId(1)),
                })
                .unwrap();
            storage.append_entries(&[entry(1, 1), entry(1, 2)]).unwrap();
            storage.append_entries(&[entry(3, 3)]).unwrap();
        }
        let storage = RaftStorage::open(dir.path()).unwrap();
        let (hard, entries, _) = storage.load().unwrap();
        assert_eq!(hard.term, 3);
        assert_eq!(hard.voted_for, Some(NodeId(1)));
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2], entry(3, 3));
    }

    #[test]
    fn rewrite_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let storage = RaftStorage::open(dir.path()).unwrap();
        storage
            .append_entries(&[entry(1, 1), entry(1, 2), entry(1, 3)])
            .unwrap();
        storage.rewrite_log(&[entry(1, 1), entry(2, 2)]).unwrap();
        let (_, entries, _) = storage.load().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].term, 2);
    }

    #[test]
    fn snapshot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = RaftStorage::open(dir.path()).unwrap();
        let meta = SnapshotMeta { index: 10, term: 2 };
        storage.save_snapshot(meta, b"snapshot-bytes").unwrap();
        let (_, _, snapshot) = storage.load().unwrap();
        let (loaded_meta, data) = snapshot.unwrap();
        assert_eq!(loaded_meta, meta);
        assert_eq!(data, b"snapshot-bytes");
    }
}
