// Write-Ahead Log
// Append-only JSON-line log of store mutations. A commit group is appended
// and fsynced before the in-memory tables change, so recovery is always
// checkpoint + replay. Checkpointing truncates the log; it only runs from
// the writer task while it is idle.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::store::records::{
    ContextRecord, FailedTask, FileRecord, RelationRecord, RootRecord, SnippetRecord, SymbolRecord,
};
use crate::types::DocId;

/// One durable mutation. The WAL is the unit of replay; every variant must
/// be idempotent when re-applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WalEntry {
    UpsertFile {
        file: Box<FileRecord>,
    },
    ReplaceSymbols {
        doc_id: DocId,
        symbols: Vec<SymbolRecord>,
        relations: Vec<RelationRecord>,
    },
    TombstoneFile {
        doc_id: DocId,
        deleted_ts: i64,
    },
    GcTombstones {
        older_than: i64,
    },
    PutSnippet {
        snippet: Box<SnippetRecord>,
    },
    PutContext {
        context: Box<ContextRecord>,
    },
    PutFailedTask {
        task: FailedTask,
    },
    ClearFailedTask {
        doc_id: DocId,
    },
    PutRoot {
        root: Box<RootRecord>,
    },
    SetEngineState {
        key: String,
        value: String,
    },
}

/// Append-only log writer with replay support.
pub struct Wal {
    path: PathBuf,
    file: File,
}

impl Wal {
    /// Open (or create) the log at `<dir>/current.wal`.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create WAL directory {}", dir.display()))?;
        let path = dir.join("current.wal");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)
            .with_context(|| format!("failed to open WAL {}", path.display()))?;
        Ok(Self { path, file })
    }

    /// Append a commit group and fsync. Either every entry of the group is
    /// durable or the caller treats the batch as failed.
    pub fn append_group(&mut self, entries: &[WalEntry]) -> Result<()> {
        let mut buf = Vec::with_capacity(entries.len() * 256);
        for entry in entries {
            serde_json::to_writer(&mut buf, entry).context("failed to serialize WAL entry")?;
            buf.push(b'\n');
        }
        self.file.write_all(&buf).context("failed to append WAL group")?;
        self.file.sync_data().context("failed to fsync WAL")?;
        Ok(())
    }

    /// Replay all entries currently in the log.
    ///
    /// Truncated or corrupt trailing lines (a crash mid-append) are logged
    /// and skipped; everything before them is applied.
    pub fn replay(&self) -> Result<Vec<WalEntry>> {
        let file = File::open(&self.path)
            .with_context(|| format!("failed to reopen WAL {}", self.path.display()))?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line.context("failed to read WAL line")?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<WalEntry>(&line) {
                Ok(entry) => entries.push(entry),
                Err(err) => {
                    tracing::warn!(
                        line = lineno + 1,
                        error = %err,
                        "skipping corrupt WAL line"
                    );
                }
            }
        }
        Ok(entries)
    }

    /// Truncate the log after a successful checkpoint.
    pub fn reset(&mut self) -> Result<()> {
        self.file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .read(true)
            .open(&self.path)
            .with_context(|| format!("failed to truncate WAL {}", self.path.display()))?;
        self.file.sync_data().context("failed to fsync truncated WAL")?;
        Ok(())
    }

    /// Current size in bytes, for doctor reports.
    pub fn size_bytes(&self) -> u64 {
        std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_replay() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let mut wal = Wal::open(dir.path()).expect("open wal");
        wal.append_group(&[
            WalEntry::SetEngineState {
                key: "doc_count".to_string(),
                value: "3".to_string(),
            },
            WalEntry::GcTombstones { older_than: 100 },
        ])
        .expect("append");

        let entries = wal.replay().expect("replay");
        assert_eq!(entries.len(), 2);
        assert!(matches!(entries[0], WalEntry::SetEngineState { .. }));
    }

    #[test]
    fn test_corrupt_tail_is_skipped() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let mut wal = Wal::open(dir.path()).expect("open wal");
        wal.append_group(&[WalEntry::GcTombstones { older_than: 1 }])
            .expect("append");

        // Simulate a crash mid-append.
        use std::io::Write as _;
        let mut raw = OpenOptions::new()
            .append(true)
            .open(dir.path().join("current.wal"))
            .expect("open raw");
        raw.write_all(b"{\"op\":\"gc_tomb").expect("write partial");
        drop(raw);

        let entries = wal.replay().expect("replay");
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_reset_empties_log() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let mut wal = Wal::open(dir.path()).expect("open wal");
        wal.append_group(&[WalEntry::GcTombstones { older_than: 1 }])
            .expect("append");
        wal.reset().expect("reset");
        assert!(wal.replay().expect("replay").is_empty());
    }
}
