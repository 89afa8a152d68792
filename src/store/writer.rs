// Store Writer Task
// The one task allowed to mutate the store. Requests arrive over a bounded
// channel and are grouped into WAL commit batches; under read pressure the
// writer shrinks its batches and yields between commits so search latency
// wins over ingest throughput. While idle it checkpoints the WAL and runs
// tombstone GC.

use anyhow::{anyhow, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use crate::store::wal::WalEntry;
use crate::store::Store;

const WRITE_QUEUE_CAPACITY: usize = 1024;

struct WriteRequest {
    entries: Vec<WalEntry>,
    done: oneshot::Sender<Result<()>>,
}

/// Cloneable handle for enqueueing mutations onto the writer task.
///
/// This is the only write path exposed to the rest of the system; holding a
/// handle does not grant direct table access.
#[derive(Clone, Debug)]
pub struct WriterHandle {
    tx: mpsc::Sender<WriteRequest>,
}

impl WriterHandle {
    /// Enqueue a commit group and wait for durability.
    pub async fn commit(&self, entries: Vec<WalEntry>) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(WriteRequest { entries, done })
            .await
            .map_err(|_| anyhow!("store writer has shut down"))?;
        rx.await.map_err(|_| anyhow!("store writer dropped request"))?
    }

    /// Fire-and-forget commit for paths where the caller cannot wait
    /// (e.g. demoted deletion warnings).
    pub fn commit_detached(&self, entries: Vec<WalEntry>) {
        let (done, _rx) = oneshot::channel();
        if self.tx.try_send(WriteRequest { entries, done }).is_err() {
            tracing::warn!("store writer queue full, detached commit dropped");
        }
    }
}

/// Spawn the writer task. Fails immediately if a writer already owns the
/// store's token, so a second pipeline instance cannot start writing.
pub fn spawn_writer(store: Arc<Store>) -> Result<(WriterHandle, tokio::task::JoinHandle<()>)> {
    let token = store.take_writer_token()?;
    let (tx, rx) = mpsc::channel(WRITE_QUEUE_CAPACITY);
    let handle = WriterHandle { tx };
    let join = tokio::spawn(writer_loop(store, token, rx));
    Ok((handle, join))
}

async fn writer_loop(
    store: Arc<Store>,
    token: crate::store::WriterToken,
    mut rx: mpsc::Receiver<WriteRequest>,
) {
    let idle_after = Duration::from_secs(store.config().idle_checkpoint_secs);
    let gc_grace = store.config().gc_grace_secs;
    let max_batch = store.config().commit_batch_size;
    let mut dirty = false;

    loop {
        let first = match tokio::time::timeout(idle_after, rx.recv()).await {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(_) => {
                // Idle: passive checkpoint plus GC, never on the hot path.
                if dirty {
                    let cutoff = Utc::now().timestamp() - gc_grace;
                    let stats = store.stats();
                    let housekeeping = vec![
                        WalEntry::GcTombstones { older_than: cutoff },
                        WalEntry::SetEngineState {
                            key: "doc_count".to_string(),
                            value: stats.file_count.to_string(),
                        },
                        WalEntry::SetEngineState {
                            key: "last_commit_ts".to_string(),
                            value: Utc::now().timestamp().to_string(),
                        },
                    ];
                    if let Err(err) = store.commit(&token, housekeeping) {
                        tracing::warn!(error = %err, "idle housekeeping failed");
                    }
                    match store.checkpoint(&token) {
                        Ok(()) => dirty = false,
                        Err(err) => tracing::warn!(error = %err, "idle checkpoint failed"),
                    }
                }
                continue;
            }
        };

        // Read-priority policy: a loaded read side halves the batch and
        // makes the writer yield between commits.
        let pressure = store.read_pressure();
        let batch_cap = if pressure > 0 {
            (max_batch / 2).max(1)
        } else {
            max_batch
        };

        let mut requests = vec![first];
        while requests.len() < batch_cap {
            match rx.try_recv() {
                Ok(request) => requests.push(request),
                Err(_) => break,
            }
        }

        let entries: Vec<WalEntry> = requests
            .iter()
            .flat_map(|r| r.entries.iter().cloned())
            .collect();
        let outcome = store.commit(&token, entries);
        dirty = dirty || outcome.is_ok();

        match outcome {
            Ok(()) => {
                crate::observability::record(crate::observability::Counter::IndexCommits);
                for request in requests {
                    let _ = request.done.send(Ok(()));
                }
            }
            Err(err) => {
                // The whole batch rolled back; every enqueued request
                // learns about it so the orchestrator can file retries.
                tracing::error!(error = %err, "store commit failed, batch rolled back");
                let message = err.to_string();
                for request in requests {
                    let _ = request.done.send(Err(anyhow!("{message}")));
                }
            }
        }

        if pressure > 0 {
            tokio::task::yield_now().await;
        }
    }

    // No exit-time checkpoint: every commit is already WAL-durable, and a
    // successor process folds the log on its own idle cycle.
    drop(token);
    tracing::debug!("store writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::store::records::FileRecord;
    use crate::types::{DocId, ParseReason, ParseStatus, RootId};

    fn sample_file(doc_id: &DocId) -> FileRecord {
        FileRecord {
            doc_id: doc_id.clone(),
            root_id: doc_id.root_id(),
            repo: doc_id.repo().to_string(),
            mtime: 1,
            size: 0,
            content: None,
            content_compressed: false,
            content_hash: 0,
            parse_status: ParseStatus::Skipped,
            parse_reason: ParseReason::NoParse,
            ast_status: ParseStatus::Skipped,
            ast_reason: ParseReason::NoParse,
            is_binary: false,
            sampled: false,
            last_seen: 1,
            deleted_ts: None,
        }
    }

    #[tokio::test]
    async fn test_writer_commits_and_second_writer_is_rejected() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let store = Store::open(dir.path(), StoreConfig::default()).expect("open");
        let (handle, _join) = spawn_writer(store.clone()).expect("spawn writer");

        // A second writer violates the single-writer invariant.
        let second = spawn_writer(store.clone());
        assert!(second.is_err());

        let root = RootId::parse("00112233aabbccdd").expect("root");
        let doc_id = DocId::new(&root, "a.py").expect("doc");
        handle
            .commit(vec![WalEntry::UpsertFile {
                file: Box::new(sample_file(&doc_id)),
            }])
            .await
            .expect("commit");
        assert_eq!(store.stats().file_count, 1);
    }

    #[tokio::test]
    async fn test_concurrent_commits_serialize() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let store = Store::open(dir.path(), StoreConfig::default()).expect("open");
        let (handle, _join) = spawn_writer(store.clone()).expect("spawn writer");
        let root = RootId::parse("00112233aabbccdd").expect("root");

        let mut tasks = Vec::new();
        for i in 0..20 {
            let handle = handle.clone();
            let doc_id = DocId::new(&root, &format!("f{i}.py")).expect("doc");
            tasks.push(tokio::spawn(async move {
                handle
                    .commit(vec![WalEntry::UpsertFile {
                        file: Box::new(sample_file(&doc_id)),
                    }])
                    .await
            }));
        }
        for task in tasks {
            task.await.expect("join").expect("commit");
        }
        assert_eq!(store.stats().file_count, 20);
    }
}
