// Retry Scheduler
// Re-enqueues failed ingest tasks when their backoff expires (1m, 5m, then
// hourly). Items that keep failing stay in the queue for the doctor to
// surface; nothing is silently discarded.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::ingest::queue::{IngestTask, PRIORITY_RETRY};
use crate::ingest::PipelineHandle;
use crate::store::Store;
use crate::workspace::WorkspaceManager;

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Spawn the background sweep that requeues due failed tasks.
pub fn spawn_retry_task(
    store: Arc<Store>,
    workspace: Arc<WorkspaceManager>,
    handle: PipelineHandle,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if handle.is_shutdown() {
                break;
            }
            let due = store.due_failed_tasks(Utc::now().timestamp());
            for task in due {
                let Some(root) = workspace.get(&task.doc_id.root_id()) else {
                    continue;
                };
                let abs_path: PathBuf = root.real_path.join(task.doc_id.rel_path());
                tracing::debug!(
                    doc_id = %task.doc_id,
                    attempts = task.attempts,
                    "retrying failed ingest"
                );
                handle.push(
                    IngestTask::Upsert {
                        doc_id: task.doc_id,
                        abs_path,
                    },
                    PRIORITY_RETRY,
                );
            }
        }
    })
}
