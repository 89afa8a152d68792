// Ingest Pipeline
// Wires watcher → event bus → debounce/coalesce → token bucket → priority
// queue → parse workers → orchestrator → store + text index. Per-doc
// ordering is guaranteed by the single store writer; across docs there is
// no global order. Backpressure: a full bus blocks the watcher thread, a
// saturated queue pauses scheduling until the low watermark.

pub mod collector;
pub mod debounce;
pub mod loader;
pub mod orchestrator;
pub mod queue;
pub mod retry;
pub mod validator;
pub mod watcher;

pub use orchestrator::Orchestrator;
pub use validator::IngestDocument;

use anyhow::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

use crate::config::SariConfig;
use crate::parser::ParserRegistry;
use crate::store::writer::WriterHandle;
use crate::store::Store;
use crate::text_index::TextIndexEngine;
use crate::types::RootId;
use crate::workspace::WorkspaceManager;
use debounce::{Coalescer, CoalescedKind, DueEvent, TokenBucket};
use queue::{IngestTask, WorkQueue, PRIORITY_RESCAN, PRIORITY_WATCHER};
use watcher::{FsEvent, FsWatcher};

const SCHEDULER_TICK: Duration = Duration::from_millis(50);
const WORKER_IDLE_WAIT: Duration = Duration::from_millis(200);
const WORKER_CAP: usize = 8;
/// In-flight reads beyond which parse workers back off.
const READ_PRESSURE_THRESHOLD: u64 = 4;

/// Cheap cloneable handle for enqueueing work and checking pipeline state.
#[derive(Clone)]
pub struct PipelineHandle {
    queue: Arc<Mutex<WorkQueue>>,
    wake: Arc<Notify>,
    shutdown: Arc<AtomicBool>,
}

impl PipelineHandle {
    pub fn push(&self, task: IngestTask, priority: u8) {
        self.queue.lock().push(task, priority);
        self.wake.notify_one();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_saturated(&self) -> bool {
        self.queue.lock().is_saturated()
    }
}

/// Snapshot of pipeline health for status/doctor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStatus {
    pub queue_depth: usize,
    pub saturated: bool,
    pub pending_coalesce: usize,
    pub workers: usize,
}

pub struct IngestPipeline {
    handle: PipelineHandle,
    orchestrator: Arc<Orchestrator>,
    coalescer: Arc<Coalescer>,
    workers: usize,
    _watcher: Option<FsWatcher>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    text_index: Arc<TextIndexEngine>,
}

impl IngestPipeline {
    /// Start all pipeline tasks. `watch` controls whether the native
    /// filesystem watcher runs (off for one-shot scans).
    pub fn start(
        config: Arc<SariConfig>,
        store: Arc<Store>,
        writer: WriterHandle,
        text_index: Arc<TextIndexEngine>,
        workspace: Arc<WorkspaceManager>,
        parsers: Arc<ParserRegistry>,
        watch: bool,
    ) -> Result<Self> {
        let queue = Arc::new(Mutex::new(WorkQueue::new(
            config.watcher.queue_high_water,
            config.watcher.queue_low_water,
        )));
        let wake = Arc::new(Notify::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = PipelineHandle {
            queue,
            wake,
            shutdown,
        };

        let coalescer = Arc::new(Coalescer::new(
            config.watcher.coalesce_shards,
            config.watcher.debounce_min_ms,
            config.watcher.debounce_max_ms,
            config.watcher.git_checkout_debounce_ms,
        ));
        let bucket = Arc::new(TokenBucket::new(
            config.watcher.token_bucket_capacity,
            config.watcher.token_refill_per_sec,
        ));

        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            writer,
            text_index.clone(),
            parsers,
            workspace.clone(),
            config.clone(),
        ));

        let mut tasks = Vec::new();

        // Watcher → bus → coalescer.
        let fs_watcher = if watch {
            let (bus_tx, bus_rx) = mpsc::channel::<FsEvent>(config.watcher.event_bus_capacity);
            let fs_watcher = FsWatcher::spawn(workspace.clone(), bus_tx)?;
            tasks.push(Self::spawn_bus_consumer(
                bus_rx,
                coalescer.clone(),
                handle.clone(),
            ));
            Some(fs_watcher)
        } else {
            None
        };

        tasks.push(Self::spawn_scheduler(
            coalescer.clone(),
            bucket,
            handle.clone(),
            workspace.clone(),
        ));

        let workers = num_cpus::get().saturating_sub(2).clamp(1, WORKER_CAP);
        for worker_id in 0..workers {
            tasks.push(Self::spawn_worker(
                worker_id,
                handle.clone(),
                orchestrator.clone(),
                store.clone(),
            ));
        }

        tasks.push(retry::spawn_retry_task(
            store,
            workspace,
            handle.clone(),
        ));

        tasks.push(text_index.spawn_reader_reload(config.text_index.reader_reload_ms));

        Ok(Self {
            handle,
            orchestrator,
            coalescer,
            workers,
            _watcher: fs_watcher,
            tasks,
            text_index,
        })
    }

    fn spawn_bus_consumer(
        mut bus_rx: mpsc::Receiver<FsEvent>,
        coalescer: Arc<Coalescer>,
        handle: PipelineHandle,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = bus_rx.recv().await {
                if handle.is_shutdown() {
                    break;
                }
                match event {
                    FsEvent::Changed { root_id, abs_path } => {
                        coalescer.record(root_id, abs_path, CoalescedKind::Upsert)
                    }
                    FsEvent::Removed { root_id, abs_path } => {
                        coalescer.record(root_id, abs_path, CoalescedKind::Delete)
                    }
                }
            }
        })
    }

    fn spawn_scheduler(
        coalescer: Arc<Coalescer>,
        bucket: Arc<TokenBucket>,
        handle: PipelineHandle,
        workspace: Arc<WorkspaceManager>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            // Token-starved events wait here instead of being dropped.
            let mut deferred: VecDeque<DueEvent> = VecDeque::new();
            let mut ticker = tokio::time::interval(SCHEDULER_TICK);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if handle.is_shutdown() {
                    break;
                }

                for root_id in coalescer.drain_git_rescans() {
                    handle.push(IngestTask::Rescan { root_id }, PRIORITY_RESCAN);
                }

                // Saturated queue pauses the collector stage entirely.
                if handle.is_saturated() {
                    continue;
                }

                deferred.extend(coalescer.drain_due());
                while !deferred.is_empty() {
                    if !bucket.try_take() {
                        break;
                    }
                    let Some(event) = deferred.pop_front() else {
                        break;
                    };
                    // Path→doc mapping is pure: it works for removed paths
                    // too, as long as the root is still attached.
                    let Ok(doc_id) = workspace.doc_id_for(&event.abs_path) else {
                        continue;
                    };
                    match event.kind {
                        CoalescedKind::Upsert => handle.push(
                            IngestTask::Upsert {
                                doc_id,
                                abs_path: event.abs_path,
                            },
                            PRIORITY_WATCHER,
                        ),
                        CoalescedKind::Delete => {
                            handle.push(IngestTask::Delete { doc_id }, PRIORITY_WATCHER)
                        }
                    }
                }
            }
        })
    }

    fn spawn_worker(
        worker_id: usize,
        handle: PipelineHandle,
        orchestrator: Arc<Orchestrator>,
        store: Arc<Store>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if handle.is_shutdown() {
                    break;
                }
                // Adaptive downscale: parse workers yield to readers.
                if worker_id > 0 && store.read_pressure() > READ_PRESSURE_THRESHOLD {
                    tokio::time::sleep(WORKER_IDLE_WAIT).await;
                    continue;
                }
                let task = handle.queue.lock().pop();
                match task {
                    Some(task) => {
                        if let Err(err) = orchestrator.process(task).await {
                            tracing::debug!(worker = worker_id, error = %err, "ingest task failed");
                        }
                    }
                    None => {
                        let _ = tokio::time::timeout(WORKER_IDLE_WAIT, handle.wake.notified()).await;
                    }
                }
            }
        })
    }

    pub fn handle(&self) -> PipelineHandle {
        self.handle.clone()
    }

    pub fn orchestrator(&self) -> Arc<Orchestrator> {
        self.orchestrator.clone()
    }

    /// Enqueue a full rescan of a root.
    pub fn enqueue_rescan(&self, root_id: RootId) {
        self.handle
            .push(IngestTask::Rescan { root_id }, PRIORITY_RESCAN);
    }

    /// Synchronous scan of one root, bypassing the queue. Used by
    /// `scan-once` and at session startup.
    pub async fn scan_root_now(&self, root_id: &RootId) -> Result<()> {
        self.orchestrator.rescan_root(root_id).await
    }

    /// Wait until the queue drains (bounded).
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.handle.queue_depth() == 0 {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    pub fn status(&self) -> PipelineStatus {
        PipelineStatus {
            queue_depth: self.handle.queue_depth(),
            saturated: self.handle.is_saturated(),
            pending_coalesce: self.coalescer.pending_len(),
            workers: self.workers,
        }
    }

    /// Stop all tasks and persist the text index.
    pub async fn shutdown(self) {
        self.handle.shutdown.store(true, Ordering::Relaxed);
        self.handle.wake.notify_waiters();
        for task in self.tasks {
            task.abort();
        }
        if let Err(err) = self.text_index.save() {
            tracing::warn!(error = %err, "text index save failed at shutdown");
        }
    }
}
