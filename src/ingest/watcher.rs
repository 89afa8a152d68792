// Filesystem Watcher
// Bridges platform-native notify events onto the bounded event bus. Events
// for paths outside every attached root are dropped at the source; the
// notify callback thread blocks when the bus is full, which is the first
// backpressure stage of the pipeline.

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::types::RootId;
use crate::workspace::WorkspaceManager;

/// One filesystem event on the bus.
#[derive(Debug, Clone)]
pub enum FsEvent {
    Changed { root_id: RootId, abs_path: PathBuf },
    Removed { root_id: RootId, abs_path: PathBuf },
}

/// Owns the native watcher; dropping it stops event delivery.
pub struct FsWatcher {
    watcher: RecommendedWatcher,
}

impl FsWatcher {
    /// Start watching every active root, delivering events onto `bus`.
    pub fn spawn(
        workspace: Arc<WorkspaceManager>,
        bus: mpsc::Sender<FsEvent>,
    ) -> Result<Self> {
        let routing = Arc::clone(&workspace);
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            let event = match result {
                Ok(event) => event,
                Err(err) => {
                    tracing::warn!(error = %err, "watch error");
                    return;
                }
            };
            let removed = matches!(event.kind, EventKind::Remove(_));
            if !matches!(
                event.kind,
                EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
            ) {
                return;
            }
            for path in event.paths {
                let Some(root) = routing.containing_root(&path) else {
                    continue;
                };
                let fs_event = if removed {
                    FsEvent::Removed {
                        root_id: root.root_id,
                        abs_path: path,
                    }
                } else {
                    FsEvent::Changed {
                        root_id: root.root_id,
                        abs_path: path,
                    }
                };
                // Full bus blocks the notify thread: upstream backpressure.
                if bus.blocking_send(fs_event).is_err() {
                    return;
                }
            }
        })
        .context("failed to create filesystem watcher")?;

        for root in workspace.active() {
            watcher
                .watch(&root.real_path, RecursiveMode::Recursive)
                .with_context(|| format!("failed to watch {}", root.real_path.display()))?;
        }

        Ok(Self { watcher })
    }

    /// Start watching a root attached after startup.
    pub fn watch_root(&mut self, path: &std::path::Path) -> Result<()> {
        self.watcher
            .watch(path, RecursiveMode::Recursive)
            .with_context(|| format!("failed to watch {}", path.display()))
    }

    pub fn unwatch_root(&mut self, path: &std::path::Path) -> Result<()> {
        self.watcher
            .unwatch(path)
            .with_context(|| format!("failed to unwatch {}", path.display()))
    }
}
