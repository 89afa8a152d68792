// Work Queue
// Priority-aged queue with weighted-fair scheduling across roots. Within a
// root, items pop by (priority, enqueue order); an item that has waited past
// the starvation threshold is served ahead of higher-priority newcomers.
// Across roots, a weighted round-robin cursor keeps one busy root from
// starving the others. High/low watermarks drive collector backpressure
// with hysteresis.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::types::{DocId, RootId};

/// Default seconds after which a waiting item preempts priority order.
const STARVATION_SECS: u64 = 30;

/// Task priorities, lower value = more urgent.
pub const PRIORITY_INTERACTIVE: u8 = 0;
pub const PRIORITY_WATCHER: u8 = 1;
pub const PRIORITY_RESCAN: u8 = 2;
pub const PRIORITY_RETRY: u8 = 3;

/// One unit of ingest work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestTask {
    /// (Re)index a path.
    Upsert { doc_id: DocId, abs_path: std::path::PathBuf },
    /// Remove a document.
    Delete { doc_id: DocId },
    /// Full reconcile of a root.
    Rescan { root_id: RootId },
}

impl IngestTask {
    pub fn root_id(&self) -> RootId {
        match self {
            IngestTask::Upsert { doc_id, .. } | IngestTask::Delete { doc_id } => doc_id.root_id(),
            IngestTask::Rescan { root_id } => root_id.clone(),
        }
    }
}

#[derive(Debug)]
struct Queued {
    task: IngestTask,
    enqueued: Instant,
}

#[derive(Default)]
struct RootQueue {
    /// (priority, seq) -> item; first entry is the priority pick.
    by_priority: BTreeMap<(u8, u64), Queued>,
    /// seq -> (priority, seq); first entry is the oldest item.
    by_age: BTreeMap<u64, (u8, u64)>,
    weight: u32,
}

/// The ingest work queue.
pub struct WorkQueue {
    roots: BTreeMap<RootId, RootQueue>,
    seq: u64,
    len: usize,
    high_water: usize,
    low_water: usize,
    saturated: bool,
    starvation: Duration,
    /// Round-robin state: last served root and how many items it got in
    /// its current turn.
    cursor: Option<(RootId, u32)>,
}

impl WorkQueue {
    pub fn new(high_water: usize, low_water: usize) -> Self {
        Self {
            roots: BTreeMap::new(),
            seq: 0,
            len: 0,
            high_water,
            low_water,
            saturated: false,
            starvation: Duration::from_secs(STARVATION_SECS),
            cursor: None,
        }
    }

    #[cfg(test)]
    fn with_starvation(mut self, starvation: Duration) -> Self {
        self.starvation = starvation;
        self
    }

    /// Set a root's fair-share weight (default 1).
    pub fn set_weight(&mut self, root_id: &RootId, weight: u32) {
        self.roots.entry(root_id.clone()).or_default().weight = weight.max(1);
    }

    pub fn push(&mut self, task: IngestTask, priority: u8) {
        let root_id = task.root_id();
        let seq = self.seq;
        self.seq += 1;
        let queue = self.roots.entry(root_id).or_default();
        queue.by_priority.insert(
            (priority, seq),
            Queued {
                task,
                enqueued: Instant::now(),
            },
        );
        queue.by_age.insert(seq, (priority, seq));
        self.len += 1;
        if self.len >= self.high_water {
            self.saturated = true;
        }
    }

    /// Pop the next task under fair scheduling, or None when empty.
    pub fn pop(&mut self) -> Option<IngestTask> {
        if self.len == 0 {
            return None;
        }

        let root_id = self.pick_root()?;
        let queue = self.roots.get_mut(&root_id)?;

        // Anti-starvation: the oldest item wins when it has waited too long.
        let starved_key = queue
            .by_age
            .values()
            .next()
            .copied()
            .filter(|key| {
                queue
                    .by_priority
                    .get(key)
                    .is_some_and(|q| q.enqueued.elapsed() >= self.starvation)
            });
        let key = match starved_key {
            Some(key) => key,
            None => *queue.by_priority.keys().next()?,
        };

        let queued = queue.by_priority.remove(&key)?;
        queue.by_age.remove(&key.1);
        self.len -= 1;
        if self.len <= self.low_water {
            self.saturated = false;
        }
        Some(queued.task)
    }

    /// Weighted round-robin root selection.
    fn pick_root(&mut self) -> Option<RootId> {
        let non_empty: Vec<(&RootId, u32)> = self
            .roots
            .iter()
            .filter(|(_, q)| !q.by_priority.is_empty())
            .map(|(id, q)| (id, q.weight.max(1)))
            .collect();
        if non_empty.is_empty() {
            return None;
        }

        // Continue the current root's turn while it has budget and work.
        if let Some((current, served)) = self.cursor.clone() {
            if let Some((_, weight)) = non_empty.iter().find(|(id, _)| **id == current) {
                if served < *weight {
                    self.cursor = Some((current.clone(), served + 1));
                    return Some(current);
                }
            }
            // Turn over: advance to the next root after `current`.
            let next = non_empty
                .iter()
                .find(|(id, _)| id.as_str() > current.as_str())
                .or_else(|| non_empty.first())
                .map(|(id, _)| (*id).clone());
            if let Some(id) = next {
                self.cursor = Some((id.clone(), 1));
                return Some(id);
            }
        }

        let id = non_empty[0].0.clone();
        self.cursor = Some((id.clone(), 1));
        Some(id)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Backpressure signal with hysteresis: true above high water until
    /// drained below low water.
    pub fn is_saturated(&self) -> bool {
        self.saturated
    }
}
