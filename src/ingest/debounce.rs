// Debounce & Rate Limiting
// Sharded per-path coalescing for filesystem event storms plus a token
// bucket that defers (never drops) overflow. The coalesce window adapts to
// the observed event rate between the configured min and max bounds, and
// `.git` activity collapses into a single pending rescan per root.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::types::RootId;

/// What a coalesced path event amounts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoalescedKind {
    Upsert,
    Delete,
}

#[derive(Debug, Clone)]
struct Pending {
    kind: CoalescedKind,
    root_id: RootId,
    first_seen: Instant,
    last_seen: Instant,
}

/// A ready-to-schedule coalesced event.
#[derive(Debug, Clone)]
pub struct DueEvent {
    pub abs_path: PathBuf,
    pub root_id: RootId,
    pub kind: CoalescedKind,
}

/// Sharded coalesce table. Shard count is fixed at construction; each shard
/// has its own lock so event storms do not contend on one mutex.
pub struct Coalescer {
    shards: Vec<Mutex<HashMap<PathBuf, Pending>>>,
    min_window: Duration,
    max_window: Duration,
    /// Events observed in the current one-second rate window.
    rate: Mutex<(Instant, u32, u32)>,
    /// Roots with pending `.git` burst rescans: root -> last git activity.
    git_pending: Mutex<HashMap<RootId, Instant>>,
    git_debounce: Duration,
}

impl Coalescer {
    pub fn new(shards: usize, min_window_ms: u64, max_window_ms: u64, git_debounce_ms: u64) -> Self {
        let shards = shards.max(1);
        Self {
            shards: (0..shards).map(|_| Mutex::new(HashMap::new())).collect(),
            min_window: Duration::from_millis(min_window_ms),
            max_window: Duration::from_millis(max_window_ms.max(min_window_ms)),
            rate: Mutex::new((Instant::now(), 0, 0)),
            git_pending: Mutex::new(HashMap::new()),
            git_debounce: Duration::from_millis(git_debounce_ms),
        }
    }

    fn shard_for(&self, path: &PathBuf) -> &Mutex<HashMap<PathBuf, Pending>> {
        let hash = xxhash_rust::xxh3::xxh3_64(path.to_string_lossy().as_bytes());
        &self.shards[(hash % self.shards.len() as u64) as usize]
    }

    fn bump_rate(&self) -> u32 {
        let mut rate = self.rate.lock();
        let (window_start, current, last) = *rate;
        if window_start.elapsed() >= Duration::from_secs(1) {
            *rate = (Instant::now(), 1, current);
            current
        } else {
            *rate = (window_start, current + 1, last);
            last
        }
    }

    /// Current adaptive window: scales with the last full second's event
    /// count, clamped into [min, max].
    pub fn window(&self) -> Duration {
        let last_rate = {
            let rate = self.rate.lock();
            rate.2
        };
        // 100+ events/sec pushes the window to max.
        let t = (last_rate as f64 / 100.0).min(1.0);
        let min = self.min_window.as_millis() as f64;
        let max = self.max_window.as_millis() as f64;
        Duration::from_millis((min + (max - min) * t) as u64)
    }

    /// Record one filesystem event. `.git` paths collapse into a pending
    /// root rescan instead of individual entries.
    pub fn record(&self, root_id: RootId, abs_path: PathBuf, kind: CoalescedKind) {
        self.bump_rate();

        if abs_path
            .components()
            .any(|c| c.as_os_str() == ".git")
        {
            self.git_pending.lock().insert(root_id, Instant::now());
            return;
        }

        let now = Instant::now();
        let mut shard = self.shard_for(&abs_path).lock();
        shard
            .entry(abs_path)
            .and_modify(|pending| {
                pending.last_seen = now;
                // A delete after writes wins; a write after delete means the
                // path is back.
                pending.kind = kind;
            })
            .or_insert(Pending {
                kind,
                root_id,
                first_seen: now,
                last_seen: now,
            });
    }

    /// Drain events whose quiet period has elapsed.
    pub fn drain_due(&self) -> Vec<DueEvent> {
        let window = self.window();
        let now = Instant::now();
        let mut due = Vec::new();
        for shard in &self.shards {
            let mut shard = shard.lock();
            let ready: Vec<PathBuf> = shard
                .iter()
                .filter(|(_, p)| {
                    now.duration_since(p.last_seen) >= window
                        // A path updated continuously still flushes at 4x max.
                        || now.duration_since(p.first_seen) >= self.max_window * 4
                })
                .map(|(path, _)| path.clone())
                .collect();
            for path in ready {
                if let Some(pending) = shard.remove(&path) {
                    due.push(DueEvent {
                        abs_path: path,
                        root_id: pending.root_id,
                        kind: pending.kind,
                    });
                }
            }
        }
        due
    }

    /// Roots whose `.git` activity has settled: one rescan each.
    pub fn drain_git_rescans(&self) -> Vec<RootId> {
        let now = Instant::now();
        let mut pending = self.git_pending.lock();
        let ready: Vec<RootId> = pending
            .iter()
            .filter(|(_, last)| now.duration_since(**last) >= self.git_debounce)
            .map(|(root, _)| root.clone())
            .collect();
        for root in &ready {
            pending.remove(root);
        }
        ready
    }

    pub fn pending_len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }
}

/// Token bucket rate limiter. Overflow defers: the caller keeps its work
/// queued and retries on the next tick.
pub struct TokenBucket {
    capacity: f64,
    tokens: Mutex<(f64, Instant)>,
    refill_per_sec: f64,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_per_sec: u32) -> Self {
        Self {
            capacity: capacity.max(1) as f64,
            tokens: Mutex::new((capacity.max(1) as f64, Instant::now())),
            refill_per_sec: refill_per_sec.max(1) as f64,
        }
    }

    /// Take one token if available.
    pub fn try_take(&self) -> bool {
        let mut state = self.tokens.lock();
        let (tokens, last_refill) = *state;
        let refilled = (tokens + last_refill.elapsed().as_secs_f64() * self.refill_per_sec)
            .min(self.capacity);
        if refilled >= 1.0 {
            *state = (refilled - 1.0, Instant::now());
            true
        } else {
            *state = (refilled, Instant::now());
            false
        }
    }
}
