// Workspace Sessions
// Per-workspace session state behind the gateway. Handlers acquire a
// session on entry and release on every exit path via the RAII guard; a
// session reaching zero refs is torn down only after a grace window, and
// an all-idle daemon (past the idle TTL) asks the controller for a
// graceful stop unless an inhibit is held.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::types::RootId;

/// State for one attached workspace.
pub struct SessionState {
    pub key: String,
    pub root_id: RootId,
    refcount: AtomicI64,
    last_active: Mutex<Instant>,
    teardown_at: Mutex<Option<Instant>>,
    /// Monotonic read budget counters, shared by the read gate.
    pub reads: AtomicU64,
    pub read_lines: AtomicU64,
}

impl SessionState {
    pub fn refcount(&self) -> i64 {
        self.refcount.load(Ordering::SeqCst)
    }

    pub fn idle_for(&self) -> Duration {
        self.last_active.lock().elapsed()
    }

    pub fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }
}

/// RAII acquisition: dropping the guard releases the session.
pub struct SessionGuard {
    session: Arc<SessionState>,
    manager: Arc<SessionManager>,
}

impl SessionGuard {
    pub fn session(&self) -> &Arc<SessionState> {
        &self.session
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.manager.release(&self.session);
    }
}

pub struct SessionManager {
    sessions: DashMap<String, Arc<SessionState>>,
    grace: Duration,
    idle_ttl: Duration,
    /// Lifecycle inhibit holds (e.g. an upgrade in flight) block idle stop.
    inhibits: AtomicU64,
}

impl SessionManager {
    pub fn new(grace_secs: u64, idle_sec: u64) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            grace: Duration::from_secs(grace_secs),
            idle_ttl: Duration::from_secs(idle_sec),
            inhibits: AtomicU64::new(0),
        })
    }

    /// Acquire (creating on first use) the session for a workspace key.
    pub fn acquire(self: &Arc<Self>, key: &str, root_id: &RootId) -> SessionGuard {
        let session = {
            let entry = self.sessions.entry(key.to_string()).or_insert_with(|| {
                tracing::info!(workspace = key, "workspace session created");
                Arc::new(SessionState {
                    key: key.to_string(),
                    root_id: root_id.clone(),
                    refcount: AtomicI64::new(0),
                    last_active: Mutex::new(Instant::now()),
                    teardown_at: Mutex::new(None),
                    reads: AtomicU64::new(0),
                    read_lines: AtomicU64::new(0),
                })
            });
            Arc::clone(entry.value())
        };
        session.refcount.fetch_add(1, Ordering::SeqCst);
        session.touch();
        // Any acquisition cancels a pending teardown.
        *session.teardown_at.lock() = None;
        SessionGuard {
            session,
            manager: Arc::clone(self),
        }
    }

    fn release(&self, session: &Arc<SessionState>) {
        let remaining = session.refcount.fetch_sub(1, Ordering::SeqCst) - 1;
        session.touch();
        if remaining <= 0 {
            // Zero refs schedules teardown after the grace window, never
            // immediately.
            *session.teardown_at.lock() = Some(Instant::now() + self.grace);
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<SessionState>> {
        self.sessions.get(key).map(|s| Arc::clone(s.value()))
    }

    pub fn list(&self) -> Vec<Arc<SessionState>> {
        self.sessions
            .iter()
            .map(|s| Arc::clone(s.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Sessions whose grace window expired with zero refs. The caller
    /// tears down their indexer substructure and forgets them.
    pub fn take_expired(&self) -> Vec<Arc<SessionState>> {
        let now = Instant::now();
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| {
                entry.refcount() <= 0
                    && matches!(*entry.teardown_at.lock(), Some(deadline) if deadline <= now)
            })
            .map(|entry| entry.key.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|key| self.sessions.remove(&key).map(|(_, s)| s))
            .collect()
    }

    /// Hold/release a lifecycle inhibit (upgrade in flight, maintenance).
    pub fn inhibit(&self) -> InhibitGuard<'_> {
        self.inhibits.fetch_add(1, Ordering::SeqCst);
        InhibitGuard { manager: self }
    }

    pub fn is_inhibited(&self) -> bool {
        self.inhibits.load(Ordering::SeqCst) > 0
    }

    /// Daemon-wide idle test: every session idle past the TTL (or no
    /// sessions at all), no inhibits held.
    pub fn all_idle(&self) -> bool {
        if self.is_inhibited() {
            return false;
        }
        self.sessions
            .iter()
            .all(|s| s.refcount() <= 0 && s.idle_for() >= self.idle_ttl)
    }
}

pub struct InhibitGuard<'a> {
    manager: &'a SessionManager,
}

impl Drop for InhibitGuard<'_> {
    fn drop(&mut self) {
        self.manager.inhibits.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root_id() -> RootId {
        RootId::parse("00112233aabbccdd").expect("root id")
    }

    #[test]
    fn test_refcount_and_grace_teardown() {
        let manager = SessionManager::new(0, 600);
        {
            let _guard = manager.acquire("/w", &root_id());
            let _second = manager.acquire("/w", &root_id());
            assert_eq!(manager.get("/w").expect("session").refcount(), 2);
            // Held sessions never expire.
            assert!(manager.take_expired().is_empty());
        }
        // Zero refs + zero grace: the sweep may collect it now.
        let expired = manager.take_expired();
        assert_eq!(expired.len(), 1);
        assert!(manager.is_empty());
    }

    #[test]
    fn test_reacquire_cancels_pending_teardown() {
        let manager = SessionManager::new(0, 600);
        drop(manager.acquire("/w", &root_id()));
        // Re-acquired before the sweep: teardown is cancelled.
        let _guard = manager.acquire("/w", &root_id());
        assert!(manager.take_expired().is_empty());
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_idle_requires_no_inhibit() {
        let manager = SessionManager::new(0, 0);
        drop(manager.acquire("/w", &root_id()));
        assert!(manager.all_idle());
        {
            let _hold = manager.inhibit();
            assert!(!manager.all_idle());
        }
        assert!(manager.all_idle());
    }

    #[test]
    fn test_idle_ttl_holds_recent_sessions() {
        let manager = SessionManager::new(30, 600);
        drop(manager.acquire("/w", &root_id()));
        // Recently active: not idle yet.
        assert!(!manager.all_idle());
    }
}
