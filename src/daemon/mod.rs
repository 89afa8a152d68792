// Daemon Controller
// Owns lifecycle state through one serialized event queue: lease traffic,
// connection closes, heartbeat ticks, and shutdown requests all funnel into
// a single consumer that drives the suicide state machine
// (idle | grace | stopping). Shutdown is one-shot and idempotent; grace →
// stopping requires zero leases, an expired deadline, and zero in-flight
// requests.

pub mod gateway;
pub mod lifecycle;
pub mod sessions;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

use crate::daemon::lifecycle::DeploymentManager;
use crate::daemon::sessions::SessionManager;
use crate::types::BootId;

const EVENT_QUEUE_CAPACITY: usize = 256;
/// A lease missing renewals for this many heartbeats is considered lost.
const LEASE_STALE_TICKS: u32 = 3;

/// Lifecycle events, processed strictly in arrival order.
#[derive(Debug)]
pub enum LifecycleEvent {
    LeaseIssue { client_id: String },
    LeaseRenew { client_id: String },
    LeaseRevoke { client_id: String },
    ConnClosed { client_id: String },
    HeartbeatTick,
    ShutdownRequest,
}

/// Suicide state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuicideState {
    Idle,
    Grace { deadline: Instant },
    Stopping,
}

/// RAII marker for an in-flight request.
pub struct InFlightGuard {
    counter: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Cheap handle for submitting lifecycle events.
#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<LifecycleEvent>,
    in_flight: Arc<AtomicU64>,
}

impl ControllerHandle {
    pub fn send(&self, event: LifecycleEvent) {
        if self.tx.try_send(event).is_err() {
            tracing::warn!("lifecycle event queue full, event dropped");
        }
    }

    /// Mark a request in flight for the duration of the returned guard.
    pub fn begin_request(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            counter: self.in_flight.clone(),
        }
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::SeqCst)
    }
}

pub struct DaemonController {
    boot_id: BootId,
    leases: HashMap<String, u32>,
    state: SuicideState,
    grace: Duration,
    in_flight: Arc<AtomicU64>,
    sessions: Arc<SessionManager>,
    deployment: Option<Arc<DeploymentManager>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl DaemonController {
    /// Build the controller plus its handle and the shutdown receiver the
    /// server loop waits on.
    pub fn new(
        boot_id: BootId,
        grace_secs: u64,
        sessions: Arc<SessionManager>,
        deployment: Option<Arc<DeploymentManager>>,
    ) -> (Self, ControllerHandle, mpsc::Receiver<LifecycleEvent>, oneshot::Receiver<()>) {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let in_flight = Arc::new(AtomicU64::new(0));
        let handle = ControllerHandle {
            tx,
            in_flight: in_flight.clone(),
        };
        let controller = Self {
            boot_id,
            leases: HashMap::new(),
            state: SuicideState::Idle,
            grace: Duration::from_secs(grace_secs),
            in_flight,
            sessions,
            deployment,
            shutdown_tx: Some(shutdown_tx),
        };
        (controller, handle, rx, shutdown_rx)
    }

    pub fn state(&self) -> SuicideState {
        self.state
    }

    pub fn lease_count(&self) -> usize {
        self.leases.len()
    }

    /// Consume events until shutdown fires. The heartbeat interval doubles
    /// as the tick source so the state machine advances even when no
    /// client traffic arrives.
    pub async fn run(mut self, mut rx: mpsc::Receiver<LifecycleEvent>, heartbeat_secs: u64) {
        let mut ticker = tokio::time::interval(Duration::from_secs(heartbeat_secs.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            let event = tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                _ = ticker.tick() => LifecycleEvent::HeartbeatTick,
            };
            self.handle_event(event);
            if self.state == SuicideState::Stopping {
                break;
            }
        }
        tracing::info!("daemon controller stopped");
    }

    /// Process one event. Pure state transition; extracted so tests can
    /// drive the machine without the loop.
    pub fn handle_event(&mut self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::LeaseIssue { client_id } => {
                self.leases.insert(client_id, 0);
                // Any lease pulls the daemon out of grace.
                if matches!(self.state, SuicideState::Grace { .. }) {
                    self.state = SuicideState::Idle;
                }
            }
            LifecycleEvent::LeaseRenew { client_id } => {
                if let Some(ticks) = self.leases.get_mut(&client_id) {
                    *ticks = 0;
                }
            }
            LifecycleEvent::LeaseRevoke { client_id }
            | LifecycleEvent::ConnClosed { client_id } => {
                self.leases.remove(&client_id);
                self.evaluate();
            }
            LifecycleEvent::HeartbeatTick => {
                if let Some(deployment) = &self.deployment {
                    if let Err(err) = deployment.heartbeat(&self.boot_id) {
                        tracing::warn!(error = %err, "registry heartbeat failed");
                    }
                }
                // Age out leases whose clients stopped renewing.
                self.leases.retain(|client_id, ticks| {
                    *ticks += 1;
                    let keep = *ticks < LEASE_STALE_TICKS;
                    if !keep {
                        tracing::debug!(client = %client_id, "lease expired without renewal");
                    }
                    keep
                });
                self.evaluate();
            }
            LifecycleEvent::ShutdownRequest => {
                self.trigger_shutdown("shutdown requested");
            }
        }
    }

    fn evaluate(&mut self) {
        match self.state {
            SuicideState::Idle => {
                if self.leases.is_empty() && self.sessions.all_idle() {
                    self.state = SuicideState::Grace {
                        deadline: Instant::now() + self.grace,
                    };
                    tracing::debug!(grace_secs = self.grace.as_secs(), "entering grace period");
                }
            }
            SuicideState::Grace { deadline } => {
                if !self.leases.is_empty() || !self.sessions.all_idle() {
                    self.state = SuicideState::Idle;
                } else if deadline <= Instant::now()
                    && self.in_flight.load(Ordering::SeqCst) == 0
                {
                    self.trigger_shutdown("idle past grace with zero leases");
                }
            }
            SuicideState::Stopping => {}
        }
    }

    /// One-shot, idempotent.
    fn trigger_shutdown(&mut self, reason: &str) {
        if self.state == SuicideState::Stopping {
            return;
        }
        self.state = SuicideState::Stopping;
        tracing::info!(reason, "daemon stopping");
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(grace_secs: u64, idle_sec: u64) -> (DaemonController, ControllerHandle) {
        let sessions = SessionManager::new(0, idle_sec);
        let (controller, handle, _rx, _shutdown) =
            DaemonController::new(BootId::generate(), grace_secs, sessions, None);
        (controller, handle)
    }

    #[test]
    fn test_lease_blocks_grace() {
        let (mut controller, _handle) = controller(0, 0);
        controller.handle_event(LifecycleEvent::LeaseIssue {
            client_id: "c1".to_string(),
        });
        controller.handle_event(LifecycleEvent::HeartbeatTick);
        assert_eq!(controller.state(), SuicideState::Idle);
        assert_eq!(controller.lease_count(), 1);
    }

    #[test]
    fn test_zero_leases_then_grace_then_stop() {
        let (mut controller, _handle) = controller(0, 0);
        controller.handle_event(LifecycleEvent::LeaseIssue {
            client_id: "c1".to_string(),
        });
        controller.handle_event(LifecycleEvent::ConnClosed {
            client_id: "c1".to_string(),
        });
        assert!(matches!(controller.state(), SuicideState::Grace { .. }));
        // Next tick: deadline (zero grace) passed, nothing in flight.
        controller.handle_event(LifecycleEvent::HeartbeatTick);
        assert_eq!(controller.state(), SuicideState::Stopping);
    }

    #[test]
    fn test_new_lease_cancels_grace() {
        let (mut controller, _handle) = controller(3600, 0);
        controller.handle_event(LifecycleEvent::HeartbeatTick);
        assert!(matches!(controller.state(), SuicideState::Grace { .. }));
        controller.handle_event(LifecycleEvent::LeaseIssue {
            client_id: "c2".to_string(),
        });
        assert_eq!(controller.state(), SuicideState::Idle);
    }

    #[test]
    fn test_in_flight_blocks_stop() {
        let (mut controller, handle) = controller(0, 0);
        let guard = handle.begin_request();
        controller.handle_event(LifecycleEvent::HeartbeatTick);
        controller.handle_event(LifecycleEvent::HeartbeatTick);
        assert!(matches!(controller.state(), SuicideState::Grace { .. }));
        drop(guard);
        controller.handle_event(LifecycleEvent::HeartbeatTick);
        assert_eq!(controller.state(), SuicideState::Stopping);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let (mut controller, _handle) = controller(60, 600);
        controller.handle_event(LifecycleEvent::ShutdownRequest);
        assert_eq!(controller.state(), SuicideState::Stopping);
        // A second request is a no-op, not a panic on the spent channel.
        controller.handle_event(LifecycleEvent::ShutdownRequest);
        assert_eq!(controller.state(), SuicideState::Stopping);
    }

    #[test]
    fn test_stale_leases_age_out() {
        let (mut controller, _handle) = controller(0, 0);
        controller.handle_event(LifecycleEvent::LeaseIssue {
            client_id: "quiet".to_string(),
        });
        for _ in 0..LEASE_STALE_TICKS {
            controller.handle_event(LifecycleEvent::HeartbeatTick);
        }
        assert_eq!(controller.lease_count(), 0);
    }
}
