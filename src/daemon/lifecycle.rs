// Blue/Green Deployment
// Drives the registry's deployment state machine: candidate registration,
// health-gated switch, drain marking, and the 3-strike post-switch
// rollback. Every mutation is generation-gated through the registry, so a
// superseded driver quietly stops affecting the record. Health probing is
// injected as data (probe outcomes), which keeps the state machine fully
// testable without processes.

use anyhow::{bail, Result};
use chrono::Utc;

use crate::config::DaemonConfig;
use crate::registry::{DaemonEntry, DeploymentState, Registry};
use crate::types::BootId;

/// What a starting daemon should do, given the registry state.
#[derive(Debug, Clone, PartialEq)]
pub enum StartupDecision {
    /// No healthy active daemon: we registered as active.
    Registered,
    /// A healthy same-version daemon is active: attach to it.
    Attach { host: String, port: u16 },
    /// Version mismatch or draining active: begin a blue/green replacement.
    Replace { old_boot_id: BootId },
}

pub struct DeploymentManager {
    registry: Registry,
    version: String,
    health_fail_threshold: u32,
}

impl DeploymentManager {
    pub fn new(registry: Registry, version: impl Into<String>, config: &DaemonConfig) -> Self {
        Self {
            registry,
            version: version.into(),
            health_fail_threshold: config.health_fail_threshold.max(1),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Singleton-guarded startup. Exactly one active daemon per registry:
    /// the starter attaches, replaces, or registers; there is no free-port
    /// fallback.
    pub fn startup(&self, boot_id: &BootId, entry: DaemonEntry) -> Result<StartupDecision> {
        let record = self.registry.read()?;
        let active = record
            .deployment
            .active_boot_id
            .as_ref()
            .and_then(|id| record.daemons.get(id.as_str()).map(|d| (id.clone(), d.clone())));

        if let Some((active_id, active_entry)) = active {
            if active_id == *boot_id {
                bail!("ERR_DAEMON_SINGLETON_VIOLATION: boot id already registered as active");
            }
            if active_entry.version == self.version && !active_entry.draining {
                return Ok(StartupDecision::Attach {
                    host: active_entry.host,
                    port: active_entry.port,
                });
            }
            // Mismatch or draining: register as candidate and replace.
            self.registry.update(|record| {
                record
                    .daemons
                    .insert(boot_id.as_str().to_string(), entry.clone());
            })?;
            return Ok(StartupDecision::Replace {
                old_boot_id: active_id,
            });
        }

        self.registry.update(|record| {
            record
                .daemons
                .insert(boot_id.as_str().to_string(), entry.clone());
            record.deployment.active_boot_id = Some(boot_id.clone());
            record.deployment.state = DeploymentState::Ready;
            record.deployment.health_fail_streak = 0;
            record.deployment.rollback_reason = None;
        })?;
        Ok(StartupDecision::Registered)
    }

    /// Begin an upgrade: bump the generation and mark the candidate.
    /// Returns the generation the caller must hold for every later step.
    pub fn begin_upgrade(&self, candidate: &BootId) -> Result<u64> {
        let record = self.registry.update(|record| {
            record.deployment.generation += 1;
            record.deployment.state = DeploymentState::Starting;
            record.deployment.candidate_boot_id = Some(candidate.clone());
            record.deployment.rollback_reason = None;
        })?;
        Ok(record.deployment.generation)
    }

    /// Candidate probed healthy: mark it ready for the switch.
    pub fn candidate_ready(&self, generation: u64) -> Result<()> {
        self.registry.update_deployment(generation, |record| {
            record.deployment.state = DeploymentState::Ready;
        })?;
        Ok(())
    }

    /// Atomically switch the active daemon to the candidate; the old
    /// active is marked draining and finishes in flight work.
    pub fn switch_active(&self, generation: u64) -> Result<()> {
        self.registry.update_deployment(generation, |record| {
            let Some(candidate) = record.deployment.candidate_boot_id.take() else {
                return;
            };
            let old = record.deployment.active_boot_id.take();
            if let Some(old_id) = &old {
                if let Some(entry) = record.daemons.get_mut(old_id.as_str()) {
                    entry.draining = true;
                }
            }
            record.deployment.old_boot_id = old;
            record.deployment.active_boot_id = Some(candidate);
            record.deployment.state = DeploymentState::Switched;
            record.deployment.switch_ts = Some(Utc::now().timestamp());
            record.deployment.health_fail_streak = 0;
        })?;
        Ok(())
    }

    /// Candidate never became healthy: abort, preserving the active.
    pub fn abort_upgrade(&self, generation: u64, reason: &str) -> Result<()> {
        tracing::warn!(reason, "upgrade aborted, active daemon preserved");
        self.registry.update_deployment(generation, |record| {
            if let Some(candidate) = record.deployment.candidate_boot_id.take() {
                record.daemons.remove(candidate.as_str());
            }
            record.deployment.state = DeploymentState::Idle;
        })?;
        Ok(())
    }

    /// Record one post-switch health probe. Three consecutive failures
    /// roll back to the pre-switch active.
    pub fn record_postswitch_health(&self, generation: u64, healthy: bool) -> Result<bool> {
        let mut rolled_back = false;
        let threshold = self.health_fail_threshold;
        self.registry.update_deployment(generation, |record| {
            if record.deployment.state != DeploymentState::Switched {
                return;
            }
            if healthy {
                record.deployment.health_fail_streak = 0;
                return;
            }
            record.deployment.health_fail_streak += 1;
            if record.deployment.health_fail_streak < threshold {
                return;
            }
            // 3-strike rollback: restore the old active, stop the failed
            // candidate.
            record.deployment.state = DeploymentState::RollingBack;
            let failed = record.deployment.active_boot_id.take();
            if let Some(failed_id) = &failed {
                record.daemons.remove(failed_id.as_str());
            }
            if let Some(old_id) = record.deployment.old_boot_id.take() {
                if let Some(entry) = record.daemons.get_mut(old_id.as_str()) {
                    entry.draining = false;
                }
                record.deployment.active_boot_id = Some(old_id);
            }
            record.deployment.rollback_reason = Some(format!(
                "{threshold} consecutive post-switch health failures"
            ));
            rolled_back = true;
        })?;

        if rolled_back {
            // Settle back to idle; the restored daemon serves as before.
            self.registry.update(|record| {
                if record.deployment.state == DeploymentState::RollingBack {
                    record.deployment.state = DeploymentState::Idle;
                }
            })?;
        }
        Ok(rolled_back)
    }

    /// Heartbeat: refresh this daemon's last_seen_ts.
    pub fn heartbeat(&self, boot_id: &BootId) -> Result<()> {
        self.registry.update(|record| {
            if let Some(entry) = record.daemons.get_mut(boot_id.as_str()) {
                entry.last_seen_ts = Utc::now().timestamp();
            }
        })?;
        Ok(())
    }

    /// Remove this daemon's entry on clean shutdown.
    pub fn deregister(&self, boot_id: &BootId) -> Result<()> {
        self.registry.update(|record| {
            record.daemons.remove(boot_id.as_str());
            if record.deployment.active_boot_id.as_ref() == Some(boot_id) {
                record.deployment.active_boot_id = None;
                record.deployment.state = DeploymentState::Idle;
            }
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use std::path::Path;

    fn manager(dir: &Path) -> DeploymentManager {
        let registry = Registry::open(&dir.join("registry.json"), 60);
        DeploymentManager::new(registry, "2.0.0", &DaemonConfig::default())
    }

    fn entry(port: u16, version: &str) -> DaemonEntry {
        DaemonEntry {
            host: "127.0.0.1".to_string(),
            port,
            pid: std::process::id(),
            version: version.to_string(),
            start_ts: Utc::now().timestamp(),
            last_seen_ts: Utc::now().timestamp(),
            draining: false,
        }
    }

    #[test]
    fn test_first_starter_registers_as_active() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let manager = manager(dir.path());
        let boot = BootId::generate();
        let decision = manager.startup(&boot, entry(4000, "2.0.0")).expect("startup");
        assert_eq!(decision, StartupDecision::Registered);

        let record = manager.registry().read().expect("read");
        assert_eq!(record.deployment.active_boot_id, Some(boot));
    }

    #[test]
    fn test_same_version_attaches() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let manager = manager(dir.path());
        let first = BootId::generate();
        manager.startup(&first, entry(4000, "2.0.0")).expect("startup");

        let second = BootId::generate();
        let decision = manager
            .startup(&second, entry(4001, "2.0.0"))
            .expect("startup");
        assert_eq!(
            decision,
            StartupDecision::Attach {
                host: "127.0.0.1".to_string(),
                port: 4000
            }
        );
    }

    #[test]
    fn test_version_mismatch_switch_keeps_singleton() {
        let dir = tempfile::tempdir().expect("create temp dir");
        // v1 daemon active.
        let registry = Registry::open(&dir.path().join("registry.json"), 60);
        let v1_manager =
            DeploymentManager::new(registry, "1.0.0", &DaemonConfig::default());
        let old = BootId::generate();
        v1_manager.startup(&old, entry(4000, "1.0.0")).expect("startup");

        // v2 starter sees the mismatch and replaces.
        let v2_manager = manager(dir.path());
        let candidate = BootId::generate();
        let decision = v2_manager
            .startup(&candidate, entry(4001, "2.0.0"))
            .expect("startup");
        assert_eq!(
            decision,
            StartupDecision::Replace {
                old_boot_id: old.clone()
            }
        );

        let generation = v2_manager.begin_upgrade(&candidate).expect("begin");
        v2_manager.candidate_ready(generation).expect("ready");
        v2_manager.switch_active(generation).expect("switch");

        let record = v2_manager.registry().read().expect("read");
        assert_eq!(record.deployment.state, DeploymentState::Switched);
        assert_eq!(record.deployment.active_boot_id, Some(candidate));
        assert_eq!(record.deployment.old_boot_id, Some(old.clone()));
        assert!(record.daemons[old.as_str()].draining);
        // Exactly one non-draining active daemon.
        let active_count = record.daemons.values().filter(|d| !d.draining).count();
        assert_eq!(active_count, 1);
    }

    #[test]
    fn test_three_strikes_roll_back() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let manager = manager(dir.path());
        let old = BootId::generate();
        let candidate = BootId::generate();
        manager.startup(&old, entry(4000, "2.0.0")).expect("startup");
        manager
            .registry()
            .update(|record| {
                record
                    .daemons
                    .insert(candidate.as_str().to_string(), entry(4001, "2.1.0"));
            })
            .expect("insert candidate");

        let generation = manager.begin_upgrade(&candidate).expect("begin");
        manager.switch_active(generation).expect("switch");

        assert!(!manager
            .record_postswitch_health(generation, false)
            .expect("probe 1"));
        assert!(!manager
            .record_postswitch_health(generation, false)
            .expect("probe 2"));
        let rolled_back = manager
            .record_postswitch_health(generation, false)
            .expect("probe 3");
        assert!(rolled_back);

        let record = manager.registry().read().expect("read");
        assert_eq!(record.deployment.active_boot_id, Some(old.clone()));
        assert!(!record.daemons[old.as_str()].draining);
        assert!(!record.daemons.contains_key(candidate.as_str()));
        assert!(record
            .deployment
            .rollback_reason
            .as_deref()
            .unwrap_or("")
            .contains("health failures"));
    }

    #[test]
    fn test_healthy_probe_resets_streak() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let manager = manager(dir.path());
        let old = BootId::generate();
        let candidate = BootId::generate();
        manager.startup(&old, entry(4000, "2.0.0")).expect("startup");
        manager
            .registry()
            .update(|record| {
                record
                    .daemons
                    .insert(candidate.as_str().to_string(), entry(4001, "2.1.0"));
            })
            .expect("insert candidate");
        let generation = manager.begin_upgrade(&candidate).expect("begin");
        manager.switch_active(generation).expect("switch");

        manager
            .record_postswitch_health(generation, false)
            .expect("probe");
        manager
            .record_postswitch_health(generation, true)
            .expect("probe");
        manager
            .record_postswitch_health(generation, false)
            .expect("probe");
        let rolled_back = manager
            .record_postswitch_health(generation, false)
            .expect("probe");
        // Streak was broken by the healthy probe; only the last two count.
        assert!(!rolled_back);
    }

    #[test]
    fn test_failed_candidate_aborts_preserving_active() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let manager = manager(dir.path());
        let active = BootId::generate();
        let candidate = BootId::generate();
        manager
            .startup(&active, entry(4000, "2.0.0"))
            .expect("startup");
        manager
            .registry()
            .update(|record| {
                record
                    .daemons
                    .insert(candidate.as_str().to_string(), entry(4001, "2.1.0"));
            })
            .expect("insert candidate");

        let generation = manager.begin_upgrade(&candidate).expect("begin");
        manager
            .abort_upgrade(generation, "health probe timed out")
            .expect("abort");

        let record = manager.registry().read().expect("read");
        assert_eq!(record.deployment.state, DeploymentState::Idle);
        assert_eq!(record.deployment.active_boot_id, Some(active));
        assert!(!record.daemons.contains_key(candidate.as_str()));
    }
}
