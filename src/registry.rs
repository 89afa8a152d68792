// Registry & Endpoint Resolver
// The single source of truth for "which daemon is live" and "where is the
// gateway". One JSON document (schema v2), rewritten atomically via temp
// file + rename while holding an advisory file lock, so concurrent starters
// serialize on the lock instead of racing the rename. Deployment mutations
// are generation-gated: a writer holding a stale generation becomes a
// no-op.

use anyhow::{Context, Result};
use chrono::Utc;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::types::BootId;

pub const REGISTRY_SCHEMA_VERSION: u32 = 2;

/// One live daemon process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonEntry {
    pub host: String,
    pub port: u16,
    pub pid: u32,
    pub version: String,
    pub start_ts: i64,
    pub last_seen_ts: i64,
    #[serde(default)]
    pub draining: bool,
}

/// Binding of one canonical workspace path to a daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceEntry {
    pub boot_id: BootId,
    pub last_active_ts: i64,
    pub http_host: String,
    pub http_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentState {
    #[default]
    Idle,
    Starting,
    Ready,
    Switched,
    RollingBack,
}

/// Blue/green deployment bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentBlock {
    pub generation: u64,
    pub state: DeploymentState,
    pub active_boot_id: Option<BootId>,
    pub candidate_boot_id: Option<BootId>,
    pub old_boot_id: Option<BootId>,
    pub switch_ts: Option<i64>,
    #[serde(default)]
    pub health_fail_streak: u32,
    pub rollback_reason: Option<String>,
}

/// The whole registry document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryRecord {
    pub version: u32,
    pub daemons: BTreeMap<String, DaemonEntry>,
    pub workspaces: BTreeMap<String, WorkspaceEntry>,
    pub deployment: DeploymentBlock,
}

/// Legacy single-daemon schema (v1), tolerated on read.
#[derive(Debug, Deserialize)]
struct RegistryV1 {
    version: u32,
    host: String,
    port: u16,
    pid: u32,
}

pub struct Registry {
    path: PathBuf,
    lock_path: PathBuf,
    ttl_secs: i64,
}

impl Registry {
    pub fn open(path: &Path, ttl_secs: i64) -> Self {
        Self {
            path: path.to_path_buf(),
            lock_path: path.with_extension("lock"),
            ttl_secs,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn acquire_lock(&self) -> Result<File> {
        if let Some(parent) = self.lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let lock = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&self.lock_path)
            .with_context(|| format!("failed to open lock {}", self.lock_path.display()))?;
        lock.lock_exclusive()
            .context("failed to take registry lock")?;
        Ok(lock)
    }

    fn load(&self) -> Result<RegistryRecord> {
        if !self.path.exists() {
            return Ok(RegistryRecord {
                version: REGISTRY_SCHEMA_VERSION,
                ..RegistryRecord::default()
            });
        }
        let raw = std::fs::read(&self.path)
            .with_context(|| format!("failed to read registry {}", self.path.display()))?;
        if let Ok(record) = serde_json::from_slice::<RegistryRecord>(&raw) {
            if record.version == REGISTRY_SCHEMA_VERSION {
                return Ok(record);
            }
        }
        // Schema v1 auto-migrates; migration persists on the next write.
        if let Ok(v1) = serde_json::from_slice::<RegistryV1>(&raw) {
            if v1.version == 1 {
                tracing::info!("migrating registry schema v1 -> v2");
                let boot_id = BootId::generate();
                let now = Utc::now().timestamp();
                let mut record = RegistryRecord {
                    version: REGISTRY_SCHEMA_VERSION,
                    ..RegistryRecord::default()
                };
                record.daemons.insert(
                    boot_id.as_str().to_string(),
                    DaemonEntry {
                        host: v1.host,
                        port: v1.port,
                        pid: v1.pid,
                        version: "unknown".to_string(),
                        start_ts: now,
                        last_seen_ts: now,
                        draining: false,
                    },
                );
                record.deployment.active_boot_id = Some(boot_id);
                return Ok(record);
            }
        }
        tracing::error!(path = %self.path.display(), "unreadable registry, starting fresh");
        Ok(RegistryRecord {
            version: REGISTRY_SCHEMA_VERSION,
            ..RegistryRecord::default()
        })
    }

    /// Read with cleanup applied: dead PIDs and stale entries pruned,
    /// orphaned workspaces unbound. Pruning is in-memory; it persists on
    /// the next write.
    pub fn read(&self) -> Result<RegistryRecord> {
        let mut record = self.load()?;
        self.prune(&mut record);
        Ok(record)
    }

    /// Locked read-modify-write with atomic publish.
    pub fn update<F>(&self, mutate: F) -> Result<RegistryRecord>
    where
        F: FnOnce(&mut RegistryRecord),
    {
        let lock = self.acquire_lock()?;
        let mut record = self.load()?;
        self.prune(&mut record);
        mutate(&mut record);
        record.version = REGISTRY_SCHEMA_VERSION;
        self.write_atomic(&record)?;
        FileExt::unlock(&lock).ok();
        Ok(record)
    }

    /// Generation-gated deployment mutation: the closure only runs when the
    /// caller's generation still matches, otherwise the update is a no-op.
    pub fn update_deployment<F>(&self, expected_generation: u64, mutate: F) -> Result<RegistryRecord>
    where
        F: FnOnce(&mut RegistryRecord),
    {
        self.update(|record| {
            if record.deployment.generation != expected_generation {
                tracing::warn!(
                    held = expected_generation,
                    current = record.deployment.generation,
                    "stale deployment generation, mutation ignored"
                );
                return;
            }
            mutate(record);
        })
    }

    fn write_atomic(&self, record: &RegistryRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let serialized =
            serde_json::to_vec_pretty(record).context("failed to serialize registry")?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, &serialized)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to publish {}", self.path.display()))?;
        Ok(())
    }

    fn prune(&self, record: &mut RegistryRecord) {
        let now = Utc::now().timestamp();
        let stale: Vec<String> = record
            .daemons
            .iter()
            .filter(|(_, d)| !pid_alive(d.pid) || now - d.last_seen_ts > self.ttl_secs)
            .map(|(boot_id, _)| boot_id.clone())
            .collect();
        for boot_id in &stale {
            tracing::debug!(boot_id = %boot_id, "pruning dead daemon entry");
            record.daemons.remove(boot_id);
        }
        // Workspaces bound to a vanished daemon become unbound; next use
        // spawns a fresh daemon.
        let daemons = &record.daemons;
        record
            .workspaces
            .retain(|_, ws| daemons.contains_key(ws.boot_id.as_str()));
        if let Some(active) = &record.deployment.active_boot_id {
            if !record.daemons.contains_key(active.as_str()) {
                record.deployment.active_boot_id = None;
                record.deployment.state = DeploymentState::Idle;
            }
        }
    }
}

/// Liveness probe for a local PID.
pub fn pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let proc_path = format!("/proc/{pid}");
    if Path::new("/proc").exists() {
        return Path::new(&proc_path).exists();
    }
    // Non-procfs unix: fall back to kill -0.
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Where an endpoint resolution came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointSource {
    Explicit,
    Environment,
    Registry,
    Legacy,
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedEndpoint {
    pub host: String,
    pub port: u16,
    pub source: EndpointSource,
}

/// Resolve the gateway endpoint. Strict SSOT order: explicit override →
/// environment override → registry → built-in default; the legacy
/// single-file endpoint is consulted only when strict mode is off, after
/// the registry misses.
pub fn resolve_endpoint(
    explicit: Option<(String, u16)>,
    registry: &Registry,
    legacy_file: Option<&Path>,
    strict_ssot: bool,
    default: (&str, u16),
) -> ResolvedEndpoint {
    if let Some((host, port)) = explicit {
        return ResolvedEndpoint {
            host,
            port,
            source: EndpointSource::Explicit,
        };
    }

    if let Ok(raw) = std::env::var("SARI_ENDPOINT") {
        if let Some(endpoint) = parse_host_port(&raw) {
            return ResolvedEndpoint {
                host: endpoint.0,
                port: endpoint.1,
                source: EndpointSource::Environment,
            };
        }
    }

    if let Ok(record) = registry.read() {
        let active = record
            .deployment
            .active_boot_id
            .as_ref()
            .and_then(|id| record.daemons.get(id.as_str()))
            .or_else(|| record.daemons.values().find(|d| !d.draining));
        if let Some(daemon) = active {
            return ResolvedEndpoint {
                host: daemon.host.clone(),
                port: daemon.port,
                source: EndpointSource::Registry,
            };
        }
    }

    if !strict_ssot {
        if let Some(path) = legacy_file {
            if let Ok(raw) = std::fs::read_to_string(path) {
                if let Some(endpoint) = parse_host_port(raw.trim()) {
                    return ResolvedEndpoint {
                        host: endpoint.0,
                        port: endpoint.1,
                        source: EndpointSource::Legacy,
                    };
                }
            }
        }
    }

    ResolvedEndpoint {
        host: default.0.to_string(),
        port: default.1,
        source: EndpointSource::Default,
    }
}

fn parse_host_port(raw: &str) -> Option<(String, u16)> {
    let (host, port) = raw.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port))
}
