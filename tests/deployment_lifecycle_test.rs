// Blue/green deployment, fixed ingress, rollback, and strict SSOT.

use serde_json::json;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use sari::daemon::gateway::{self, backend_router, GatewayState, ProxyServer};
use sari::daemon::DaemonController;
use sari::registry::{DaemonEntry, DeploymentState, Registry};
use sari::{
    resolve_endpoint, BootId, DeploymentManager, EndpointSource, SariConfig, SariService,
    StartupDecision,
};

async fn spawn_backend(
    data: &Path,
    ws: &Path,
) -> (SariService, SocketAddr, tokio::sync::oneshot::Sender<()>) {
    let service = SariService::build(data, SariConfig::default(), &[ws.to_path_buf()], false)
        .await
        .expect("build service");
    service.initial_scan().await.expect("scan");

    let (_controller, handle, _rx, _shutdown) = DaemonController::new(
        service.boot_id.clone(),
        30,
        service.sessions.clone(),
        None,
    );
    let state = GatewayState {
        tools: service.tools.clone(),
        controller: handle,
    };
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel();
    let (addr, _task) = gateway::serve(
        "127.0.0.1:0".parse().expect("addr"),
        backend_router(state),
        stop_rx,
    )
    .await
    .expect("serve backend");
    (service, addr, stop_tx)
}

#[tokio::test]
async fn test_switch_keeps_ingress_endpoint_fixed() {
    let ws = tempfile::tempdir().expect("workspace");
    std::fs::write(ws.path().join("a.py"), "def login(): pass\n").expect("write");
    let data_v1 = tempfile::tempdir().expect("data v1");
    let data_v2 = tempfile::tempdir().expect("data v2");

    let (service_v1, addr_v1, _stop_v1) = spawn_backend(data_v1.path(), ws.path()).await;
    let (service_v2, addr_v2, _stop_v2) = spawn_backend(data_v2.path(), ws.path()).await;

    // Fixed ingress proxying to v1.
    let proxy = ProxyServer::new(addr_v1);
    let (_stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let (ingress, _task) = gateway::serve(
        "127.0.0.1:0".parse().expect("addr"),
        proxy.router(),
        stop_rx,
    )
    .await
    .expect("serve ingress");

    let client = reqwest::Client::new();
    let url = format!("http://{ingress}/healthz");
    let before: serde_json::Value = client
        .get(&url)
        .send()
        .await
        .expect("probe v1")
        .json()
        .await
        .expect("json");
    assert_eq!(
        before["boot_id"].as_str().expect("boot id"),
        service_v1.boot_id.as_str()
    );

    // Switch: retarget the proxy; the ingress address never changes.
    proxy.set_target(addr_v2);
    let after: serde_json::Value = client
        .get(&url)
        .send()
        .await
        .expect("probe v2")
        .json()
        .await
        .expect("json");
    assert_eq!(
        after["boot_id"].as_str().expect("boot id"),
        service_v2.boot_id.as_str()
    );
    assert_ne!(before["boot_id"], after["boot_id"]);

    // Tool calls keep working through the same ingress after the switch.
    let response: serde_json::Value = client
        .post(format!("http://{ingress}/rpc"))
        .json(&json!({"tool": "search", "args": {"query": "login"}}))
        .send()
        .await
        .expect("rpc")
        .json()
        .await
        .expect("json");
    assert_eq!(response["ok"], json!(true));

    service_v1.shutdown().await.expect("shutdown v1");
    service_v2.shutdown().await.expect("shutdown v2");
}

#[tokio::test]
async fn test_full_upgrade_drive_through_registry() {
    let dir = tempfile::tempdir().expect("registry dir");
    let config = SariConfig::default();

    // v1 registers as active.
    let v1 = DeploymentManager::new(
        Registry::open(&dir.path().join("registry.json"), 60),
        "1.0.0",
        &config.daemon,
    );
    let old_boot = BootId::generate();
    let decision = v1
        .startup(&old_boot, entry(5001, "1.0.0"))
        .expect("v1 startup");
    assert_eq!(decision, StartupDecision::Registered);

    // v2 identifies the mismatch and replaces via blue/green.
    let v2 = DeploymentManager::new(
        Registry::open(&dir.path().join("registry.json"), 60),
        "2.0.0",
        &config.daemon,
    );
    let new_boot = BootId::generate();
    let decision = v2
        .startup(&new_boot, entry(5002, "2.0.0"))
        .expect("v2 startup");
    assert_eq!(
        decision,
        StartupDecision::Replace {
            old_boot_id: old_boot.clone()
        }
    );

    let generation = v2.begin_upgrade(&new_boot).expect("begin");
    v2.candidate_ready(generation).expect("ready");
    v2.switch_active(generation).expect("switch");

    let record = v2.registry().read().expect("read");
    assert_eq!(record.deployment.state, DeploymentState::Switched);
    assert_eq!(record.deployment.active_boot_id, Some(new_boot));
    assert!(record.daemons[old_boot.as_str()].draining);
}

#[tokio::test]
async fn test_rollback_restores_previous_active() {
    let dir = tempfile::tempdir().expect("registry dir");
    let config = SariConfig::default();
    let manager = DeploymentManager::new(
        Registry::open(&dir.path().join("registry.json"), 60),
        "2.0.0",
        &config.daemon,
    );

    let old_boot = BootId::generate();
    let candidate = BootId::generate();
    manager
        .startup(&old_boot, entry(5001, "2.0.0"))
        .expect("startup");
    manager
        .registry()
        .update(|record| {
            record
                .daemons
                .insert(candidate.as_str().to_string(), entry(5002, "2.1.0"));
        })
        .expect("add candidate");

    let generation = manager.begin_upgrade(&candidate).expect("begin");
    manager.switch_active(generation).expect("switch");

    // Three consecutive failures flip to rolling_back and restore.
    for expect_rollback in [false, false, true] {
        let rolled = manager
            .record_postswitch_health(generation, false)
            .expect("probe");
        assert_eq!(rolled, expect_rollback);
    }

    let record = manager.registry().read().expect("read");
    assert_eq!(record.deployment.active_boot_id, Some(old_boot.clone()));
    assert!(!record.daemons[old_boot.as_str()].draining);
    // Subsequent status reads resolve to the restored daemon.
    let resolved = resolve_endpoint(None, manager.registry(), None, true, ("127.0.0.1", 1));
    assert_eq!(resolved.port, 5001);
    assert_eq!(resolved.source, EndpointSource::Registry);
}

#[tokio::test]
async fn test_strict_ssot_resolution_over_legacy_file() {
    let dir = tempfile::tempdir().expect("registry dir");
    let registry = Registry::open(&dir.path().join("registry.json"), 60);
    let boot = BootId::generate();
    registry
        .update(|record| {
            record
                .daemons
                .insert(boot.as_str().to_string(), entry(6100, "2.0.0"));
            record.deployment.active_boot_id = Some(boot.clone());
        })
        .expect("register");

    // A stale legacy endpoint file points somewhere else entirely.
    let legacy = dir.path().join("endpoint");
    std::fs::write(&legacy, "127.0.0.1:6999\n").expect("write legacy");

    let strict = resolve_endpoint(None, &registry, Some(&legacy), true, ("127.0.0.1", 1));
    assert_eq!(strict.port, 6100);
    assert_eq!(strict.source, EndpointSource::Registry);

    // Non-strict still prefers the registry, tolerating legacy only as a
    // fallback when the registry is empty.
    let tolerant = resolve_endpoint(None, &registry, Some(&legacy), false, ("127.0.0.1", 1));
    assert_eq!(tolerant.port, 6100);
    assert_eq!(tolerant.source, EndpointSource::Registry);
}

#[tokio::test]
async fn test_proxy_reports_bad_gateway_when_backend_is_gone() {
    // Point the proxy at a port nobody listens on.
    let proxy = ProxyServer::new("127.0.0.1:1".parse().expect("addr"));
    let (_stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let (ingress, _task) = gateway::serve(
        "127.0.0.1:0".parse().expect("addr"),
        proxy.router(),
        stop_rx,
    )
    .await
    .expect("serve ingress");

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{ingress}/rpc"))
        .json(&json!({"tool": "status"}))
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .expect("send");
    assert_eq!(response.status().as_u16(), 502);
    let body: serde_json::Value = response.json().await.expect("json");
    assert_eq!(body["error"]["code"], json!("IO_ERROR"));
}

fn entry(port: u16, version: &str) -> DaemonEntry {
    DaemonEntry {
        host: "127.0.0.1".to_string(),
        port,
        pid: std::process::id(),
        version: version.to_string(),
        start_ts: chrono::Utc::now().timestamp(),
        last_seen_ts: chrono::Utc::now().timestamp(),
        draining: false,
    }
}
