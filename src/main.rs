// Sari CLI - daemon lifecycle, maintenance, and engine commands
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sari::daemon::gateway::{self, backend_router, GatewayState, ProxyServer};
use sari::daemon::lifecycle::DeploymentManager;
use sari::daemon::{DaemonController, LifecycleEvent};
use sari::registry::{DaemonEntry, Registry};
use sari::{
    default_data_dir, init_logging_with_level, resolve_endpoint, SariConfig, SariService,
    StartupDecision,
};

// Macro for conditional printing based on quiet flag
macro_rules! qprintln {
    ($quiet:expr, $($arg:tt)*) => {
        if !$quiet {
            println!($($arg)*);
        }
    };
}

#[derive(Parser)]
#[command(name = "sari", version, about = "Local code-intelligence daemon")]
struct Cli {
    /// Data root (defaults to SARI_DATA_DIR or the platform data dir)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Daemon lifecycle
    Daemon {
        #[command(subcommand)]
        command: DaemonCommands,
    },
    /// Health report across every subsystem
    Doctor,
    /// Enqueue a full rescan on the running daemon (or run one locally)
    Rescan {
        /// Restrict to one root id
        #[arg(long)]
        root_id: Option<String>,
    },
    /// One-shot synchronous scan, no daemon left running
    ScanOnce {
        /// Workspace roots to scan
        #[arg(required = true)]
        workspace: Vec<PathBuf>,
    },
    /// Text engine management
    Engine {
        #[command(subcommand)]
        command: EngineCommands,
    },
}

#[derive(Subcommand)]
enum DaemonCommands {
    /// Start the daemon in the background
    Start {
        /// Workspace roots to serve
        #[arg(required = true)]
        workspace: Vec<PathBuf>,
    },
    /// Stop the active daemon
    Stop,
    /// Show registry and endpoint state
    Status,
    /// Run the daemon in the foreground (what `start` spawns)
    Run {
        #[arg(required = true)]
        workspace: Vec<PathBuf>,
        /// Also serve line-framed JSON-RPC on stdio
        #[arg(long)]
        stdio: bool,
    },
}

#[derive(Subcommand)]
enum EngineCommands {
    /// Report text index health
    Status,
    /// Prepare the engine directories
    Install,
    /// Rebuild the text index from the store
    Rebuild,
    /// Cross-check the text index against the store
    Verify,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging_with_level(cli.verbose, cli.quiet)?;

    let data_dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);
    let config = SariConfig::load(&data_dir)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    match cli.command {
        Commands::Daemon { command } => match command {
            DaemonCommands::Start { workspace } => {
                runtime.block_on(daemon_start(&data_dir, &config, workspace, cli.quiet))
            }
            DaemonCommands::Stop => runtime.block_on(daemon_stop(&data_dir, &config, cli.quiet)),
            DaemonCommands::Status => runtime.block_on(daemon_status(&data_dir, &config)),
            DaemonCommands::Run { workspace, stdio } => {
                runtime.block_on(daemon_run(&data_dir, config, workspace, stdio))
            }
        },
        Commands::Doctor => runtime.block_on(run_tool_command(
            &data_dir,
            config,
            "doctor",
            json!({}),
            cli.quiet,
        )),
        Commands::Rescan { root_id } => {
            let args = match root_id {
                Some(root_id) => json!({ "root_id": root_id }),
                None => json!({}),
            };
            runtime.block_on(run_tool_command(&data_dir, config, "rescan", args, cli.quiet))
        }
        Commands::ScanOnce { workspace } => {
            runtime.block_on(scan_once(&data_dir, config, workspace, cli.quiet))
        }
        Commands::Engine { command } => runtime.block_on(engine_command(
            &data_dir, config, command, cli.quiet,
        )),
    }
}

/// Spawn `daemon run` detached, then wait for it to come up.
async fn daemon_start(
    data_dir: &std::path::Path,
    config: &SariConfig,
    workspace: Vec<PathBuf>,
    quiet: bool,
) -> Result<()> {
    let registry = Registry::open(
        &data_dir.join("registry.json"),
        config.daemon.registry_ttl_secs,
    );
    let resolved = resolve_endpoint(
        None,
        &registry,
        Some(&data_dir.join("endpoint")),
        config.daemon.strict_ssot,
        (&config.daemon.host, config.daemon.port),
    );
    let client = reqwest::Client::new();
    if let Ok(addr) = format!("{}:{}", resolved.host, resolved.port).parse::<SocketAddr>() {
        if gateway::probe_health(&client, addr).await {
            qprintln!(quiet, "daemon already running at {addr}");
            return Ok(());
        }
    }

    let exe = std::env::current_exe().context("cannot locate own binary")?;
    let mut command = std::process::Command::new(exe);
    command
        .arg("--data-dir")
        .arg(data_dir)
        .arg("daemon")
        .arg("run");
    for path in &workspace {
        command.arg(path);
    }
    command
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
    let child = command.spawn().context("failed to spawn daemon")?;
    qprintln!(quiet, "daemon spawning (pid {})", child.id());

    // Wait for the gateway to answer.
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let record = registry.read()?;
        if let Some(active) = record
            .deployment
            .active_boot_id
            .as_ref()
            .and_then(|id| record.daemons.get(id.as_str()))
        {
            let addr: SocketAddr = format!("{}:{}", active.host, active.port).parse()?;
            if gateway::probe_health(&client, addr).await {
                qprintln!(
                    quiet,
                    "daemon ready at {}:{}",
                    config.daemon.host,
                    config.daemon.port
                );
                return Ok(());
            }
        }
    }
    bail!("daemon did not become healthy; check logs and run: sari doctor")
}

async fn daemon_stop(
    data_dir: &std::path::Path,
    config: &SariConfig,
    quiet: bool,
) -> Result<()> {
    let registry = Registry::open(
        &data_dir.join("registry.json"),
        config.daemon.registry_ttl_secs,
    );
    let record = registry.read()?;
    let Some(active) = record
        .deployment
        .active_boot_id
        .as_ref()
        .and_then(|id| record.daemons.get(id.as_str()))
    else {
        qprintln!(quiet, "no active daemon");
        return Ok(());
    };
    let client = reqwest::Client::new();
    let url = format!("http://{}:{}/shutdown", active.host, active.port);
    client
        .post(&url)
        .send()
        .await
        .with_context(|| format!("daemon unreachable at {url}"))?;
    qprintln!(quiet, "stop requested");
    Ok(())
}

async fn daemon_status(data_dir: &std::path::Path, config: &SariConfig) -> Result<()> {
    let registry = Registry::open(
        &data_dir.join("registry.json"),
        config.daemon.registry_ttl_secs,
    );
    let record = registry.read()?;
    let resolved = resolve_endpoint(
        None,
        &registry,
        Some(&data_dir.join("endpoint")),
        config.daemon.strict_ssot,
        (&config.daemon.host, config.daemon.port),
    );
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "registry": record,
            "endpoint": resolved,
        }))?
    );
    Ok(())
}

/// The foreground daemon: backend on an ephemeral port, fixed ingress
/// proxy, registry registration with blue/green takeover, controller loop.
async fn daemon_run(
    data_dir: &std::path::Path,
    config: SariConfig,
    workspace: Vec<PathBuf>,
    stdio: bool,
) -> Result<()> {
    let daemon_config = config.daemon.clone();
    let service = SariService::build(data_dir, config, &workspace, true).await?;
    let boot_id = service.boot_id.clone();
    let version = env!("CARGO_PKG_VERSION").to_string();

    let deployment = Arc::new(DeploymentManager::new(
        Registry::open(
            &data_dir.join("registry.json"),
            daemon_config.registry_ttl_secs,
        ),
        version.clone(),
        &daemon_config,
    ));

    let (controller, handle, events_rx, _shutdown_rx) = DaemonController::new(
        boot_id.clone(),
        daemon_config.session_grace_secs,
        service.sessions.clone(),
        Some(deployment.clone()),
    );

    // Backend on an ephemeral port; the fixed ingress proxies to it.
    let state = GatewayState {
        tools: service.tools.clone(),
        controller: handle.clone(),
    };
    let (backend_stop_tx, backend_stop_rx) = tokio::sync::oneshot::channel();
    let (backend_addr, _backend_task) = gateway::serve(
        "127.0.0.1:0".parse()?,
        backend_router(state),
        backend_stop_rx,
    )
    .await?;
    tracing::info!(%backend_addr, "backend listening");

    let entry = DaemonEntry {
        host: backend_addr.ip().to_string(),
        port: backend_addr.port(),
        pid: std::process::id(),
        version: version.clone(),
        start_ts: chrono::Utc::now().timestamp(),
        last_seen_ts: chrono::Utc::now().timestamp(),
        draining: false,
    };

    match deployment.startup(&boot_id, entry)? {
        StartupDecision::Attach { host, port } => {
            println!("daemon already active at {host}:{port}; attaching instead");
            let _ = backend_stop_tx.send(());
            return Ok(());
        }
        StartupDecision::Registered => {
            tracing::info!("registered as active daemon");
        }
        StartupDecision::Replace { old_boot_id } => {
            tracing::info!(old = %old_boot_id, "version mismatch, starting blue/green switch");
            let generation = deployment.begin_upgrade(&boot_id)?;
            let client = reqwest::Client::new();
            let mut healthy = false;
            for _ in 0..10 {
                if gateway::probe_health(&client, backend_addr).await {
                    healthy = true;
                    break;
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            if !healthy {
                deployment.abort_upgrade(generation, "candidate failed health probe")?;
                bail!("ERR_DAEMON_SINGLETON_VIOLATION: candidate unhealthy, active preserved");
            }
            deployment.candidate_ready(generation)?;
            deployment.switch_active(generation)?;
            tracing::info!("switch complete, previous daemon draining");
        }
    }

    // Bind the canonical workspaces to this daemon at the fixed ingress.
    let ingress = format!("{}:{}", daemon_config.host, daemon_config.port);
    deployment.registry().update(|record| {
        for root in service.workspace.active() {
            record.workspaces.insert(
                root.real_path.to_string_lossy().to_string(),
                sari::registry::WorkspaceEntry {
                    boot_id: boot_id.clone(),
                    last_active_ts: chrono::Utc::now().timestamp(),
                    http_host: daemon_config.host.clone(),
                    http_port: daemon_config.port,
                },
            );
        }
    })?;

    // Fixed ingress: bind (with takeover retry) and keep the proxy
    // retargeted at whatever the registry says is active.
    let ingress_addr: SocketAddr = ingress.parse()?;
    let registry_for_proxy = Registry::open(
        &data_dir.join("registry.json"),
        daemon_config.registry_ttl_secs,
    );
    let _ingress_task = tokio::spawn(run_ingress(ingress_addr, backend_addr, registry_for_proxy));

    // Drain watcher: a draining entry stops this daemon once in-flight
    // work ends, force-stopped at the drain timeout.
    let drain_registry = Registry::open(
        &data_dir.join("registry.json"),
        daemon_config.registry_ttl_secs,
    );
    let drain_handle = handle.clone();
    let drain_boot = boot_id.clone();
    let drain_timeout = Duration::from_secs(daemon_config.drain_timeout_secs);
    let _drain_task = tokio::spawn(async move {
        let mut draining_since: Option<tokio::time::Instant> = None;
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            ticker.tick().await;
            let Ok(record) = drain_registry.read() else { continue };
            let draining = record
                .daemons
                .get(drain_boot.as_str())
                .map(|d| d.draining)
                .unwrap_or(false);
            if !draining {
                draining_since = None;
                continue;
            }
            let since = *draining_since.get_or_insert_with(tokio::time::Instant::now);
            if drain_handle.in_flight() == 0 || since.elapsed() >= drain_timeout {
                tracing::info!("drained, stopping");
                drain_handle.send(LifecycleEvent::ShutdownRequest);
                return;
            }
        }
    });

    // Initial scan in the background; status reports index_ready once the
    // queue drains.
    let scan_pipeline = service.pipeline.orchestrator();
    let scan_roots: Vec<_> = service.workspace.active();
    tokio::spawn(async move {
        for root in scan_roots {
            if let Err(err) = scan_pipeline.rescan_root(&root.root_id).await {
                tracing::warn!(error = %err, "initial scan failed");
            }
        }
    });

    if stdio {
        let tools = service.tools.clone();
        let stdio_handle = handle.clone();
        let runtime = tokio::runtime::Handle::current();
        std::thread::Builder::new()
            .name("sari-stdio".into())
            .spawn(move || {
                if let Err(err) = sari::rpc::run_stdio_server(tools, stdio_handle, runtime) {
                    tracing::error!(error = %err, "stdio transport failed");
                }
            })
            .context("failed to spawn stdio thread")?;
    }

    // The controller loop owns the rest of the process lifetime.
    controller.run(events_rx, daemon_config.heartbeat_secs).await;

    let _ = backend_stop_tx.send(());
    deployment.deregister(&boot_id)?;
    service.shutdown().await?;
    Ok(())
}

/// Fixed-ingress loop: keep trying to bind (the previous owner may still
/// hold it while draining), then serve the proxy retargeted from the
/// registry.
async fn run_ingress(ingress: SocketAddr, initial_target: SocketAddr, registry: Registry) {
    loop {
        let proxy = ProxyServer::new(initial_target);
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        match gateway::serve(ingress, proxy.router(), stop_rx).await {
            Ok((addr, task)) => {
                tracing::info!(%addr, "ingress bound");
                // Retarget from the registry while serving.
                let retarget_proxy = Arc::clone(&proxy);
                let retarget = tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(Duration::from_secs(1));
                    loop {
                        ticker.tick().await;
                        if let Ok(record) = registry.read() {
                            if let Some(active) = record
                                .deployment
                                .active_boot_id
                                .as_ref()
                                .and_then(|id| record.daemons.get(id.as_str()))
                            {
                                if let Ok(addr) =
                                    format!("{}:{}", active.host, active.port).parse()
                                {
                                    if retarget_proxy.target() != addr {
                                        retarget_proxy.set_target(addr);
                                    }
                                }
                            }
                        }
                    }
                });
                let _ = task.await;
                retarget.abort();
                drop(stop_tx);
                return;
            }
            Err(err) => {
                tracing::debug!(error = %err, "ingress busy, retrying");
                drop(stop_tx);
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
    }
}

/// Run a tool against the live daemon when one answers, otherwise locally.
async fn run_tool_command(
    data_dir: &std::path::Path,
    config: SariConfig,
    tool: &str,
    args: Value,
    quiet: bool,
) -> Result<()> {
    let registry = Registry::open(
        &data_dir.join("registry.json"),
        config.daemon.registry_ttl_secs,
    );
    if let Some(envelope) = client_call(&registry, tool, &args).await {
        qprintln!(quiet, "{}", serde_json::to_string_pretty(&envelope)?);
        return exit_for(&envelope);
    }

    // No daemon: run against a local one-shot service.
    let service = SariService::build(data_dir, config, &[], false).await?;
    let envelope = service.tools.execute(tool, args, "cli").await;
    qprintln!(quiet, "{}", serde_json::to_string_pretty(&envelope)?);
    let outcome = exit_for(&envelope);
    service.shutdown().await?;
    outcome
}

fn exit_for(envelope: &Value) -> Result<()> {
    if envelope.get("ok").and_then(Value::as_bool) == Some(true) {
        Ok(())
    } else {
        bail!(
            "{}",
            envelope
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("tool failed")
        )
    }
}

async fn client_call(registry: &Registry, tool: &str, args: &Value) -> Option<Value> {
    let record = registry.read().ok()?;
    let active = record
        .deployment
        .active_boot_id
        .as_ref()
        .and_then(|id| record.daemons.get(id.as_str()))?;
    let client = reqwest::Client::new();
    let url = format!("http://{}:{}/rpc", active.host, active.port);
    let response = client
        .post(&url)
        .json(&json!({ "tool": tool, "args": args }))
        .timeout(Duration::from_secs(30))
        .send()
        .await
        .ok()?;
    response.json().await.ok()
}

async fn scan_once(
    data_dir: &std::path::Path,
    config: SariConfig,
    workspace: Vec<PathBuf>,
    quiet: bool,
) -> Result<()> {
    let service = SariService::build(data_dir, config, &workspace, false).await?;
    service.initial_scan().await?;
    let stats = service.store.stats();
    qprintln!(
        quiet,
        "scanned {} files, {} symbols, {} relations",
        stats.file_count,
        stats.symbol_count,
        stats.relation_count
    );
    service.shutdown().await?;
    Ok(())
}

async fn engine_command(
    data_dir: &std::path::Path,
    config: SariConfig,
    command: EngineCommands,
    quiet: bool,
) -> Result<()> {
    let service = SariService::build(data_dir, config, &[], false).await?;
    let outcome = match command {
        EngineCommands::Status => {
            println!(
                "{}",
                serde_json::to_string_pretty(&service.text_index.status())?
            );
            Ok(())
        }
        EngineCommands::Install => {
            // The engine is built in; install just prepares the layout.
            qprintln!(quiet, "engine ready at {}", service.data_dir.display());
            Ok(())
        }
        EngineCommands::Rebuild => {
            let count = service.rebuild_text_index();
            qprintln!(quiet, "rebuilt text index from {count} documents");
            Ok(())
        }
        EngineCommands::Verify => {
            let (store_docs, index_docs) = service.verify_text_index();
            if store_docs == index_docs {
                qprintln!(quiet, "ok: {store_docs} documents in both store and index");
                Ok(())
            } else {
                bail!(
                    "drift: store has {store_docs} documents, text index has {index_docs}; run: sari engine rebuild"
                )
            }
        }
    };
    service.shutdown().await?;
    outcome
}
