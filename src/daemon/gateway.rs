// Gateway
// Two HTTP roles share this module. The backend router serves /rpc and
// /healthz for one daemon process (internal, ephemeral port). The proxy
// server owns the fixed ingress address and forwards every request to the
// active backend; blue/green switches retarget the proxy without the
// ingress endpoint ever changing.

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use crate::daemon::{ControllerHandle, LifecycleEvent};
use crate::tools::ToolRegistry;

/// Shared state for the backend router.
#[derive(Clone)]
pub struct GatewayState {
    pub tools: Arc<ToolRegistry>,
    pub controller: ControllerHandle,
}

/// Build the backend router.
pub fn backend_router(state: GatewayState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/rpc", post(rpc))
        .route("/shutdown", post(shutdown))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown(State(state): State<GatewayState>) -> Json<Value> {
    state.controller.send(LifecycleEvent::ShutdownRequest);
    Json(json!({ "ok": true, "stopping": true }))
}

async fn healthz(State(state): State<GatewayState>) -> Json<Value> {
    let ctx = state.tools.context();
    Json(json!({
        "ok": true,
        "boot_id": ctx.boot_id.as_str(),
        "version": ctx.version,
        "uptime_secs": ctx.started_at.elapsed().as_secs(),
    }))
}

/// One tool call over HTTP. The workspace selector rides in the query
/// string (`workspace_root`) or the body; absence falls back to the daemon
/// default session.
async fn rpc(
    State(state): State<GatewayState>,
    Query(params): Query<HashMap<String, String>>,
    Json(body): Json<Value>,
) -> Json<Value> {
    let _in_flight = state.controller.begin_request();

    let tool = body
        .get("tool")
        .or_else(|| body.get("method"))
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let args = body.get("args").or_else(|| body.get("params")).cloned();
    let args = args.unwrap_or_else(|| json!({}));

    let workspace = params
        .get("workspace_root")
        .cloned()
        .or_else(|| {
            body.get("workspace_root")
                .and_then(Value::as_str)
                .map(String::from)
        })
        .unwrap_or_else(|| "default".to_string());

    // HTTP requests count as short-lived leases keyed by workspace.
    state.controller.send(LifecycleEvent::LeaseRenew {
        client_id: format!("http:{workspace}"),
    });

    let ctx = state.tools.context();
    let session_guard = ctx
        .workspace
        .active()
        .iter()
        .find(|root| {
            workspace == "default"
                || root.real_path.to_string_lossy() == workspace
                || root.root_id.as_str() == workspace
        })
        .map(|root| {
            ctx.sessions
                .acquire(&workspace, &root.root_id)
        });

    let envelope = state.tools.execute(&tool, args, &workspace).await;
    drop(session_guard);

    let id = body.get("id").cloned();
    let mut envelope = envelope;
    if let (Some(id), Value::Object(fields)) = (id, &mut envelope) {
        fields.insert("id".to_string(), id);
    }
    Json(envelope)
}

/// Bind and serve a router until the shutdown signal fires. Returns the
/// actually bound address (useful with port 0).
pub async fn serve(
    addr: SocketAddr,
    router: Router,
    shutdown: oneshot::Receiver<()>,
) -> Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    let local_addr = listener.local_addr()?;
    let task = tokio::spawn(async move {
        let server = axum::serve(listener, router.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = shutdown.await;
            });
        if let Err(err) = server.await {
            tracing::error!(error = %err, "gateway server error");
        }
    });
    Ok((local_addr, task))
}

/// The fixed-ingress reverse proxy. Internal daemons come and go on
/// ephemeral ports; this address never changes.
pub struct ProxyServer {
    target: Arc<RwLock<SocketAddr>>,
    client: reqwest::Client,
}

impl ProxyServer {
    pub fn new(initial_target: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            target: Arc::new(RwLock::new(initial_target)),
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
        })
    }

    /// Atomically retarget the proxy (blue/green switch point).
    pub fn set_target(&self, target: SocketAddr) {
        *self.target.write() = target;
        tracing::info!(%target, "proxy retargeted");
    }

    pub fn target(&self) -> SocketAddr {
        *self.target.read()
    }

    pub fn router(self: &Arc<Self>) -> Router {
        let proxy = Arc::clone(self);
        Router::new().fallback(move |req: axum::extract::Request| {
            let proxy = Arc::clone(&proxy);
            async move { proxy.forward(req).await }
        })
    }

    async fn forward(&self, req: axum::extract::Request) -> Response {
        let target = self.target();
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let url = format!("http://{target}{path_and_query}");
        let method = req.method().clone();

        let body = match axum::body::to_bytes(req.into_body(), 16 * 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => {
                return (
                    StatusCode::BAD_REQUEST,
                    format!("unreadable request body: {err}"),
                )
                    .into_response()
            }
        };

        let outcome = self
            .client
            .request(
                reqwest::Method::from_bytes(method.as_str().as_bytes())
                    .unwrap_or(reqwest::Method::GET),
                &url,
            )
            .header("content-type", "application/json")
            .body(body.to_vec())
            .send()
            .await;

        match outcome {
            Ok(upstream) => {
                let status = StatusCode::from_u16(upstream.status().as_u16())
                    .unwrap_or(StatusCode::BAD_GATEWAY);
                let bytes = upstream.bytes().await.unwrap_or_default();
                (
                    status,
                    [("content-type", "application/json")],
                    Bytes::from(bytes.to_vec()),
                )
                    .into_response()
            }
            Err(err) => {
                tracing::warn!(error = %err, %target, "backend unreachable");
                (
                    StatusCode::BAD_GATEWAY,
                    Json(json!({
                        "ok": false,
                        "error": {
                            "code": "IO_ERROR",
                            "message": format!("active backend unreachable: {err}"),
                            "hint": "run: sari doctor",
                        },
                    })),
                )
                    .into_response()
            }
        }
    }
}

/// Probe a backend's /healthz.
pub async fn probe_health(client: &reqwest::Client, addr: SocketAddr) -> bool {
    let url = format!("http://{addr}/healthz");
    match client
        .get(&url)
        .timeout(std::time::Duration::from_secs(2))
        .send()
        .await
    {
        Ok(response) => response.status().is_success(),
        Err(_) => false,
    }
}
