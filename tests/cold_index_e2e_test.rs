// End-to-end: cold index then query, exclusion policy, and tool envelopes.

use serde_json::{json, Value};
use std::path::Path;

use sari::{SariConfig, SariService};

async fn service_for(
    data_dir: &Path,
    workspace: &Path,
    config: SariConfig,
) -> SariService {
    let service = SariService::build(data_dir, config, &[workspace.to_path_buf()], false)
        .await
        .expect("build service");
    service.initial_scan().await.expect("initial scan");
    service
}

fn write(workspace: &Path, rel: &str, content: &str) {
    let path = workspace.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("mkdir");
    }
    std::fs::write(path, content).expect("write file");
}

#[tokio::test]
async fn test_cold_index_then_query() {
    let data = tempfile::tempdir().expect("data dir");
    let ws = tempfile::tempdir().expect("workspace");
    write(ws.path(), "a.py", "def login(user):\n    return user\n");
    write(ws.path(), "b.py", "class UserController:\n    pass\n");

    let service = service_for(data.path(), ws.path(), SariConfig::default()).await;

    // Index is ready once the scan completes.
    let status = service.tools.execute("status", json!({}), "test").await;
    assert_eq!(status["ok"], json!(true));
    assert_eq!(status["index_ready"], json!(true));

    let response = service
        .tools
        .execute("search", json!({"query": "login"}), "test")
        .await;
    assert_eq!(response["ok"], json!(true));
    let matches = response["matches"].as_array().expect("matches");
    assert_eq!(matches.len(), 1);

    let root_id = service.workspace.active()[0].root_id.clone();
    assert_eq!(
        matches[0]["path"],
        json!(format!("{}/a.py", root_id.as_str()))
    );
    assert!(matches[0]["hit_reason"]
        .as_str()
        .expect("hit_reason")
        .contains("login"));
    // Every hit carries a candidate ref for the read gate.
    assert!(matches[0]["candidate_ref"]
        .as_str()
        .expect("candidate_ref")
        .starts_with("cr-"));

    service.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn test_exclusion_survives_rescan() {
    let data = tempfile::tempdir().expect("data dir");
    let ws = tempfile::tempdir().expect("workspace");
    write(ws.path(), "a.py", "def login(user):\n    return user\n");
    write(ws.path(), "node_modules/x.js", "function login() {}\n");

    // First index without the default dir excludes, so the file gets in.
    let mut permissive = SariConfig::default();
    permissive.indexing.exclude_dirs.clear();
    let service = service_for(data.path(), ws.path(), permissive).await;
    let response = service
        .tools
        .execute("search", json!({"query": "login"}), "test")
        .await;
    assert_eq!(response["matches"].as_array().expect("matches").len(), 2);
    service.shutdown().await.expect("shutdown");

    // Re-open with the exclusion in place; the rescan removes the row.
    let mut excluding = SariConfig::default();
    excluding.indexing.exclude_dirs.clear();
    excluding.indexing.exclude_globs = vec!["node_modules/**".to_string()];
    let service = service_for(data.path(), ws.path(), excluding).await;

    let response = service
        .tools
        .execute("search", json!({"query": "login"}), "test")
        .await;
    let matches = response["matches"].as_array().expect("matches");
    assert_eq!(matches.len(), 1);
    assert!(matches[0]["path"]
        .as_str()
        .expect("path")
        .ends_with("/a.py"));
    service.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn test_list_files_and_repo_candidates() {
    let data = tempfile::tempdir().expect("data dir");
    let ws = tempfile::tempdir().expect("workspace");
    write(ws.path(), "backend/app.py", "def f(): pass\n");
    write(ws.path(), "backend/db.py", "def g(): pass\n");
    write(ws.path(), "frontend/ui.js", "function h() {}\n");
    write(ws.path(), "README.md", "# readme\n");

    let service = service_for(data.path(), ws.path(), SariConfig::default()).await;

    let listed = service
        .tools
        .execute("list_files", json!({"repo": "backend"}), "test")
        .await;
    assert_eq!(listed["files"].as_array().expect("files").len(), 2);

    let candidates = service
        .tools
        .execute("repo_candidates", json!({}), "test")
        .await;
    let repos: Vec<&str> = candidates["candidates"]
        .as_array()
        .expect("candidates")
        .iter()
        .map(|c| c["repo"].as_str().expect("repo"))
        .collect();
    // backend has the most files, so it ranks first.
    assert_eq!(repos[0], "backend");
    assert!(repos.contains(&"__root__"));

    service.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn test_unknown_tool_yields_invalid_args_envelope() {
    let data = tempfile::tempdir().expect("data dir");
    let ws = tempfile::tempdir().expect("workspace");
    let service = service_for(data.path(), ws.path(), SariConfig::default()).await;

    let response = service
        .tools
        .execute("no_such_tool", json!({}), "test")
        .await;
    assert_eq!(response["ok"], json!(false));
    assert_eq!(response["error"]["code"], json!("INVALID_ARGS"));
    // Errors always carry a next step.
    assert!(response["error"]["hint"].as_str().is_some());

    service.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn test_call_graph_tools_end_to_end() {
    let data = tempfile::tempdir().expect("data dir");
    let ws = tempfile::tempdir().expect("workspace");
    write(
        ws.path(),
        "svc.py",
        "def handler(request):\n    return login(request)\n\ndef login(user):\n    return store(user)\n\ndef store(user):\n    return user\n",
    );

    let service = service_for(data.path(), ws.path(), SariConfig::default()).await;

    let callers = service
        .tools
        .execute("get_callers", json!({"target": "login"}), "test")
        .await;
    let hits = callers["callers"].as_array().expect("callers");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0]["from"], json!("handler"));

    let graph: Value = service
        .tools
        .execute(
            "call_graph",
            json!({"target": "handler", "direction": "callees", "depth": 3}),
            "test",
        )
        .await;
    let nodes: Vec<&str> = graph["graph"]["nodes"]
        .as_array()
        .expect("nodes")
        .iter()
        .map(|n| n["name"].as_str().expect("name"))
        .collect();
    assert!(nodes.contains(&"handler"));
    assert!(nodes.contains(&"login"));
    assert!(nodes.contains(&"store"));

    service.shutdown().await.expect("shutdown");
}
