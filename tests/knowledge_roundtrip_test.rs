// Knowledge round-trips: snippets with content-gated history, contexts,
// and diff previews.

use serde_json::json;

use sari::{SariConfig, SariService};

async fn indexed() -> (SariService, tempfile::TempDir, tempfile::TempDir, String) {
    let data = tempfile::tempdir().expect("data dir");
    let ws = tempfile::tempdir().expect("workspace");
    std::fs::write(
        ws.path().join("auth.py"),
        "import hashlib\n\ndef hash_password(raw):\n    return hashlib.sha256(raw).hexdigest()\n\ndef verify(raw, expected):\n    return hash_password(raw) == expected\n",
    )
    .expect("write");
    let service = SariService::build(
        data.path(),
        SariConfig::default(),
        &[ws.path().to_path_buf()],
        false,
    )
    .await
    .expect("build");
    service.initial_scan().await.expect("scan");
    let doc_id = format!(
        "{}/auth.py",
        service.workspace.active()[0].root_id.as_str()
    );
    (service, data, ws, doc_id)
}

#[tokio::test]
async fn test_snippet_save_get_roundtrip() {
    let (service, _data, _ws, doc_id) = indexed().await;

    let saved = service
        .tools
        .execute(
            "save_snippet",
            json!({"tag": "hashing", "path": doc_id, "start_line": 3, "end_line": 4, "note": "core hash"}),
            "test",
        )
        .await;
    assert_eq!(saved["ok"], json!(true));
    assert_eq!(saved["replaced"], json!(false));

    let fetched = service
        .tools
        .execute("get_snippet", json!({"tag": "hashing"}), "test")
        .await;
    assert_eq!(fetched["ok"], json!(true));
    let snippet = &fetched["snippet"];
    assert_eq!(snippet["tag"], json!("hashing"));
    assert_eq!(snippet["start_line"], json!(3));
    assert!(snippet["content"]
        .as_str()
        .expect("content")
        .contains("hash_password"));
    // Anchors captured around the region.
    assert!(!snippet["anchor_before"].as_array().expect("before").is_empty());
    assert_eq!(fetched["history_versions"], json!(0));

    service.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn test_resave_creates_history_only_on_change() {
    let (service, _data, _ws, doc_id) = indexed().await;

    let save = |lines: (u64, u64)| {
        let doc_id = doc_id.clone();
        let tools = service.tools.clone();
        async move {
            tools
                .execute(
                    "save_snippet",
                    json!({"tag": "t", "path": doc_id, "start_line": lines.0, "end_line": lines.1}),
                    "test",
                )
                .await
        }
    };

    save((3, 4)).await;
    // Identical content: no new version.
    save((3, 4)).await;
    let fetched = service
        .tools
        .execute("get_snippet", json!({"tag": "t"}), "test")
        .await;
    assert_eq!(fetched["history_versions"], json!(0));

    // Changed region: exactly one new version.
    save((5, 6)).await;
    let fetched = service
        .tools
        .execute("get_snippet", json!({"tag": "t"}), "test")
        .await;
    assert_eq!(fetched["history_versions"], json!(1));

    service.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn test_context_archive_and_get() {
    let (service, _data, _ws, doc_id) = indexed().await;

    let archived = service
        .tools
        .execute(
            "archive_context",
            json!({
                "topic": "password hashing",
                "content": "sha256 only; bcrypt migration pending",
                "tags": ["security"],
                "related_files": [doc_id],
            }),
            "test",
        )
        .await;
    assert_eq!(archived["ok"], json!(true));

    let fetched = service
        .tools
        .execute("get_context", json!({"topic": "password hashing"}), "test")
        .await;
    assert_eq!(fetched["ok"], json!(true));
    assert_eq!(fetched["expired"], json!(false));
    assert_eq!(
        fetched["context"]["content"],
        json!("sha256 only; bcrypt migration pending")
    );

    let by_tag = service
        .tools
        .execute("get_context", json!({"tag": "security"}), "test")
        .await;
    assert_eq!(by_tag["contexts"].as_array().expect("contexts").len(), 1);

    service.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn test_diff_preview_conflicts_and_clean_apply() {
    let (service, _data, _ws, doc_id) = indexed().await;

    // Clean: unique old_text previews the replacement.
    let preview = service
        .tools
        .execute(
            "dry_run_diff",
            json!({
                "target": doc_id,
                "old_text": "def verify(raw, expected):",
                "new_text": "def verify(raw: str, expected: str) -> bool:",
            }),
            "test",
        )
        .await;
    assert_eq!(preview["ok"], json!(true));
    assert_eq!(preview["applies_cleanly"], json!(true));
    assert!(preview["preview"].as_str().expect("preview").contains("+ def verify"));

    // Stale old_text: version conflict with a concrete client action.
    let conflict = service
        .tools
        .execute(
            "dry_run_diff",
            json!({
                "target": doc_id,
                "old_text": "def verify(user, password):",
                "new_text": "x",
            }),
            "test",
        )
        .await;
    assert_eq!(conflict["ok"], json!(false));
    assert_eq!(conflict["error"]["code"], json!("VERSION_CONFLICT"));
    assert_eq!(conflict["error"]["client_action"], json!("adjust_old_text"));

    // Ambiguous old_text: also a conflict, different action.
    let ambiguous = service
        .tools
        .execute(
            "dry_run_diff",
            json!({
                "target": doc_id,
                "old_text": "hash_password",
                "new_text": "digest_password",
            }),
            "test",
        )
        .await;
    assert_eq!(ambiguous["ok"], json!(false));
    assert_eq!(ambiguous["error"]["code"], json!("VERSION_CONFLICT"));
    assert_eq!(ambiguous["error"]["client_action"], json!("fix_args"));

    service.shutdown().await.expect("shutdown");
}
