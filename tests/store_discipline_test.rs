// Store invariants: single-writer discipline, recovery, and no-op upserts.

use serde_json::json;
use std::path::PathBuf;

use sari::store::writer::spawn_writer;
use sari::store::Store;
use sari::{SariConfig, SariService};

#[tokio::test]
async fn test_second_writer_is_refused_with_invariant_code() {
    let dir = tempfile::tempdir().expect("data dir");
    let store = Store::open(dir.path(), SariConfig::default().store).expect("open");
    let (_writer, _task) = spawn_writer(store.clone()).expect("first writer");

    let err = spawn_writer(store).expect_err("second writer must fail");
    assert!(err.to_string().contains("ERR_DB_WRITE_NOT_SINGLE_WRITER"));
}

#[tokio::test]
async fn test_reopen_recovers_all_tables() {
    let data = tempfile::tempdir().expect("data dir");
    let ws = tempfile::tempdir().expect("workspace");
    std::fs::write(
        ws.path().join("a.py"),
        "def login(user):\n    return user\n",
    )
    .expect("write");

    let (doc_count, symbol_count) = {
        let service = SariService::build(
            data.path(),
            SariConfig::default(),
            &[ws.path().to_path_buf()],
            false,
        )
        .await
        .expect("build");
        service.initial_scan().await.expect("scan");
        let stats = service.store.stats();
        service.shutdown().await.expect("shutdown");
        (stats.file_count, stats.symbol_count)
    };
    assert_eq!(doc_count, 1);
    assert!(symbol_count >= 1);

    // A fresh process over the same data dir sees the same rows, and the
    // text index rebuilds its snapshot from its own persisted segment.
    let service = SariService::build(
        data.path(),
        SariConfig::default(),
        &[ws.path().to_path_buf()],
        false,
    )
    .await
    .expect("rebuild");
    let stats = service.store.stats();
    assert_eq!(stats.file_count, doc_count);
    assert_eq!(stats.symbol_count, symbol_count);

    service.text_index.reload_reader();
    let response = service
        .tools
        .execute("search", json!({"query": "login"}), "test")
        .await;
    assert_eq!(response["ok"], json!(true));
    assert_eq!(response["matches"].as_array().expect("matches").len(), 1);
    service.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn test_unchanged_rescan_is_noop_at_both_sinks() {
    let data = tempfile::tempdir().expect("data dir");
    let ws = tempfile::tempdir().expect("workspace");
    std::fs::write(ws.path().join("a.py"), "def f(): pass\n").expect("write");

    let service = SariService::build(
        data.path(),
        SariConfig::default(),
        &[ws.path().to_path_buf()],
        false,
    )
    .await
    .expect("build");
    service.initial_scan().await.expect("scan");

    let version_before = service.text_index.reader().index_version();
    let docs_before = service.text_index.reader().doc_count();

    // Nothing changed on disk: the rescan must not touch either sink.
    service.initial_scan().await.expect("rescan");
    assert_eq!(service.text_index.reader().index_version(), version_before);
    assert_eq!(service.text_index.reader().doc_count(), docs_before);

    service.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn test_engine_rebuild_matches_store() {
    let data = tempfile::tempdir().expect("data dir");
    let ws = tempfile::tempdir().expect("workspace");
    for i in 0..5 {
        std::fs::write(
            ws.path().join(format!("f{i}.py")),
            format!("def fn_{i}(): pass\n"),
        )
        .expect("write");
    }

    let service = SariService::build(
        data.path(),
        SariConfig::default(),
        &[ws.path().to_path_buf()],
        false,
    )
    .await
    .expect("build");
    service.initial_scan().await.expect("scan");

    let rebuilt = service.rebuild_text_index();
    assert_eq!(rebuilt, 5);
    let (store_docs, index_docs) = service.verify_text_index();
    assert_eq!(store_docs, index_docs);

    // Search still answers after the rebuild.
    let response = service
        .tools
        .execute("search", json!({"query": "fn_3"}), "test")
        .await;
    assert_eq!(response["matches"].as_array().expect("matches").len(), 1);

    service.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn test_deleted_file_is_tombstoned_and_unsearchable() {
    let data = tempfile::tempdir().expect("data dir");
    let ws = tempfile::tempdir().expect("workspace");
    let path: PathBuf = ws.path().join("gone.py");
    std::fs::write(&path, "def vanish(): pass\n").expect("write");

    let service = SariService::build(
        data.path(),
        SariConfig::default(),
        &[ws.path().to_path_buf()],
        false,
    )
    .await
    .expect("build");
    service.initial_scan().await.expect("scan");
    assert_eq!(service.store.stats().file_count, 1);

    std::fs::remove_file(&path).expect("remove");
    service.initial_scan().await.expect("rescan");

    assert_eq!(service.store.stats().file_count, 0);
    assert_eq!(service.store.stats().tombstone_count, 1);
    let response = service
        .tools
        .execute("search", json!({"query": "vanish"}), "test")
        .await;
    assert!(response["matches"].as_array().expect("matches").is_empty());

    service.shutdown().await.expect("shutdown");
}
