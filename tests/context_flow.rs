//! Flows that cross the index: snippet assembly in predictions, incremental
//! reindexing, and session-log replay feeding prediction.

mod helpers;

use farsight::index::SearchMode;
use farsight::predict::PredictParams;
use farsight::types::ChangeKind;
use helpers::{write_file, Harness};

fn fixture_project() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    write_file(
        dir.path(),
        "src/auth.py",
        "import os\n\ndef helper():\n    pass\n\ndef authenticate(user, password):\n    token = issue_token(user)\n    return token\n",
    );
    write_file(
        dir.path(),
        "src/tokens.py",
        "def issue_token(user):\n    return f\"token-{user}\"\n",
    );
    write_file(dir.path(), "README.md", "docs only, never indexed\n");
    dir
}

#[tokio::test]
async fn predictions_carry_snippets_from_the_index() {
    let h = Harness::new();
    let dir = fixture_project();
    h.index_project("p", dir.path());

    for _ in 0..3 {
        h.scorer
            .record_access("p", "src/auth.py", &["authenticate".to_string()], None)
            .await
            .unwrap();
    }

    let prediction = h
        .engine
        .predict(
            "p",
            &PredictParams {
                keywords: vec!["authenticate".to_string()],
                tags: Vec::new(),
                trigger_file: None,
                session: "s".to_string(),
                limit: 5,
                snippet_lines: 10,
            },
        )
        .await
        .unwrap();

    assert_eq!(prediction.files[0].path, "src/auth.py");
    let snippet = prediction.files[0].snippet.as_deref().expect("snippet extracted");
    assert!(snippet.contains("authenticate"));
    // With the parser available the snippet targets the matched symbol, not
    // the file head; without it the head fallback still mentions the name.
    #[cfg(feature = "treesitter")]
    assert!(!snippet.contains("import os"), "expected symbol body, got head: {snippet}");
}

#[tokio::test]
async fn deleted_file_still_listed_without_snippet() {
    let h = Harness::new();
    let dir = fixture_project();
    h.index_project("p", dir.path());

    h.scorer.record_access("p", "src/auth.py", &[], None).await.unwrap();
    std::fs::remove_file(dir.path().join("src/auth.py")).unwrap();

    let prediction = h
        .engine
        .predict(
            "p",
            &PredictParams {
                keywords: Vec::new(),
                tags: Vec::new(),
                trigger_file: None,
                session: "s".to_string(),
                limit: 5,
                snippet_lines: 10,
            },
        )
        .await
        .unwrap();
    assert_eq!(prediction.files[0].path, "src/auth.py");
    assert!(prediction.files[0].snippet.is_none());
}

#[tokio::test]
async fn watcher_events_keep_search_current() {
    let h = Harness::new();
    let dir = fixture_project();
    h.index_project("p", dir.path());
    let index = h.indexes.get("p").unwrap();

    write_file(dir.path(), "src/sessions.py", "def revoke_session(sid):\n    pass\n");
    {
        let mut index = index.write().unwrap();
        index.on_event(ChangeKind::Created, "src/sessions.py");
    }
    {
        let index = index.read().unwrap();
        let hits = index.search("revoke_session", SearchMode::Recent, 10, None, None);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].file, "src/sessions.py");
    }

    std::fs::remove_file(dir.path().join("src/sessions.py")).unwrap();
    {
        let mut index = index.write().unwrap();
        index.on_event(ChangeKind::Deleted, "src/sessions.py");
    }
    {
        let index = index.read().unwrap();
        assert!(index.search("revoke_session", SearchMode::Recent, 10, None, None).is_empty());
        assert!(index.file_meta("src/sessions.py").is_none());
    }
}

#[tokio::test]
async fn replayed_session_logs_drive_trigger_predictions() {
    let h = Harness::new();
    let project_dir = fixture_project();
    h.index_project("p", project_dir.path());

    // Build a session log where tokens.py always follows auth.py.
    let logs_dir = tempfile::tempdir().unwrap();
    let root = project_dir.path().to_string_lossy().to_string();
    let mut lines = Vec::new();
    for file in ["src/auth.py", "src/tokens.py"] {
        lines.push(
            serde_json::json!({
                "type": "assistant",
                "message": { "content": [{
                    "type": "tool_use",
                    "name": "Read",
                    "input": { "file_path": format!("{root}/{file}") }
                }]}
            })
            .to_string(),
        );
    }
    std::fs::write(logs_dir.path().join("agent-abc.jsonl"), lines.join("\n")).unwrap();

    let stats = farsight::session_log::replay_dir(
        &h.transitions,
        "p",
        project_dir.path(),
        logs_dir.path(),
    )
    .await
    .unwrap();
    assert_eq!(stats.transitions, 1);

    let prediction = h
        .engine
        .predict(
            "p",
            &PredictParams {
                keywords: Vec::new(),
                tags: Vec::new(),
                trigger_file: Some("src/auth.py".to_string()),
                session: "s".to_string(),
                limit: 5,
                snippet_lines: 0,
            },
        )
        .await
        .unwrap();
    assert_eq!(prediction.files.len(), 1);
    assert_eq!(prediction.files[0].path, "src/tokens.py");
    assert_eq!(prediction.files[0].source, "transition");
    assert!((prediction.files[0].confidence - 0.8).abs() < 1e-9);
}
