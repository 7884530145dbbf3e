//! Session-log replay.
//!
//! Replays the agent's persisted session logs (newline-delimited JSON, one
//! structured event per line) into the transition model. Only `assistant`
//! events carrying `tool_use` content items matter; `Read` invocations with a
//! `file_path` form the ordered read sequence of a session. Malformed lines
//! and files are skipped, never fatal.

use serde::Serialize;
use std::path::Path;

use crate::store::Result;
use crate::transition::TransitionModel;
use crate::types::relativize;

#[derive(Clone, Default, Serialize)]
pub struct ReplayStats {
    pub sessions: usize,
    pub events: usize,
    pub reads: usize,
    pub transitions: usize,
}

/// One tool invocation extracted from a session log line.
pub struct ToolEvent {
    pub tool: String,
    pub file_path: Option<String>,
}

/// Parse the tool events out of one session file's content.
pub fn parse_session_content(content: &str) -> Vec<ToolEvent> {
    let mut events = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(entry) = serde_json::from_str::<serde_json::Value>(line) else {
            continue;
        };
        if entry.get("type").and_then(|t| t.as_str()) != Some("assistant") {
            continue;
        }
        let Some(content_items) = entry
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_array())
        else {
            continue;
        };
        for item in content_items {
            if item.get("type").and_then(|t| t.as_str()) != Some("tool_use") {
                continue;
            }
            events.push(ToolEvent {
                tool: item
                    .get("name")
                    .and_then(|n| n.as_str())
                    .unwrap_or_default()
                    .to_string(),
                file_path: item
                    .get("input")
                    .and_then(|i| i.get("file_path"))
                    .and_then(|p| p.as_str())
                    .map(|p| p.to_string()),
            });
        }
    }
    events
}

/// Ordered file-read sequence of a session, project-relative, deduplicated to
/// first-occurrence order.
pub fn extract_read_sequence(events: &[ToolEvent], root: &Path) -> Vec<String> {
    let mut reads = Vec::new();
    for event in events {
        if event.tool != "Read" {
            continue;
        }
        let Some(path) = event.file_path.as_deref().filter(|p| !p.is_empty()) else {
            continue;
        };
        let rel = relativize(root, path);
        if !reads.contains(&rel) {
            reads.push(rel);
        }
    }
    reads
}

/// Replay every `*.jsonl` session file under `dir` into the transition model
/// for `project`, rooted at `root`.
pub async fn replay_dir(
    model: &TransitionModel,
    project: &str,
    root: &Path,
    dir: &Path,
) -> Result<ReplayStats> {
    let mut stats = ReplayStats::default();

    let Ok(entries) = std::fs::read_dir(dir) else {
        tracing::warn!(dir = %dir.display(), "Session log directory unreadable, skipping replay");
        return Ok(stats);
    };
    let mut session_files: Vec<_> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("jsonl"))
        .collect();
    session_files.sort();

    for path in session_files {
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(file = %path.display(), error = %e, "Skipping unreadable session log");
                continue;
            }
        };
        let events = parse_session_content(&content);
        let reads = extract_read_sequence(&events, root);

        stats.sessions += 1;
        stats.events += events.len();
        stats.reads += reads.len();

        for pair in reads.windows(2) {
            if pair[0] != pair[1] {
                model.record_pair(project, &pair[0], &pair[1], None).await?;
                stats.transitions += 1;
            }
        }
    }

    tracing::info!(
        project,
        sessions = stats.sessions,
        reads = stats.reads,
        transitions = stats.transitions,
        "Session log replay complete"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::io::Write;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn log_line(tool: &str, file: &str) -> String {
        serde_json::json!({
            "type": "assistant",
            "timestamp": "2026-01-01T00:00:00Z",
            "message": {
                "content": [
                    { "type": "text", "text": "reading" },
                    { "type": "tool_use", "name": tool, "input": { "file_path": file } }
                ]
            }
        })
        .to_string()
    }

    fn session_content(reads: &[&str]) -> String {
        let mut lines: Vec<String> = reads.iter().map(|f| log_line("Read", f)).collect();
        lines.push("not json at all".to_string());
        lines.push(serde_json::json!({"type": "user", "message": {}}).to_string());
        lines.join("\n")
    }

    #[test]
    fn parses_only_assistant_tool_use() {
        let content = session_content(&["/proj/a.py"]);
        let events = parse_session_content(&content);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].tool, "Read");
        assert_eq!(events[0].file_path.as_deref(), Some("/proj/a.py"));
    }

    #[test]
    fn read_sequence_is_relative_and_deduplicated() {
        let events = parse_session_content(&session_content(&[
            "/proj/a.py",
            "/proj/b.py",
            "/proj/a.py",
            "/proj/c.py",
        ]));
        let reads = extract_read_sequence(&events, &PathBuf::from("/proj"));
        assert_eq!(reads, vec!["a.py", "b.py", "c.py"]);
    }

    #[tokio::test]
    async fn replay_learns_the_session_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = std::fs::File::create(dir.path().join("agent-001.jsonl")).unwrap();
        f.write_all(
            session_content(&[
                "/proj/a.py",
                "/proj/b.py",
                "/proj/a.py",
                "/proj/c.py",
                "/proj/b.py",
                "/proj/c.py",
            ])
            .as_bytes(),
        )
        .unwrap();

        let model = TransitionModel::new(Arc::new(MemoryStore::new()));
        let stats = replay_dir(&model, "p", &PathBuf::from("/proj"), dir.path()).await.unwrap();
        assert_eq!(stats.sessions, 1);
        assert_eq!(stats.reads, 3);
        assert_eq!(stats.transitions, 2);

        let from_a = model.predict("p", "a.py", 5).await.unwrap();
        assert_eq!(from_a.len(), 1);
        assert_eq!(from_a[0].to, "b.py");
        assert_eq!(from_a[0].probability, 1.0);

        let from_b = model.predict("p", "b.py", 5).await.unwrap();
        assert_eq!(from_b.len(), 1);
        assert_eq!(from_b[0].to, "c.py");
        assert_eq!(from_b[0].probability, 1.0);

        assert!(model.predict("p", "c.py", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_directory_is_not_fatal() {
        let model = TransitionModel::new(Arc::new(MemoryStore::new()));
        let stats = replay_dir(
            &model,
            "p",
            &PathBuf::from("/proj"),
            &PathBuf::from("/does/not/exist"),
        )
        .await
        .unwrap();
        assert_eq!(stats.sessions, 0);
    }
}
