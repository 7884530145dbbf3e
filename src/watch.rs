//! Filesystem watcher for incremental live re-indexing.
//!
//! Watches every indexed project root and forwards debounced change batches
//! to the owning index. Event delivery runs on a dedicated thread; handlers
//! are bounded by per-file indexing cost and never block the watcher itself.

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::index::IndexSet;
use crate::types::ChangeKind;

/// Debounce window: wait this long after the last event before processing.
const DEBOUNCE_MS: u64 = 500;

/// Start a watcher over all indexed project roots. The returned handle must
/// be kept alive; dropping it stops the watcher.
pub fn start_watcher(indexes: Arc<IndexSet>) -> Option<RecommendedWatcher> {
    let (tx, rx) = mpsc::channel::<Event>();

    let mut watcher = match RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        },
        notify::Config::default(),
    ) {
        Ok(w) => w,
        Err(e) => {
            warn!(error = %e, "Failed to create file watcher");
            return None;
        }
    };

    for project in indexes.project_ids() {
        let Some(index) = indexes.get(&project) else {
            continue;
        };
        let root = match index.read() {
            Ok(i) => i.root.clone(),
            Err(_) => continue,
        };
        match watcher.watch(&root, RecursiveMode::Recursive) {
            Ok(()) => debug!(project = project.as_str(), root = %root.display(), "Watching"),
            Err(e) => warn!(project = project.as_str(), error = %e, "Failed to watch root"),
        }
    }

    std::thread::spawn(move || debounce_loop(rx, indexes));
    Some(watcher)
}

/// Collect events and process them after a quiet period.
fn debounce_loop(rx: mpsc::Receiver<Event>, indexes: Arc<IndexSet>) {
    let mut pending: HashMap<PathBuf, Instant> = HashMap::new();

    loop {
        match rx.recv_timeout(Duration::from_millis(DEBOUNCE_MS)) {
            Ok(event) => {
                if matches!(
                    event.kind,
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                ) {
                    let now = Instant::now();
                    for path in event.paths {
                        pending.insert(path, now);
                    }
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if pending.is_empty() {
                    continue;
                }
                let cutoff = Instant::now() - Duration::from_millis(DEBOUNCE_MS);
                let ready: Vec<PathBuf> = pending
                    .iter()
                    .filter(|(_, t)| **t <= cutoff)
                    .map(|(p, _)| p.clone())
                    .collect();
                if ready.is_empty() {
                    continue;
                }
                for path in &ready {
                    pending.remove(path);
                }
                process_changes(&ready, &indexes);
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn process_changes(paths: &[PathBuf], indexes: &Arc<IndexSet>) {
    for abs_path in paths {
        if abs_path.is_dir() {
            continue;
        }
        let Some((project, index)) = indexes.project_for_path(abs_path) else {
            continue;
        };
        let Ok(mut index) = index.write() else {
            continue;
        };

        let rel_path = match abs_path.strip_prefix(&index.root) {
            Ok(r) => r.to_string_lossy().replace('\\', "/"),
            Err(_) => continue,
        };
        if rel_path.split('/').any(|part| index.config.skip_dirs.contains(part)) {
            continue;
        }

        let kind = if !abs_path.exists() {
            ChangeKind::Deleted
        } else if index.file_meta(&rel_path).is_some() {
            ChangeKind::Modified
        } else {
            ChangeKind::Created
        };
        index.on_event(kind, &rel_path);
        debug!(project = project.as_str(), path = rel_path.as_str(), kind = ?kind, "Reindexed");
    }
}
