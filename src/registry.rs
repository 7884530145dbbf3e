//! Project registry and root markers.
//!
//! The registry is a JSON file listing `{id, name, path}` entries. Each
//! registered project also carries a small marker file inside its root
//! (`.farsight/home.json`) holding the project id, so hooks running in the
//! project can discover which id to post under.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use uuid::Uuid;

#[derive(Clone, Serialize, Deserialize)]
pub struct ProjectEntry {
    pub id: String,
    pub name: String,
    pub path: PathBuf,
}

#[derive(Serialize, Deserialize)]
struct RootMarker {
    project_id: String,
}

pub struct ProjectRegistry {
    file: PathBuf,
    entries: RwLock<Vec<ProjectEntry>>,
}

impl ProjectRegistry {
    /// Load the registry file, starting empty when it does not exist or does
    /// not parse.
    pub fn load(file: PathBuf) -> Self {
        let entries = std::fs::read_to_string(&file)
            .ok()
            .and_then(|raw| serde_json::from_str::<Vec<ProjectEntry>>(&raw).ok())
            .unwrap_or_default();
        Self { file, entries: RwLock::new(entries) }
    }

    fn save(&self) {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        if let Some(parent) = self.file.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(&*entries) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.file, json) {
                    tracing::warn!(file = %self.file.display(), error = %e, "Could not persist project registry");
                }
            }
            Err(e) => tracing::warn!(error = %e, "Could not serialize project registry"),
        }
    }

    /// Register a project root. Reuses the id from the root marker when one
    /// exists, otherwise mints one and writes the marker.
    pub fn register(&self, name: &str, root: &Path) -> ProjectEntry {
        let marker_path = root.join(".farsight").join("home.json");
        let existing_id = std::fs::read_to_string(&marker_path)
            .ok()
            .and_then(|raw| serde_json::from_str::<RootMarker>(&raw).ok())
            .map(|m| m.project_id);

        let id = existing_id.unwrap_or_else(|| {
            let id = Uuid::new_v4().to_string();
            if let Some(parent) = marker_path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            let marker = RootMarker { project_id: id.clone() };
            if let Ok(json) = serde_json::to_string_pretty(&marker) {
                if let Err(e) = std::fs::write(&marker_path, json) {
                    tracing::warn!(path = %marker_path.display(), error = %e, "Could not write root marker");
                }
            }
            id
        });

        let entry = ProjectEntry { id: id.clone(), name: name.to_string(), path: root.to_path_buf() };
        {
            let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
            if let Some(existing) = entries.iter_mut().find(|e| e.id == id) {
                existing.name = entry.name.clone();
                existing.path = entry.path.clone();
            } else {
                entries.push(entry.clone());
            }
        }
        self.save();
        entry
    }

    pub fn get(&self, id: &str) -> Option<ProjectEntry> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|e| e.id == id)
            .cloned()
    }

    pub fn root_of(&self, id: &str) -> Option<PathBuf> {
        self.get(id).map(|e| e.path)
    }

    pub fn all(&self) -> Vec<ProjectEntry> {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}
