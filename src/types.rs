use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum file size (in bytes) that will be read into memory during indexing.
pub const MAX_FILE_READ: usize = 512 * 1024;

/// Identifiers longer than this are truncated before indexing.
pub const MAX_TOKEN_LEN: usize = 64;

/// Bytes-per-token estimate used for baseline/savings accounting.
pub const BYTES_PER_TOKEN: u64 = 4;

/// Reserved project bucket for requests that carry no usable project id.
pub const GLOBAL_PROJECT: &str = "global";

/// Current unix time in whole seconds.
pub fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Canonical project id: trimmed, falling through to the global bucket when empty.
pub fn canonical_project(id: Option<&str>) -> String {
    match id.map(str::trim) {
        Some(p) if !p.is_empty() => p.to_string(),
        _ => GLOBAL_PROJECT.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Index configuration
// ---------------------------------------------------------------------------

/// Runtime configuration for indexing one project. Loaded from .farsight.toml
/// when present, defaults otherwise.
#[derive(Clone)]
pub struct IndexConfig {
    pub root: PathBuf,
    /// Directory names to skip during walk.
    pub skip_dirs: HashSet<String>,
    /// Maximum file size read into memory.
    pub max_file_bytes: usize,
}

impl IndexConfig {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            skip_dirs: [
                ".git",
                "node_modules",
                "__pycache__",
                "target",
                "dist",
                "build",
                ".next",
                "vendor",
                "venv",
                ".venv",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            max_file_bytes: MAX_FILE_READ,
        }
    }

    /// Load config for a project root, merging `.farsight.toml` overrides.
    pub fn load(root: PathBuf) -> Self {
        let mut config = Self::new(root.clone());
        let path = root.join(".farsight.toml");
        let Ok(raw) = std::fs::read_to_string(&path) else {
            return config;
        };
        match raw.parse::<toml::Table>() {
            Ok(table) => {
                if let Some(extra) = table
                    .get("index")
                    .and_then(|v| v.get("skip_dirs"))
                    .and_then(|v| v.as_array())
                {
                    for dir in extra.iter().filter_map(|v| v.as_str()) {
                        config.skip_dirs.insert(dir.to_string());
                    }
                }
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Ignoring malformed .farsight.toml");
            }
        }
        config
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self::new(PathBuf::from("."))
    }
}

// ---------------------------------------------------------------------------
// File metadata
// ---------------------------------------------------------------------------

/// Metadata for an indexed file, keyed by project-relative path.
#[derive(Clone, Serialize)]
pub struct FileMeta {
    pub rel_path: String,
    pub size: u64,
    pub mtime: u64,
    pub language: String,
    /// First 16 hex digits of xxh3-64 over the file content.
    pub fingerprint: String,
}

// ---------------------------------------------------------------------------
// Token locations
// ---------------------------------------------------------------------------

/// The kind of an indexed location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolKind {
    Token,
    Tag,
    Function,
    Class,
    Method,
    Route,
    Test,
}

impl SymbolKind {
    pub fn label(&self) -> &'static str {
        match self {
            SymbolKind::Token => "token",
            SymbolKind::Tag => "tag",
            SymbolKind::Function => "function",
            SymbolKind::Class => "class",
            SymbolKind::Method => "method",
            SymbolKind::Route => "route",
            SymbolKind::Test => "test",
        }
    }

    /// Parsed structural symbols, as opposed to plain tokens.
    pub fn is_symbol(&self) -> bool {
        !matches!(self, SymbolKind::Token | SymbolKind::Tag)
    }
}

/// One occurrence of a token or symbol inside an indexed file.
/// Lifetime is bound to the file: removed on reindex or delete.
#[derive(Clone, Serialize)]
pub struct TokenLocation {
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub kind: SymbolKind,
    pub mtime: u64,
    /// Enclosing symbol name, for parsed symbols.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    /// Inclusive end line of the enclosing symbol, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_line: Option<u32>,
}

// ---------------------------------------------------------------------------
// Watcher change records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

/// One observed filesystem change, kept in a bounded in-memory log.
#[derive(Clone, Serialize)]
pub struct ChangeRecord {
    pub kind: ChangeKind,
    pub path: String,
    pub ts: u64,
}

// ---------------------------------------------------------------------------
// Scoring weights
// ---------------------------------------------------------------------------

/// Weight triple over the scorer's three signals. Always sums to 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Weights {
    pub recency: f64,
    pub frequency: f64,
    pub tag: f64,
}

impl Default for Weights {
    fn default() -> Self {
        Weights { recency: 0.4, frequency: 0.3, tag: 0.3 }
    }
}

// ---------------------------------------------------------------------------
// Path validation
// ---------------------------------------------------------------------------

/// Validate and canonicalize a relative path, rejecting traversal and paths
/// outside the project root.
pub fn validate_path(project_root: &Path, rel_path: &str) -> Result<PathBuf, &'static str> {
    if rel_path.is_empty() || rel_path.contains("..") || rel_path.starts_with('/') {
        return Err("Invalid path");
    }
    let full = project_root.join(rel_path);
    let canonical = full.canonicalize().map_err(|_| "File not found")?;
    let root_canonical = project_root.canonicalize().map_err(|_| "Root not found")?;
    if !canonical.starts_with(&root_canonical) {
        return Err("Path traversal detected");
    }
    Ok(canonical)
}

/// Translate an absolute path posted by a hook into a project-relative key.
/// Paths outside the root pass through unchanged.
pub fn relativize(root: &Path, path: &str) -> String {
    let root_str = root.to_string_lossy();
    match path.strip_prefix(root_str.as_ref()) {
        Some(rest) => rest.trim_start_matches('/').to_string(),
        None => path.to_string(),
    }
}
