//! Per-project inverted code index.
//!
//! Maps identifier tokens to their locations across the project, tracks file
//! metadata and a best-effort import graph, and answers token search, file
//! listing, and directory structure queries. Built by a full parallel walk at
//! startup and maintained incrementally by the watcher. Readers share a
//! per-project RwLock; the index stays queryable during a rescan because the
//! walk happens outside the lock.

use ignore::WalkBuilder;
use rayon::prelude::*;
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::UNIX_EPOCH;
use xxhash_rust::xxh3::xxh3_64;

use crate::language::{self, LanguageStrategy};
use crate::outline::{self, OutlineSymbol};
use crate::types::*;

const CHANGE_LOG_CAP: usize = 1_000;

fn token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[A-Za-z_][A-Za-z0-9_]+").unwrap())
}

// ---------------------------------------------------------------------------
// Search types
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SearchMode {
    Recent,
    Lexicographic,
}

impl SearchMode {
    pub fn parse(s: Option<&str>) -> Self {
        match s {
            Some("lexicographic") | Some("lex") => SearchMode::Lexicographic,
            _ => SearchMode::Recent,
        }
    }
}

/// One search hit: a token location plus its filename boost.
#[derive(Clone, Serialize)]
pub struct SearchHit {
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub kind: SymbolKind,
    pub mtime: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    pub boost: u32,
}

#[derive(Clone, Serialize)]
pub struct FileHits {
    pub file: String,
    pub terms_matched: usize,
    pub hits: Vec<SearchHit>,
}

// ---------------------------------------------------------------------------
// Per-file parse result
// ---------------------------------------------------------------------------

struct FileIndexData {
    meta: FileMeta,
    locations: Vec<(String, TokenLocation)>,
    imports: Vec<String>,
}

/// Tokenize, fingerprint, and outline one file. Returns None when the file is
/// not eligible (unknown language, unreadable, too large).
fn process_file(config: &IndexConfig, abs_path: &Path, rel_path: &str) -> Option<FileIndexData> {
    let ext = abs_path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let lang: &dyn LanguageStrategy = language::language_for_ext(ext)?;

    let metadata = fs::metadata(abs_path).ok()?;
    if metadata.len() as usize > config.max_file_bytes {
        return None;
    }
    let mtime = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let bytes = fs::read(abs_path).ok()?;
    let content = String::from_utf8_lossy(&bytes);
    let fingerprint = format!("{:016x}", xxh3_64(content.as_bytes()));

    let meta = FileMeta {
        rel_path: rel_path.to_string(),
        size: metadata.len(),
        mtime,
        language: lang.name().to_string(),
        fingerprint,
    };

    let mut locations: Vec<(String, TokenLocation)> = Vec::new();
    for (i, line) in content.lines().enumerate() {
        for m in token_re().find_iter(line) {
            let mut token = m.as_str();
            if token.len() > MAX_TOKEN_LEN {
                token = &token[..MAX_TOKEN_LEN];
            }
            let location = TokenLocation {
                file: rel_path.to_string(),
                line: i as u32 + 1,
                column: m.start() as u32,
                kind: SymbolKind::Token,
                mtime,
                symbol: None,
                end_line: None,
            };
            let lower = token.to_lowercase();
            if lower != token {
                locations.push((lower, location.clone()));
            }
            locations.push((token.to_string(), location));
        }
    }

    // Structural symbols also land in the inverted index, carrying their
    // kind and span for smart snippets.
    for sym in outline::outline_file(&content, ext) {
        if !token_re().is_match(&sym.name) {
            continue;
        }
        let location = TokenLocation {
            file: rel_path.to_string(),
            line: sym.start_line,
            column: 0,
            kind: sym.kind,
            mtime,
            symbol: Some(sym.name.clone()),
            end_line: Some(sym.end_line),
        };
        let lower = sym.name.to_lowercase();
        if lower != sym.name {
            locations.push((lower, location.clone()));
        }
        locations.push((sym.name, location));
    }

    let imports = lang.detect_imports(&content);
    Some(FileIndexData { meta, locations, imports })
}

// ---------------------------------------------------------------------------
// The index
// ---------------------------------------------------------------------------

pub struct CodeIndex {
    pub name: String,
    pub root: PathBuf,
    pub config: IndexConfig,
    tokens: HashMap<String, Vec<TokenLocation>>,
    files: HashMap<String, FileMeta>,
    /// Which inverted-index keys each file contributed, for fast removal.
    file_tokens: HashMap<String, HashSet<String>>,
    /// Unresolved import strings per file, re-resolved when the file set changes.
    raw_imports: HashMap<String, Vec<String>>,
    imports: BTreeMap<String, Vec<String>>,
    imported_by: BTreeMap<String, Vec<String>>,
    changes: VecDeque<ChangeRecord>,
    pub scan_time_ms: u64,
}

impl CodeIndex {
    /// Full scan of a project root. Walks in parallel, skipping noisy and
    /// hidden entries; per-file failures are logged and skipped.
    pub fn scan(name: &str, root: &Path, config: IndexConfig) -> Self {
        let start = std::time::Instant::now();

        let collected: Mutex<Vec<(PathBuf, String)>> = Mutex::new(Vec::new());
        let skip = config.skip_dirs.clone();
        WalkBuilder::new(root)
            .hidden(true)
            .git_ignore(false)
            .git_global(false)
            .git_exclude(false)
            .threads(rayon::current_num_threads().min(12))
            .filter_entry(move |entry| {
                if entry.file_type().is_some_and(|ft| ft.is_dir()) {
                    let name = entry.file_name().to_string_lossy();
                    return !skip.contains(name.as_ref());
                }
                true
            })
            .build_parallel()
            .run(|| {
                Box::new(|entry| {
                    let entry = match entry {
                        Ok(e) => e,
                        Err(_) => return ignore::WalkState::Continue,
                    };
                    if !entry.file_type().is_some_and(|ft| ft.is_file()) {
                        return ignore::WalkState::Continue;
                    }
                    let abs_path = entry.path().to_path_buf();
                    let rel_path = abs_path
                        .strip_prefix(root)
                        .unwrap_or(&abs_path)
                        .to_string_lossy()
                        .replace('\\', "/");
                    collected.lock().unwrap().push((abs_path, rel_path));
                    ignore::WalkState::Continue
                })
            });

        let raw_files = collected.into_inner().unwrap();
        let processed: Vec<FileIndexData> = raw_files
            .par_iter()
            .filter_map(|(abs, rel)| process_file(&config, abs, rel))
            .collect();

        let mut index = CodeIndex {
            name: name.to_string(),
            root: root.to_path_buf(),
            config,
            tokens: HashMap::new(),
            files: HashMap::new(),
            file_tokens: HashMap::new(),
            raw_imports: HashMap::new(),
            imports: BTreeMap::new(),
            imported_by: BTreeMap::new(),
            changes: VecDeque::new(),
            scan_time_ms: 0,
        };
        for data in processed {
            index.insert_file_data(data);
        }
        index.rebuild_import_graph();
        index.scan_time_ms = start.elapsed().as_millis() as u64;

        tracing::info!(
            project = name,
            files = index.files.len(),
            tokens = index.tokens.len(),
            time_ms = index.scan_time_ms,
            "Index scan complete"
        );
        index
    }

    fn insert_file_data(&mut self, data: FileIndexData) {
        let rel = data.meta.rel_path.clone();
        let mut contributed = HashSet::new();
        for (token, location) in data.locations {
            self.tokens.entry(token.clone()).or_default().push(location);
            contributed.insert(token);
        }
        self.file_tokens.insert(rel.clone(), contributed);
        self.raw_imports.insert(rel.clone(), data.imports);
        self.files.insert(rel, data.meta);
    }

    fn purge_file(&mut self, rel_path: &str) {
        if let Some(contributed) = self.file_tokens.remove(rel_path) {
            for token in contributed {
                if let Some(locations) = self.tokens.get_mut(&token) {
                    locations.retain(|l| l.file != rel_path);
                    if locations.is_empty() {
                        self.tokens.remove(&token);
                    }
                }
            }
        }
        self.files.remove(rel_path);
        self.raw_imports.remove(rel_path);
    }

    // -----------------------------------------------------------------------
    // Incremental updates
    // -----------------------------------------------------------------------

    /// Reindex one file. Skips the rewrite when the content fingerprint is
    /// unchanged. Returns true when the index was modified.
    pub fn reindex_one(&mut self, rel_path: &str) -> bool {
        let abs = self.root.join(rel_path);
        let Some(data) = process_file(&self.config, &abs, rel_path) else {
            // Not eligible anymore (deleted, too large, language removed).
            if self.files.contains_key(rel_path) {
                self.purge_file(rel_path);
                self.rebuild_import_graph();
                return true;
            }
            return false;
        };

        if let Some(existing) = self.files.get(rel_path) {
            if existing.fingerprint == data.meta.fingerprint {
                return false;
            }
        }

        self.purge_file(rel_path);
        self.insert_file_data(data);
        self.rebuild_import_graph();
        true
    }

    /// Watcher entry point. Appends to the bounded change log.
    pub fn on_event(&mut self, kind: ChangeKind, rel_path: &str) {
        let changed = match kind {
            ChangeKind::Created | ChangeKind::Modified => self.reindex_one(rel_path),
            ChangeKind::Deleted => {
                let known = self.files.contains_key(rel_path);
                if known {
                    self.purge_file(rel_path);
                    self.rebuild_import_graph();
                }
                known
            }
        };
        if changed {
            self.changes.push_back(ChangeRecord {
                kind,
                path: rel_path.to_string(),
                ts: now_unix(),
            });
            while self.changes.len() > CHANGE_LOG_CAP {
                self.changes.pop_front();
            }
        }
    }

    // -----------------------------------------------------------------------
    // Import graph
    // -----------------------------------------------------------------------

    /// Resolve raw import strings against the current file set by filename
    /// stem into a bidirectional edge list. Best-effort: ambiguous stems
    /// resolve to the first candidate.
    fn rebuild_import_graph(&mut self) {
        let mut stem_to_paths: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for rel in self.files.keys() {
            let file_name = rel.rsplit('/').next().unwrap_or(rel);
            let stem = file_name.rsplit_once('.').map(|(s, _)| s).unwrap_or(file_name);
            stem_to_paths.entry(stem.to_string()).or_default().push(rel.clone());
        }
        for paths in stem_to_paths.values_mut() {
            paths.sort();
        }

        let resolve = |import_str: &str| -> Option<String> {
            let last = import_str
                .rsplit(['.', '/'])
                .next()
                .unwrap_or(import_str);
            let stem = last.rsplit_once('.').map(|(s, _)| s).unwrap_or(last);
            stem_to_paths.get(stem).and_then(|candidates| {
                candidates
                    .iter()
                    .find(|c| c.ends_with(import_str))
                    .or_else(|| candidates.first())
                    .cloned()
            })
        };

        let mut imports: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut imported_by: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (file, raw) in &self.raw_imports {
            let mut resolved: Vec<String> = raw
                .iter()
                .filter_map(|i| resolve(i))
                .filter(|target| target != file)
                .collect();
            resolved.sort();
            resolved.dedup();
            for target in &resolved {
                imported_by.entry(target.clone()).or_default().push(file.clone());
            }
            if !resolved.is_empty() {
                imports.insert(file.clone(), resolved);
            }
        }
        for list in imported_by.values_mut() {
            list.sort();
        }
        self.imports = imports;
        self.imported_by = imported_by;
    }

    pub fn deps(&self, rel_path: &str) -> (Vec<String>, Vec<String>) {
        (
            self.imports.get(rel_path).cloned().unwrap_or_default(),
            self.imported_by.get(rel_path).cloned().unwrap_or_default(),
        )
    }

    // -----------------------------------------------------------------------
    // Search
    // -----------------------------------------------------------------------

    /// Filename boost: 1000 when the query appears in the basename with
    /// separators stripped, 500 in the basename, 100 in the path, 0 nowhere.
    fn filename_boost(query_lower: &str, path: &str) -> u32 {
        let path_lower = path.to_lowercase();
        let basename = path_lower.rsplit('/').next().unwrap_or(&path_lower);
        let stripped: String =
            basename.chars().filter(|c| !matches!(c, '_' | '-' | '.')).collect();
        let query_stripped: String =
            query_lower.chars().filter(|c| !matches!(c, '_' | '-' | '.')).collect();

        if !query_stripped.is_empty() && stripped.contains(&query_stripped) {
            1_000
        } else if basename.contains(query_lower) {
            500
        } else if path_lower.contains(query_lower) {
            100
        } else {
            0
        }
    }

    /// Token lookup merging original-case and lowercase hit lists.
    pub fn search(
        &self,
        query: &str,
        mode: SearchMode,
        limit: usize,
        since: Option<u64>,
        before: Option<u64>,
    ) -> Vec<SearchHit> {
        if query.is_empty() {
            return Vec::new();
        }
        // Over-long identifiers are truncated the same way at index time.
        let query = if query.len() > MAX_TOKEN_LEN {
            &query[..query.floor_char_boundary(MAX_TOKEN_LEN)]
        } else {
            query
        };
        let query_lower = query.to_lowercase();

        let mut merged: Vec<&TokenLocation> = Vec::new();
        if let Some(locations) = self.tokens.get(query) {
            merged.extend(locations.iter());
        }
        if query_lower != query {
            if let Some(locations) = self.tokens.get(&query_lower) {
                merged.extend(locations.iter());
            }
        }

        let mut seen: HashSet<(&str, u32)> = HashSet::new();
        let mut hits: Vec<SearchHit> = merged
            .into_iter()
            .filter(|l| since.map(|s| l.mtime >= s).unwrap_or(true))
            .filter(|l| before.map(|b| l.mtime < b).unwrap_or(true))
            .filter(|l| seen.insert((l.file.as_str(), l.line)))
            .map(|l| SearchHit {
                file: l.file.clone(),
                line: l.line,
                column: l.column,
                kind: l.kind,
                mtime: l.mtime,
                symbol: l.symbol.clone(),
                boost: Self::filename_boost(&query_lower, &l.file),
            })
            .collect();

        match mode {
            SearchMode::Recent => hits.sort_by(|a, b| {
                b.boost
                    .cmp(&a.boost)
                    .then_with(|| b.mtime.cmp(&a.mtime))
                    .then_with(|| a.file.cmp(&b.file))
                    .then_with(|| a.line.cmp(&b.line))
            }),
            SearchMode::Lexicographic => hits.sort_by(|a, b| {
                b.boost
                    .cmp(&a.boost)
                    .then_with(|| a.file.cmp(&b.file))
                    .then_with(|| a.line.cmp(&b.line))
            }),
        }
        hits.truncate(limit);
        hits
    }

    /// Multi-term search: files ranked by (terms matched, newest mtime), then
    /// the top files' hits.
    pub fn multi_search(
        &self,
        terms: &[String],
        mode: SearchMode,
        limit: usize,
        file_limit: usize,
    ) -> Vec<FileHits> {
        struct FileAcc {
            terms: HashSet<usize>,
            max_mtime: u64,
            hits: Vec<SearchHit>,
        }
        let mut by_file: HashMap<String, FileAcc> = HashMap::new();

        for (ti, term) in terms.iter().enumerate() {
            for hit in self.search(term, mode, limit, None, None) {
                let acc = by_file.entry(hit.file.clone()).or_insert(FileAcc {
                    terms: HashSet::new(),
                    max_mtime: 0,
                    hits: Vec::new(),
                });
                acc.terms.insert(ti);
                acc.max_mtime = acc.max_mtime.max(hit.mtime);
                acc.hits.push(hit);
            }
        }

        let mut files: Vec<(String, FileAcc)> = by_file.into_iter().collect();
        files.sort_by(|a, b| {
            b.1.terms
                .len()
                .cmp(&a.1.terms.len())
                .then_with(|| b.1.max_mtime.cmp(&a.1.max_mtime))
                .then_with(|| a.0.cmp(&b.0))
        });
        files.truncate(file_limit);

        files
            .into_iter()
            .map(|(file, acc)| FileHits {
                file,
                terms_matched: acc.terms.len(),
                hits: acc.hits,
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Files
    // -----------------------------------------------------------------------

    /// List files, optionally filtered by a glob-like pattern (`*` matches
    /// any run; anything else is a substring match).
    pub fn list_files(&self, pattern: Option<&str>, mode: SearchMode, limit: usize) -> Vec<FileMeta> {
        let matcher: Box<dyn Fn(&str) -> bool> = match pattern {
            Some(p) if p.contains('*') => {
                let escaped: String = p
                    .split('*')
                    .map(regex::escape)
                    .collect::<Vec<_>>()
                    .join(".*");
                match Regex::new(&escaped) {
                    Ok(re) => Box::new(move |path: &str| re.is_match(path)),
                    Err(_) => Box::new(|_| false),
                }
            }
            Some(p) => {
                let needle = p.to_string();
                Box::new(move |path: &str| path.contains(&needle))
            }
            None => Box::new(|_| true),
        };

        let mut matched: Vec<FileMeta> =
            self.files.values().filter(|f| matcher(&f.rel_path)).cloned().collect();
        match mode {
            SearchMode::Recent => matched.sort_by(|a, b| {
                b.mtime.cmp(&a.mtime).then_with(|| a.rel_path.cmp(&b.rel_path))
            }),
            SearchMode::Lexicographic => matched.sort_by(|a, b| a.rel_path.cmp(&b.rel_path)),
        }
        matched.truncate(limit);
        matched
    }

    pub fn file_meta(&self, rel_path: &str) -> Option<&FileMeta> {
        self.files.get(rel_path)
    }

    pub fn files(&self) -> impl Iterator<Item = &FileMeta> {
        self.files.values()
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }

    pub fn changes(&self) -> Vec<ChangeRecord> {
        self.changes.iter().cloned().collect()
    }

    // -----------------------------------------------------------------------
    // Structure
    // -----------------------------------------------------------------------

    /// Bounded directory tree: nested objects down to `depth` levels, with
    /// file names listed per directory and deeper content summarized as a
    /// `files_below` count.
    pub fn structure(&self, focus: Option<&str>, depth: usize) -> serde_json::Value {
        #[derive(Default)]
        struct Node {
            dirs: BTreeMap<String, Node>,
            files: Vec<String>,
        }

        let mut root = Node::default();
        let focus = focus.map(|f| f.trim_matches('/').to_string()).filter(|f| !f.is_empty());

        for rel in self.files.keys() {
            let scoped = match &focus {
                Some(prefix) => match rel.strip_prefix(&format!("{prefix}/")) {
                    Some(rest) => rest,
                    None => continue,
                },
                None => rel.as_str(),
            };
            let parts: Vec<&str> = scoped.split('/').collect();
            let mut node = &mut root;
            for part in &parts[..parts.len() - 1] {
                node = node.dirs.entry(part.to_string()).or_default();
            }
            node.files.push(parts[parts.len() - 1].to_string());
        }

        fn count_files(node: &Node) -> usize {
            node.files.len() + node.dirs.values().map(count_files).sum::<usize>()
        }

        fn render(node: &Node, depth_left: usize) -> serde_json::Value {
            let mut map = serde_json::Map::new();
            if !node.files.is_empty() {
                let mut names = node.files.clone();
                names.sort();
                map.insert("_files".to_string(), serde_json::json!(names));
            }
            for (name, child) in &node.dirs {
                if depth_left <= 1 {
                    map.insert(
                        name.clone(),
                        serde_json::json!({ "files_below": count_files(child) }),
                    );
                } else {
                    map.insert(name.clone(), render(child, depth_left - 1));
                }
            }
            serde_json::Value::Object(map)
        }

        render(&root, depth.max(1))
    }

    /// Outline a file by reading it from disk. Empty when the file is gone or
    /// no parser covers its language.
    pub fn outline(&self, rel_path: &str) -> Vec<OutlineSymbol> {
        let abs = self.root.join(rel_path);
        let ext = abs.extension().and_then(|e| e.to_str()).unwrap_or("").to_string();
        match fs::read(&abs) {
            Ok(bytes) => outline::outline_file(&String::from_utf8_lossy(&bytes), &ext),
            Err(_) => Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Registry of per-project indexes
// ---------------------------------------------------------------------------

/// All indexed projects. Each index sits behind its own readers-writer lock;
/// readers never block each other.
#[derive(Default)]
pub struct IndexSet {
    projects: dashmap::DashMap<String, Arc<RwLock<CodeIndex>>>,
}

impl IndexSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, project: &str, index: CodeIndex) {
        self.projects.insert(project.to_string(), Arc::new(RwLock::new(index)));
    }

    pub fn get(&self, project: &str) -> Option<Arc<RwLock<CodeIndex>>> {
        self.projects.get(project).map(|e| Arc::clone(e.value()))
    }

    /// Find the project owning an absolute path, for watcher dispatch.
    pub fn project_for_path(&self, path: &Path) -> Option<(String, Arc<RwLock<CodeIndex>>)> {
        for entry in self.projects.iter() {
            let root = entry.value().read().ok()?.root.clone();
            if path.starts_with(&root) {
                return Some((entry.key().clone(), Arc::clone(entry.value())));
            }
        }
        None
    }

    pub fn project_ids(&self) -> Vec<String> {
        self.projects.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn fixture() -> (tempfile::TempDir, CodeIndex) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        fs::create_dir_all(root.join("src/auth")).unwrap();
        fs::create_dir_all(root.join("node_modules/junk")).unwrap();

        let mut f = fs::File::create(root.join("src/auth/login.py")).unwrap();
        writeln!(f, "def authenticate(user, password):").unwrap();
        writeln!(f, "    return verify_password(user, password)").unwrap();

        let mut f = fs::File::create(root.join("src/session.py")).unwrap();
        writeln!(f, "from auth.login import authenticate").unwrap();
        writeln!(f, "SESSION_TTL = 3600").unwrap();

        let mut f = fs::File::create(root.join("node_modules/junk/skipme.py")).unwrap();
        writeln!(f, "authenticate = None").unwrap();

        // Not a recognized language: ignored entirely.
        fs::write(root.join("notes.txt"), "authenticate everywhere").unwrap();

        let config = IndexConfig::new(root.to_path_buf());
        let index = CodeIndex::scan("test", root, config);
        (dir, index)
    }

    #[test]
    fn scan_skips_noise_and_unknown_languages() {
        let (_dir, index) = fixture();
        assert_eq!(index.file_count(), 2);
        assert!(index.file_meta("src/auth/login.py").is_some());
        assert!(index.file_meta("node_modules/junk/skipme.py").is_none());
        assert!(index.file_meta("notes.txt").is_none());
    }

    #[test]
    fn search_finds_tokens_case_insensitively() {
        let (_dir, index) = fixture();
        let hits = index.search("authenticate", SearchMode::Recent, 10, None, None);
        assert!(hits.len() >= 2);
        assert!(hits.iter().any(|h| h.file == "src/auth/login.py"));
        assert!(hits.iter().any(|h| h.file == "src/session.py"));

        // Uppercase query merges against the lowercase list.
        let upper = index.search("SESSION_TTL", SearchMode::Recent, 10, None, None);
        assert!(upper.iter().any(|h| h.file == "src/session.py"));
    }

    #[test]
    fn search_dedupes_by_file_and_line() {
        let (_dir, index) = fixture();
        let hits = index.search("password", SearchMode::Recent, 10, None, None);
        let mut seen = HashSet::new();
        for h in &hits {
            assert!(seen.insert((h.file.clone(), h.line)), "duplicate hit {}:{}", h.file, h.line);
        }
    }

    #[test]
    fn filename_boost_prefers_matching_basenames() {
        assert_eq!(CodeIndex::filename_boost("login", "src/auth/login.py"), 1_000);
        assert_eq!(CodeIndex::filename_boost("userauth", "src/user_auth.py"), 1_000);
        assert_eq!(CodeIndex::filename_boost("auth", "src/auth/session.py"), 100);
        assert_eq!(CodeIndex::filename_boost("nothing", "src/main.rs"), 0);
    }

    #[test]
    fn empty_query_returns_nothing() {
        let (_dir, index) = fixture();
        assert!(index.search("", SearchMode::Recent, 10, None, None).is_empty());
    }

    #[test]
    fn overlong_identifiers_truncate_consistently() {
        let dir = tempfile::tempdir().unwrap();
        let long_name = "x".repeat(MAX_TOKEN_LEN + 40);
        std::fs::write(dir.path().join("big.py"), format!("{long_name} = 1\n")).unwrap();
        let index = CodeIndex::scan("t", dir.path(), IndexConfig::new(dir.path().to_path_buf()));

        // Both the indexed token and the query are cut at the same limit, so
        // the full-length query still finds the file.
        let hits = index.search(&long_name, SearchMode::Recent, 10, None, None);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].file, "big.py");
    }

    #[test]
    fn every_location_references_a_known_file() {
        let (_dir, index) = fixture();
        for locations in index.tokens.values() {
            for l in locations {
                let meta = index.files.get(&l.file);
                assert!(meta.is_some(), "location references unindexed file {}", l.file);
                assert!(meta.unwrap().mtime >= l.mtime);
            }
        }
    }

    #[test]
    fn reindex_skips_unchanged_content() {
        let (_dir, mut index) = fixture();
        assert!(!index.reindex_one("src/session.py"));
    }

    #[test]
    fn reindex_replaces_stale_locations() {
        let (dir, mut index) = fixture();
        let path = dir.path().join("src/session.py");
        fs::write(&path, "def refresh_token():\n    pass\n").unwrap();

        assert!(index.reindex_one("src/session.py"));
        assert!(index
            .search("SESSION_TTL", SearchMode::Recent, 10, None, None)
            .is_empty());
        assert!(!index
            .search("refresh_token", SearchMode::Recent, 10, None, None)
            .is_empty());
    }

    #[test]
    fn delete_purges_locations_and_meta() {
        let (dir, mut index) = fixture();
        fs::remove_file(dir.path().join("src/session.py")).unwrap();
        index.on_event(ChangeKind::Deleted, "src/session.py");

        assert!(index.file_meta("src/session.py").is_none());
        assert!(index
            .search("SESSION_TTL", SearchMode::Recent, 10, None, None)
            .is_empty());
        let changes = index.changes();
        assert_eq!(changes.last().unwrap().kind, ChangeKind::Deleted);
    }

    #[test]
    fn import_graph_links_files() {
        let (_dir, index) = fixture();
        let (outgoing, _) = index.deps("src/session.py");
        assert_eq!(outgoing, vec!["src/auth/login.py"]);
        let (_, incoming) = index.deps("src/auth/login.py");
        assert_eq!(incoming, vec!["src/session.py"]);
    }

    #[test]
    fn list_files_with_glob_and_substring() {
        let (_dir, index) = fixture();
        let globbed = index.list_files(Some("src/*.py"), SearchMode::Lexicographic, 10);
        assert!(globbed.iter().any(|f| f.rel_path == "src/session.py"));

        let substring = index.list_files(Some("auth"), SearchMode::Lexicographic, 10);
        assert_eq!(substring.len(), 1);
        assert_eq!(substring[0].rel_path, "src/auth/login.py");

        let all = index.list_files(None, SearchMode::Lexicographic, 1);
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn multi_search_ranks_by_terms_matched() {
        let (_dir, index) = fixture();
        let results = index.multi_search(
            &["authenticate".to_string(), "verify_password".to_string()],
            SearchMode::Recent,
            20,
            10,
        );
        assert!(!results.is_empty());
        // login.py matches both terms; session.py only one.
        assert_eq!(results[0].file, "src/auth/login.py");
        assert_eq!(results[0].terms_matched, 2);
    }

    #[test]
    fn structure_is_bounded() {
        let (_dir, index) = fixture();
        let tree = index.structure(None, 3);
        let src = tree.get("src").expect("src dir present");
        assert!(src.get("auth").is_some());

        let shallow = index.structure(None, 1);
        let src = shallow.get("src").expect("src dir present");
        assert_eq!(src.get("files_below").and_then(|v| v.as_u64()), Some(2));

        let focused = index.structure(Some("src"), 2);
        assert!(focused.get("auth").is_some());
    }
}
