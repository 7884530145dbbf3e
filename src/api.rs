//! HTTP API handlers.
//!
//! JSON in, JSON out; every payload carries `"ms"` with the handler's elapsed
//! time. Scored state (intent, rank, predict, tuner) is strictly namespaced
//! by the posted project id, falling through to the reserved global bucket.
//! Index queries resolve against the default project when none is named,
//! mirroring how a single-root deployment is used.

use axum::extract::{Json, Query, State};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tracing::warn;

use crate::error::ApiError;
use crate::evaluator::{Evaluator, EVAL_WINDOW_SECS};
use crate::index::{CodeIndex, IndexSet, SearchMode};
use crate::intent::IntentGraph;
use crate::outline::EnrichmentStore;
use crate::predict::{PredictParams, PredictionEngine, DEFAULT_LIMIT, DEFAULT_SNIPPET_LINES};
use crate::registry::ProjectRegistry;
use crate::scorer::Scorer;
use crate::session_log;
use crate::transition::TransitionModel;
use crate::tuner::WeightTuner;
use crate::types::{canonical_project, now_unix, relativize, validate_path, MAX_FILE_READ};

/// Finalize age used by the background maintenance loop and the default for
/// the finalize endpoint.
pub const FINALIZE_AGE_SECS: u64 = 3_600;

type ApiResult = Result<Json<serde_json::Value>, ApiError>;

// ---------------------------------------------------------------------------
// Application state
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppContext {
    pub indexes: Arc<IndexSet>,
    pub intents: Arc<IntentGraph>,
    pub scorer: Arc<Scorer>,
    pub transitions: Arc<TransitionModel>,
    pub evaluator: Arc<Evaluator>,
    pub tuner: Arc<WeightTuner>,
    pub engine: Arc<PredictionEngine>,
    pub registry: Arc<ProjectRegistry>,
    pub enrichment: Arc<EnrichmentStore>,
    /// Project used for index queries when the caller names none.
    pub default_project: Option<String>,
    pub start_time: Instant,
}

impl AppContext {
    /// Resolve an index-backed project: explicit id, or the default project.
    fn index_project(
        &self,
        id: Option<&str>,
    ) -> Result<(String, Arc<RwLock<CodeIndex>>), ApiError> {
        let id = match id.map(str::trim).filter(|s| !s.is_empty()) {
            Some(explicit) => explicit.to_string(),
            None => self
                .default_project
                .clone()
                .ok_or_else(|| ApiError::not_found("no project registered"))?,
        };
        let index = self
            .indexes
            .get(&id)
            .ok_or_else(|| ApiError::not_found(format!("unknown project: {id}")))?;
        Ok((id, index))
    }

    /// Translate hook-posted absolute paths into project-relative keys.
    fn relativize_all(&self, project: &str, files: &[String]) -> Vec<String> {
        match self.registry.root_of(project) {
            Some(root) => files.iter().map(|f| relativize(&root, f)).collect(),
            None => files.to_vec(),
        }
    }
}

fn ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

fn with_ms(mut value: serde_json::Value, start: Instant) -> Json<serde_json::Value> {
    if let Some(map) = value.as_object_mut() {
        map.insert("ms".to_string(), json!(ms(start)));
    }
    Json(value)
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, ApiError> {
    serde_json::to_value(value).map_err(|e| ApiError::Internal(e.to_string()))
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn router(ctx: AppContext) -> Router {
    Router::new()
        .route("/health", get(api_health))
        .route("/intent", post(api_intent))
        .route("/intent/tags", get(api_intent_tags))
        .route("/intent/files", get(api_intent_files))
        .route("/intent/file", get(api_intent_file))
        .route("/intent/recent", get(api_intent_recent))
        .route("/intent/stats", get(api_intent_stats))
        .route("/symbol", get(api_symbol))
        .route("/multi", get(api_multi_get).post(api_multi_post))
        .route("/files", get(api_files))
        .route("/file", get(api_file))
        .route("/file/meta", get(api_file_meta))
        .route("/deps", get(api_deps))
        .route("/structure", get(api_structure))
        .route("/outline", get(api_outline))
        .route("/outline/enriched", post(api_outline_enriched))
        .route("/outline/tags", get(api_outline_tags))
        .route("/outline/pending", get(api_outline_pending))
        .route("/changes", get(api_changes))
        .route("/rank", get(api_rank))
        .route("/rank/record", post(api_rank_record))
        .route("/rank/decay", post(api_rank_decay))
        .route("/predict", get(api_predict_get).post(api_predict_post))
        .route("/context", post(api_context))
        .route("/predict/log", post(api_predict_log))
        .route("/predict/check", post(api_predict_check))
        .route("/predict/stats", get(api_predict_stats))
        .route("/predict/finalize", post(api_predict_finalize))
        .route("/sessions/replay", post(api_sessions_replay))
        .route("/tuner/weights", get(api_tuner_weights))
        .route("/tuner/best", get(api_tuner_best))
        .route("/tuner/stats", get(api_tuner_stats))
        .route("/tuner/feedback", post(api_tuner_feedback))
        .route("/tuner/reset", post(api_tuner_reset))
        .route("/metrics", get(api_metrics))
        .with_state(ctx)
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

async fn api_health(State(ctx): State<AppContext>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "projects": ctx.indexes.project_ids().len(),
        "uptime_seconds": ctx.start_time.elapsed().as_secs(),
    }))
}

// ---------------------------------------------------------------------------
// Intent
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct IntentBody {
    session_id: Option<String>,
    project_id: Option<String>,
    tool: String,
    #[serde(default)]
    files: Vec<String>,
    #[serde(default)]
    tags: Vec<String>,
    tool_use_id: Option<String>,
    file_sizes: Option<HashMap<String, u64>>,
    output_size: Option<u64>,
}

/// Ingest one hook-posted intent: append the record, bump scoring signals,
/// and feed the transition model for reads. Store failures degrade to the
/// in-memory record; the producer is fire-and-forget and tolerates loss.
async fn api_intent(State(ctx): State<AppContext>, Json(body): Json<IntentBody>) -> ApiResult {
    let start = Instant::now();
    let project = canonical_project(body.project_id.as_deref());
    let session = body.session_id.unwrap_or_else(|| "unknown".to_string());

    let files = ctx.relativize_all(&project, &body.files);
    let file_sizes = body.file_sizes.map(|sizes| {
        sizes
            .into_iter()
            .map(|(path, size)| {
                let rel = ctx.relativize_all(&project, std::slice::from_ref(&path));
                (rel.into_iter().next().unwrap_or(path), size)
            })
            .collect::<HashMap<String, u64>>()
    });

    let record = ctx.intents.record(
        &project,
        &body.tool,
        files,
        body.tags,
        &session,
        body.tool_use_id,
        file_sizes,
        body.output_size,
        None,
    );

    let scoreable: Vec<&String> = record
        .files
        .iter()
        .filter(|f| !f.is_empty() && !f.starts_with("pattern:") && !f.starts_with("cmd:"))
        .collect();
    let is_read = body.tool == "Read" || record.tags.iter().any(|t| t == "reading");

    for file in &scoreable {
        if let Err(e) = ctx.scorer.record_access(&project, file, &record.tags, None).await {
            warn!(error = %e, "Scorer write failed for intent, continuing");
        }
        if is_read {
            if let Err(e) = ctx
                .transitions
                .record_access(&project, file, &body.tool, &session, now_unix() as f64)
                .await
            {
                warn!(error = %e, "Transition write failed for intent, continuing");
            }
        }
    }

    Ok(with_ms(
        json!({
            "ok": true,
            "project_id": project,
            "files": scoreable.len(),
            "tags": record.tags,
        }),
        start,
    ))
}

#[derive(Deserialize)]
struct ProjectQuery {
    project_id: Option<String>,
}

async fn api_intent_tags(
    State(ctx): State<AppContext>,
    Query(q): Query<ProjectQuery>,
) -> ApiResult {
    let start = Instant::now();
    let project = canonical_project(q.project_id.as_deref());
    let tags = ctx.intents.tags_with_counts(&project);
    Ok(with_ms(json!({ "project_id": project, "tags": to_value(&tags)? }), start))
}

#[derive(Deserialize)]
struct TagQuery {
    tag: Option<String>,
    project_id: Option<String>,
}

async fn api_intent_files(
    State(ctx): State<AppContext>,
    Query(q): Query<TagQuery>,
) -> ApiResult {
    let start = Instant::now();
    let tag = q.tag.filter(|t| !t.trim().is_empty()).ok_or_else(|| {
        ApiError::bad_request("missing required parameter: tag")
    })?;
    let project = canonical_project(q.project_id.as_deref());
    let files = ctx.intents.files_for_tag(&project, &tag);
    Ok(with_ms(json!({ "tag": tag, "files": files, "project_id": project }), start))
}

#[derive(Deserialize)]
struct IntentFileQuery {
    path: Option<String>,
    project_id: Option<String>,
}

async fn api_intent_file(
    State(ctx): State<AppContext>,
    Query(q): Query<IntentFileQuery>,
) -> ApiResult {
    let start = Instant::now();
    let path = q.path.filter(|p| !p.trim().is_empty()).ok_or_else(|| {
        ApiError::bad_request("missing required parameter: path")
    })?;
    let project = canonical_project(q.project_id.as_deref());
    let tags = ctx.intents.tags_for_file(&project, &path);
    Ok(with_ms(json!({ "path": path, "tags": tags, "project_id": project }), start))
}

#[derive(Deserialize)]
struct RecentQuery {
    since: Option<u64>,
    limit: Option<usize>,
    project_id: Option<String>,
}

async fn api_intent_recent(
    State(ctx): State<AppContext>,
    Query(q): Query<RecentQuery>,
) -> ApiResult {
    let start = Instant::now();
    let project = canonical_project(q.project_id.as_deref());
    let records = ctx.intents.recent(&project, q.since, q.limit.unwrap_or(20));
    let stats = ctx.intents.stats(&project);
    Ok(with_ms(
        json!({
            "project_id": project,
            "records": to_value(&records)?,
            "stats": to_value(&stats)?,
        }),
        start,
    ))
}

async fn api_intent_stats(
    State(ctx): State<AppContext>,
    Query(q): Query<ProjectQuery>,
) -> ApiResult {
    let start = Instant::now();
    let project = canonical_project(q.project_id.as_deref());
    let stats = ctx.intents.stats(&project);
    let mut value = to_value(&stats)?;
    if let Some(map) = value.as_object_mut() {
        map.insert("project_id".to_string(), json!(project));
        map.insert("total_records".to_string(), json!(stats.records));
    }
    Ok(with_ms(value, start))
}

// ---------------------------------------------------------------------------
// Index: search
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct SymbolQuery {
    q: Option<String>,
    mode: Option<String>,
    limit: Option<usize>,
    project: Option<String>,
    since: Option<u64>,
    before: Option<u64>,
}

async fn api_symbol(State(ctx): State<AppContext>, Query(q): Query<SymbolQuery>) -> ApiResult {
    let start = Instant::now();
    let query = q.q.filter(|s| !s.trim().is_empty()).ok_or_else(|| {
        ApiError::bad_request("missing required parameter: q")
    })?;
    let (project, index) = ctx.index_project(q.project.as_deref())?;
    let mode = SearchMode::parse(q.mode.as_deref());
    let limit = q.limit.unwrap_or(50).min(500);

    let hits = {
        let index = index.read().map_err(|_| ApiError::Internal("index lock poisoned".into()))?;
        index.search(&query, mode, limit, q.since, q.before)
    };
    Ok(with_ms(
        json!({
            "query": query,
            "project": project,
            "count": hits.len(),
            "hits": to_value(&hits)?,
        }),
        start,
    ))
}

#[derive(Deserialize)]
struct MultiGetQuery {
    q: Option<String>,
    mode: Option<String>,
    limit: Option<usize>,
    file_limit: Option<usize>,
    project: Option<String>,
}

#[derive(Deserialize)]
struct MultiBody {
    terms: Vec<String>,
    mode: Option<String>,
    limit: Option<usize>,
    file_limit: Option<usize>,
    project: Option<String>,
}

async fn api_multi_get(
    State(ctx): State<AppContext>,
    Query(q): Query<MultiGetQuery>,
) -> ApiResult {
    let terms: Vec<String> = q
        .q
        .unwrap_or_default()
        .split(',')
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    run_multi(ctx, terms, q.mode, q.limit, q.file_limit, q.project).await
}

async fn api_multi_post(State(ctx): State<AppContext>, Json(body): Json<MultiBody>) -> ApiResult {
    let terms = body.terms.into_iter().filter(|t| !t.trim().is_empty()).collect();
    run_multi(ctx, terms, body.mode, body.limit, body.file_limit, body.project).await
}

async fn run_multi(
    ctx: AppContext,
    terms: Vec<String>,
    mode: Option<String>,
    limit: Option<usize>,
    file_limit: Option<usize>,
    project: Option<String>,
) -> ApiResult {
    let start = Instant::now();
    if terms.is_empty() {
        return Err(ApiError::bad_request("no search terms supplied"));
    }
    let (project, index) = ctx.index_project(project.as_deref())?;
    let mode = SearchMode::parse(mode.as_deref());
    let limit = limit.unwrap_or(50).min(500);
    let file_limit = file_limit.unwrap_or(10).min(100);

    let files = {
        let index = index.read().map_err(|_| ApiError::Internal("index lock poisoned".into()))?;
        index.multi_search(&terms, mode, limit, file_limit)
    };
    Ok(with_ms(
        json!({
            "terms": terms,
            "project": project,
            "files": to_value(&files)?,
        }),
        start,
    ))
}

// ---------------------------------------------------------------------------
// Index: files
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct FilesQuery {
    #[serde(rename = "match")]
    pattern: Option<String>,
    mode: Option<String>,
    limit: Option<usize>,
    project: Option<String>,
}

async fn api_files(State(ctx): State<AppContext>, Query(q): Query<FilesQuery>) -> ApiResult {
    let start = Instant::now();
    let (project, index) = ctx.index_project(q.project.as_deref())?;
    let mode = SearchMode::parse(q.mode.as_deref());
    let limit = q.limit.unwrap_or(100).min(1_000);

    let files = {
        let index = index.read().map_err(|_| ApiError::Internal("index lock poisoned".into()))?;
        index.list_files(q.pattern.as_deref(), mode, limit)
    };
    Ok(with_ms(
        json!({
            "project": project,
            "count": files.len(),
            "files": to_value(&files)?,
        }),
        start,
    ))
}

#[derive(Deserialize)]
struct FileQuery {
    path: Option<String>,
    lines: Option<usize>,
    symbol: Option<String>,
    project: Option<String>,
}

/// Raw or symbol-window file content.
async fn api_file(State(ctx): State<AppContext>, Query(q): Query<FileQuery>) -> ApiResult {
    let start = Instant::now();
    let path = q.path.filter(|p| !p.trim().is_empty()).ok_or_else(|| {
        ApiError::bad_request("missing required parameter: path")
    })?;
    let (_, index) = ctx.index_project(q.project.as_deref())?;

    let (root, symbols) = {
        let index = index.read().map_err(|_| ApiError::Internal("index lock poisoned".into()))?;
        let symbols = q.symbol.as_ref().map(|_| index.outline(&path));
        (index.root.clone(), symbols)
    };

    let abs = validate_path(&root, &path).map_err(|e| match e {
        "File not found" | "Root not found" => ApiError::not_found(e),
        _ => ApiError::bad_request(e),
    })?;
    let raw = std::fs::read_to_string(&abs)
        .map_err(|_| ApiError::not_found(format!("unreadable file: {path}")))?;

    if let Some(symbol_name) = q.symbol {
        let symbols = symbols.unwrap_or_default();
        let symbol = symbols
            .iter()
            .find(|s| s.name == symbol_name)
            .ok_or_else(|| ApiError::not_found(format!("symbol not found: {symbol_name}")))?;
        let from = symbol.start_line.saturating_sub(1) as usize;
        let to = symbol.end_line as usize;
        let window: Vec<&str> = raw.lines().skip(from).take(to - from).collect();
        return Ok(with_ms(
            json!({
                "path": path,
                "symbol": symbol_name,
                "start_line": symbol.start_line,
                "end_line": symbol.end_line,
                "content": window.join("\n"),
            }),
            start,
        ));
    }

    let truncated_at = q.lines.unwrap_or(usize::MAX);
    let mut content: String = raw
        .lines()
        .take(truncated_at)
        .collect::<Vec<_>>()
        .join("\n");
    let mut truncated = q.lines.map(|n| raw.lines().count() > n).unwrap_or(false);
    if content.len() > MAX_FILE_READ {
        content = content[..content.floor_char_boundary(MAX_FILE_READ)].to_string();
        truncated = true;
    }
    let line_count = content.lines().count();
    Ok(with_ms(
        json!({
            "path": path,
            "content": content,
            "lines": line_count,
            "truncated": truncated,
        }),
        start,
    ))
}

#[derive(Deserialize)]
struct FileMetaQuery {
    path: Option<String>,
    project: Option<String>,
}

async fn api_file_meta(
    State(ctx): State<AppContext>,
    Query(q): Query<FileMetaQuery>,
) -> ApiResult {
    let start = Instant::now();
    let path = q.path.filter(|p| !p.trim().is_empty()).ok_or_else(|| {
        ApiError::bad_request("missing required parameter: path")
    })?;
    let (project, index) = ctx.index_project(q.project.as_deref())?;

    let index = index.read().map_err(|_| ApiError::Internal("index lock poisoned".into()))?;
    let meta = index
        .file_meta(&path)
        .ok_or_else(|| ApiError::not_found(format!("file not indexed: {path}")))?;
    Ok(with_ms(
        json!({
            "path": meta.rel_path,
            "project": project,
            "size": meta.size,
            "mtime": meta.mtime,
            "language": meta.language,
            "fingerprint": meta.fingerprint,
            "tokens_estimate": meta.size / crate::types::BYTES_PER_TOKEN,
        }),
        start,
    ))
}

#[derive(Deserialize)]
struct DepsQuery {
    file: Option<String>,
    direction: Option<String>,
    project: Option<String>,
}

async fn api_deps(State(ctx): State<AppContext>, Query(q): Query<DepsQuery>) -> ApiResult {
    let start = Instant::now();
    let file = q.file.filter(|f| !f.trim().is_empty()).ok_or_else(|| {
        ApiError::bad_request("missing required parameter: file")
    })?;
    let (_, index) = ctx.index_project(q.project.as_deref())?;
    let direction = q.direction.as_deref().unwrap_or("both");

    let (imports, imported_by) = {
        let index = index.read().map_err(|_| ApiError::Internal("index lock poisoned".into()))?;
        index.deps(&file)
    };
    let outgoing = matches!(direction, "both" | "outgoing").then_some(imports).unwrap_or_default();
    let incoming =
        matches!(direction, "both" | "incoming").then_some(imported_by).unwrap_or_default();
    Ok(with_ms(
        json!({ "file": file, "imports": outgoing, "imported_by": incoming }),
        start,
    ))
}

#[derive(Deserialize)]
struct StructureQuery {
    focus: Option<String>,
    depth: Option<usize>,
    project: Option<String>,
}

async fn api_structure(
    State(ctx): State<AppContext>,
    Query(q): Query<StructureQuery>,
) -> ApiResult {
    let start = Instant::now();
    let (project, index) = ctx.index_project(q.project.as_deref())?;
    let depth = q.depth.unwrap_or(2).clamp(1, 8);
    let tree = {
        let index = index.read().map_err(|_| ApiError::Internal("index lock poisoned".into()))?;
        index.structure(q.focus.as_deref(), depth)
    };
    Ok(with_ms(json!({ "project": project, "depth": depth, "tree": tree }), start))
}

async fn api_changes(State(ctx): State<AppContext>, Query(q): Query<ProjectQuery>) -> ApiResult {
    let start = Instant::now();
    let (project, index) = ctx.index_project(q.project_id.as_deref())?;
    let changes = {
        let index = index.read().map_err(|_| ApiError::Internal("index lock poisoned".into()))?;
        index.changes()
    };
    Ok(with_ms(
        json!({ "project": project, "count": changes.len(), "changes": to_value(&changes)? }),
        start,
    ))
}

// ---------------------------------------------------------------------------
// Outline
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct OutlineQuery {
    file: Option<String>,
    project: Option<String>,
}

async fn api_outline(State(ctx): State<AppContext>, Query(q): Query<OutlineQuery>) -> ApiResult {
    let start = Instant::now();
    let file = q.file.filter(|f| !f.trim().is_empty()).ok_or_else(|| {
        ApiError::bad_request("missing required parameter: file")
    })?;
    let (_, index) = ctx.index_project(q.project.as_deref())?;
    let symbols = {
        let index = index.read().map_err(|_| ApiError::Internal("index lock poisoned".into()))?;
        index.outline(&file)
    };
    Ok(with_ms(
        json!({ "file": file, "count": symbols.len(), "symbols": to_value(&symbols)? }),
        start,
    ))
}

#[derive(Deserialize)]
struct EnrichedSymbolBody {
    #[serde(alias = "name")]
    symbol: String,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Deserialize)]
struct EnrichedBody {
    project_id: Option<String>,
    file: String,
    #[serde(default)]
    symbols: Vec<EnrichedSymbolBody>,
}

async fn api_outline_enriched(
    State(ctx): State<AppContext>,
    Json(body): Json<EnrichedBody>,
) -> ApiResult {
    let start = Instant::now();
    if body.file.trim().is_empty() {
        return Err(ApiError::bad_request("missing required field: file"));
    }
    let project = canonical_project(body.project_id.as_deref());
    let entries: Vec<(String, Vec<String>)> =
        body.symbols.into_iter().map(|s| (s.symbol, s.tags)).collect();
    ctx.enrichment.add(&project, &body.file, &entries);
    Ok(with_ms(
        json!({ "ok": true, "file": body.file, "symbols": entries.len() }),
        start,
    ))
}

#[derive(Deserialize)]
struct OutlineTagsQuery {
    file: Option<String>,
    project: Option<String>,
    counts: Option<bool>,
}

async fn api_outline_tags(
    State(ctx): State<AppContext>,
    Query(q): Query<OutlineTagsQuery>,
) -> ApiResult {
    let start = Instant::now();
    let file = q.file.filter(|f| !f.trim().is_empty()).ok_or_else(|| {
        ApiError::bad_request("missing required parameter: file")
    })?;
    let project = canonical_project(q.project.as_deref());
    let symbols = ctx.enrichment.tags_for(&project, &file, q.counts.unwrap_or(false));
    Ok(with_ms(json!({ "file": file, "symbols": to_value(&symbols)? }), start))
}

#[derive(Deserialize)]
struct PendingQuery {
    project: Option<String>,
    limit: Option<usize>,
}

/// Files modified since their last enrichment (never-enriched files count).
async fn api_outline_pending(
    State(ctx): State<AppContext>,
    Query(q): Query<PendingQuery>,
) -> ApiResult {
    let start = Instant::now();
    let (project, index) = ctx.index_project(q.project.as_deref())?;
    let limit = q.limit.unwrap_or(50).min(500);

    let mut pending: Vec<(String, u64)> = {
        let index = index.read().map_err(|_| ApiError::Internal("index lock poisoned".into()))?;
        index
            .files()
            .filter(|meta| {
                match ctx.enrichment.last_enriched(&project, &meta.rel_path) {
                    Some(enriched_at) => meta.mtime > enriched_at,
                    None => true,
                }
            })
            .map(|meta| (meta.rel_path.clone(), meta.mtime))
            .collect()
    };
    pending.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    pending.truncate(limit);
    let files: Vec<String> = pending.into_iter().map(|(f, _)| f).collect();
    Ok(with_ms(
        json!({ "project": project, "count": files.len(), "files": files }),
        start,
    ))
}

// ---------------------------------------------------------------------------
// Ranking
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct RankQuery {
    tag: Option<String>,
    limit: Option<usize>,
    project: Option<String>,
}

async fn api_rank(State(ctx): State<AppContext>, Query(q): Query<RankQuery>) -> ApiResult {
    let start = Instant::now();
    let project = canonical_project(q.project.as_deref());
    let tags: Vec<String> = q
        .tag
        .unwrap_or_default()
        .split(',')
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    let limit = q.limit.unwrap_or(10).min(100);

    let weights = match ctx.tuner.best(&project).await {
        Ok(best) => best.weights,
        Err(e) => {
            warn!(error = %e, "Tuner unavailable, ranking with default weights");
            ctx.tuner.default_weights()
        }
    };
    let files = ctx.scorer.ranked_files(&project, &tags, limit, weights, None).await?;
    Ok(with_ms(
        json!({
            "project_id": project,
            "tags": tags,
            "weights": to_value(&weights)?,
            "files": to_value(&files)?,
        }),
        start,
    ))
}

#[derive(Deserialize)]
struct RankRecordBody {
    file: String,
    #[serde(default)]
    tags: Vec<String>,
    project_id: Option<String>,
}

async fn api_rank_record(
    State(ctx): State<AppContext>,
    Json(body): Json<RankRecordBody>,
) -> ApiResult {
    let start = Instant::now();
    if body.file.trim().is_empty() {
        return Err(ApiError::bad_request("missing required field: file"));
    }
    let project = canonical_project(body.project_id.as_deref());
    let file = ctx
        .relativize_all(&project, std::slice::from_ref(&body.file))
        .into_iter()
        .next()
        .unwrap_or(body.file);
    let tags: Vec<String> = body
        .tags
        .iter()
        .map(|t| crate::intent::canonical_tag(t))
        .filter(|t| !t.is_empty())
        .collect();

    let scores = ctx.scorer.record_access(&project, &file, &tags, None).await?;
    Ok(with_ms(
        json!({ "file": file, "project_id": project, "scores": to_value(&scores)? }),
        start,
    ))
}

#[derive(Deserialize)]
struct DecayBody {
    project_id: Option<String>,
    half_life_seconds: Option<f64>,
}

async fn api_rank_decay(
    State(ctx): State<AppContext>,
    Json(body): Json<DecayBody>,
) -> ApiResult {
    let start = Instant::now();
    let project = canonical_project(body.project_id.as_deref());
    let rewritten = ctx.scorer.apply_decay(&project, body.half_life_seconds).await?;
    Ok(with_ms(json!({ "project_id": project, "rewritten": rewritten }), start))
}

// ---------------------------------------------------------------------------
// Prediction
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct PredictGetQuery {
    keywords: Option<String>,
    tags: Option<String>,
    trigger_file: Option<String>,
    limit: Option<usize>,
    snippet_lines: Option<usize>,
    project: Option<String>,
    project_id: Option<String>,
    session_id: Option<String>,
}

#[derive(Deserialize)]
struct PredictBody {
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default)]
    tags: Vec<String>,
    trigger_file: Option<String>,
    limit: Option<usize>,
    snippet_lines: Option<usize>,
    project_id: Option<String>,
    session_id: Option<String>,
}

fn split_csv(raw: Option<String>) -> Vec<String> {
    raw.unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

async fn api_predict_get(
    State(ctx): State<AppContext>,
    Query(q): Query<PredictGetQuery>,
) -> ApiResult {
    let project = canonical_project(q.project_id.as_deref().or(q.project.as_deref()));
    let params = PredictParams {
        keywords: split_csv(q.keywords),
        tags: split_csv(q.tags),
        trigger_file: q.trigger_file,
        session: q.session_id.unwrap_or_else(|| "unknown".to_string()),
        limit: q.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, 50),
        snippet_lines: q.snippet_lines.unwrap_or(DEFAULT_SNIPPET_LINES).min(200),
    };
    run_predict(ctx, project, params).await
}

async fn api_predict_post(
    State(ctx): State<AppContext>,
    Json(body): Json<PredictBody>,
) -> ApiResult {
    let project = canonical_project(body.project_id.as_deref());
    let params = PredictParams {
        keywords: body.keywords,
        tags: body.tags,
        trigger_file: body.trigger_file,
        session: body.session_id.unwrap_or_else(|| "unknown".to_string()),
        limit: body.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, 50),
        snippet_lines: body.snippet_lines.unwrap_or(DEFAULT_SNIPPET_LINES).min(200),
    };
    run_predict(ctx, project, params).await
}

async fn run_predict(ctx: AppContext, project: String, mut params: PredictParams) -> ApiResult {
    let start = Instant::now();
    if let Some(trigger) = params.trigger_file.take() {
        let rel = ctx
            .relativize_all(&project, std::slice::from_ref(&trigger))
            .into_iter()
            .next()
            .unwrap_or(trigger);
        params.trigger_file = Some(rel);
    }
    let prediction = ctx.engine.predict(&project, &params).await?;
    let mut value = to_value(&prediction)?;
    if let Some(map) = value.as_object_mut() {
        map.insert("project_id".to_string(), json!(project));
    }
    Ok(with_ms(value, start))
}

#[derive(Deserialize)]
struct ContextBody {
    #[serde(alias = "prose", alias = "text")]
    intent: String,
    project_id: Option<String>,
    session_id: Option<String>,
    limit: Option<usize>,
    snippet_lines: Option<usize>,
}

async fn api_context(State(ctx): State<AppContext>, Json(body): Json<ContextBody>) -> ApiResult {
    let start = Instant::now();
    if body.intent.trim().is_empty() {
        return Err(ApiError::bad_request("missing required field: intent"));
    }
    let project = canonical_project(body.project_id.as_deref());
    let session = body.session_id.unwrap_or_else(|| "unknown".to_string());
    let (prediction, cached) = ctx
        .engine
        .context(
            &project,
            &body.intent,
            &session,
            body.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, 50),
            body.snippet_lines.unwrap_or(DEFAULT_SNIPPET_LINES).min(200),
        )
        .await?;
    let mut value = to_value(&prediction)?;
    if let Some(map) = value.as_object_mut() {
        map.insert("project_id".to_string(), json!(project));
        map.insert("cached".to_string(), json!(cached));
    }
    Ok(with_ms(value, start))
}

// ---------------------------------------------------------------------------
// Evaluator surface
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct PredictLogBody {
    session_id: Option<String>,
    project_id: Option<String>,
    #[serde(default)]
    predicted_files: Vec<String>,
    #[serde(default)]
    tags: Vec<String>,
    trigger_file: Option<String>,
    confidence: Option<f64>,
}

async fn api_predict_log(
    State(ctx): State<AppContext>,
    Json(body): Json<PredictLogBody>,
) -> ApiResult {
    let start = Instant::now();
    if body.predicted_files.is_empty() {
        return Err(ApiError::bad_request("predicted_files must not be empty"));
    }
    let project = canonical_project(body.project_id.as_deref());
    let session = body.session_id.unwrap_or_else(|| "unknown".to_string());
    let files = ctx.relativize_all(&project, &body.predicted_files);
    let tags: Vec<String> = body
        .tags
        .iter()
        .map(|t| crate::intent::canonical_tag(t))
        .filter(|t| !t.is_empty())
        .collect();

    let batch_id = ctx
        .evaluator
        .log_prediction(
            &project,
            &session,
            &files,
            &tags,
            body.trigger_file.as_deref(),
            body.confidence.unwrap_or(0.0),
            None,
            None,
        )
        .await?;
    Ok(with_ms(json!({ "batch_id": batch_id, "project_id": project }), start))
}

#[derive(Deserialize)]
struct PredictCheckBody {
    session_id: Option<String>,
    project_id: Option<String>,
    file: String,
}

async fn api_predict_check(
    State(ctx): State<AppContext>,
    Json(body): Json<PredictCheckBody>,
) -> ApiResult {
    let start = Instant::now();
    if body.file.trim().is_empty() {
        return Err(ApiError::bad_request("missing required field: file"));
    }
    let project = canonical_project(body.project_id.as_deref());
    let session = body.session_id.unwrap_or_else(|| "unknown".to_string());
    let file = ctx
        .relativize_all(&project, std::slice::from_ref(&body.file))
        .into_iter()
        .next()
        .unwrap_or(body.file);

    let result = ctx.evaluator.check_hit(&project, &session, &file).await?;
    if result.newly_hit {
        if let Some(arm) = result.arm {
            if let Err(e) = ctx.tuner.record_feedback(&project, arm, true).await {
                warn!(error = %e, arm, "Could not attribute hit to tuner arm");
            }
        }
    }
    Ok(with_ms(
        json!({
            "project_id": project,
            "file": file,
            "matched": result.matched,
            "newly_hit": result.newly_hit,
            "batch_id": result.batch_id,
        }),
        start,
    ))
}

#[derive(Deserialize)]
struct PredictStatsQuery {
    project: Option<String>,
    project_id: Option<String>,
    window: Option<u64>,
}

async fn api_predict_stats(
    State(ctx): State<AppContext>,
    Query(q): Query<PredictStatsQuery>,
) -> ApiResult {
    let start = Instant::now();
    let project = canonical_project(q.project_id.as_deref().or(q.project.as_deref()));
    let window = q.window.unwrap_or(EVAL_WINDOW_SECS);
    let rolling = ctx.evaluator.rolling_stats(&project, window, None).await?;
    let cumulative = ctx.evaluator.cumulative_stats(&project).await?;
    Ok(with_ms(
        json!({
            "project_id": project,
            "window_seconds": window,
            "rolling": to_value(&rolling)?,
            "cumulative": to_value(&cumulative)?,
        }),
        start,
    ))
}

#[derive(Deserialize)]
struct FinalizeBody {
    project_id: Option<String>,
    max_age_seconds: Option<u64>,
}

async fn api_predict_finalize(
    State(ctx): State<AppContext>,
    Json(body): Json<FinalizeBody>,
) -> ApiResult {
    let start = Instant::now();
    let project = canonical_project(body.project_id.as_deref());
    let max_age = body.max_age_seconds.unwrap_or(FINALIZE_AGE_SECS);
    let finalized = ctx.evaluator.finalize(&project, max_age, None).await?;
    for (_, arm) in &finalized {
        if let Some(arm) = arm {
            if let Err(e) = ctx.tuner.record_feedback(&project, *arm, false).await {
                warn!(error = %e, arm, "Could not attribute miss to tuner arm");
            }
        }
    }
    Ok(with_ms(
        json!({ "project_id": project, "finalized": finalized.len() }),
        start,
    ))
}

#[derive(Deserialize)]
struct ReplayBody {
    project_id: Option<String>,
    dir: String,
}

/// Replay persisted session logs into the transition model.
async fn api_sessions_replay(
    State(ctx): State<AppContext>,
    Json(body): Json<ReplayBody>,
) -> ApiResult {
    let start = Instant::now();
    if body.dir.trim().is_empty() {
        return Err(ApiError::bad_request("missing required field: dir"));
    }
    let project = canonical_project(body.project_id.as_deref());
    let root = ctx
        .registry
        .root_of(&project)
        .unwrap_or_else(|| std::path::PathBuf::from("/"));
    let stats = session_log::replay_dir(
        &ctx.transitions,
        &project,
        &root,
        std::path::Path::new(&body.dir),
    )
    .await?;
    let mut value = to_value(&stats)?;
    if let Some(map) = value.as_object_mut() {
        map.insert("project_id".to_string(), json!(project));
    }
    Ok(with_ms(value, start))
}

// ---------------------------------------------------------------------------
// Tuner surface
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct TunerQuery {
    project: Option<String>,
    project_id: Option<String>,
}

impl TunerQuery {
    fn project(&self) -> String {
        canonical_project(self.project_id.as_deref().or(self.project.as_deref()))
    }
}

async fn api_tuner_weights(
    State(ctx): State<AppContext>,
    Query(q): Query<TunerQuery>,
) -> ApiResult {
    let start = Instant::now();
    let project = q.project();
    let (arm, weights) = ctx.tuner.select(&project).await?;
    Ok(with_ms(
        json!({
            "project_id": project,
            "arm": arm,
            "name": crate::tuner::ARMS[arm].0,
            "weights": to_value(&weights)?,
        }),
        start,
    ))
}

async fn api_tuner_best(State(ctx): State<AppContext>, Query(q): Query<TunerQuery>) -> ApiResult {
    let start = Instant::now();
    let project = q.project();
    let best = ctx.tuner.best(&project).await?;
    let mut value = to_value(&best)?;
    if let Some(map) = value.as_object_mut() {
        map.insert("project_id".to_string(), json!(project));
    }
    Ok(with_ms(value, start))
}

async fn api_tuner_stats(State(ctx): State<AppContext>, Query(q): Query<TunerQuery>) -> ApiResult {
    let start = Instant::now();
    let project = q.project();
    let arms = ctx.tuner.stats(&project).await?;
    Ok(with_ms(json!({ "project_id": project, "arms": to_value(&arms)? }), start))
}

#[derive(Deserialize)]
struct FeedbackBody {
    project_id: Option<String>,
    arm: usize,
    hit: bool,
}

async fn api_tuner_feedback(
    State(ctx): State<AppContext>,
    Json(body): Json<FeedbackBody>,
) -> ApiResult {
    let start = Instant::now();
    if body.arm >= crate::tuner::ARMS.len() {
        return Err(ApiError::bad_request(format!("arm out of range: {}", body.arm)));
    }
    let project = canonical_project(body.project_id.as_deref());
    ctx.tuner.record_feedback(&project, body.arm, body.hit).await?;
    Ok(with_ms(json!({ "ok": true, "project_id": project }), start))
}

#[derive(Deserialize)]
struct ResetBody {
    project_id: Option<String>,
}

async fn api_tuner_reset(
    State(ctx): State<AppContext>,
    Json(body): Json<ResetBody>,
) -> ApiResult {
    let start = Instant::now();
    let project = canonical_project(body.project_id.as_deref());
    ctx.tuner.reset(&project).await?;
    Ok(with_ms(json!({ "ok": true, "project_id": project }), start))
}

// ---------------------------------------------------------------------------
// Unified metrics
// ---------------------------------------------------------------------------

async fn api_metrics(
    State(ctx): State<AppContext>,
    Query(q): Query<PredictStatsQuery>,
) -> ApiResult {
    let start = Instant::now();
    let project = canonical_project(q.project_id.as_deref().or(q.project.as_deref()));
    let window = q.window.unwrap_or(EVAL_WINDOW_SECS);

    let rolling = ctx.evaluator.rolling_stats(&project, window, None).await?;
    let cumulative = ctx.evaluator.cumulative_stats(&project).await?;
    let best = ctx.tuner.best(&project).await?;
    let arms = ctx.tuner.stats(&project).await?;
    let scorer = ctx.scorer.stats(&project).await?;
    let transitions = ctx.transitions.stats(&project).await?;
    let savings = ctx.intents.stats(&project).savings;

    Ok(with_ms(
        json!({
            "project_id": project,
            "window_seconds": window,
            "hit_at_5": to_value(&rolling)?,
            "cumulative": to_value(&cumulative)?,
            "tuner": { "best": to_value(&best)?, "arms": to_value(&arms)? },
            "scorer": to_value(&scorer)?,
            "transitions": to_value(&transitions)?,
            "savings": to_value(&savings)?,
            "uptime_seconds": ctx.start_time.elapsed().as_secs(),
        }),
        start,
    ))
}
