//! Prediction engine: the public `predict` and `context` operations.
//!
//! Fuses the scorer's ranked candidates with the transition model's
//! next-file probabilities, assembles snippets from the index, and logs
//! every batch to the evaluator so the tuner gets a feedback signal. Every
//! downstream dependency degrades independently: no tuner means default
//! weights, an empty transition model means scorer-only results, no parser
//! means head-of-file snippets.

use dashmap::DashMap;
use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use tracing::warn;

use crate::evaluator::Evaluator;
use crate::index::IndexSet;
use crate::intent::canonical_tag;
use crate::scorer::Scorer;
use crate::snippet;
use crate::store::Result as StoreResult;
use crate::transition::TransitionModel;
use crate::tuner::WeightTuner;
use crate::types::now_unix;

pub const DEFAULT_LIMIT: usize = 5;
pub const DEFAULT_SNIPPET_LINES: usize = 20;

const TRANSITION_BOOST: f64 = 0.3;
const TRANSITION_INSERT_MIN_PROB: f64 = 0.1;
const TRANSITION_INSERT_CONFIDENCE: f64 = 0.8;
const CONTEXT_CACHE_TTL_SECS: u64 = 3_600;
const MAX_CONTEXT_KEYWORDS: usize = 10;

// ---------------------------------------------------------------------------
// Keyword extraction for the prose variant
// ---------------------------------------------------------------------------

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "that", "this", "with", "from", "have", "what", "how", "can", "you",
    "are", "please", "help", "want", "need", "make", "use", "get", "add", "fix", "update",
    "change", "create", "delete", "remove", "show", "find", "look", "see", "let", "know",
    "would", "could", "should", "will", "just", "like", "also", "more", "some", "any", "all",
    "new", "now", "about", "into",
];

/// Fixed regex -> tag rule table mapping prompt keywords to intent tags.
fn intent_rules() -> &'static Vec<(Regex, Vec<&'static str>)> {
    static RULES: OnceLock<Vec<(Regex, Vec<&'static str>)>> = OnceLock::new();
    RULES.get_or_init(|| {
        [
            (r"auth|login|session|oauth|jwt|password", vec!["authentication", "security"]),
            (r"\btests?\b|_test\b|\bspecs?\b|pytest|unittest", vec!["testing"]),
            (r"config|settings|\benv\b|yaml|yml|json", vec!["configuration"]),
            (r"api|endpoint|route|handler|controller", vec!["api"]),
            (r"index|search|query|grep", vec!["search"]),
            (r"model|schema|entity|\bdb\b|database|migration|sql", vec!["data"]),
            (r"component|view|template|page|\bui\b|style|css|html", vec!["frontend"]),
            (r"deploy|docker|k8s|\bci\b|\bcd\b|pipeline|github", vec!["devops"]),
            (r"error|exception|catch|throw|raise|fail", vec!["errors"]),
            (r"\blog\b|debug|trace|print|console", vec!["logging"]),
            (r"cache|redis|memory|store", vec!["caching"]),
            (r"async|await|promise|thread|concurrent", vec!["async"]),
            (r"hook|plugin|extension|middleware", vec!["hooks"]),
            (r"\bdocs?\b|readme|comment|docstring", vec!["documentation"]),
            (r"util|helper|common|shared|\blib\b", vec!["utilities"]),
        ]
        .into_iter()
        .map(|(pattern, tags)| (Regex::new(pattern).unwrap(), tags))
        .collect()
    })
}

/// Extract likely identifier keywords from free prose: lowercase identifier
/// tokens minus stopwords, plus stems of file-looking names.
pub fn extract_keywords(prose: &str) -> Vec<String> {
    static WORD_RE: OnceLock<Regex> = OnceLock::new();
    static FILE_RE: OnceLock<Regex> = OnceLock::new();
    let word_re =
        WORD_RE.get_or_init(|| Regex::new(r"[a-zA-Z_][a-zA-Z0-9_]*").unwrap());
    let file_re = FILE_RE.get_or_init(|| {
        Regex::new(r"([\w\-]+)\.(?:py|js|ts|tsx|jsx|rs|go|md|json|yaml|yml)\b").unwrap()
    });

    let lower = prose.to_lowercase();
    let mut seen = HashSet::new();
    let mut keywords = Vec::new();

    for m in word_re.find_iter(&lower) {
        let word = m.as_str();
        if word.len() <= 2 || STOPWORDS.contains(&word) {
            continue;
        }
        if seen.insert(word.to_string()) {
            keywords.push(word.to_string());
        }
    }
    for cap in file_re.captures_iter(&lower) {
        let stem = cap[1].to_string();
        if seen.insert(stem.clone()) {
            keywords.push(stem);
        }
    }

    keywords.truncate(MAX_CONTEXT_KEYWORDS);
    keywords
}

fn map_keywords_to_tags(keywords: &[String]) -> Vec<String> {
    let joined = keywords.join(" ");
    let mut seen = HashSet::new();
    let mut tags = Vec::new();
    for (re, rule_tags) in intent_rules() {
        if re.is_match(&joined) {
            for tag in rule_tags {
                if seen.insert(*tag) {
                    tags.push(tag.to_string());
                }
            }
        }
    }
    tags
}

// ---------------------------------------------------------------------------
// Request and response types
// ---------------------------------------------------------------------------

pub struct PredictParams {
    pub keywords: Vec<String>,
    pub tags: Vec<String>,
    pub trigger_file: Option<String>,
    pub session: String,
    pub limit: usize,
    pub snippet_lines: usize,
}

#[derive(Clone, Serialize)]
pub struct PredictedFile {
    pub path: String,
    pub confidence: f64,
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    /// Which signal produced this candidate: scorer, transition, or both.
    pub source: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transition_probability: Option<f64>,
}

#[derive(Clone, Serialize)]
pub struct Prediction {
    pub files: Vec<PredictedFile>,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_file: Option<String>,
    pub transition_matches: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arm: Option<usize>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct PredictionEngine {
    scorer: Arc<Scorer>,
    transitions: Arc<TransitionModel>,
    evaluator: Arc<Evaluator>,
    tuner: Arc<WeightTuner>,
    indexes: Arc<IndexSet>,
    context_cache: DashMap<String, (u64, Prediction)>,
}

impl PredictionEngine {
    pub fn new(
        scorer: Arc<Scorer>,
        transitions: Arc<TransitionModel>,
        evaluator: Arc<Evaluator>,
        tuner: Arc<WeightTuner>,
        indexes: Arc<IndexSet>,
    ) -> Self {
        Self {
            scorer,
            transitions,
            evaluator,
            tuner,
            indexes,
            context_cache: DashMap::new(),
        }
    }

    /// Rank the files the agent is most likely to need next.
    pub async fn predict(&self, project: &str, params: &PredictParams) -> StoreResult<Prediction> {
        let limit = params.limit.max(1);

        // Union keywords and tags into the canonical tag set.
        let mut seen = HashSet::new();
        let tags: Vec<String> = params
            .keywords
            .iter()
            .chain(params.tags.iter())
            .map(|t| canonical_tag(t))
            .filter(|t| !t.is_empty() && seen.insert(t.clone()))
            .collect();

        // Weights come from a Thompson draw; a failed store read degrades to
        // the default arm without attribution.
        let (arm, weights) = match self.tuner.select(project).await {
            Ok((arm, weights)) => (Some(arm), weights),
            Err(e) => {
                warn!(error = %e, "Tuner unavailable, using default weights");
                (None, self.tuner.default_weights())
            }
        };

        let ranked = self.scorer.ranked_files(project, &tags, limit * 2, weights, None).await?;
        let mut files: Vec<PredictedFile> = ranked
            .into_iter()
            .map(|r| PredictedFile {
                path: r.file,
                confidence: r.confidence,
                score: r.score,
                snippet: None,
                source: "scorer",
                transition_probability: None,
            })
            .collect();

        // Transition fusion: boost candidates likely to follow the trigger
        // file; pull in strong transition targets the scorer missed.
        let mut transition_matches = 0;
        if let Some(trigger) = &params.trigger_file {
            let predicted = match self.transitions.predict(project, trigger, limit * 2).await {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, "Transition model unavailable, scorer-only prediction");
                    Vec::new()
                }
            };
            for t in predicted {
                if let Some(existing) = files.iter_mut().find(|f| f.path == t.to) {
                    existing.confidence =
                        (existing.confidence + t.probability * TRANSITION_BOOST).min(1.0);
                    existing.source = "both";
                    existing.transition_probability = Some(t.probability);
                    transition_matches += 1;
                } else if t.probability >= TRANSITION_INSERT_MIN_PROB {
                    files.push(PredictedFile {
                        path: t.to,
                        confidence: TRANSITION_INSERT_CONFIDENCE * t.probability,
                        score: 0.0,
                        snippet: None,
                        source: "transition",
                        transition_probability: Some(t.probability),
                    });
                    transition_matches += 1;
                }
            }
        }

        files.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.path.cmp(&b.path))
        });
        files.truncate(limit);

        if params.snippet_lines > 0 {
            if let Some(index) = self.indexes.get(project) {
                let root = index.read().ok().map(|i| i.root.clone());
                if let Some(root) = root {
                    for f in &mut files {
                        f.snippet =
                            snippet::extract(&root, &f.path, &tags, params.snippet_lines);
                    }
                }
            }
        }

        let batch_id = if files.is_empty() {
            None
        } else {
            let paths: Vec<String> = files.iter().map(|f| f.path.clone()).collect();
            let aggregate =
                files.iter().map(|f| f.confidence).sum::<f64>() / files.len() as f64;
            Some(
                self.evaluator
                    .log_prediction(
                        project,
                        &params.session,
                        &paths,
                        &tags,
                        params.trigger_file.as_deref(),
                        aggregate,
                        arm,
                        None,
                    )
                    .await?,
            )
        };

        Ok(Prediction {
            files,
            tags,
            trigger_file: params.trigger_file.clone(),
            transition_matches,
            batch_id,
            arm,
        })
    }

    /// Natural-language variant: tokenize the prose, map keywords to tags,
    /// reuse `predict`. Results are cached by sorted keyword set for an hour;
    /// cache hits omit snippets.
    pub async fn context(
        &self,
        project: &str,
        prose: &str,
        session: &str,
        limit: usize,
        snippet_lines: usize,
    ) -> StoreResult<(Prediction, bool)> {
        let keywords = extract_keywords(prose);
        if keywords.is_empty() {
            return Ok((
                Prediction {
                    files: Vec::new(),
                    tags: Vec::new(),
                    trigger_file: None,
                    transition_matches: 0,
                    batch_id: None,
                    arm: None,
                },
                false,
            ));
        }

        let mut sorted = keywords.clone();
        sorted.sort();
        let cache_key = format!("{project}:{}", sorted.join(","));
        let now = now_unix();

        if let Some(entry) = self.context_cache.get(&cache_key) {
            let (expires_at, cached) = entry.value();
            if now < *expires_at {
                let mut prediction = cached.clone();
                for f in &mut prediction.files {
                    f.snippet = None;
                }
                return Ok((prediction, true));
            }
        }

        let tags = map_keywords_to_tags(&keywords);
        let params = PredictParams {
            keywords,
            tags,
            trigger_file: None,
            session: session.to_string(),
            limit,
            snippet_lines,
        };
        let prediction = self.predict(project, &params).await?;
        self.context_cache
            .insert(cache_key, (now + CONTEXT_CACHE_TTL_SECS, prediction.clone()));
        Ok((prediction, false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn engine() -> (PredictionEngine, Arc<Scorer>, Arc<TransitionModel>, Arc<Evaluator>) {
        let store: Arc<dyn crate::store::ScoreStore> = Arc::new(MemoryStore::new());
        let scorer = Arc::new(Scorer::new(Arc::clone(&store)));
        let transitions = Arc::new(TransitionModel::new(Arc::clone(&store)));
        let evaluator = Arc::new(Evaluator::new(Arc::clone(&store)));
        let tuner = Arc::new(WeightTuner::new(Arc::clone(&store)));
        let indexes = Arc::new(IndexSet::new());
        let e = PredictionEngine::new(
            Arc::clone(&scorer),
            Arc::clone(&transitions),
            Arc::clone(&evaluator),
            Arc::clone(&tuner),
            indexes,
        );
        (e, scorer, transitions, evaluator)
    }

    fn params(keywords: &[&str], trigger: Option<&str>) -> PredictParams {
        PredictParams {
            keywords: keywords.iter().map(|s| s.to_string()).collect(),
            tags: Vec::new(),
            trigger_file: trigger.map(|s| s.to_string()),
            session: "s".to_string(),
            limit: DEFAULT_LIMIT,
            snippet_lines: 0,
        }
    }

    #[tokio::test]
    async fn scorer_only_prediction_logs_a_batch() {
        let (engine, scorer, _, evaluator) = engine();
        for _ in 0..3 {
            scorer
                .record_access("p", "src/api.rs", &["api".to_string()], Some(1_000))
                .await
                .unwrap();
        }

        let prediction = engine.predict("p", &params(&["#API"], None)).await.unwrap();
        assert_eq!(prediction.tags, vec!["api"]);
        assert_eq!(prediction.files[0].path, "src/api.rs");
        assert_eq!(prediction.files[0].source, "scorer");

        let batch_id = prediction.batch_id.expect("batch logged");
        let batch = evaluator.batch("p", &batch_id).await.unwrap().unwrap();
        assert_eq!(batch.files, vec!["src/api.rs"]);
        assert_eq!(batch.arm, prediction.arm);
    }

    #[tokio::test]
    async fn transition_boost_and_insertion() {
        let (engine, scorer, transitions, _) = engine();
        scorer.record_access("p", "a.rs", &[], Some(1_000)).await.unwrap();
        scorer.record_access("p", "b.rs", &[], Some(1_000)).await.unwrap();
        // trigger.rs is strongly followed by b.rs and by an unscored file.
        for _ in 0..4 {
            transitions.record_pair("p", "trigger.rs", "b.rs", None).await.unwrap();
            transitions.record_pair("p", "trigger.rs", "fresh.rs", None).await.unwrap();
        }

        let prediction =
            engine.predict("p", &params(&[], Some("trigger.rs"))).await.unwrap();

        let b = prediction.files.iter().find(|f| f.path == "b.rs").expect("b.rs present");
        assert_eq!(b.source, "both");
        assert!(b.transition_probability.is_some());

        let fresh =
            prediction.files.iter().find(|f| f.path == "fresh.rs").expect("fresh.rs inserted");
        assert_eq!(fresh.source, "transition");
        assert!((fresh.confidence - 0.8 * 0.5).abs() < 1e-9);

        assert_eq!(prediction.transition_matches, 2);
        assert!(prediction.files.len() <= DEFAULT_LIMIT);
    }

    #[tokio::test]
    async fn confidence_is_capped_at_one() {
        let (engine, scorer, transitions, _) = engine();
        let now = crate::types::now_unix();
        for _ in 0..30 {
            scorer.record_access("p", "hot.rs", &[], Some(now)).await.unwrap();
        }
        for _ in 0..10 {
            transitions.record_pair("p", "t.rs", "hot.rs", None).await.unwrap();
        }
        let prediction = engine.predict("p", &params(&[], Some("t.rs"))).await.unwrap();
        assert!(prediction.files.iter().all(|f| f.confidence <= 1.0));
    }

    #[tokio::test]
    async fn empty_state_predicts_nothing() {
        let (engine, _, _, _) = engine();
        let prediction = engine.predict("p", &params(&["anything"], None)).await.unwrap();
        assert!(prediction.files.is_empty());
        assert!(prediction.batch_id.is_none());
    }

    #[tokio::test]
    async fn project_isolation() {
        let (engine, scorer, _, _) = engine();
        scorer.record_access("p", "secret.rs", &[], Some(1_000)).await.unwrap();
        let other = engine.predict("global", &params(&[], None)).await.unwrap();
        assert!(other.files.is_empty());
    }

    #[tokio::test]
    async fn context_caches_by_keyword_set() {
        let (engine, scorer, _, _) = engine();
        scorer
            .record_access("p", "src/login.rs", &["authentication".to_string()], Some(1_000))
            .await
            .unwrap();

        let (first, cached) = engine
            .context("p", "please fix the login auth bug", "s", 5, 0)
            .await
            .unwrap();
        assert!(!cached);
        assert!(!first.files.is_empty());
        // Keyword-to-tag rules fire on "auth"/"login".
        assert!(first.tags.contains(&"authentication".to_string()));

        let (_, cached) = engine
            .context("p", "the auth login bug", "s", 5, 0)
            .await
            .unwrap();
        assert!(cached, "same keyword set should hit the cache");
    }

    #[test]
    fn keyword_extraction_drops_stopwords_and_short_words() {
        let keywords = extract_keywords("Please fix the session_parser in auth.py now");
        assert!(keywords.contains(&"session_parser".to_string()));
        assert!(keywords.contains(&"auth".to_string()));
        assert!(!keywords.contains(&"please".to_string()));
        assert!(!keywords.contains(&"the".to_string()));
        assert!(!keywords.contains(&"in".to_string()));
    }

    #[test]
    fn keyword_mapping_hits_rule_table() {
        let tags =
            map_keywords_to_tags(&["login".to_string(), "pytest".to_string()]);
        assert!(tags.contains(&"authentication".to_string()));
        assert!(tags.contains(&"security".to_string()));
        assert!(tags.contains(&"testing".to_string()));
    }
}
