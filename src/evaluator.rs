//! Rolling Hit@5 evaluator.
//!
//! Every prediction batch is logged with its top-5 files into a time-ordered
//! index. A later file read that matches a pending batch marks it hit; a
//! finalizer flips stale pending batches to miss. Both transitions go through
//! a CAS on the batch's outcome field, so a batch resolves exactly once no
//! matter how hit marking and finalization race.

use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::store::{keys, Result, ScoreStore};
use crate::types::now_unix;

/// Evaluation window for the rolling hit rate.
pub const EVAL_WINDOW_SECS: u64 = 86_400;

/// Batch records outlive the window by this much so late queries still resolve.
const BATCH_TTL_SLACK_SECS: u64 = 3_600;

/// How many of a session's recent batches a read is checked against.
const SESSION_RECENT_BATCHES: isize = 10;

/// Predictions per batch actually evaluated.
pub const TOP_K: usize = 5;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Pending,
    Hit,
    Miss,
}

impl Outcome {
    fn as_str(&self) -> &'static str {
        match self {
            Outcome::Pending => "pending",
            Outcome::Hit => "hit",
            Outcome::Miss => "miss",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Outcome::Pending),
            "hit" => Some(Outcome::Hit),
            "miss" => Some(Outcome::Miss),
            _ => None,
        }
    }
}

/// A logged prediction batch, reconstructed from the KV.
#[derive(Clone, Serialize)]
pub struct PredictionBatch {
    pub id: String,
    pub session: String,
    pub ts: u64,
    pub files: Vec<String>,
    pub tags: Vec<String>,
    pub trigger_file: Option<String>,
    pub confidence: f64,
    /// Tuner arm that produced the weights for this batch. Threaded through
    /// so evaluator outcomes can be attributed back.
    pub arm: Option<usize>,
    pub outcome: Outcome,
}

/// Result of checking one file read against a session's recent batches.
#[derive(Clone, Serialize)]
pub struct CheckResult {
    /// The read matched some batch's top-5.
    pub matched: bool,
    /// This call transitioned a batch pending -> hit (feedback should fire).
    pub newly_hit: bool,
    pub batch_id: Option<String>,
    pub arm: Option<usize>,
}

#[derive(Clone, Serialize)]
pub struct RollingStats {
    pub hits: u64,
    pub misses: u64,
    pub pending: u64,
    pub total: u64,
    /// hits / (hits + misses); 0 when nothing has resolved yet.
    pub hit_rate: f64,
}

#[derive(Clone, Serialize)]
pub struct CumulativeStats {
    pub hits: i64,
    pub misses: i64,
}

pub struct Evaluator {
    store: Arc<dyn ScoreStore>,
    window_secs: u64,
}

impl Evaluator {
    pub fn new(store: Arc<dyn ScoreStore>) -> Self {
        Self { store, window_secs: EVAL_WINDOW_SECS }
    }

    // -----------------------------------------------------------------------
    // Logging
    // -----------------------------------------------------------------------

    /// Log a prediction batch. Returns the batch id.
    #[allow(clippy::too_many_arguments)]
    pub async fn log_prediction(
        &self,
        project: &str,
        session: &str,
        predicted_files: &[String],
        tags: &[String],
        trigger_file: Option<&str>,
        confidence: f64,
        arm: Option<usize>,
        now: Option<u64>,
    ) -> Result<String> {
        let now = now.unwrap_or_else(now_unix);
        let id = Uuid::new_v4().to_string();
        let top: Vec<String> = predicted_files.iter().take(TOP_K).cloned().collect();

        let batch_key = keys::batch(project, &id);
        let mut fields = vec![
            ("session".to_string(), session.to_string()),
            ("ts".to_string(), now.to_string()),
            ("files".to_string(), serde_json::to_string(&top).unwrap_or_default()),
            ("tags".to_string(), serde_json::to_string(tags).unwrap_or_default()),
            ("confidence".to_string(), format!("{confidence:.4}")),
            ("outcome".to_string(), Outcome::Pending.as_str().to_string()),
        ];
        if let Some(trigger) = trigger_file {
            fields.push(("trigger".to_string(), trigger.to_string()));
        }
        if let Some(arm) = arm {
            fields.push(("arm".to_string(), arm.to_string()));
        }
        self.store.hset_multi(&batch_key, &fields).await?;
        self.store.expire(&batch_key, self.window_secs + BATCH_TTL_SLACK_SECS).await?;

        let index_key = keys::batch_index(project);
        self.store.zadd(&index_key, &id, now as f64).await?;
        // Trim index entries that have aged out of the window.
        let cutoff = now.saturating_sub(self.window_secs);
        if cutoff > 0 {
            self.store.zremrangebyscore(&index_key, 0.0, (cutoff - 1) as f64).await?;
        }

        let session_key = keys::session_batches(project, session);
        self.store.lpush(&session_key, &id).await?;
        self.store.ltrim(&session_key, 0, SESSION_RECENT_BATCHES - 1).await?;
        self.store.expire(&session_key, self.window_secs + BATCH_TTL_SLACK_SECS).await?;

        Ok(id)
    }

    // -----------------------------------------------------------------------
    // Hit checking
    // -----------------------------------------------------------------------

    /// Check a file read against the session's recent batches. The first
    /// pending batch whose top-5 contains the file is marked hit. A batch
    /// already marked hit makes this a no-op for counters.
    pub async fn check_hit(&self, project: &str, session: &str, file: &str) -> Result<CheckResult> {
        let ids = self
            .store
            .lrange(&keys::session_batches(project, session), 0, SESSION_RECENT_BATCHES - 1)
            .await?;

        for id in ids {
            let batch_key = keys::batch(project, &id);
            let Some(raw_files) = self.store.hget(&batch_key, "files").await? else {
                continue;
            };
            let files: Vec<String> = serde_json::from_str(&raw_files).unwrap_or_default();
            if !files.iter().any(|f| f == file) {
                continue;
            }

            let newly_hit = self
                .store
                .hash_field_cas(&batch_key, "outcome", "pending", "hit")
                .await?;
            if newly_hit {
                self.store.incrby(&keys::pred_hits(project), 1).await?;
            }
            let arm = self
                .store
                .hget(&batch_key, "arm")
                .await?
                .and_then(|a| a.parse::<usize>().ok());
            return Ok(CheckResult { matched: true, newly_hit, batch_id: Some(id), arm });
        }

        self.store.incrby(&keys::pred_misses(project), 1).await?;
        Ok(CheckResult { matched: false, newly_hit: false, batch_id: None, arm: None })
    }

    // -----------------------------------------------------------------------
    // Finalization
    // -----------------------------------------------------------------------

    /// Flip batches older than `max_age_secs` that are still pending to miss.
    /// Returns (batch id, arm) for each batch this call resolved, so the
    /// caller can feed the misses back to the tuner exactly once.
    pub async fn finalize(
        &self,
        project: &str,
        max_age_secs: u64,
        now: Option<u64>,
    ) -> Result<Vec<(String, Option<usize>)>> {
        let now = now.unwrap_or_else(now_unix);
        let cutoff = now.saturating_sub(max_age_secs);
        let stale = self
            .store
            .zrange_by_score(&keys::batch_index(project), 0.0, cutoff as f64)
            .await?;

        let mut finalized = Vec::new();
        for (id, _) in stale {
            let batch_key = keys::batch(project, &id);
            let flipped = self
                .store
                .hash_field_cas(&batch_key, "outcome", "pending", "miss")
                .await?;
            if flipped {
                self.store.incrby(&keys::pred_misses(project), 1).await?;
                let arm = self
                    .store
                    .hget(&batch_key, "arm")
                    .await?
                    .and_then(|a| a.parse::<usize>().ok());
                finalized.push((id, arm));
            }
        }
        Ok(finalized)
    }

    // -----------------------------------------------------------------------
    // Stats
    // -----------------------------------------------------------------------

    /// Partition the batches of the last `window_secs` into hit/miss/pending
    /// and compute the rolling Hit@5 rate.
    pub async fn rolling_stats(
        &self,
        project: &str,
        window_secs: u64,
        now: Option<u64>,
    ) -> Result<RollingStats> {
        let now = now.unwrap_or_else(now_unix);
        let since = now.saturating_sub(window_secs);
        let ids = self
            .store
            .zrange_by_score(&keys::batch_index(project), since as f64, now as f64)
            .await?;

        let (mut hits, mut misses, mut pending) = (0u64, 0u64, 0u64);
        for (id, _) in &ids {
            let outcome = self
                .store
                .hget(&keys::batch(project, id), "outcome")
                .await?
                .and_then(|o| Outcome::parse(&o))
                .unwrap_or(Outcome::Pending);
            match outcome {
                Outcome::Hit => hits += 1,
                Outcome::Miss => misses += 1,
                Outcome::Pending => pending += 1,
            }
        }

        let resolved = hits + misses;
        Ok(RollingStats {
            hits,
            misses,
            pending,
            total: ids.len() as u64,
            hit_rate: if resolved > 0 { hits as f64 / resolved as f64 } else { 0.0 },
        })
    }

    /// Legacy cumulative counters, incremented on every check/finalize.
    pub async fn cumulative_stats(&self, project: &str) -> Result<CumulativeStats> {
        let hits = self
            .store
            .get(&keys::pred_hits(project))
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let misses = self
            .store
            .get(&keys::pred_misses(project))
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        Ok(CumulativeStats { hits, misses })
    }

    /// Fetch one batch by id.
    pub async fn batch(&self, project: &str, id: &str) -> Result<Option<PredictionBatch>> {
        let fields = self.store.hgetall(&keys::batch(project, id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        let field = |name: &str| fields.iter().find(|(f, _)| f == name).map(|(_, v)| v.clone());
        Ok(Some(PredictionBatch {
            id: id.to_string(),
            session: field("session").unwrap_or_default(),
            ts: field("ts").and_then(|v| v.parse().ok()).unwrap_or(0),
            files: field("files")
                .and_then(|v| serde_json::from_str(&v).ok())
                .unwrap_or_default(),
            tags: field("tags")
                .and_then(|v| serde_json::from_str(&v).ok())
                .unwrap_or_default(),
            trigger_file: field("trigger"),
            confidence: field("confidence").and_then(|v| v.parse().ok()).unwrap_or(0.0),
            arm: field("arm").and_then(|v| v.parse().ok()),
            outcome: field("outcome")
                .and_then(|o| Outcome::parse(&o))
                .unwrap_or(Outcome::Pending),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn evaluator() -> Evaluator {
        Evaluator::new(Arc::new(MemoryStore::new()))
    }

    fn files(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn hit_marks_batch_once() {
        let e = evaluator();
        let id = e
            .log_prediction("p", "s", &files(&["f1", "f2", "f3", "f4", "f5"]), &[], None, 0.8, Some(2), Some(1_000))
            .await
            .unwrap();

        let first = e.check_hit("p", "s", "f3").await.unwrap();
        assert!(first.matched && first.newly_hit);
        assert_eq!(first.batch_id.as_deref(), Some(id.as_str()));
        assert_eq!(first.arm, Some(2));

        // Second read of the same predicted file is an idempotent no-op.
        let second = e.check_hit("p", "s", "f3").await.unwrap();
        assert!(second.matched && !second.newly_hit);

        let counters = e.cumulative_stats("p").await.unwrap();
        assert_eq!(counters.hits, 1);

        let batch = e.batch("p", &id).await.unwrap().unwrap();
        assert_eq!(batch.outcome, Outcome::Hit);
    }

    #[tokio::test]
    async fn unmatched_read_counts_a_miss_but_batch_stays_pending() {
        let e = evaluator();
        let id = e
            .log_prediction("p", "s", &files(&["f1"]), &[], None, 0.5, None, Some(1_000))
            .await
            .unwrap();

        let result = e.check_hit("p", "s", "unrelated.rs").await.unwrap();
        assert!(!result.matched);
        assert_eq!(e.cumulative_stats("p").await.unwrap().misses, 1);
        assert_eq!(e.batch("p", &id).await.unwrap().unwrap().outcome, Outcome::Pending);
    }

    #[tokio::test]
    async fn finalize_flips_only_stale_pending() {
        let e = evaluator();
        let old = e
            .log_prediction("p", "s", &files(&["f1"]), &[], None, 0.5, Some(1), Some(1_000))
            .await
            .unwrap();
        let fresh = e
            .log_prediction("p", "s", &files(&["f2"]), &[], None, 0.5, Some(3), Some(5_000))
            .await
            .unwrap();

        let finalized = e.finalize("p", 600, Some(5_100)).await.unwrap();
        assert_eq!(finalized.len(), 1);
        assert_eq!(finalized[0].0, old);
        assert_eq!(finalized[0].1, Some(1));

        assert_eq!(e.batch("p", &old).await.unwrap().unwrap().outcome, Outcome::Miss);
        assert_eq!(e.batch("p", &fresh).await.unwrap().unwrap().outcome, Outcome::Pending);

        // Finalizing again resolves nothing new.
        assert!(e.finalize("p", 600, Some(5_100)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn hit_and_finalize_never_both_resolve_a_batch() {
        let e = evaluator();
        e.log_prediction("p", "s", &files(&["f1"]), &[], None, 0.5, None, Some(1_000))
            .await
            .unwrap();

        let check = e.check_hit("p", "s", "f1").await.unwrap();
        assert!(check.newly_hit);
        // Finalizer arrives late; the batch is already resolved.
        assert!(e.finalize("p", 0, Some(10_000)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rolling_rate_over_two_batches() {
        let e = evaluator();
        e.log_prediction("p", "s", &files(&["f1", "f2", "f3", "f4", "f5"]), &[], None, 0.8, None, Some(1_000))
            .await
            .unwrap();
        e.check_hit("p", "s", "f3").await.unwrap();

        let stats = e.rolling_stats("p", EVAL_WINDOW_SECS, Some(1_010)).await.unwrap();
        assert_eq!((stats.hits, stats.misses, stats.pending), (1, 0, 0));
        assert_eq!(stats.hit_rate, 1.0);

        e.log_prediction("p", "s2", &files(&["g1"]), &[], None, 0.4, None, Some(1_020))
            .await
            .unwrap();
        e.finalize("p", 60, Some(2_000)).await.unwrap();

        let stats = e.rolling_stats("p", EVAL_WINDOW_SECS, Some(2_000)).await.unwrap();
        assert_eq!((stats.hits, stats.misses), (1, 1));
        assert_eq!(stats.hit_rate, 0.5);
    }

    #[tokio::test]
    async fn window_partition_accounts_for_every_batch() {
        let e = evaluator();
        for i in 0..6 {
            e.log_prediction("p", "s", &files(&["f"]), &[], None, 0.5, None, Some(1_000 + i))
                .await
                .unwrap();
        }
        e.check_hit("p", "s", "f").await.unwrap();
        e.finalize("p", 3, Some(1_005)).await.unwrap();

        let stats = e.rolling_stats("p", EVAL_WINDOW_SECS, Some(1_006)).await.unwrap();
        assert_eq!(stats.hits + stats.misses + stats.pending, stats.total);
        assert_eq!(stats.total, 6);
    }

    #[tokio::test]
    async fn batches_truncate_to_top_five() {
        let e = evaluator();
        let id = e
            .log_prediction(
                "p",
                "s",
                &files(&["f1", "f2", "f3", "f4", "f5", "f6", "f7"]),
                &[],
                None,
                0.9,
                None,
                Some(1_000),
            )
            .await
            .unwrap();
        let batch = e.batch("p", &id).await.unwrap().unwrap();
        assert_eq!(batch.files.len(), 5);
        // f6 was predicted but falls outside the evaluated top-5.
        let result = e.check_hit("p", "s", "f6").await.unwrap();
        assert!(!result.matched);
    }

    #[tokio::test]
    async fn projects_are_isolated() {
        let e = evaluator();
        e.log_prediction("p", "s", &files(&["f1"]), &[], None, 0.5, None, Some(1_000))
            .await
            .unwrap();
        let other = e.rolling_stats("q", EVAL_WINDOW_SECS, Some(1_001)).await.unwrap();
        assert_eq!(other.total, 0);
    }
}
