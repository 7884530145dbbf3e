//! File scoring by recency, frequency, and tag affinity.
//!
//! Signals are stored raw in the KV (unix timestamps, access counts, tag
//! counters) and normalized at query time. The composite score is a weighted
//! sum whose weights come from the tuner; calibrated confidence dampens
//! high-score/low-evidence files so the evaluator does not amplify noise.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::store::{keys, Result, ScoreStore};
use crate::types::{now_unix, Weights};

/// Recency half-life: a file's recency signal halves every hour untouched.
pub const RECENCY_HALF_LIFE_SECS: f64 = 3600.0;

// Confidence calibration knobs. Tuning choices, not invariants.
const MIN_ACCESSES_FULL_CONFIDENCE: f64 = 20.0;
const MIN_HOURS_FULL_CONFIDENCE: f64 = 24.0;
const EVIDENCE_WEIGHT: f64 = 0.7;
const STABILITY_WEIGHT: f64 = 0.3;

/// One ranked candidate with its composite score, calibrated confidence, and
/// per-signal components.
#[derive(Clone, Serialize)]
pub struct RankedFile {
    pub file: String,
    pub score: f64,
    pub confidence: f64,
    pub recency: f64,
    pub frequency: f64,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub tags: HashMap<String, f64>,
}

/// Raw signal values after a recorded access, returned for observability.
#[derive(Clone, Serialize)]
pub struct AccessScores {
    pub recency: f64,
    pub frequency: f64,
    pub tags: HashMap<String, f64>,
}

#[derive(Clone, Serialize)]
pub struct ScorerStats {
    pub files_tracked: u64,
    pub frequency_entries: u64,
}

pub struct Scorer {
    store: Arc<dyn ScoreStore>,
    half_life: f64,
}

impl Scorer {
    pub fn new(store: Arc<dyn ScoreStore>) -> Self {
        Self { store, half_life: RECENCY_HALF_LIFE_SECS }
    }

    // -----------------------------------------------------------------------
    // Recording
    // -----------------------------------------------------------------------

    /// Record a file access: set recency to `ts`, bump frequency by one, set
    /// first-seen if absent, bump each (tag, file) counter. Each mutation is
    /// individually atomic; the group is convergent under retries.
    pub async fn record_access(
        &self,
        project: &str,
        file: &str,
        tags: &[String],
        ts: Option<u64>,
    ) -> Result<AccessScores> {
        let ts = ts.unwrap_or_else(now_unix);

        self.store.zadd(&keys::recency(project), file, ts as f64).await?;
        let frequency = self.store.zincrby(&keys::frequency(project), file, 1.0).await?;
        self.store.set_nx(&keys::first_seen(project, file), &ts.to_string()).await?;

        let mut tag_scores = HashMap::new();
        for tag in tags {
            let score = self.store.zincrby(&keys::tag(project, tag), file, 1.0).await?;
            tag_scores.insert(tag.clone(), score);
        }

        Ok(AccessScores { recency: ts as f64, frequency, tags: tag_scores })
    }

    // -----------------------------------------------------------------------
    // Confidence calibration
    // -----------------------------------------------------------------------

    /// Calibrated confidence in [0, 1]. Reflects both the composite score and
    /// how much evidence backs it: a high score seen once is worth less than
    /// a medium score seen twenty times over a day.
    pub fn confidence(&self, composite: f64, access_count: u64, time_span_hours: f64) -> f64 {
        let base = composite / 100.0;
        let evidence = (0.3
            + 0.7 * (1.0 + access_count as f64).ln() / (1.0 + MIN_ACCESSES_FULL_CONFIDENCE).ln())
        .min(1.0);
        let stability = (0.5 + 0.5 * time_span_hours / MIN_HOURS_FULL_CONFIDENCE).min(1.0);
        let confidence = base * (EVIDENCE_WEIGHT * evidence + STABILITY_WEIGHT * stability);
        (confidence * 10_000.0).round() / 10_000.0
    }

    // -----------------------------------------------------------------------
    // Ranking
    // -----------------------------------------------------------------------

    /// Rank every file present in the recency or frequency sets by composite
    /// score. Ties break by recency, then file key.
    pub async fn ranked_files(
        &self,
        project: &str,
        tags: &[String],
        limit: usize,
        weights: Weights,
        now: Option<u64>,
    ) -> Result<Vec<RankedFile>> {
        let now = now.unwrap_or_else(now_unix) as f64;

        let recency_files = self.store.zrange_desc(&keys::recency(project), 0, -1).await?;
        let frequency_files = self.store.zrange_desc(&keys::frequency(project), 0, -1).await?;

        struct Signals {
            recency: f64,
            frequency: f64,
            tags: HashMap<String, f64>,
        }
        let mut file_scores: HashMap<String, Signals> = HashMap::new();

        for (file, ts) in &recency_files {
            let age = (now - ts).max(0.0);
            let recency = 100.0 * (-age / self.half_life).exp();
            file_scores.insert(
                file.clone(),
                Signals { recency, frequency: 0.0, tags: HashMap::new() },
            );
        }

        let max_freq = frequency_files.iter().map(|(_, f)| *f).fold(1.0_f64, f64::max);
        for (file, freq) in &frequency_files {
            let entry = file_scores
                .entry(file.clone())
                .or_insert(Signals { recency: 0.0, frequency: 0.0, tags: HashMap::new() });
            entry.frequency = freq / max_freq * 100.0;
        }

        for tag in tags {
            let tag_files = self.store.zrange_desc(&keys::tag(project, tag), 0, -1).await?;
            let max_tag = tag_files.iter().map(|(_, s)| *s).fold(1.0_f64, f64::max);
            for (file, score) in tag_files {
                let entry = file_scores
                    .entry(file)
                    .or_insert(Signals { recency: 0.0, frequency: 0.0, tags: HashMap::new() });
                entry.tags.insert(tag.clone(), score / max_tag * 100.0);
            }
        }

        if file_scores.is_empty() {
            return Ok(Vec::new());
        }

        let mut scored: Vec<(String, f64, Signals)> = file_scores
            .into_iter()
            .map(|(file, signals)| {
                let mut composite =
                    signals.recency * weights.recency + signals.frequency * weights.frequency;
                if !tags.is_empty() {
                    let tag_weight = weights.tag / tags.len() as f64;
                    for tag in tags {
                        composite += signals.tags.get(tag).copied().unwrap_or(0.0) * tag_weight;
                    }
                }
                (file, composite, signals)
            })
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    b.2.recency
                        .partial_cmp(&a.2.recency)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(limit);

        let mut ranked = Vec::with_capacity(scored.len());
        for (file, composite, signals) in scored {
            let access_count = self
                .store
                .zscore(&keys::frequency(project), &file)
                .await?
                .unwrap_or(1.0) as u64;
            let time_span_hours = match self.store.get(&keys::first_seen(project, &file)).await? {
                Some(first) => first
                    .parse::<f64>()
                    .map(|f| ((now - f) / 3600.0).max(0.0))
                    .unwrap_or(0.0),
                None => 0.0,
            };
            let confidence = self.confidence(composite, access_count, time_span_hours);
            ranked.push(RankedFile {
                file,
                score: (composite * 10_000.0).round() / 10_000.0,
                confidence,
                recency: (signals.recency * 100.0).round() / 100.0,
                frequency: (signals.frequency * 100.0).round() / 100.0,
                tags: signals
                    .tags
                    .into_iter()
                    .map(|(t, v)| (t, (v * 100.0).round() / 100.0))
                    .collect(),
            });
        }

        Ok(ranked)
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    /// Atomically decay every recency entry. Opportunistic; correctness does
    /// not depend on it.
    pub async fn apply_decay(&self, project: &str, half_life: Option<f64>) -> Result<u64> {
        let half_life = half_life.unwrap_or(self.half_life);
        self.store
            .decay_sorted_set(&keys::recency(project), now_unix() as f64, half_life)
            .await
    }

    pub async fn stats(&self, project: &str) -> Result<ScorerStats> {
        Ok(ScorerStats {
            files_tracked: self.store.zcard(&keys::recency(project)).await?,
            frequency_entries: self.store.zcard(&keys::frequency(project)).await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use proptest::prelude::*;

    fn scorer() -> Scorer {
        Scorer::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn record_access_updates_all_signals() {
        let s = scorer();
        let scores = s
            .record_access("p", "src/auth.rs", &["auth".to_string()], Some(1_000))
            .await
            .unwrap();
        assert_eq!(scores.recency, 1_000.0);
        assert_eq!(scores.frequency, 1.0);
        assert_eq!(scores.tags["auth"], 1.0);

        let scores = s
            .record_access("p", "src/auth.rs", &["auth".to_string()], Some(2_000))
            .await
            .unwrap();
        assert_eq!(scores.recency, 2_000.0);
        assert_eq!(scores.frequency, 2.0);
        assert_eq!(scores.tags["auth"], 2.0);
    }

    #[tokio::test]
    async fn frequent_recent_file_ranks_first() {
        let s = scorer();
        let now = 10_000;
        // f1: three accesses, last one 1s ago. f2: one access 10s ago.
        for ts in [now - 30, now - 10, now - 1] {
            s.record_access("p", "f1", &["api".to_string()], Some(ts)).await.unwrap();
        }
        s.record_access("p", "f2", &["api".to_string()], Some(now - 10)).await.unwrap();

        let ranked = s
            .ranked_files("p", &["api".to_string()], 2, Weights::default(), Some(now))
            .await
            .unwrap();
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].file, "f1");
        assert_eq!(ranked[1].file, "f2");
        assert!(ranked[0].score > ranked[1].score);
    }

    #[tokio::test]
    async fn empty_state_ranks_empty() {
        let s = scorer();
        let ranked = s.ranked_files("p", &[], 10, Weights::default(), None).await.unwrap();
        assert!(ranked.is_empty());
    }

    #[tokio::test]
    async fn ranked_is_sorted_by_composite() {
        let s = scorer();
        let now = 50_000;
        for (i, file) in ["a", "b", "c", "d", "e"].iter().enumerate() {
            for _ in 0..=i {
                s.record_access("p", file, &[], Some(now - 100 * i as u64)).await.unwrap();
            }
        }
        let ranked = s.ranked_files("p", &[], 10, Weights::default(), Some(now)).await.unwrap();
        for pair in ranked.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[tokio::test]
    async fn projects_do_not_leak() {
        let s = scorer();
        s.record_access("p", "only-in-p", &[], Some(1)).await.unwrap();
        let ranked = s.ranked_files("q", &[], 10, Weights::default(), None).await.unwrap();
        assert!(ranked.is_empty());
    }

    #[tokio::test]
    async fn decay_halves_aged_scores() {
        let s = scorer();
        s.record_access("p", "f", &[], Some(0)).await.unwrap();
        // Entry score 0, now >> 0: decay leaves 0 * factor = 0, so use a
        // nonzero base to observe the rewrite.
        s.store.zadd(&keys::recency("p"), "f", 1_000.0).await.unwrap();
        let rewritten = s.store.decay_sorted_set(&keys::recency("p"), 4_600.0, 3_600.0).await.unwrap();
        assert_eq!(rewritten, 1);
    }

    #[test]
    fn confidence_monotone_in_evidence_and_score() {
        let s = scorer();
        // More accesses, same composite: confidence must not drop.
        assert!(s.confidence(80.0, 20, 1.0) > s.confidence(80.0, 1, 1.0));
        // Higher composite, same evidence: confidence must not drop.
        assert!(s.confidence(90.0, 5, 1.0) > s.confidence(50.0, 5, 1.0));
        // Bounded.
        assert!(s.confidence(100.0, 1_000, 1_000.0) <= 1.0);
    }

    proptest! {
        #[test]
        fn confidence_monotonicity(
            composite in 0.0..100.0f64,
            accesses in 0u64..500,
            hours in 0.0..100.0f64,
        ) {
            let s = scorer();
            let base = s.confidence(composite, accesses, hours);
            prop_assert!((0.0..=1.0).contains(&base));
            prop_assert!(s.confidence(composite, accesses + 1, hours) >= base - 1e-9);
            prop_assert!(s.confidence((composite + 1.0).min(100.0), accesses, hours) >= base - 1e-9);
        }
    }
}
