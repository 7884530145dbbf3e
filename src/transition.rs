//! Markov transition model over successive file reads within a session.
//!
//! Learns `P(next_file | current_file)` from adjacent read pairs. Counts live
//! in per-source sorted sets; a bounded ring of recent time deltas per edge
//! supports an average-delta read-out. Sources: live intent records tagged as
//! reads, and the session-log replayer in [`crate::session_log`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::store::{keys, Result, ScoreStore};

/// Accesses further apart than this are not related.
pub const TIME_WINDOW_SECS: f64 = 300.0;

/// Transitions below this count do not contribute to probability output.
pub const MIN_TRANSITION_COUNT: f64 = 2.0;

/// Per source file, retain at most this many highest-count targets.
pub const MAX_TRANSITIONS_PER_FILE: isize = 20;

/// Recency weight decay per step back when merging session predictions.
pub const STEP_DECAY: f64 = 0.95;

const SEQUENCE_CAP: isize = 100;
const SESSION_TTL_SECS: u64 = 86_400;
const EDGE_TTL_SECS: u64 = 86_400 * 7;
const TIMING_RING_CAP: isize = 100;

/// A single file access inside a session sequence.
#[derive(Clone, Serialize, Deserialize)]
pub struct FileAccess {
    pub file: String,
    pub ts: f64,
    pub tool: String,
    pub session: String,
}

/// A learned file-to-file transition with its probability.
#[derive(Clone, Serialize)]
pub struct Transition {
    pub from: String,
    pub to: String,
    pub probability: f64,
    pub count: u64,
    pub avg_time_delta: f64,
}

#[derive(Clone, Serialize)]
pub struct TransitionStats {
    pub source_files: u64,
    pub total_transitions: u64,
}

pub struct TransitionModel {
    store: Arc<dyn ScoreStore>,
}

impl TransitionModel {
    pub fn new(store: Arc<dyn ScoreStore>) -> Self {
        Self { store }
    }

    // -----------------------------------------------------------------------
    // Recording
    // -----------------------------------------------------------------------

    /// Record a live file access. When the session's previous access is a
    /// different file within the time window, the (previous, this) pair is
    /// counted as a transition.
    pub async fn record_access(
        &self,
        project: &str,
        file: &str,
        tool: &str,
        session: &str,
        ts: f64,
    ) -> Result<()> {
        if file.is_empty() || file.starts_with("pattern:") || file.starts_with("cmd:") {
            return Ok(());
        }

        let sequence_key = keys::sequence(project, session);
        if let Some(raw) = self.store.lrange(&sequence_key, 0, 0).await?.into_iter().next() {
            if let Ok(prev) = serde_json::from_str::<FileAccess>(&raw) {
                let delta = ts - prev.ts;
                if prev.file != file && (0.0..=TIME_WINDOW_SECS).contains(&delta) {
                    self.record_pair(project, &prev.file, file, Some(delta)).await?;
                }
            }
        }

        let access = FileAccess {
            file: file.to_string(),
            ts,
            tool: tool.to_string(),
            session: session.to_string(),
        };
        let encoded = serde_json::to_string(&access)
            .map_err(|e| crate::store::StoreError::Backend(e.to_string()))?;
        self.store.lpush(&sequence_key, &encoded).await?;
        self.store.ltrim(&sequence_key, 0, SEQUENCE_CAP - 1).await?;
        self.store.expire(&sequence_key, SESSION_TTL_SECS).await?;
        Ok(())
    }

    /// Count one observed (from, to) transition. Used by both the live path
    /// and the session-log replayer (which has no reliable deltas).
    pub async fn record_pair(
        &self,
        project: &str,
        from: &str,
        to: &str,
        time_delta: Option<f64>,
    ) -> Result<()> {
        if from == to {
            return Ok(());
        }

        let edge_key = keys::transitions(project, from);
        self.store.zincrby(&edge_key, to, 1.0).await?;
        // Keep only the top-N targets per source.
        self.store
            .zremrangebyrank(&edge_key, 0, -(MAX_TRANSITIONS_PER_FILE + 1))
            .await?;
        self.store.expire(&edge_key, EDGE_TTL_SECS).await?;

        // Track source files for stats without a key scan.
        self.store.zincrby(&keys::transition_sources(project), from, 1.0).await?;

        if let Some(delta) = time_delta {
            let timing_key = keys::transition_timing(project, from, to);
            self.store.lpush(&timing_key, &format!("{delta:.3}")).await?;
            self.store.ltrim(&timing_key, 0, TIMING_RING_CAP - 1).await?;
            self.store.expire(&timing_key, EDGE_TTL_SECS).await?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Prediction
    // -----------------------------------------------------------------------

    /// Most likely next files after `current`, highest probability first.
    /// Probabilities are normalized over the returned targets, so they sum
    /// to 1 for any non-empty result.
    pub async fn predict(
        &self,
        project: &str,
        current: &str,
        limit: usize,
    ) -> Result<Vec<Transition>> {
        if current.is_empty() {
            return Ok(Vec::new());
        }

        let edge_key = keys::transitions(project, current);
        let top = self.store.zrange_desc(&edge_key, 0, limit as isize - 1).await?;
        // Suppress low-count noise, but only when at least one target has
        // enough evidence; a source with nothing but singletons still predicts.
        let mut qualified: Vec<(String, f64)> = top
            .iter()
            .filter(|(_, count)| *count >= MIN_TRANSITION_COUNT)
            .cloned()
            .collect();
        if qualified.is_empty() {
            qualified = top;
        }
        let total: f64 = qualified.iter().map(|(_, count)| count).sum();
        if total <= 0.0 {
            return Ok(Vec::new());
        }

        let mut transitions = Vec::with_capacity(qualified.len());
        for (to, count) in qualified {
            let avg_time_delta = self.avg_time_delta(project, current, &to).await?;
            transitions.push(Transition {
                from: current.to_string(),
                to,
                probability: count / total,
                count: count as u64,
                avg_time_delta,
            });
        }
        Ok(transitions)
    }

    /// Predict from the session's recent activity: the last up-to-five reads
    /// each contribute their predictions, weighted by `0.95^steps_back`.
    pub async fn predict_from_recent(
        &self,
        project: &str,
        session: &str,
        limit: usize,
    ) -> Result<Vec<Transition>> {
        let recent = self.store.lrange(&keys::sequence(project, session), 0, 4).await?;
        if recent.is_empty() {
            return Ok(Vec::new());
        }

        struct Merged {
            probability: f64,
            count: u64,
            delta_sum: f64,
            contributions: u32,
        }
        let mut merged: HashMap<String, Merged> = HashMap::new();

        for (steps_back, raw) in recent.iter().enumerate() {
            let Ok(access) = serde_json::from_str::<FileAccess>(raw) else {
                continue;
            };
            let weight = STEP_DECAY.powi(steps_back as i32);
            for t in self.predict(project, &access.file, limit).await? {
                let entry = merged.entry(t.to).or_insert(Merged {
                    probability: 0.0,
                    count: 0,
                    delta_sum: 0.0,
                    contributions: 0,
                });
                entry.probability += t.probability * weight;
                entry.count += t.count;
                entry.delta_sum += t.avg_time_delta;
                entry.contributions += 1;
            }
        }

        let mut results: Vec<Transition> = merged
            .into_iter()
            .map(|(to, m)| Transition {
                from: "<recent>".to_string(),
                to,
                probability: m.probability,
                count: m.count,
                avg_time_delta: if m.contributions > 0 {
                    m.delta_sum / m.contributions as f64
                } else {
                    0.0
                },
            })
            .collect();
        results.sort_by(|a, b| {
            b.probability
                .partial_cmp(&a.probability)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.to.cmp(&b.to))
        });
        results.truncate(limit);
        Ok(results)
    }

    /// Full probability distribution out of a file.
    pub async fn matrix(&self, project: &str, file: &str) -> Result<Vec<(String, f64)>> {
        Ok(self
            .predict(project, file, usize::MAX / 2)
            .await?
            .into_iter()
            .map(|t| (t.to, t.probability))
            .collect())
    }

    pub async fn stats(&self, project: &str) -> Result<TransitionStats> {
        let sources = self.store.zrange_desc(&keys::transition_sources(project), 0, -1).await?;
        let mut total = 0u64;
        for (source, _) in &sources {
            total += self.store.zcard(&keys::transitions(project, source)).await?;
        }
        Ok(TransitionStats { source_files: sources.len() as u64, total_transitions: total })
    }

    async fn avg_time_delta(&self, project: &str, from: &str, to: &str) -> Result<f64> {
        let timings = self
            .store
            .lrange(&keys::transition_timing(project, from, to), 0, -1)
            .await?;
        let values: Vec<f64> = timings.iter().filter_map(|t| t.parse().ok()).collect();
        if values.is_empty() {
            return Ok(0.0);
        }
        Ok(values.iter().sum::<f64>() / values.len() as f64)
    }
}
