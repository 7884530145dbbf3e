//! Thompson-sampling weight tuner.
//!
//! A small multi-armed bandit over a fixed closed set of eight weight triples.
//! Each arm keeps Beta(1+hits, 1+misses) posterior counts in the KV; `select`
//! draws one sample per arm and plays the largest. Evaluator outcomes arrive
//! through `record_feedback`, attributed by the arm index stored on the
//! prediction batch.

use rand::Rng;
use rand_distr::{Beta, Distribution};
use serde::Serialize;
use std::sync::Arc;

use crate::store::{keys, Result, ScoreStore};
use crate::types::Weights;

/// The fixed arm set. Weights are (recency, frequency, tag) and sum to 1.0.
pub const ARMS: [(&str, Weights); 8] = [
    ("default", Weights { recency: 0.4, frequency: 0.3, tag: 0.3 }),
    ("recency-heavy", Weights { recency: 0.6, frequency: 0.2, tag: 0.2 }),
    ("frequency-heavy", Weights { recency: 0.2, frequency: 0.6, tag: 0.2 }),
    ("tag-heavy", Weights { recency: 0.2, frequency: 0.2, tag: 0.6 }),
    ("equal", Weights { recency: 0.34, frequency: 0.33, tag: 0.33 }),
    ("recency-frequency", Weights { recency: 0.45, frequency: 0.45, tag: 0.1 }),
    ("recency-tag", Weights { recency: 0.45, frequency: 0.1, tag: 0.45 }),
    ("frequency-tag", Weights { recency: 0.1, frequency: 0.45, tag: 0.45 }),
];

/// Index of the "default" arm, used when the store is unavailable.
pub const DEFAULT_ARM: usize = 0;

#[derive(Clone, Serialize)]
pub struct ArmStats {
    pub index: usize,
    pub name: &'static str,
    pub weights: Weights,
    pub alpha: f64,
    pub beta: f64,
    pub mean: f64,
    pub samples: u64,
}

pub struct WeightTuner {
    store: Arc<dyn ScoreStore>,
}

impl WeightTuner {
    pub fn new(store: Arc<dyn ScoreStore>) -> Self {
        Self { store }
    }

    async fn arm_counts(&self, project: &str) -> Result<Vec<(u64, u64)>> {
        let fields = self.store.hgetall(&keys::tuner(project)).await?;
        let lookup = |name: &str| -> u64 {
            fields
                .iter()
                .find(|(f, _)| f == name)
                .and_then(|(_, v)| v.parse().ok())
                .unwrap_or(0)
        };
        Ok((0..ARMS.len())
            .map(|i| (lookup(&format!("arm:{i}:hits")), lookup(&format!("arm:{i}:misses"))))
            .collect())
    }

    /// Thompson sampling: draw from each arm's Beta posterior, play the
    /// largest draw. Returns the arm index and its weight triple.
    pub async fn select(&self, project: &str) -> Result<(usize, Weights)> {
        let counts = self.arm_counts(project).await?;
        let mut rng = rand::rng();

        let mut best = DEFAULT_ARM;
        let mut best_draw = f64::MIN;
        for (i, (hits, misses)) in counts.iter().enumerate() {
            let alpha = 1.0 + *hits as f64;
            let beta = 1.0 + *misses as f64;
            let draw = match Beta::new(alpha, beta) {
                Ok(dist) => dist.sample(&mut rng),
                // Degenerate parameters: fall back to the posterior mean.
                Err(_) => alpha / (alpha + beta),
            };
            if draw > best_draw {
                best_draw = draw;
                best = i;
            }
        }
        Ok((best, ARMS[best].1))
    }

    /// Record one evaluator outcome for an arm.
    pub async fn record_feedback(&self, project: &str, arm: usize, hit: bool) -> Result<()> {
        if arm >= ARMS.len() {
            return Ok(());
        }
        let field = if hit { format!("arm:{arm}:hits") } else { format!("arm:{arm}:misses") };
        self.store.hincrby(&keys::tuner(project), &field, 1).await?;
        Ok(())
    }

    /// Pure exploitation: the arm with the largest posterior mean.
    pub async fn best(&self, project: &str) -> Result<ArmStats> {
        let stats = self.stats(project).await?;
        Ok(stats
            .into_iter()
            .max_by(|a, b| a.mean.partial_cmp(&b.mean).unwrap_or(std::cmp::Ordering::Equal))
            .unwrap_or_else(|| arm_stats(DEFAULT_ARM, 0, 0)))
    }

    pub async fn stats(&self, project: &str) -> Result<Vec<ArmStats>> {
        let counts = self.arm_counts(project).await?;
        Ok(counts
            .into_iter()
            .enumerate()
            .map(|(i, (hits, misses))| arm_stats(i, hits, misses))
            .collect())
    }

    /// Clear all arm counts for a project.
    pub async fn reset(&self, project: &str) -> Result<()> {
        self.store.del(&keys::tuner(project)).await
    }

    /// Weights to use when a caller wants the current best guess without
    /// sampling (degraded mode).
    pub fn default_weights(&self) -> Weights {
        ARMS[DEFAULT_ARM].1
    }

    /// Sample uniformly among arms without consulting the store. Used only
    /// when the store read fails mid-request.
    pub fn fallback_select(&self) -> (usize, Weights) {
        let i = rand::rng().random_range(0..ARMS.len());
        (i, ARMS[i].1)
    }
}

fn arm_stats(index: usize, hits: u64, misses: u64) -> ArmStats {
    let alpha = 1.0 + hits as f64;
    let beta = 1.0 + misses as f64;
    ArmStats {
        index,
        name: ARMS[index].0,
        weights: ARMS[index].1,
        alpha,
        beta,
        mean: alpha / (alpha + beta),
        samples: hits + misses,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn tuner() -> WeightTuner {
        WeightTuner::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn arms_sum_to_one() {
        for (name, w) in ARMS {
            let sum = w.recency + w.frequency + w.tag;
            assert!((sum - 1.0).abs() < 1e-9, "arm {name} sums to {sum}");
        }
    }

    #[tokio::test]
    async fn uniform_priors_explore_every_arm() {
        let t = tuner();
        let mut seen = [false; ARMS.len()];
        for _ in 0..2_000 {
            let (arm, _) = t.select("p").await.unwrap();
            seen[arm] = true;
        }
        assert!(seen.iter().all(|s| *s), "with Beta(1,1) priors every arm should be drawn: {seen:?}");
    }

    #[tokio::test]
    async fn converges_to_the_best_arm() {
        let t = tuner();
        // Arm 2 hits 80% of the time, everything else 40%.
        for i in 0..ARMS.len() {
            let (hits, misses) = if i == 2 { (100, 25) } else { (50, 75) };
            for _ in 0..hits {
                t.record_feedback("p", i, true).await.unwrap();
            }
            for _ in 0..misses {
                t.record_feedback("p", i, false).await.unwrap();
            }
        }

        let best = t.best("p").await.unwrap();
        assert_eq!(best.index, 2);
        assert!(best.mean > 0.7, "best arm mean {}", best.mean);

        // Selection should strongly prefer arm 2 as well.
        let mut wins = 0;
        for _ in 0..200 {
            if t.select("p").await.unwrap().0 == 2 {
                wins += 1;
            }
        }
        assert!(wins > 100, "arm 2 selected only {wins}/200 times");
    }

    #[tokio::test]
    async fn stats_report_posterior_parameters() {
        let t = tuner();
        t.record_feedback("p", 1, true).await.unwrap();
        t.record_feedback("p", 1, true).await.unwrap();
        t.record_feedback("p", 1, false).await.unwrap();

        let stats = t.stats("p").await.unwrap();
        assert_eq!(stats.len(), ARMS.len());
        assert_eq!(stats[1].alpha, 3.0);
        assert_eq!(stats[1].beta, 2.0);
        assert_eq!(stats[1].samples, 3);
        assert_eq!(stats[0].samples, 0);
    }

    #[tokio::test]
    async fn reset_clears_counts() {
        let t = tuner();
        t.record_feedback("p", 0, true).await.unwrap();
        t.reset("p").await.unwrap();
        let stats = t.stats("p").await.unwrap();
        assert!(stats.iter().all(|a| a.samples == 0));
    }

    #[tokio::test]
    async fn out_of_range_arm_is_ignored() {
        let t = tuner();
        t.record_feedback("p", 99, true).await.unwrap();
        assert!(t.stats("p").await.unwrap().iter().all(|a| a.samples == 0));
    }
}
