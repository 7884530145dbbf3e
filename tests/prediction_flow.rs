//! End-to-end flows through the prediction pipeline: intent ingestion feeds
//! the scorer and transition model, predictions log batches, reads resolve
//! them, and outcomes reach the tuner.

mod helpers;

use farsight::evaluator::{Outcome, EVAL_WINDOW_SECS};
use farsight::predict::PredictParams;
use farsight::types::Weights;
use helpers::Harness;

fn params(keywords: &[&str], trigger: Option<&str>, session: &str) -> PredictParams {
    PredictParams {
        keywords: keywords.iter().map(|s| s.to_string()).collect(),
        tags: Vec::new(),
        trigger_file: trigger.map(|s| s.to_string()),
        session: session.to_string(),
        limit: 5,
        snippet_lines: 0,
    }
}

// ---------------------------------------------------------------------------
// Sequence learning
// ---------------------------------------------------------------------------

#[tokio::test]
async fn live_reads_teach_the_transition_model() {
    let h = Harness::new();
    // A session that always reads handler.rs right after routes.rs.
    for i in 0..3 {
        let base = 1_000.0 * (i + 1) as f64;
        h.transitions
            .record_access("p", "src/routes.rs", "Read", "s1", base)
            .await
            .unwrap();
        h.transitions
            .record_access("p", "src/handler.rs", "Read", "s1", base + 20.0)
            .await
            .unwrap();
    }

    let predicted = h.transitions.predict("p", "src/routes.rs", 5).await.unwrap();
    assert_eq!(predicted[0].to, "src/handler.rs");
    assert_eq!(predicted[0].probability, 1.0);
    assert_eq!(predicted[0].count, 3);
    assert!((predicted[0].avg_time_delta - 20.0).abs() < 0.01);
}

#[tokio::test]
async fn trigger_file_boosts_and_inserts_candidates() {
    let h = Harness::new();
    h.scorer.record_access("p", "src/handler.rs", &[], None).await.unwrap();
    for _ in 0..4 {
        h.transitions.record_pair("p", "src/routes.rs", "src/handler.rs", None).await.unwrap();
        h.transitions.record_pair("p", "src/routes.rs", "src/schema.rs", None).await.unwrap();
    }

    let prediction = h
        .engine
        .predict("p", &params(&[], Some("src/routes.rs"), "s1"))
        .await
        .unwrap();

    let handler = prediction.files.iter().find(|f| f.path == "src/handler.rs").unwrap();
    assert_eq!(handler.source, "both");
    // schema.rs never scored, but its 0.5 transition probability pulls it in.
    let schema = prediction.files.iter().find(|f| f.path == "src/schema.rs").unwrap();
    assert_eq!(schema.source, "transition");
    assert!((schema.confidence - 0.4).abs() < 1e-9);
    assert_eq!(prediction.transition_matches, 2);
}

// ---------------------------------------------------------------------------
// Scoring convergence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn heavier_recent_usage_outranks() {
    let h = Harness::new();
    let now = farsight::types::now_unix();
    for delta in [300, 120, 1] {
        h.scorer
            .record_access("p", "src/api.rs", &["api".to_string()], Some(now - delta))
            .await
            .unwrap();
    }
    h.scorer
        .record_access("p", "src/other.rs", &["api".to_string()], Some(now - 10))
        .await
        .unwrap();

    let ranked = h
        .scorer
        .ranked_files("p", &["api".to_string()], 2, Weights::default(), Some(now))
        .await
        .unwrap();
    assert_eq!(ranked[0].file, "src/api.rs");
    assert!(ranked[0].confidence > ranked[1].confidence);
}

// ---------------------------------------------------------------------------
// Hit@5 loop
// ---------------------------------------------------------------------------

#[tokio::test]
async fn full_hit_at_5_loop_with_tuner_attribution() {
    let h = Harness::new();
    let now = farsight::types::now_unix();
    for _ in 0..3 {
        h.scorer.record_access("p", "src/api.rs", &["api".to_string()], Some(now)).await.unwrap();
    }

    // First prediction: agent then reads a predicted file.
    let first = h.engine.predict("p", &params(&["api"], None, "s1")).await.unwrap();
    let batch_id = first.batch_id.clone().expect("batch logged");
    let arm = first.arm.expect("arm threaded through");

    let check = h.evaluator.check_hit("p", "s1", "src/api.rs").await.unwrap();
    assert!(check.newly_hit);
    assert_eq!(check.batch_id.as_deref(), Some(batch_id.as_str()));
    assert_eq!(check.arm, Some(arm));
    h.tuner.record_feedback("p", arm, true).await.unwrap();

    let stats = h.evaluator.rolling_stats("p", EVAL_WINDOW_SECS, None).await.unwrap();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.hit_rate, 1.0);

    // Second prediction goes stale and is finalized as a miss.
    let second = h.engine.predict("p", &params(&["api"], None, "s2")).await.unwrap();
    let second_id = second.batch_id.expect("batch logged");
    let finalized = h
        .evaluator
        .finalize("p", 0, Some(farsight::types::now_unix() + 10))
        .await
        .unwrap();
    assert!(finalized.iter().any(|(id, _)| id == &second_id));
    for (_, arm) in &finalized {
        if let Some(arm) = arm {
            h.tuner.record_feedback("p", *arm, false).await.unwrap();
        }
    }

    let batch = h.evaluator.batch("p", &second_id).await.unwrap().unwrap();
    assert_eq!(batch.outcome, Outcome::Miss);

    let stats = h
        .evaluator
        .rolling_stats("p", EVAL_WINDOW_SECS, Some(farsight::types::now_unix() + 10))
        .await
        .unwrap();
    assert_eq!((stats.hits, stats.misses), (1, 1));
    assert_eq!(stats.hit_rate, 0.5);

    // Both outcomes reached some arm.
    let total_samples: u64 = h.tuner.stats("p").await.unwrap().iter().map(|a| a.samples).sum();
    assert_eq!(total_samples, 2);
}

// ---------------------------------------------------------------------------
// Isolation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn projects_never_cross_pollinate() {
    let h = Harness::new();
    h.intents.record(
        "p",
        "Edit",
        vec!["p-only.rs".to_string()],
        vec!["api".to_string()],
        "s1",
        None,
        None,
        None,
        None,
    );
    h.scorer.record_access("p", "p-only.rs", &["api".to_string()], None).await.unwrap();

    h.intents.record(
        "q",
        "Edit",
        vec!["q-only.rs".to_string()],
        vec!["api".to_string()],
        "s2",
        None,
        None,
        None,
        None,
    );

    // Intent recents are scoped.
    assert!(h.intents.recent("p", None, 10).iter().all(|r| r.files[0] == "p-only.rs"));
    assert!(h.intents.recent("q", None, 10).iter().all(|r| r.files[0] == "q-only.rs"));

    // Predictions without a project id resolve to the global bucket and see
    // nothing from p.
    let global = h.engine.predict("global", &params(&["api"], None, "s")).await.unwrap();
    assert!(global.files.is_empty());

    let q = h.engine.predict("q", &params(&["api"], None, "s")).await.unwrap();
    assert!(q.files.is_empty());
}
