//! Shared test harness: full component wiring over the in-memory store plus
//! scratch project trees on disk.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use farsight::evaluator::Evaluator;
use farsight::index::{CodeIndex, IndexSet};
use farsight::intent::IntentGraph;
use farsight::predict::PredictionEngine;
use farsight::scorer::Scorer;
use farsight::store::{MemoryStore, ScoreStore};
use farsight::transition::TransitionModel;
use farsight::tuner::WeightTuner;
use farsight::types::IndexConfig;

pub struct Harness {
    pub store: Arc<dyn ScoreStore>,
    pub scorer: Arc<Scorer>,
    pub transitions: Arc<TransitionModel>,
    pub evaluator: Arc<Evaluator>,
    pub tuner: Arc<WeightTuner>,
    pub intents: Arc<IntentGraph>,
    pub indexes: Arc<IndexSet>,
    pub engine: Arc<PredictionEngine>,
}

impl Harness {
    pub fn new() -> Self {
        let store: Arc<dyn ScoreStore> = Arc::new(MemoryStore::new());
        let scorer = Arc::new(Scorer::new(Arc::clone(&store)));
        let transitions = Arc::new(TransitionModel::new(Arc::clone(&store)));
        let evaluator = Arc::new(Evaluator::new(Arc::clone(&store)));
        let tuner = Arc::new(WeightTuner::new(Arc::clone(&store)));
        let indexes = Arc::new(IndexSet::new());
        let engine = Arc::new(PredictionEngine::new(
            Arc::clone(&scorer),
            Arc::clone(&transitions),
            Arc::clone(&evaluator),
            Arc::clone(&tuner),
            Arc::clone(&indexes),
        ));
        Harness {
            store,
            scorer,
            transitions,
            evaluator,
            tuner,
            intents: Arc::new(IntentGraph::new(0.0075)),
            indexes,
            engine,
        }
    }

    /// Scan `root` and register it under `project`.
    pub fn index_project(&self, project: &str, root: &Path) {
        let config = IndexConfig::new(root.to_path_buf());
        let index = CodeIndex::scan(project, root, config);
        self.indexes.insert(project, index);
    }
}

/// Write a file under `root`, creating parent directories.
pub fn write_file(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create parent dirs");
    }
    std::fs::write(path, content).expect("write fixture file");
}
