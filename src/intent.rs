//! Intent graph: captured agent activity per project.
//!
//! Owns the append-only timeline of intent records, per-session lists, and
//! the symmetric tag <-> file maps. Duplicate records are allowed and
//! double-count by design; scoring is convergent under replays.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::{HashMap, HashSet};

use crate::types::{now_unix, BYTES_PER_TOKEN};

/// Canonical tag form: trimmed, lowercased, no leading `#`.
pub fn canonical_tag(raw: &str) -> String {
    raw.trim().trim_start_matches('#').to_lowercase()
}

/// One captured tool invocation. Immutable once appended.
#[derive(Clone, Serialize)]
pub struct IntentRecord {
    pub ts: u64,
    pub session: String,
    pub tool: String,
    pub files: Vec<String>,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_sizes: Option<HashMap<String, u64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_size: Option<u64>,
}

#[derive(Clone, Serialize)]
pub struct TagCount {
    pub tag: String,
    pub count: usize,
}

/// Token savings, with the estimated stream (from file sizes) and the
/// measured stream (from observed output sizes) kept separate.
#[derive(Clone, Serialize)]
pub struct SavingsStats {
    /// Baseline tokens the agent would have spent reading whole files.
    pub estimated_tokens: u64,
    /// Tokens actually produced, from observed output sizes.
    pub measured_tokens: u64,
    pub saved_tokens: u64,
    pub time_saved_secs: f64,
    pub seconds_per_token: f64,
    /// Records that carried both a file size and an output size.
    pub records_measured: usize,
}

#[derive(Clone, Serialize)]
pub struct IntentStats {
    pub records: usize,
    pub unique_tags: usize,
    pub unique_files: usize,
    pub sessions: usize,
    pub savings: SavingsStats,
}

#[derive(Default)]
struct ProjectIntents {
    timeline: Vec<IntentRecord>,
    sessions: HashMap<String, Vec<usize>>,
    tag_files: HashMap<String, HashSet<String>>,
    file_tags: HashMap<String, HashSet<String>>,
}

pub struct IntentGraph {
    projects: DashMap<String, ProjectIntents>,
    seconds_per_token: f64,
}

impl IntentGraph {
    pub fn new(seconds_per_token: f64) -> Self {
        Self { projects: DashMap::new(), seconds_per_token }
    }

    // -----------------------------------------------------------------------
    // Recording
    // -----------------------------------------------------------------------

    /// Append a record and update both tag maps. Tags are canonicalized here
    /// and nowhere else. Returns the stored record.
    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &self,
        project: &str,
        tool: &str,
        files: Vec<String>,
        tags: Vec<String>,
        session: &str,
        tool_use_id: Option<String>,
        file_sizes: Option<HashMap<String, u64>>,
        output_size: Option<u64>,
        ts: Option<u64>,
    ) -> IntentRecord {
        let tags: Vec<String> =
            tags.iter().map(|t| canonical_tag(t)).filter(|t| !t.is_empty()).collect();
        let record = IntentRecord {
            ts: ts.unwrap_or_else(now_unix),
            session: session.to_string(),
            tool: tool.to_string(),
            files,
            tags,
            tool_use_id,
            file_sizes,
            output_size,
        };

        let mut entry = self.projects.entry(project.to_string()).or_default();
        let idx = entry.timeline.len();
        entry.sessions.entry(record.session.clone()).or_default().push(idx);
        for tag in &record.tags {
            for file in &record.files {
                entry.tag_files.entry(tag.clone()).or_default().insert(file.clone());
                entry.file_tags.entry(file.clone()).or_default().insert(tag.clone());
            }
        }
        entry.timeline.push(record.clone());
        record
    }

    // -----------------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------------

    pub fn files_for_tag(&self, project: &str, tag: &str) -> Vec<String> {
        let tag = canonical_tag(tag);
        let Some(entry) = self.projects.get(project) else {
            return Vec::new();
        };
        let mut files: Vec<String> =
            entry.tag_files.get(&tag).map(|s| s.iter().cloned().collect()).unwrap_or_default();
        files.sort();
        files
    }

    /// Tags for a file. Exact key match preferred; a bare name falls back to
    /// suffix, then substring matching over the known file keys.
    pub fn tags_for_file(&self, project: &str, file: &str) -> Vec<String> {
        let Some(entry) = self.projects.get(project) else {
            return Vec::new();
        };

        let mut tags: HashSet<String> = match entry.file_tags.get(file) {
            Some(tags) => tags.clone(),
            None => {
                let suffix = format!("/{file}");
                let mut matched: HashSet<String> = HashSet::new();
                for (_, file_tags) in
                    entry.file_tags.iter().filter(|(key, _)| key.ends_with(&suffix))
                {
                    matched.extend(file_tags.iter().cloned());
                }
                if matched.is_empty() {
                    for (_, file_tags) in
                        entry.file_tags.iter().filter(|(key, _)| key.contains(file))
                    {
                        matched.extend(file_tags.iter().cloned());
                    }
                }
                matched
            }
        };

        let mut result: Vec<String> = tags.drain().collect();
        result.sort();
        result
    }

    /// Most recent records, newest first.
    pub fn recent(&self, project: &str, since: Option<u64>, limit: usize) -> Vec<IntentRecord> {
        let Some(entry) = self.projects.get(project) else {
            return Vec::new();
        };
        entry
            .timeline
            .iter()
            .rev()
            .filter(|r| since.map(|s| r.ts >= s).unwrap_or(true))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn tags_with_counts(&self, project: &str) -> Vec<TagCount> {
        let Some(entry) = self.projects.get(project) else {
            return Vec::new();
        };
        let mut counts: Vec<TagCount> = entry
            .tag_files
            .iter()
            .map(|(tag, files)| TagCount { tag: tag.clone(), count: files.len() })
            .collect();
        counts.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.tag.cmp(&b.tag)));
        counts
    }

    pub fn record_count(&self, project: &str) -> usize {
        self.projects.get(project).map(|e| e.timeline.len()).unwrap_or(0)
    }

    // -----------------------------------------------------------------------
    // Stats
    // -----------------------------------------------------------------------

    pub fn stats(&self, project: &str) -> IntentStats {
        let Some(entry) = self.projects.get(project) else {
            return IntentStats {
                records: 0,
                unique_tags: 0,
                unique_files: 0,
                sessions: 0,
                savings: self.savings_of(&[]),
            };
        };
        IntentStats {
            records: entry.timeline.len(),
            unique_tags: entry.tag_files.len(),
            unique_files: entry.file_tags.len(),
            sessions: entry.sessions.len(),
            savings: self.savings_of(&entry.timeline),
        }
    }

    /// Savings over records carrying both per-file sizes and an output size.
    /// One file per record enters the baseline to avoid over-counting.
    fn savings_of(&self, timeline: &[IntentRecord]) -> SavingsStats {
        let mut estimated = 0u64;
        let mut measured = 0u64;
        let mut records_measured = 0usize;

        for record in timeline {
            let (Some(sizes), Some(output)) = (&record.file_sizes, record.output_size) else {
                continue;
            };
            let Some(first_size) = record.files.iter().find_map(|f| sizes.get(f)) else {
                continue;
            };
            estimated += first_size / BYTES_PER_TOKEN;
            measured += output / BYTES_PER_TOKEN;
            records_measured += 1;
        }

        let saved = estimated.saturating_sub(measured);
        SavingsStats {
            estimated_tokens: estimated,
            measured_tokens: measured,
            saved_tokens: saved,
            time_saved_secs: saved as f64 * self.seconds_per_token,
            seconds_per_token: self.seconds_per_token,
            records_measured,
        }
    }
}
