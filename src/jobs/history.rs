//! Completed-analysis history and the "already analyzed" cache.
//!
//! Storage is a collaborator behind [`AnalysisHistory`]; this crate ships only the
//! in-memory flavour.

use crate::{
    error::Result,
    types::{ChordAnalysis, ChordInterval, JobId, QualityProfile, StemCount, StemDescriptor},
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

pub const DEFAULT_HISTORY_LEN: usize = 20;

/// One finished analysis: a separation job, or a chord detection run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Separation job that produced the entry; `None` for chord analyses.
    pub job_id: Option<JobId>,
    /// Normalized song name; also the cache key.
    pub source_key: String,
    pub source_name: String,
    pub stem_count: Option<StemCount>,
    pub quality: Option<QualityProfile>,
    /// Separation model, or the chord strategy tag.
    pub model: String,
    pub stems: Vec<StemDescriptor>,
    pub chord_count: usize,
    pub chords: Vec<ChordInterval>,
    /// Length of the source recording, when known.
    pub duration_secs: Option<f64>,
    pub elapsed_secs: f64,
    pub completed_at: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn chord_analysis(
        source_key: impl Into<String>,
        source_name: impl Into<String>,
        analysis: &ChordAnalysis,
        duration_secs: Option<f64>,
        elapsed_secs: f64,
    ) -> Self {
        Self {
            job_id: None,
            source_key: source_key.into(),
            source_name: source_name.into(),
            stem_count: None,
            quality: None,
            model: analysis.strategy.as_str().to_string(),
            stems: Vec::new(),
            chord_count: analysis.intervals.len(),
            chords: analysis.intervals.clone(),
            duration_secs,
            elapsed_secs,
            completed_at: Utc::now(),
        }
    }

    fn same_run(&self, other: &HistoryEntry) -> bool {
        self.job_id == other.job_id && self.completed_at == other.completed_at
    }
}

pub trait AnalysisHistory: Send + Sync {
    fn record_completed_job(&self, entry: HistoryEntry) -> Result<()>;
    fn lookup_cached_result(&self, source_key: &str) -> Option<HistoryEntry>;
    /// Forgets everything recorded for `source_key` and returns what was dropped.
    fn remove(&self, source_key: &str) -> Result<Vec<HistoryEntry>>;
}

#[derive(Default)]
struct HistoryState {
    recent: VecDeque<HistoryEntry>,
    cache: HashMap<String, HistoryEntry>,
}

/// Keeps the most recent entries plus a cache of the latest result per source.
pub struct InMemoryHistory {
    state: Mutex<HistoryState>,
    capacity: usize,
}

impl InMemoryHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(HistoryState::default()),
            capacity: capacity.max(1),
        }
    }

    /// Newest first.
    pub fn recent(&self) -> Vec<HistoryEntry> {
        self.state.lock().recent.iter().cloned().collect()
    }
}

impl Default for InMemoryHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LEN)
    }
}

impl AnalysisHistory for InMemoryHistory {
    fn record_completed_job(&self, entry: HistoryEntry) -> Result<()> {
        let mut state = self.state.lock();
        state
            .cache
            .insert(entry.source_key.clone(), entry.clone());
        state.recent.push_front(entry);
        state.recent.truncate(self.capacity);
        Ok(())
    }

    fn lookup_cached_result(&self, source_key: &str) -> Option<HistoryEntry> {
        self.state.lock().cache.get(source_key).cloned()
    }

    fn remove(&self, source_key: &str) -> Result<Vec<HistoryEntry>> {
        let mut state = self.state.lock();
        let (removed, kept): (Vec<_>, Vec<_>) = state
            .recent
            .drain(..)
            .partition(|e| e.source_key == source_key);
        state.recent = kept.into();

        let mut removed = removed;
        if let Some(cached) = state.cache.remove(source_key) {
            if !removed.iter().any(|e| e.same_run(&cached)) {
                removed.push(cached);
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StrategyTag;

    fn entry(key: &str, job: &str) -> HistoryEntry {
        HistoryEntry {
            job_id: Some(JobId::from(job)),
            source_key: key.into(),
            source_name: format!("{key}.mp3"),
            stem_count: Some(StemCount::Four),
            quality: Some(QualityProfile::Basic),
            model: "htdemucs".into(),
            stems: vec![],
            chord_count: 0,
            chords: vec![],
            duration_secs: Some(180.0),
            elapsed_secs: 12.5,
            completed_at: Utc::now(),
        }
    }

    #[test]
    fn keeps_only_most_recent_entries() {
        let h = InMemoryHistory::new(2);
        for (i, key) in ["a", "b", "c"].iter().enumerate() {
            h.record_completed_job(entry(key, &format!("job{i}"))).unwrap();
        }
        let recent: Vec<String> = h.recent().into_iter().map(|e| e.source_key).collect();
        assert_eq!(recent, vec!["c", "b"]);
        // the cache outlives the recent list
        assert!(h.lookup_cached_result("a").is_some());
    }

    #[test]
    fn cache_returns_latest_result_for_source() {
        let h = InMemoryHistory::default();
        h.record_completed_job(entry("song", "first")).unwrap();
        h.record_completed_job(entry("song", "second")).unwrap();
        let cached = h.lookup_cached_result("song").unwrap();
        assert_eq!(cached.job_id, Some(JobId::from("second")));
        assert!(h.lookup_cached_result("other").is_none());
    }

    #[test]
    fn chord_analyses_carry_their_progression() {
        let h = InMemoryHistory::default();
        let analysis = ChordAnalysis {
            intervals: vec![
                ChordInterval {
                    start: 0.0,
                    end: 2.0,
                    label: "C".into(),
                },
                ChordInterval {
                    start: 2.0,
                    end: 4.0,
                    label: "Am".into(),
                },
            ],
            strategy: StrategyTag::ChromaHeuristic,
        };
        h.record_completed_job(HistoryEntry::chord_analysis(
            "song",
            "song.wav",
            &analysis,
            Some(4.0),
            0.1,
        ))
        .unwrap();

        let cached = h.lookup_cached_result("song").unwrap();
        assert!(cached.job_id.is_none());
        assert_eq!(cached.chord_count, 2);
        assert_eq!(cached.chords[1].label, "Am");
        assert_eq!(cached.model, "chroma_enhanced");
        assert!(cached.stems.is_empty());
    }

    #[test]
    fn remove_drops_recent_and_cached_entries_for_one_source() {
        let h = InMemoryHistory::new(2);
        h.record_completed_job(entry("song", "first")).unwrap();
        h.record_completed_job(entry("other", "x")).unwrap();
        h.record_completed_job(entry("song", "second")).unwrap();
        // "first" fell off the recent list but its key is still cached via "second"

        let removed = h.remove("song").unwrap();
        let ids: Vec<_> = removed.iter().filter_map(|e| e.job_id.clone()).collect();
        assert_eq!(ids, vec![JobId::from("second")]);
        assert!(h.lookup_cached_result("song").is_none());
        assert_eq!(h.recent().len(), 1);
        assert!(h.lookup_cached_result("other").is_some());

        assert!(h.remove("song").unwrap().is_empty());
    }
}
