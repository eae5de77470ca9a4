//! Entry point for callers: submit recordings, poll jobs, ask for chords.

use crate::{
    config::AnalyzerConfig,
    core::{
        audio::{decode_bytes, read_audio, sniff_extension},
        chords::ChordInferenceEngine,
    },
    error::{AnalyzerError, Result},
    jobs::{
        command::{quality_settings, sanitize_song_name, QualitySettings},
        history::{AnalysisHistory, HistoryEntry},
        registry::JobRegistry,
        supervisor::JobSupervisor,
    },
    types::{ChordAnalysis, JobId, JobSnapshot, QualityProfile, StemCount},
};

use serde::Serialize;
use std::{fs, path::Path, sync::Arc, time::Instant};
use tracing::{debug, info, warn};

const JOB_PREFIX: &str = "separate";

/// One row of the quality table shown to users before they submit.
#[derive(Clone, Debug, Serialize)]
pub struct QualityInfo {
    pub profile: QualityProfile,
    pub stem_count: StemCount,
    pub settings: QualitySettings,
}

pub struct Analyzer {
    config: AnalyzerConfig,
    registry: Arc<JobRegistry>,
    supervisor: JobSupervisor,
    chords: ChordInferenceEngine,
    history: Arc<dyn AnalysisHistory>,
}

impl Analyzer {
    /// Validates the config, creates the working directories, starts the worker pool and
    /// probes for a chord model.
    pub fn new(config: AnalyzerConfig, history: Arc<dyn AnalysisHistory>) -> Result<Self> {
        let chords = ChordInferenceEngine::probe(&config.chords);
        Self::with_chord_engine(config, history, chords)
    }

    pub fn with_chord_engine(
        config: AnalyzerConfig,
        history: Arc<dyn AnalysisHistory>,
        chords: ChordInferenceEngine,
    ) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.separation.upload_dir)?;
        fs::create_dir_all(&config.separation.output_dir)?;

        let registry = Arc::new(JobRegistry::new(config.retention.clone()));
        let supervisor = JobSupervisor::new(
            config.separation.clone(),
            Arc::clone(&registry),
            Arc::clone(&history),
        )?;
        info!(
            chord_strategy = chords.preferred_strategy().as_str(),
            separator = %config.separation.program,
            "analyzer ready"
        );

        Ok(Self {
            config,
            registry,
            supervisor,
            chords,
            history,
        })
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    /// Stages `audio` in the job's own upload directory and queues a separation job.
    ///
    /// `stem_count` and `quality` arrive as raw caller values and are rejected, not
    /// coerced, when out of range.
    pub fn submit(
        &self,
        audio: &[u8],
        file_name: &str,
        stem_count: u8,
        quality: &str,
    ) -> Result<JobId> {
        let stems = StemCount::try_from(stem_count)?;
        let profile: QualityProfile = quality.parse()?;
        if audio.is_empty() {
            return Err(AnalyzerError::Validation("empty upload".into()));
        }

        let name = Path::new(file_name);
        let sniffed: Option<&str> = sniff_extension(audio);
        let ext = sniffed
            .or_else(|| name.extension().and_then(|e| e.to_str()))
            .ok_or_else(|| {
                AnalyzerError::Validation(format!("unrecognized audio format: {file_name}"))
            })?
            .to_ascii_lowercase();
        let song = source_key(file_name);

        let id = JobId::generate(JOB_PREFIX);
        let upload_dir = self.config.separation.job_upload_dir(&id);
        fs::create_dir_all(&upload_dir)?;
        let staged = upload_dir.join(format!("{song}.{ext}"));
        fs::write(&staged, audio)?;
        debug!(path = %staged.display(), bytes = audio.len(), "upload staged");

        if let Err(e) = self.supervisor.start(id.clone(), &staged, stems, profile) {
            remove_tree(&upload_dir);
            return Err(e);
        }
        info!(job_id = %id, song = %song, stems = stems.count(), %profile, "job submitted");
        Ok(id)
    }

    pub fn poll(&self, id: &JobId) -> Option<JobSnapshot> {
        self.supervisor.poll(id)
    }

    /// Chord progression of an in-memory recording.
    pub fn infer_chords(&self, audio: &[u8]) -> Result<ChordAnalysis> {
        let decoded = decode_bytes(audio, None)?;
        Ok(self.chords.infer(&decoded))
    }

    /// Like [`infer_chords`](Self::infer_chords), and records the progression in the
    /// history under the upload's normalized name.
    pub fn analyze_chords(&self, audio: &[u8], file_name: &str) -> Result<ChordAnalysis> {
        let started = Instant::now();
        let hint = Path::new(file_name).extension().and_then(|e| e.to_str());
        let decoded = decode_bytes(audio, hint)?;
        let analysis = self.chords.infer(&decoded);

        let entry = HistoryEntry::chord_analysis(
            source_key(file_name),
            file_name,
            &analysis,
            Some(decoded.duration_secs()),
            started.elapsed().as_secs_f64(),
        );
        if let Err(e) = self.history.record_completed_job(entry) {
            warn!("could not record chord analysis: {e}");
        }
        info!(
            file = file_name,
            chords = analysis.intervals.len(),
            strategy = analysis.strategy.as_str(),
            "chords analyzed"
        );
        Ok(analysis)
    }

    /// Chord progression of one stem of a finished job. `stem` matches either the internal
    /// name ("other") or the display name ("Other"), case-insensitively.
    pub fn infer_chords_for_stem(&self, id: &JobId, stem: &str) -> Result<ChordAnalysis> {
        let snap = self
            .poll(id)
            .ok_or_else(|| AnalyzerError::JobNotFound(id.to_string()))?;
        let not_found = || AnalyzerError::StemNotFound {
            job_id: id.to_string(),
            stem: stem.to_string(),
        };
        let descriptor = snap
            .stems
            .as_deref()
            .unwrap_or_default()
            .iter()
            .find(|d| d.stem.eq_ignore_ascii_case(stem) || d.name.eq_ignore_ascii_case(stem))
            .ok_or_else(not_found)?;

        let audio = read_audio(&descriptor.path)?;
        Ok(self.chords.infer(&audio))
    }

    /// Earlier result for an upload with the same (normalized) name.
    pub fn lookup_cached_result(&self, file_name: &str) -> Option<HistoryEntry> {
        self.history.lookup_cached_result(&source_key(file_name))
    }

    /// Forgets every recorded analysis of `file_name` and deletes the stems and staged
    /// uploads of its finished jobs. Returns the number of history entries dropped.
    pub fn delete_analysis(&self, file_name: &str) -> Result<usize> {
        let key = source_key(file_name);
        let removed = self.history.remove(&key)?;
        let sep = &self.config.separation;
        for id in removed.iter().filter_map(|e| e.job_id.as_ref()) {
            remove_tree(&sep.job_output_root(id));
            remove_tree(&sep.job_upload_dir(id));
            self.registry.remove(id);
        }
        info!(song = %key, entries = removed.len(), "analysis deleted");
        Ok(removed.len())
    }

    pub fn quality_info(&self) -> Vec<QualityInfo> {
        QualityProfile::all()
            .iter()
            .flat_map(|&profile| {
                [StemCount::Two, StemCount::Four, StemCount::Six]
                    .into_iter()
                    .map(move |stem_count| QualityInfo {
                        profile,
                        stem_count,
                        settings: quality_settings(profile, stem_count),
                    })
            })
            .collect()
    }

    pub fn shutdown(&self) {
        self.supervisor.shutdown();
    }
}

fn remove_tree(dir: &Path) {
    match fs::remove_dir_all(dir) {
        Ok(()) => debug!(path = %dir.display(), "removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %dir.display(), "could not remove: {e}"),
    }
}

/// Normalized song name of an upload; names the staged file and keys the history cache.
fn source_key(file_name: &str) -> String {
    let stem = Path::new(file_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(file_name);
    sanitize_song_name(stem)
}
