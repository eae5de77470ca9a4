use crate::{
    config::ChordConfig,
    core::{
        audio::prepare_mono, engine::OnnxChordModel, heuristic::ChromaHeuristicStrategy,
        segments::merge_segments,
    },
    error::Result,
    model::model_manager::{ensure_model, load_model_from_path},
    types::{AudioData, ChordAnalysis, ChordInterval, StrategyTag},
};

use tracing::{debug, info, warn};

/// Academic quality token → conventional suffix.
const QUALITY_MAP: &[(&str, &str)] = &[
    ("maj", ""),
    ("min", "m"),
    ("maj7", "maj7"),
    ("min7", "m7"),
    ("7", "7"),
    ("dim", "°"),
    ("aug", "+"),
    ("sus2", "sus2"),
    ("sus4", "sus4"),
    ("5", "5"),
    ("maj6", "6"),
    ("min6", "m6"),
    ("9", "9"),
    ("maj9", "maj9"),
    ("min9", "m9"),
    ("11", "11"),
    ("13", "13"),
    ("dim7", "°7"),
    ("hdim7", "ø7"),
    ("minmaj7", "m(maj7)"),
];

/// Labels the model emits when it has no confident chord.
const NO_CHORD: &[&str] = &["N", "X"];

/// `A:min7` → `Am7`. Unknown qualities are appended verbatim; labels without a colon pass
/// through untouched.
pub fn convert_chord_notation(harte: &str) -> String {
    match harte.split_once(':') {
        Some((root, quality)) => format!("{root}{}", rename_quality(quality)),
        None => harte.to_string(),
    }
}

fn rename_quality(quality: &str) -> &str {
    QUALITY_MAP
        .iter()
        .find(|(academic, _)| *academic == quality)
        .map(|(_, conventional)| *conventional)
        .unwrap_or(quality)
}

/// One raw prediction from a pretrained chord model.
#[derive(Clone, Debug, PartialEq)]
pub struct ChordObservation {
    pub label: String,
    pub onset: f64,
    pub duration: f64,
}

/// A pretrained chord recognizer. Implementations own their feature extraction.
pub trait ChordModel: Send + Sync {
    fn predict(&self, audio: &AudioData) -> Result<Vec<ChordObservation>>;

    /// Name of this model (for logging)
    fn name(&self) -> &str;
}

pub struct DeepModelStrategy {
    model: Box<dyn ChordModel>,
}

impl DeepModelStrategy {
    pub fn new(model: Box<dyn ChordModel>) -> Self {
        Self { model }
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    pub fn infer(&self, audio: &AudioData) -> Result<Vec<ChordInterval>> {
        let observations = self.model.predict(audio)?;
        debug!(model = self.model.name(), count = observations.len(), "model observations");
        Ok(relabel_observations(observations))
    }
}

/// Drops no-chord sentinels, renames labels and merges runs.
pub fn relabel_observations(observations: Vec<ChordObservation>) -> Vec<ChordInterval> {
    merge_segments(
        observations
            .into_iter()
            .filter(|o| !NO_CHORD.contains(&o.label.as_str()))
            .map(|o| (convert_chord_notation(&o.label), o.onset, o.onset + o.duration)),
    )
}

/// Strategy set chosen once, when the engine is built.
pub enum ChordBackend {
    Deep {
        deep: DeepModelStrategy,
        fallback: ChromaHeuristicStrategy,
    },
    Heuristic(ChromaHeuristicStrategy),
}

pub struct ChordInferenceEngine {
    backend: ChordBackend,
}

impl ChordInferenceEngine {
    /// Loads the configured chord model if there is one; otherwise heuristic only.
    pub fn probe(cfg: &ChordConfig) -> Self {
        match load_configured_model(cfg) {
            Ok(Some(model)) => {
                info!(model = model.name(), "chord model available");
                Self::with_model(cfg, model)
            }
            Ok(None) => {
                info!("no chord model configured, using chroma heuristic");
                Self::heuristic_only(cfg)
            }
            Err(e) => {
                warn!("chord model unavailable ({e}), using chroma heuristic");
                Self::heuristic_only(cfg)
            }
        }
    }

    pub fn heuristic_only(cfg: &ChordConfig) -> Self {
        Self {
            backend: ChordBackend::Heuristic(ChromaHeuristicStrategy::new(cfg)),
        }
    }

    pub fn with_model(cfg: &ChordConfig, model: Box<dyn ChordModel>) -> Self {
        Self {
            backend: ChordBackend::Deep {
                deep: DeepModelStrategy::new(model),
                fallback: ChromaHeuristicStrategy::new(cfg),
            },
        }
    }

    /// Strategy tried first.
    pub fn preferred_strategy(&self) -> StrategyTag {
        match self.backend {
            ChordBackend::Deep { .. } => StrategyTag::DeepModel,
            ChordBackend::Heuristic(_) => StrategyTag::ChromaHeuristic,
        }
    }

    /// Never fails: model errors fall back to the heuristic, heuristic errors yield no chords.
    pub fn infer(&self, audio: &AudioData) -> ChordAnalysis {
        let fallback = match &self.backend {
            ChordBackend::Deep { deep, fallback } => match deep.infer(audio) {
                Ok(intervals) => {
                    return ChordAnalysis {
                        intervals,
                        strategy: StrategyTag::DeepModel,
                    }
                }
                Err(e) => {
                    warn!(model = deep.model_name(), "chord model failed ({e}), falling back");
                    fallback
                }
            },
            ChordBackend::Heuristic(h) => h,
        };

        ChordAnalysis {
            intervals: run_heuristic(fallback, audio),
            strategy: StrategyTag::ChromaHeuristic,
        }
    }
}

fn run_heuristic(h: &ChromaHeuristicStrategy, audio: &AudioData) -> Vec<ChordInterval> {
    match prepare_mono(audio, h.sample_rate(), Some(h.max_duration_secs())) {
        Ok(samples) => h.detect(&samples),
        Err(e) => {
            warn!("chroma analysis failed: {e}");
            Vec::new()
        }
    }
}

fn load_configured_model(cfg: &ChordConfig) -> Result<Option<Box<dyn ChordModel>>> {
    let handle = if let Some(path) = &cfg.model_path {
        load_model_from_path(path)?
    } else if let Some(url) = &cfg.manifest_url {
        ensure_model(url)?
    } else {
        return Ok(None);
    };
    Ok(Some(Box::new(OnnxChordModel::load(&handle)?)))
}
