pub mod config;
pub mod error;
pub mod service;
pub mod types;

pub mod core {
    pub mod audio;
    pub mod chords;
    pub mod dsp;
    pub mod engine;
    pub mod heuristic;
    pub mod segments;
}

pub mod model {
    pub mod model_manager;
}

pub mod io {
    pub mod crypto;
    pub mod net;
    pub mod paths;
    pub mod progress;
}

pub mod jobs {
    pub mod catalog;
    pub mod command;
    pub mod history;
    pub mod process;
    pub mod registry;
    pub mod supervisor;
}

// Public API
pub use crate::config::{AnalyzerConfig, ChordConfig, RetentionConfig, SeparationConfig};
pub use crate::core::chords::{
    convert_chord_notation, ChordInferenceEngine, ChordModel, ChordObservation,
};
pub use crate::core::segments::merge_segments;
pub use crate::error::{AnalyzerError, Result};
pub use crate::jobs::history::{AnalysisHistory, HistoryEntry, InMemoryHistory};
pub use crate::jobs::registry::JobRegistry;
pub use crate::jobs::supervisor::JobSupervisor;
pub use crate::model::model_manager::{ensure_model, load_model_from_path, ChordModelHandle};
pub use crate::service::{Analyzer, QualityInfo};
pub use crate::types::{
    AudioData, ChordAnalysis, ChordInterval, JobId, JobSnapshot, JobState, QualityProfile,
    StemCount, StemDescriptor, StrategyTag,
};
