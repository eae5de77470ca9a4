use crate::error::AnalyzerError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    path::PathBuf,
    str::FromStr,
    sync::atomic::{AtomicU64, Ordering},
};

#[derive(Clone, Debug)]
pub struct AudioData {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioData {
    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            channels: 1,
        }
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 || self.channels == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.channels as f64 / self.sample_rate as f64
    }
}

static JOB_SEQ: AtomicU64 = AtomicU64::new(0);

/// Opaque job identifier, e.g. `separate_1718031234567_3`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Time-derived token; the sequence suffix keeps ids unique within one millisecond.
    pub fn generate(prefix: &str) -> Self {
        let seq = JOB_SEQ.fetch_add(1, Ordering::Relaxed);
        JobId(format!("{prefix}_{}_{seq}", Utc::now().timestamp_millis()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path-safe form naming the job's upload and output directories.
    pub fn dir_name(&self) -> String {
        let name: String = self
            .0
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        if name.is_empty() {
            "job".into()
        } else {
            name
        }
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        JobId(s.to_string())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

/// Number of stems requested from the separation tool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum StemCount {
    Two,
    Four,
    Six,
}

impl StemCount {
    pub fn count(self) -> u8 {
        match self {
            StemCount::Two => 2,
            StemCount::Four => 4,
            StemCount::Six => 6,
        }
    }
}

impl Default for StemCount {
    fn default() -> Self {
        StemCount::Four
    }
}

impl TryFrom<u8> for StemCount {
    type Error = AnalyzerError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            2 => Ok(StemCount::Two),
            4 => Ok(StemCount::Four),
            6 => Ok(StemCount::Six),
            other => Err(AnalyzerError::Validation(format!(
                "stem count must be 2, 4 or 6 (got {other})"
            ))),
        }
    }
}

impl From<StemCount> for u8 {
    fn from(value: StemCount) -> Self {
        value.count()
    }
}

impl FromStr for StemCount {
    type Err = AnalyzerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let n: u8 = s.trim().parse().map_err(|_| {
            AnalyzerError::Validation(format!("stem count must be 2, 4 or 6 (got '{s}')"))
        })?;
        StemCount::try_from(n)
    }
}

/// Named separation preset trading speed for fidelity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityProfile {
    Basic,
    Intermediate,
    Maximum,
}

impl QualityProfile {
    pub fn all() -> &'static [QualityProfile] {
        &[
            QualityProfile::Basic,
            QualityProfile::Intermediate,
            QualityProfile::Maximum,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            QualityProfile::Basic => "basic",
            QualityProfile::Intermediate => "intermediate",
            QualityProfile::Maximum => "maximum",
        }
    }
}

impl Default for QualityProfile {
    fn default() -> Self {
        QualityProfile::Intermediate
    }
}

impl FromStr for QualityProfile {
    type Err = AnalyzerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "basic" => Ok(QualityProfile::Basic),
            "intermediate" => Ok(QualityProfile::Intermediate),
            "maximum" => Ok(QualityProfile::Maximum),
            _ => Err(AnalyzerError::Validation(format!(
                "quality profile must be basic, intermediate or maximum (got '{s}')"
            ))),
        }
    }
}

impl fmt::Display for QualityProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Audio container a stem file was written in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioEncoding {
    Wav,
    Flac,
    Mp3,
    Ogg,
    M4a,
}

impl AudioEncoding {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "wav" => Some(AudioEncoding::Wav),
            "flac" => Some(AudioEncoding::Flac),
            "mp3" => Some(AudioEncoding::Mp3),
            "ogg" => Some(AudioEncoding::Ogg),
            "m4a" => Some(AudioEncoding::M4a),
            _ => None,
        }
    }

    pub fn is_lossless(self) -> bool {
        matches!(self, AudioEncoding::Wav | AudioEncoding::Flac)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StemDescriptor {
    /// Display name, e.g. "Vocals".
    pub name: String,
    /// Name the separation tool gave the file, e.g. "vocals".
    pub stem: String,
    /// `<model>/<song>/<stem>`
    pub locator: String,
    pub path: PathBuf,
    pub encoding: AudioEncoding,
}

/// Point-in-time copy of a job record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub state: JobState,
    pub percentage: u8,
    pub message: String,
    pub stem_count: StemCount,
    pub quality: QualityProfile,
    pub source_name: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Seconds between start and the terminal transition.
    pub elapsed_secs: Option<f64>,
    pub model_used: Option<String>,
    pub stems: Option<Vec<StemDescriptor>>,
}

impl JobSnapshot {
    pub fn pending(
        id: JobId,
        source_name: impl Into<String>,
        stem_count: StemCount,
        quality: QualityProfile,
    ) -> Self {
        Self {
            id,
            state: JobState::Pending,
            percentage: 0,
            message: "queued".into(),
            stem_count,
            quality,
            source_name: source_name.into(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            elapsed_secs: None,
            model_used: None,
            stems: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChordInterval {
    pub start: f64,
    pub end: f64,
    #[serde(rename = "chord")]
    pub label: String,
}

impl ChordInterval {
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// Which strategy produced a chord progression.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrategyTag {
    #[serde(rename = "deep_model")]
    DeepModel,
    #[serde(rename = "chroma_enhanced")]
    ChromaHeuristic,
}

impl StrategyTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyTag::DeepModel => "deep_model",
            StrategyTag::ChromaHeuristic => "chroma_enhanced",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChordAnalysis {
    pub intervals: Vec<ChordInterval>,
    #[serde(rename = "method")]
    pub strategy: StrategyTag,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Artifact {
    pub file: String,
    pub sha256: String,
    #[serde(alias = "size_bytes")]
    pub size_bytes: u64,
    pub url: String,
}

/// Describes a pretrained chord model: how to feed it and how to read its classes.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChordModelManifest {
    pub name: String,
    #[serde(default)]
    pub version: String,

    #[serde(default = "default_model_sample_rate", alias = "sample_rate_hz")]
    pub sample_rate: u32,
    #[serde(default = "default_model_hop")]
    pub hop: usize,
    #[serde(default = "default_model_fft")]
    pub fft_size: usize,

    #[serde(default = "default_input_name")]
    pub input: String,
    #[serde(default = "default_output_name")]
    pub output: String,

    /// Harte labels indexed by output class, e.g. `["N", "C:maj", ...]`.
    pub labels: Vec<String>,

    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default)]
    pub entry: String,
}

fn default_model_sample_rate() -> u32 {
    22_050
}

fn default_model_hop() -> usize {
    2048
}

fn default_model_fft() -> usize {
    8192
}

fn default_input_name() -> String {
    "chroma".into()
}

fn default_output_name() -> String {
    "logits".into()
}

#[derive(Debug, Clone)]
pub struct ResolvedArtifact {
    pub file: String,
    pub sha256: String,
    pub size_bytes: u64,
    pub url: String,
}

impl ChordModelManifest {
    pub fn resolve_primary_artifact(&self) -> Result<ResolvedArtifact, String> {
        let pick = |a: &Artifact| ResolvedArtifact {
            file: a.file.clone(),
            sha256: a.sha256.clone(),
            size_bytes: a.size_bytes,
            url: a.url.clone(),
        };

        if self.artifacts.is_empty() {
            return Err("manifest lists no artifacts".into());
        }
        if !self.entry.is_empty() {
            return self
                .artifacts
                .iter()
                .find(|a| a.file == self.entry)
                .map(pick)
                .ok_or_else(|| format!("entry '{}' not found in artifacts[]", self.entry));
        }
        if self.artifacts.len() == 1 {
            return Ok(pick(&self.artifacts[0]));
        }
        Err("multiple artifacts present but no 'entry' specified".into())
    }

    pub fn seconds_per_frame(&self) -> f64 {
        self.hop as f64 / self.sample_rate as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_dir_names_stay_inside_their_parent() {
        let id = JobId::generate("separate");
        assert_eq!(id.dir_name(), id.as_str());
        assert_eq!(JobId::from("../x/y").dir_name(), "___x_y");
        assert_eq!(JobId::from("").dir_name(), "job");
    }

    #[test]
    fn stem_count_rejects_values_outside_enumeration() {
        assert_eq!(StemCount::try_from(6).unwrap(), StemCount::Six);
        assert!(matches!(
            StemCount::try_from(3),
            Err(AnalyzerError::Validation(_))
        ));
        assert!("five".parse::<StemCount>().is_err());
        assert_eq!(" 2 ".parse::<StemCount>().unwrap(), StemCount::Two);
    }

    #[test]
    fn quality_profile_parses_case_insensitively() {
        assert_eq!(
            "Maximum".parse::<QualityProfile>().unwrap(),
            QualityProfile::Maximum
        );
        assert!("ultra".parse::<QualityProfile>().is_err());
    }

    #[test]
    fn job_ids_are_unique_and_prefixed() {
        let a = JobId::generate("separate");
        let b = JobId::generate("separate");
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("separate_"));
    }

    #[test]
    fn manifest_resolves_entry_artifact() {
        let json = r#"{
            "name": "chord_cnn",
            "labels": ["N", "C:maj"],
            "entry": "b.onnx",
            "artifacts": [
                {"file": "a.onnx", "sha256": "00", "size_bytes": 1, "url": "http://x/a"},
                {"file": "b.onnx", "sha256": "11", "size_bytes": 2, "url": "http://x/b"}
            ]
        }"#;
        let mf: ChordModelManifest = serde_json::from_str(json).unwrap();
        assert_eq!(mf.sample_rate, 22_050);
        assert_eq!(mf.input, "chroma");
        assert_eq!(mf.resolve_primary_artifact().unwrap().file, "b.onnx");
    }

    #[test]
    fn audio_duration_accounts_for_channels() {
        let audio = AudioData {
            samples: vec![0.0; 44_100 * 2],
            sample_rate: 44_100,
            channels: 2,
        };
        assert!((audio.duration_secs() - 1.0).abs() < 1e-9);
    }
}
