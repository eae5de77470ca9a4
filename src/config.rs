//! Runtime configuration.
//!
//! Every field has a default, so an empty JSON object is a valid config file.
//! A few environment variables override the file (see [`AnalyzerConfig::with_env_overrides`]).

use crate::{
    error::{AnalyzerError, Result},
    types::JobId,
};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, path::PathBuf, time::Duration};

pub const ENV_MODEL_PATH: &str = "STEM_ANALYZER_MODEL_PATH";
pub const ENV_SEPARATOR: &str = "STEM_ANALYZER_SEPARATOR";
pub const ENV_OUTPUT_DIR: &str = "STEM_ANALYZER_OUTPUT_DIR";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub separation: SeparationConfig,
    pub retention: RetentionConfig,
    pub chords: ChordConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SeparationConfig {
    /// Executable that performs the separation.
    pub program: String,
    /// Arguments placed before the generated ones, e.g. `["-m", "demucs"]`.
    pub base_args: Vec<String>,
    pub device: String,
    /// Stems land in `<output_dir>/<job>/<model>/<song>/`.
    pub output_dir: PathBuf,
    pub upload_dir: PathBuf,
    pub workers: usize,
    pub queue_capacity: usize,
    /// How long to wait for the process to exit after it reports 100%.
    pub stall_grace_secs: u64,
    /// Pause between the terminate signal and the hard kill.
    pub terminate_wait_ms: u64,
    /// Pacing of the diagnostic read loop.
    pub poll_interval_ms: u64,
}

impl Default for SeparationConfig {
    fn default() -> Self {
        Self {
            program: "python3".into(),
            base_args: vec!["-m".into(), "demucs".into()],
            device: "cpu".into(),
            output_dir: PathBuf::from("stems"),
            upload_dir: PathBuf::from("uploads"),
            workers: 2,
            queue_capacity: 16,
            stall_grace_secs: 30,
            terminate_wait_ms: 1000,
            poll_interval_ms: 100,
        }
    }
}

impl SeparationConfig {
    pub fn stall_grace(&self) -> Duration {
        Duration::from_secs(self.stall_grace_secs)
    }

    pub fn terminate_wait(&self) -> Duration {
        Duration::from_millis(self.terminate_wait_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn job_upload_dir(&self, id: &JobId) -> PathBuf {
        self.upload_dir.join(id.dir_name())
    }

    pub fn job_output_root(&self, id: &JobId) -> PathBuf {
        self.output_dir.join(id.dir_name())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Upper bound on tracked jobs; the oldest finished jobs go first.
    pub max_jobs: usize,
    /// Finished jobs older than this are dropped.
    pub ttl_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_jobs: 256,
            ttl_secs: 3600,
        }
    }
}

impl RetentionConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ChordConfig {
    pub sample_rate: u32,
    pub hop_length: usize,
    pub fft_size: usize,
    pub max_duration_secs: f64,
    pub window_secs: f64,
    pub activation_threshold: f32,
    pub third_margin: f32,
    pub seventh_threshold: f32,
    pub third_outright: f32,
    pub fifth_threshold: f32,
    /// Local ONNX chord model. Its manifest is expected next to it as `<model>.json`.
    pub model_path: Option<PathBuf>,
    /// Remote manifest to fetch the chord model from when no local path is set.
    pub manifest_url: Option<String>,
}

impl Default for ChordConfig {
    fn default() -> Self {
        Self {
            sample_rate: 22_050,
            hop_length: 2048,
            fft_size: 8192,
            max_duration_secs: 180.0,
            window_secs: 2.0,
            activation_threshold: 0.3,
            third_margin: 0.1,
            seventh_threshold: 0.4,
            third_outright: 0.5,
            fifth_threshold: 0.4,
            model_path: None,
            manifest_url: None,
        }
    }
}

impl AnalyzerConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)?;
        let cfg: AnalyzerConfig = serde_json::from_str(&raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Applies `STEM_ANALYZER_*` environment overrides.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(p) = std::env::var(ENV_MODEL_PATH) {
            if !p.is_empty() {
                self.chords.model_path = Some(PathBuf::from(p));
            }
        }
        if let Ok(cmd) = std::env::var(ENV_SEPARATOR) {
            let mut parts = cmd.split_whitespace().map(String::from);
            if let Some(program) = parts.next() {
                self.separation.program = program;
                self.separation.base_args = parts.collect();
            }
        }
        if let Ok(dir) = std::env::var(ENV_OUTPUT_DIR) {
            if !dir.is_empty() {
                self.separation.output_dir = PathBuf::from(dir);
            }
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        let s = &self.separation;
        if s.program.trim().is_empty() {
            return Err(AnalyzerError::Config("separation.program is empty".into()));
        }
        if s.workers == 0 {
            return Err(AnalyzerError::Config("separation.workers must be > 0".into()));
        }
        if s.queue_capacity == 0 {
            return Err(AnalyzerError::Config(
                "separation.queue_capacity must be > 0".into(),
            ));
        }
        let c = &self.chords;
        if c.sample_rate == 0 || c.hop_length == 0 || c.fft_size < c.hop_length {
            return Err(AnalyzerError::Config(format!(
                "bad chroma framing: sr={} hop={} fft={}",
                c.sample_rate, c.hop_length, c.fft_size
            )));
        }
        if !(c.window_secs > 0.0) || !(c.max_duration_secs > 0.0) {
            return Err(AnalyzerError::Config(
                "chords.window_secs and chords.max_duration_secs must be positive".into(),
            ));
        }
        if self.retention.max_jobs == 0 {
            return Err(AnalyzerError::Config("retention.max_jobs must be > 0".into()));
        }
        Ok(())
    }
}
