use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("failed to launch separation process '{program}': {reason}")]
    ProcessSpawn { program: String, reason: String },

    #[error("no output produced")]
    OutputMissing,

    #[error("empty output")]
    OutputEmpty,

    #[error("no recognized stems in output")]
    NoRecognizedStems,

    #[error("chord analysis failed: {0}")]
    Analysis(String),

    #[error("failed to decode audio: {0}")]
    Decode(String),

    #[error("job queue is full ({capacity} pending)")]
    QueueFull { capacity: usize },

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("stem '{stem}' not found for job {job_id}")]
    StemNotFound { job_id: String, stem: String },

    #[error("job supervisor is shut down")]
    ShutDown,

    #[error("model manifest error: {0}")]
    Manifest(String),

    #[error("checksum mismatch for {path}")]
    Checksum { path: String },

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Ort(#[from] ort::Error),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, AnalyzerError>;

impl AnalyzerError {
    /// Errors that stop a separation job for good (as opposed to caller mistakes).
    pub fn is_job_failure(&self) -> bool {
        matches!(
            self,
            AnalyzerError::ProcessSpawn { .. }
                | AnalyzerError::OutputMissing
                | AnalyzerError::OutputEmpty
                | AnalyzerError::NoRecognizedStems
                | AnalyzerError::Io(_)
        )
    }

    pub fn analysis(reason: impl Into<String>) -> Self {
        AnalyzerError::Analysis(reason.into())
    }
}
