use crate::error::{AnalyzerError, Result};
use directories::ProjectDirs;
use std::path::PathBuf;

pub fn models_cache_dir() -> Result<PathBuf> {
    let dirs = ProjectDirs::from("dev", "stem-analyzer", "stem-analyzer-core")
        .ok_or_else(|| AnalyzerError::Config("no home directory for the model cache".into()))?;
    Ok(dirs.cache_dir().join("models"))
}
