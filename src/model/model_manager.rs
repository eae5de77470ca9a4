use crate::{
    error::{AnalyzerError, Result},
    io::{
        crypto::verify_sha256,
        net::{download_with_progress, http_client},
        paths::models_cache_dir,
    },
    types::ChordModelManifest,
};

use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{info, warn};

#[derive(Debug)]
pub struct ChordModelHandle {
    pub manifest: ChordModelManifest,
    pub local_path: PathBuf,
}

/// Loads a local model. The manifest must sit next to it as `<model>.json`.
pub fn load_model_from_path(model_path: impl AsRef<Path>) -> Result<ChordModelHandle> {
    let path = model_path.as_ref().to_path_buf();
    if !path.exists() {
        return Err(AnalyzerError::Manifest(format!(
            "model file not found: {}",
            path.display()
        )));
    }

    let manifest_path = path.with_extension("json");
    let raw = fs::read_to_string(&manifest_path).map_err(|e| {
        AnalyzerError::Manifest(format!(
            "cannot read manifest {}: {e}",
            manifest_path.display()
        ))
    })?;
    let manifest: ChordModelManifest = serde_json::from_str(&raw)?;

    Ok(ChordModelHandle {
        manifest,
        local_path: path,
    })
}

/// Fetches the manifest, downloads its primary artifact into the cache unless a copy with
/// the right checksum is already there.
pub fn ensure_model(manifest_url: &str) -> Result<ChordModelHandle> {
    ensure_model_in(manifest_url, &models_cache_dir()?)
}

pub fn ensure_model_in(manifest_url: &str, cache_dir: &Path) -> Result<ChordModelHandle> {
    let client = http_client()?;
    let manifest: ChordModelManifest = client
        .get(manifest_url)
        .send()?
        .error_for_status()?
        .json()?;

    let a = manifest
        .resolve_primary_artifact()
        .map_err(AnalyzerError::Manifest)?;
    if a.sha256.len() < 8 {
        return Err(AnalyzerError::Manifest("artifact sha256 too short".into()));
    }

    fs::create_dir_all(cache_dir)?;
    let ext = Path::new(&a.file)
        .extension()
        .and_then(|e| e.to_str())
        .map(|s| format!(".{s}"))
        .unwrap_or_default();
    let file_name = format!("{}-{}{}", manifest.name, &a.sha256[..8], ext);
    let local_path = cache_dir.join(file_name);

    let need_download = !matches!(verify_sha256(&local_path, &a.sha256), Ok(true));
    if need_download {
        info!(url = %a.url, path = %local_path.display(), "downloading chord model");
        download_with_progress(&client, &a.url, &local_path)?;
        if !verify_sha256(&local_path, &a.sha256)? {
            let _ = fs::remove_file(&local_path);
            return Err(AnalyzerError::Checksum {
                path: local_path.display().to_string(),
            });
        }
        if a.size_bytes > 0 {
            let size = fs::metadata(&local_path).map(|m| m.len()).unwrap_or(0);
            if size != a.size_bytes {
                warn!(
                    path = %local_path.display(),
                    expected = a.size_bytes,
                    got = size,
                    "model size mismatch"
                );
            }
        }
    }

    Ok(ChordModelHandle {
        manifest,
        local_path,
    })
}
