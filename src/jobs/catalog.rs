use crate::{
    error::Result,
    types::{AudioEncoding, StemDescriptor},
};

use std::{collections::HashMap, fs, path::Path};
use tracing::debug;

/// Internal stem name → display name. Order is the canonical output order.
const STEM_NAMES: &[(&str, &str)] = &[
    ("vocals", "Vocals"),
    ("drums", "Drums"),
    ("bass", "Bass"),
    ("other", "Other"),
    ("guitar", "Guitar"),
    ("piano", "Piano"),
    ("no_vocals", "Instrumental"),
    ("instrumental", "Instrumental"),
];

pub fn display_name(stem: &str) -> String {
    STEM_NAMES
        .iter()
        .find(|(internal, _)| *internal == stem)
        .map(|(_, display)| display.to_string())
        .unwrap_or_else(|| stem.to_string())
}

fn canonical_rank(stem: &str) -> usize {
    STEM_NAMES
        .iter()
        .position(|(internal, _)| *internal == stem)
        .unwrap_or(STEM_NAMES.len())
}

/// Lists the stems in `output_dir`, one descriptor per base name.
///
/// Lossless files win over lossy ones for the same stem. An empty list means nothing
/// recognizable was found; a missing directory is an I/O error.
pub fn resolve(output_dir: &Path) -> Result<Vec<StemDescriptor>> {
    let mut best: HashMap<String, (AudioEncoding, std::path::PathBuf)> = HashMap::new();

    for entry in fs::read_dir(output_dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let (Some(stem), Some(encoding)) = (
            path.file_stem().and_then(|s| s.to_str()),
            path.extension()
                .and_then(|e| e.to_str())
                .and_then(AudioEncoding::from_extension),
        ) else {
            debug!(path = %path.display(), "ignoring non-audio file");
            continue;
        };

        let replace = match best.get(stem) {
            None => true,
            Some((current, _)) => encoding.is_lossless() && !current.is_lossless(),
        };
        if replace {
            best.insert(stem.to_string(), (encoding, path.clone()));
        }
    }

    let prefix = locator_prefix(output_dir);
    let mut stems: Vec<StemDescriptor> = best
        .into_iter()
        .map(|(stem, (encoding, path))| StemDescriptor {
            name: display_name(&stem),
            locator: format!("{prefix}{stem}"),
            stem,
            path,
            encoding,
        })
        .collect();

    stems.sort_by(|a, b| {
        canonical_rank(&a.stem)
            .cmp(&canonical_rank(&b.stem))
            .then_with(|| a.stem.cmp(&b.stem))
    });
    Ok(stems)
}

/// `<model>/<song>/` taken from the last two path components.
fn locator_prefix(output_dir: &Path) -> String {
    let mut parts: Vec<&str> = output_dir
        .components()
        .rev()
        .take(2)
        .filter_map(|c| c.as_os_str().to_str())
        .collect();
    parts.reverse();
    parts.iter().map(|p| format!("{p}/")).collect()
}
