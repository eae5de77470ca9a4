use crate::{
    config::SeparationConfig,
    types::{QualityProfile, StemCount},
};

use serde::Serialize;
use std::path::{Path, PathBuf};

pub const MODEL_STANDARD: &str = "htdemucs";
pub const MODEL_SIX_STEMS: &str = "htdemucs_6s";

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(tag = "format", rename_all = "lowercase")]
pub enum OutputFormat {
    Mp3 { bitrate: u32 },
    Wav,
}

/// Tuning handed to the separation tool for one profile and stem count.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QualitySettings {
    pub model: &'static str,
    pub shifts: u32,
    pub overlap: f32,
    pub float32: bool,
    pub segment: Option<u32>,
    pub output: OutputFormat,
    /// Rough wall-clock estimate shown to users.
    pub estimate: &'static str,
}

pub fn quality_settings(profile: QualityProfile, stems: StemCount) -> QualitySettings {
    let six = stems == StemCount::Six;
    let model = if six { MODEL_SIX_STEMS } else { MODEL_STANDARD };
    let (shifts, overlap, float32, segment, output) = match profile {
        QualityProfile::Basic => (0, 0.25, false, None, OutputFormat::Mp3 { bitrate: 256 }),
        QualityProfile::Intermediate => {
            (1, 0.4, true, None, OutputFormat::Mp3 { bitrate: 320 })
        }
        QualityProfile::Maximum => (3, 0.5, true, Some(80), OutputFormat::Wav),
    };
    let estimate = match (profile, stems) {
        (QualityProfile::Basic, StemCount::Two) => "2-4 min",
        (QualityProfile::Basic, StemCount::Four) => "3-6 min",
        (QualityProfile::Basic, StemCount::Six) => "4-8 min",
        (QualityProfile::Intermediate, StemCount::Two) => "5-8 min",
        (QualityProfile::Intermediate, StemCount::Four) => "8-12 min",
        (QualityProfile::Intermediate, StemCount::Six) => "10-15 min",
        (QualityProfile::Maximum, StemCount::Two) => "10-15 min",
        (QualityProfile::Maximum, StemCount::Four) => "15-20 min",
        (QualityProfile::Maximum, StemCount::Six) => "20-30 min",
    };

    QualitySettings {
        model,
        shifts,
        overlap,
        // the six-stem model runs without float32 and segment overrides
        float32: float32 && !six,
        segment: if six { None } else { segment },
        output,
        estimate,
    }
}

/// Collapses whitespace and replaces spaces with underscores; the separation tool
/// mishandles spaces in file names.
pub fn sanitize_song_name(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join("_");
    let cleaned: String = collapsed
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();
    if cleaned.is_empty() {
        "audio".into()
    } else {
        cleaned
    }
}

/// Fully resolved invocation of the separation tool.
#[derive(Clone, Debug)]
pub struct SeparationCommand {
    pub program: String,
    pub args: Vec<String>,
    pub settings: QualitySettings,
    /// Where the stems are expected once the tool is done.
    pub expected_output: PathBuf,
}

impl SeparationCommand {
    /// `out_root` receives the tool's `<model>/<song>/` tree; callers give every job its own.
    pub fn build(
        cfg: &SeparationConfig,
        input: &Path,
        out_root: &Path,
        stems: StemCount,
        profile: QualityProfile,
    ) -> Self {
        let settings = quality_settings(profile, stems);
        let mut args = cfg.base_args.clone();
        args.extend([
            "-n".to_string(),
            settings.model.to_string(),
            "--shifts".to_string(),
            settings.shifts.to_string(),
            "--overlap".to_string(),
            settings.overlap.to_string(),
            "--jobs".to_string(),
            "0".to_string(),
            "--device".to_string(),
            cfg.device.clone(),
        ]);
        if settings.float32 {
            args.push("--float32".into());
        }
        if let Some(segment) = settings.segment {
            args.extend(["--segment".to_string(), segment.to_string()]);
        }
        if let OutputFormat::Mp3 { bitrate } = settings.output {
            args.extend([
                "--mp3".to_string(),
                "--mp3-bitrate".to_string(),
                bitrate.to_string(),
            ]);
        }
        if stems == StemCount::Two {
            args.extend(["--two-stems".to_string(), "vocals".to_string()]);
        }
        args.extend([
            "--out".to_string(),
            out_root.display().to_string(),
            input.display().to_string(),
        ]);

        let song = input
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("audio");
        let expected_output = out_root.join(settings.model).join(song);

        Self {
            program: cfg.program.clone(),
            args,
            settings,
            expected_output,
        }
    }

    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}
