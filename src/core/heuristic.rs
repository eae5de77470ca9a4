use crate::{
    config::ChordConfig,
    core::{
        chords::convert_chord_notation,
        dsp::{self, ChromaParams, PITCH_CLASSES},
        segments::merge_segments,
    },
    types::ChordInterval,
};

pub const NOTE_NAMES: [&str; PITCH_CLASSES] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// Root and quality token of one window, e.g. `(9, "min7")` for A:min7.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowChord {
    pub root: usize,
    pub quality: &'static str,
}

impl WindowChord {
    pub fn harte(&self) -> String {
        format!("{}:{}", NOTE_NAMES[self.root], self.quality)
    }
}

/// Thresholds for [`classify_window`].
#[derive(Clone, Copy, Debug)]
pub struct Thresholds {
    pub activation: f32,
    pub third_margin: f32,
    pub seventh: f32,
    pub third_outright: f32,
    pub fifth: f32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self::from(&ChordConfig::default())
    }
}

impl From<&ChordConfig> for Thresholds {
    fn from(c: &ChordConfig) -> Self {
        Self {
            activation: c.activation_threshold,
            third_margin: c.third_margin,
            seventh: c.seventh_threshold,
            third_outright: c.third_outright,
            fifth: c.fifth_threshold,
        }
    }
}

/// Labels one pitch-class profile, or `None` when fewer than two bins are active.
pub fn classify_window(profile: &[f32; PITCH_CLASSES], th: &Thresholds) -> Option<WindowChord> {
    let peak = profile.iter().copied().fold(0.0f32, f32::max);
    let norm: Vec<f32> = profile.iter().map(|v| v / (peak + 1e-6)).collect();

    let active = norm.iter().filter(|v| **v > th.activation).count();
    if active < 2 {
        return None;
    }

    // first maximum wins ties
    let mut root = 0;
    for (i, v) in norm.iter().enumerate() {
        if *v > norm[root] {
            root = i;
        }
    }

    let at = |interval: usize| norm[(root + interval) % PITCH_CLASSES];
    let minor_third = at(3);
    let major_third = at(4);
    let fifth = at(7);
    let minor_seventh = at(10);
    let major_seventh = at(11);

    let quality = if major_third > minor_third + th.third_margin {
        if major_seventh > th.seventh {
            "maj7"
        } else if minor_seventh > th.seventh {
            "7"
        } else {
            "maj"
        }
    } else if minor_third > major_third + th.third_margin {
        if minor_seventh > th.seventh {
            "min7"
        } else if major_seventh > th.seventh {
            "minmaj7"
        } else {
            "min"
        }
    } else if major_third > th.third_outright {
        "maj"
    } else if minor_third > th.third_outright {
        "min"
    } else if fifth > th.fifth {
        "5"
    } else {
        "maj"
    };

    Some(WindowChord { root, quality })
}

/// Numeric fallback detector. Always available and deterministic.
#[derive(Clone, Debug)]
pub struct ChromaHeuristicStrategy {
    params: ChromaParams,
    thresholds: Thresholds,
    window_secs: f64,
    max_duration_secs: f64,
}

impl ChromaHeuristicStrategy {
    /// Accepts unvalidated configs; a zero hop or window is clamped to one sample.
    pub fn new(cfg: &ChordConfig) -> Self {
        let hop_length = cfg.hop_length.max(1);
        Self {
            params: ChromaParams {
                sample_rate: cfg.sample_rate,
                fft_size: cfg.fft_size.max(hop_length),
                hop_length,
            },
            thresholds: Thresholds::from(cfg),
            window_secs: cfg.window_secs,
            max_duration_secs: cfg.max_duration_secs,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.params.sample_rate
    }

    pub fn max_duration_secs(&self) -> f64 {
        self.max_duration_secs
    }

    /// `samples` must be mono at [`Self::sample_rate`].
    pub fn detect(&self, samples: &[f32]) -> Vec<ChordInterval> {
        let sr = self.params.sample_rate as f64;
        let max_len = (self.max_duration_secs * sr) as usize;
        let samples = &samples[..samples.len().min(max_len)];
        if samples.is_empty() {
            return Vec::new();
        }

        let chroma = dsp::chroma(samples, self.params);
        let hop = self.params.hop_length;
        let frames_per_window = ((self.window_secs * sr) as usize / hop).max(1);
        let duration = samples.len() as f64 / sr;

        let mut candidates = Vec::new();
        for start_frame in (0..chroma.ncols()).step_by(frames_per_window) {
            let end_frame = (start_frame + frames_per_window).min(chroma.ncols());
            let mut profile = [0f32; PITCH_CLASSES];
            for (pc, slot) in profile.iter_mut().enumerate() {
                let row = chroma.row(pc);
                let sum: f32 = (start_frame..end_frame).map(|t| row[t]).sum();
                *slot = sum / (end_frame - start_frame) as f32;
            }

            let Some(chord) = classify_window(&profile, &self.thresholds) else {
                continue;
            };
            let start = (start_frame * hop) as f64 / sr;
            let end = (((start_frame + frames_per_window) * hop) as f64 / sr).min(duration);
            candidates.push((convert_chord_notation(&chord.harte()), start, end));
        }

        merge_segments(candidates)
    }
}
