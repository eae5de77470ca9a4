//! Constant-Q-style chroma.
//!
//! Each frame is a Hann-windowed FFT. Bins between C1 and C8 are folded onto semitones, each
//! semitone is the mean power of its bins (so dense high octaves do not swamp the low ones),
//! and semitones are summed into 12 pitch classes. Every frame is max-normalized.

use ndarray::Array2;
use num_complex::Complex;
use rayon::prelude::*;
use rustfft::FftPlanner;

pub const PITCH_CLASSES: usize = 12;

/// MIDI note numbers of C1 and C8.
const MIDI_LOW: f32 = 24.0;
const MIDI_HIGH: f32 = 108.0;

#[derive(Clone, Copy, Debug)]
pub struct ChromaParams {
    pub sample_rate: u32,
    pub fft_size: usize,
    pub hop_length: usize,
}

/// Chromagram with shape `[12, frames]`; frame `t` is centered on sample `t * hop`.
pub fn chroma(samples: &[f32], p: ChromaParams) -> Array2<f32> {
    if samples.is_empty() || p.hop_length == 0 || p.fft_size == 0 {
        return Array2::zeros((PITCH_CLASSES, 0));
    }

    let n_frames = samples.len().div_ceil(p.hop_length);
    let window = hann(p.fft_size);
    let semitone_of_bin = semitone_map(p.fft_size, p.sample_rate);
    let fft = FftPlanner::<f32>::new().plan_fft_forward(p.fft_size);
    let half = p.fft_size / 2;

    let columns: Vec<[f32; PITCH_CLASSES]> = (0..n_frames)
        .into_par_iter()
        .map(|t| {
            let center = t * p.hop_length;
            let mut buf: Vec<Complex<f32>> = (0..p.fft_size)
                .map(|i| {
                    let idx = (center + i).checked_sub(half);
                    let x = idx.and_then(|k| samples.get(k)).copied().unwrap_or(0.0);
                    Complex::new(x * window[i], 0.0)
                })
                .collect();
            fft.process(&mut buf);

            let mut power = [0f32; 128];
            let mut count = [0u32; 128];
            for (k, semi) in semitone_of_bin.iter().enumerate() {
                if let Some(s) = *semi {
                    power[s] += buf[k].norm_sqr();
                    count[s] += 1;
                }
            }

            let mut col = [0f32; PITCH_CLASSES];
            for s in 0..128 {
                if count[s] > 0 {
                    col[s % PITCH_CLASSES] += power[s] / count[s] as f32;
                }
            }
            let peak = col.iter().copied().fold(0.0f32, f32::max);
            if peak > 0.0 {
                col.iter_mut().for_each(|v| *v /= peak);
            }
            col
        })
        .collect();

    let mut out = Array2::zeros((PITCH_CLASSES, n_frames));
    for (t, col) in columns.iter().enumerate() {
        for (pc, v) in col.iter().enumerate() {
            out[(pc, t)] = *v;
        }
    }
    out
}

/// Rounds each positive-frequency bin to its nearest MIDI note inside the analysed range.
fn semitone_map(fft_size: usize, sample_rate: u32) -> Vec<Option<usize>> {
    let bin_hz = sample_rate as f32 / fft_size as f32;
    (0..=fft_size / 2)
        .map(|k| {
            if k == 0 {
                return None;
            }
            let f = k as f32 * bin_hz;
            let midi = 69.0 + 12.0 * (f / 440.0).log2();
            let rounded = midi.round();
            (MIDI_LOW..=MIDI_HIGH)
                .contains(&rounded)
                .then_some(rounded as usize)
        })
        .collect()
}

fn hann(n: usize) -> Vec<f32> {
    (0..n)
        .map(|i| 0.5 - 0.5 * (2.0 * std::f32::consts::PI * i as f32 / n as f32).cos())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PARAMS: ChromaParams = ChromaParams {
        sample_rate: 22_050,
        fft_size: 8192,
        hop_length: 2048,
    };

    fn tone(freqs: &[f32], secs: f32) -> Vec<f32> {
        let sr = PARAMS.sample_rate as f32;
        (0..(secs * sr) as usize)
            .map(|i| {
                freqs
                    .iter()
                    .map(|f| (2.0 * std::f32::consts::PI * f * i as f32 / sr).sin())
                    .sum::<f32>()
                    / freqs.len() as f32
            })
            .collect()
    }

    #[test]
    fn a440_lands_in_pitch_class_a() {
        let c = chroma(&tone(&[440.0], 1.0), PARAMS);
        let mid = c.ncols() / 2;
        let col = c.column(mid);
        let argmax = (0..PITCH_CLASSES)
            .max_by(|&a, &b| col[a].total_cmp(&col[b]))
            .unwrap();
        assert_eq!(argmax, 9);
        assert!((col[9] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn frame_count_follows_hop() {
        let c = chroma(&vec![0.0; 22_050], PARAMS);
        assert_eq!(c.shape(), &[12, 11]);
    }

    #[test]
    fn silence_stays_zero() {
        let c = chroma(&vec![0.0; 4096], PARAMS);
        assert!(c.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn empty_signal_has_no_frames() {
        assert_eq!(chroma(&[], PARAMS).ncols(), 0);
    }
}
