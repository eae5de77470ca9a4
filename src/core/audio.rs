use crate::{
    error::{AnalyzerError, Result},
    types::AudioData,
};

use rubato::{FftFixedInOut, Resampler};
use std::{fs::File, io::Cursor, path::Path};
use symphonia::core::{
    audio::SampleBuffer,
    codecs::{DecoderOptions, CODEC_TYPE_NULL},
    errors::Error as SymphoniaError,
    formats::{FormatOptions, FormatReader},
    io::{MediaSource, MediaSourceStream},
    meta::MetadataOptions,
    probe::Hint,
};
use tracing::{debug, trace};

const RESAMPLE_CHUNK: usize = 1024;

/// Decodes an audio file into interleaved f32 samples.
pub fn read_audio(path: impl AsRef<Path>) -> Result<AudioData> {
    let path = path.as_ref();
    let file = File::open(path)?;
    let ext = path.extension().and_then(|e| e.to_str());
    decode_source(Box::new(file), ext)
}

/// Decodes an in-memory recording. `ext` is only a probing hint.
pub fn decode_bytes(bytes: &[u8], ext: Option<&str>) -> Result<AudioData> {
    if bytes.is_empty() {
        return Err(AnalyzerError::Decode("empty input".into()));
    }
    let ext = ext.or_else(|| sniff_extension(bytes));
    decode_source(Box::new(Cursor::new(bytes.to_vec())), ext)
}

fn open_format(source: Box<dyn MediaSource>, ext: Option<&str>) -> Result<Box<dyn FormatReader>> {
    let mss = MediaSourceStream::new(source, Default::default());
    let mut hint = Hint::new();
    if let Some(ext) = ext {
        hint.with_extension(ext);
    }
    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| AnalyzerError::Decode(format!("probe failed: {e}")))?;
    Ok(probed.format)
}

fn decode_source(source: Box<dyn MediaSource>, ext: Option<&str>) -> Result<AudioData> {
    let mut format = open_format(source, ext)?;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| AnalyzerError::Decode("no audio track".into()))?;
    let track_id = track.id;
    let params = track.codec_params.clone();

    let mut decoder = symphonia::default::get_codecs()
        .make(&params, &DecoderOptions::default())
        .map_err(|e| AnalyzerError::Decode(format!("no decoder: {e}")))?;

    let mut sample_rate = params.sample_rate.unwrap_or(44_100);
    let mut channels = params.channels.map(|c| c.count()).unwrap_or(2) as u16;
    let mut samples: Vec<f32> = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(AnalyzerError::Decode(format!("read packet: {e}"))),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            Err(SymphoniaError::DecodeError(e)) => {
                trace!("skipping corrupted frame: {e}");
                continue;
            }
            Err(e) => return Err(AnalyzerError::Decode(e.to_string())),
        };

        let spec = *decoded.spec();
        sample_rate = spec.rate;
        channels = spec.channels.count() as u16;
        let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        buf.copy_interleaved_ref(decoded);
        samples.extend_from_slice(buf.samples());
    }

    if samples.is_empty() {
        return Err(AnalyzerError::Decode("no samples decoded".into()));
    }

    debug!(
        sample_rate,
        channels,
        frames = samples.len() / channels.max(1) as usize,
        "decoded audio"
    );

    Ok(AudioData {
        samples,
        sample_rate,
        channels,
    })
}

/// Container-level duration in seconds, without decoding the payload.
pub fn probe_duration(path: impl AsRef<Path>) -> Result<f64> {
    let path = path.as_ref();
    let file = File::open(path)?;
    let format = open_format(Box::new(file), path.extension().and_then(|e| e.to_str()))?;
    let track = format
        .default_track()
        .ok_or_else(|| AnalyzerError::Decode("no default track".into()))?;
    let params = &track.codec_params;
    match (params.n_frames, params.sample_rate) {
        (Some(n), Some(sr)) if sr > 0 => Ok(n as f64 / sr as f64),
        _ => Err(AnalyzerError::Decode("duration unknown".into())),
    }
}

/// Averages interleaved channels down to one.
pub fn to_mono(samples: &[f32], channels: u16) -> Vec<f32> {
    let channels = channels.max(1) as usize;
    if channels == 1 {
        return samples.to_vec();
    }
    samples
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Mono copy of `audio` at `target_rate`, truncated to `max_secs` of source material.
pub fn prepare_mono(audio: &AudioData, target_rate: u32, max_secs: Option<f64>) -> Result<Vec<f32>> {
    let mut mono = to_mono(&audio.samples, audio.channels);
    if let Some(limit) = max_secs {
        let max_frames = (limit * audio.sample_rate as f64).floor() as usize;
        mono.truncate(max_frames);
    }
    resample(&mono, audio.sample_rate, target_rate)
}

/// FFT resampling of a mono signal.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let mut resampler =
        FftFixedInOut::<f32>::new(from_rate as usize, to_rate as usize, RESAMPLE_CHUNK, 1)
            .map_err(|e| AnalyzerError::Decode(format!("resampler: {e}")))?;

    let in_frames = resampler.input_frames_next();
    let out_frames = resampler.output_frames_next();
    let ratio = to_rate as f64 / from_rate as f64;
    let expected = (samples.len() as f64 * ratio).ceil() as usize;
    let mut out = Vec::with_capacity(expected + out_frames);

    let mut pos = 0;
    while pos < samples.len() {
        let end = (pos + in_frames).min(samples.len());
        let mut chunk = samples[pos..end].to_vec();
        chunk.resize(in_frames, 0.0);
        let input = vec![chunk];
        let processed = resampler
            .process(&input, None)
            .map_err(|e| AnalyzerError::Decode(format!("resampler: {e}")))?;
        if let Some(ch) = processed.first() {
            out.extend_from_slice(ch);
        }
        pos += in_frames;
    }

    out.truncate(expected);
    Ok(out)
}

/// Writes 32-bit float WAV.
pub fn write_audio(path: impl AsRef<Path>, audio: &AudioData) -> Result<()> {
    let spec = hound::WavSpec {
        channels: audio.channels,
        sample_rate: audio.sample_rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(path.as_ref(), spec)
        .map_err(|e| AnalyzerError::Anyhow(anyhow::anyhow!("wav create: {e}")))?;
    for s in &audio.samples {
        writer
            .write_sample(*s)
            .map_err(|e| AnalyzerError::Anyhow(anyhow::anyhow!("wav write: {e}")))?;
    }
    writer
        .finalize()
        .map_err(|e| AnalyzerError::Anyhow(anyhow::anyhow!("wav finalize: {e}")))?;
    Ok(())
}

/// File extension guessed from magic bytes, for audio formats only.
pub fn sniff_extension(bytes: &[u8]) -> Option<&'static str> {
    infer::get(bytes)
        .filter(|kind| kind.matcher_type() == infer::MatcherType::Audio)
        .map(|kind| kind.extension())
}
