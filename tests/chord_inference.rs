//! Chord inference through the public facade, with synthesized recordings.

use approx::assert_abs_diff_eq;
use rand::{rngs::StdRng, Rng, SeedableRng};
use stem_analyzer_core::{
    AnalysisHistory, Analyzer, AnalyzerConfig, AnalyzerError, AudioData, ChordConfig,
    ChordInferenceEngine, ChordModel, ChordObservation, InMemoryHistory, StrategyTag,
};

use std::{f32::consts::PI, io::Cursor, sync::Arc};

const SR: u32 = 22_050;

fn wav_bytes(samples: &[f32], sr: u32) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: sr,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for s in samples {
            writer
                .write_sample((s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
                .unwrap();
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}

fn triad(freqs: [f32; 3], secs: f32) -> Vec<f32> {
    (0..(secs * SR as f32) as usize)
        .map(|i| {
            let t = i as f32 / SR as f32;
            freqs.iter().map(|f| (2.0 * PI * f * t).sin()).sum::<f32>() / 4.0
        })
        .collect()
}

fn analyzer_with(
    engine: impl FnOnce(&ChordConfig) -> ChordInferenceEngine,
) -> (tempfile::TempDir, Analyzer) {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = AnalyzerConfig::default();
    cfg.separation.upload_dir = dir.path().join("uploads");
    cfg.separation.output_dir = dir.path().join("stems");
    cfg.separation.workers = 1;
    let chords = engine(&cfg.chords);
    let history: Arc<dyn AnalysisHistory> = Arc::new(InMemoryHistory::default());
    let analyzer = Analyzer::with_chord_engine(cfg, history, chords).unwrap();
    (dir, analyzer)
}

struct ScriptedModel(Vec<ChordObservation>);

impl ChordModel for ScriptedModel {
    fn predict(&self, _audio: &AudioData) -> stem_analyzer_core::Result<Vec<ChordObservation>> {
        Ok(self.0.clone())
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

struct FailingModel;

impl ChordModel for FailingModel {
    fn predict(&self, _audio: &AudioData) -> stem_analyzer_core::Result<Vec<ChordObservation>> {
        Err(AnalyzerError::analysis("no session"))
    }

    fn name(&self) -> &str {
        "failing"
    }
}

fn obs(label: &str, onset: f64, duration: f64) -> ChordObservation {
    ChordObservation {
        label: label.into(),
        onset,
        duration,
    }
}

#[test]
fn heuristic_finds_c_major_in_a_sustained_triad() {
    let (_dir, analyzer) = analyzer_with(ChordInferenceEngine::heuristic_only);
    let audio = wav_bytes(&triad([261.63, 329.63, 392.0], 6.0), SR);

    let analysis = analyzer.infer_chords(&audio).unwrap();
    assert_eq!(analysis.strategy, StrategyTag::ChromaHeuristic);
    let longest = analysis
        .intervals
        .iter()
        .max_by(|a, b| a.duration().total_cmp(&b.duration()))
        .expect("at least one chord");
    assert_eq!(longest.label, "C");
    assert!(analysis.intervals.last().unwrap().end <= 6.0 + 1e-6);
}

#[test]
fn intervals_are_ordered_and_disjoint_for_noise() {
    let mut rng = StdRng::seed_from_u64(7);
    let noise: Vec<f32> = (0..SR as usize * 5).map(|_| rng.gen_range(-0.3..0.3)).collect();
    let (_dir, analyzer) = analyzer_with(ChordInferenceEngine::heuristic_only);

    let analysis = analyzer.infer_chords(&wav_bytes(&noise, SR)).unwrap();
    for c in &analysis.intervals {
        assert!(c.end > c.start);
    }
    for w in analysis.intervals.windows(2) {
        assert!(w[0].end <= w[1].start + 1e-9);
    }
}

#[test]
fn model_predictions_are_renamed_and_merged() {
    let (_dir, analyzer) = analyzer_with(|cfg| {
        ChordInferenceEngine::with_model(
            cfg,
            Box::new(ScriptedModel(vec![
                obs("N", 0.0, 0.5),
                obs("A:min7", 0.5, 1.0),
                obs("A:min7", 1.5, 1.0),
                obs("F#:maj", 2.5, 0.75),
                obs("C:xyz", 3.25, 0.5),
            ])),
        )
    });
    let audio = wav_bytes(&triad([220.0, 261.63, 329.63], 1.0), SR);

    let analysis = analyzer.infer_chords(&audio).unwrap();
    assert_eq!(analysis.strategy, StrategyTag::DeepModel);
    let labels: Vec<&str> = analysis.intervals.iter().map(|c| c.label.as_str()).collect();
    assert_eq!(labels, vec!["Am7", "F#", "Cxyz"]);
    assert_abs_diff_eq!(analysis.intervals[0].start, 0.5, epsilon = 1e-9);
    assert_abs_diff_eq!(analysis.intervals[0].end, 2.5, epsilon = 1e-9);
    assert_abs_diff_eq!(analysis.intervals[2].end, 3.75, epsilon = 1e-9);
}

#[test]
fn failing_model_falls_back_to_heuristic() {
    let (_dir, analyzer) =
        analyzer_with(|cfg| ChordInferenceEngine::with_model(cfg, Box::new(FailingModel)));
    let audio = wav_bytes(&triad([261.63, 329.63, 392.0], 3.0), SR);

    let analysis = analyzer.infer_chords(&audio).unwrap();
    assert_eq!(analysis.strategy, StrategyTag::ChromaHeuristic);
}

#[test]
fn undecodable_bytes_are_reported() {
    let (_dir, analyzer) = analyzer_with(ChordInferenceEngine::heuristic_only);
    assert!(matches!(
        analyzer.infer_chords(b"definitely not audio"),
        Err(AnalyzerError::Decode(_))
    ));
}

#[test]
fn strategy_tags_serialize_like_the_wire_format() {
    let (_dir, analyzer) = analyzer_with(ChordInferenceEngine::heuristic_only);
    let audio = wav_bytes(&triad([261.63, 329.63, 392.0], 3.0), SR);
    let json = serde_json::to_value(analyzer.infer_chords(&audio).unwrap()).unwrap();
    assert_eq!(json["method"], "chroma_enhanced");
    assert!(json["intervals"].is_array());
}

#[test]
fn analyzed_chords_are_recorded_and_can_be_deleted() {
    let (_dir, analyzer) = analyzer_with(ChordInferenceEngine::heuristic_only);
    let audio = wav_bytes(&triad([261.63, 329.63, 392.0], 3.0), SR);

    let analysis = analyzer.analyze_chords(&audio, "Sunday Jam.wav").unwrap();
    let cached = analyzer.lookup_cached_result("Sunday Jam.wav").unwrap();
    assert!(cached.job_id.is_none());
    assert_eq!(cached.source_key, "Sunday_Jam");
    assert_eq!(cached.chord_count, analysis.intervals.len());
    assert_eq!(cached.chords, analysis.intervals);
    assert_eq!(cached.model, "chroma_enhanced");
    assert_abs_diff_eq!(cached.duration_secs.unwrap(), 3.0, epsilon = 1e-3);

    // plain inference is not recorded, so only one entry goes
    analyzer.infer_chords(&audio).unwrap();
    assert_eq!(analyzer.delete_analysis("Sunday Jam.wav").unwrap(), 1);
    assert!(analyzer.lookup_cached_result("Sunday Jam.wav").is_none());
}
