//! ONNX chord recognizer.
//!
//! Model contract (declared by [`ChordModelManifest`]): input `[1, frames, 12]` chroma,
//! output `[1, frames, labels.len()]` class scores, one Harte label per class.

use crate::{
    core::{
        audio::prepare_mono,
        chords::{ChordModel, ChordObservation},
        dsp::{self, ChromaParams, PITCH_CLASSES},
    },
    error::{AnalyzerError, Result},
    model::model_manager::ChordModelHandle,
    types::{AudioData, ChordModelManifest},
};

use anyhow::anyhow;
use once_cell::sync::OnceCell;
use ort::{
    execution_providers::ExecutionProviderDispatch,
    session::{
        builder::{GraphOptimizationLevel, SessionBuilder},
        Session,
    },
    value::{Tensor, Value},
};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

// CUDA: Linux and Windows only
#[cfg(all(feature = "cuda", any(target_os = "linux", target_os = "windows")))]
use ort::execution_providers::CUDAExecutionProvider;
// CoreML: macOS only (Apple Silicon)
#[cfg(all(feature = "coreml", target_os = "macos"))]
use ort::execution_providers::CoreMLExecutionProvider;
// DirectML: Windows only
#[cfg(all(feature = "directml", target_os = "windows"))]
use ort::execution_providers::{DirectMLExecutionProvider, ExecutionProvider};
// oneDNN: All platforms
#[cfg(feature = "onednn")]
use ort::execution_providers::OneDNNExecutionProvider;

static ORT_INIT: OnceCell<()> = OnceCell::new();

#[allow(unused_mut)]
fn get_execution_providers() -> Vec<ExecutionProviderDispatch> {
    let mut providers: Vec<ExecutionProviderDispatch> = Vec::new();

    #[cfg(all(feature = "cuda", any(target_os = "linux", target_os = "windows")))]
    providers.push(CUDAExecutionProvider::default().build());

    #[cfg(all(feature = "coreml", target_os = "macos"))]
    {
        // CoreML is opt-in, some models come back all zeros on it
        if std::env::var("ENABLE_COREML").is_ok() {
            providers.push(CoreMLExecutionProvider::default().build());
        }
    }

    #[cfg(all(feature = "directml", target_os = "windows"))]
    {
        for device_id in 0..4 {
            let dml = DirectMLExecutionProvider::default().with_device_id(device_id);
            if let Ok(true) = dml.is_available() {
                debug!(device_id, "DirectML available");
                providers.push(dml.build());
                break;
            }
        }
    }

    #[cfg(feature = "onednn")]
    providers.push(OneDNNExecutionProvider::default().build());

    providers
}

fn build_session(h: &ChordModelHandle) -> Result<Session> {
    ORT_INIT.get_or_try_init::<_, AnalyzerError>(|| {
        ort::init().commit().map_err(AnalyzerError::from)?;
        Ok(())
    })?;

    let num_threads = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);

    let cpu_session = || -> Result<Session> {
        Ok(SessionBuilder::new()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(num_threads)?
            .commit_from_file(&h.local_path)?)
    };

    let providers = get_execution_providers();
    if providers.is_empty() {
        debug!(num_threads, "chord model on CPU");
        return cpu_session();
    }

    // Accelerated providers first, CPU on any error
    let accelerated = (|| -> std::result::Result<Session, ort::Error> {
        SessionBuilder::new()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_execution_providers(providers)?
            .with_intra_threads(num_threads)?
            .commit_from_file(&h.local_path)
    })();

    match accelerated {
        Ok(session) => Ok(session),
        Err(e) => {
            warn!("execution providers failed ({e}), falling back to CPU");
            cpu_session()
        }
    }
}

pub struct OnnxChordModel {
    session: Mutex<Session>,
    manifest: ChordModelManifest,
}

impl OnnxChordModel {
    pub fn load(h: &ChordModelHandle) -> Result<Self> {
        if h.manifest.labels.is_empty() {
            return Err(AnalyzerError::Manifest("manifest has no labels".into()));
        }
        let session = build_session(h)?;

        let has_input = session.inputs.iter().any(|i| i.name == h.manifest.input);
        if !has_input {
            return Err(anyhow!("model missing input '{}'", h.manifest.input).into());
        }

        info!(
            model = %h.manifest.name,
            version = %h.manifest.version,
            labels = h.manifest.labels.len(),
            "chord model loaded"
        );
        Ok(Self {
            session: Mutex::new(session),
            manifest: h.manifest.clone(),
        })
    }

    fn features(&self, audio: &AudioData) -> Result<(Vec<f32>, usize)> {
        let mf = &self.manifest;
        let samples = prepare_mono(audio, mf.sample_rate, None)?;
        let chroma = dsp::chroma(
            &samples,
            ChromaParams {
                sample_rate: mf.sample_rate,
                fft_size: mf.fft_size,
                hop_length: mf.hop,
            },
        );
        let frames = chroma.ncols();
        // [frames, 12], row-major
        let flat: Vec<f32> = chroma.t().iter().copied().collect();
        Ok((flat, frames))
    }
}

impl ChordModel for OnnxChordModel {
    fn predict(&self, audio: &AudioData) -> Result<Vec<ChordObservation>> {
        let (features, frames) = self.features(audio)?;
        if frames == 0 {
            return Ok(Vec::new());
        }
        let mf = &self.manifest;
        let input: Value = Tensor::from_array((vec![1, frames, PITCH_CLASSES], features))?.into_dyn();

        let mut session = self.session.lock();
        let outputs = session.run(vec![(mf.input.clone(), input)])?;

        let mut scores: Option<Value> = None;
        for (name, val) in outputs.into_iter() {
            if name == mf.output {
                scores = Some(val);
            }
        }
        let scores = scores.ok_or_else(|| anyhow!("model did not return '{}'", mf.output))?;
        let (shape, data) = scores.try_extract_tensor::<f32>()?;

        let n_labels = mf.labels.len();
        if shape.len() != 3
            || shape[0] != 1
            || shape[1] != frames as i64
            || shape[2] != n_labels as i64
        {
            return Err(anyhow!(
                "unexpected output shape {:?}, expected [1, {}, {}]",
                shape,
                frames,
                n_labels
            )
            .into());
        }

        let classes: Vec<usize> = data
            .chunks(n_labels)
            .map(|row| {
                row.iter()
                    .enumerate()
                    .max_by(|a, b| a.1.total_cmp(b.1))
                    .map(|(i, _)| i)
                    .unwrap_or(0)
            })
            .collect();

        Ok(frames_to_observations(&classes, &mf.labels, mf.seconds_per_frame()))
    }

    fn name(&self) -> &str {
        &self.manifest.name
    }
}

/// Collapses per-frame class indices into runs.
fn frames_to_observations(
    classes: &[usize],
    labels: &[String],
    seconds_per_frame: f64,
) -> Vec<ChordObservation> {
    let mut out = Vec::new();
    let mut run_start = 0;
    for t in 1..=classes.len() {
        if t == classes.len() || classes[t] != classes[run_start] {
            let label = labels
                .get(classes[run_start])
                .cloned()
                .unwrap_or_else(|| "X".into());
            out.push(ChordObservation {
                label,
                onset: run_start as f64 * seconds_per_frame,
                duration: (t - run_start) as f64 * seconds_per_frame,
            });
            run_start = t;
        }
    }
    out
}
