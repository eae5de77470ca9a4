//! Background separation jobs.
//!
//! A fixed pool of worker threads drains a bounded queue. Each worker runs one separation
//! process at a time, publishes progress into the job's record, and always leaves the record
//! in a terminal state when it is done with it, whatever happened in between.

use crate::{
    config::SeparationConfig,
    core::audio::probe_duration,
    error::{AnalyzerError, Result},
    io::progress::{
        failure_hint, map_external_percent, MonotonicProgress, EXTERNAL_BAND_START,
        FINALIZE_START,
    },
    jobs::{
        catalog,
        command::{sanitize_song_name, SeparationCommand},
        history::{AnalysisHistory, HistoryEntry},
        process::{run_monitored, ProcessEvent, StallPolicy},
        registry::{JobRecord, JobRegistry},
    },
    types::{JobId, JobSnapshot, JobState, QualityProfile, StemCount, StemDescriptor},
};

use chrono::Utc;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::{
    any::Any,
    fs,
    panic::{self, AssertUnwindSafe},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Instant,
};
use tracing::{debug, error, info, info_span, warn};

const STARTING: u8 = 5;

struct Task {
    id: JobId,
    record: JobRecord,
    source: PathBuf,
    stems: StemCount,
    profile: QualityProfile,
}

struct Shared {
    cfg: SeparationConfig,
    history: Arc<dyn AnalysisHistory>,
    stopping: AtomicBool,
}

pub struct JobSupervisor {
    registry: Arc<JobRegistry>,
    shared: Arc<Shared>,
    queue: Mutex<Option<Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    capacity: usize,
}

impl JobSupervisor {
    pub fn new(
        cfg: SeparationConfig,
        registry: Arc<JobRegistry>,
        history: Arc<dyn AnalysisHistory>,
    ) -> Result<Self> {
        let capacity = cfg.queue_capacity.max(1);
        let worker_count = cfg.workers.max(1);
        let (tx, rx) = bounded::<Task>(capacity);
        let shared = Arc::new(Shared {
            cfg,
            history,
            stopping: AtomicBool::new(false),
        });

        let mut workers = Vec::with_capacity(worker_count);
        for i in 0..worker_count {
            let rx = rx.clone();
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("separation-worker-{i}"))
                .spawn(move || worker_loop(&shared, rx))?;
            workers.push(handle);
        }
        info!(workers = worker_count, queue_capacity = capacity, "job supervisor started");

        Ok(Self {
            registry,
            shared,
            queue: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            capacity,
        })
    }

    /// Queues a separation of `source` and returns at once; progress is read with [`poll`].
    ///
    /// [`poll`]: JobSupervisor::poll
    pub fn start(
        &self,
        id: JobId,
        source: &Path,
        stems: StemCount,
        profile: QualityProfile,
    ) -> Result<()> {
        let queue = self.queue.lock();
        let Some(tx) = queue.as_ref() else {
            return Err(AnalyzerError::ShutDown);
        };

        let source_name = source
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("audio")
            .to_string();
        let record = self
            .registry
            .insert(JobSnapshot::pending(id.clone(), source_name, stems, profile));
        let task = Task {
            id: id.clone(),
            record,
            source: source.to_path_buf(),
            stems,
            profile,
        };

        match tx.try_send(task) {
            Ok(()) => {
                debug!(job_id = %id, stems = stems.count(), %profile, "job queued");
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.registry.remove(&id);
                warn!(job_id = %id, capacity = self.capacity, "job queue full, rejecting");
                Err(AnalyzerError::QueueFull {
                    capacity: self.capacity,
                })
            }
            Err(TrySendError::Disconnected(_)) => {
                self.registry.remove(&id);
                Err(AnalyzerError::ShutDown)
            }
        }
    }

    pub fn poll(&self, id: &JobId) -> Option<JobSnapshot> {
        self.registry.snapshot(id)
    }

    /// Stops accepting jobs, fails the ones still queued and waits for running ones.
    pub fn shutdown(&self) {
        self.shared.stopping.store(true, Ordering::SeqCst);
        self.queue.lock().take();

        let handles: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        if handles.is_empty() {
            return;
        }
        for handle in handles {
            if handle.join().is_err() {
                error!("separation worker exited with a panic");
            }
        }
        info!("job supervisor stopped");
    }
}

impl Drop for JobSupervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &Shared, rx: Receiver<Task>) {
    for task in rx.iter() {
        if shared.stopping.load(Ordering::SeqCst) {
            fail(&task.record, AnalyzerError::ShutDown.to_string(), None);
            continue;
        }
        run_job(shared, task);
    }
}

fn run_job(shared: &Shared, task: Task) {
    let span = info_span!("job", job_id = %task.id);
    let _enter = span.enter();
    let started = Instant::now();

    let result = panic::catch_unwind(AssertUnwindSafe(|| execute(shared, &task, started)));
    let reason = match result {
        Ok(Ok(())) => return,
        Ok(Err(e)) if e.is_job_failure() => {
            warn!(reason = %e, "job failed");
            e.to_string()
        }
        Ok(Err(e)) => {
            error!(reason = %e, "job aborted");
            e.to_string()
        }
        Err(payload) => {
            let reason = format!("internal error: {}", panic_message(payload.as_ref()));
            error!(%reason, "job worker panicked");
            reason
        }
    };
    fail(&task.record, reason, Some(started));
}

fn execute(shared: &Shared, task: &Task, started: Instant) -> Result<()> {
    let cfg = &shared.cfg;
    {
        let mut s = task.record.lock();
        s.state = JobState::Running;
        s.started_at = Some(Utc::now());
        s.percentage = s.percentage.max(STARTING);
        s.message = "starting".into();
    }

    let input = stage_input(cfg, &task.id, &task.source)?;
    let out_root = cfg.job_output_root(&task.id);
    if out_root.exists() {
        // a reused id must not inherit an earlier run's stems
        fs::remove_dir_all(&out_root)?;
    }
    let cmd = SeparationCommand::build(cfg, input.path(), &out_root, task.stems, task.profile);
    task.record.lock().model_used = Some(cmd.settings.model.to_string());

    let policy = StallPolicy {
        grace: cfg.stall_grace(),
        terminate_wait: cfg.terminate_wait(),
        poll_interval: cfg.poll_interval(),
    };
    let profile = task.profile;
    let mut progress = MonotonicProgress::starting_at(STARTING);

    let outcome = run_monitored(&cmd, &policy, |event| match event {
        ProcessEvent::Spawned { .. } => {
            if let Some(p) = progress.offer(EXTERNAL_BAND_START) {
                publish(&task.record, p, format!("processing ({profile})"));
            }
        }
        ProcessEvent::Progress(theirs) => {
            if let Some(p) = progress.offer(map_external_percent(theirs)) {
                publish(&task.record, p, format!("separating ({theirs}%)"));
            }
        }
    })?;

    if outcome.stalled {
        info!(
            elapsed_secs = outcome.elapsed.as_secs_f64(),
            "separation was stopped after finishing, collecting its output"
        );
    } else if !outcome.status.map_or(false, |s| s.success()) {
        warn!(
            exit_code = ?outcome.exit_code(),
            hint = failure_hint(&outcome.tail).unwrap_or("unknown"),
            "separation exited unsuccessfully, checking output anyway"
        );
        for line in outcome.tail.iter().rev().take(5).rev() {
            debug!("separation: {line}");
        }
    }

    publish(&task.record, FINALIZE_START, "collecting stems".into());
    let stems = collect_stems(&cmd.expected_output)?;

    let source_key = input.song().to_string();
    let duration_secs = match probe_duration(input.path()) {
        Ok(d) => Some(d),
        Err(e) => {
            debug!("could not probe source duration: {e}");
            None
        }
    };
    drop(input);

    let elapsed = started.elapsed().as_secs_f64();
    let count = stems.len();
    let snapshot = {
        let mut s = task.record.lock();
        s.state = JobState::Succeeded;
        s.percentage = 100;
        s.message = format!("separated into {count} stems");
        s.stems = Some(stems);
        s.finished_at = Some(Utc::now());
        s.elapsed_secs = Some(elapsed);
        s.clone()
    };
    info!(stems = count, elapsed_secs = elapsed, "job succeeded");

    record_history(shared, &snapshot, source_key, duration_secs);
    Ok(())
}

/// Moves progress forward (never back) and replaces the message.
fn publish(record: &JobRecord, pct: u8, message: String) {
    let mut s = record.lock();
    if s.is_terminal() {
        return;
    }
    s.percentage = s.percentage.max(pct.min(99));
    s.message = message;
}

/// Terminal failure. The percentage keeps its last published value.
fn fail(record: &JobRecord, reason: String, started: Option<Instant>) {
    let mut s = record.lock();
    if s.is_terminal() {
        return;
    }
    s.state = JobState::Failed;
    s.message = if reason.trim().is_empty() {
        "unknown error".into()
    } else {
        reason
    };
    s.stems = None;
    s.finished_at = Some(Utc::now());
    s.elapsed_secs = started.map(|t| t.elapsed().as_secs_f64());
}

/// Input handed to the separation tool. A renamed copy made for the run is removed
/// again when this is dropped.
struct StagedInput {
    path: PathBuf,
    song: String,
    temporary: bool,
}

impl StagedInput {
    fn path(&self) -> &Path {
        &self.path
    }

    fn song(&self) -> &str {
        &self.song
    }
}

impl Drop for StagedInput {
    fn drop(&mut self) {
        if !self.temporary {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "removed staged copy"),
            Err(e) => warn!(path = %self.path.display(), "could not remove staged copy: {e}"),
        }
        if let Some(dir) = self.path.parent() {
            // only succeeds once the job directory is empty
            let _ = fs::remove_dir(dir);
        }
    }
}

/// Makes the input available under a name the separation tool handles.
fn stage_input(cfg: &SeparationConfig, id: &JobId, source: &Path) -> Result<StagedInput> {
    if !source.is_file() {
        return Err(AnalyzerError::Validation(format!(
            "source audio not found: {}",
            source.display()
        )));
    }
    let stem = source
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("audio");
    let song = sanitize_song_name(stem);
    if song == stem {
        return Ok(StagedInput {
            path: source.to_path_buf(),
            song,
            temporary: false,
        });
    }

    let dir = cfg.job_upload_dir(id);
    fs::create_dir_all(&dir)?;
    let file_name = match source.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{song}.{ext}"),
        None => song.clone(),
    };
    let staged = dir.join(file_name);
    fs::copy(source, &staged)?;
    debug!(from = %source.display(), to = %staged.display(), "staged input");
    Ok(StagedInput {
        path: staged,
        song,
        temporary: true,
    })
}

/// Finalize step: the output directory decides the outcome, not the exit status.
fn collect_stems(dir: &Path) -> Result<Vec<StemDescriptor>> {
    if !dir.is_dir() {
        return Err(AnalyzerError::OutputMissing);
    }
    if fs::read_dir(dir)?.next().is_none() {
        return Err(AnalyzerError::OutputEmpty);
    }
    let stems = catalog::resolve(dir)?;
    if stems.is_empty() {
        return Err(AnalyzerError::NoRecognizedStems);
    }
    Ok(stems)
}

fn record_history(
    shared: &Shared,
    snap: &JobSnapshot,
    source_key: String,
    duration_secs: Option<f64>,
) {
    let entry = HistoryEntry {
        job_id: Some(snap.id.clone()),
        source_key,
        source_name: snap.source_name.clone(),
        stem_count: Some(snap.stem_count),
        quality: Some(snap.quality),
        model: snap.model_used.clone().unwrap_or_default(),
        stems: snap.stems.clone().unwrap_or_default(),
        chord_count: 0,
        chords: Vec::new(),
        duration_secs,
        elapsed_secs: snap.elapsed_secs.unwrap_or_default(),
        completed_at: snap.finished_at.unwrap_or_else(Utc::now),
    };
    if let Err(e) = shared.history.record_completed_job(entry) {
        warn!("could not record job history: {e}");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> JobRecord {
        Arc::new(Mutex::new(JobSnapshot::pending(
            JobId::from("t"),
            "song.mp3",
            StemCount::Four,
            QualityProfile::Basic,
        )))
    }

    #[test]
    fn finalize_distinguishes_missing_empty_and_unrecognized() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("htdemucs").join("song");
        assert!(matches!(collect_stems(&dir), Err(AnalyzerError::OutputMissing)));

        fs::create_dir_all(&dir).unwrap();
        assert!(matches!(collect_stems(&dir), Err(AnalyzerError::OutputEmpty)));

        fs::write(dir.join("log.txt"), b"x").unwrap();
        assert!(matches!(
            collect_stems(&dir),
            Err(AnalyzerError::NoRecognizedStems)
        ));

        fs::write(dir.join("vocals.wav"), b"x").unwrap();
        assert_eq!(collect_stems(&dir).unwrap().len(), 1);
    }

    #[test]
    fn publish_never_moves_backwards() {
        let rec = record();
        publish(&rec, 40, "a".into());
        publish(&rec, 30, "b".into());
        let s = rec.lock().clone();
        assert_eq!(s.percentage, 40);
        assert_eq!(s.message, "b");
    }

    #[test]
    fn failure_keeps_percentage_and_is_final() {
        let rec = record();
        publish(&rec, 44, "separating".into());
        fail(&rec, "boom".into(), Some(Instant::now()));
        fail(&rec, "second".into(), None);
        publish(&rec, 60, "late".into());

        let s = rec.lock().clone();
        assert_eq!(s.state, JobState::Failed);
        assert_eq!(s.percentage, 44);
        assert_eq!(s.message, "boom");
        assert!(s.elapsed_secs.is_some());
    }

    #[test]
    fn empty_failure_reason_gets_a_message() {
        let rec = record();
        fail(&rec, "  ".into(), None);
        assert!(!rec.lock().message.trim().is_empty());
    }

    #[test]
    fn staging_renames_inputs_with_spaces_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = SeparationConfig {
            upload_dir: dir.path().join("uploads"),
            ..SeparationConfig::default()
        };
        let id = JobId::from("job_1");
        let clean = dir.path().join("Clean_Name.wav");
        fs::write(&clean, b"x").unwrap();
        let staged = stage_input(&cfg, &id, &clean).unwrap();
        assert_eq!(staged.path(), clean);
        drop(staged);
        assert!(clean.is_file(), "caller's file is never removed");

        let spaced = dir.path().join("My  Song.wav");
        fs::write(&spaced, b"x").unwrap();
        let staged = stage_input(&cfg, &id, &spaced).unwrap();
        let copy = dir.path().join("uploads").join("job_1").join("My_Song.wav");
        assert_eq!(staged.path(), copy);
        assert_eq!(staged.song(), "My_Song");
        assert!(copy.is_file());
        drop(staged);
        assert!(!copy.exists());
        assert!(!dir.path().join("uploads").join("job_1").exists());
        assert!(spaced.is_file());

        assert!(matches!(
            stage_input(&cfg, &id, &dir.path().join("missing.wav")),
            Err(AnalyzerError::Validation(_))
        ));
    }

    #[test]
    fn panic_payloads_become_messages() {
        let r = panic::catch_unwind(|| panic!("bad {}", 1)).unwrap_err();
        assert_eq!(panic_message(r.as_ref()), "bad 1");
    }
}
