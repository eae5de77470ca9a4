//! Runs the separation tool and watches its diagnostics.
//!
//! Both output pipes are drained on reader threads into one channel; the monitoring loop
//! waits on that channel with a short timeout, so it neither spins nor blocks on a silent
//! process. Once the tool reports 100% a grace timer starts; a process still alive when it
//! expires is terminated, then killed.

use crate::{
    error::{AnalyzerError, Result},
    io::progress::{parse_progress_marker, LineSplitter},
    jobs::command::SeparationCommand,
};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::{
    collections::VecDeque,
    io::Read,
    process::{Child, Command, ExitStatus, Stdio},
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, info, trace, warn};

const TAIL_LINES: usize = 40;

#[derive(Clone, Copy, Debug)]
pub struct StallPolicy {
    pub grace: Duration,
    pub terminate_wait: Duration,
    pub poll_interval: Duration,
}

/// What the monitor reports while the process runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessEvent {
    Spawned { pid: u32 },
    /// The tool's own 0..=100 percentage.
    Progress(u8),
}

#[derive(Debug)]
pub struct RunOutcome {
    /// `None` when the process had to be killed and reaping it failed.
    pub status: Option<ExitStatus>,
    /// The process reported 100% and then had to be stopped.
    pub stalled: bool,
    pub elapsed: Duration,
    pub tail: VecDeque<String>,
}

impl RunOutcome {
    pub fn exit_code(&self) -> Option<i32> {
        self.status.and_then(|s| s.code())
    }
}

/// Spawns `cmd` and blocks until it exits or is stopped by the stall guard.
pub fn run_monitored(
    cmd: &SeparationCommand,
    policy: &StallPolicy,
    mut on_event: impl FnMut(ProcessEvent),
) -> Result<RunOutcome> {
    let started = Instant::now();
    let mut child = spawn(cmd)?;
    let pid = child.id();
    info!(pid, command = %cmd.display(), "separation process started");
    on_event(ProcessEvent::Spawned { pid });

    let (tx, rx) = unbounded::<String>();
    if let Some(stderr) = child.stderr.take() {
        spawn_reader("separation-stderr", stderr, tx.clone());
    }
    if let Some(stdout) = child.stdout.take() {
        spawn_reader("separation-stdout", stdout, tx.clone());
    }
    drop(tx);

    let mut tail = VecDeque::with_capacity(TAIL_LINES);
    let mut reached_100: Option<Instant> = None;
    let mut readers_done = false;

    let mut handle_line =
        |line: String, tail: &mut VecDeque<String>, reached: &mut Option<Instant>| {
            trace!(pid, "{line}");
            if let Some(pct) = parse_progress_marker(&line) {
                on_event(ProcessEvent::Progress(pct));
                if pct >= 100 && reached.is_none() {
                    debug!(pid, "separation reported 100%, waiting for exit");
                    *reached = Some(Instant::now());
                }
            }
            if tail.len() == TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        };

    let (status, stalled) = loop {
        if readers_done {
            thread::sleep(policy.poll_interval);
        } else {
            match rx.recv_timeout(policy.poll_interval) {
                Ok(line) => {
                    handle_line(line, &mut tail, &mut reached_100);
                    for line in rx.try_iter() {
                        handle_line(line, &mut tail, &mut reached_100);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => readers_done = true,
            }
        }

        if let Some(status) = child.try_wait()? {
            if !readers_done {
                drain_remaining(&child, &rx, policy, |line| {
                    handle_line(line, &mut tail, &mut reached_100)
                });
            }
            break (Some(status), false);
        }

        if let Some(at) = reached_100 {
            if at.elapsed() >= policy.grace {
                warn!(
                    pid,
                    grace_secs = policy.grace.as_secs_f64(),
                    "separation stuck at 100%, stopping it"
                );
                break (stop(&mut child, policy.terminate_wait), true);
            }
        }
    };

    let elapsed = started.elapsed();
    debug!(
        pid,
        ?status,
        stalled,
        elapsed_secs = elapsed.as_secs_f64(),
        "separation process finished"
    );
    Ok(RunOutcome {
        status,
        stalled,
        elapsed,
        tail,
    })
}

fn spawn(cmd: &SeparationCommand) -> Result<Child> {
    let mut command = Command::new(&cmd.program);
    command
        .args(&cmd.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    // own process group, so the whole tree can be signalled
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    command.spawn().map_err(|e| AnalyzerError::ProcessSpawn {
        program: cmd.program.clone(),
        reason: e.to_string(),
    })
}

fn spawn_reader<R: Read + Send + 'static>(name: &str, mut pipe: R, tx: Sender<String>) {
    let spawned = thread::Builder::new().name(name.to_string()).spawn(move || {
        let mut splitter = LineSplitter::default();
        let mut buf = [0u8; 4096];
        loop {
            match pipe.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    for line in splitter.push(&buf[..n]) {
                        if tx.send(line).is_err() {
                            return;
                        }
                    }
                }
            }
        }
        if let Some(line) = splitter.finish() {
            let _ = tx.send(line);
        }
    });
    if let Err(e) = spawned {
        warn!("could not start {name} reader: {e}");
    }
}

/// Collects what the readers still hold after exit. Stops after one quiet interval, or
/// at `terminate_wait` if leftovers of the process group keep writing; those are killed.
fn drain_remaining(
    child: &Child,
    rx: &Receiver<String>,
    policy: &StallPolicy,
    mut f: impl FnMut(String),
) {
    let deadline = Instant::now() + policy.terminate_wait;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            warn!(
                pgid = child.id(),
                "process group still writing after exit, killing it"
            );
            signal_group(child, Signal::Kill);
            return;
        }
        match rx.recv_timeout(policy.poll_interval.min(remaining)) {
            Ok(line) => f(line),
            Err(RecvTimeoutError::Disconnected) => return,
            Err(RecvTimeoutError::Timeout) if Instant::now() < deadline => return,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }
}

/// Terminate signal, short wait, then kill. Returns the exit status if the child was reaped.
fn stop(child: &mut Child, terminate_wait: Duration) -> Option<ExitStatus> {
    signal_group(child, Signal::Terminate);

    let deadline = Instant::now() + terminate_wait;
    while Instant::now() < deadline {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) => thread::sleep(Duration::from_millis(20)),
            Err(e) => {
                warn!("try_wait failed: {e}");
                break;
            }
        }
    }

    warn!(pid = child.id(), "process ignored terminate signal, killing");
    signal_group(child, Signal::Kill);
    if let Err(e) = child.kill() {
        debug!("kill: {e}");
    }
    child.wait().ok()
}

#[derive(Clone, Copy, Debug)]
enum Signal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(child: &Child, signal: Signal) {
    let sig = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    let pgid = child.id() as libc::pid_t;
    // SAFETY: plain syscall; the group was created for this child at spawn
    let rc = unsafe { libc::kill(-pgid, sig) };
    if rc != 0 {
        debug!(pgid, ?signal, "kill(2) failed: {}", std::io::Error::last_os_error());
    }
}

#[cfg(not(unix))]
fn signal_group(_child: &Child, _signal: Signal) {
    // no graceful signal available; Child::kill follows
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sh(script: &str) -> SeparationCommand {
        SeparationCommand {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
            settings: crate::jobs::command::quality_settings(
                crate::types::QualityProfile::Basic,
                crate::types::StemCount::Four,
            ),
            expected_output: PathBuf::from("/nonexistent"),
        }
    }

    fn policy(grace_ms: u64) -> StallPolicy {
        StallPolicy {
            grace: Duration::from_millis(grace_ms),
            terminate_wait: Duration::from_millis(200),
            poll_interval: Duration::from_millis(20),
        }
    }

    #[test]
    fn reports_markers_and_exit_status() {
        let mut seen = Vec::new();
        let out = run_monitored(
            &sh("printf ' 10%%|#\\r 60%%|######\\r100%%|##########\\n' 1>&2; echo done; exit 3"),
            &policy(5_000),
            |e| {
                if let ProcessEvent::Progress(p) = e {
                    seen.push(p)
                }
            },
        )
        .unwrap();
        assert_eq!(seen, vec![10, 60, 100]);
        assert_eq!(out.exit_code(), Some(3));
        assert!(!out.stalled);
        assert!(out.tail.iter().any(|l| l == "done"));
    }

    #[test]
    fn stalled_process_is_stopped_after_grace() {
        let started = Instant::now();
        let out = run_monitored(
            &sh("printf '100%%|##########\\n' 1>&2; exec sleep 60"),
            &policy(500),
            |_| {},
        )
        .unwrap();
        assert!(out.stalled);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn process_ignoring_terminate_is_killed() {
        let started = Instant::now();
        let out = run_monitored(
            &sh("trap '' TERM; printf '100%%|##########\\n' 1>&2; while true; do sleep 1; done"),
            &policy(300),
            |_| {},
        )
        .unwrap();
        assert!(out.stalled);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn background_writer_does_not_outlive_the_deadline() {
        let started = Instant::now();
        let out = run_monitored(
            &sh("(while true; do echo tick >&2; sleep 0.01; done) & echo '42%|####' >&2; exit 0"),
            &policy(5_000),
            |_| {},
        )
        .unwrap();
        assert_eq!(out.exit_code(), Some(0));
        assert!(!out.stalled);
        assert!(started.elapsed() < Duration::from_secs(3), "{:?}", started.elapsed());
    }

    #[test]
    fn missing_program_is_spawn_error() {
        let mut cmd = sh("true");
        cmd.program = "/nonexistent/separator".into();
        let err = run_monitored(&cmd, &policy(100), |_| {}).unwrap_err();
        assert!(matches!(err, AnalyzerError::ProcessSpawn { .. }));
    }
}
