use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use log::{debug, info, warn};
use serde_json::value::RawValue;
use sysinfo::{Pid, ProcessesToUpdate, Signal, System};
use tempfile::NamedTempFile;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;

use super::progress::{ParsedBlock, ProgressParser};
use super::{Engine, EngineEvent, EngineEvents, ScanRequest};
use crate::command::InitCommand;
use crate::error::EngineError;
use crate::state::JobState;

/// libhb error codes used in `WorkDone`
pub const HB_ERROR_NONE: i32 = 0;
pub const HB_ERROR_CANCELED: i32 = 1;
pub const HB_ERROR_UNKNOWN: i32 = 4;

/// Settings captured from the init command
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineSettings {
    pub verbosity: i32,
    pub hardware_decoding: bool,
    pub dvdnav: bool,
}

impl From<&InitCommand> for EngineSettings {
    fn from(command: &InitCommand) -> Self {
        Self {
            verbosity: command.log_verbosity,
            hardware_decoding: command.enable_hardware_acceleration,
            dvdnav: command.enable_lib_dvd_nav,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunKind {
    Scan,
    Encode,
}

struct RunningJob {
    pid: Option<u32>,
    kill: Option<oneshot::Sender<()>>,
    stop_requested: Arc<AtomicBool>,
}

#[derive(Default)]
struct Shared {
    settings: Mutex<Option<EngineSettings>>,
    running: Mutex<Option<RunningJob>>,
    titles: Mutex<Option<(Box<RawValue>, Option<i32>)>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Engine backed by an external `HandBrakeCLI` binary run in `--json` mode
pub struct CliEngine {
    bin: PathBuf,
    events: EngineEvents,
    shared: Arc<Shared>,
}

impl CliEngine {
    pub fn new(bin: impl Into<PathBuf>, events: EngineEvents) -> Self {
        Self {
            bin: bin.into(),
            events,
            shared: Arc::new(Shared::default()),
        }
    }

    fn settings(&self) -> Result<EngineSettings, EngineError> {
        lock(&self.shared.settings)
            .clone()
            .ok_or(EngineError::NotInitialised)
    }

    /// Run `HandBrakeCLI --version` and return the first `HandBrake ...` line.
    /// Also proves the binary can be spawned before any job is accepted.
    async fn detect_version(&self) -> Result<String, EngineError> {
        let output = Command::new(&self.bin)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| EngineError::Spawn {
                bin: self.bin.display().to_string(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let version = stdout
            .lines()
            .find(|l| l.starts_with("HandBrake"))
            .unwrap_or("HandBrake (unknown version)")
            .trim()
            .to_string();
        Ok(version)
    }

    /// Start the CLI with `args` and return once it is running.
    ///
    /// Three tasks follow the child:
    /// - stderr lines are forwarded as `EngineEvent::Log`
    /// - stdout is fed through the progress parser; progress becomes
    ///   `EngineEvent::State`, a title set is stored for `titles()`
    /// - a waiter reaps the child (or kills it on `stop`), drains both
    ///   readers, then reports `ScanDone` or `WorkDone` from the exit status
    ///
    /// `job_file` is held by the waiter so the queue file outlives the process.
    /// Fails with `Rejected` while another child is still running.
    fn spawn_job(
        &self,
        kind: RunKind,
        args: Vec<String>,
        job_file: Option<NamedTempFile>,
    ) -> Result<(), EngineError> {
        let mut running = lock(&self.shared.running);
        if running.is_some() {
            return Err(EngineError::Rejected("a job is already running".to_string()));
        }

        debug!("Executing {} {}", self.bin.display(), args.join(" "));
        let mut child = Command::new(&self.bin)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| EngineError::Spawn {
                bin: self.bin.display().to_string(),
                source,
            })?;

        let (kill_tx, kill_rx) = oneshot::channel();
        let stop_requested = Arc::new(AtomicBool::new(false));
        *running = Some(RunningJob {
            pid: child.id(),
            kill: Some(kill_tx),
            stop_requested: Arc::clone(&stop_requested),
        });
        drop(running);

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let stderr_task = stderr.map(|stderr| {
            let events = self.events.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let _ = events.send(EngineEvent::Log(line));
                }
            })
        });

        let stdout_task = stdout.map(|stdout| {
            let events = self.events.clone();
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                let mut parser = ProgressParser::new();
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    match parser.push_line(&line) {
                        // The final state is derived from the exit status instead
                        Some(ParsedBlock::Progress(state)) if state.is_terminal() => {}
                        Some(ParsedBlock::Progress(state)) => {
                            let _ = events.send(EngineEvent::State(state));
                        }
                        Some(ParsedBlock::TitleSet {
                            titles,
                            main_feature,
                        }) => {
                            *lock(&shared.titles) = Some((titles, main_feature));
                        }
                        Some(ParsedBlock::Version(version)) => {
                            debug!("Engine version block: {}", version.replace('\n', " "));
                        }
                        None => {}
                    }
                }
            })
        });

        let events = self.events.clone();
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let status = wait_or_kill(&mut child, kill_rx).await;
            // Every line the CLI printed is delivered before the final state
            for task in [stdout_task, stderr_task].into_iter().flatten() {
                let _ = task.await;
            }
            // Keeps the queue file alive until the CLI has exited
            drop(job_file);

            let stopped = stop_requested.load(Ordering::SeqCst);
            *lock(&shared.running) = None;

            let final_state = match kind {
                RunKind::Scan => {
                    if let Some(code) = status.as_ref().ok().and_then(|s| s.code()).filter(|c| *c != 0) {
                        let _ = events.send(EngineEvent::Log(format!(
                            "Scan finished with exit code {}",
                            code
                        )));
                    }
                    JobState::ScanDone
                }
                RunKind::Encode => JobState::WorkDone {
                    error: exit_error_code(status.as_ref().ok(), stopped),
                },
            };
            let _ = events.send(EngineEvent::State(final_state));
        });

        Ok(())
    }

    /// Deliver `signal` to the running CLI process.
    /// Returns false when nothing is running or the process is already gone.
    fn signal_running(&self, signal: Signal) -> Result<bool, EngineError> {
        let pid = lock(&self.shared.running).as_ref().and_then(|r| r.pid);
        let Some(pid) = pid else {
            return Ok(false);
        };

        let pid = Pid::from_u32(pid);
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]));
        let Some(process) = system.process(pid) else {
            debug!("Engine process {} exited before {:?} was sent", pid, signal);
            return Ok(false);
        };

        match process.kill_with(signal) {
            Some(true) => Ok(true),
            Some(false) => {
                warn!("Failed to send {:?} to engine process {}", signal, pid);
                Ok(false)
            }
            None => Err(EngineError::Unsupported("pause and resume on this platform")),
        }
    }
}

/// Wait for the child to exit. A message on `kill_rx` kills it first;
/// a dropped sender (engine gone) just keeps waiting.
async fn wait_or_kill(
    child: &mut Child,
    kill_rx: oneshot::Receiver<()>,
) -> std::io::Result<ExitStatus> {
    tokio::select! {
        status = child.wait() => status,
        signal = kill_rx => {
            if signal.is_ok() {
                if let Err(e) = child.start_kill() {
                    warn!("Failed to kill engine process: {}", e);
                }
            }
            child.wait().await
        }
    }
}

/// Map a CLI exit status onto a libhb error code.
///
/// A requested stop always reports `HB_ERROR_CANCELED`, whatever the exit
/// status. A process with no exit code (killed by a signal) reports
/// `HB_ERROR_UNKNOWN`.
pub fn exit_error_code(status: Option<&ExitStatus>, stop_requested: bool) -> i32 {
    if stop_requested {
        return HB_ERROR_CANCELED;
    }
    match status.map(|s| s.code()) {
        Some(Some(code)) => code,
        _ => HB_ERROR_UNKNOWN,
    }
}

/// Flags shared by scans and encodes
fn common_args(settings: &EngineSettings) -> Vec<String> {
    let mut args = vec!["--json".to_string()];
    if settings.verbosity > 0 {
        args.push(format!("--verbose={}", settings.verbosity));
    }
    if !settings.hardware_decoding {
        args.push("--disable-hw-decoding".to_string());
    }
    if !settings.dvdnav {
        args.push("--no-dvdnav".to_string());
    }
    args
}

/// Build the HandBrakeCLI argument list for a scan.
///
/// Every source path gets its own `-i`. At least one preview is always
/// requested. Title 0 scans all titles.
pub fn scan_args(settings: &EngineSettings, request: &ScanRequest) -> Vec<String> {
    let mut args = common_args(settings);
    args.push("--scan".to_string());
    for path in &request.paths {
        args.push("-i".to_string());
        args.push(path.display().to_string());
    }
    args.push("--previews".to_string());
    args.push(format!("{}:0", request.preview_count.max(1)));
    args.push("--min-duration".to_string());
    args.push(request.min_duration.to_string());
    args.push("-t".to_string());
    args.push(request.title_index.max(0).to_string());
    if !request.exclude_extensions.is_empty() {
        args.push("--exclude-extensions".to_string());
        args.push(request.exclude_extensions.join(","));
    }
    args
}

/// Build the HandBrakeCLI argument list for an encode read from a queue file
pub fn encode_args(settings: &EngineSettings, queue_file: &Path) -> Vec<String> {
    let mut args = common_args(settings);
    args.push("--queue-import-file".to_string());
    args.push(queue_file.display().to_string());
    args
}

/// Wrap a job description in the single-entry queue document the CLI imports.
/// The job text itself is copied without re-serialisation.
pub fn queue_document(job: &RawValue) -> String {
    format!("[{{\"Job\":{}}}]", job.get())
}

#[async_trait]
impl Engine for CliEngine {
    async fn initialize(&self, command: &InitCommand) -> Result<String, EngineError> {
        let version = self.detect_version().await?;
        let settings = EngineSettings::from(command);
        info!(
            "Engine initialised: {} (verbosity {}, hardware decoding {})",
            version, settings.verbosity, settings.hardware_decoding
        );
        *lock(&self.shared.settings) = Some(settings);
        Ok(version)
    }

    async fn start_scan(&self, request: ScanRequest) -> Result<(), EngineError> {
        let settings = self.settings()?;
        *lock(&self.shared.titles) = None;
        self.spawn_job(RunKind::Scan, scan_args(&settings, &request), None)
    }

    async fn start_encode(&self, job: &RawValue) -> Result<(), EngineError> {
        let settings = self.settings()?;

        // The CLI only reads jobs from a queue file
        let mut queue_file = tempfile::Builder::new()
            .prefix("hbworker-job-")
            .suffix(".json")
            .tempfile()?;
        queue_file.write_all(queue_document(job).as_bytes())?;
        queue_file.flush()?;

        let args = encode_args(&settings, queue_file.path());
        self.spawn_job(RunKind::Encode, args, Some(queue_file))
    }

    async fn preview(&self, _job: &RawValue, _index: i32) -> Result<Vec<u8>, EngineError> {
        Err(EngineError::Unsupported("previews"))
    }

    async fn pause(&self) -> Result<(), EngineError> {
        if self.signal_running(Signal::Stop)? {
            let _ = self.events.send(EngineEvent::State(JobState::Paused));
        }
        Ok(())
    }

    async fn resume(&self) -> Result<(), EngineError> {
        self.signal_running(Signal::Continue).map(|_| ())
    }

    /// Flag the stop and wake the waiter, which kills the child and reports
    /// `WorkDone { error: HB_ERROR_CANCELED }` once it has been reaped.
    async fn stop(&self) -> Result<(), EngineError> {
        let mut running = lock(&self.shared.running);
        if let Some(job) = running.as_mut() {
            job.stop_requested.store(true, Ordering::SeqCst);
            if let Some(kill) = job.kill.take() {
                let _ = kill.send(());
            }
        }
        Ok(())
    }

    fn titles(&self) -> Option<Box<RawValue>> {
        lock(&self.shared.titles).as_ref().map(|(titles, _)| titles.clone())
    }

    fn feature_title(&self) -> Option<i32> {
        lock(&self.shared.titles).as_ref().and_then(|(_, main)| *main)
    }
}
