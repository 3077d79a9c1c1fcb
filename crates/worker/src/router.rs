use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use tokio::sync::watch;
use uuid::Uuid;

use crate::command::{
    CommandResult, ConnectionResult, EncodeCommand, InitCommand, PreviewCommand, ScanCommand,
};
use crate::engine::{Engine, EngineEvent, EngineEventStream, ScanRequest};
use crate::error::RouterError;
use crate::logging::{default_log_file_name, LogHandler, LogMessage};
use crate::state::{JobState, ScanningProgress, WorkingProgress};
use crate::token::TokenService;
use crate::watcher::{InstanceWatcher, OrphanHandler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Scan,
    Encode,
}

impl JobKind {
    fn label(&self) -> &'static str {
        match self {
            JobKind::Scan => "scan",
            JobKind::Encode => "encode",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ActiveJob {
    id: Uuid,
    kind: JobKind,
}

#[derive(Debug, Default)]
struct JobSlot {
    initialised: bool,
    active: Option<ActiveJob>,
}

/// Worker name and version reported by `/version`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub name: String,
    pub version: String,
}

/// Tunables for the router
#[derive(Debug, Clone)]
pub struct RouterOptions {
    pub watch_interval: Duration,
    pub preview_timeout: Duration,
    pub process_id: u32,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            watch_interval: Duration::from_millis(5000),
            preview_timeout: Duration::from_secs(30),
            process_id: std::process::id(),
        }
    }
}

/// Collaborators the router is assembled from
pub struct RouterParts {
    pub engine: Arc<dyn Engine>,
    pub events: EngineEventStream,
    pub tokens: Arc<TokenService>,
    pub log: Arc<LogHandler>,
    pub watcher: InstanceWatcher,
    pub options: RouterOptions,
}

/// Authenticates callers, enforces the one-job-at-a-time state machine and
/// dispatches to the engine.
///
/// The active-job slot and the published state snapshot each have their own
/// lock; neither is held across a call into the engine. Admission checks and
/// the transition to `Scanning`/`Working` happen in one critical section on
/// the job slot.
pub struct ApiRouter {
    engine: Arc<dyn Engine>,
    tokens: Arc<TokenService>,
    log: Arc<LogHandler>,
    watcher: InstanceWatcher,
    options: RouterOptions,
    jobs: Mutex<JobSlot>,
    snapshot: RwLock<Arc<JobState>>,
    init_gate: tokio::sync::Mutex<()>,
    termination: watch::Sender<bool>,
    me: Weak<ApiRouter>,
}

impl ApiRouter {
    /// Build the router and start pumping engine events into it.
    /// Must be called from within a tokio runtime.
    pub fn new(parts: RouterParts) -> Arc<Self> {
        let RouterParts {
            engine,
            events,
            tokens,
            log,
            watcher,
            options,
        } = parts;
        let (termination, _) = watch::channel(false);

        let router = Arc::new_cyclic(|me| ApiRouter {
            engine,
            tokens,
            log,
            watcher,
            options,
            jobs: Mutex::new(JobSlot::default()),
            snapshot: RwLock::new(Arc::new(JobState::Unknown)),
            init_gate: tokio::sync::Mutex::new(()),
            termination,
            me: me.clone(),
        });

        tokio::spawn(pump_events(Arc::downgrade(&router), events));
        router
    }

    fn jobs(&self) -> MutexGuard<'_, JobSlot> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, state: JobState) {
        let mut snapshot = self
            .snapshot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *snapshot = Arc::new(state);
    }

    /// Record a worker message in the served log and the process log
    fn service_log(&self, message: impl Into<String>) {
        let message = message.into();
        info!("{}", message);
        self.log.log_message(message);
    }

    pub fn log_handler(&self) -> &Arc<LogHandler> {
        &self.log
    }

    /* Pairing */

    pub fn pair(&self, candidate: &str) -> ConnectionResult {
        let candidate = candidate.trim();
        if candidate.is_empty() {
            return ConnectionResult {
                is_successful_connection: false,
                token: None,
                error: Some("No token provided".to_string()),
            };
        }

        if self.tokens.register_token(candidate) {
            self.service_log("Worker: Paired with UI");
            ConnectionResult {
                is_successful_connection: true,
                token: Some(candidate.to_string()),
                error: None,
            }
        } else {
            warn!("Worker: Rejected pairing attempt, worker is already paired");
            ConnectionResult {
                is_successful_connection: false,
                token: None,
                error: Some("Already Paired".to_string()),
            }
        }
    }

    pub fn is_authenticated(&self, presented: Option<&str>) -> bool {
        self.tokens.is_authenticated(presented)
    }

    pub fn version(&self) -> VersionInfo {
        crate::version_info()
    }

    /* Commands */

    pub async fn init(&self, command: InitCommand) -> CommandResult {
        let _gate = self.init_gate.lock().await;

        {
            let slot = self.jobs();
            if let Some(active) = slot.active {
                return RouterError::JobActive(active.kind.label()).into();
            }
            if slot.initialised {
                debug!("Worker: Init called again, keeping existing engine configuration");
                return CommandResult::success();
            }
        }

        match self.configure(&command).await {
            Ok(()) => CommandResult::success(),
            Err(e) => {
                warn!("Worker: Initialisation failed: {}", e);
                e.into()
            }
        }
    }

    /// Initialise from an embedded command unless already initialised.
    /// Checked again under the init gate so concurrent callers configure once.
    async fn ensure_initialised(&self, command: &InitCommand) -> Result<(), RouterError> {
        if self.jobs().initialised {
            return Ok(());
        }

        let _gate = self.init_gate.lock().await;
        if self.jobs().initialised {
            return Ok(());
        }
        self.configure(command).await
    }

    /// Open the disk sink if asked, initialise the engine, publish `Idle` and
    /// start the instance watcher unless disconnected workers are allowed.
    async fn configure(&self, command: &InitCommand) -> Result<(), RouterError> {
        if command.enable_disk_logging {
            if let Some(directory) = &command.log_directory {
                let file = command
                    .log_file
                    .clone()
                    .filter(|f| !f.is_empty())
                    .unwrap_or_else(|| default_log_file_name(self.options.process_id));
                let path = self
                    .log
                    .enable_file_sink(directory, &file)
                    .map_err(|e| RouterError::Logging(format!("{:#}", e)))?;
                info!("Worker: Writing activity log to {}", path.display());
            }
        }

        let version = self.engine.initialize(command).await?;
        self.service_log(format!("Worker: Engine {}", version));

        {
            let mut slot = self.jobs();
            slot.initialised = true;
            if slot.active.is_none() {
                self.publish(JobState::Idle);
            }
        }

        if !command.allow_disconnected_worker {
            self.service_log("Worker: Disconnected worker monitoring enabled!");
            let handler: Weak<dyn OrphanHandler> = self.me.clone();
            self.watcher.start(self.options.watch_interval, handler);
        }

        self.service_log(format!(
            "Worker: Initialised (verbosity {}, hardware acceleration {}, mode {})",
            command.log_verbosity,
            command.enable_hardware_acceleration,
            u8::from(command.mode)
        ));
        Ok(())
    }

    /// Claim the job slot and publish the job's first state in one step
    fn admit(&self, kind: JobKind, initial: JobState) -> Result<ActiveJob, RouterError> {
        let mut slot = self.jobs();
        if !slot.initialised {
            return Err(RouterError::NotInitialised);
        }
        if let Some(active) = slot.active {
            return Err(RouterError::JobActive(active.kind.label()));
        }

        let job = ActiveJob {
            id: Uuid::new_v4(),
            kind,
        };
        slot.active = Some(job);
        self.publish(initial);
        Ok(job)
    }

    /// Undo an admission whose engine start failed
    fn release(&self, job: &ActiveJob) {
        let mut slot = self.jobs();
        if slot.active.map(|a| a.id) == Some(job.id) {
            slot.active = None;
            self.publish(JobState::Idle);
        }
    }

    pub async fn scan(&self, command: ScanCommand) -> CommandResult {
        match self.try_scan(command).await {
            Ok(()) => CommandResult::success(),
            Err(e) => {
                warn!("Worker: Scan rejected: {}", e);
                e.into()
            }
        }
    }

    /// Validate, initialise if needed, claim the job slot as `Scanning`, then
    /// hand the scan to the engine. The slot is released if the engine refuses.
    async fn try_scan(&self, command: ScanCommand) -> Result<(), RouterError> {
        if command.path.is_empty() {
            return Err(RouterError::Payload("No source path provided".to_string()));
        }

        self.ensure_initialised(&command.initialise_command).await?;
        let job = self.admit(JobKind::Scan, JobState::Scanning(ScanningProgress::default()))?;

        let request = ScanRequest::from(&command);
        self.service_log(format!(
            "Job {}: Starting scan of {} source(s), title {}",
            job.id,
            request.paths.len(),
            request.title_index
        ));

        if let Err(e) = self.engine.start_scan(request).await {
            self.release(&job);
            return Err(e.into());
        }
        Ok(())
    }

    pub async fn encode(&self, command: EncodeCommand) -> CommandResult {
        match self.try_encode(command).await {
            Ok(()) => CommandResult::success(),
            Err(e) => {
                warn!("Worker: Encode rejected: {}", e);
                e.into()
            }
        }
    }

    /// Same admission path as `try_scan`, starting in `Working`.
    /// The job JSON reaches the engine exactly as the UI sent it.
    async fn try_encode(&self, command: EncodeCommand) -> Result<(), RouterError> {
        self.ensure_initialised(&command.initialise_command).await?;
        let job = self.admit(JobKind::Encode, JobState::Working(WorkingProgress::default()))?;

        self.service_log(format!("Job {}: Starting encode", job.id));

        if let Err(e) = self.engine.start_encode(&command.encode_job).await {
            self.release(&job);
            return Err(e.into());
        }
        Ok(())
    }

    /// Render one preview frame. Allowed while idle or scanning, never during
    /// an encode, and bounded by the configured preview timeout.
    pub async fn preview(&self, command: PreviewCommand) -> Result<Vec<u8>, RouterError> {
        {
            let slot = self.jobs();
            if !slot.initialised {
                return Err(RouterError::NotInitialised);
            }
            if matches!(slot.active, Some(ActiveJob { kind: JobKind::Encode, .. })) {
                return Err(RouterError::EncodeActive);
            }
        }

        let render = self
            .engine
            .preview(&command.encode_settings, command.preview_number);
        match tokio::time::timeout(self.options.preview_timeout, render).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(RouterError::PreviewTimeout(
                self.options.preview_timeout.as_secs(),
            )),
        }
    }

    /* Job control */

    pub async fn pause(&self) {
        if !self.encode_active() {
            return;
        }
        if let Err(e) = self.engine.pause().await {
            warn!("Worker: Pause failed: {}", e);
        }
    }

    pub async fn resume(&self) {
        if !self.encode_active() {
            return;
        }
        if let Err(e) = self.engine.resume().await {
            warn!("Worker: Resume failed: {}", e);
        }
    }

    fn encode_active(&self) -> bool {
        matches!(
            self.jobs().active,
            Some(ActiveJob {
                kind: JobKind::Encode,
                ..
            })
        )
    }

    /// Best-effort cancellation of the active job. A no-op when idle.
    pub async fn stop_encode(&self) {
        let active = self.jobs().active;
        let Some(job) = active else {
            return;
        };

        self.service_log(format!("Job {}: Stop requested", job.id));
        if let Err(e) = self.engine.stop().await {
            warn!("Job {}: Engine stop failed: {}", job.id, e);
        }
    }

    /// Stop any active job, flush logs and signal the server to shut down
    pub async fn on_termination_event(&self) {
        self.stop_encode().await;
        self.service_log("Worker: Terminating");
        self.log.shutdown_file_writer();
        self.termination.send_replace(true);
    }

    /// Resolves to `true` once a termination event has fired
    pub fn subscribe_termination(&self) -> watch::Receiver<bool> {
        self.termination.subscribe()
    }

    pub fn is_terminating(&self) -> bool {
        *self.termination.borrow()
    }

    /// True while the instance watcher task is running
    pub fn is_watching(&self) -> bool {
        self.watcher.is_running()
    }

    /* Queries */

    pub fn state(&self) -> JobState {
        let snapshot = self
            .snapshot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        JobState::clone(&snapshot)
    }

    pub fn log_messages(&self, from_index: Option<i64>) -> Vec<LogMessage> {
        match from_index {
            Some(index) => self.log.get_log_messages_from_index(index),
            None => self.log.get_log_messages(),
        }
    }

    pub fn reset_log(&self) -> CommandResult {
        if let Some(active) = self.jobs().active {
            return RouterError::JobActive(active.kind.label()).into();
        }
        self.log.reset();
        debug!("Worker: Log reset");
        CommandResult::success()
    }

    pub fn titles(&self) -> Option<Box<RawValue>> {
        self.engine.titles()
    }

    pub fn main_title(&self) -> i32 {
        self.engine.feature_title().unwrap_or(-1)
    }

    /* Engine events */

    fn apply_engine_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::Log(line) => {
                debug!("engine: {}", line);
                self.log.log_message(line);
            }
            EngineEvent::State(state) => self.apply_state(state),
        }
    }

    /// Fold one engine state into the published snapshot.
    ///
    /// Events with no active job are stale and dropped, so a finished job
    /// never flips back to `Working`. A terminal state frees the job slot in
    /// the same critical section that publishes it. `Idle` and `Unknown` from
    /// the engine are ignored while a job runs.
    fn apply_state(&self, state: JobState) {
        let mut slot = self.jobs();
        let Some(job) = slot.active else {
            debug!("Worker: Ignoring {:?} with no active job", state.task_state());
            return;
        };

        if state.is_terminal() {
            slot.active = None;
            let error = match &state {
                JobState::WorkDone { error } => *error,
                _ => 0,
            };
            self.publish(state);
            drop(slot);

            if error == 0 {
                self.service_log(format!("Job {}: {} completed", job.id, job.kind.label()));
            } else {
                self.service_log(format!(
                    "Job {}: {} finished with error {}",
                    job.id,
                    job.kind.label(),
                    error
                ));
            }
            if job.kind == JobKind::Encode {
                self.log.shutdown_file_writer();
            }
        } else if state.task_state().is_active() {
            self.publish(state);
        } else {
            debug!("Job {}: Ignoring {:?} while running", job.id, state.task_state());
        }
    }
}

async fn pump_events(router: Weak<ApiRouter>, mut events: EngineEventStream) {
    while let Some(event) = events.recv().await {
        let Some(router) = router.upgrade() else {
            break;
        };
        router.apply_engine_event(event);
    }
}

#[async_trait]
impl OrphanHandler for ApiRouter {
    async fn stop_encode(&self) {
        ApiRouter::stop_encode(self).await;
    }

    async fn on_termination_event(&self) {
        ApiRouter::on_termination_event(self).await;
    }
}
