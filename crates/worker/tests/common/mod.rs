#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::value::RawValue;

use worker::engine::{event_channel, EngineEvents, ScanRequest};
use worker::watcher::ProcessProbe;
use worker::{
    ApiRouter, Engine, EngineError, EngineEvent, InitCommand, InstanceWatcher, JobState,
    LogHandler, RouterOptions, RouterParts, TokenService,
};

pub const TOKEN: &str = "c2VjcmV0LXBhaXJpbmctdG9rZW4=";
pub const ENGINE_VERSION: &str = "HandBrake 1.8.2 (scripted)";

/// Engine double whose progress is driven by the test
pub struct ScriptedEngine {
    events: EngineEvents,
    calls: Mutex<Vec<String>>,
    fail_next_start: AtomicBool,
    running: AtomicBool,
    scanned: AtomicBool,
}

impl ScriptedEngine {
    pub fn new(events: EngineEvents) -> Self {
        Self {
            events,
            calls: Mutex::new(Vec::new()),
            fail_next_start: AtomicBool::new(false),
            running: AtomicBool::new(false),
            scanned: AtomicBool::new(false),
        }
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn fail_next_start(&self) {
        self.fail_next_start.store(true, Ordering::SeqCst);
    }

    pub fn emit(&self, state: JobState) {
        if state.is_terminal() {
            self.running.store(false, Ordering::SeqCst);
        }
        self.events.send(EngineEvent::State(state)).unwrap();
    }

    pub fn emit_log(&self, line: &str) {
        self.events.send(EngineEvent::Log(line.to_string())).unwrap();
    }

    fn start(&self) -> Result<(), EngineError> {
        if self.fail_next_start.swap(false, Ordering::SeqCst) {
            return Err(EngineError::Rejected("scripted failure".to_string()));
        }
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Engine for ScriptedEngine {
    async fn initialize(&self, command: &InitCommand) -> Result<String, EngineError> {
        self.record(format!("initialize:{}", command.log_verbosity));
        Ok(ENGINE_VERSION.to_string())
    }

    async fn start_scan(&self, request: ScanRequest) -> Result<(), EngineError> {
        let paths: Vec<String> = request.paths.iter().map(|p| p.display().to_string()).collect();
        self.record(format!(
            "scan:{}:{}:{}:{}",
            paths.join(","),
            request.preview_count,
            request.min_duration,
            request.title_index
        ));
        self.start()?;
        self.scanned.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn start_encode(&self, job: &RawValue) -> Result<(), EngineError> {
        self.record(format!("encode:{}", job.get()));
        self.start()
    }

    async fn preview(&self, _job: &RawValue, index: i32) -> Result<Vec<u8>, EngineError> {
        self.record(format!("preview:{}", index));
        Ok(format!("BM-preview-{}", index).into_bytes())
    }

    async fn pause(&self) -> Result<(), EngineError> {
        self.record("pause");
        self.emit(JobState::Paused);
        Ok(())
    }

    async fn resume(&self) -> Result<(), EngineError> {
        self.record("resume");
        Ok(())
    }

    async fn stop(&self) -> Result<(), EngineError> {
        self.record("stop");
        if self.running.swap(false, Ordering::SeqCst) {
            self.events
                .send(EngineEvent::State(JobState::WorkDone { error: 1 }))
                .unwrap();
        }
        Ok(())
    }

    fn titles(&self) -> Option<Box<RawValue>> {
        if self.scanned.load(Ordering::SeqCst) {
            RawValue::from_string(r#"{"MainFeature":1,"TitleList":[{"Index":1}]}"#.to_string()).ok()
        } else {
            None
        }
    }

    fn feature_title(&self) -> Option<i32> {
        self.scanned.load(Ordering::SeqCst).then_some(1)
    }
}

/// Probe that always reports the UI as running
pub struct UiRunning;

impl ProcessProbe for UiRunning {
    fn count_by_name(&self, _name: &str) -> usize {
        1
    }

    fn is_alive(&self, _pid: u32) -> bool {
        true
    }
}

/// Probe that never finds the UI
pub struct NoUi;

impl ProcessProbe for NoUi {
    fn count_by_name(&self, _name: &str) -> usize {
        0
    }

    fn is_alive(&self, _pid: u32) -> bool {
        false
    }
}

pub struct Harness {
    pub api: Arc<ApiRouter>,
    pub engine: Arc<ScriptedEngine>,
    pub tokens: Arc<TokenService>,
    pub log: Arc<LogHandler>,
}

/// Build a router around a scripted engine. Must run inside a tokio runtime.
pub fn harness() -> Harness {
    harness_with(Arc::new(UiRunning), Duration::from_secs(3600))
}

/// Like `harness`, with a chosen process probe and watcher interval
pub fn harness_with(probe: Arc<dyn ProcessProbe>, watch_interval: Duration) -> Harness {
    let (events, stream) = event_channel();
    let engine = Arc::new(ScriptedEngine::new(events));
    let tokens = Arc::new(TokenService::new());
    let log = Arc::new(LogHandler::new());

    let api = ApiRouter::new(RouterParts {
        engine: engine.clone(),
        events: stream,
        tokens: tokens.clone(),
        log: log.clone(),
        watcher: InstanceWatcher::new(probe, "HandBrake", None),
        options: RouterOptions {
            watch_interval,
            preview_timeout: Duration::from_secs(5),
            process_id: 4242,
        },
    });

    Harness {
        api,
        engine,
        tokens,
        log,
    }
}

pub fn init_command() -> InitCommand {
    InitCommand {
        log_verbosity: 1,
        allow_disconnected_worker: true,
        ..Default::default()
    }
}

/// Poll the router until `predicate` holds or two seconds pass
pub async fn wait_for_state(api: &ApiRouter, predicate: impl Fn(&JobState) -> bool) -> JobState {
    for _ in 0..400 {
        let state = api.state();
        if predicate(&state) {
            return state;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("state never matched, last seen {:?}", api.state());
}

/// Wait until the engine event queue has drained up to a marker log line
pub async fn drain_events(harness: &Harness, marker: &str) {
    harness.engine.emit_log(marker);
    for _ in 0..400 {
        if harness.log.get_log_messages().iter().any(|m| m.content == marker) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("marker {} never reached the log", marker);
}
