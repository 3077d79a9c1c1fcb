pub mod cli;
pub mod progress;

pub use cli::CliEngine;

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::value::RawValue;
use tokio::sync::mpsc;

use crate::command::{InitCommand, ScanCommand};
use crate::error::EngineError;
use crate::state::JobState;

/// Something the engine reports asynchronously while a job runs
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    State(JobState),
    Log(String),
}

/// Sending half handed to an engine at construction
pub type EngineEvents = mpsc::UnboundedSender<EngineEvent>;

/// Receiving half consumed by the router
pub type EngineEventStream = mpsc::UnboundedReceiver<EngineEvent>;

pub fn event_channel() -> (EngineEvents, EngineEventStream) {
    mpsc::unbounded_channel()
}

/// Parameters of a single scan
#[derive(Debug, Clone, PartialEq)]
pub struct ScanRequest {
    pub paths: Vec<PathBuf>,
    pub preview_count: i32,
    pub min_duration: u64,
    pub title_index: i32,
    pub exclude_extensions: Vec<String>,
}

impl From<&ScanCommand> for ScanRequest {
    fn from(command: &ScanCommand) -> Self {
        // Per-scan exclusions extend the worker-wide list from the init command
        let mut exclude_extensions = command.initialise_command.exclude_extension_list.clone();
        for ext in &command.file_exclusion_list {
            if !exclude_extensions.contains(ext) {
                exclude_extensions.push(ext.clone());
            }
        }

        Self {
            paths: command.path.clone(),
            preview_count: command.preview_count,
            min_duration: command.min_duration,
            title_index: command.title_index,
            exclude_extensions,
        }
    }
}

/// The native scan/encode engine hosted by the worker.
///
/// `start_scan` and `start_encode` return once the job has been accepted;
/// progress, log lines and the final `ScanDone`/`WorkDone` state arrive on
/// the engine's `EngineEvents` channel.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Apply the init settings. Returns a human readable engine version.
    async fn initialize(&self, command: &InitCommand) -> Result<String, EngineError>;

    async fn start_scan(&self, request: ScanRequest) -> Result<(), EngineError>;

    async fn start_encode(&self, job: &RawValue) -> Result<(), EngineError>;

    /// Render a single preview frame. May block for the duration of one decode.
    async fn preview(&self, job: &RawValue, index: i32) -> Result<Vec<u8>, EngineError>;

    async fn pause(&self) -> Result<(), EngineError>;

    async fn resume(&self) -> Result<(), EngineError>;

    /// Cancel whatever is running. A no-op when idle.
    async fn stop(&self) -> Result<(), EngineError>;

    /// Title set produced by the last completed scan
    fn titles(&self) -> Option<Box<RawValue>>;

    /// Main feature title reported by the last completed scan
    fn feature_title(&self) -> Option<i32>;
}
