use serde::{Deserialize, Serialize};

/// Task state codes reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Idle,
    Scanning,
    ScanDone,
    Working,
    Paused,
    Searching,
    WorkDone,
    Muxing,
    Unknown,
}

impl TaskState {
    /// Wire code used by libhb progress JSON and by the `/state` endpoint
    pub fn code(&self) -> &'static str {
        match self {
            TaskState::Idle => "IDLE",
            TaskState::Scanning => "SCANNING",
            TaskState::ScanDone => "SCANDONE",
            TaskState::Working => "WORKING",
            TaskState::Paused => "PAUSED",
            TaskState::Searching => "SEARCHING",
            TaskState::WorkDone => "WORKDONE",
            TaskState::Muxing => "MUXING",
            TaskState::Unknown => "UNKNOWN",
        }
    }

    /// Look up a task state by its wire code. Unrecognised codes map to `Unknown`.
    pub fn from_code(code: &str) -> TaskState {
        match code {
            "IDLE" => TaskState::Idle,
            "SCANNING" => TaskState::Scanning,
            "SCANDONE" => TaskState::ScanDone,
            "WORKING" => TaskState::Working,
            "PAUSED" => TaskState::Paused,
            "SEARCHING" => TaskState::Searching,
            "WORKDONE" => TaskState::WorkDone,
            "MUXING" => TaskState::Muxing,
            _ => TaskState::Unknown,
        }
    }

    /// True for states that belong to a running scan or encode
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TaskState::Scanning
                | TaskState::Working
                | TaskState::Paused
                | TaskState::Searching
                | TaskState::Muxing
        )
    }
}

/// Scan progress payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanningProgress {
    pub preview: i32,
    pub preview_count: i32,
    pub progress: f64,
    pub title: i32,
    pub title_count: i32,
}

/// Encode progress payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkingProgress {
    pub hours: i32,
    pub minutes: i32,
    pub seconds: i32,
    pub eta_seconds: i64,
    pub pass_id: i32,
    pub pass: i32,
    pub pass_count: i32,
    pub paused: i64,
    pub progress: f64,
    pub rate: f64,
    pub rate_avg: f64,
    pub sequence_id: i32,
}

/// A single polled progress snapshot.
///
/// Exactly one variant is active; the `state` field on the wire carries the
/// task state code so consumers switch on it rather than on which payload
/// fields are present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Idle,
    Scanning(ScanningProgress),
    #[serde(rename = "SCANDONE")]
    ScanDone,
    Working(WorkingProgress),
    Paused,
    Searching(WorkingProgress),
    #[serde(rename = "WORKDONE")]
    WorkDone { error: i32 },
    Muxing,
    Unknown,
}

impl Default for JobState {
    fn default() -> Self {
        JobState::Unknown
    }
}

impl JobState {
    pub fn task_state(&self) -> TaskState {
        match self {
            JobState::Idle => TaskState::Idle,
            JobState::Scanning(_) => TaskState::Scanning,
            JobState::ScanDone => TaskState::ScanDone,
            JobState::Working(_) => TaskState::Working,
            JobState::Paused => TaskState::Paused,
            JobState::Searching(_) => TaskState::Searching,
            JobState::WorkDone { .. } => TaskState::WorkDone,
            JobState::Muxing => TaskState::Muxing,
            JobState::Unknown => TaskState::Unknown,
        }
    }

    /// True once a job has finished (successfully or not)
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::ScanDone | JobState::WorkDone { .. })
    }
}
