use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::path::PathBuf;

/// What the launching UI intends to use this worker for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum WorkerMode {
    #[default]
    Encode,
    Scan,
    Background,
}

impl From<WorkerMode> for u8 {
    fn from(mode: WorkerMode) -> u8 {
        match mode {
            WorkerMode::Encode => 1,
            WorkerMode::Scan => 2,
            WorkerMode::Background => 3,
        }
    }
}

impl TryFrom<u8> for WorkerMode {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(WorkerMode::Encode),
            2 => Ok(WorkerMode::Scan),
            3 => Ok(WorkerMode::Background),
            other => Err(format!("unknown worker mode {}", other)),
        }
    }
}

/// Engine and logging configuration, sent once per worker
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InitCommand {
    pub log_verbosity: i32,
    pub log_directory: Option<PathBuf>,
    pub log_file: Option<String>,
    pub enable_disk_logging: bool,
    pub enable_hardware_acceleration: bool,
    pub enable_lib_dvd_nav: bool,
    pub allow_disconnected_worker: bool,
    pub exclude_extension_list: Vec<String>,
    pub mode: WorkerMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanCommand {
    pub path: Vec<PathBuf>,
    #[serde(default)]
    pub preview_count: i32,
    /// Minimum title duration in seconds
    #[serde(default)]
    pub min_duration: u64,
    /// 0 scans every title
    #[serde(default)]
    pub title_index: i32,
    #[serde(default)]
    pub file_exclusion_list: Vec<String>,
    #[serde(default)]
    pub initialise_command: InitCommand,
}

/// An encode request. `encode_job` is forwarded to the engine byte for byte.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodeCommand {
    pub encode_job: Box<RawValue>,
    #[serde(default)]
    pub initialise_command: InitCommand,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewCommand {
    pub encode_settings: Box<RawValue>,
    pub preview_number: i32,
}

/// Synchronous outcome of a command submission. Says nothing about job completion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub was_successful: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandResult {
    pub fn success() -> Self {
        Self {
            was_successful: true,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            was_successful: false,
            error: Some(error.into()),
        }
    }
}

/// Outcome of the pairing handshake
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionResult {
    pub is_successful_connection: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Decode a command body, mapping an empty or malformed body to a failed `CommandResult`.
pub fn decode_command<T: serde::de::DeserializeOwned>(body: &str) -> Result<T, CommandResult> {
    if body.trim().is_empty() {
        return Err(CommandResult::failure("No POST data"));
    }

    serde_json::from_str(body)
        .map_err(|e| CommandResult::failure(format!("Invalid command payload: {}", e)))
}
