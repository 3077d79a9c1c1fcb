pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod router;
pub mod server;
pub mod state;
pub mod token;
pub mod watcher;

pub use command::{CommandResult, ConnectionResult, EncodeCommand, InitCommand, PreviewCommand, ScanCommand};
pub use config::WorkerConfig;
pub use engine::{CliEngine, Engine, EngineEvent, EngineEvents};
pub use error::{EngineError, RouterError};
pub use logging::{LogHandler, LogMessage};
pub use router::{ApiRouter, RouterOptions, RouterParts, VersionInfo};
pub use state::{JobState, TaskState};
pub use token::TokenService;
pub use watcher::{InstanceWatcher, ProcessProbe, SysinfoProbe};

/// Name and version of this worker build
pub fn version_info() -> VersionInfo {
    VersionInfo {
        name: "HandBrake Worker".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    }
}
