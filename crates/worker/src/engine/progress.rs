//! Parser for the JSON blocks HandBrakeCLI prints to stdout when run with `--json`.
//!
//! Blocks look like `Progress: {` followed by pretty-printed JSON spread over
//! several lines. A block ends when its braces balance.

use log::debug;
use serde::Deserialize;
use serde_json::value::RawValue;

use crate::state::{JobState, ScanningProgress, TaskState, WorkingProgress};

const PROGRESS_PREFIX: &str = "Progress:";
const TITLE_SET_PREFIX: &str = "JSON Title Set:";
const VERSION_PREFIX: &str = "Version:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Progress,
    TitleSet,
    Version,
}

/// A completed block
#[derive(Debug)]
pub enum ParsedBlock {
    Progress(JobState),
    TitleSet {
        titles: Box<RawValue>,
        main_feature: Option<i32>,
    },
    Version(String),
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct HbState {
    state: String,
    scanning: Option<HbScanning>,
    working: Option<HbWorking>,
    work_done: Option<HbWorkDone>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct HbScanning {
    preview: i32,
    preview_count: i32,
    progress: f64,
    title: i32,
    title_count: i32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct HbWorking {
    #[serde(rename = "ETASeconds")]
    eta_seconds: i64,
    hours: i32,
    minutes: i32,
    seconds: i32,
    pass: i32,
    pass_count: i32,
    #[serde(rename = "PassID")]
    pass_id: i32,
    paused: i64,
    progress: f64,
    rate: f64,
    rate_avg: f64,
    #[serde(rename = "SequenceID")]
    sequence_id: i32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct HbWorkDone {
    error: i32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct HbTitleSet {
    #[serde(rename = "MainFeature")]
    main_feature: Option<i32>,
}

impl From<HbScanning> for ScanningProgress {
    fn from(s: HbScanning) -> Self {
        Self {
            preview: s.preview,
            preview_count: s.preview_count,
            progress: s.progress.clamp(0.0, 1.0),
            title: s.title,
            title_count: s.title_count,
        }
    }
}

impl From<HbWorking> for WorkingProgress {
    fn from(w: HbWorking) -> Self {
        Self {
            hours: w.hours,
            minutes: w.minutes,
            seconds: w.seconds,
            eta_seconds: w.eta_seconds,
            pass_id: w.pass_id,
            pass: w.pass,
            pass_count: w.pass_count,
            paused: w.paused,
            progress: w.progress.clamp(0.0, 1.0),
            rate: w.rate,
            rate_avg: w.rate_avg,
            sequence_id: w.sequence_id,
        }
    }
}

impl HbState {
    fn into_job_state(self) -> JobState {
        match TaskState::from_code(&self.state) {
            TaskState::Idle => JobState::Idle,
            TaskState::Scanning => JobState::Scanning(self.scanning.unwrap_or_default().into()),
            TaskState::ScanDone => JobState::ScanDone,
            TaskState::Working => JobState::Working(self.working.unwrap_or_default().into()),
            TaskState::Paused => JobState::Paused,
            TaskState::Searching => JobState::Searching(self.working.unwrap_or_default().into()),
            TaskState::WorkDone => JobState::WorkDone {
                error: self.work_done.unwrap_or_default().error,
            },
            TaskState::Muxing => JobState::Muxing,
            TaskState::Unknown => JobState::Unknown,
        }
    }
}

/// Decode a libhb progress document into a job state snapshot
pub fn parse_state(json: &str) -> Result<JobState, serde_json::Error> {
    let state: HbState = serde_json::from_str(json)?;
    Ok(state.into_job_state())
}

/// Line-fed accumulator for multi-line JSON blocks
#[derive(Debug, Default)]
pub struct ProgressParser {
    current: Option<(BlockKind, String)>,
    depth: i32,
    in_string: bool,
    escaped: bool,
}

impl ProgressParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one stdout line. Returns a block when this line completes one.
    /// Lines outside any block are ignored.
    pub fn push_line(&mut self, line: &str) -> Option<ParsedBlock> {
        let fragment = match self.current {
            Some(_) => line,
            None => {
                let (kind, rest) = Self::block_start(line)?;
                self.current = Some((kind, String::new()));
                self.depth = 0;
                self.in_string = false;
                self.escaped = false;
                rest
            }
        };

        self.scan_braces(fragment);
        if let Some((_, buffer)) = self.current.as_mut() {
            buffer.push_str(fragment);
            buffer.push('\n');
        }

        if self.depth > 0 {
            return None;
        }

        let (kind, buffer) = self.current.take()?;
        Self::finish(kind, buffer)
    }

    fn block_start(line: &str) -> Option<(BlockKind, &str)> {
        let trimmed = line.trim_start();
        for (prefix, kind) in [
            (PROGRESS_PREFIX, BlockKind::Progress),
            (TITLE_SET_PREFIX, BlockKind::TitleSet),
            (VERSION_PREFIX, BlockKind::Version),
        ] {
            if let Some(rest) = trimmed.strip_prefix(prefix) {
                if rest.trim_start().starts_with('{') {
                    return Some((kind, rest));
                }
            }
        }
        None
    }

    fn scan_braces(&mut self, fragment: &str) {
        for c in fragment.chars() {
            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if c == '\\' {
                    self.escaped = true;
                } else if c == '"' {
                    self.in_string = false;
                }
                continue;
            }

            match c {
                '"' => self.in_string = true,
                '{' => self.depth += 1,
                '}' => self.depth -= 1,
                _ => {}
            }
        }
    }

    fn finish(kind: BlockKind, buffer: String) -> Option<ParsedBlock> {
        let json = buffer.trim();
        let parsed = match kind {
            BlockKind::Progress => parse_state(json).map(ParsedBlock::Progress),
            BlockKind::TitleSet => serde_json::from_str::<HbTitleSet>(json).and_then(|set| {
                let titles = RawValue::from_string(json.to_string())?;
                Ok(ParsedBlock::TitleSet {
                    titles,
                    main_feature: set.main_feature,
                })
            }),
            BlockKind::Version => Ok(ParsedBlock::Version(json.to_string())),
        };

        match parsed {
            Ok(block) => Some(block),
            Err(e) => {
                debug!("Discarding unparseable {:?} block: {}", kind, e);
                None
            }
        }
    }
}
