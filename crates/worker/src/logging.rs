use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use chrono::Utc;
use log::warn;
use serde::{Deserialize, Serialize};

/// A single indexed log line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogMessage {
    pub content: String,
    pub index: i64,
}

#[derive(Default)]
struct LogBuffer {
    messages: Vec<LogMessage>,
    next_index: i64,
    sink: Option<FileSink>,
}

struct FileSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

/// Append-only, indexed log shared by the router and the engine for the
/// lifetime of the worker.
///
/// Indices are assigned under the same lock that appends, so append order
/// and index order are the same for every writer.
#[derive(Default)]
pub struct LogHandler {
    inner: Mutex<LogBuffer>,
}

impl LogHandler {
    pub fn new() -> Self {
        Self::default()
    }

    fn buffer(&self) -> MutexGuard<'_, LogBuffer> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append `content` with the next index and return that index.
    pub fn log_message(&self, content: impl Into<String>) -> i64 {
        let content = content.into();
        let mut buffer = self.buffer();

        let index = buffer.next_index;
        buffer.next_index += 1;

        if let Some(sink) = buffer.sink.as_mut() {
            let written = writeln!(sink.writer, "{}", content).and_then(|_| sink.writer.flush());
            if let Err(e) = written {
                warn!("Failed to write log file {}: {}", sink.path.display(), e);
            }
        }

        buffer.messages.push(LogMessage { content, index });
        index
    }

    pub fn get_full_log(&self) -> String {
        let buffer = self.buffer();
        let mut full = String::new();
        for message in &buffer.messages {
            full.push_str(&message.content);
            full.push('\n');
        }
        full
    }

    pub fn get_log_messages(&self) -> Vec<LogMessage> {
        self.buffer().messages.clone()
    }

    /// All messages with `index >= from`. Out of range yields an empty list.
    pub fn get_log_messages_from_index(&self, from: i64) -> Vec<LogMessage> {
        let buffer = self.buffer();
        let start = buffer
            .messages
            .partition_point(|m| m.index < from.max(0));
        buffer.messages[start..].to_vec()
    }

    pub fn len(&self) -> usize {
        self.buffer().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clear every message and restart indexing at 0. The disk sink, if any, stays open.
    pub fn reset(&self) {
        let mut buffer = self.buffer();
        buffer.messages.clear();
        buffer.next_index = 0;
    }

    /// Start copying messages to `directory/file`, replacing any existing sink.
    /// A timestamped header is written, then the messages already in the buffer.
    pub fn enable_file_sink(&self, directory: &Path, file: &str) -> Result<PathBuf> {
        fs::create_dir_all(directory)
            .with_context(|| format!("Failed to create log directory: {}", directory.display()))?;

        let path = directory.join(file);
        let handle = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open log file: {}", path.display()))?;
        let mut writer = BufWriter::new(handle);
        writeln!(writer, "# Activity log opened {}", Utc::now().to_rfc3339())
            .with_context(|| format!("Failed to write log file: {}", path.display()))?;

        let mut buffer = self.buffer();
        for message in &buffer.messages {
            writeln!(writer, "{}", message.content)
                .with_context(|| format!("Failed to write log file: {}", path.display()))?;
        }
        writer
            .flush()
            .with_context(|| format!("Failed to flush log file: {}", path.display()))?;

        if let Some(mut previous) = buffer.sink.take() {
            let _ = previous.writer.flush();
        }
        buffer.sink = Some(FileSink {
            path: path.clone(),
            writer,
        });

        Ok(path)
    }

    pub fn has_file_sink(&self) -> bool {
        self.buffer().sink.is_some()
    }

    /// Flush and close the disk sink. Safe to call repeatedly.
    pub fn shutdown_file_writer(&self) {
        let sink = self.buffer().sink.take();
        if let Some(mut sink) = sink {
            if let Err(e) = sink.writer.flush() {
                warn!("Failed to flush log file {}: {}", sink.path.display(), e);
            }
        }
    }
}

/// Default log file name for a worker process
pub fn default_log_file_name(pid: u32) -> String {
    format!("activity_log.worker.{}.txt", pid)
}
