use std::ffi::OsStr;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::task::JoinHandle;

/// Actions the watcher takes once the UI has gone away
#[async_trait]
pub trait OrphanHandler: Send + Sync {
    async fn stop_encode(&self);
    async fn on_termination_event(&self);
}

/// Process table lookups used to decide whether the UI is still running
pub trait ProcessProbe: Send + Sync {
    fn count_by_name(&self, name: &str) -> usize;
    fn is_alive(&self, pid: u32) -> bool;
}

/// `ProcessProbe` backed by the live process table
pub struct SysinfoProbe {
    system: Mutex<System>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    fn system(&self) -> MutexGuard<'_, System> {
        self.system.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessProbe for SysinfoProbe {
    fn count_by_name(&self, name: &str) -> usize {
        let mut system = self.system();
        system.refresh_processes(ProcessesToUpdate::All);
        system
            .processes()
            .values()
            .filter(|process| {
                let process_name: &OsStr = process.name().as_ref();
                process_name_matches(&process_name.to_string_lossy(), name)
            })
            .count()
    }

    fn is_alive(&self, pid: u32) -> bool {
        let pid = Pid::from_u32(pid);
        let mut system = self.system();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]));
        system.process(pid).is_some()
    }
}

/// Case-insensitive name match that ignores a trailing `.exe`
pub fn process_name_matches(candidate: &str, wanted: &str) -> bool {
    fn stem(name: &str) -> &str {
        let len = name.len();
        if len > 4 && name.is_char_boundary(len - 4) && name[len - 4..].eq_ignore_ascii_case(".exe") {
            &name[..len - 4]
        } else {
            name
        }
    }

    !wanted.is_empty() && stem(candidate).eq_ignore_ascii_case(stem(wanted))
}

#[derive(Clone)]
struct WatchTarget {
    probe: Arc<dyn ProcessProbe>,
    process_name: String,
    parent_pid: Option<u32>,
}

impl WatchTarget {
    fn ui_present(&self) -> bool {
        let by_name = self.probe.count_by_name(&self.process_name) > 0;
        let by_pid = self.parent_pid.map_or(true, |pid| self.probe.is_alive(pid));
        by_name && by_pid
    }

    async fn check(&self, handler: &dyn OrphanHandler) -> bool {
        if self.ui_present() {
            debug!("Instance watcher: {} is still running", self.process_name);
            return false;
        }

        warn!(
            "Instance watcher: no running {} process found, shutting down the worker",
            self.process_name
        );
        handler.stop_encode().await;
        handler.on_termination_event().await;
        true
    }
}

/// Periodically checks that the launching UI is alive and terminates the
/// worker when it is not. A liveness heuristic, not a security boundary.
pub struct InstanceWatcher {
    target: WatchTarget,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl InstanceWatcher {
    pub fn new(
        probe: Arc<dyn ProcessProbe>,
        process_name: impl Into<String>,
        parent_pid: Option<u32>,
    ) -> Self {
        Self {
            target: WatchTarget {
                probe,
                process_name: process_name.into(),
                parent_pid,
            },
            task: Mutex::new(None),
        }
    }

    fn task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start ticking every `interval`, replacing any timer already running.
    /// The first check happens one full interval after starting.
    pub fn start(&self, interval: Duration, handler: Weak<dyn OrphanHandler>) {
        let mut task = self.task();
        if let Some(previous) = task.take() {
            previous.abort();
        }

        let target = self.target.clone();
        let interval = interval.max(Duration::from_millis(1));
        info!(
            "Instance watcher started: checking for {} every {}ms",
            target.process_name,
            interval.as_millis()
        );

        *task = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(handler) = handler.upgrade() else {
                    debug!("Instance watcher: handler dropped, stopping");
                    break;
                };
                if target.check(handler.as_ref()).await {
                    break;
                }
            }
        }));
    }

    pub fn stop(&self) {
        if let Some(task) = self.task().take() {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task().as_ref().map_or(false, |t| !t.is_finished())
    }

    /// Run a single check. Returns true when the UI was missing and the
    /// handler has been told to stop and terminate.
    pub async fn check_once(&self, handler: &dyn OrphanHandler) -> bool {
        self.target.check(handler).await
    }
}

impl Drop for InstanceWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
