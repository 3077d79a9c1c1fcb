mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{
    drain_events, harness, harness_with, init_command, wait_for_state, NoUi, ENGINE_VERSION, TOKEN,
};
use worker::state::{ScanningProgress, WorkingProgress};
use worker::{EncodeCommand, InitCommand, JobState, PreviewCommand, ScanCommand, TaskState};

fn scan_command(path: &str) -> ScanCommand {
    serde_json::from_value(serde_json::json!({
        "path": [path],
        "previewCount": 10,
        "minDuration": 10,
        "titleIndex": 0,
        "initialiseCommand": { "logVerbosity": 1, "allowDisconnectedWorker": true }
    }))
    .unwrap()
}

fn encode_command() -> EncodeCommand {
    serde_json::from_str(
        r#"{"encodeJob": {"Source": {"Path": "/media/in.mkv", "Title": 1}, "Destination": {"File": "/media/out.mp4"}},
            "initialiseCommand": {"logVerbosity": 1, "allowDisconnectedWorker": true}}"#,
    )
    .unwrap()
}

fn working(pass: i32) -> JobState {
    JobState::Working(WorkingProgress {
        pass,
        pass_count: 1,
        progress: 0.25,
        ..Default::default()
    })
}

#[tokio::test]
async fn test_state_is_unknown_until_initialised() {
    let h = harness();
    assert_eq!(h.api.state(), JobState::Unknown);

    assert!(h.api.init(init_command()).await.was_successful);
    assert_eq!(h.api.state(), JobState::Idle);
    assert_eq!(h.engine.count("initialize"), 1);
}

#[tokio::test]
async fn test_second_init_keeps_first_configuration() {
    let h = harness();
    assert!(h.api.init(init_command()).await.was_successful);

    let mut other = init_command();
    other.log_verbosity = 3;
    assert!(h.api.init(other).await.was_successful);
    assert_eq!(h.engine.calls(), vec!["initialize:1".to_string()]);
}

#[tokio::test]
async fn test_init_during_active_job_is_rejected() {
    let h = harness();
    assert!(h.api.encode(encode_command()).await.was_successful);

    let result = h.api.init(init_command()).await;
    assert!(!result.was_successful);
    assert_eq!(result.error.as_deref(), Some("The current encode job is still in progress"));
}

#[tokio::test]
async fn test_pairing_has_a_single_winner() {
    let h = harness();
    let first = h.api.pair(TOKEN);
    assert!(first.is_successful_connection);
    assert_eq!(first.token.as_deref(), Some(TOKEN));

    let second = h.api.pair("someone-else");
    assert!(!second.is_successful_connection);
    assert_eq!(second.error.as_deref(), Some("Already Paired"));

    assert!(h.api.is_authenticated(Some(TOKEN)));
    assert!(!h.api.is_authenticated(Some("someone-else")));
    assert!(!h.api.is_authenticated(None));
}

#[tokio::test]
async fn test_blank_pairing_token_is_refused() {
    let h = harness();
    let result = h.api.pair("   ");
    assert!(!result.is_successful_connection);
    assert!(!h.tokens.is_token_set());
}

#[tokio::test]
async fn test_scan_then_encode_full_lifecycle() {
    let h = harness();
    assert!(h.api.init(init_command()).await.was_successful);

    assert!(h.api.scan(scan_command("/media/in.mkv")).await.was_successful);
    assert_eq!(h.api.state().task_state(), TaskState::Scanning);
    assert_eq!(h.engine.count("scan:/media/in.mkv:10:10:0"), 1);

    h.engine.emit(JobState::Scanning(ScanningProgress {
        title: 1,
        title_count: 1,
        progress: 0.5,
        ..Default::default()
    }));
    let scanning = wait_for_state(&h.api, |s| matches!(s, JobState::Scanning(p) if p.title == 1)).await;
    assert_eq!(scanning.task_state(), TaskState::Scanning);

    h.engine.emit(JobState::ScanDone);
    wait_for_state(&h.api, |s| *s == JobState::ScanDone).await;
    assert_eq!(h.api.main_title(), 1);
    assert!(h.api.titles().unwrap().get().contains("TitleList"));

    assert!(h.api.encode(encode_command()).await.was_successful);
    assert_eq!(h.api.state().task_state(), TaskState::Working);

    h.engine.emit(working(1));
    wait_for_state(&h.api, |s| matches!(s, JobState::Working(p) if p.pass == 1)).await;

    h.engine.emit(JobState::Muxing);
    wait_for_state(&h.api, |s| *s == JobState::Muxing).await;

    h.engine.emit(JobState::WorkDone { error: 0 });
    wait_for_state(&h.api, |s| *s == JobState::WorkDone { error: 0 }).await;

    let log = h.log.get_full_log();
    assert!(log.contains("scan completed"));
    assert!(log.contains("encode completed"));
}

#[tokio::test]
async fn test_encode_job_is_forwarded_unchanged() {
    let h = harness();
    assert!(h.api.encode(encode_command()).await.was_successful);

    let calls = h.engine.calls();
    let forwarded = calls.iter().find(|c| c.starts_with("encode:")).unwrap();
    assert_eq!(
        forwarded.as_str(),
        r#"encode:{"Source": {"Path": "/media/in.mkv", "Title": 1}, "Destination": {"File": "/media/out.mp4"}}"#
    );
}

#[tokio::test]
async fn test_only_one_job_at_a_time() {
    let h = harness();
    assert!(h.api.encode(encode_command()).await.was_successful);

    let second = h.api.encode(encode_command()).await;
    assert!(!second.was_successful);
    let scan = h.api.scan(scan_command("/media/other.mkv")).await;
    assert!(!scan.was_successful);
    assert_eq!(scan.error.as_deref(), Some("The current encode job is still in progress"));
    assert_eq!(h.engine.count("encode:"), 1);
    assert_eq!(h.engine.count("scan:"), 0);
}

#[tokio::test]
async fn test_concurrent_encodes_admit_exactly_one() {
    let h = harness();
    assert!(h.api.init(init_command()).await.was_successful);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let api = Arc::clone(&h.api);
        handles.push(tokio::spawn(async move { api.encode(encode_command()).await }));
    }

    let mut accepted = 0;
    for handle in handles {
        if handle.await.unwrap().was_successful {
            accepted += 1;
        }
    }
    assert_eq!(accepted, 1);
    assert_eq!(h.engine.count("encode:"), 1);
}

#[tokio::test]
async fn test_failed_engine_start_releases_the_slot() {
    let h = harness();
    assert!(h.api.init(init_command()).await.was_successful);

    h.engine.fail_next_start();
    let result = h.api.encode(encode_command()).await;
    assert!(!result.was_successful);
    assert!(result.error.unwrap().contains("scripted failure"));
    assert_eq!(h.api.state(), JobState::Idle);

    assert!(h.api.encode(encode_command()).await.was_successful);
}

#[tokio::test]
async fn test_empty_scan_path_is_rejected() {
    let h = harness();
    let mut command = scan_command("/media/in.mkv");
    command.path.clear();

    let result = h.api.scan(command).await;
    assert_eq!(result.error.as_deref(), Some("No source path provided"));
    assert_eq!(h.engine.count("scan:"), 0);
}

#[tokio::test]
async fn test_stop_reports_canceled_and_frees_the_slot() {
    let h = harness();
    assert!(h.api.encode(encode_command()).await.was_successful);

    h.api.stop_encode().await;
    wait_for_state(&h.api, |s| *s == JobState::WorkDone { error: 1 }).await;
    assert!(h.api.encode(encode_command()).await.was_successful);
}

#[tokio::test]
async fn test_stop_while_idle_is_a_no_op() {
    let h = harness();
    assert!(h.api.init(init_command()).await.was_successful);

    h.api.stop_encode().await;
    assert_eq!(h.engine.count("stop"), 0);
    assert_eq!(h.api.state(), JobState::Idle);
}

#[tokio::test]
async fn test_events_after_completion_are_ignored() {
    let h = harness();
    assert!(h.api.encode(encode_command()).await.was_successful);

    h.engine.emit(JobState::WorkDone { error: 0 });
    wait_for_state(&h.api, JobState::is_terminal).await;

    h.engine.emit(working(2));
    drain_events(&h, "marker: after late progress").await;
    assert_eq!(h.api.state(), JobState::WorkDone { error: 0 });
}

#[tokio::test]
async fn test_failed_encode_is_logged_with_its_code() {
    let h = harness();
    assert!(h.api.encode(encode_command()).await.was_successful);

    h.engine.emit(JobState::WorkDone { error: 4 });
    wait_for_state(&h.api, |s| *s == JobState::WorkDone { error: 4 }).await;
    assert!(h.log.get_full_log().contains("encode finished with error 4"));
}

#[tokio::test]
async fn test_engine_output_is_paged_by_index() {
    let h = harness();
    assert!(h.api.init(init_command()).await.was_successful);
    h.engine.emit_log("line one");
    h.engine.emit_log("line two");
    drain_events(&h, "line three").await;

    let all = h.api.log_messages(None);
    let last = all.last().unwrap().index;
    let tail = h.api.log_messages(Some(last - 1));
    assert_eq!(tail.len(), 2);
    assert_eq!(tail[0].content, "line two");
    assert_eq!(tail[1].content, "line three");
    assert!(h.api.log_messages(Some(last + 1)).is_empty());
}

#[tokio::test]
async fn test_log_reset_is_refused_while_a_job_runs() {
    let h = harness();
    assert!(h.api.encode(encode_command()).await.was_successful);
    assert!(!h.api.reset_log().was_successful);

    h.engine.emit(JobState::WorkDone { error: 0 });
    wait_for_state(&h.api, JobState::is_terminal).await;
    assert!(h.api.reset_log().was_successful);
    assert!(h.log.is_empty());
}

#[tokio::test]
async fn test_preview_blocked_while_encoding() {
    let h = harness();
    let command = || -> PreviewCommand {
        serde_json::from_str(r#"{"encodeSettings": {"Source": {"Title": 1}}, "previewNumber": 3}"#).unwrap()
    };

    assert!(h.api.preview(command()).await.is_err());

    assert!(h.api.init(init_command()).await.was_successful);
    assert_eq!(h.api.preview(command()).await.unwrap(), b"BM-preview-3".to_vec());

    assert!(h.api.encode(encode_command()).await.was_successful);
    let err = h.api.preview(command()).await.unwrap_err();
    assert!(matches!(err, worker::RouterError::EncodeActive));
    assert_eq!(h.engine.count("preview:"), 1);
}

#[tokio::test]
async fn test_pause_and_resume_only_apply_to_encodes() {
    let h = harness();
    assert!(h.api.scan(scan_command("/media/in.mkv")).await.was_successful);
    h.api.pause().await;
    assert_eq!(h.engine.count("pause"), 0);

    h.engine.emit(JobState::ScanDone);
    wait_for_state(&h.api, JobState::is_terminal).await;

    assert!(h.api.encode(encode_command()).await.was_successful);
    h.api.pause().await;
    wait_for_state(&h.api, |s| *s == JobState::Paused).await;
    h.api.resume().await;
    assert_eq!(h.engine.count("resume"), 1);
}

#[tokio::test]
async fn test_termination_stops_the_job_and_signals_shutdown() {
    let h = harness();
    assert!(h.api.encode(encode_command()).await.was_successful);
    let mut termination = h.api.subscribe_termination();
    assert!(!h.api.is_terminating());

    h.api.on_termination_event().await;

    assert!(h.api.is_terminating());
    assert_eq!(h.engine.count("stop"), 1);
    termination.wait_for(|t| *t).await.unwrap();
    assert!(h.log.get_full_log().contains("Worker: Terminating"));
}

#[tokio::test]
async fn test_disk_logging_writes_the_named_file() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness();
    let mut init = init_command();
    init.enable_disk_logging = true;
    init.log_directory = Some(dir.path().to_path_buf());

    assert!(h.api.init(init).await.was_successful);
    assert!(h.log.has_file_sink());
    h.log.shutdown_file_writer();

    let written = std::fs::read_to_string(dir.path().join("activity_log.worker.4242.txt")).unwrap();
    assert!(written.contains("Worker: Initialised"));
}

#[tokio::test]
async fn test_engine_version_is_logged_before_the_first_job() {
    let h = harness();
    assert!(h.api.encode(encode_command()).await.was_successful);

    let messages = h.log.get_log_messages();
    let position = |needle: &str| messages.iter().position(|m| m.content.contains(needle)).unwrap();
    let version = position(&format!("Worker: Engine {}", ENGINE_VERSION));
    assert!(version < position("Starting encode"));
}

#[tokio::test]
async fn test_engine_idle_while_running_is_ignored() {
    let h = harness();
    assert!(h.api.encode(encode_command()).await.was_successful);

    h.engine.emit(JobState::Idle);
    h.engine.emit(JobState::Unknown);
    drain_events(&h, "marker: after idle").await;
    assert_eq!(h.api.state().task_state(), TaskState::Working);

    h.engine.emit(JobState::Muxing);
    wait_for_state(&h.api, |s| *s == JobState::Muxing).await;
}

#[tokio::test]
async fn test_watcher_terminates_an_orphaned_worker() {
    let h = harness_with(Arc::new(NoUi), Duration::from_millis(10));
    let mut termination = h.api.subscribe_termination();

    let init = InitCommand {
        log_verbosity: 1,
        ..Default::default()
    };
    assert!(!init.allow_disconnected_worker);
    assert!(h.api.init(init).await.was_successful);
    assert!(h.api.is_watching());
    assert!(h.api.encode(encode_command()).await.was_successful);

    tokio::time::timeout(Duration::from_secs(2), termination.wait_for(|t| *t))
        .await
        .expect("watcher never fired")
        .unwrap();

    assert!(h.api.is_terminating());
    assert!(h.engine.count("stop") >= 1);
    wait_for_state(&h.api, |s| *s == JobState::WorkDone { error: 1 }).await;

    let log = h.log.get_full_log();
    assert!(log.contains("Worker: Disconnected worker monitoring enabled!"));
    assert!(log.contains("Worker: Terminating"));

    for _ in 0..200 {
        if !h.api.is_watching() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(!h.api.is_watching());
}

#[tokio::test]
async fn test_disconnected_worker_is_not_watched() {
    let h = harness_with(Arc::new(NoUi), Duration::from_millis(10));
    assert!(h.api.init(init_command()).await.was_successful);
    assert!(h.api.encode(encode_command()).await.was_successful);

    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(!h.api.is_watching());
    assert!(!h.api.is_terminating());
    assert_eq!(h.engine.count("stop"), 0);
    assert_eq!(h.api.state().task_state(), TaskState::Working);
}
