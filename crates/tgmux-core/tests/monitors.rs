//! Monitor tests over real temp directories and filesystem notifications.

mod support;

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use support::{wait_until, MockMux};
use tgmux_core::backend::BackendKind;
use tgmux_core::monitor::json_diff::JsonDiffMonitor;
use tgmux_core::monitor::jsonl::JsonlMonitor;
use tgmux_core::monitor::pane::PaneMonitor;
use tgmux_core::monitor::{ContentKind, Monitor, OutputHandler, ParsedContent};
use tgmux_core::state::{Offset, StateStore};
use tgmux_core::topic::{ChatKind, TopicKey};

fn key() -> TopicKey {
    TopicKey::new(1, ChatKind::Private, None)
}

type Collected = Arc<Mutex<Vec<ParsedContent>>>;

fn collector() -> (Collected, OutputHandler) {
    let outputs: Collected = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&outputs);
    let handler: OutputHandler = Arc::new(move |_key: &TopicKey, content: ParsedContent| {
        sink.lock().unwrap().push(content);
    });
    (outputs, handler)
}

fn append(path: &Path, line: &str) {
    use std::io::Write;
    let mut f = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    writeln!(f, "{line}").unwrap();
}

#[tokio::test]
async fn claude_log_replay_emits_blocks_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let state_dir = tempfile::tempdir().unwrap();
    let store = StateStore::open(state_dir.path().join("state.json"), 10);
    let (outputs, handler) = collector();

    let mut monitor = JsonlMonitor::new(
        key(),
        BackendKind::Claude,
        dir.path().to_path_buf(),
        None,
        handler,
        store.clone(),
    );
    monitor.start().unwrap();

    let log = dir.path().join("f47ac10b-58cc-4372-a567-0e02b2c3d479.jsonl");
    append(
        &log,
        r#"{"type":"assistant","message":{"content":[{"type":"thinking","thinking":"plan"}]}}"#,
    );
    append(
        &log,
        r#"{"type":"assistant","message":{"content":[{"type":"text","text":"ok"}]}}"#,
    );
    append(
        &log,
        r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"u1","name":"Bash","input":{"command":"ls"}}]}}"#,
    );
    append(
        &log,
        r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"u1","content":"a\nb\nc"}]}}"#,
    );

    assert!(
        wait_until(|| outputs.lock().unwrap().len() >= 4, 3_000).await,
        "expected 4 blocks, got {:?}",
        outputs.lock().unwrap()
    );

    let blocks = outputs.lock().unwrap().clone();
    assert_eq!(blocks[0], ParsedContent::thinking("plan"));
    assert_eq!(blocks[1], ParsedContent::text("ok"));
    assert_eq!(blocks[2].kind, ContentKind::ToolUse);
    assert_eq!(blocks[2].text, "Bash(ls)");
    assert_eq!(blocks[2].tool_use_id.as_deref(), Some("u1"));
    assert_eq!(blocks[2].tool_name.as_deref(), Some("Bash"));
    assert_eq!(blocks[3].kind, ContentKind::ToolResult);
    assert_eq!(blocks[3].text, "  ⎿  Output 3 lines");
    assert_eq!(blocks[3].tool_use_id.as_deref(), Some("u1"));

    // The principal offset was persisted at the file's end.
    let offset = store.get_offset(&key()).unwrap();
    assert_eq!(offset.file, log.to_string_lossy());
    assert_eq!(offset.byte_offset, std::fs::metadata(&log).unwrap().len());

    monitor.stop();
}

#[tokio::test]
async fn persisted_offset_resumes_reading_where_it_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let state_dir = tempfile::tempdir().unwrap();
    let store = StateStore::open(state_dir.path().join("state.json"), 10);

    let log = dir.path().join("abc.jsonl");
    append(
        &log,
        r#"{"type":"assistant","message":{"content":[{"type":"text","text":"old"}]}}"#,
    );
    let resume_at = std::fs::metadata(&log).unwrap().len();

    let (outputs, handler) = collector();
    let mut monitor = JsonlMonitor::new(
        key(),
        BackendKind::Claude,
        dir.path().to_path_buf(),
        Some(Offset {
            file: log.to_string_lossy().into_owned(),
            byte_offset: resume_at,
            message_count: 0,
        }),
        handler,
        store,
    );
    monitor.start().unwrap();

    append(
        &log,
        r#"{"type":"assistant","message":{"content":[{"type":"text","text":"new"}]}}"#,
    );

    assert!(
        wait_until(|| !outputs.lock().unwrap().is_empty(), 3_000).await,
        "resumed monitor should emit the appended line"
    );
    let blocks = outputs.lock().unwrap().clone();
    assert_eq!(blocks, vec![ParsedContent::text("new")]);

    monitor.stop();
}

#[tokio::test]
async fn session_uuid_locks_out_other_files() {
    let dir = tempfile::tempdir().unwrap();
    let state_dir = tempfile::tempdir().unwrap();
    let store = StateStore::open(state_dir.path().join("state.json"), 10);
    let (outputs, handler) = collector();

    let mut monitor = JsonlMonitor::new(
        key(),
        BackendKind::Claude,
        dir.path().to_path_buf(),
        None,
        handler,
        store,
    );
    monitor.start().unwrap();

    let mine = dir.path().join("session-a.jsonl");
    append(
        &mine,
        r#"{"type":"assistant","message":{"content":[{"type":"text","text":"mine"}]}}"#,
    );
    assert!(wait_until(|| !outputs.lock().unwrap().is_empty(), 3_000).await);

    // A different session starts writing in the same project dir.
    let other = dir.path().join("session-b.jsonl");
    append(
        &other,
        r#"{"type":"assistant","message":{"content":[{"type":"text","text":"theirs"}]}}"#,
    );
    tokio::time::sleep(Duration::from_millis(500)).await;

    let blocks = outputs.lock().unwrap().clone();
    assert!(blocks.iter().all(|b| b.text != "theirs"), "locked session must not read other files");

    monitor.stop();
}

#[tokio::test]
async fn baseline_files_are_never_adopted() {
    let dir = tempfile::tempdir().unwrap();
    let state_dir = tempfile::tempdir().unwrap();
    let store = StateStore::open(state_dir.path().join("state.json"), 10);

    // This log predates the monitor; it belongs to someone else.
    let old = dir.path().join("preexisting.jsonl");
    append(
        &old,
        r#"{"type":"assistant","message":{"content":[{"type":"text","text":"stale"}]}}"#,
    );

    let (outputs, handler) = collector();
    let mut monitor = JsonlMonitor::new(
        key(),
        BackendKind::Claude,
        dir.path().to_path_buf(),
        None,
        handler,
        store,
    );
    monitor.start().unwrap();

    append(
        &old,
        r#"{"type":"assistant","message":{"content":[{"type":"text","text":"stale2"}]}}"#,
    );
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(outputs.lock().unwrap().is_empty());

    // A genuinely new session file is adopted.
    let fresh = dir.path().join("fresh.jsonl");
    append(
        &fresh,
        r#"{"type":"assistant","message":{"content":[{"type":"text","text":"live"}]}}"#,
    );
    assert!(
        wait_until(
            || outputs.lock().unwrap().iter().any(|b| b.text == "live"),
            3_000
        )
        .await
    );

    monitor.stop();
}

#[tokio::test]
async fn missing_log_dir_fails_startup() {
    let state_dir = tempfile::tempdir().unwrap();
    let store = StateStore::open(state_dir.path().join("state.json"), 10);
    let (_outputs, handler) = collector();

    let mut monitor = JsonlMonitor::new(
        key(),
        BackendKind::Claude,
        "/definitely/not/a/real/dir".into(),
        None,
        handler,
        store,
    );
    assert!(monitor.start().is_err());
}

#[tokio::test]
async fn gemini_monitor_emits_new_model_messages() {
    let tmp = tempfile::tempdir().unwrap();
    let state_dir = tempfile::tempdir().unwrap();
    let store = StateStore::open(state_dir.path().join("state.json"), 10);

    let hash_dir = tmp.path().join("0a1b2c");
    std::fs::create_dir(&hash_dir).unwrap();

    let (outputs, handler) = collector();
    let mut monitor = JsonDiffMonitor::new(
        key(),
        tmp.path().to_path_buf(),
        1, // message id 1 was already surfaced
        SystemTime::now(),
        handler,
        store.clone(),
    );
    monitor.start().unwrap();

    std::fs::write(
        hash_dir.join("logs.json"),
        r#"[
            {"sessionId":"s","messageId":1,"type":"model","message":"already seen"},
            {"sessionId":"s","messageId":2,"type":"user","message":"question"},
            {"sessionId":"s","messageId":3,"type":"model","message":"fresh answer"}
        ]"#,
    )
    .unwrap();

    assert!(
        wait_until(|| !outputs.lock().unwrap().is_empty(), 3_000).await,
        "expected the new model message"
    );
    let blocks = outputs.lock().unwrap().clone();
    assert_eq!(blocks, vec![ParsedContent::text("fresh answer")]);

    let offset = store.get_offset(&key()).unwrap();
    assert_eq!(offset.message_count, 3);

    monitor.stop();
}

#[tokio::test]
async fn pane_monitor_reports_screen_changes() {
    let mux = MockMux::new();
    mux.add_window("@1", "bash-x", "bash");
    mux.set_pane_content("@1", "$ \n");

    let (outputs, handler) = collector();
    let mut monitor = PaneMonitor::new(
        key(),
        "@1".into(),
        mux.clone(),
        Duration::from_millis(50),
        handler,
    );
    monitor.start().unwrap();

    // Let the initial snapshot land before changing the screen.
    tokio::time::sleep(Duration::from_millis(120)).await;
    mux.set_pane_content("@1", "$ ls\nsrc tests\n");

    assert!(
        wait_until(|| !outputs.lock().unwrap().is_empty(), 2_000).await,
        "pane change should be reported"
    );
    let blocks = outputs.lock().unwrap().clone();
    assert_eq!(blocks[0].kind, ContentKind::Text);
    assert!(blocks[0].text.contains("src tests"));

    monitor.stop();
}
