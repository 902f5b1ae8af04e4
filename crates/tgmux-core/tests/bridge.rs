//! Controller tests: recovery, inbound routing, liveness-triggered unbind.

mod support;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use support::{wait_until, MockMux, MockTelegram};
use tgmux_core::backend::BackendKind;
use tgmux_core::bot::Bridge;
use tgmux_core::config::Config;
use tgmux_core::state::{Binding, BindingStatus, Offset, StateStore};
use tgmux_core::topic::{ChatKind, TopicKey};
use tokio::sync::watch;

const USER: i64 = 42;

fn test_config() -> Config {
    let mut cfg = Config::default();
    cfg.telegram.allowed_users = vec![USER];
    cfg
}

fn binding(window: &str, backend: BackendKind) -> Binding {
    Binding {
        window_id: window.to_string(),
        backend,
        project_path: "/tmp/proj".into(),
        display_name: format!("{backend} @ proj"),
        created_at: Utc::now(),
        status: BindingStatus::Running,
    }
}

fn dm(chat: i64) -> TopicKey {
    TopicKey::new(chat, ChatKind::Private, None)
}

#[tokio::test]
async fn recovery_handles_alive_dead_and_exited_windows() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::open(dir.path().join("state.json"), 10);

    // T1: window alive, backend alive. T2: window alive, shell back at the
    // prompt. T3: window gone.
    store.set_binding(&dm(1), binding("@1", BackendKind::Claude));
    store.set_binding(&dm(2), binding("@2", BackendKind::Claude));
    store.set_binding(&dm(3), binding("@3", BackendKind::Claude));
    store.set_offset(
        &dm(2),
        Offset {
            file: "/nope.jsonl".into(),
            byte_offset: 10,
            message_count: 0,
        },
    );

    let mux = MockMux::new();
    mux.add_window("@1", "claude-proj", "node");
    mux.add_window("@2", "claude-proj2", "zsh");

    let tg = MockTelegram::new();
    let bridge = Bridge::new(test_config(), store.clone(), mux, tg);

    bridge.recover_bindings().await;

    // T1 keeps its binding and gets a monitor (the claude log dir does not
    // exist here, so it runs on the screen-diff fallback).
    let b1 = store.get_binding(&dm(1)).unwrap();
    assert_eq!(b1.status, BindingStatus::Running);
    assert!(bridge.dispatcher().is_monitoring(&dm(1)));

    // T2's backend exited: binding and offset removed, no monitor.
    assert!(store.get_binding(&dm(2)).is_none());
    assert!(store.get_offset(&dm(2)).is_none());
    assert!(!bridge.dispatcher().is_monitoring(&dm(2)));

    // T3's window is dead: binding kept but disconnected, no monitor.
    let b3 = store.get_binding(&dm(3)).unwrap();
    assert_eq!(b3.status, BindingStatus::Disconnected);
    assert!(!bridge.dispatcher().is_monitoring(&dm(3)));

    bridge.shutdown().await;
}

#[tokio::test]
async fn bound_topic_text_goes_through_the_serializer() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::open(dir.path().join("state.json"), 10);
    store.set_binding(&dm(7), binding("@1", BackendKind::Bash));

    let mux = MockMux::new();
    mux.add_window("@1", "bash-proj", "bash");

    let tg = MockTelegram::new();
    let bridge = Bridge::new(test_config(), store, mux.clone(), tg.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner = {
        let bridge = Arc::clone(&bridge);
        tokio::spawn(async move { bridge.run(shutdown_rx).await })
    };

    tg.push_text_message(7, "private", USER, "line1\nline2");

    assert!(
        wait_until(
            || mux
                .calls()
                .iter()
                .any(|c| c == "send_text @1 line1\nline2"),
            2_000
        )
        .await,
        "multi-line input should reach send_text, calls: {:?}",
        mux.calls()
    );

    let _ = shutdown_tx.send(true);
    let _ = runner.await;
    bridge.shutdown().await;
}

#[tokio::test]
async fn bang_prefix_bypasses_the_serializer() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::open(dir.path().join("state.json"), 10);
    store.set_binding(&dm(7), binding("@1", BackendKind::Bash));

    let mux = MockMux::new();
    mux.add_window("@1", "bash-proj", "bash");

    let tg = MockTelegram::new();
    let bridge = Bridge::new(test_config(), store, mux.clone(), tg.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner = {
        let bridge = Arc::clone(&bridge);
        tokio::spawn(async move { bridge.run(shutdown_rx).await })
    };

    tg.push_text_message(7, "private", USER, "!pwd");

    assert!(
        wait_until(
            || {
                let calls = mux.calls();
                calls.iter().any(|c| c == "send_keys @1 pwd")
                    && calls.iter().any(|c| c == "send_enter @1")
            },
            2_000
        )
        .await,
        "bypass should hit send_keys + send_enter, calls: {:?}",
        mux.calls()
    );
    assert!(
        !mux.calls().iter().any(|c| c.starts_with("send_text")),
        "bypass must not go through the serializer"
    );

    let _ = shutdown_tx.send(true);
    let _ = runner.await;
    bridge.shutdown().await;
}

#[tokio::test]
async fn dead_window_unbinds_and_notifies() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::open(dir.path().join("state.json"), 10);
    store.set_binding(&dm(7), binding("@9", BackendKind::Claude));

    // No windows registered: @9 is dead.
    let mux = MockMux::new();
    let tg = MockTelegram::new();
    let bridge = Bridge::new(test_config(), store.clone(), mux, tg.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner = {
        let bridge = Arc::clone(&bridge);
        tokio::spawn(async move { bridge.run(shutdown_rx).await })
    };

    tg.push_text_message(7, "private", USER, "hello?");

    assert!(
        wait_until(|| store.get_binding(&dm(7)).is_none(), 2_000).await,
        "dead window should unbind"
    );
    assert!(
        wait_until(
            || tg.sent_texts().iter().any(|t| t.contains("disconnected")),
            2_000
        )
        .await,
        "user should be told, sent: {:?}",
        tg.sent_texts()
    );

    let _ = shutdown_tx.send(true);
    let _ = runner.await;
    bridge.shutdown().await;
}

#[tokio::test]
async fn messages_from_unknown_users_are_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::open(dir.path().join("state.json"), 10);

    let mux = MockMux::new();
    let tg = MockTelegram::new();
    let bridge = Bridge::new(test_config(), store, mux.clone(), tg.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner = {
        let bridge = Arc::clone(&bridge);
        tokio::spawn(async move { bridge.run(shutdown_rx).await })
    };

    tg.push_text_message(7, "private", 999, "/new");
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(tg.sent_texts().is_empty(), "unauthorized user got a reply");
    assert!(mux.calls().is_empty());

    let _ = shutdown_tx.send(true);
    let _ = runner.await;
    bridge.shutdown().await;
}
