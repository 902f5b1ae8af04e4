//! tgmux: drive claude/codex/gemini sessions in tmux from Telegram.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tgmux_core::bot::Bridge;
use tgmux_core::config::{self, Config};
use tgmux_core::state::StateStore;
use tgmux_core::telegram::{TelegramClient, TgHandle};
use tgmux_core::tmux::{MuxHandle, TmuxClient};

#[derive(Debug, Parser)]
#[command(name = "tgmux", version, about = "Telegram bridge to tmux-hosted coding agents")]
struct Cli {
    /// Config file path
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    let config_path = cli.config.unwrap_or_else(Config::default_path);
    let cfg = match Config::load(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    if cfg.security.config_permission_check {
        config::check_file_permission(&config_path);
    }

    info!(
        allowed_users = ?cfg.telegram.allowed_users,
        "tgmux starting"
    );

    let store = StateStore::open(Config::default_state_path(), cfg.dirs.recent_max);

    let mux: MuxHandle = Arc::new(TmuxClient::new());
    if let Err(e) = mux.ensure_session().await {
        error!(error = %e, "failed to ensure tmux session");
        std::process::exit(1);
    }

    let tg: TgHandle = match TelegramClient::new(&cfg.telegram.token) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!(error = %e, "failed to create telegram client");
            std::process::exit(1);
        }
    };
    match tg.get_me().await {
        Ok(me) => info!(bot = ?me.username, "telegram bot verified"),
        Err(e) => {
            error!(error = %e, "failed to verify bot token");
            std::process::exit(1);
        }
    }

    let bridge = Bridge::new(cfg, store, mux, tg);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner = {
        let bridge = Arc::clone(&bridge);
        tokio::spawn(async move { bridge.run(shutdown_rx).await })
    };

    info!("tgmux ready");
    wait_for_signal().await;
    info!("received signal, shutting down");

    // Stop polling, then tear down in order: serializers, monitors,
    // pushers, state store.
    let _ = shutdown_tx.send(true);
    let _ = runner.await;
    bridge.shutdown().await;

    info!("tgmux shutdown complete");
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
}
