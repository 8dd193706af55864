//! auto-claude - autonomous pull request merge daemon.
//!
//! Polls the configured repositories, classifies every open pull request,
//! and drives each one to merge: Claude Code sessions resolve conflicts,
//! fix failing checks, and address review comments inside per-PR git
//! worktrees; ready PRs are merged through the forge.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use autoclaude_core::agent::claude::ClaudeRunner;
use autoclaude_core::classify::ReviewerIdentities;
use autoclaude_core::config::Config;
use autoclaude_core::forge::gh::GhForge;
use autoclaude_core::workspace::GitWorkspace;
use autoclaude_daemon::Daemon;
use autoclaude_daemon::logging;
use autoclaude_daemon::tui;
use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Environment variable that forces headless mode when set to `0`.
const TUI_ENV: &str = "AUTO_CLAUDE_TUI";

/// auto-claude - autonomous PR merge daemon
#[derive(Parser, Debug)]
#[command(name = "auto-claude")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

fn use_tui() -> bool {
    if std::env::var(TUI_ENV).is_ok_and(|v| v == "0") {
        return false;
    }
    std::io::stderr().is_terminal()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Arc::new(Config::load(&args.config).context("load configuration")?);

    let tui_active = use_tui();
    let _log_guard = logging::init(&config, tui_active).context("initialize logging")?;

    info!(config = %args.config.display(), "auto-claude starting");

    let forge = Arc::new(GhForge::new());
    let agent = Arc::new(ClaudeRunner::new(
        config.claude.model.clone(),
        config.transcript_dir(),
    ));
    let workspace = Arc::new(GitWorkspace::new(config.workdir.clone()));
    let identities = Arc::new(ReviewerIdentities::default());

    let daemon = Arc::new(Daemon::new(
        Arc::clone(&config),
        forge,
        agent,
        workspace,
        identities,
    ));

    let shutdown = CancellationToken::new();

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(sig) => sig,
            Err(err) => {
                error!(%err, "failed to register SIGINT handler");
                return;
            },
        };
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(err) => {
                error!(%err, "failed to register SIGTERM handler");
                return;
            },
        };

        tokio::select! {
            _ = sigint.recv() => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
        signal_shutdown.cancel();
    });

    if tui_active {
        let daemon_task = {
            let daemon = Arc::clone(&daemon);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { daemon.run(shutdown).await })
        };

        let view = tui::run(
            Arc::clone(&daemon),
            config.tui.refresh_interval,
            shutdown.clone(),
        )
        .await;

        // The view quitting requests shutdown; wait for workers to stop.
        shutdown.cancel();
        daemon_task.await.context("daemon task")?;
        view.context("status view")?;
    } else {
        daemon.run(shutdown).await;
    }

    info!("auto-claude stopped");
    Ok(())
}
