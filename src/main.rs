// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod cli;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use bifrost_agent::ProcessSupervisor;
use bifrost_chat::{ChatClient, SlackClient};
use bifrost_config::Config;
use bifrost_gateway::Scheduler;
use bifrost_queue::MessageQueue;
use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config_path = match cli.config {
        Some(p) => p,
        None => {
            let cwd = std::env::current_dir().context("resolving working directory")?;
            bifrost_config::find_config_path(&cwd).context(
                "no config.yaml or config.json in the working directory (use --config)",
            )?
        }
    };

    match cli.command.unwrap_or(Commands::Start) {
        Commands::ShowConfig => {
            let config = bifrost_config::load(&config_path)?;
            println!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
        Commands::ValidateConfig => validate_config(&config_path),
        Commands::Start => run_gateway(config_path).await,
    }
}

/// Parse the config and print the routing table it would serve.
fn validate_config(path: &Path) -> anyhow::Result<()> {
    let config = bifrost_config::load(path)?;
    println!("Config OK: {} channel(s)", config.channels.len());
    for id in config.channels.keys() {
        // Resolution applies defaults and fallbacks, so what prints here is
        // what would actually run.
        if let Some(r) = config.resolve_channel(id, path) {
            println!(
                "  {id}  #{}  {}  model={}  {}/{}  timeout={}ms",
                r.name, r.folder, r.model, r.process_mode, r.response_mode, r.timeout_ms
            );
        }
    }
    if let Some(system) = &config.system_channel {
        println!("  system channel: {system}");
    }
    Ok(())
}

async fn run_gateway(config_path: PathBuf) -> anyhow::Result<()> {
    let config = bifrost_config::load(&config_path)?;
    let bot_token = config
        .slack
        .resolve_bot_token()
        .context("Slack bot token missing: set slack.botToken or SLACK_BOT_TOKEN")?;
    let app_token = config
        .slack
        .resolve_app_token()
        .context("Slack app token missing: set slack.appToken or SLACK_APP_TOKEN")?;

    let data_dir = dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("bifrost");
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating {}", data_dir.display()))?;
    let _pidfile = Pidfile::acquire(data_dir.join("bifrost.pid"))?;

    let client = Arc::new(SlackClient::new(bot_token));
    let supervisor = ProcessSupervisor::new();
    let queue = MessageQueue::new(data_dir.join("queue"))?;
    let scheduler = Scheduler::new(
        client.clone(),
        supervisor.clone(),
        queue,
        config_path.clone(),
        std::env::temp_dir().join("bifrost-images"),
    );

    let (events_tx, events_rx) = tokio::sync::mpsc::channel(256);
    tokio::spawn(bifrost_chat::run_socket_mode(app_token, events_tx));

    info!(
        config = %config_path.display(),
        channels = config.channels.len(),
        "bifrost started"
    );
    notify_system_channel(&*client, &config, ":rocket: bifrost is up").await;

    tokio::select! {
        _ = scheduler.run(events_rx) => {
            warn!("ingress closed unexpectedly");
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    let killed = supervisor.kill_all_processes();
    if !killed.is_empty() {
        info!(count = killed.len(), "terminated agent processes on shutdown");
    }
    notify_system_channel(&*client, &config, ":wave: bifrost shutting down").await;
    Ok(())
}

async fn notify_system_channel(client: &dyn ChatClient, config: &Config, text: &str) {
    if let Some(channel) = &config.system_channel {
        if let Err(e) = client.post_message(channel, None, text).await {
            warn!("system channel notification failed: {e}");
        }
    }
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let sigterm = async {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("cannot install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm => {}
    }
}

/// Single-instance guard.  A stale pidfile from a dead process is replaced;
/// a live one refuses startup.
struct Pidfile {
    path: PathBuf,
}

impl Pidfile {
    fn acquire(path: PathBuf) -> anyhow::Result<Self> {
        if let Ok(existing) = std::fs::read_to_string(&path) {
            if let Ok(pid) = existing.trim().parse::<i32>() {
                // Signal 0 probes for existence without touching the process.
                if unsafe { libc::kill(pid, 0) } == 0 {
                    anyhow::bail!("another bifrost instance is running (pid {pid})");
                }
            }
        }
        std::fs::write(&path, std::process::id().to_string())
            .with_context(|| format!("writing pidfile {}", path.display()))?;
        Ok(Self { path })
    }
}

impl Drop for Pidfile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn init_logging(verbosity: u8) {
    let default_level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init();
}
