//! Application glue.
//!
//! Connects the configuration, the platform audio backend, the engine task
//! and the command intake (stdin URLs and signals).

use crate::audio::{Backend, OutputDevice};
use crate::cli::Command;
use crate::config::Config;
use crate::engine::{EngineHandle, EngineOptions};
use crate::monitor::{Notifier, ProcessMonitor};
use crate::settings::{JsonSettingsStore, SettingsStore};
use crate::url_handler::{UrlCommand, UrlHandler};
use crate::volume_mapping::gain_to_percentage;
use anyhow::Context;
use std::future::Future;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{debug, error, info};

/// Run one CLI command to completion.
pub async fn dispatch(command: Command, config: &Config) -> anyhow::Result<()> {
    match command {
        Command::Run => run_daemon(config, Backend::platform()?).await,
        Command::List => {
            let store = open_store(config)?;
            list_apps(&mut std::io::stdout().lock(), Backend::platform()?, &store)
        }
        Command::Open { url } => open_url(&mut std::io::stdout().lock(), &url),
        Command::Devices => {
            let backend = Backend::platform()?;
            list_devices(&mut std::io::stdout().lock(), &backend)
        }
    }
}

fn open_store(config: &Config) -> anyhow::Result<JsonSettingsStore> {
    let path = config.settings_path()?;
    JsonSettingsStore::open(&path)
        .with_context(|| format!("Failed to open settings file {}", path.display()))
}

/// Start the engine and serve commands from stdin until EOF or Ctrl-C.
pub async fn run_daemon(config: &Config, backend: Backend) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let engine = EngineHandle::spawn(
        backend,
        Box::new(store),
        EngineOptions {
            default_gain: config.default_gain,
            ..EngineOptions::default()
        },
    );
    engine.start().await?;
    info!(
        apps = engine.apps().len(),
        "finetune running; reading finetune:// URLs from stdin"
    );

    let handler = UrlHandler::new(engine.clone(), config.step);
    let stdin = BufReader::new(tokio::io::stdin());
    serve(&handler, &engine, stdin, shutdown_signal()).await
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

/// Feed command lines to `handler` and log process list changes until the
/// input ends or `shutdown` resolves, then stop the engine.
///
/// Blank lines and lines starting with `#` are ignored.
pub async fn serve<R>(
    handler: &UrlHandler,
    engine: &EngineHandle,
    input: R,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    let mut processes = engine.subscribe();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown requested");
                break;
            }
            changed = processes.changed() => {
                if changed.is_err() {
                    break;
                }
                let apps = processes.borrow_and_update().clone();
                info!(count = apps.len(), "Audio apps changed");
                for app in apps.iter() {
                    debug!(pid = app.pid, name = %app.name, identifier = %app.persistence_identifier(), "Audio app");
                }
            }
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read command input")? else {
                    info!("Command input closed");
                    break;
                };
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                handler.handle_url(line).await?;
            }
        }
    }

    engine.stop().await?;
    info!("finetune stopped");
    Ok(())
}

/// Print every app producing audio with its saved settings. Creates no taps.
pub fn list_apps(
    out: &mut impl Write,
    backend: Backend,
    store: &dyn SettingsStore,
) -> anyhow::Result<()> {
    let Backend { system, apps, .. } = backend;
    let notifier: Notifier = Arc::new(|_| {});
    let mut monitor = ProcessMonitor::new(system, apps, notifier);
    monitor.refresh();

    let active = monitor.active_processes();
    if active.is_empty() {
        writeln!(out, "No apps are producing audio")?;
        return Ok(());
    }
    for app in active {
        let identifier = app.persistence_identifier();
        let volume = match store.load_volume(&identifier) {
            Some(gain) => format!("{}%", gain_to_percentage(gain)),
            None => "-".to_string(),
        };
        let muted = if store.load_mute(&identifier) == Some(true) {
            " (muted)"
        } else {
            ""
        };
        writeln!(
            out,
            "{:>7}  {:>5}  {}{}  [{}]",
            app.pid, volume, app.name, muted, identifier
        )?;
    }
    Ok(())
}

/// Parse a command URL and print what it would do.
pub fn open_url(out: &mut impl Write, url: &str) -> anyhow::Result<()> {
    let command = UrlCommand::parse(url).with_context(|| format!("Invalid URL {url}"))?;
    writeln!(out, "{command}")?;
    Ok(())
}

pub fn list_devices(out: &mut impl Write, backend: &Backend) -> anyhow::Result<()> {
    let devices: Vec<OutputDevice> = backend
        .system
        .output_devices()
        .context("Failed to list output devices")?;
    if devices.is_empty() {
        writeln!(out, "No output devices")?;
    }
    for device in devices {
        writeln!(out, "{}  {}", device.uid, device.name)?;
    }
    Ok(())
}
