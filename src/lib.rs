//! finetune: per-application volume control.
//!
//! Architecture:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  OS audio subsystem (PipeWire / simulated)               │
//! │   process list + is-running notifications, taps          │
//! └───────────────┬───────────────────────────▲──────────────┘
//!                 │ Notifier (post only)      │ gain / mute / route
//! ┌───────────────▼───────────────────────────┴──────────────┐
//! │  engine task (one tokio task owns everything below)      │
//! │   ProcessMonitor → AudioEngine → ProcessTapController    │
//! │                        │                                 │
//! │                   VolumeState ⇄ SettingsStore (JSON)     │
//! └───────────────▲──────────────────────────────────────────┘
//!                 │ EngineHandle (async commands, watch list)
//!        CLI / finetune:// URL handler
//! ```

pub mod app;
pub mod audio;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod monitor;
pub mod process;
pub mod settings;
pub mod tap;
pub mod url_handler;
pub mod volume_mapping;
pub mod volume_state;

use clap::Parser;
use config::Config;

pub fn run() -> anyhow::Result<()> {
    let args = cli::Args::parse();
    let config = Config::load(args.config.as_deref())?;
    cli::init_logging(&args, config.log_filter.as_deref());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(app::dispatch(args.command(), &config))
}
