//! Confined execution context for the [`AudioEngine`].
//!
//! ```text
//!  OS notification threads          callers (CLI, URL handler, tests)
//!          |                                   |
//!    Notifier (weak sender)             EngineHandle (async)
//!          |                                   |
//!          +---------> mpsc queue <------------+
//!                          |
//!                  engine task (owns AudioEngine)
//!                          |
//!                  watch::Sender<Arc<[AudioProcess]>>
//! ```
//!
//! The task drains the queue in order. A run of adjacent refresh requests is
//! collapsed into a single refresh; other commands are never reordered.

use super::{AudioEngine, EngineOptions, EngineSnapshot};
use crate::audio::{Backend, OutputDevice};
use crate::error::EngineError;
use crate::monitor::{Notifier, RefreshTrigger};
use crate::process::AudioProcess;
use crate::settings::SettingsStore;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace};

/// Published list of active processes.
pub type ProcessList = Arc<[AudioProcess]>;

enum Command {
    Refresh(RefreshTrigger),
    Start(oneshot::Sender<()>),
    Stop(oneshot::Sender<()>),
    SetVolume {
        app: AudioProcess,
        gain: f32,
        reply: oneshot::Sender<()>,
    },
    GetVolume {
        app: AudioProcess,
        reply: oneshot::Sender<f32>,
    },
    SetMute {
        app: AudioProcess,
        muted: bool,
        reply: oneshot::Sender<()>,
    },
    IsMuted {
        app: AudioProcess,
        reply: oneshot::Sender<bool>,
    },
    SetDevice {
        app: AudioProcess,
        device_uid: String,
        reply: oneshot::Sender<()>,
    },
    DeviceUid {
        app: AudioProcess,
        reply: oneshot::Sender<Option<String>>,
    },
    ApplyPersisted(oneshot::Sender<()>),
    OutputDevices(oneshot::Sender<Vec<OutputDevice>>),
    Snapshot(oneshot::Sender<EngineSnapshot>),
}

/// Cloneable async handle to the engine task.
///
/// The task exits, stopping the engine and releasing every tap, once the last
/// handle is dropped.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<Command>,
    processes: watch::Receiver<ProcessList>,
}

impl EngineHandle {
    /// Build the engine and spawn its task on the current tokio runtime.
    pub fn spawn(backend: Backend, store: Box<dyn SettingsStore>, options: EngineOptions) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        let weak = tx.downgrade();
        let notifier: Notifier = Arc::new(move |trigger| {
            if let Some(tx) = weak.upgrade() {
                let _ = tx.send(Command::Refresh(trigger));
            }
        });

        let engine = AudioEngine::new(backend, store, options, notifier);
        let (published, processes) = watch::channel(ProcessList::from(Vec::new()));
        tokio::spawn(run(engine, rx, published));

        Self { tx, processes }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, EngineError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(command(reply))
            .map_err(|_| EngineError::Closed)?;
        response.await.map_err(|_| EngineError::Closed)
    }

    pub async fn start(&self) -> Result<(), EngineError> {
        self.request(Command::Start).await
    }

    pub async fn stop(&self) -> Result<(), EngineError> {
        self.request(Command::Stop).await
    }

    pub async fn set_volume(&self, app: &AudioProcess, gain: f32) -> Result<(), EngineError> {
        self.request(|reply| Command::SetVolume {
            app: app.clone(),
            gain,
            reply,
        })
        .await
    }

    pub async fn get_volume(&self, app: &AudioProcess) -> Result<f32, EngineError> {
        self.request(|reply| Command::GetVolume {
            app: app.clone(),
            reply,
        })
        .await
    }

    pub async fn set_mute(&self, app: &AudioProcess, muted: bool) -> Result<(), EngineError> {
        self.request(|reply| Command::SetMute {
            app: app.clone(),
            muted,
            reply,
        })
        .await
    }

    pub async fn is_muted(&self, app: &AudioProcess) -> Result<bool, EngineError> {
        self.request(|reply| Command::IsMuted {
            app: app.clone(),
            reply,
        })
        .await
    }

    pub async fn set_device(&self, app: &AudioProcess, device_uid: &str) -> Result<(), EngineError> {
        self.request(|reply| Command::SetDevice {
            app: app.clone(),
            device_uid: device_uid.to_string(),
            reply,
        })
        .await
    }

    pub async fn device_uid(&self, app: &AudioProcess) -> Result<Option<String>, EngineError> {
        self.request(|reply| Command::DeviceUid {
            app: app.clone(),
            reply,
        })
        .await
    }

    pub async fn apply_persisted_volumes(&self) -> Result<(), EngineError> {
        self.request(Command::ApplyPersisted).await
    }

    pub async fn output_devices(&self) -> Result<Vec<OutputDevice>, EngineError> {
        self.request(Command::OutputDevices).await
    }

    pub async fn snapshot(&self) -> Result<EngineSnapshot, EngineError> {
        self.request(Command::Snapshot).await
    }

    /// Latest published process list.
    pub fn apps(&self) -> ProcessList {
        self.processes.borrow().clone()
    }

    /// Receiver that observes every published process list.
    pub fn subscribe(&self) -> watch::Receiver<ProcessList> {
        self.processes.clone()
    }

    /// Active app matching `identifier` by bundle id or persistence identifier.
    pub fn find_app(&self, identifier: &str) -> Option<AudioProcess> {
        self.apps()
            .iter()
            .find(|app| app.matches_identifier(identifier))
            .cloned()
    }
}

async fn run(
    mut engine: AudioEngine,
    mut rx: mpsc::UnboundedReceiver<Command>,
    published: watch::Sender<ProcessList>,
) {
    let mut pending: Option<Command> = None;

    loop {
        let command = match pending.take() {
            Some(command) => command,
            None => match rx.recv().await {
                Some(command) => command,
                None => break,
            },
        };

        match command {
            Command::Refresh(trigger) => {
                let mut coalesced = 1;
                while let Ok(next) = rx.try_recv() {
                    if matches!(next, Command::Refresh(_)) {
                        coalesced += 1;
                    } else {
                        pending = Some(next);
                        break;
                    }
                }
                trace!(?trigger, coalesced, "Refreshing audio processes");
                if engine.refresh() {
                    publish(&engine, &published);
                }
            }
            Command::Start(reply) => {
                engine.start();
                publish(&engine, &published);
                let _ = reply.send(());
            }
            Command::Stop(reply) => {
                engine.stop();
                let _ = reply.send(());
            }
            Command::SetVolume { app, gain, reply } => {
                engine.set_volume(&app, gain);
                let _ = reply.send(());
            }
            Command::GetVolume { app, reply } => {
                let _ = reply.send(engine.get_volume(&app));
            }
            Command::SetMute { app, muted, reply } => {
                engine.set_mute(&app, muted);
                let _ = reply.send(());
            }
            Command::IsMuted { app, reply } => {
                let _ = reply.send(engine.is_muted(&app));
            }
            Command::SetDevice {
                app,
                device_uid,
                reply,
            } => {
                engine.set_device(&app, &device_uid);
                let _ = reply.send(());
            }
            Command::DeviceUid { app, reply } => {
                let _ = reply.send(engine.device_uid(&app));
            }
            Command::ApplyPersisted(reply) => {
                engine.apply_persisted_volumes();
                let _ = reply.send(());
            }
            Command::OutputDevices(reply) => {
                let _ = reply.send(engine.output_devices());
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(engine.snapshot());
            }
        }
    }

    engine.stop();
    debug!("Audio engine task exited");
}

/// Publish the engine's list when it differs from the last published one.
fn publish(engine: &AudioEngine, published: &watch::Sender<ProcessList>) {
    published.send_if_modified(|current| {
        if **current == *engine.apps() {
            return false;
        }
        *current = ProcessList::from(engine.apps());
        true
    });
}
