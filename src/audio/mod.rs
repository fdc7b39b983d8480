//! Seams to the OS audio subsystem.
//!
//! The engine never talks to a platform API directly. It goes through three
//! collaborators:
//! - [`AudioSystem`]: enumerate audio process objects and subscribe to changes
//! - [`RunningApps`]: resolve a pid to a user-facing application name / icon
//! - [`TapBackend`]: create a gain-controllable intercept for one process
//!
//! Backends:
//! - Linux: PipeWire (feature `pipewire`)
//! - `sim`: in-process simulation for tests, not part of the public API

use crate::error::{RoutingError, SystemError, TapActivationError};
use crate::process::{AudioProcess, IconRef};
use serde::Serialize;
use std::sync::Arc;

pub mod apps;
#[doc(hidden)]
pub mod sim;

#[cfg(all(target_os = "linux", feature = "pipewire"))]
mod linux;

/// Identifier of a process object inside the audio subsystem. Distinct from
/// the OS pid.
pub type AudioObjectId = u32;

/// Callback fired by the audio subsystem, possibly on a foreign thread.
pub type Listener = Arc<dyn Fn() + Send + Sync>;

/// Handle returned by listener registration, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerToken(pub u64);

/// An output device a process can be routed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputDevice {
    pub uid: String,
    pub name: String,
}

/// Enumeration and change notification for audio-producing process objects.
pub trait AudioSystem: Send + Sync {
    /// Every process object currently known to the audio subsystem.
    fn process_objects(&self) -> Result<Vec<AudioObjectId>, SystemError>;

    /// Whether the object is actively running audio I/O.
    fn is_running(&self, object: AudioObjectId) -> Result<bool, SystemError>;

    fn process_id(&self, object: AudioObjectId) -> Result<u32, SystemError>;

    fn bundle_id(&self, object: AudioObjectId) -> Result<Option<String>, SystemError>;

    /// Application name as reported by the audio subsystem itself, if any.
    fn app_name(&self, _object: AudioObjectId) -> Option<String> {
        None
    }

    fn icon_name(&self, _object: AudioObjectId) -> Option<String> {
        None
    }

    /// Fire `listener` whenever the set of process objects changes.
    fn add_process_list_listener(&self, listener: Listener) -> Result<ListenerToken, SystemError>;

    /// Fire `listener` whenever `object`'s running state changes.
    fn add_running_listener(
        &self,
        object: AudioObjectId,
        listener: Listener,
    ) -> Result<ListenerToken, SystemError>;

    fn remove_listener(&self, token: ListenerToken);

    fn output_devices(&self) -> Result<Vec<OutputDevice>, SystemError>;
}

/// A user-facing application as seen by the OS process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningApp {
    pub name: String,
    pub icon: IconRef,
}

/// Resolves pids to user-facing application metadata.
pub trait RunningApps: Send {
    /// Re-read the OS process table. Called once per monitor refresh.
    fn refresh(&mut self);

    fn lookup(&self, pid: u32) -> Option<RunningApp>;
}

/// Creates gain-controllable intercepts.
pub trait TapBackend: Send + Sync {
    fn create_tap(&self, process: &AudioProcess) -> Result<Box<dyn TapHandle>, TapActivationError>;
}

/// A live intercept on one process's audio output.
pub trait TapHandle: Send {
    fn set_gain(&mut self, gain: f32);

    fn set_muted(&mut self, muted: bool);

    fn route_to(&mut self, _device_uid: &str) -> Result<(), RoutingError> {
        Err(RoutingError::Unsupported)
    }

    /// Release the OS resource. Consumes the handle so it runs at most once.
    fn release(self: Box<Self>);
}

/// The collaborators one engine runs against.
pub struct Backend {
    pub system: Arc<dyn AudioSystem>,
    pub apps: Box<dyn RunningApps>,
    pub taps: Arc<dyn TapBackend>,
}

impl Backend {
    /// The native backend for this platform.
    pub fn platform() -> anyhow::Result<Self> {
        #[cfg(all(target_os = "linux", feature = "pipewire"))]
        return linux::backend();

        #[cfg(not(all(target_os = "linux", feature = "pipewire")))]
        anyhow::bail!("No audio backend compiled in (on Linux, build with `--features pipewire`)")
    }

    /// Simulated backend sharing state with `sim` so tests can drive it.
    #[doc(hidden)]
    pub fn simulated(sim: &sim::SimulatedAudio) -> Self {
        Self {
            system: Arc::new(sim.clone()),
            apps: Box::new(sim.clone()),
            taps: Arc::new(sim.clone()),
        }
    }
}
