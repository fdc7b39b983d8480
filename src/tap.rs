//! Per-process tap lifecycle.
//!
//! ```text
//! Unbound --activate()--> Active --invalidate()--> Invalidated
//!    |                                                 ^
//!    +--------------------invalidate()-----------------+
//! ```
//!
//! Gain, mute and routing set while Unbound are queued and pushed into the
//! OS handle on activation. Invalidated is terminal.

use crate::audio::{TapBackend, TapHandle};
use crate::error::{RoutingError, TapActivationError};
use crate::process::AudioProcess;
use crate::volume_mapping::{UNITY_GAIN, clamp_gain};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapState {
    Unbound,
    Active,
    Invalidated,
}

enum Binding {
    Unbound,
    Active(Box<dyn TapHandle>),
    Invalidated,
}

/// Binds one process to a live gain-controllable intercept.
pub struct ProcessTapController {
    process: AudioProcess,
    binding: Binding,
    volume: f32,
    muted: bool,
    device: Option<String>,
}

impl ProcessTapController {
    pub fn new(process: AudioProcess) -> Self {
        Self {
            process,
            binding: Binding::Unbound,
            volume: UNITY_GAIN,
            muted: false,
            device: None,
        }
    }

    pub fn process(&self) -> &AudioProcess {
        &self.process
    }

    pub fn state(&self) -> TapState {
        match self.binding {
            Binding::Unbound => TapState::Unbound,
            Binding::Active(_) => TapState::Active,
            Binding::Invalidated => TapState::Invalidated,
        }
    }

    /// Acquire the OS intercept and push the queued gain, mute and route.
    ///
    /// Activating an already active controller is a no-op.
    pub fn activate(&mut self, backend: &dyn TapBackend) -> Result<(), TapActivationError> {
        match self.binding {
            Binding::Active(_) => return Ok(()),
            Binding::Invalidated => {
                return Err(TapActivationError::Invalidated {
                    pid: self.process.pid,
                });
            }
            Binding::Unbound => {}
        }

        let mut handle = backend.create_tap(&self.process)?;
        handle.set_gain(self.volume);
        handle.set_muted(self.muted);
        if let Some(device) = self.device.as_deref() {
            if let Err(err) = handle.route_to(device) {
                warn!(pid = self.process.pid, device, error = %err, "Queued routing not applied");
            }
        }
        self.binding = Binding::Active(handle);
        debug!(pid = self.process.pid, name = %self.process.name, "Tap activated");
        Ok(())
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    /// Set the gain. Takes effect immediately when Active, queued when
    /// Unbound, ignored once Invalidated.
    pub fn set_volume(&mut self, gain: f32) {
        if matches!(self.binding, Binding::Invalidated) {
            return;
        }
        self.volume = clamp_gain(gain);
        if let Binding::Active(handle) = &mut self.binding {
            handle.set_gain(self.volume);
        }
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn set_muted(&mut self, muted: bool) {
        if matches!(self.binding, Binding::Invalidated) {
            return;
        }
        self.muted = muted;
        if let Binding::Active(handle) = &mut self.binding {
            handle.set_muted(muted);
        }
    }

    pub fn device(&self) -> Option<&str> {
        self.device.as_deref()
    }

    /// Route the process to an output device. Queued when Unbound.
    pub fn set_device(&mut self, device_uid: &str) -> Result<(), RoutingError> {
        match &mut self.binding {
            Binding::Invalidated => Ok(()),
            Binding::Unbound => {
                self.device = Some(device_uid.to_string());
                Ok(())
            }
            Binding::Active(handle) => {
                handle.route_to(device_uid)?;
                self.device = Some(device_uid.to_string());
                Ok(())
            }
        }
    }

    /// Release the OS intercept. Only the first call has any effect.
    pub fn invalidate(&mut self) {
        match std::mem::replace(&mut self.binding, Binding::Invalidated) {
            Binding::Active(handle) => {
                handle.release();
                debug!(pid = self.process.pid, "Tap invalidated");
            }
            Binding::Unbound | Binding::Invalidated => {}
        }
    }
}

impl Drop for ProcessTapController {
    fn drop(&mut self) {
        self.invalidate();
    }
}
