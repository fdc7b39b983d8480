//! Two-tier volume state.
//!
//! - Persisted tier (`SettingsStore`), keyed by persistence identifier: the
//!   single source of truth for what an application starts at.
//! - Live tier, keyed by pid: what is applied right now. Only valid while the
//!   pid is live; dropped by [`VolumeState::cleanup`].

use crate::settings::SettingsStore;
use crate::volume_mapping::clamp_gain;
use std::collections::{HashMap, HashSet};
use tracing::warn;

pub struct VolumeState {
    store: Box<dyn SettingsStore>,
    default_gain: f32,
    volumes: HashMap<u32, f32>,
    mutes: HashMap<u32, bool>,
    devices: HashMap<u32, String>,
}

impl VolumeState {
    pub fn new(store: Box<dyn SettingsStore>, default_gain: f32) -> Self {
        Self {
            store,
            default_gain: clamp_gain(default_gain),
            volumes: HashMap::new(),
            mutes: HashMap::new(),
            devices: HashMap::new(),
        }
    }

    /// Record a user-chosen gain for `pid` and persist it under `identifier`.
    ///
    /// Several pids can share one identifier, so the store is compared against
    /// rather than the pid's cache.
    pub fn set_volume(&mut self, pid: u32, gain: f32, identifier: &str) {
        let gain = clamp_gain(gain);
        self.volumes.insert(pid, gain);
        if self.store.load_volume(identifier) == Some(gain) {
            return;
        }
        if let Err(err) = self.store.save_volume(identifier, gain) {
            warn!(pid, identifier, error = %err, "Failed to persist volume");
        }
    }

    /// Gain currently applied to `pid`, or the neutral default.
    pub fn volume(&self, pid: u32) -> f32 {
        self.volumes.get(&pid).copied().unwrap_or(self.default_gain)
    }

    pub fn cached_volume(&self, pid: u32) -> Option<f32> {
        self.volumes.get(&pid).copied()
    }

    /// Look up the saved gain for `identifier` and cache it for `pid`.
    pub fn load_saved_volume(&mut self, pid: u32, identifier: &str) -> Option<f32> {
        let gain = self.store.load_volume(identifier)?;
        self.volumes.insert(pid, gain);
        Some(gain)
    }

    pub fn set_mute(&mut self, pid: u32, muted: bool, identifier: &str) {
        self.mutes.insert(pid, muted);
        if self.store.load_mute(identifier) == Some(muted) {
            return;
        }
        if let Err(err) = self.store.save_mute(identifier, muted) {
            warn!(pid, identifier, error = %err, "Failed to persist mute state");
        }
    }

    pub fn is_muted(&self, pid: u32) -> bool {
        self.mutes.get(&pid).copied().unwrap_or(false)
    }

    pub fn load_saved_mute(&mut self, pid: u32, identifier: &str) -> Option<bool> {
        let muted = self.store.load_mute(identifier)?;
        self.mutes.insert(pid, muted);
        Some(muted)
    }

    pub fn set_device(&mut self, pid: u32, device_uid: &str, identifier: &str) {
        self.devices.insert(pid, device_uid.to_string());
        if self.store.load_device(identifier).as_deref() == Some(device_uid) {
            return;
        }
        if let Err(err) = self.store.save_device(identifier, device_uid) {
            warn!(pid, identifier, error = %err, "Failed to persist output device");
        }
    }

    pub fn device(&self, pid: u32) -> Option<&str> {
        self.devices.get(&pid).map(String::as_str)
    }

    pub fn load_saved_device(&mut self, pid: u32, identifier: &str) -> Option<String> {
        let device = self.store.load_device(identifier)?;
        self.devices.insert(pid, device.clone());
        Some(device)
    }

    /// Drop live entries for every pid not in `keeping`. Persisted values are
    /// untouched.
    pub fn cleanup(&mut self, keeping: &HashSet<u32>) {
        self.volumes.retain(|pid, _| keeping.contains(pid));
        self.mutes.retain(|pid, _| keeping.contains(pid));
        self.devices.retain(|pid, _| keeping.contains(pid));
    }

    pub fn live_pids(&self) -> HashSet<u32> {
        self.volumes
            .keys()
            .chain(self.mutes.keys())
            .chain(self.devices.keys())
            .copied()
            .collect()
    }

    pub fn store(&self) -> &dyn SettingsStore {
        self.store.as_ref()
    }
}
