//! The audio engine: owns the process monitor and every tap.
//!
//! [`AudioEngine`] is plain synchronous state. It is only ever driven from one
//! task (see [`actor`]), which is what makes the tap table, the monitor's
//! process list and the live volume cache race-free without locks.
//!
//! Per-pid lifecycle:
//!
//! ```text
//! Unseen -> Tracked(no tap) -> Tracked(active tap) -> (process gone) -> Unseen
//! ```

pub mod actor;

pub use actor::EngineHandle;

use crate::audio::{AudioSystem, Backend, OutputDevice, TapBackend};
use crate::monitor::{Notifier, ProcessMonitor};
use crate::process::AudioProcess;
use crate::settings::SettingsStore;
use crate::tap::ProcessTapController;
use crate::volume_mapping::{UNITY_GAIN, clamp_gain, gain_to_percentage};
use crate::volume_state::VolumeState;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Tunables for a new engine.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Gain reported for processes the user never touched.
    pub default_gain: f32,
    /// Pid excluded from monitoring. Defaults to the current process.
    pub own_pid: Option<u32>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            default_gain: UNITY_GAIN,
            own_pid: None,
        }
    }
}

/// Point-in-time view of engine bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineSnapshot {
    pub running: bool,
    /// Pids with an active tap, ascending.
    pub tapped_pids: Vec<u32>,
    /// Pids whose persisted settings were applied this session, ascending.
    pub applied_pids: Vec<u32>,
    /// Monitor refreshes performed so far.
    pub refreshes: u64,
}

pub struct AudioEngine {
    monitor: ProcessMonitor,
    volume_state: VolumeState,
    system: Arc<dyn AudioSystem>,
    tap_backend: Arc<dyn TapBackend>,
    taps: HashMap<u32, ProcessTapController>,
    applied: HashSet<u32>,
    /// Persistence identifier that each pid's live state belongs to.
    owners: HashMap<u32, String>,
    running: bool,
}

impl AudioEngine {
    pub fn new(
        backend: Backend,
        store: Box<dyn SettingsStore>,
        options: EngineOptions,
        notifier: Notifier,
    ) -> Self {
        let Backend { system, apps, taps } = backend;
        let mut monitor = ProcessMonitor::new(system.clone(), apps, notifier);
        if let Some(pid) = options.own_pid {
            monitor = monitor.with_own_pid(pid);
        }
        Self {
            monitor,
            volume_state: VolumeState::new(store, options.default_gain),
            system,
            tap_backend: taps,
            taps: HashMap::new(),
            applied: HashSet::new(),
            owners: HashMap::new(),
            running: false,
        }
    }

    /// Processes currently producing audio, sorted by name.
    pub fn apps(&self) -> &[AudioProcess] {
        self.monitor.active_processes()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn start(&mut self) {
        if self.running {
            return;
        }
        self.running = true;
        // Changes made while stopped were persisted but never reached a tap.
        self.applied.clear();
        self.monitor.start();
        self.on_processes_changed();
        info!(apps = self.apps().len(), "AudioEngine started");
    }

    /// Invalidate every tap and stop monitoring.
    pub fn stop(&mut self) {
        for (_, mut tap) in self.taps.drain() {
            tap.invalidate();
        }
        self.applied.clear();
        self.monitor.stop();
        if self.running {
            info!("AudioEngine stopped");
        }
        self.running = false;
    }

    /// Re-read the process list and reconcile taps when it changed.
    pub fn refresh(&mut self) -> bool {
        if !self.running {
            debug!("Ignoring refresh while stopped");
            return false;
        }
        let changed = self.monitor.refresh();
        if changed {
            self.on_processes_changed();
        }
        changed
    }

    /// Reaction to a changed process list.
    pub fn on_processes_changed(&mut self) {
        self.cleanup_stale_taps();
        self.apply_persisted_volumes();
    }

    /// Persist `gain` for the app and apply it to its tap.
    pub fn set_volume(&mut self, app: &AudioProcess, gain: f32) {
        let gain = clamp_gain(gain);
        let identifier = self.claim(app);
        self.volume_state.set_volume(app.pid, gain, &identifier);
        self.applied.insert(app.pid);
        self.apply_volume_to_tap(app, gain);
    }

    pub fn get_volume(&self, app: &AudioProcess) -> f32 {
        self.volume_state.volume(app.pid)
    }

    pub fn set_mute(&mut self, app: &AudioProcess, muted: bool) {
        let identifier = self.claim(app);
        self.volume_state.set_mute(app.pid, muted, &identifier);
        self.applied.insert(app.pid);
        match self.taps.get_mut(&app.pid) {
            Some(tap) => tap.set_muted(muted),
            None => {
                self.create_tap(app, self.volume_state.volume(app.pid));
            }
        }
    }

    pub fn is_muted(&self, app: &AudioProcess) -> bool {
        self.volume_state.is_muted(app.pid)
    }

    /// Route the app to an output device and remember the choice.
    pub fn set_device(&mut self, app: &AudioProcess, device_uid: &str) {
        let identifier = self.claim(app);
        self.volume_state.set_device(app.pid, device_uid, &identifier);
        self.applied.insert(app.pid);
        match self.taps.get_mut(&app.pid) {
            Some(tap) => {
                if let Err(err) = tap.set_device(device_uid) {
                    warn!(pid = app.pid, device = device_uid, error = %err, "Failed to route app");
                }
            }
            None => {
                self.create_tap(app, self.volume_state.volume(app.pid));
            }
        }
    }

    pub fn device_uid(&self, app: &AudioProcess) -> Option<String> {
        self.volume_state.device(app.pid).map(str::to_string)
    }

    pub fn output_devices(&self) -> Vec<OutputDevice> {
        self.system.output_devices().unwrap_or_else(|err| {
            error!(error = %err, "Failed to list output devices");
            Vec::new()
        })
    }

    /// Active app whose bundle id or persistence identifier is `identifier`.
    pub fn find_app(&self, identifier: &str) -> Option<&AudioProcess> {
        self.apps()
            .iter()
            .find(|app| app.matches_identifier(identifier))
    }

    /// Record `app` as the owner of its pid's live state, dropping state left
    /// behind by a different application on the same pid.
    fn claim(&mut self, app: &AudioProcess) -> String {
        let identifier = app.persistence_identifier();
        if self.owners.get(&app.pid).is_some_and(|owner| *owner != identifier) {
            self.forget(app.pid);
        }
        self.owners.insert(app.pid, identifier.clone());
        identifier
    }

    fn forget(&mut self, pid: u32) {
        if let Some(mut tap) = self.taps.remove(&pid) {
            tap.invalidate();
            debug!(pid, "Cleaned up stale tap");
        }
        self.applied.remove(&pid);
        self.owners.remove(&pid);
        let keeping: HashSet<u32> = self.owners.keys().copied().collect();
        self.volume_state.cleanup(&keeping);
    }

    /// Apply saved settings to every active app not yet handled this session.
    ///
    /// An app is marked as applied once its saved settings reach a live tap,
    /// so repeated calls never clobber a later live adjustment. Applied apps
    /// left without a tap by a failed activation get their live state pushed
    /// again.
    pub fn apply_persisted_volumes(&mut self) {
        if !self.running {
            return;
        }
        let apps = self.apps().to_vec();
        for app in &apps {
            if self.applied.contains(&app.pid) {
                if !self.taps.contains_key(&app.pid) {
                    let gain = self.volume_state.volume(app.pid);
                    self.sync_tap(app, gain);
                }
                continue;
            }
            let identifier = self.claim(app);
            let saved_volume = self.volume_state.load_saved_volume(app.pid, &identifier);
            let saved_mute = self.volume_state.load_saved_mute(app.pid, &identifier);
            let saved_device = self.volume_state.load_saved_device(app.pid, &identifier);
            if saved_volume.is_none() && saved_mute.is_none() && saved_device.is_none() {
                continue;
            }

            let gain = self.volume_state.volume(app.pid);
            debug!(
                name = %app.name,
                percent = gain_to_percentage(gain),
                "Applying saved volume"
            );
            if self.sync_tap(app, gain) {
                self.applied.insert(app.pid);
            }
        }
    }

    /// Push `gain` into the app's tap, creating the tap if needed.
    fn apply_volume_to_tap(&mut self, app: &AudioProcess, gain: f32) -> bool {
        match self.taps.get_mut(&app.pid) {
            Some(tap) => {
                tap.set_volume(gain);
                true
            }
            None => self.create_tap(app, gain),
        }
    }

    /// Bring an existing tap in line with the cached state, or create one.
    fn sync_tap(&mut self, app: &AudioProcess, gain: f32) -> bool {
        let muted = self.volume_state.is_muted(app.pid);
        let device = self.volume_state.device(app.pid).map(str::to_string);
        let Some(tap) = self.taps.get_mut(&app.pid) else {
            return self.create_tap(app, gain);
        };
        tap.set_volume(gain);
        tap.set_muted(muted);
        if let Some(device) = device {
            if tap.device() != Some(device.as_str()) {
                if let Err(err) = tap.set_device(&device) {
                    warn!(pid = app.pid, device = %device, error = %err, "Failed to route app");
                }
            }
        }
        true
    }

    /// Create, seed and activate a tap. Nothing is tracked on failure; the
    /// next call starts over.
    fn create_tap(&mut self, app: &AudioProcess, gain: f32) -> bool {
        if !self.running {
            debug!(pid = app.pid, "Engine stopped; tap creation deferred");
            return false;
        }

        let mut tap = ProcessTapController::new(app.clone());
        tap.set_volume(gain);
        tap.set_muted(self.volume_state.is_muted(app.pid));
        if let Some(device) = self.volume_state.device(app.pid) {
            // Unbound controllers only queue the route, which cannot fail.
            let _ = tap.set_device(device);
        }

        match tap.activate(self.tap_backend.as_ref()) {
            Ok(()) => {
                debug!(
                    name = %app.name,
                    pid = app.pid,
                    percent = gain_to_percentage(gain),
                    "Created tap"
                );
                self.taps.insert(app.pid, tap);
                true
            }
            Err(err) => {
                error!(name = %app.name, pid = app.pid, error = %err, "Failed to create tap");
                false
            }
        }
    }

    /// Invalidate taps whose process left the active set (or whose pid now
    /// belongs to a different application) and forget their live state.
    pub fn cleanup_stale_taps(&mut self) {
        let live: HashMap<u32, String> = self
            .apps()
            .iter()
            .map(|app| (app.pid, app.persistence_identifier()))
            .collect();

        let mut reassigned = HashSet::new();
        let mut stale = Vec::new();
        for (&pid, tap) in &self.taps {
            match live.get(&pid) {
                None => stale.push(pid),
                Some(identifier) if *identifier != tap.process().persistence_identifier() => {
                    reassigned.insert(pid);
                    stale.push(pid);
                }
                Some(_) => {}
            }
        }
        for (pid, owner) in &self.owners {
            if live.get(pid).is_some_and(|identifier| identifier != owner) {
                reassigned.insert(*pid);
            }
        }

        for pid in stale {
            if let Some(mut tap) = self.taps.remove(&pid) {
                tap.invalidate();
                debug!(pid, "Cleaned up stale tap");
            }
        }

        let keeping: HashSet<u32> = live
            .keys()
            .filter(|pid| !reassigned.contains(*pid))
            .copied()
            .collect();
        self.applied.retain(|pid| keeping.contains(pid));
        self.owners.retain(|pid, _| keeping.contains(pid));
        self.volume_state.cleanup(&keeping);
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        let mut tapped_pids: Vec<u32> = self.taps.keys().copied().collect();
        tapped_pids.sort_unstable();
        let mut applied_pids: Vec<u32> = self.applied.iter().copied().collect();
        applied_pids.sort_unstable();
        EngineSnapshot {
            running: self.running,
            tapped_pids,
            applied_pids,
            refreshes: self.monitor.refresh_count(),
        }
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::sim::SimulatedAudio;
    use crate::settings::MemorySettingsStore;

    const OWN_PID: u32 = 1;

    fn engine_with(sim: &SimulatedAudio, store: MemorySettingsStore) -> AudioEngine {
        let notifier: Notifier = Arc::new(|_| {});
        AudioEngine::new(
            Backend::simulated(sim),
            Box::new(store),
            EngineOptions {
                own_pid: Some(OWN_PID),
                ..EngineOptions::default()
            },
            notifier,
        )
    }

    impl AudioEngine {
        fn store_volume(&self, identifier: &str) -> Option<f32> {
            self.volume_state.store().load_volume(identifier)
        }
    }

    fn app(engine: &AudioEngine, pid: u32) -> AudioProcess {
        engine
            .apps()
            .iter()
            .find(|a| a.pid == pid)
            .cloned()
            .expect("app is active")
    }

    #[test]
    fn start_applies_persisted_volume() {
        let sim = SimulatedAudio::new();
        sim.add_process(10, 100, Some("com.app.x"));
        sim.add_process(11, 101, Some("com.app.y"));
        let mut engine = engine_with(&sim, MemorySettingsStore::with_volumes([("com.app.x", 0.6)]));

        engine.start();

        assert_eq!(sim.tap(100).map(|t| t.gain), Some(0.6));
        assert_eq!(sim.live_tap_count(101), 0);
        assert_eq!(engine.get_volume(&app(&engine, 100)), 0.6);
        assert_eq!(engine.get_volume(&app(&engine, 101)), 1.0);
        assert_eq!(engine.snapshot().applied_pids, [100]);
    }

    #[test]
    fn set_volume_reuses_existing_tap() {
        let sim = SimulatedAudio::new();
        sim.add_process(10, 100, Some("com.app.x"));
        let mut engine = engine_with(&sim, MemorySettingsStore::new());
        engine.start();
        let x = app(&engine, 100);

        engine.set_volume(&x, 0.5);
        engine.set_volume(&x, 1.5);

        assert_eq!(sim.activation_count(100), 1);
        assert_eq!(sim.tap(100).map(|t| t.gain), Some(1.5));
        assert_eq!(engine.snapshot().tapped_pids, [100]);
    }

    #[test]
    fn apply_persisted_is_idempotent_and_respects_live_changes() {
        let sim = SimulatedAudio::new();
        sim.add_process(10, 100, Some("com.app.x"));
        let mut engine = engine_with(&sim, MemorySettingsStore::with_volumes([("com.app.x", 0.6)]));
        engine.start();

        let before = engine.snapshot();
        engine.apply_persisted_volumes();
        assert_eq!(engine.snapshot(), before);
        assert_eq!(sim.tap(100).map(|t| t.gain), Some(0.6));

        let x = app(&engine, 100);
        engine.set_volume(&x, 1.2);
        engine.apply_persisted_volumes();
        assert_eq!(sim.tap(100).map(|t| t.gain), Some(1.2));
    }

    #[test]
    fn failed_activation_keeps_cached_gain_and_retries() {
        let sim = SimulatedAudio::new();
        sim.add_process(10, 100, Some("com.app.x"));
        sim.deny_taps(100, true);
        let mut engine = engine_with(&sim, MemorySettingsStore::new());
        engine.start();
        let x = app(&engine, 100);

        engine.set_volume(&x, 0.3);
        assert_eq!(engine.get_volume(&x), 0.3);
        assert!(engine.snapshot().tapped_pids.is_empty());

        sim.deny_taps(100, false);
        engine.set_volume(&x, 0.4);
        assert_eq!(sim.tap(100).map(|t| t.gain), Some(0.4));
    }

    #[test]
    fn persisted_apply_retries_after_activation_failure() {
        let sim = SimulatedAudio::new();
        sim.add_process(10, 100, Some("com.app.x"));
        sim.deny_taps(100, true);
        let mut engine = engine_with(&sim, MemorySettingsStore::with_volumes([("com.app.x", 0.6)]));
        engine.start();
        assert!(engine.snapshot().applied_pids.is_empty());

        sim.deny_taps(100, false);
        engine.apply_persisted_volumes();
        assert_eq!(sim.tap(100).map(|t| t.gain), Some(0.6));
        assert_eq!(engine.snapshot().applied_pids, [100]);
    }

    #[test]
    fn live_change_without_tap_is_pushed_on_next_apply() {
        let sim = SimulatedAudio::new();
        sim.add_process(10, 100, Some("com.app.x"));
        sim.deny_taps(100, true);
        let mut engine = engine_with(&sim, MemorySettingsStore::new());
        engine.start();
        let x = app(&engine, 100);

        engine.set_volume(&x, 0.3);
        engine.set_mute(&x, true);
        assert_eq!(sim.live_tap_count(100), 0);

        sim.deny_taps(100, false);
        engine.apply_persisted_volumes();
        let live = sim.tap(100).expect("tap after retry");
        assert_eq!(live.gain, 0.3);
        assert!(live.muted);
        assert_eq!(sim.activation_count(100), 1);
    }

    #[test]
    fn live_change_without_tap_is_pushed_on_list_change() {
        let sim = SimulatedAudio::new();
        sim.add_process(10, 100, Some("com.app.x"));
        sim.deny_taps(100, true);
        let mut engine = engine_with(&sim, MemorySettingsStore::new());
        engine.start();
        let x = app(&engine, 100);
        engine.set_volume(&x, 0.3);

        sim.deny_taps(100, false);
        sim.add_process(11, 101, None);
        assert!(engine.refresh());
        assert_eq!(sim.tap(100).map(|t| t.gain), Some(0.3));
        assert_eq!(engine.snapshot().tapped_pids, [100]);
    }

    #[test]
    fn reused_pid_without_tap_does_not_inherit_state() {
        let sim = SimulatedAudio::new();
        sim.add_process(10, 100, Some("com.app.x"));
        sim.deny_taps(100, true);
        let mut engine = engine_with(&sim, MemorySettingsStore::with_volumes([("com.app.y", 0.2)]));
        engine.start();
        let x = app(&engine, 100);
        engine.set_volume(&x, 1.8);
        assert_eq!(engine.snapshot().applied_pids, [100]);

        sim.deny_taps(100, false);
        sim.remove_process(10);
        sim.add_process(11, 100, Some("com.app.y"));
        assert!(engine.refresh());

        let y = app(&engine, 100);
        assert_eq!(sim.tap(100).map(|t| t.gain), Some(0.2));
        assert_eq!(engine.get_volume(&y), 0.2);
        assert_eq!(engine.snapshot().applied_pids, [100]);
        assert_eq!(engine.store_volume("com.app.x"), Some(1.8));
    }

    #[test]
    fn reused_pid_without_saved_settings_starts_neutral() {
        let sim = SimulatedAudio::new();
        sim.add_process(10, 100, Some("com.app.x"));
        sim.deny_taps(100, true);
        let mut engine = engine_with(&sim, MemorySettingsStore::new());
        engine.start();
        let x = app(&engine, 100);
        engine.set_volume(&x, 1.8);
        engine.set_mute(&x, true);

        sim.remove_process(10);
        sim.add_process(11, 100, Some("com.app.y"));
        assert!(engine.refresh());

        let y = app(&engine, 100);
        assert_eq!(engine.get_volume(&y), 1.0);
        assert!(!engine.is_muted(&y));
        assert!(engine.snapshot().applied_pids.is_empty());
    }

    #[test]
    fn vanished_process_loses_tap_and_cache_but_not_persisted_value() {
        let sim = SimulatedAudio::new();
        sim.add_process(10, 100, Some("com.app.x"));
        let mut engine = engine_with(&sim, MemorySettingsStore::new());
        engine.start();
        let x = app(&engine, 100);
        engine.set_volume(&x, 1.4);

        sim.remove_process(10);
        assert!(engine.refresh());

        assert!(engine.snapshot().tapped_pids.is_empty());
        assert!(engine.snapshot().applied_pids.is_empty());
        assert_eq!(sim.release_count(100), 1);
        assert_eq!(engine.get_volume(&x), 1.0);

        sim.add_process(20, 205, Some("com.app.x"));
        assert!(engine.refresh());
        assert_eq!(sim.tap(205).map(|t| t.gain), Some(1.4));
    }

    #[test]
    fn reused_pid_with_new_identity_gets_fresh_state() {
        let sim = SimulatedAudio::new();
        sim.add_process(10, 100, Some("com.app.x"));
        let mut engine = engine_with(&sim, MemorySettingsStore::with_volumes([("com.app.y", 0.2)]));
        engine.start();
        let x = app(&engine, 100);
        engine.set_volume(&x, 1.8);

        sim.remove_process(10);
        sim.add_process(11, 100, Some("com.app.y"));
        assert!(engine.refresh());

        assert_eq!(sim.release_count(100), 1);
        assert_eq!(sim.tap(100).map(|t| t.gain), Some(0.2));
        assert_eq!(engine.get_volume(&app(&engine, 100)), 0.2);
    }

    #[test]
    fn stop_invalidates_everything_and_restart_reapplies() {
        let sim = SimulatedAudio::new();
        sim.add_process(10, 100, Some("com.app.x"));
        sim.add_process(11, 101, Some("com.app.y"));
        let mut engine = engine_with(&sim, MemorySettingsStore::with_volumes([("com.app.x", 0.6)]));
        engine.start();
        let y = app(&engine, 101);
        engine.set_volume(&y, 0.9);

        engine.stop();
        engine.stop();
        assert_eq!(sim.total_live_taps(), 0);
        assert_eq!(sim.release_count(100), 1);
        assert_eq!(sim.release_count(101), 1);
        assert_eq!(sim.process_list_listener_count(), 0);
        assert_eq!(sim.running_listener_count(), 0);

        engine.start();
        assert_eq!(sim.tap(100).map(|t| t.gain), Some(0.6));
        assert_eq!(sim.tap(101).map(|t| t.gain), Some(0.9));
    }

    #[test]
    fn set_volume_while_stopped_is_persisted_for_next_start() {
        let sim = SimulatedAudio::new();
        sim.add_process(10, 100, Some("com.app.x"));
        let mut engine = engine_with(&sim, MemorySettingsStore::new());
        engine.start();
        let x = app(&engine, 100);
        engine.stop();

        engine.set_volume(&x, 0.7);
        assert_eq!(sim.total_live_taps(), 0);

        engine.start();
        assert_eq!(sim.tap(100).map(|t| t.gain), Some(0.7));
    }

    #[test]
    fn mute_and_device_are_applied_and_restored() {
        let sim = SimulatedAudio::new();
        sim.set_devices(vec![OutputDevice {
            uid: "headphones".into(),
            name: "Headphones".into(),
        }]);
        sim.add_process(10, 100, Some("com.app.x"));
        let mut engine = engine_with(&sim, MemorySettingsStore::new());
        engine.start();
        let x = app(&engine, 100);

        engine.set_mute(&x, true);
        engine.set_device(&x, "headphones");
        let live = sim.tap(100).expect("tap");
        assert!(live.muted);
        assert_eq!(live.device.as_deref(), Some("headphones"));
        assert_eq!(live.gain, 1.0);
        assert!(engine.is_muted(&x));
        assert_eq!(engine.device_uid(&x).as_deref(), Some("headphones"));

        sim.remove_process(10);
        engine.refresh();
        sim.add_process(20, 200, Some("com.app.x"));
        engine.refresh();

        let restored = sim.tap(200).expect("restored tap");
        assert!(restored.muted);
        assert_eq!(restored.device.as_deref(), Some("headphones"));
    }

    #[test]
    fn find_app_matches_bundle_or_name_identifier() {
        let sim = SimulatedAudio::new();
        sim.add_process(10, 100, Some("org.mozilla.firefox"));
        sim.add_process(11, 101, None);
        sim.set_app_name(101, "mpv");
        let mut engine = engine_with(&sim, MemorySettingsStore::new());
        engine.start();

        assert_eq!(engine.find_app("org.mozilla.firefox").map(|a| a.pid), Some(100));
        assert_eq!(engine.find_app("name:mpv").map(|a| a.pid), Some(101));
        assert!(engine.find_app("mpv").is_none());
    }

    #[test]
    fn tracked_taps_stay_within_active_set() {
        let sim = SimulatedAudio::new();
        let mut engine = engine_with(&sim, MemorySettingsStore::new());
        engine.start();

        for round in 0..6u32 {
            let object = 10 + round;
            let pid = 100 + round;
            sim.add_process(object, pid, None);
            engine.refresh();
            let new_app = app(&engine, pid);
            engine.set_volume(&new_app, 0.5);
            if round % 2 == 1 {
                sim.remove_process(object - 1);
                sim.set_running(object, false);
            }
            engine.refresh();

            let active: HashSet<u32> = engine.apps().iter().map(|a| a.pid).collect();
            for pid in engine.snapshot().tapped_pids {
                assert!(active.contains(&pid), "tap for inactive pid {pid}");
                assert_eq!(sim.live_tap_count(pid), 1);
            }
        }
    }
}
