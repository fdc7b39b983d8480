//! Simulated audio subsystem.
//!
//! Behaves like an OS backend: process objects come and go, listeners fire
//! synchronously on whichever thread mutated the simulation, and taps hold a
//! record until released. Failure injection covers every recoverable error
//! the engine has to survive.

use super::{
    AudioObjectId, AudioSystem, Listener, ListenerToken, OutputDevice, RunningApp, RunningApps,
    TapBackend, TapHandle,
};
use crate::error::{RoutingError, SystemError, TapActivationError};
use crate::process::{AudioProcess, IconRef};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Observable state of one live simulated tap.
#[derive(Debug, Clone, PartialEq)]
pub struct SimTap {
    pub gain: f32,
    pub muted: bool,
    pub device: Option<String>,
}

struct SimObject {
    pid: u32,
    bundle_id: Option<String>,
    running: bool,
}

#[derive(Default)]
struct SimState {
    objects: BTreeMap<AudioObjectId, SimObject>,
    app_names: HashMap<u32, String>,
    devices: Vec<OutputDevice>,

    next_token: u64,
    list_listeners: HashMap<u64, Listener>,
    running_listeners: HashMap<u64, (AudioObjectId, Listener)>,

    fail_enumeration: bool,
    failing_listeners: HashSet<AudioObjectId>,
    denied_pids: HashSet<u32>,

    next_tap: u64,
    taps: HashMap<u64, (u32, SimTap)>,
    activations: HashMap<u32, u32>,
    releases: HashMap<u32, u32>,
}

/// Shared handle to a simulated audio subsystem. Clones see the same state.
#[derive(Clone, Default)]
pub struct SimulatedAudio {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedAudio {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a running process object and announce the list change.
    pub fn add_process(&self, object: AudioObjectId, pid: u32, bundle_id: Option<&str>) {
        self.insert_object(object, pid, bundle_id, true);
        self.fire_process_list();
    }

    /// Add a process object that is not (yet) running audio I/O.
    pub fn add_idle_process(&self, object: AudioObjectId, pid: u32, bundle_id: Option<&str>) {
        self.insert_object(object, pid, bundle_id, false);
        self.fire_process_list();
    }

    fn insert_object(&self, object: AudioObjectId, pid: u32, bundle_id: Option<&str>, running: bool) {
        self.lock().objects.insert(
            object,
            SimObject {
                pid,
                bundle_id: bundle_id.map(str::to_string),
                running,
            },
        );
    }

    /// Drop a process object without any running-state notification, the way
    /// an exiting process simply vanishes from the list.
    pub fn remove_process(&self, object: AudioObjectId) {
        self.lock().objects.remove(&object);
        self.fire_process_list();
    }

    pub fn set_running(&self, object: AudioObjectId, running: bool) {
        let listeners: Vec<Listener> = {
            let mut state = self.lock();
            if let Some(entry) = state.objects.get_mut(&object) {
                entry.running = running;
            }
            state
                .running_listeners
                .values()
                .filter(|(target, _)| *target == object)
                .map(|(_, listener)| listener.clone())
                .collect()
        };
        for listener in listeners {
            listener();
        }
    }

    /// Register the name the OS process table reports for `pid`.
    pub fn set_app_name(&self, pid: u32, name: &str) {
        self.lock().app_names.insert(pid, name.to_string());
    }

    pub fn set_devices(&self, devices: Vec<OutputDevice>) {
        self.lock().devices = devices;
    }

    pub fn fail_enumeration(&self, fail: bool) {
        self.lock().fail_enumeration = fail;
    }

    pub fn fail_listener_registration(&self, object: AudioObjectId, fail: bool) {
        let mut state = self.lock();
        if fail {
            state.failing_listeners.insert(object);
        } else {
            state.failing_listeners.remove(&object);
        }
    }

    pub fn deny_taps(&self, pid: u32, deny: bool) {
        let mut state = self.lock();
        if deny {
            state.denied_pids.insert(pid);
        } else {
            state.denied_pids.remove(&pid);
        }
    }

    /// The single live tap for `pid`, if there is exactly one.
    pub fn tap(&self, pid: u32) -> Option<SimTap> {
        let state = self.lock();
        let mut live = state.taps.values().filter(|(owner, _)| *owner == pid);
        match (live.next(), live.next()) {
            (Some((_, tap)), None) => Some(tap.clone()),
            _ => None,
        }
    }

    pub fn live_tap_count(&self, pid: u32) -> usize {
        self.lock().taps.values().filter(|(owner, _)| *owner == pid).count()
    }

    pub fn total_live_taps(&self) -> usize {
        self.lock().taps.len()
    }

    pub fn activation_count(&self, pid: u32) -> u32 {
        self.lock().activations.get(&pid).copied().unwrap_or(0)
    }

    pub fn release_count(&self, pid: u32) -> u32 {
        self.lock().releases.get(&pid).copied().unwrap_or(0)
    }

    pub fn process_list_listener_count(&self) -> usize {
        self.lock().list_listeners.len()
    }

    /// Objects that currently have a running-state listener registered.
    pub fn watched_objects(&self) -> BTreeSet<AudioObjectId> {
        self.lock()
            .running_listeners
            .values()
            .map(|(object, _)| *object)
            .collect()
    }

    pub fn running_listener_count(&self) -> usize {
        self.lock().running_listeners.len()
    }

    fn fire_process_list(&self) {
        let listeners: Vec<Listener> = self.lock().list_listeners.values().cloned().collect();
        for listener in listeners {
            listener();
        }
    }

    fn object_property<T>(
        &self,
        object: AudioObjectId,
        property: &'static str,
        read: impl FnOnce(&SimObject) -> T,
    ) -> Result<T, SystemError> {
        self.lock()
            .objects
            .get(&object)
            .map(read)
            .ok_or(SystemError::PropertyRead { object, property })
    }
}

impl AudioSystem for SimulatedAudio {
    fn process_objects(&self) -> Result<Vec<AudioObjectId>, SystemError> {
        let state = self.lock();
        if state.fail_enumeration {
            return Err(SystemError::Enumeration("injected failure".into()));
        }
        Ok(state.objects.keys().copied().collect())
    }

    fn is_running(&self, object: AudioObjectId) -> Result<bool, SystemError> {
        self.object_property(object, "is-running", |o| o.running)
    }

    fn process_id(&self, object: AudioObjectId) -> Result<u32, SystemError> {
        self.object_property(object, "pid", |o| o.pid)
    }

    fn bundle_id(&self, object: AudioObjectId) -> Result<Option<String>, SystemError> {
        self.object_property(object, "bundle-id", |o| o.bundle_id.clone())
    }

    fn add_process_list_listener(&self, listener: Listener) -> Result<ListenerToken, SystemError> {
        let mut state = self.lock();
        state.next_token += 1;
        let token = state.next_token;
        state.list_listeners.insert(token, listener);
        Ok(ListenerToken(token))
    }

    fn add_running_listener(
        &self,
        object: AudioObjectId,
        listener: Listener,
    ) -> Result<ListenerToken, SystemError> {
        let mut state = self.lock();
        if state.failing_listeners.contains(&object) {
            return Err(SystemError::ListenerRegistration { object });
        }
        state.next_token += 1;
        let token = state.next_token;
        state.running_listeners.insert(token, (object, listener));
        Ok(ListenerToken(token))
    }

    fn remove_listener(&self, token: ListenerToken) {
        let mut state = self.lock();
        state.list_listeners.remove(&token.0);
        state.running_listeners.remove(&token.0);
    }

    fn output_devices(&self) -> Result<Vec<OutputDevice>, SystemError> {
        Ok(self.lock().devices.clone())
    }
}

impl RunningApps for SimulatedAudio {
    fn refresh(&mut self) {}

    fn lookup(&self, pid: u32) -> Option<RunningApp> {
        self.lock().app_names.get(&pid).map(|name| RunningApp {
            name: name.clone(),
            icon: IconRef::Generic,
        })
    }
}

impl TapBackend for SimulatedAudio {
    fn create_tap(&self, process: &AudioProcess) -> Result<Box<dyn TapHandle>, TapActivationError> {
        let pid = process.pid;
        let mut state = self.lock();
        if state.denied_pids.contains(&pid) {
            return Err(TapActivationError::Denied {
                pid,
                reason: "injected failure".into(),
            });
        }
        if !state.objects.values().any(|o| o.pid == pid) {
            return Err(TapActivationError::ProcessGone { pid });
        }

        state.next_tap += 1;
        let id = state.next_tap;
        state.taps.insert(
            id,
            (
                pid,
                SimTap {
                    gain: 1.0,
                    muted: false,
                    device: None,
                },
            ),
        );
        *state.activations.entry(pid).or_default() += 1;

        Ok(Box::new(SimTapHandle {
            id,
            pid,
            sim: self.clone(),
        }))
    }
}

struct SimTapHandle {
    id: u64,
    pid: u32,
    sim: SimulatedAudio,
}

impl SimTapHandle {
    fn update(&self, apply: impl FnOnce(&mut SimTap)) {
        if let Some((_, tap)) = self.sim.lock().taps.get_mut(&self.id) {
            apply(tap);
        }
    }
}

impl TapHandle for SimTapHandle {
    fn set_gain(&mut self, gain: f32) {
        self.update(|tap| tap.gain = gain);
    }

    fn set_muted(&mut self, muted: bool) {
        self.update(|tap| tap.muted = muted);
    }

    fn route_to(&mut self, device_uid: &str) -> Result<(), RoutingError> {
        let known = self.sim.lock().devices.iter().any(|d| d.uid == device_uid);
        if !known {
            return Err(RoutingError::UnknownDevice(device_uid.to_string()));
        }
        self.update(|tap| tap.device = Some(device_uid.to_string()));
        Ok(())
    }

    fn release(self: Box<Self>) {
        let mut state = self.sim.lock();
        state.taps.remove(&self.id);
        *state.releases.entry(self.pid).or_default() += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_listener() -> (Listener, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let listener: Listener = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (listener, count)
    }

    #[test]
    fn list_listeners_fire_on_add_and_remove() {
        let sim = SimulatedAudio::new();
        let (listener, count) = counting_listener();
        let token = sim.add_process_list_listener(listener).unwrap();

        sim.add_process(1, 100, Some("com.app.x"));
        sim.remove_process(1);
        assert_eq!(count.load(Ordering::SeqCst), 2);

        sim.remove_listener(token);
        sim.add_process(2, 200, None);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn running_listener_only_fires_for_its_object() {
        let sim = SimulatedAudio::new();
        sim.add_idle_process(1, 100, None);
        sim.add_idle_process(2, 200, None);
        let (listener, count) = counting_listener();
        sim.add_running_listener(1, listener).unwrap();

        sim.set_running(2, true);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        sim.set_running(1, true);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(sim.is_running(1).unwrap());
    }

    #[test]
    fn taps_record_gain_and_release() {
        let sim = SimulatedAudio::new();
        sim.add_process(1, 100, None);
        let process = AudioProcess {
            pid: 100,
            object_id: 1,
            name: "x".into(),
            bundle_id: None,
            icon: IconRef::Generic,
        };

        let mut handle = sim.create_tap(&process).unwrap();
        handle.set_gain(0.6);
        assert_eq!(sim.tap(100).map(|t| t.gain), Some(0.6));

        handle.release();
        assert_eq!(sim.live_tap_count(100), 0);
        assert_eq!(sim.release_count(100), 1);
    }

    #[test]
    fn tap_creation_fails_for_unknown_or_denied_pid() {
        let sim = SimulatedAudio::new();
        let process = AudioProcess {
            pid: 5,
            object_id: 1,
            name: "x".into(),
            bundle_id: None,
            icon: IconRef::Generic,
        };
        assert!(matches!(
            sim.create_tap(&process),
            Err(TapActivationError::ProcessGone { pid: 5 })
        ));

        sim.add_process(1, 5, None);
        sim.deny_taps(5, true);
        assert!(matches!(
            sim.create_tap(&process),
            Err(TapActivationError::Denied { pid: 5, .. })
        ));
    }
}
