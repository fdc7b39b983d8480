//! Tracks which processes are producing audio right now.
//!
//! The monitor never reacts to an OS notification inline. Every listener it
//! registers only calls the [`Notifier`], which posts a [`RefreshTrigger`] to
//! the engine's queue; the engine later calls [`ProcessMonitor::refresh`] from
//! its own task. Refreshes therefore never overlap.

use crate::audio::{AudioObjectId, AudioSystem, Listener, ListenerToken, RunningApps};
use crate::process::{self, AudioProcess, IconRef};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Why a refresh was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshTrigger {
    /// The global process object list changed.
    ProcessList,
    /// One object's running state changed.
    ProcessRunning(AudioObjectId),
}

/// Posts a refresh request onto the confined context. Called from whatever
/// thread the audio subsystem delivers notifications on.
pub type Notifier = Arc<dyn Fn(RefreshTrigger) + Send + Sync>;

pub struct ProcessMonitor {
    system: Arc<dyn AudioSystem>,
    apps: Box<dyn RunningApps>,
    notifier: Notifier,
    own_pid: u32,
    started: bool,
    active: Vec<AudioProcess>,
    list_listener: Option<ListenerToken>,
    object_listeners: HashMap<AudioObjectId, ListenerToken>,
    refreshes: u64,
}

impl ProcessMonitor {
    pub fn new(system: Arc<dyn AudioSystem>, apps: Box<dyn RunningApps>, notifier: Notifier) -> Self {
        Self {
            system,
            apps,
            notifier,
            own_pid: std::process::id(),
            started: false,
            active: Vec::new(),
            list_listener: None,
            object_listeners: HashMap::new(),
            refreshes: 0,
        }
    }

    /// Override the pid treated as "ourselves" and excluded from the list.
    pub fn with_own_pid(mut self, pid: u32) -> Self {
        self.own_pid = pid;
        self
    }

    /// Processes currently producing audio, sorted by display name.
    pub fn active_processes(&self) -> &[AudioProcess] {
        &self.active
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Objects with a running-state listener registered.
    pub fn monitored_objects(&self) -> BTreeSet<AudioObjectId> {
        self.object_listeners.keys().copied().collect()
    }

    pub fn refresh_count(&self) -> u64 {
        self.refreshes
    }

    /// Initial refresh, then subscribe to list and per-object changes.
    /// Calling it again while started does nothing.
    pub fn start(&mut self) {
        if self.started {
            debug!("Audio process monitor already started");
            return;
        }
        info!("Starting audio process monitor");
        self.started = true;

        self.refresh();

        let notify = self.notifier.clone();
        let listener: Listener = Arc::new(move || notify(RefreshTrigger::ProcessList));
        match self.system.add_process_list_listener(listener) {
            Ok(token) => self.list_listener = Some(token),
            Err(err) => error!(error = %err, "Failed to add process list listener"),
        }
    }

    /// Unregister every listener. Safe to call when not started.
    pub fn stop(&mut self) {
        if !self.started {
            return;
        }
        info!("Stopping audio process monitor");

        if let Some(token) = self.list_listener.take() {
            self.system.remove_listener(token);
        }
        for (_, token) in self.object_listeners.drain() {
            self.system.remove_listener(token);
        }
        self.started = false;
    }

    /// Re-enumerate the audio subsystem. Returns true when the active list
    /// changed.
    ///
    /// On enumeration failure the last known list is kept.
    pub fn refresh(&mut self) -> bool {
        self.refreshes += 1;

        let objects = match self.system.process_objects() {
            Ok(objects) => objects,
            Err(err) => {
                error!(error = %err, "Failed to refresh process list");
                return false;
            }
        };

        self.apps.refresh();
        let mut processes: Vec<AudioProcess> = objects
            .iter()
            .filter_map(|&object| self.resolve(object))
            .collect();
        process::sort_by_name(&mut processes);

        if self.started {
            self.update_object_listeners(&objects);
        }

        if processes == self.active {
            return false;
        }
        debug!(count = processes.len(), "Active audio processes changed");
        self.active = processes;
        true
    }

    fn resolve(&self, object: AudioObjectId) -> Option<AudioProcess> {
        match self.system.is_running(object) {
            Ok(true) => {}
            Ok(false) => return None,
            Err(err) => {
                debug!(object, error = %err, "Skipping object with unreadable running state");
                return None;
            }
        }

        let pid = match self.system.process_id(object) {
            Ok(pid) => pid,
            Err(err) => {
                debug!(object, error = %err, "Skipping object without pid");
                return None;
            }
        };
        if pid == self.own_pid {
            return None;
        }

        let bundle_id = self.system.bundle_id(object).unwrap_or_else(|err| {
            debug!(object, error = %err, "Bundle id unavailable");
            None
        });
        let running_app = self.apps.lookup(pid);
        let reported_name = self.system.app_name(object);
        let name = process::display_name(
            reported_name
                .as_deref()
                .or(running_app.as_ref().map(|app| app.name.as_str())),
            bundle_id.as_deref(),
        );
        if bundle_id.is_none() {
            debug!(pid, name = %name, "No bundle id; settings keyed by name");
        }

        let icon = match (self.system.icon_name(object), running_app) {
            (Some(icon_name), _) => IconRef::Named(icon_name),
            (None, Some(app)) => app.icon,
            (None, None) => IconRef::Generic,
        };

        Some(AudioProcess {
            pid,
            object_id: object,
            name,
            bundle_id,
            icon,
        })
    }

    /// Make the per-object listener set equal the live object set.
    fn update_object_listeners(&mut self, objects: &[AudioObjectId]) {
        let current: HashSet<AudioObjectId> = objects.iter().copied().collect();

        let removed: Vec<AudioObjectId> = self
            .object_listeners
            .keys()
            .filter(|object| !current.contains(object))
            .copied()
            .collect();
        for object in removed {
            if let Some(token) = self.object_listeners.remove(&object) {
                self.system.remove_listener(token);
            }
        }

        for &object in &current {
            if self.object_listeners.contains_key(&object) {
                continue;
            }
            let notify = self.notifier.clone();
            let listener: Listener =
                Arc::new(move || notify(RefreshTrigger::ProcessRunning(object)));
            match self.system.add_running_listener(object, listener) {
                Ok(token) => {
                    self.object_listeners.insert(object, token);
                }
                Err(err) => {
                    warn!(object, error = %err, "Failed to add is-running listener");
                }
            }
        }
    }
}

impl Drop for ProcessMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::sim::SimulatedAudio;
    use std::sync::Mutex;

    const OWN_PID: u32 = 1;

    fn monitor_for(sim: &SimulatedAudio) -> (ProcessMonitor, Arc<Mutex<Vec<RefreshTrigger>>>) {
        let triggers = Arc::new(Mutex::new(Vec::new()));
        let sink = triggers.clone();
        let notifier: Notifier = Arc::new(move |trigger| sink.lock().unwrap().push(trigger));
        let monitor = ProcessMonitor::new(Arc::new(sim.clone()), Box::new(sim.clone()), notifier)
            .with_own_pid(OWN_PID);
        (monitor, triggers)
    }

    fn names(monitor: &ProcessMonitor) -> Vec<&str> {
        monitor
            .active_processes()
            .iter()
            .map(|p| p.name.as_str())
            .collect()
    }

    #[test]
    fn start_lists_running_processes_sorted() {
        let sim = SimulatedAudio::new();
        sim.add_process(10, 100, Some("org.videolan.vlc"));
        sim.add_process(11, 101, Some("com.spotify.client"));
        sim.set_app_name(101, "Spotify");
        sim.add_idle_process(12, 102, Some("com.idle.app"));
        sim.add_process(13, OWN_PID, Some("com.finetune"));

        let (mut monitor, _) = monitor_for(&sim);
        monitor.start();

        assert_eq!(names(&monitor), ["Spotify", "vlc"]);
        assert_eq!(sim.process_list_listener_count(), 1);
        assert_eq!(monitor.monitored_objects(), BTreeSet::from([10, 11, 12, 13]));
        assert_eq!(sim.watched_objects(), monitor.monitored_objects());
    }

    #[test]
    fn start_twice_registers_once() {
        let sim = SimulatedAudio::new();
        sim.add_process(10, 100, None);
        let (mut monitor, _) = monitor_for(&sim);

        monitor.start();
        monitor.start();

        assert_eq!(sim.process_list_listener_count(), 1);
        assert_eq!(sim.running_listener_count(), 1);
        assert_eq!(monitor.refresh_count(), 1);
    }

    #[test]
    fn stop_unregisters_everything_and_tolerates_repeats() {
        let sim = SimulatedAudio::new();
        sim.add_process(10, 100, None);
        sim.add_process(11, 101, None);
        let (mut monitor, _) = monitor_for(&sim);

        monitor.stop();
        monitor.start();
        monitor.stop();
        monitor.stop();

        assert!(!monitor.is_started());
        assert_eq!(sim.process_list_listener_count(), 0);
        assert_eq!(sim.running_listener_count(), 0);
        assert!(monitor.monitored_objects().is_empty());
    }

    #[test]
    fn notifications_only_post_triggers() {
        let sim = SimulatedAudio::new();
        sim.add_idle_process(10, 100, None);
        let (mut monitor, triggers) = monitor_for(&sim);
        monitor.start();

        sim.set_running(10, true);
        sim.add_process(11, 101, None);

        assert!(monitor.active_processes().is_empty());
        assert_eq!(
            *triggers.lock().unwrap(),
            [
                RefreshTrigger::ProcessRunning(10),
                RefreshTrigger::ProcessList
            ]
        );

        assert!(monitor.refresh());
        assert_eq!(monitor.active_processes().len(), 2);
    }

    #[test]
    fn listener_set_follows_object_set() {
        let sim = SimulatedAudio::new();
        sim.add_process(10, 100, None);
        sim.add_process(11, 101, None);
        let (mut monitor, _) = monitor_for(&sim);
        monitor.start();

        sim.remove_process(10);
        sim.add_idle_process(12, 102, None);
        monitor.refresh();

        assert_eq!(monitor.monitored_objects(), BTreeSet::from([11, 12]));
        assert_eq!(sim.watched_objects(), BTreeSet::from([11, 12]));
    }

    #[test]
    fn failed_listener_registration_is_retried() {
        let sim = SimulatedAudio::new();
        sim.add_process(10, 100, None);
        sim.fail_listener_registration(10, true);
        let (mut monitor, _) = monitor_for(&sim);
        monitor.start();

        assert_eq!(monitor.active_processes().len(), 1);
        assert!(monitor.monitored_objects().is_empty());

        sim.fail_listener_registration(10, false);
        monitor.refresh();
        assert_eq!(monitor.monitored_objects(), BTreeSet::from([10]));
    }

    #[test]
    fn enumeration_failure_keeps_last_known_list() {
        let sim = SimulatedAudio::new();
        sim.add_process(10, 100, Some("com.app.x"));
        let (mut monitor, _) = monitor_for(&sim);
        monitor.start();

        sim.fail_enumeration(true);
        sim.remove_process(10);
        assert!(!monitor.refresh());
        assert_eq!(names(&monitor), ["x"]);

        sim.fail_enumeration(false);
        assert!(monitor.refresh());
        assert!(monitor.active_processes().is_empty());
    }

    #[test]
    fn unchanged_refresh_reports_no_change() {
        let sim = SimulatedAudio::new();
        sim.add_process(10, 100, None);
        let (mut monitor, _) = monitor_for(&sim);
        monitor.start();
        assert!(!monitor.refresh());
    }

    #[test]
    fn name_falls_back_to_unknown() {
        let sim = SimulatedAudio::new();
        sim.add_process(10, 100, None);
        let (mut monitor, _) = monitor_for(&sim);
        monitor.start();

        let app = &monitor.active_processes()[0];
        assert_eq!(app.name, process::UNKNOWN_NAME);
        assert_eq!(app.persistence_identifier(), "name:Unknown");
        assert_eq!(app.icon, IconRef::Generic);
    }

    #[test]
    fn refresh_while_stopped_registers_no_listeners() {
        let sim = SimulatedAudio::new();
        sim.add_process(10, 100, None);
        let (mut monitor, _) = monitor_for(&sim);

        assert!(monitor.refresh());
        assert_eq!(sim.running_listener_count(), 0);
    }
}
