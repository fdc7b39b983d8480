//! PipeWire backend.
//!
//! Strategy:
//! 1. A dedicated thread owns the PipeWire main loop, the registry and every
//!    proxy; other threads only talk to it through `pw::channel`
//! 2. Nodes with `media.class = "Stream/Output/Audio"` are the process
//!    objects (object id = node id); `Audio/Sink` nodes are output devices
//! 3. Node info `state` drives the running flag
//! 4. A tap writes `channelVolumes`/`mute` Props on the stream node; routing
//!    writes `target.object` into the `default` metadata

use super::apps::SysinfoApps;
use super::{
    AudioObjectId, AudioSystem, Backend, Listener, ListenerToken, OutputDevice, TapBackend,
    TapHandle,
};
use crate::error::{RoutingError, SystemError, TapActivationError};
use crate::process::AudioProcess;
use crate::volume_mapping::UNITY_GAIN;
use pipewire as pw;
use pw::spa::utils::dict::DictRef;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const STREAM_CLASS: &str = "Stream/Output/Audio";
const SINK_CLASS: &str = "Audio/Sink";
const DEFAULT_CHANNELS: usize = 2;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub(super) fn backend() -> anyhow::Result<Backend> {
    let system = Arc::new(PipewireSystem::connect()?);
    Ok(Backend {
        system: system.clone(),
        apps: Box::new(SysinfoApps::new()),
        taps: system,
    })
}

#[derive(Debug, Clone)]
struct StreamNode {
    pid: Option<u32>,
    bundle_id: Option<String>,
    app_name: Option<String>,
    icon_name: Option<String>,
    channels: usize,
    running: bool,
}

impl StreamNode {
    fn new() -> Self {
        Self {
            pid: None,
            bundle_id: None,
            app_name: None,
            icon_name: None,
            channels: DEFAULT_CHANNELS,
            running: false,
        }
    }

    /// Merge properties from a registry global or a node info event.
    fn update_from(&mut self, props: &DictRef) {
        if let Some(pid) = props
            .get("application.process.id")
            .and_then(|pid| pid.parse().ok())
        {
            self.pid = Some(pid);
        }
        if let Some(bundle_id) = props
            .get("application.id")
            .or_else(|| props.get("pipewire.access.portal.app_id"))
            .or_else(|| props.get("application.process.binary"))
        {
            self.bundle_id = Some(bundle_id.to_string());
        }
        if let Some(name) = props.get("application.name") {
            self.app_name = Some(name.to_string());
        }
        if let Some(icon) = props.get("application.icon-name") {
            self.icon_name = Some(icon.to_string());
        }
        if let Some(channels) = props
            .get("audio.channels")
            .and_then(|channels| channels.parse::<usize>().ok())
            .filter(|channels| *channels > 0)
        {
            self.channels = channels;
        }
    }
}

/// State mirrored out of the PipeWire thread.
#[derive(Default)]
struct Shared {
    connected: bool,
    nodes: BTreeMap<AudioObjectId, StreamNode>,
    sinks: BTreeMap<AudioObjectId, OutputDevice>,
    next_token: u64,
    list_listeners: HashMap<u64, Listener>,
    running_listeners: HashMap<u64, (AudioObjectId, Listener)>,
}

type SharedState = Arc<Mutex<Shared>>;

fn lock(state: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn fire_list_listeners(state: &SharedState) {
    let listeners: Vec<Listener> = lock(state).list_listeners.values().cloned().collect();
    for listener in listeners {
        listener();
    }
}

enum PwCommand {
    Props {
        node: AudioObjectId,
        gain: f32,
        muted: bool,
        channels: usize,
    },
    Route {
        node: AudioObjectId,
        target: Option<String>,
    },
    Quit,
}

pub struct PipewireSystem {
    state: SharedState,
    commands: Mutex<pw::channel::Sender<PwCommand>>,
    thread: Option<JoinHandle<()>>,
}

impl PipewireSystem {
    /// Spawn the PipeWire thread and wait until the initial registry
    /// contents, including node states, have arrived.
    fn connect() -> anyhow::Result<Self> {
        let state = SharedState::default();
        let (sender, receiver) = pw::channel::channel::<PwCommand>();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), String>>();

        let thread_state = state.clone();
        let handle = thread::Builder::new()
            .name("finetune-pipewire".into())
            .spawn(move || {
                if let Err(err) = run_loop(thread_state.clone(), receiver, ready_tx.clone()) {
                    error!(error = %err, "PipeWire loop failed");
                    let _ = ready_tx.send(Err(err.to_string()));
                }
                lock(&thread_state).connected = false;
                debug!("PipeWire thread exited");
            })?;

        let failure = match ready_rx.recv_timeout(CONNECT_TIMEOUT) {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(format!("Failed to connect to PipeWire: {err}")),
            Err(_) => Some("Timed out connecting to PipeWire".to_string()),
        };
        if let Some(failure) = failure {
            let _ = sender.send(PwCommand::Quit);
            anyhow::bail!(failure);
        }

        {
            let shared = lock(&state);
            info!(
                streams = shared.nodes.len(),
                sinks = shared.sinks.len(),
                "Connected to PipeWire"
            );
        }
        Ok(Self {
            state,
            commands: Mutex::new(sender),
            thread: Some(handle),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        lock(&self.state)
    }

    fn sender(&self) -> pw::channel::Sender<PwCommand> {
        self.commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn node_property<T>(
        &self,
        object: AudioObjectId,
        property: &'static str,
        read: impl FnOnce(&StreamNode) -> Option<T>,
    ) -> Result<T, SystemError> {
        let shared = self.lock();
        if !shared.connected {
            return Err(SystemError::Disconnected);
        }
        shared
            .nodes
            .get(&object)
            .and_then(read)
            .ok_or(SystemError::PropertyRead { object, property })
    }

    fn register(&self, object: Option<AudioObjectId>, listener: Listener) -> ListenerToken {
        let mut shared = self.lock();
        shared.next_token += 1;
        let token = shared.next_token;
        match object {
            Some(object) => {
                shared.running_listeners.insert(token, (object, listener));
            }
            None => {
                shared.list_listeners.insert(token, listener);
            }
        }
        ListenerToken(token)
    }
}

impl Drop for PipewireSystem {
    fn drop(&mut self) {
        let _ = self.sender().send(PwCommand::Quit);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl AudioSystem for PipewireSystem {
    fn process_objects(&self) -> Result<Vec<AudioObjectId>, SystemError> {
        let shared = self.lock();
        if !shared.connected {
            return Err(SystemError::Disconnected);
        }
        Ok(shared.nodes.keys().copied().collect())
    }

    fn is_running(&self, object: AudioObjectId) -> Result<bool, SystemError> {
        self.node_property(object, "node.state", |node| Some(node.running))
    }

    fn process_id(&self, object: AudioObjectId) -> Result<u32, SystemError> {
        self.node_property(object, "application.process.id", |node| node.pid)
    }

    fn bundle_id(&self, object: AudioObjectId) -> Result<Option<String>, SystemError> {
        self.node_property(object, "application.id", |node| Some(node.bundle_id.clone()))
    }

    fn app_name(&self, object: AudioObjectId) -> Option<String> {
        self.lock()
            .nodes
            .get(&object)
            .and_then(|node| node.app_name.clone())
    }

    fn icon_name(&self, object: AudioObjectId) -> Option<String> {
        self.lock()
            .nodes
            .get(&object)
            .and_then(|node| node.icon_name.clone())
    }

    fn add_process_list_listener(&self, listener: Listener) -> Result<ListenerToken, SystemError> {
        if !self.lock().connected {
            return Err(SystemError::Disconnected);
        }
        Ok(self.register(None, listener))
    }

    fn add_running_listener(
        &self,
        object: AudioObjectId,
        listener: Listener,
    ) -> Result<ListenerToken, SystemError> {
        if !self.lock().nodes.contains_key(&object) {
            return Err(SystemError::ListenerRegistration { object });
        }
        Ok(self.register(Some(object), listener))
    }

    fn remove_listener(&self, token: ListenerToken) {
        let mut shared = self.lock();
        shared.list_listeners.remove(&token.0);
        shared.running_listeners.remove(&token.0);
    }

    fn output_devices(&self) -> Result<Vec<OutputDevice>, SystemError> {
        let shared = self.lock();
        if !shared.connected {
            return Err(SystemError::Disconnected);
        }
        Ok(shared.sinks.values().cloned().collect())
    }
}

impl TapBackend for PipewireSystem {
    fn create_tap(&self, process: &AudioProcess) -> Result<Box<dyn TapHandle>, TapActivationError> {
        let pid = process.pid;
        let channels = {
            let shared = self.lock();
            if !shared.connected {
                return Err(TapActivationError::Denied {
                    pid,
                    reason: "PipeWire connection lost".into(),
                });
            }
            match shared.nodes.get(&process.object_id) {
                Some(node) if node.pid == Some(pid) => node.channels,
                _ => return Err(TapActivationError::ProcessGone { pid }),
            }
        };

        Ok(Box::new(PipewireTap {
            node: process.object_id,
            pid,
            channels,
            gain: UNITY_GAIN,
            muted: false,
            routed: false,
            commands: self.sender(),
            state: self.state.clone(),
        }))
    }
}

/// Volume control on one stream node.
struct PipewireTap {
    node: AudioObjectId,
    pid: u32,
    channels: usize,
    gain: f32,
    muted: bool,
    routed: bool,
    commands: pw::channel::Sender<PwCommand>,
    state: SharedState,
}

impl PipewireTap {
    fn send(&self, command: PwCommand) {
        if self.commands.send(command).is_err() {
            debug!(pid = self.pid, "PipeWire thread gone; tap update dropped");
        }
    }

    fn push_props(&self) {
        self.send(PwCommand::Props {
            node: self.node,
            gain: self.gain,
            muted: self.muted,
            channels: self.channels,
        });
    }
}

impl TapHandle for PipewireTap {
    fn set_gain(&mut self, gain: f32) {
        self.gain = gain;
        self.push_props();
    }

    fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
        self.push_props();
    }

    fn route_to(&mut self, device_uid: &str) -> Result<(), RoutingError> {
        let known = lock(&self.state)
            .sinks
            .values()
            .any(|device| device.uid == device_uid);
        if !known {
            return Err(RoutingError::UnknownDevice(device_uid.to_string()));
        }
        self.send(PwCommand::Route {
            node: self.node,
            target: Some(device_uid.to_string()),
        });
        self.routed = true;
        Ok(())
    }

    fn release(mut self: Box<Self>) {
        self.gain = UNITY_GAIN;
        self.muted = false;
        self.push_props();
        if self.routed {
            self.send(PwCommand::Route {
                node: self.node,
                target: None,
            });
        }
        debug!(pid = self.pid, node = self.node, "Released PipeWire tap");
    }
}

/// Proxies owned by the PipeWire thread.
#[derive(Default)]
struct Proxies {
    streams: HashMap<AudioObjectId, (pw::node::Node, pw::node::NodeListener)>,
    metadata: Option<pw::metadata::Metadata>,
}

impl Proxies {
    fn set_props(&self, node: AudioObjectId, gain: f32, muted: bool, channels: usize) {
        let Some((proxy, _)) = self.streams.get(&node) else {
            debug!(node, "Stream gone; volume not applied");
            return;
        };
        let bytes = match props_pod(gain, muted, channels) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(node, error = ?err, "Failed to build Props pod");
                return;
            }
        };
        match pw::spa::pod::Pod::from_bytes(&bytes) {
            Some(pod) => proxy.set_param(pw::spa::param::ParamType::Props, 0, pod),
            None => warn!(node, "Invalid Props pod"),
        }
    }

    fn route(&self, node: AudioObjectId, target: Option<&str>) {
        match &self.metadata {
            Some(metadata) => metadata.set_property(node, "target.object", None, target),
            None => warn!(node, "No default metadata; cannot route stream"),
        }
    }
}

fn props_pod(
    gain: f32,
    muted: bool,
    channels: usize,
) -> Result<Vec<u8>, pw::spa::pod::serialize::GenError> {
    use pw::spa::pod::serialize::PodSerializer;
    use pw::spa::pod::{Object, Property, PropertyFlags, Value, ValueArray};

    let value = Value::Object(Object {
        type_: pw::spa::utils::SpaTypes::ObjectParamProps.as_raw(),
        id: pw::spa::param::ParamType::Props.as_raw(),
        properties: vec![
            Property {
                key: pw::spa::sys::SPA_PROP_channelVolumes,
                flags: PropertyFlags::empty(),
                value: Value::ValueArray(ValueArray::Float(vec![gain; channels.max(1)])),
            },
            Property {
                key: pw::spa::sys::SPA_PROP_mute,
                flags: PropertyFlags::empty(),
                value: Value::Bool(muted),
            },
        ],
    });
    Ok(PodSerializer::serialize(std::io::Cursor::new(Vec::new()), &value)?
        .0
        .into_inner())
}

fn run_loop(
    state: SharedState,
    receiver: pw::channel::Receiver<PwCommand>,
    ready: std::sync::mpsc::Sender<Result<(), String>>,
) -> Result<(), pw::Error> {
    pw::init();
    let mainloop = pw::main_loop::MainLoop::new(None)?;
    let context = pw::context::Context::new(&mainloop)?;
    let core = Rc::new(context.connect(None)?);
    let registry = Rc::new(core.get_registry()?);
    let proxies: Rc<RefCell<Proxies>> = Rc::default();

    let mainloop_weak = mainloop.downgrade();
    let command_proxies = proxies.clone();
    let _receiver = receiver.attach(mainloop.loop_(), move |command| match command {
        PwCommand::Props {
            node,
            gain,
            muted,
            channels,
        } => command_proxies.borrow().set_props(node, gain, muted, channels),
        PwCommand::Route { node, target } => {
            command_proxies.borrow().route(node, target.as_deref())
        }
        PwCommand::Quit => {
            if let Some(mainloop) = mainloop_weak.upgrade() {
                mainloop.quit();
            }
        }
    });

    let registry_weak = Rc::downgrade(&registry);
    let global_state = state.clone();
    let global_proxies = proxies.clone();
    let remove_state = state.clone();
    let remove_proxies = proxies.clone();
    let _registry_listener = registry
        .add_listener_local()
        .global(move |global| {
            if let Some(registry) = registry_weak.upgrade() {
                on_global(&registry, global, &global_state, &global_proxies);
            }
        })
        .global_remove(move |id| on_global_remove(id, &remove_state, &remove_proxies))
        .register();

    // Stream node info arrives one round trip after the globals, so the
    // connection counts as ready on the second `done`.
    let ready = RefCell::new(Some(ready));
    let syncs = Cell::new(0u32);
    let sync_core = core.clone();
    let error_mainloop = mainloop.downgrade();
    let _core_listener = core
        .add_listener_local()
        .done(move |id, _seq| {
            if id != pw::core::PW_ID_CORE {
                return;
            }
            syncs.set(syncs.get() + 1);
            if syncs.get() == 1 {
                if let Err(err) = sync_core.sync(0) {
                    warn!(error = %err, "PipeWire sync failed");
                }
                return;
            }
            if let Some(ready) = ready.borrow_mut().take() {
                let _ = ready.send(Ok(()));
            }
        })
        .error(move |id, seq, res, message| {
            error!(id, seq, res, detail = message, "PipeWire error");
            if id == pw::core::PW_ID_CORE {
                if let Some(mainloop) = error_mainloop.upgrade() {
                    mainloop.quit();
                }
            }
        })
        .register();

    lock(&state).connected = true;
    core.sync(0)?;
    mainloop.run();
    Ok(())
}

fn on_global(
    registry: &pw::registry::Registry,
    global: &pw::registry::GlobalObject<&DictRef>,
    state: &SharedState,
    proxies: &Rc<RefCell<Proxies>>,
) {
    let Some(props) = global.props else {
        return;
    };
    match global.type_ {
        pw::types::ObjectType::Node => match props.get("media.class") {
            Some(STREAM_CLASS) => bind_stream(registry, global, props, state, proxies),
            Some(SINK_CLASS) => {
                let Some(uid) = props.get("node.name") else {
                    return;
                };
                let name = props
                    .get("node.description")
                    .or_else(|| props.get("node.nick"))
                    .unwrap_or(uid);
                debug!(node = global.id, uid, "Output device added");
                lock(state).sinks.insert(
                    global.id,
                    OutputDevice {
                        uid: uid.to_string(),
                        name: name.to_string(),
                    },
                );
            }
            _ => {}
        },
        pw::types::ObjectType::Metadata if props.get("metadata.name") == Some("default") => {
            match registry.bind::<pw::metadata::Metadata, _>(global) {
                Ok(metadata) => proxies.borrow_mut().metadata = Some(metadata),
                Err(err) => warn!(error = %err, "Failed to bind default metadata"),
            }
        }
        _ => {}
    }
}

fn bind_stream(
    registry: &pw::registry::Registry,
    global: &pw::registry::GlobalObject<&DictRef>,
    props: &DictRef,
    state: &SharedState,
    proxies: &Rc<RefCell<Proxies>>,
) {
    let id = global.id;
    let node: pw::node::Node = match registry.bind(global) {
        Ok(node) => node,
        Err(err) => {
            warn!(node = id, error = %err, "Failed to bind stream node");
            return;
        }
    };

    let info_state = state.clone();
    let listener = node
        .add_listener_local()
        .info(move |info| on_node_info(id, info, &info_state))
        .register();
    proxies.borrow_mut().streams.insert(id, (node, listener));

    let mut entry = StreamNode::new();
    entry.update_from(props);
    debug!(node = id, pid = ?entry.pid, "Stream added");
    lock(state).nodes.insert(id, entry);
    fire_list_listeners(state);
}

fn on_node_info(id: AudioObjectId, info: &pw::node::NodeInfoRef, state: &SharedState) {
    let running = matches!(info.state(), pw::node::NodeState::Running);
    let listeners: Vec<Listener> = {
        let mut shared = lock(state);
        let Some(entry) = shared.nodes.get_mut(&id) else {
            return;
        };
        if let Some(props) = info.props() {
            entry.update_from(props);
        }
        if entry.running == running {
            return;
        }
        entry.running = running;
        shared
            .running_listeners
            .values()
            .filter(|(object, _)| *object == id)
            .map(|(_, listener)| listener.clone())
            .collect()
    };
    debug!(node = id, running, "Stream state changed");
    for listener in listeners {
        listener();
    }
}

fn on_global_remove(id: u32, state: &SharedState, proxies: &Rc<RefCell<Proxies>>) {
    proxies.borrow_mut().streams.remove(&id);
    let was_stream = {
        let mut shared = lock(state);
        shared.sinks.remove(&id);
        shared.nodes.remove(&id).is_some()
    };
    if was_stream {
        debug!(node = id, "Stream removed");
        fire_list_listeners(state);
    }
}
