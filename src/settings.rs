//! Persisted per-application preferences.
//!
//! Keyed by persistence identifier, never by pid. Entries are never expired:
//! an application that is not running keeps its last saved values.

use crate::error::SettingsError;
use crate::volume_mapping::clamp_gain;
use fs_err as fs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const SETTINGS_VERSION: u32 = 1;

/// Durable key-value store for per-application settings.
pub trait SettingsStore: Send {
    fn load_volume(&self, identifier: &str) -> Option<f32>;
    fn save_volume(&mut self, identifier: &str, gain: f32) -> Result<(), SettingsError>;

    fn load_mute(&self, identifier: &str) -> Option<bool>;
    fn save_mute(&mut self, identifier: &str, muted: bool) -> Result<(), SettingsError>;

    fn load_device(&self, identifier: &str) -> Option<String>;
    fn save_device(&mut self, identifier: &str, device_uid: &str) -> Result<(), SettingsError>;
}

/// On-disk document shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsDocument {
    #[serde(default = "current_version")]
    pub version: u32,
    #[serde(default)]
    pub app_volumes: BTreeMap<String, f32>,
    #[serde(default)]
    pub app_mutes: BTreeMap<String, bool>,
    #[serde(default)]
    pub app_devices: BTreeMap<String, String>,
}

fn current_version() -> u32 {
    SETTINGS_VERSION
}

impl SettingsDocument {
    fn volume(&self, identifier: &str) -> Option<f32> {
        self.app_volumes.get(identifier).copied().map(clamp_gain)
    }
}

/// In-memory store. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    document: SettingsDocument,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_volumes<'a>(volumes: impl IntoIterator<Item = (&'a str, f32)>) -> Self {
        let mut store = Self::new();
        for (identifier, gain) in volumes {
            store
                .document
                .app_volumes
                .insert(identifier.to_string(), clamp_gain(gain));
        }
        store
    }
}

impl SettingsStore for MemorySettingsStore {
    fn load_volume(&self, identifier: &str) -> Option<f32> {
        self.document.volume(identifier)
    }

    fn save_volume(&mut self, identifier: &str, gain: f32) -> Result<(), SettingsError> {
        self.document
            .app_volumes
            .insert(identifier.to_string(), clamp_gain(gain));
        Ok(())
    }

    fn load_mute(&self, identifier: &str) -> Option<bool> {
        self.document.app_mutes.get(identifier).copied()
    }

    fn save_mute(&mut self, identifier: &str, muted: bool) -> Result<(), SettingsError> {
        self.document.app_mutes.insert(identifier.to_string(), muted);
        Ok(())
    }

    fn load_device(&self, identifier: &str) -> Option<String> {
        self.document.app_devices.get(identifier).cloned()
    }

    fn save_device(&mut self, identifier: &str, device_uid: &str) -> Result<(), SettingsError> {
        self.document
            .app_devices
            .insert(identifier.to_string(), device_uid.to_string());
        Ok(())
    }
}

/// JSON file store. Every save rewrites the whole file atomically.
#[derive(Debug)]
pub struct JsonSettingsStore {
    path: PathBuf,
    document: SettingsDocument,
}

impl JsonSettingsStore {
    /// Open (or lazily create) the settings file at `path`.
    ///
    /// A missing file is an empty store. A corrupt file is logged and also
    /// treated as empty; it is overwritten on the next save.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SettingsError> {
        let path = path.into();
        let document = match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<SettingsDocument>(&content) {
                Ok(document) => document,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "Ignoring unreadable settings file");
                    SettingsDocument::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => SettingsDocument::default(),
            Err(err) => return Err(err.into()),
        };
        debug!(
            path = %path.display(),
            volumes = document.app_volumes.len(),
            "Loaded settings"
        );
        Ok(Self { path, document })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn document(&self) -> &SettingsDocument {
        &self.document
    }

    fn persist(&self) -> Result<(), SettingsError> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;

        let mut document = self.document.clone();
        document.version = SETTINGS_VERSION;
        let json = serde_json::to_vec_pretty(&document)?;

        let mut temp = tempfile::NamedTempFile::new_in(dir)?;
        temp.write_all(&json)?;
        temp.as_file().sync_all()?;
        temp.persist(&self.path).map_err(|err| err.error)?;
        Ok(())
    }
}

impl SettingsStore for JsonSettingsStore {
    fn load_volume(&self, identifier: &str) -> Option<f32> {
        self.document.volume(identifier)
    }

    fn save_volume(&mut self, identifier: &str, gain: f32) -> Result<(), SettingsError> {
        self.document
            .app_volumes
            .insert(identifier.to_string(), clamp_gain(gain));
        self.persist()
    }

    fn load_mute(&self, identifier: &str) -> Option<bool> {
        self.document.app_mutes.get(identifier).copied()
    }

    fn save_mute(&mut self, identifier: &str, muted: bool) -> Result<(), SettingsError> {
        self.document.app_mutes.insert(identifier.to_string(), muted);
        self.persist()
    }

    fn load_device(&self, identifier: &str) -> Option<String> {
        self.document.app_devices.get(identifier).cloned()
    }

    fn save_device(&mut self, identifier: &str, device_uid: &str) -> Result<(), SettingsError> {
        self.document
            .app_devices
            .insert(identifier.to_string(), device_uid.to_string());
        self.persist()
    }
}
