//! Audio-producing processes and their stable identity.

use crate::audio::AudioObjectId;
use serde::Serialize;
use std::path::PathBuf;

/// Prefix for identifiers derived from the display name when the OS reports
/// no bundle / application id.
const NAME_IDENTIFIER_PREFIX: &str = "name:";

/// Fallback display name when neither the OS nor the bundle id help.
pub const UNKNOWN_NAME: &str = "Unknown";

/// Where a UI can find an icon for a process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum IconRef {
    /// Themed icon name (e.g. freedesktop `application.icon-name`).
    Named(String),
    /// Icon or executable file on disk.
    Path(PathBuf),
    /// No specific icon; render a generic application glyph.
    Generic,
}

/// One OS process currently producing audio.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AudioProcess {
    /// OS process id. Volatile: the OS reuses it over time.
    pub pid: u32,
    /// Audio-subsystem object this process was discovered through.
    pub object_id: AudioObjectId,
    pub name: String,
    pub bundle_id: Option<String>,
    pub icon: IconRef,
}

impl AudioProcess {
    /// Stable key used to remember settings across process restarts.
    ///
    /// The bundle id when the OS reports one, otherwise a token derived from
    /// the display name.
    pub fn persistence_identifier(&self) -> String {
        match self.bundle_id.as_deref() {
            Some(bundle_id) if !bundle_id.is_empty() => bundle_id.to_string(),
            _ => format!("{NAME_IDENTIFIER_PREFIX}{}", self.name),
        }
    }

    /// True when `identifier` names this process by bundle id or by
    /// persistence identifier.
    pub fn matches_identifier(&self, identifier: &str) -> bool {
        self.bundle_id.as_deref() == Some(identifier) || self.persistence_identifier() == identifier
    }
}

/// Resolve a display name: OS application name, then the last component of
/// the bundle id, then [`UNKNOWN_NAME`].
pub fn display_name(app_name: Option<&str>, bundle_id: Option<&str>) -> String {
    if let Some(name) = app_name.map(str::trim).filter(|name| !name.is_empty()) {
        return name.to_string();
    }
    bundle_id
        .and_then(|id| id.rsplit('.').next())
        .filter(|tail| !tail.is_empty())
        .unwrap_or(UNKNOWN_NAME)
        .to_string()
}

/// Order processes by case-insensitive display name, pid as tie-breaker.
pub fn sort_by_name(processes: &mut [AudioProcess]) {
    processes.sort_by(|a, b| {
        a.name
            .to_lowercase()
            .cmp(&b.name.to_lowercase())
            .then(a.pid.cmp(&b.pid))
    });
}
