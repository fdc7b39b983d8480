//! Error kinds for the discovery / tap subsystem.
//!
//! None of these are fatal: each one is recovered where it happens and logged,
//! isolated to the process id or audio object it concerns.

use crate::audio::AudioObjectId;
use thiserror::Error;

/// Failures reported by the OS audio collaborator.
#[derive(Debug, Error)]
pub enum SystemError {
    #[error("failed to enumerate audio process objects: {0}")]
    Enumeration(String),

    #[error("failed to read {property} of audio object {object}")]
    PropertyRead {
        object: AudioObjectId,
        property: &'static str,
    },

    #[error("failed to register listener on audio object {object}")]
    ListenerRegistration { object: AudioObjectId },

    #[error("audio system connection lost")]
    Disconnected,
}

/// Creating the OS intercept for a process failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TapActivationError {
    #[error("tap creation denied for pid {pid}: {reason}")]
    Denied { pid: u32, reason: String },

    #[error("process {pid} is no longer producing audio")]
    ProcessGone { pid: u32 },

    #[error("tap for pid {pid} has already been invalidated")]
    Invalidated { pid: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    #[error("output routing is not supported by this audio backend")]
    Unsupported,

    #[error("unknown output device '{0}'")]
    UnknownDevice(String),
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("settings file is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("audio engine task has shut down")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UrlError {
    #[error("unsupported URL scheme '{0}'")]
    Scheme(String),

    #[error("malformed URL '{0}'")]
    Malformed(String),

    #[error("unknown action '{0}'")]
    UnknownAction(String),

    #[error("missing '{0}' parameter")]
    MissingParameter(&'static str),

    #[error("invalid value '{value}' for '{name}'")]
    InvalidValue { name: &'static str, value: String },
}
