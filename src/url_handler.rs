//! `finetune://` command URLs.
//!
//! ```text
//! finetune://volume?app=<id>&level=<0..2>
//! finetune://volume?app=<id>&step=up|down|+|-
//! finetune://mute?app=<id>&muted=true|false
//! finetune://device?app=<id>&device=<uid>
//! ```
//!
//! `<id>` is a bundle id or a persistence identifier such as `name:mpv`.

use crate::engine::EngineHandle;
use crate::error::{EngineError, UrlError};
use crate::process::AudioProcess;
use crate::volume_mapping::{gain_to_percentage, gain_to_slider, slider_to_gain};
use std::fmt;
use tracing::{info, warn};

pub const SCHEME: &str = "finetune";

/// Slider movement for one `step` command.
pub const DEFAULT_STEP: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepDirection {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VolumeChange {
    /// Absolute level, 0.0 (silent) to 2.0 (200%).
    Level(f64),
    Step(StepDirection),
}

#[derive(Debug, Clone, PartialEq)]
pub enum UrlCommand {
    Volume { app: String, change: VolumeChange },
    Mute { app: String, muted: bool },
    Device { app: String, device: String },
}

impl UrlCommand {
    pub fn parse(url: &str) -> Result<Self, UrlError> {
        let url = url.trim();
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| UrlError::Malformed(url.to_string()))?;
        if !scheme.eq_ignore_ascii_case(SCHEME) {
            return Err(UrlError::Scheme(scheme.to_string()));
        }

        let rest = rest.split('#').next().unwrap_or_default();
        let (action, query) = rest.split_once('?').unwrap_or((rest, ""));
        let action = action.trim_end_matches('/');
        let params = parse_query(query)?;
        let param = |name: &str| find_param(&params, name);
        let app = || {
            param("app")
                .filter(|app| !app.is_empty())
                .map(str::to_string)
                .ok_or(UrlError::MissingParameter("app"))
        };

        match action {
            "volume" => {
                let app = app()?;
                // A step wins over a level when both are present.
                let change = if let Some(step) = param("step") {
                    VolumeChange::Step(parse_step(step)?)
                } else if let Some(level) = param("level") {
                    let level = level
                        .parse::<f64>()
                        .ok()
                        .filter(|level| level.is_finite())
                        .ok_or_else(|| invalid("level", level))?;
                    VolumeChange::Level(level)
                } else {
                    return Err(UrlError::MissingParameter("level"));
                };
                Ok(Self::Volume { app, change })
            }
            "mute" => {
                let app = app()?;
                let muted = param("muted").ok_or(UrlError::MissingParameter("muted"))?;
                let muted = muted.parse::<bool>().map_err(|_| invalid("muted", muted))?;
                Ok(Self::Mute { app, muted })
            }
            "device" => {
                let app = app()?;
                let device = param("device")
                    .filter(|device| !device.is_empty())
                    .ok_or(UrlError::MissingParameter("device"))?;
                Ok(Self::Device {
                    app,
                    device: device.to_string(),
                })
            }
            other => Err(UrlError::UnknownAction(other.to_string())),
        }
    }

    /// Identifier of the target application.
    pub fn app(&self) -> &str {
        match self {
            Self::Volume { app, .. } | Self::Mute { app, .. } | Self::Device { app, .. } => app,
        }
    }
}

impl fmt::Display for UrlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Volume {
                app,
                change: VolumeChange::Level(level),
            } => write!(f, "set volume of {app} to level {level}"),
            Self::Volume {
                app,
                change: VolumeChange::Step(direction),
            } => {
                let direction = match direction {
                    StepDirection::Up => "up",
                    StepDirection::Down => "down",
                };
                write!(f, "step volume of {app} {direction}")
            }
            Self::Mute { app, muted: true } => write!(f, "mute {app}"),
            Self::Mute { app, muted: false } => write!(f, "unmute {app}"),
            Self::Device { app, device } => write!(f, "route {app} to {device}"),
        }
    }
}

fn invalid(name: &'static str, value: &str) -> UrlError {
    UrlError::InvalidValue {
        name,
        value: value.to_string(),
    }
}

fn parse_step(step: &str) -> Result<StepDirection, UrlError> {
    match step.to_ascii_lowercase().as_str() {
        "up" | "+" => Ok(StepDirection::Up),
        "down" | "-" => Ok(StepDirection::Down),
        _ => Err(invalid("step", step)),
    }
}

fn find_param<'a>(params: &'a [(String, String)], name: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
}

fn parse_query(query: &str) -> Result<Vec<(String, String)>, UrlError> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            Ok((percent_decode(key)?, percent_decode(value)?))
        })
        .collect()
}

/// Decode `%XX` escapes. `+` is left alone so `step=+` keeps its meaning.
fn percent_decode(input: &str) -> Result<String, UrlError> {
    let bytes = input.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes
                .get(i + 1..i + 3)
                .and_then(|hex| std::str::from_utf8(hex).ok())
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
                .ok_or_else(|| UrlError::Malformed(input.to_string()))?;
            decoded.push(hex);
            i += 3;
        } else {
            decoded.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(decoded).map_err(|_| UrlError::Malformed(input.to_string()))
}

/// Gain after applying `change` to an app currently at `current` gain.
pub fn target_gain(current: f32, change: VolumeChange, step: f64) -> f32 {
    match change {
        VolumeChange::Level(level) => slider_to_gain((level / 2.0).clamp(0.0, 1.0)),
        VolumeChange::Step(direction) => {
            let position = gain_to_slider(current);
            let position = match direction {
                StepDirection::Up => (position + step).min(1.0),
                StepDirection::Down => (position - step).max(0.0),
            };
            slider_to_gain(position)
        }
    }
}

/// Executes command URLs against a running engine.
#[derive(Clone)]
pub struct UrlHandler {
    engine: EngineHandle,
    step: f64,
}

impl UrlHandler {
    pub fn new(engine: EngineHandle, step: f64) -> Self {
        Self { engine, step }
    }

    /// Parse and run one URL. Bad URLs and unknown apps are logged and
    /// reported as `Ok(false)`; only a dead engine is an error.
    pub async fn handle_url(&self, url: &str) -> Result<bool, EngineError> {
        info!(url, "Received URL");
        let command = match UrlCommand::parse(url) {
            Ok(command) => command,
            Err(err) => {
                warn!(url, error = %err, "Ignoring URL");
                return Ok(false);
            }
        };
        self.execute(&command).await
    }

    pub async fn execute(&self, command: &UrlCommand) -> Result<bool, EngineError> {
        let Some(app) = self.find_app(command.app()) else {
            warn!(identifier = command.app(), "App not found");
            return Ok(false);
        };

        match command {
            UrlCommand::Volume { change, .. } => {
                let current = self.engine.get_volume(&app).await?;
                let gain = target_gain(current, *change, self.step);
                self.engine.set_volume(&app, gain).await?;
                info!(
                    name = %app.name,
                    from = gain_to_percentage(current),
                    to = gain_to_percentage(gain),
                    "Set volume"
                );
            }
            UrlCommand::Mute { muted, .. } => {
                self.engine.set_mute(&app, *muted).await?;
                info!(name = %app.name, muted, "Set mute");
            }
            UrlCommand::Device { device, .. } => {
                self.engine.set_device(&app, device).await?;
                info!(name = %app.name, device = %device, "Routed app");
            }
        }
        Ok(true)
    }

    fn find_app(&self, identifier: &str) -> Option<AudioProcess> {
        self.engine.find_app(identifier)
    }
}
