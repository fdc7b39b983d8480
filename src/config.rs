//! Daemon configuration, read from `<config_dir>/finetune/config.toml`.

use crate::url_handler::DEFAULT_STEP;
use crate::volume_mapping::{UNITY_GAIN, clamp_gain};
use anyhow::Context;
use fs_err as fs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const APP_DIR: &str = "finetune";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where per-application settings are stored.
    pub settings_path: Option<PathBuf>,
    /// Slider movement per `step=up|down` command.
    pub step: f64,
    /// Gain reported for apps that were never adjusted.
    pub default_gain: f32,
    /// `EnvFilter` directive used when neither `RUST_LOG` nor `-v`/`-q` is given.
    pub log_filter: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            settings_path: None,
            step: DEFAULT_STEP,
            default_gain: UNITY_GAIN,
            log_filter: None,
        }
    }
}

impl Config {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_DIR).join("config.toml"))
    }

    /// Load `path`, or the default location when `None`. A missing file
    /// yields the defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path.map(Path::to_path_buf).or_else(Self::default_path) {
            Some(path) => path,
            None => return Ok(Self::default()),
        };

        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => return Err(err.into()),
        };
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config.normalized())
    }

    fn normalized(mut self) -> Self {
        self.default_gain = clamp_gain(self.default_gain);
        if !self.step.is_finite() || self.step <= 0.0 {
            self.step = DEFAULT_STEP;
        }
        self.step = self.step.min(1.0);
        self
    }

    /// Settings file location: configured, else next to the config file.
    pub fn settings_path(&self) -> anyhow::Result<PathBuf> {
        if let Some(path) = &self.settings_path {
            return Ok(path.clone());
        }
        dirs::config_dir()
            .map(|dir| dir.join(APP_DIR).join("settings.json"))
            .context("No config directory available; set settings_path")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let config = Config::load(Some(&temp_dir.path().join("config.toml"))).expect("load");
        assert_eq!(config, Config::default());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("config.toml");
        fs::write(&path, "step = 0.1\nsettings_path = \"/tmp/ft.json\"\n").expect("write");

        let config = Config::load(Some(&path)).expect("load");
        assert_eq!(config.step, 0.1);
        assert_eq!(config.default_gain, 1.0);
        assert_eq!(config.settings_path().expect("path"), PathBuf::from("/tmp/ft.json"));
    }

    #[test]
    fn out_of_range_values_are_normalized() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("config.toml");
        fs::write(&path, "step = -3.0\ndefault_gain = 5.0\n").expect("write");

        let config = Config::load(Some(&path)).expect("load");
        assert_eq!(config.step, DEFAULT_STEP);
        assert_eq!(config.default_gain, 2.0);
    }

    #[test]
    fn invalid_toml_names_the_file() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("config.toml");
        fs::write(&path, "step = = 1").expect("write");

        let err = Config::load(Some(&path)).expect_err("invalid");
        assert!(format!("{err}").contains("config.toml"));
    }
}
