//! Container configuration.
//!
//! Sources are merged in order: defaults, an optional TOML or JSON file, then
//! environment variables prefixed with `WEAVE_` (or a custom prefix).

use std::ffi::OsString;
use std::{env, fs, path::Path};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const DEFAULT_ENV_PREFIX: &str = "WEAVE";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Name used in log output.
    pub name: String,
    /// Allow `bind` to replace existing bindings without per-binding opt-in.
    pub allow_override: bool,
    /// Maintain resolution counters (see [`ContainerStats`](crate::ContainerStats)).
    pub track_stats: bool,
    /// Run `validate()` after every `install` and fail on the first error.
    pub validate_on_install: bool,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            allow_override: false,
            track_stats: true,
            validate_on_install: false,
        }
    }
}

impl ContainerConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_allow_override(mut self, enabled: bool) -> Self {
        self.allow_override = enabled;
        self
    }

    pub fn with_track_stats(mut self, enabled: bool) -> Self {
        self.track_stats = enabled;
        self
    }

    pub fn with_validate_on_install(mut self, enabled: bool) -> Self {
        self.validate_on_install = enabled;
        self
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("invalid TOML container configuration")
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("invalid JSON container configuration")
    }

    /// Reads a `.toml` or `.json` file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;

        match path.extension().and_then(|s| s.to_str()) {
            Some("toml") => Self::from_toml_str(&content),
            Some("json") => Self::from_json_str(&content),
            other => Err(anyhow!(
                "unsupported configuration file format: {:?}",
                other
            )),
        }
    }

    /// Applies `<PREFIX>_*` variables from the process environment.
    pub fn apply_env(&mut self, prefix: &str) -> Result<()> {
        self.apply_vars(prefix, utf8_vars(env::vars_os()))
    }

    /// Applies `<PREFIX>_*` entries from `vars`; unrelated entries are ignored.
    pub fn apply_vars<I, K, V>(&mut self, prefix: &str, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let prefix = format!("{}_", prefix);
        for (key, value) in vars {
            if let Some(field) = key.as_ref().strip_prefix(&prefix) {
                self.apply_var(field, value.as_ref())?;
            }
        }
        Ok(())
    }

    fn apply_var(&mut self, field: &str, value: &str) -> Result<()> {
        match field.to_uppercase().as_str() {
            "NAME" => self.name = value.to_string(),
            "ALLOW_OVERRIDE" => self.allow_override = parse_flag(field, value)?,
            "TRACK_STATS" => self.track_stats = parse_flag(field, value)?,
            "VALIDATE_ON_INSTALL" => self.validate_on_install = parse_flag(field, value)?,
            _ => debug!(variable = field, "Ignoring unknown container setting"),
        }
        Ok(())
    }

    /// Defaults, then `path` when given, then `WEAVE_*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(DEFAULT_ENV_PREFIX)?;
        Ok(config)
    }
}

fn parse_flag(field: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(anyhow!("invalid boolean for {}: '{}'", field, other)),
    }
}

/// Entries whose name or value is not valid UTF-8 cannot name a setting and are skipped.
fn utf8_vars<I>(vars: I) -> impl Iterator<Item = (String, String)>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    vars.into_iter()
        .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)))
}
