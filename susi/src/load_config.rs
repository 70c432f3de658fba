//! Reads the YAML configuration file, fills `${VAR}` / `$VAR` placeholders
//! from the environment and validates the result.
//!
//! Secrets never live in the file itself: they come from the process
//! environment, which `main` seeds from `.env` first. A placeholder whose
//! variable is unset stays in the value verbatim, so validation can name the
//! field that is missing.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use regex::{Captures, Regex};
use serde_yaml::Value;
use susi_core::config::Config;
use tracing::{debug, error, info};

/// Replace every `${VAR}` and `$VAR` in `input` with the variable's value.
/// Unset variables are left untouched.
pub fn substitute_env(input: &str) -> Result<String> {
    let pattern = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)")
        .context("placeholder pattern")?;
    let replaced = pattern.replace_all(input, |caps: &Captures| {
        let name = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str())
            .unwrap_or_default();
        match std::env::var(name) {
            Ok(value) => value,
            Err(_) => {
                debug!(variable = name, "Environment placeholder left unresolved");
                caps[0].to_string()
            }
        }
    });
    Ok(replaced.into_owned())
}

fn resolve_placeholders(value: &mut Value) -> Result<()> {
    match value {
        Value::String(s) => *s = substitute_env(s)?,
        Value::Sequence(items) => {
            for item in items {
                resolve_placeholders(item)?;
            }
        }
        Value::Mapping(map) => {
            for (_, item) in map.iter_mut() {
                resolve_placeholders(item)?;
            }
        }
        Value::Tagged(tagged) => resolve_placeholders(&mut tagged.value)?,
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
    Ok(())
}

/// Parse and resolve configuration text without validating it.
pub fn parse_config(content: &str) -> Result<Config> {
    let mut raw: Value = serde_yaml::from_str(content).context("Failed to parse config YAML")?;
    resolve_placeholders(&mut raw)?;
    serde_yaml::from_value(raw).context("Config does not match the expected layout")
}

/// Load, resolve and validate the configuration file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path_ref = path.as_ref();
    info!(config_path = ?path_ref, "Loading configuration from file");

    let content = match fs::read_to_string(path_ref) {
        Ok(content) => content,
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to read config file");
            return Err(anyhow::anyhow!(
                "Failed to read config file {}: {e}",
                path_ref.display()
            ));
        }
    };

    let config = match parse_config(&content) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, config_path = ?path_ref, "Failed to parse config");
            return Err(e);
        }
    };

    if let Err(e) = config.validate() {
        error!(error = %e, config_path = ?path_ref, "Config is invalid");
        return Err(anyhow::Error::new(e)
            .context(format!("Invalid configuration in {}", path_ref.display())));
    }

    config.trace_loaded();
    Ok(config)
}
