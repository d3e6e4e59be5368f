use std::env;
use std::path::Path;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::CoreError;

/// Env var selecting the active profile (e.g. `PROD`).
pub const PROFILE_VAR: &str = "SWARM_PROFILE";

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    if let Ok(path) = dotenvy::dotenv() {
        debug!(path = %path.display(), "loaded .env");
    }
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Active profile name, upper-cased. Empty when no profile is set.
pub fn profile() -> String {
    env_opt(PROFILE_VAR).unwrap_or_default().to_uppercase()
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
pub fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

/// Read and parse a profiled env var.
///
/// Unset keys yield `Ok(None)`; a value that does not parse is an error
/// rather than a silent fallback to the default.
pub fn profiled_env_parse<T: FromStr>(profile: &str, key: &str) -> Result<Option<T>, CoreError> {
    match profiled_env_opt(profile, key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| CoreError::InvalidEnv {
                key: key.to_string(),
                value: raw,
            }),
    }
}

/// Parse a TOML document into any deserializable config type.
pub fn from_toml<T: DeserializeOwned>(toml_str: &str) -> Result<T, CoreError> {
    Ok(toml::from_str(toml_str)?)
}

/// Read and parse a TOML config file.
pub fn from_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, CoreError> {
    let content = std::fs::read_to_string(path.as_ref())?;
    from_toml(&content)
}
