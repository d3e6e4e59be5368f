use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use swarm_core::{profile, profiled_env_parse, CoreError};

/// How the worker pool picks a target for the next queued tasklet.
///
/// Neither policy reorders the pending queue; they only choose among
/// workers with free capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchPolicy {
    /// First worker in registration order with a free slot.
    #[default]
    FirstFit,
    /// Rotate through workers, starting after the last one used.
    RoundRobin,
}

impl FromStr for DispatchPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "first_fit" | "first-fit" => Ok(Self::FirstFit),
            "round_robin" | "round-robin" => Ok(Self::RoundRobin),
            other => Err(format!("unknown dispatch policy: {other}")),
        }
    }
}

/// Scheduler configuration, typically parsed from TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Threads in the pool that runs user callbacks.
    #[serde(default = "default_callback_threads")]
    pub callback_threads: usize,
    /// Concurrent tasklets per worker when the handle does not declare its own.
    #[serde(default = "default_worker_capacity")]
    pub worker_capacity: usize,
    /// Worker selection policy for dispatch.
    #[serde(default)]
    pub dispatch_policy: DispatchPolicy,
}

fn default_callback_threads() -> usize {
    10
}

fn default_worker_capacity() -> usize {
    4
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            callback_threads: default_callback_threads(),
            worker_capacity: default_worker_capacity(),
            dispatch_policy: DispatchPolicy::default(),
        }
    }
}

impl SchedulerConfig {
    /// Parse config from a TOML string, then apply env overrides and validate.
    pub fn from_toml(toml_str: &str) -> Result<Self, CoreError> {
        let mut config: Self = swarm_core::config::from_toml(toml_str)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Defaults plus env overrides (call `swarm_core::load_dotenv()` first).
    pub fn from_env() -> Result<Self, CoreError> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from `SWARM_*` env vars, honoring `SWARM_PROFILE`.
    pub fn apply_env_overrides(&mut self) -> Result<(), CoreError> {
        let p = profile();
        if let Some(v) = profiled_env_parse(&p, "SWARM_CALLBACK_THREADS")? {
            self.callback_threads = v;
        }
        if let Some(v) = profiled_env_parse(&p, "SWARM_WORKER_CAPACITY")? {
            self.worker_capacity = v;
        }
        if let Some(v) = profiled_env_parse(&p, "SWARM_DISPATCH_POLICY")? {
            self.dispatch_policy = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.callback_threads == 0 {
            return Err(CoreError::InvalidConfig("callback_threads must be at least 1".into()));
        }
        if self.worker_capacity == 0 {
            return Err(CoreError::InvalidConfig("worker_capacity must be at least 1".into()));
        }
        Ok(())
    }
}
