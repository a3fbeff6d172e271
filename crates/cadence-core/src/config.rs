use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};

/// Execution limits and pacing for the flow engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum node executions per run before the run fails with a step
    /// limit error. Guards against edge cycles in malformed graphs.
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    /// Delays at or below this many seconds sleep inline; longer delays
    /// park the run with a resume_at timestamp for the scheduler.
    #[serde(default = "default_inline_delay_max_secs")]
    pub inline_delay_max_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            inline_delay_max_secs: default_inline_delay_max_secs(),
        }
    }
}

fn default_max_steps() -> usize {
    200
}

fn default_inline_delay_max_secs() -> u64 {
    5
}

/// Scheduler tick configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between wake-up polls for due runs and schedule triggers.
    #[serde(default = "default_poll_secs")]
    pub poll_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_secs: default_poll_secs(),
        }
    }
}

fn default_poll_secs() -> u64 {
    15
}

/// Top-level Cadence configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// SQLite database path for flows and runs.
    #[serde(default = "default_database")]
    pub database: String,
}

fn default_database() -> String {
    "cadence.db".to_string()
}

impl AppConfig {
    /// Load configuration from a TOML file, expanding `${ENV_VAR}`
    /// references before parsing.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| FlowError::ConfigNotFound(path.display().to_string()))?;

        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| FlowError::Config(e.to_string()))
    }

    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(&self.database)
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    result.push_str("${");
                    result.push_str(&var_name);
                    result.push('}');
                }
            }
        } else {
            result.push(c);
        }
    }

    result
}
