use std::time::Duration;

use relay_settings::{ApiKey, RelaySettings};

/// How to launch and constrain the engine.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub cli_path: String,
    /// Placed before the engine flags, e.g. a script path when `cli_path`
    /// is an interpreter.
    pub launcher_args: Vec<String>,
    pub max_turns: u32,
    pub timeout: Duration,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    /// Used when the request carries no model.
    pub default_model: Option<String>,
    pub api_key: Option<ApiKey>,
}

impl EngineConfig {
    pub fn from_settings(settings: &RelaySettings) -> Self {
        Self {
            cli_path: settings.cli_path.clone(),
            launcher_args: Vec::new(),
            max_turns: settings.max_turns,
            timeout: Duration::from_secs(settings.timeout_seconds),
            allowed_tools: settings.allowed_tools.clone(),
            disallowed_tools: settings.disallowed_tools.clone(),
            default_model: settings.model.clone(),
            api_key: settings.api_key.clone(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_settings(&RelaySettings::default())
    }
}
