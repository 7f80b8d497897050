use std::path::PathBuf;

use relay_settings::RelaySettings;

/// The slice of settings the orchestrator reads.
#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    pub use_structured_backend: bool,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub approved_directory: PathBuf,
    pub max_cost_per_user: f64,
    pub session_timeout_hours: u64,
}

impl OrchestratorConfig {
    pub fn from_settings(settings: &RelaySettings) -> Self {
        Self {
            use_structured_backend: settings.use_structured_backend,
            allowed_tools: settings.allowed_tools.clone(),
            disallowed_tools: settings.disallowed_tools.clone(),
            approved_directory: settings.approved_directory.clone(),
            max_cost_per_user: settings.max_cost_per_user,
            session_timeout_hours: settings.session_timeout_hours,
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from_settings(&RelaySettings::default())
    }
}
