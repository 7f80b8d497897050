use std::path::PathBuf;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

pub const DEFAULT_ALLOWED_TOOLS: &[&str] = &[
    "Read",
    "Write",
    "Edit",
    "Bash",
    "Glob",
    "Grep",
    "LS",
    "Task",
    "MultiEdit",
    "NotebookRead",
    "NotebookEdit",
    "WebFetch",
    "TodoRead",
    "TodoWrite",
    "WebSearch",
];

pub const DEFAULT_DISALLOWED_TOOLS: &[&str] = &["git commit", "git push"];

/// Engine API key. Redacted in Debug, never serialized.
#[derive(Clone)]
pub struct ApiKey(pub SecretString);

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ApiKey([REDACTED])")
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// Root every file tool must stay inside.
    pub approved_directory: PathBuf,
    /// Engine executable.
    pub cli_path: String,
    pub model: Option<String>,
    pub max_turns: u32,
    pub timeout_seconds: u64,
    /// Try the structured channel first, falling back to the subprocess one.
    pub use_structured_backend: bool,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub max_cost_per_user: f64,
    pub session_timeout_hours: u64,
    pub max_sessions_per_user: usize,
    pub log_level: String,
    pub database_path: PathBuf,
    /// Persist warn+ log records to the database.
    pub persist_logs: bool,
    #[serde(skip)]
    pub api_key: Option<ApiKey>,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            approved_directory: PathBuf::from("."),
            cli_path: "claude".to_string(),
            model: None,
            max_turns: 10,
            timeout_seconds: 300,
            use_structured_backend: true,
            allowed_tools: DEFAULT_ALLOWED_TOOLS.iter().map(|s| s.to_string()).collect(),
            disallowed_tools: DEFAULT_DISALLOWED_TOOLS.iter().map(|s| s.to_string()).collect(),
            max_cost_per_user: 10.0,
            session_timeout_hours: 24,
            max_sessions_per_user: 5,
            log_level: "info".to_string(),
            database_path: crate::loader::relay_home().join("relay.db"),
            persist_logs: true,
            api_key: None,
        }
    }
}

impl RelaySettings {
    /// Checks that cannot be expressed by the types alone.
    pub fn validate(&self) -> Result<()> {
        if !self.approved_directory.is_dir() {
            return Err(SettingsError::InvalidValue(format!(
                "approved_directory {} is not a directory",
                self.approved_directory.display()
            )));
        }
        if self.cli_path.trim().is_empty() {
            return Err(SettingsError::InvalidValue("cli_path is empty".into()));
        }
        if self.max_turns == 0 {
            return Err(SettingsError::InvalidValue("max_turns must be positive".into()));
        }
        if self.max_cost_per_user.is_nan() || self.max_cost_per_user < 0.0 {
            return Err(SettingsError::InvalidValue(
                "max_cost_per_user must be non-negative".into(),
            ));
        }
        if self.max_sessions_per_user == 0 {
            return Err(SettingsError::InvalidValue(
                "max_sessions_per_user must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn defaults() {
        let s = RelaySettings::default();
        assert_eq!(s.cli_path, "claude");
        assert_eq!(s.max_turns, 10);
        assert_eq!(s.timeout_seconds, 300);
        assert!(s.use_structured_backend);
        assert_eq!(s.allowed_tools.len(), 15);
        assert_eq!(s.disallowed_tools, vec!["git commit", "git push"]);
        assert_eq!(s.max_cost_per_user, 10.0);
        assert_eq!(s.session_timeout_hours, 24);
        assert_eq!(s.max_sessions_per_user, 5);
        assert!(s.api_key.is_none());
    }

    #[test]
    fn api_key_never_serialized() {
        let mut s = RelaySettings::default();
        s.api_key = Some(ApiKey(SecretString::from("sk-secret")));
        let json = serde_json::to_string(&s).unwrap();
        assert!(!json.contains("sk-secret"));
        assert!(!json.contains("api_key"));
    }

    #[test]
    fn api_key_debug_redacted() {
        let key = ApiKey(SecretString::from("sk-secret"));
        assert_eq!(format!("{key:?}"), "ApiKey([REDACTED])");
        assert_eq!(key.0.expose_secret(), "sk-secret");
    }

    #[test]
    fn validate_rejects_missing_directory() {
        let s = RelaySettings {
            approved_directory: PathBuf::from("/nonexistent/relay/dir"),
            ..Default::default()
        };
        assert!(matches!(s.validate(), Err(SettingsError::InvalidValue(_))));
    }

    #[test]
    fn validate_rejects_negative_budget() {
        let dir = tempfile::tempdir().unwrap();
        let s = RelaySettings {
            approved_directory: dir.path().to_path_buf(),
            max_cost_per_user: -1.0,
            ..Default::default()
        };
        assert!(s.validate().is_err());
    }

    #[test]
    fn validate_accepts_defaults_in_real_dir() {
        let dir = tempfile::tempdir().unwrap();
        let s = RelaySettings {
            approved_directory: dir.path().to_path_buf(),
            ..Default::default()
        };
        assert!(s.validate().is_ok());
    }
}
