//! Default tool policy and usage accounting.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use relay_core::{ToolValidator, ToolVerdict, UserId, TOOL_NOT_ALLOWED_MARKER};

use crate::config::OrchestratorConfig;

/// Tools whose input names a filesystem location.
const FILE_TOOLS: &[&str] = &[
    "Read",
    "Write",
    "Edit",
    "MultiEdit",
    "NotebookRead",
    "NotebookEdit",
    "Glob",
    "Grep",
    "LS",
];
const PATH_KEYS: &[&str] = &["file_path", "path", "notebook_path"];

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ToolStats {
    pub total_calls: u64,
    pub denied_calls: u64,
    pub by_tool: BTreeMap<String, u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct UserToolUsage {
    pub total_calls: u64,
    pub denied_calls: u64,
    pub by_tool: BTreeMap<String, u64>,
}

#[derive(Default)]
struct Usage {
    calls: u64,
    denied: u64,
}

/// Allow-list, deny-list, command-pattern and directory checks for tool calls.
pub struct ToolMonitor {
    allowed_tools: Vec<String>,
    disallowed_tools: Vec<String>,
    approved_directory: PathBuf,
    by_tool: DashMap<String, Usage>,
    by_user: DashMap<UserId, DashMap<String, Usage>>,
}

impl ToolMonitor {
    pub fn new(
        allowed_tools: Vec<String>,
        disallowed_tools: Vec<String>,
        approved_directory: impl AsRef<Path>,
    ) -> Self {
        let approved = approved_directory.as_ref();
        let absolute = if approved.is_absolute() {
            approved.to_path_buf()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(approved))
                .unwrap_or_else(|_| approved.to_path_buf())
        };
        Self {
            allowed_tools,
            disallowed_tools,
            approved_directory: normalize(&absolute).unwrap_or(absolute),
            by_tool: DashMap::new(),
            by_user: DashMap::new(),
        }
    }

    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self::new(
            config.allowed_tools.clone(),
            config.disallowed_tools.clone(),
            &config.approved_directory,
        )
    }

    fn check(&self, name: &str, input: &Value, working_directory: &Path) -> ToolVerdict {
        if !self.allowed_tools.iter().any(|t| t == name) {
            return ToolVerdict::denied(format!("{TOOL_NOT_ALLOWED_MARKER} {name}"));
        }
        if self.disallowed_tools.iter().any(|t| t == name) {
            return ToolVerdict::denied(format!("Tool explicitly disallowed: {name}"));
        }

        if name == "Bash" {
            let command = input.get("command").and_then(Value::as_str).unwrap_or_default();
            if let Some(pattern) = self
                .disallowed_tools
                .iter()
                .find(|pattern| command.contains(pattern.as_str()))
            {
                return ToolVerdict::denied(format!("Disallowed command pattern: {pattern}"));
            }
        }

        if FILE_TOOLS.contains(&name) {
            for raw in PATH_KEYS.iter().filter_map(|key| input.get(*key).and_then(Value::as_str)) {
                if !self.within_approved(working_directory, raw) {
                    return ToolVerdict::denied(format!("Path outside approved directory: {raw}"));
                }
            }
        }

        ToolVerdict::Allowed
    }

    fn within_approved(&self, working_directory: &Path, raw: &str) -> bool {
        let candidate = Path::new(raw);
        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            working_directory.join(candidate)
        };
        normalize(&joined).is_some_and(|p| p.starts_with(&self.approved_directory))
    }

    fn record(&self, name: &str, user_id: UserId, denied: bool) {
        let bump = |usage: &mut Usage| {
            usage.calls += 1;
            if denied {
                usage.denied += 1;
            }
        };
        bump(&mut *self.by_tool.entry(name.to_string()).or_default());
        let tools = self.by_user.entry(user_id).or_default();
        bump(&mut *tools.entry(name.to_string()).or_default());
    }

    pub fn tool_stats(&self) -> ToolStats {
        let mut stats = ToolStats::default();
        for entry in self.by_tool.iter() {
            stats.total_calls += entry.calls;
            stats.denied_calls += entry.denied;
            stats.by_tool.insert(entry.key().clone(), entry.calls);
        }
        stats
    }

    pub fn user_tool_usage(&self, user_id: UserId) -> UserToolUsage {
        let mut usage = UserToolUsage::default();
        if let Some(tools) = self.by_user.get(&user_id) {
            for entry in tools.iter() {
                usage.total_calls += entry.calls;
                usage.denied_calls += entry.denied;
                usage.by_tool.insert(entry.key().clone(), entry.calls);
            }
        }
        usage
    }
}

#[async_trait]
impl ToolValidator for ToolMonitor {
    async fn validate_tool_call(
        &self,
        name: &str,
        input: &Value,
        working_directory: &Path,
        user_id: UserId,
    ) -> ToolVerdict {
        let verdict = self.check(name, input, working_directory);
        self.record(name, user_id, !verdict.is_allowed());
        debug!(tool_name = name, user_id, allowed = verdict.is_allowed(), "tool call checked");
        verdict
    }
}

/// Lexical normalisation. `None` when `..` climbs past the root.
fn normalize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                if !out.pop() || out.as_os_str().is_empty() {
                    return None;
                }
            }
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    Some(out)
}
