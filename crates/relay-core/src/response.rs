use serde::{Deserialize, Serialize};

/// `error_type` set when tool calls were denied but none was critical.
pub const TOOL_VALIDATION_FAILED: &str = "tool_validation_failed";

/// Outcome of one engine run. Produced exactly once per command.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub content: String,
    /// Engine-issued session id. Never a placeholder.
    pub session_id: Option<String>,
    pub cost: f64,
    pub duration_ms: u64,
    pub num_turns: u32,
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default)]
    pub tools_used: Vec<String>,
}

impl Response {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost.max(0.0);
        self
    }

    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools_used = tools.into_iter().map(Into::into).collect();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder() {
        let r = Response::text("done")
            .with_session_id("sess-1")
            .with_cost(0.25)
            .with_tools(["Read", "Bash"]);
        assert_eq!(r.content, "done");
        assert_eq!(r.session_id.as_deref(), Some("sess-1"));
        assert_eq!(r.cost, 0.25);
        assert_eq!(r.tools_used, vec!["Read", "Bash"]);
        assert!(!r.is_error);
    }

    #[test]
    fn negative_cost_clamped() {
        assert_eq!(Response::text("x").with_cost(-1.0).cost, 0.0);
    }

    #[test]
    fn error_type_omitted_when_absent() {
        let json = serde_json::to_value(Response::text("x")).unwrap();
        assert!(json.get("error_type").is_none());
    }
}
