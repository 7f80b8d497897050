//! User-facing text for tool-policy violations.

use relay_core::TOOL_NOT_ALLOWED_MARKER;

/// `existing` followed by every blocked tool not already present, in the
/// order first seen.
pub fn merge_allowed_tools(existing: &[String], blocked: &[String]) -> Vec<String> {
    let mut merged: Vec<String> = Vec::with_capacity(existing.len() + blocked.len());
    for tool in existing.iter().chain(blocked) {
        if !merged.contains(tool) {
            merged.push(tool.clone());
        }
    }
    merged
}

/// Tool names named by allow-list denial reasons, de-duplicated.
pub fn blocked_tools_from_reasons(reasons: &[String]) -> Vec<String> {
    let mut tools = Vec::new();
    for reason in reasons {
        let Some((_, rest)) = reason.split_once(TOOL_NOT_ALLOWED_MARKER) else {
            continue;
        };
        let name = rest.trim().to_string();
        if !name.is_empty() && !tools.contains(&name) {
            tools.push(name);
        }
    }
    tools
}

fn code_list(tools: &[String]) -> String {
    if tools.is_empty() {
        return "None".to_string();
    }
    tools.iter().map(|t| format!("`{t}`")).collect::<Vec<_>>().join(", ")
}

/// Ready-to-paste configuration for enabling `blocked` on top of `allowed`.
pub fn admin_instructions(allowed: &[String], blocked: &[String]) -> String {
    if blocked.is_empty() {
        return String::new();
    }
    let merged = merge_allowed_tools(allowed, blocked);
    let env_value = merged.join(",");
    let json_value = merged
        .iter()
        .map(|t| format!("\"{t}\""))
        .collect::<Vec<_>>()
        .join(", ");

    [
        "**For Administrators:**".to_string(),
        String::new(),
        "To enable these tools, set the environment variable:".to_string(),
        "```".to_string(),
        format!("RELAY_ALLOWED_TOOLS=\"{env_value}\""),
        "```".to_string(),
        String::new(),
        "Or add them to `~/.relay/settings.json`:".to_string(),
        "```json".to_string(),
        format!("\"allowed_tools\": [{json_value}]"),
        "```".to_string(),
    ]
    .join("\n")
}

/// Full explanation for tools blocked by the allow-list.
pub fn tool_blocked_message(blocked: &[String], allowed: &[String]) -> String {
    let mut lines = vec![
        "🚫 **Tool Access Blocked**".to_string(),
        String::new(),
        "The agent tried to use tools that are not currently allowed:".to_string(),
        code_list(blocked),
        String::new(),
        "**What you can do:**".to_string(),
        "• Contact the administrator to request access to these tools".to_string(),
        "• Try rephrasing your request to use different approaches".to_string(),
        "• Use simpler requests that don't require these tools".to_string(),
        String::new(),
        "**Currently allowed tools:**".to_string(),
        code_list(allowed),
    ];
    let admin = admin_instructions(allowed, blocked);
    if !admin.is_empty() {
        lines.push(String::new());
        lines.push(admin);
    }
    lines.join("\n")
}

/// Generic text for denials that are not allow-list violations.
pub fn validation_failed_message(reasons: &[String]) -> String {
    format!(
        "🚫 **Tool Validation Failed**\n\nTools failed security validation. Try a different approach.\n\nDetails: {}",
        reasons.join("; ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn merge_keeps_order_and_appends_new() {
        let merged = merge_allowed_tools(&strings(&["Read", "Write"]), &strings(&["Bash", "Read"]));
        assert_eq!(merged, strings(&["Read", "Write", "Bash"]));
    }

    #[test]
    fn merge_drops_duplicates_within_blocked() {
        let merged = merge_allowed_tools(&[], &strings(&["Bash", "Bash", "Task"]));
        assert_eq!(merged, strings(&["Bash", "Task"]));
    }

    #[test]
    fn extracts_blocked_names() {
        let reasons = strings(&[
            "Tool not allowed: Bash",
            "Path outside approved directory: /etc",
            "Tool not allowed: WebFetch",
            "Tool not allowed: Bash",
        ]);
        assert_eq!(blocked_tools_from_reasons(&reasons), strings(&["Bash", "WebFetch"]));
    }

    #[test]
    fn blocked_message_lists_everything() {
        let text = tool_blocked_message(&strings(&["Bash"]), &strings(&["Read", "Write"]));
        assert!(text.contains("`Bash`"));
        assert!(text.contains("`Read`, `Write`"));
        assert!(text.contains(r#"RELAY_ALLOWED_TOOLS="Read,Write,Bash""#));
        assert!(text.contains(r#""allowed_tools": ["Read", "Write", "Bash"]"#));
    }

    #[test]
    fn blocked_message_with_empty_allow_list() {
        let text = tool_blocked_message(&strings(&["Bash"]), &[]);
        assert!(text.contains("**Currently allowed tools:**\nNone"));
        assert!(text.contains(r#"RELAY_ALLOWED_TOOLS="Bash""#));
    }

    #[test]
    fn no_admin_block_without_blocked_tools() {
        assert!(admin_instructions(&strings(&["Read"]), &[]).is_empty());
        let text = tool_blocked_message(&[], &strings(&["Read"]));
        assert!(!text.contains("For Administrators"));
    }

    #[test]
    fn generic_message_joins_reasons() {
        let text = validation_failed_message(&strings(&["a", "b"]));
        assert!(text.starts_with("🚫 **Tool Validation Failed**"));
        assert!(text.ends_with("Details: a; b"));
    }
}
