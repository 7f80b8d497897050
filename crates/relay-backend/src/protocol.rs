//! The engine's stream-json message protocol.
//!
//! Every stdout line is one JSON object tagged by `type`:
//! `system` (init) → (`assistant` | `user`)* → `result`.

use std::time::Duration;

use relay_core::{BackendError, Response, StreamUpdate, ToolCall, UpdateKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineMessage {
    System {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        model: Option<String>,
    },
    Assistant {
        message: MessageBody,
        #[serde(default)]
        session_id: Option<String>,
    },
    /// Tool results fed back to the model.
    User {
        message: MessageBody,
        #[serde(default)]
        session_id: Option<String>,
    },
    Result {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default, alias = "cost_usd")]
        total_cost_usd: Option<f64>,
        #[serde(default)]
        duration_ms: Option<u64>,
        #[serde(default)]
        num_turns: Option<u32>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct MessageBody {
    #[serde(default)]
    pub content: Content,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Blocks(Vec<ContentBlock>),
    Text(String),
    #[default]
    Empty,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        #[serde(default)]
        id: Option<String>,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        #[serde(default)]
        tool_use_id: Option<String>,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Other,
}

/// User turn written to the engine's stdin in streamed-input mode.
#[derive(Serialize)]
struct UserEnvelope<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    message: UserMessage<'a>,
}

#[derive(Serialize)]
struct UserMessage<'a> {
    role: &'static str,
    content: &'a str,
}

pub fn encode_user_message(prompt: &str) -> Result<String, BackendError> {
    let envelope = UserEnvelope {
        kind: "user",
        message: UserMessage {
            role: "user",
            content: prompt,
        },
    };
    serde_json::to_string(&envelope).map_err(|e| BackendError::Engine(e.to_string()))
}

/// Strict decoding: any line that is not a well-formed message is an error.
/// Blank lines yield `Ok(None)`.
pub fn decode_strict(line: &str) -> Result<Option<EngineMessage>, BackendError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(line)
        .map(Some)
        .map_err(|e| BackendError::Decode(format!("{e} in line: {}", crate::tail(line, 200))))
}

/// Lenient decoding: malformed lines are dropped.
pub fn decode_lenient(line: &str) -> Option<EngineMessage> {
    decode_strict(line).ok().flatten()
}

/// Map engine-reported failure text onto typed errors where possible.
pub fn classify_engine_failure(text: &str) -> Option<BackendError> {
    let lower = text.to_lowercase();
    if lower.contains("invalid api key") || lower.contains("authentication") || lower.contains("please run /login") {
        return Some(BackendError::AuthenticationFailed(crate::tail(text, 500)));
    }
    if lower.contains("usage limit") || lower.contains("credit balance") || lower.contains("quota") {
        return Some(BackendError::QuotaExceeded(crate::tail(text, 500)));
    }
    None
}

fn render_tool_result(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

impl MessageBody {
    fn text(&self) -> Option<String> {
        match &self.content {
            Content::Text(t) if !t.is_empty() => Some(t.clone()),
            Content::Blocks(blocks) => {
                let parts: Vec<&str> = blocks
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::Text { text } => Some(text.as_str()),
                        _ => None,
                    })
                    .collect();
                (!parts.is_empty()).then(|| parts.join("\n"))
            }
            _ => None,
        }
    }

    fn tool_calls(&self) -> Vec<ToolCall> {
        match &self.content {
            Content::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolUse { name, input, .. } => Some(ToolCall::new(name.clone(), input.clone())),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    fn tool_results(&self) -> Option<String> {
        let Content::Blocks(blocks) = &self.content else {
            return None;
        };
        let parts: Vec<String> = blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolResult { content, is_error, .. } => {
                    let text = render_tool_result(content);
                    Some(if *is_error { format!("Error: {text}") } else { text })
                }
                _ => None,
            })
            .collect();
        (!parts.is_empty()).then(|| parts.join("\n"))
    }
}

impl EngineMessage {
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::System { session_id, .. }
            | Self::Assistant { session_id, .. }
            | Self::User { session_id, .. }
            | Self::Result { session_id, .. } => session_id.as_deref(),
            Self::Unknown => None,
        }
    }

    /// The caller-facing update for this message, if any.
    pub fn to_update(&self) -> Option<StreamUpdate> {
        let update = match self {
            Self::System { subtype, .. } => {
                let mut u = StreamUpdate::new(UpdateKind::System);
                u.content = subtype.clone();
                u
            }
            Self::Assistant { message, .. } => {
                let mut u = StreamUpdate::tool_use(message.tool_calls());
                u.content = message.text();
                u
            }
            Self::User { message, .. } => {
                let mut u = StreamUpdate::new(UpdateKind::ToolResult);
                u.content = Some(message.tool_results()?);
                u
            }
            Self::Result { is_error, result, .. } => {
                let kind = if *is_error { UpdateKind::Error } else { UpdateKind::Result };
                let mut u = StreamUpdate::new(kind);
                u.content = result.clone();
                u
            }
            Self::Unknown => return None,
        };
        Some(match self.session_id() {
            Some(id) => update.with_session_id(id),
            None => update,
        })
    }
}

/// Folds a message stream into the final [`Response`].
#[derive(Debug, Default)]
pub struct TranscriptBuilder {
    session_id: Option<String>,
    tools_used: Vec<String>,
    last_text: Option<String>,
    result: Option<ResultSummary>,
}

#[derive(Debug)]
struct ResultSummary {
    subtype: Option<String>,
    is_error: bool,
    text: Option<String>,
    cost: f64,
    duration_ms: Option<u64>,
    num_turns: u32,
}

impl TranscriptBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, message: &EngineMessage) {
        if let Some(id) = message.session_id().filter(|id| !id.is_empty()) {
            self.session_id = Some(id.to_string());
        }
        match message {
            EngineMessage::Assistant { message, .. } => {
                for call in message.tool_calls() {
                    if !self.tools_used.contains(&call.name) {
                        self.tools_used.push(call.name);
                    }
                }
                if let Some(text) = message.text() {
                    self.last_text = Some(text);
                }
            }
            EngineMessage::Result {
                subtype,
                is_error,
                result,
                total_cost_usd,
                duration_ms,
                num_turns,
                ..
            } => {
                self.result = Some(ResultSummary {
                    subtype: subtype.clone(),
                    is_error: *is_error,
                    text: result.clone(),
                    cost: total_cost_usd.unwrap_or(0.0).max(0.0),
                    duration_ms: *duration_ms,
                    num_turns: num_turns.unwrap_or(0),
                });
            }
            _ => {}
        }
    }

    pub fn has_result(&self) -> bool {
        self.result.is_some()
    }

    /// Build the response. Without a `result` message the last assistant text
    /// stands in, and turns/cost are unknown.
    pub fn finish(self, elapsed: Duration) -> Response {
        let elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        let mut response = match self.result {
            Some(result) => Response {
                content: result.text.or(self.last_text).unwrap_or_default(),
                cost: result.cost,
                duration_ms: result.duration_ms.unwrap_or(elapsed_ms),
                num_turns: result.num_turns,
                is_error: result.is_error,
                error_type: if result.is_error { result.subtype } else { None },
                ..Default::default()
            },
            None => Response {
                content: self.last_text.unwrap_or_default(),
                duration_ms: elapsed_ms,
                ..Default::default()
            },
        };
        response.session_id = self.session_id;
        response.tools_used = self.tools_used;
        response
    }
}
