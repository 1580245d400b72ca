use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One step of a plan reported by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanEntry {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

/// Typed item of a prompt's event sequence.
///
/// `PromptResponse` and `Error` are terminal: nothing follows them.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProtocolEvent {
    AgentMessageChunk {
        text: String,
    },
    AgentThoughtChunk {
        text: String,
    },
    ToolCallStart {
        tool_call_id: String,
        title: String,
        kind: Option<String>,
        status: Option<String>,
        raw: Value,
    },
    ToolCallProgress {
        tool_call_id: String,
        status: Option<String>,
        raw: Value,
    },
    PlanUpdate {
        entries: Vec<PlanEntry>,
    },
    ModeUpdate {
        mode_id: String,
    },
    PromptResponse {
        stop_reason: String,
    },
    /// `code` is the agent's JSON-RPC error code when the prompt itself
    /// failed; locally detected failures carry none.
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<i64>,
    },
}

impl ProtocolEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProtocolEvent::PromptResponse { .. } | ProtocolEvent::Error { .. }
        )
    }
}

fn str_field(v: &Value, key: &str) -> Option<String> {
    v.get(key).and_then(Value::as_str).map(str::to_string)
}

fn chunk_text(update: &Value) -> Option<String> {
    let content = update.get("content")?;
    match content.get("type").and_then(Value::as_str) {
        Some("text") | None => content.get("text").and_then(Value::as_str).map(str::to_string),
        Some(_) => None,
    }
}

/// Map `session/update` params to an event.
///
/// Returns the session id it was addressed to and the event, or `None` for
/// update kinds that are not surfaced (user echoes, command lists, session
/// info, unknown kinds, non-text chunks).
pub fn parse_session_update(params: &Value) -> Option<(Option<String>, ProtocolEvent)> {
    let session_id = str_field(params, "sessionId");
    let update = params.get("update")?;
    let kind = update.get("sessionUpdate").and_then(Value::as_str)?;

    let event = match kind {
        "agent_message_chunk" => ProtocolEvent::AgentMessageChunk {
            text: chunk_text(update)?,
        },
        "agent_thought_chunk" => ProtocolEvent::AgentThoughtChunk {
            text: chunk_text(update)?,
        },
        "tool_call" => ProtocolEvent::ToolCallStart {
            tool_call_id: str_field(update, "toolCallId").unwrap_or_default(),
            title: str_field(update, "title").unwrap_or_default(),
            kind: str_field(update, "kind"),
            status: str_field(update, "status"),
            raw: update.clone(),
        },
        "tool_call_update" => ProtocolEvent::ToolCallProgress {
            tool_call_id: str_field(update, "toolCallId").unwrap_or_default(),
            status: str_field(update, "status"),
            raw: update.clone(),
        },
        "plan" => ProtocolEvent::PlanUpdate {
            entries: update
                .get("entries")
                .cloned()
                .and_then(|e| serde_json::from_value(e).ok())
                .unwrap_or_default(),
        },
        "current_mode_update" => ProtocolEvent::ModeUpdate {
            mode_id: str_field(update, "currentModeId").or_else(|| str_field(update, "modeId"))?,
        },
        "user_message_chunk" | "available_commands_update" | "session_info_update" => return None,
        other => {
            tracing::trace!(kind = other, "ignoring unknown session update");
            return None;
        }
    };
    Some((session_id, event))
}
