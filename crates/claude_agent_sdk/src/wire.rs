//! The message classifier (C2) and the wire-format data model (§3, §6).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TransportError;

/// The regular-event subtypes the CLI is known to emit (`type` field of a `regular` frame).
const REGULAR_TYPES: &[&str] = &["user", "assistant", "system", "result", "stream_event"];

/// One classified line of the wire protocol.
#[derive(Debug, Clone)]
pub enum Frame {
    Regular(Value),
    ControlRequest(ControlRequestFrame),
    ControlResponse(ControlResponseFrame),
    ControlCancel { request_id: String },
    KeepAlive,
    /// A frame whose top-level `type` is not one this SDK recognizes. Logged and dropped
    /// by the session — never forwarded as a regular event.
    Unknown(String),
}

#[derive(Debug, Clone)]
pub struct ControlRequestFrame {
    pub request_id: String,
    /// Raw `request` object; decoded into [`InboundRequest`] by the control handler.
    pub request: Value,
}

#[derive(Debug, Clone)]
pub struct ControlResponseFrame {
    pub request_id: String,
    pub outcome: ControlOutcome,
}

#[derive(Debug, Clone)]
pub enum ControlOutcome {
    Success(Value),
    Error(String),
}

impl Frame {
    /// Parses one text line into a classified frame. Only JSON-parse/shape failures
    /// of an otherwise-recognized envelope are reported as errors; an unrecognized
    /// `type` is reported as `Frame::Unknown`, not an error.
    pub fn classify(line: &str) -> Result<Frame, TransportError> {
        let value: Value =
            serde_json::from_str(line).map_err(|err| TransportError::Decode(err.to_string()))?;
        let ty = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| TransportError::Decode("frame is missing a \"type\" field".into()))?;

        match ty {
            "control_request" => {
                let request_id = required_str(&value, "request_id")?;
                let request = value.get("request").cloned().unwrap_or(Value::Null);
                Ok(Frame::ControlRequest(ControlRequestFrame {
                    request_id,
                    request,
                }))
            }
            "control_response" => {
                let response = value
                    .get("response")
                    .ok_or_else(|| TransportError::Decode("control_response missing response".into()))?;
                let request_id = required_str(response, "request_id")?;
                let subtype = response
                    .get("subtype")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let outcome = match subtype {
                    "success" => ControlOutcome::Success(
                        response.get("response").cloned().unwrap_or(Value::Null),
                    ),
                    "error" => ControlOutcome::Error(
                        response
                            .get("error")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown error")
                            .to_string(),
                    ),
                    other => {
                        return Err(TransportError::Decode(format!(
                            "unknown control_response subtype: {other}"
                        )))
                    }
                };
                Ok(Frame::ControlResponse(ControlResponseFrame {
                    request_id,
                    outcome,
                }))
            }
            "control_cancel_request" => Ok(Frame::ControlCancel {
                request_id: required_str(&value, "request_id")?,
            }),
            "keep_alive" => Ok(Frame::KeepAlive),
            other if REGULAR_TYPES.contains(&other) => Ok(Frame::Regular(value)),
            other => Ok(Frame::Unknown(other.to_string())),
        }
    }
}

fn required_str(value: &Value, field: &str) -> Result<String, TransportError> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| TransportError::Decode(format!("missing \"{field}\" field")))
}

/// Permission mode accepted by `set_permission_mode` and echoed in hook input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    Default,
    AcceptEdits,
    BypassPermissions,
    Plan,
}

/// SDK → CLI control request bodies (`request.subtype`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum OutboundRequest {
    Initialize {
        #[serde(skip_serializing_if = "Option::is_none")]
        hooks: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        sdk_mcp_servers: Option<Vec<String>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        system_prompt: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        append_system_prompt: Option<String>,
    },
    Interrupt,
    SetModel {
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },
    SetPermissionMode {
        mode: PermissionMode,
    },
    SetMaxThinkingTokens {
        #[serde(skip_serializing_if = "Option::is_none")]
        n: Option<u64>,
    },
    RewindFiles {
        user_message_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        dry_run: Option<bool>,
    },
    McpStatus,
    McpReconnect {
        server_name: String,
    },
    McpToggle {
        server_name: String,
        enabled: bool,
    },
    McpSetServers {
        servers: Value,
    },
    McpMessage {
        server_name: String,
        message: Value,
    },
}

/// CLI → SDK control request bodies (`request.subtype`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum InboundRequest {
    CanUseTool {
        tool_name: String,
        input: Value,
        tool_use_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        permission_suggestions: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        blocked_path: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        decision_reason: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
    },
    HookCallback {
        callback_id: String,
        input: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_use_id: Option<String>,
    },
    McpMessage {
        server_name: String,
        message: Value,
    },
}

/// Outbound response body to an inbound `can_use_tool` request (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "behavior", rename_all = "camelCase")]
pub enum PermissionResult {
    Allow {
        #[serde(skip_serializing_if = "Option::is_none")]
        updated_input: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        updated_permissions: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_use_id: Option<String>,
    },
    Deny {
        message: String,
        interrupt: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_use_id: Option<String>,
    },
}

impl PermissionResult {
    pub fn allow() -> Self {
        PermissionResult::Allow {
            updated_input: None,
            updated_permissions: None,
            tool_use_id: None,
        }
    }

    pub fn deny(message: impl Into<String>) -> Self {
        PermissionResult::Deny {
            message: message.into(),
            interrupt: false,
            tool_use_id: None,
        }
    }
}

/// `permissionDecision` carried by a `PreToolUse` hook's `hookSpecificOutput`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionDecision {
    Allow,
    Deny,
    Ask,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreToolUseHookSpecificOutput {
    pub hook_event_name: String,
    pub permission_decision: PermissionDecision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_decision_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_context: Option<String>,
}

/// Output shape every hook callback returns (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookOutput {
    #[serde(rename = "continue")]
    pub continue_: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suppress_output: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hook_specific_output: Option<Value>,
}

impl Default for HookOutput {
    fn default() -> Self {
        HookOutput {
            continue_: true,
            suppress_output: None,
            stop_reason: None,
            system_message: None,
            reason: None,
            hook_specific_output: None,
        }
    }
}

impl HookOutput {
    pub fn allow() -> Self {
        Self::default()
    }

    /// Convenience for `PreToolUse` hooks: deny the tool call with `reason`.
    pub fn deny(reason: impl Into<String>) -> Self {
        let specific = PreToolUseHookSpecificOutput {
            hook_event_name: "PreToolUse".to_string(),
            permission_decision: PermissionDecision::Deny,
            permission_decision_reason: Some(reason.into()),
            updated_input: None,
            additional_context: None,
        };
        HookOutput {
            hook_specific_output: Some(
                serde_json::to_value(specific).expect("hook specific output is serializable"),
            ),
            ..Default::default()
        }
    }
}
