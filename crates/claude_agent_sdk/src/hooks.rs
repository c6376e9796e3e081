//! The hook registry (C5): typed callbacks for named lifecycle events, dispatched
//! by ID when the CLI invokes `hook_callback`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::error::HookError;
use crate::future::BoxFuture;
use crate::wire::HookOutput;

/// The event set named in spec.md §4.5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookEvent {
    PreToolUse,
    PostToolUse,
    PostToolUseFailure,
    UserPromptSubmit,
    Stop,
    SubagentStart,
    SubagentStop,
    PreCompact,
    PermissionRequest,
    SessionStart,
    SessionEnd,
    Notification,
}

impl HookEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookEvent::PreToolUse => "PreToolUse",
            HookEvent::PostToolUse => "PostToolUse",
            HookEvent::PostToolUseFailure => "PostToolUseFailure",
            HookEvent::UserPromptSubmit => "UserPromptSubmit",
            HookEvent::Stop => "Stop",
            HookEvent::SubagentStart => "SubagentStart",
            HookEvent::SubagentStop => "SubagentStop",
            HookEvent::PreCompact => "PreCompact",
            HookEvent::PermissionRequest => "PermissionRequest",
            HookEvent::SessionStart => "SessionStart",
            HookEvent::SessionEnd => "SessionEnd",
            HookEvent::Notification => "Notification",
        }
    }
}

/// Fields every hook input carries (§6), flattened into each event's typed struct.
#[derive(Debug, Clone, Deserialize)]
pub struct HookBaseInput {
    pub session_id: String,
    pub transcript_path: String,
    pub cwd: String,
    pub permission_mode: String,
    pub hook_event_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PreToolUseInput {
    #[serde(flatten)]
    pub base: HookBaseInput,
    pub tool_name: String,
    pub tool_input: Value,
    pub tool_use_id: String,
    #[serde(default)]
    pub permission_suggestions: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PostToolUseInput {
    #[serde(flatten)]
    pub base: HookBaseInput,
    pub tool_name: String,
    pub tool_input: Value,
    pub tool_use_id: String,
    pub tool_response: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PostToolUseFailureInput {
    #[serde(flatten)]
    pub base: HookBaseInput,
    pub tool_name: String,
    pub tool_input: Value,
    pub tool_use_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserPromptSubmitInput {
    #[serde(flatten)]
    pub base: HookBaseInput,
    pub prompt: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StopInput {
    #[serde(flatten)]
    pub base: HookBaseInput,
    #[serde(default)]
    pub stop_hook_active: bool,
    #[serde(default)]
    pub is_interrupt: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubagentStartInput {
    #[serde(flatten)]
    pub base: HookBaseInput,
    pub agent_id: String,
    #[serde(default)]
    pub agent_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubagentStopInput {
    #[serde(flatten)]
    pub base: HookBaseInput,
    pub agent_id: String,
    #[serde(default)]
    pub agent_transcript_path: Option<String>,
    #[serde(default)]
    pub stop_hook_active: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PreCompactInput {
    #[serde(flatten)]
    pub base: HookBaseInput,
    pub trigger: String,
    #[serde(default)]
    pub custom_instructions: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PermissionRequestInput {
    #[serde(flatten)]
    pub base: HookBaseInput,
    pub tool_name: String,
    pub tool_input: Value,
    #[serde(default)]
    pub permission_suggestions: Option<Value>,
    #[serde(default)]
    pub blocked_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionStartInput {
    #[serde(flatten)]
    pub base: HookBaseInput,
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionEndInput {
    #[serde(flatten)]
    pub base: HookBaseInput,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationInput {
    #[serde(flatten)]
    pub base: HookBaseInput,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub notification_type: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

/// One `{matcher, callback_ids, timeout}` group contributed by a single `register` call.
#[derive(Debug, Clone)]
struct HookGroup {
    matcher: Option<String>,
    callback_ids: Vec<String>,
    timeout: Duration,
}

type BoxedHookInvoke =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<HookOutput, HookError>> + Send + Sync>;

/// Holds registered hook callbacks and the per-event matcher configuration the CLI
/// needs at `initialize` time.
pub struct HookRegistry {
    next_id: AtomicU64,
    callbacks: Mutex<HashMap<String, (Duration, BoxedHookInvoke)>>,
    groups: Mutex<HashMap<HookEvent, Vec<HookGroup>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            callbacks: Mutex::new(HashMap::new()),
            groups: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a typed callback for `event`, returning its assigned `hook_<n>` ID.
    ///
    /// `callback` only ever sees the typed input for `event`; a shape mismatch
    /// between the wire payload and `I` surfaces as `HookError::InvalidInput` at
    /// dispatch time, not here.
    pub async fn register<I, F, Fut>(
        &self,
        event: HookEvent,
        matcher: Option<String>,
        timeout: Duration,
        callback: F,
    ) -> String
    where
        I: serde::de::DeserializeOwned + Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookOutput> + Send + 'static,
    {
        let id = format!("hook_{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let callback = Arc::new(callback);
        let invoke: BoxedHookInvoke = Arc::new(move |raw: Value| {
            let callback = Arc::clone(&callback);
            Box::pin(async move {
                let typed: I = serde_json::from_value(raw)
                    .map_err(|err| HookError::InvalidInput(err.to_string()))?;
                match tokio::spawn(async move { callback(typed).await }).await {
                    Ok(output) => Ok(output),
                    Err(join_err) => Err(HookError::CallbackPanicked(join_err.to_string())),
                }
            })
        });

        self.callbacks.lock().await.insert(id.clone(), (timeout, invoke));
        self.groups
            .lock()
            .await
            .entry(event)
            .or_default()
            .push(HookGroup {
                matcher,
                callback_ids: vec![id.clone()],
                timeout,
            });
        id
    }

    /// Invokes the callback registered under `callback_id` with the raw input
    /// dictionary, parsing it into the typed shape the callback was registered with.
    pub async fn dispatch(&self, callback_id: &str, raw_input: Value) -> Result<HookOutput, HookError> {
        let (timeout, invoke) = {
            let callbacks = self.callbacks.lock().await;
            callbacks
                .get(callback_id)
                .cloned()
                .ok_or_else(|| HookError::CallbackNotFound(callback_id.to_string()))?
        };
        match tokio::time::timeout(timeout, invoke(raw_input)).await {
            Ok(result) => result,
            Err(_) => Err(HookError::Timeout(callback_id.to_string())),
        }
    }

    /// Snapshots the per-event matcher configuration for the `initialize` control
    /// request. `None` when nothing is registered (the payload omits `hooks` entirely).
    pub async fn initialize_snapshot(&self) -> Option<Value> {
        let groups = self.groups.lock().await;
        if groups.is_empty() {
            return None;
        }
        let mut map = serde_json::Map::new();
        for (event, list) in groups.iter() {
            let entries: Vec<Value> = list
                .iter()
                .map(|group| {
                    json!({
                        "matcher": group.matcher,
                        "hookCallbackIds": group.callback_ids,
                        "timeout": group.timeout.as_secs(),
                    })
                })
                .collect();
            map.insert(event.as_str().to_string(), Value::Array(entries));
        }
        Some(Value::Object(map))
    }
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_pre_tool_use_input() -> Value {
        json!({
            "session_id": "s",
            "transcript_path": "",
            "cwd": "",
            "permission_mode": "default",
            "hook_event_name": "PreToolUse",
            "tool_name": "Bash",
            "tool_input": {"command": "ls"},
            "tool_use_id": "t1",
        })
    }

    #[tokio::test]
    async fn registers_and_dispatches_typed_callback() {
        let registry = HookRegistry::new();
        let id = registry
            .register(
                HookEvent::PreToolUse,
                Some("^Bash$".to_string()),
                Duration::from_secs(5),
                |input: PreToolUseInput| async move {
                    assert_eq!(input.tool_name, "Bash");
                    HookOutput::deny("nope")
                },
            )
            .await;
        assert_eq!(id, "hook_0");

        let output = registry
            .dispatch(&id, sample_pre_tool_use_input())
            .await
            .unwrap();
        let value = serde_json::to_value(&output).unwrap();
        assert_eq!(value["hookSpecificOutput"]["permissionDecision"], json!("deny"));
        assert_eq!(
            value["hookSpecificOutput"]["permissionDecisionReason"],
            json!("nope")
        );
    }

    #[tokio::test]
    async fn dispatch_unknown_callback_id_errors() {
        let registry = HookRegistry::new();
        let err = registry.dispatch("hook_404", json!({})).await.unwrap_err();
        assert!(matches!(err, HookError::CallbackNotFound(id) if id == "hook_404"));
    }

    #[tokio::test]
    async fn dispatch_invalid_input_errors() {
        let registry = HookRegistry::new();
        let id = registry
            .register(
                HookEvent::Stop,
                None,
                Duration::from_secs(1),
                |_input: StopInput| async move { HookOutput::allow() },
            )
            .await;
        let err = registry.dispatch(&id, json!({"not": "valid"})).await.unwrap_err();
        assert!(matches!(err, HookError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn initialize_snapshot_includes_registered_matchers() {
        let registry = HookRegistry::new();
        assert!(registry.initialize_snapshot().await.is_none());

        registry
            .register(
                HookEvent::PreToolUse,
                Some("^Bash$".to_string()),
                Duration::from_secs(30),
                |_input: PreToolUseInput| async move { HookOutput::allow() },
            )
            .await;

        let snapshot = registry.initialize_snapshot().await.unwrap();
        let group = &snapshot["PreToolUse"][0];
        assert_eq!(group["matcher"], json!("^Bash$"));
        assert_eq!(group["hookCallbackIds"], json!(["hook_0"]));
        assert_eq!(group["timeout"], json!(30));
    }

    #[tokio::test]
    async fn dispatch_bounds_a_hanging_callback_with_its_registered_timeout() {
        let registry = HookRegistry::new();
        let id = registry
            .register(
                HookEvent::Stop,
                None,
                Duration::from_millis(20),
                |_input: StopInput| async move {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    HookOutput::allow()
                },
            )
            .await;

        let input = json!({
            "session_id": "s",
            "transcript_path": "",
            "cwd": "",
            "permission_mode": "default",
            "hook_event_name": "Stop",
        });
        let err = registry.dispatch(&id, input).await.unwrap_err();
        assert!(matches!(err, HookError::Timeout(callback_id) if callback_id == id));
    }
}
