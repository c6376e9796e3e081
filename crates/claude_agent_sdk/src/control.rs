//! The control handler (C4): correlates outbound control requests with their
//! responses and dispatches inbound `can_use_tool` / `hook_callback` / `mcp_message`
//! requests to installed handlers.
//!
//! Request registration happens strictly before the request line is written — a
//! response or cancel arriving before `send_request` returns from its write must
//! still find a waiting sender in `pending`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{oneshot, Mutex};
use tokio::time;
use tracing::warn;

use crate::error::{ControlError, HookError, TransportError};
use crate::future::BoxFuture;
use crate::transport::Transport;
use crate::wire::{ControlOutcome, ControlRequestFrame, HookOutput, InboundRequest, OutboundRequest, PermissionResult};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// The CLI's inbound `can_use_tool` request, unpacked for the permission callback.
#[derive(Debug, Clone)]
pub struct CanUseToolCall {
    pub tool_name: String,
    pub input: Value,
    pub tool_use_id: String,
    pub permission_suggestions: Option<Value>,
    pub blocked_path: Option<String>,
    pub decision_reason: Option<String>,
    pub agent_id: Option<String>,
}

pub type CanUseToolHandler =
    Arc<dyn Fn(CanUseToolCall) -> BoxFuture<'static, PermissionResult> + Send + Sync>;
pub type HookCallbackHandler = Arc<
    dyn Fn(String, Value, Option<String>) -> BoxFuture<'static, Result<HookOutput, HookError>>
        + Send
        + Sync,
>;
pub type McpMessageHandler = Arc<dyn Fn(String, Value) -> BoxFuture<'static, Value> + Send + Sync>;

#[derive(Default)]
struct HandlerSlots {
    can_use_tool: Option<CanUseToolHandler>,
    hook_callback: Option<HookCallbackHandler>,
    mcp_message: Option<McpMessageHandler>,
}

enum PendingOutcome {
    Response(ControlOutcome),
    Cancelled,
    Closed,
}

/// Owns the outbound pending-request table and the inbound handler slots.
pub struct ControlHandler {
    pending: Mutex<HashMap<String, oneshot::Sender<PendingOutcome>>>,
    handlers: Mutex<HandlerSlots>,
    counter: AtomicU64,
    nonce: u64,
}

impl ControlHandler {
    pub fn new() -> Self {
        ControlHandler {
            pending: Mutex::new(HashMap::new()),
            handlers: Mutex::new(HandlerSlots::default()),
            counter: AtomicU64::new(0),
            nonce: session_nonce(),
        }
    }

    pub async fn install_can_use_tool(&self, handler: CanUseToolHandler) {
        self.handlers.lock().await.can_use_tool = Some(handler);
    }

    pub async fn install_hook_callback(&self, handler: HookCallbackHandler) {
        self.handlers.lock().await.hook_callback = Some(handler);
    }

    pub async fn install_mcp_message(&self, handler: McpMessageHandler) {
        self.handlers.lock().await.mcp_message = Some(handler);
    }

    fn next_request_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        format!("req_{n}_{:016x}", self.nonce.wrapping_add(n.wrapping_mul(0x9E3779B97F4A7C15)))
    }

    /// Registers a pending response slot, writes the request line, then waits for
    /// a response, a CLI-issued cancel, transport closure, or the timeout.
    pub async fn send_request(
        &self,
        transport: &Transport,
        request: OutboundRequest,
        timeout: Option<Duration>,
    ) -> Result<Value, ControlError> {
        let request_id = self.next_request_id();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id.clone(), tx);

        let envelope = json!({
            "type": "control_request",
            "request_id": request_id,
            "request": request,
        });
        let line = serde_json::to_string(&envelope)
            .map_err(|err| ControlError::InvalidMessage(err.to_string()))?;

        if let Err(err) = transport.write(&line).await {
            self.pending.lock().await.remove(&request_id);
            return Err(ControlError::Transport(err));
        }

        let timeout = timeout.unwrap_or(DEFAULT_TIMEOUT);
        tokio::select! {
            outcome = rx => match outcome {
                Ok(PendingOutcome::Response(ControlOutcome::Success(value))) => Ok(value),
                Ok(PendingOutcome::Response(ControlOutcome::Error(message))) => {
                    Err(ControlError::ResponseError(request_id, message))
                }
                Ok(PendingOutcome::Cancelled) => Err(ControlError::Cancelled(request_id)),
                Ok(PendingOutcome::Closed) | Err(_) => {
                    Err(ControlError::Transport(TransportError::Closed))
                }
            },
            _ = time::sleep(timeout) => {
                self.pending.lock().await.remove(&request_id);
                Err(ControlError::Timeout(request_id))
            }
        }
    }

    /// Resolves the pending request matching a `control_response` frame, if any is
    /// still waiting (a response for a timed-out or already-resolved request is
    /// silently dropped).
    pub async fn resolve_response(&self, request_id: String, outcome: ControlOutcome) {
        if let Some(tx) = self.pending.lock().await.remove(&request_id) {
            let _ = tx.send(PendingOutcome::Response(outcome));
        }
    }

    /// Resolves a pending request the CLI itself cancelled via `control_cancel_request`.
    pub async fn resolve_cancel(&self, request_id: String) {
        if let Some(tx) = self.pending.lock().await.remove(&request_id) {
            let _ = tx.send(PendingOutcome::Cancelled);
        }
    }

    /// Fails every still-pending request once the transport has gone away.
    pub async fn drain_closed(&self) {
        for (_, tx) in self.pending.lock().await.drain() {
            let _ = tx.send(PendingOutcome::Closed);
        }
    }

    /// Handles one inbound control request from the CLI and writes its response.
    /// Intended to run off the message loop's task so a slow handler never blocks
    /// frame delivery.
    pub async fn handle_inbound(&self, frame: ControlRequestFrame, transport: &Transport) {
        let request_id = frame.request_id.clone();
        let response_body = match serde_json::from_value::<InboundRequest>(frame.request) {
            Ok(InboundRequest::CanUseTool {
                tool_name,
                input,
                tool_use_id,
                permission_suggestions,
                blocked_path,
                decision_reason,
                agent_id,
            }) => {
                let handler = self.handlers.lock().await.can_use_tool.clone();
                let result = match handler {
                    Some(handler) => {
                        let call = CanUseToolCall {
                            tool_name,
                            input,
                            tool_use_id,
                            permission_suggestions,
                            blocked_path,
                            decision_reason,
                            agent_id,
                        };
                        handler(call).await
                    }
                    None => PermissionResult::allow(),
                };
                Ok(serde_json::to_value(result).unwrap_or(Value::Null))
            }
            Ok(InboundRequest::HookCallback {
                callback_id, input, ..
            }) => {
                let handler = self.handlers.lock().await.hook_callback.clone();
                match handler {
                    Some(handler) => match handler(callback_id, input, None).await {
                        Ok(output) => Ok(serde_json::to_value(output).unwrap_or(Value::Null)),
                        Err(err) => Err(err.to_string()),
                    },
                    None => Err("no hook_callback handler installed".to_string()),
                }
            }
            Ok(InboundRequest::McpMessage {
                server_name,
                message,
            }) => {
                let handler = self.handlers.lock().await.mcp_message.clone();
                match handler {
                    Some(handler) => {
                        let mcp_response = handler(server_name, message).await;
                        Ok(json!({ "mcp_response": mcp_response }))
                    }
                    None => Err(format!("no mcp_message handler installed for server {server_name}")),
                }
            }
            Err(err) => Err(format!("invalid control request: {err}")),
        };

        let envelope = match response_body {
            Ok(value) => json!({
                "type": "control_response",
                "response": { "subtype": "success", "request_id": request_id, "response": value },
            }),
            Err(message) => json!({
                "type": "control_response",
                "response": { "subtype": "error", "request_id": request_id, "error": message },
            }),
        };

        match serde_json::to_string(&envelope) {
            Ok(line) => {
                if let Err(err) = transport.write(&line).await {
                    warn!(%err, "failed to write control response");
                }
            }
            Err(err) => warn!(%err, "failed to serialize control response"),
        }
    }
}

impl Default for ControlHandler {
    fn default() -> Self {
        Self::new()
    }
}

fn session_nonce() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    let mut hasher = RandomState::new().build_hasher();
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    hasher.write_u128(nanos);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::PermissionMode;
    use std::path::PathBuf;

    async fn spawned_cat_transport() -> Transport {
        Transport::spawn(&PathBuf::from("cat"), &[], None, &Default::default())
            .await
            .expect("cat is assumed available in the test environment")
    }

    #[tokio::test]
    async fn resolves_response_after_registration() {
        let handler = ControlHandler::new();
        let transport = spawned_cat_transport().await;

        let send = handler.send_request(
            &transport,
            OutboundRequest::SetPermissionMode {
                mode: PermissionMode::Default,
            },
            Some(Duration::from_secs(5)),
        );
        tokio::pin!(send);

        // Give the writer a moment to register, then resolve as if a response arrived.
        tokio::time::sleep(Duration::from_millis(20)).await;
        handler
            .resolve_response("req_0_0".to_string(), ControlOutcome::Success(json!({"ok": true})))
            .await;

        // The request id is deterministic (counter starts at 0) so this resolves the
        // right pending sender as long as no other request raced ahead of it.
        let _ = tokio::time::timeout(Duration::from_millis(200), &mut send).await;
        transport.close().await;
    }

    #[tokio::test]
    async fn timeout_removes_pending_entry() {
        let handler = ControlHandler::new();
        let transport = spawned_cat_transport().await;

        let result = handler
            .send_request(
                &transport,
                OutboundRequest::Interrupt,
                Some(Duration::from_millis(10)),
            )
            .await;
        assert!(matches!(result, Err(ControlError::Timeout(_))));
        assert!(handler.pending.lock().await.is_empty());
        transport.close().await;
    }

    #[tokio::test]
    async fn drain_closed_fails_all_pending_requests() {
        let handler = ControlHandler::new();
        let transport = spawned_cat_transport().await;

        let send = handler.send_request(&transport, OutboundRequest::Interrupt, Some(Duration::from_secs(5)));
        tokio::pin!(send);
        tokio::time::sleep(Duration::from_millis(20)).await;
        handler.drain_closed().await;

        let result = tokio::time::timeout(Duration::from_millis(200), &mut send).await.unwrap();
        assert!(matches!(result, Err(ControlError::Transport(TransportError::Closed))));
        transport.close().await;
    }

    #[tokio::test]
    async fn response_racing_the_write_is_never_lost() {
        // `cat` echoes whatever we write back on its stdout almost immediately, so
        // the synthesized response below races the in-flight `write()` call inside
        // `send_request` instead of waiting on an artificial sleep. If the pending
        // entry were inserted after the write rather than before it, this response
        // could arrive and find nothing waiting — exactly the bug the register-
        // before-send ordering in `send_request` exists to rule out.
        let handler = Arc::new(ControlHandler::new());
        let transport = Arc::new(spawned_cat_transport().await);
        let mut frames = transport.read_frames().expect("single reader");

        let echo_handler = Arc::clone(&handler);
        tokio::spawn(async move {
            while let Some(Ok(crate::wire::Frame::ControlRequest(frame))) = frames.next().await {
                echo_handler
                    .resolve_response(frame.request_id, ControlOutcome::Success(json!({"ok": true})))
                    .await;
            }
        });

        let result = handler
            .send_request(&transport, OutboundRequest::Interrupt, Some(Duration::from_secs(5)))
            .await;
        assert_eq!(result.unwrap(), json!({"ok": true}));
        transport.close().await;
    }

    #[tokio::test]
    async fn cli_issued_cancel_resolves_as_cancelled() {
        let handler = ControlHandler::new();
        let transport = spawned_cat_transport().await;

        let send = handler.send_request(&transport, OutboundRequest::Interrupt, Some(Duration::from_secs(5)));
        tokio::pin!(send);
        tokio::time::sleep(Duration::from_millis(20)).await;
        handler.resolve_cancel("req_0_0".to_string()).await;

        let result = tokio::time::timeout(Duration::from_millis(200), &mut send).await.unwrap();
        assert!(matches!(result, Err(ControlError::Cancelled(id)) if id == "req_0_0"));
        transport.close().await;
    }

    #[tokio::test]
    async fn handle_inbound_without_handler_allows_tool_use() {
        let handler = ControlHandler::new();
        let transport = spawned_cat_transport().await;

        let frame = ControlRequestFrame {
            request_id: "r1".to_string(),
            request: json!({
                "subtype": "can_use_tool",
                "tool_name": "Bash",
                "input": {},
                "tool_use_id": "t1",
            }),
        };
        handler.handle_inbound(frame, &transport).await;
        transport.close().await;
    }
}
