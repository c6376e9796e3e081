//! The session coordinator (C7): wires the transport, control handler, hook
//! registry, and tool router into one handle, and runs the message loop that
//! drives a live conversation.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, warn};

use crate::cli_options::ClaudeAgentOptions;
use crate::control::{CanUseToolCall, ControlHandler};
use crate::error::SessionError;
use crate::future::BoxFuture;
use crate::hooks::{HookEvent, HookRegistry};
use crate::tools::{ToolRouter, ToolServer};
use crate::transport::{FrameStream, Transport};
use crate::wire::{Frame, HookOutput, OutboundRequest, PermissionMode, PermissionResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionPhase {
    Created,
    Initialized,
    Running,
    Closed,
}

pub type PermissionCallback =
    Arc<dyn Fn(CanUseToolCall) -> BoxFuture<'static, PermissionResult> + Send + Sync>;

/// The stream of regular conversation events (`user`/`assistant`/`system`/`result`).
pub struct MessageStream {
    rx: mpsc::UnboundedReceiver<Result<Value, SessionError>>,
}

impl MessageStream {
    pub async fn next(&mut self) -> Option<Result<Value, SessionError>> {
        self.rx.recv().await
    }
}

/// One live, connected conversation with the CLI.
pub struct Session {
    options: ClaudeAgentOptions,
    transport: Arc<Transport>,
    control: Arc<ControlHandler>,
    hooks: Arc<HookRegistry>,
    tools: Arc<ToolRouter>,
    permission_callback: Mutex<Option<PermissionCallback>>,
    session_id: Arc<Mutex<Option<String>>>,
    phase: Mutex<SessionPhase>,
    started: AtomicBool,
    cancel_tx: watch::Sender<bool>,
    cancel_rx: Mutex<Option<watch::Receiver<bool>>>,
}

impl Session {
    /// Spawns the CLI subprocess and constructs a fresh, uninitialized session.
    pub async fn connect(options: ClaudeAgentOptions) -> Result<Self, SessionError> {
        let binary = options.resolve_binary();
        let argv = options.argv();
        let transport = Transport::spawn(&binary, &argv, options.working_dir(), options.env()).await?;
        let (cancel_tx, cancel_rx) = watch::channel(false);

        Ok(Session {
            options,
            transport: Arc::new(transport),
            control: Arc::new(ControlHandler::new()),
            hooks: Arc::new(HookRegistry::new()),
            tools: Arc::new(ToolRouter::new()),
            permission_callback: Mutex::new(None),
            session_id: Arc::new(Mutex::new(None)),
            phase: Mutex::new(SessionPhase::Created),
            started: AtomicBool::new(false),
            cancel_tx,
            cancel_rx: Mutex::new(Some(cancel_rx)),
        })
    }

    async fn require_not_started(&self) -> Result<(), SessionError> {
        let phase = *self.phase.lock().await;
        if phase == SessionPhase::Running || phase == SessionPhase::Closed {
            return Err(SessionError::AlreadyStarted);
        }
        Ok(())
    }

    /// Registers a typed hook callback. Must be called before [`Session::start`].
    pub async fn register_hook<I, F, Fut>(
        &self,
        event: HookEvent,
        matcher: Option<String>,
        timeout: Duration,
        callback: F,
    ) -> Result<String, SessionError>
    where
        I: serde::de::DeserializeOwned + Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookOutput> + Send + 'static,
    {
        self.require_not_started().await?;
        Ok(self.hooks.register(event, matcher, timeout, callback).await)
    }

    /// Registers an in-process MCP tool server. Must be called before [`Session::start`].
    pub async fn register_tool_server(&self, server: ToolServer) -> Result<(), SessionError> {
        self.require_not_started().await?;
        self.tools.register_server(server).await?;
        Ok(())
    }

    /// Installs the permission callback consulted on every inbound `can_use_tool`
    /// request. Must be called before [`Session::start`].
    pub async fn set_permission_callback(
        &self,
        callback: PermissionCallback,
    ) -> Result<(), SessionError> {
        self.require_not_started().await?;
        *self.permission_callback.lock().await = Some(callback);
        Ok(())
    }

    fn hook_dispatch_handler(&self) -> crate::control::HookCallbackHandler {
        let hooks = Arc::clone(&self.hooks);
        Arc::new(move |callback_id, input, _tool_use_id| {
            let hooks = Arc::clone(&hooks);
            Box::pin(async move { hooks.dispatch(&callback_id, input).await })
        })
    }

    fn mcp_message_handler(&self) -> crate::control::McpMessageHandler {
        let tools = Arc::clone(&self.tools);
        Arc::new(move |server_name, message| {
            let tools = Arc::clone(&tools);
            Box::pin(async move { tools.handle_message(&server_name, message).await })
        })
    }

    fn can_use_tool_handler(&self, callback: Option<PermissionCallback>) -> crate::control::CanUseToolHandler {
        Arc::new(move |call: CanUseToolCall| {
            let callback = callback.clone();
            Box::pin(async move {
                match callback {
                    None => PermissionResult::allow(),
                    Some(callback) => match tokio::spawn(async move { callback(call).await }).await {
                        Ok(result) => result,
                        Err(join_err) => PermissionResult::deny(format!(
                            "permission callback panicked: {join_err}"
                        )),
                    },
                }
            })
        })
    }

    async fn install_handlers(&self) {
        let permission_callback = self.permission_callback.lock().await.clone();
        self.control
            .install_can_use_tool(self.can_use_tool_handler(permission_callback))
            .await;
        self.control
            .install_hook_callback(self.hook_dispatch_handler())
            .await;
        self.control
            .install_mcp_message(self.mcp_message_handler())
            .await;
    }

    /// Sends the `initialize` control request. A no-op if already past `Created`.
    pub async fn initialize(&self) -> Result<(), SessionError> {
        {
            let mut phase = self.phase.lock().await;
            if *phase != SessionPhase::Created {
                return Ok(());
            }
            *phase = SessionPhase::Initialized;
        }

        self.install_handlers().await;

        let hooks = self.hooks.initialize_snapshot().await;
        let server_names = self.tools.server_names().await;
        let sdk_mcp_servers = if server_names.is_empty() {
            None
        } else {
            Some(server_names)
        };

        let request = OutboundRequest::Initialize {
            hooks,
            sdk_mcp_servers,
            system_prompt: self.options.system_prompt().map(str::to_string),
            append_system_prompt: self.options.append_system_prompt().map(str::to_string),
        };

        self.control
            .send_request(&self.transport, request, None)
            .await
            .map_err(|err| SessionError::InitializationFailed(err.to_string()))?;
        Ok(())
    }

    /// Starts the message loop and returns the stream of regular conversation events.
    /// May only be called once; a second call returns `AlreadyStarted`.
    pub async fn start(&self) -> Result<MessageStream, SessionError> {
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SessionError::AlreadyStarted);
        }

        self.initialize().await?;
        *self.phase.lock().await = SessionPhase::Running;

        let frames = self.transport.read_frames()?;
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let cancel_rx = self
            .cancel_rx
            .lock()
            .await
            .take()
            .expect("start() runs at most once, guarded by `started`");

        tokio::spawn(run_message_loop(
            frames,
            Arc::clone(&self.transport),
            Arc::clone(&self.control),
            Arc::clone(&self.session_id),
            out_tx,
            cancel_rx,
        ));

        Ok(MessageStream { rx: out_rx })
    }

    pub async fn session_id(&self) -> Option<String> {
        self.session_id.lock().await.clone()
    }

    pub async fn interrupt(&self) -> Result<(), SessionError> {
        self.control
            .send_request(&self.transport, OutboundRequest::Interrupt, None)
            .await?;
        Ok(())
    }

    pub async fn set_model(&self, model: Option<String>) -> Result<(), SessionError> {
        self.control
            .send_request(&self.transport, OutboundRequest::SetModel { model }, None)
            .await?;
        Ok(())
    }

    pub async fn set_permission_mode(&self, mode: PermissionMode) -> Result<(), SessionError> {
        self.control
            .send_request(&self.transport, OutboundRequest::SetPermissionMode { mode }, None)
            .await?;
        Ok(())
    }

    pub async fn set_max_thinking_tokens(&self, n: Option<u64>) -> Result<(), SessionError> {
        self.control
            .send_request(&self.transport, OutboundRequest::SetMaxThinkingTokens { n }, None)
            .await?;
        Ok(())
    }

    pub async fn rewind_files(
        &self,
        user_message_id: String,
        dry_run: Option<bool>,
    ) -> Result<Value, SessionError> {
        Ok(self
            .control
            .send_request(
                &self.transport,
                OutboundRequest::RewindFiles {
                    user_message_id,
                    dry_run,
                },
                None,
            )
            .await?)
    }

    pub async fn mcp_status(&self) -> Result<Value, SessionError> {
        Ok(self
            .control
            .send_request(&self.transport, OutboundRequest::McpStatus, None)
            .await?)
    }

    pub async fn mcp_reconnect(&self, server_name: String) -> Result<Value, SessionError> {
        Ok(self
            .control
            .send_request(&self.transport, OutboundRequest::McpReconnect { server_name }, None)
            .await?)
    }

    pub async fn mcp_toggle(&self, server_name: String, enabled: bool) -> Result<Value, SessionError> {
        Ok(self
            .control
            .send_request(
                &self.transport,
                OutboundRequest::McpToggle {
                    server_name,
                    enabled,
                },
                None,
            )
            .await?)
    }

    pub async fn mcp_set_servers(&self, servers: Value) -> Result<Value, SessionError> {
        Ok(self
            .control
            .send_request(&self.transport, OutboundRequest::McpSetServers { servers }, None)
            .await?)
    }

    /// Forwards one JSON-RPC envelope to an external MCP server the CLI manages,
    /// tunneled over `mcp_message` exactly like the inbound leg the tool router
    /// answers, but initiated from this side (spec.md §3's outbound `mcp_message`).
    pub async fn mcp_message(&self, server_name: String, message: Value) -> Result<Value, SessionError> {
        Ok(self
            .control
            .send_request(
                &self.transport,
                OutboundRequest::McpMessage {
                    server_name,
                    message,
                },
                None,
            )
            .await?)
    }

    /// Tears the session down: stops the message loop, fails pending control
    /// requests, and terminates the subprocess. Idempotent.
    pub async fn close(&self) {
        let _ = self.cancel_tx.send(true);
        self.transport.close().await;
        self.control.drain_closed().await;
        *self.phase.lock().await = SessionPhase::Closed;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // A `watch` value is latched, unlike `Notify::notify_waiters`: the loop's
        // receiver observes this change whenever it next polls, even if it hasn't
        // been polled even once yet (e.g. the session is dropped before the spawned
        // loop task gets its first turn).
        let _ = self.cancel_tx.send(true);
    }
}

/// Runs until the transport is exhausted or the session is closed, forwarding
/// regular events and dispatching control traffic.
async fn run_message_loop(
    mut frames: FrameStream,
    transport: Arc<Transport>,
    control: Arc<ControlHandler>,
    session_id: Arc<Mutex<Option<String>>>,
    out_tx: mpsc::UnboundedSender<Result<Value, SessionError>>,
    mut cancel_rx: watch::Receiver<bool>,
) {
    let mut stdin_closed = false;

    loop {
        tokio::select! {
            // `changed()` fires on the next poll even for a value sent before this
            // task was ever scheduled, so a cancel racing the loop's startup is
            // never lost the way `Notify::notify_waiters` could lose one.
            _ = cancel_rx.changed() => {
                let _ = out_tx.send(Err(SessionError::SessionClosed));
                break;
            }
            frame = frames.next() => {
                match frame {
                    None => break,
                    Some(Ok(Frame::Regular(value))) => {
                        if is_system_init(&value) {
                            if let Some(id) = value.get("session_id").and_then(Value::as_str) {
                                *session_id.lock().await = Some(id.to_string());
                            }
                        }
                        if !stdin_closed && is_result(&value) {
                            stdin_closed = true;
                            let _ = transport.end_input().await;
                        }
                        if out_tx.send(Ok(value)).is_err() {
                            break;
                        }
                    }
                    Some(Ok(Frame::ControlRequest(request))) => {
                        let control = Arc::clone(&control);
                        let transport = Arc::clone(&transport);
                        tokio::spawn(async move {
                            control.handle_inbound(request, &transport).await;
                        });
                    }
                    Some(Ok(Frame::ControlResponse(response))) => {
                        control.resolve_response(response.request_id, response.outcome).await;
                    }
                    Some(Ok(Frame::ControlCancel { request_id })) => {
                        control.resolve_cancel(request_id).await;
                    }
                    Some(Ok(Frame::KeepAlive)) => {}
                    Some(Ok(Frame::Unknown(ty))) => {
                        warn!(frame_type = %ty, "dropping unrecognized frame");
                    }
                    Some(Err(err @ crate::error::TransportError::Decode(_))) => {
                        debug!(%err, "dropping undecodable line");
                    }
                    Some(Err(err)) => {
                        let _ = out_tx.send(Err(SessionError::Transport(err)));
                        break;
                    }
                }
            }
        }
    }

    control.drain_closed().await;
    transport.close().await;
}

fn is_system_init(value: &Value) -> bool {
    value.get("type").and_then(Value::as_str) == Some("system")
        && value.get("subtype").and_then(Value::as_str) == Some("init")
}

fn is_result(value: &Value) -> bool {
    value.get("type").and_then(Value::as_str) == Some("result")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_system_init_frame() {
        let value = serde_json::json!({"type": "system", "subtype": "init", "session_id": "abc"});
        assert!(is_system_init(&value));
    }

    #[test]
    fn detects_result_frame() {
        let value = serde_json::json!({"type": "result", "subtype": "success"});
        assert!(is_result(&value));
        let other = serde_json::json!({"type": "assistant"});
        assert!(!is_result(&other));
    }

    #[tokio::test]
    async fn connect_fails_fast_on_missing_binary() {
        let options = ClaudeAgentOptions::builder()
            .binary("/definitely/not/a/real/claude/binary")
            .build();
        let result = Session::connect(options).await;
        assert!(result.is_err());
    }

    /// Drives `run_message_loop` with a scripted frame sequence (via
    /// `FrameStream::from_parts`) against a real but otherwise-idle child ("cat"),
    /// so the assertions below are about the loop's own state machine, not about
    /// process-pipe timing.
    async fn harness() -> (
        Arc<Transport>,
        mpsc::UnboundedSender<crate::transport::FrameResult>,
        FrameStream,
    ) {
        let transport = Arc::new(
            Transport::spawn(&std::path::PathBuf::from("cat"), &[], None, &Default::default())
                .await
                .expect("cat is assumed available in the test environment"),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        (transport, tx, FrameStream::from_parts(rx))
    }

    #[tokio::test]
    async fn first_result_frame_closes_stdin_exactly_once() {
        let (transport, frame_tx, frames) = harness().await;
        let control = Arc::new(ControlHandler::new());
        let session_id = Arc::new(Mutex::new(None));
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_message_loop(
            frames,
            Arc::clone(&transport),
            control,
            Arc::clone(&session_id),
            out_tx,
            cancel_rx,
        ));

        frame_tx
            .send(Ok(Frame::Regular(
                serde_json::json!({"type": "system", "subtype": "init", "session_id": "sess-1"}),
            )))
            .unwrap();
        frame_tx
            .send(Ok(Frame::Regular(serde_json::json!({"type": "result"}))))
            .unwrap();

        assert!(out_rx.recv().await.unwrap().is_ok());
        assert!(out_rx.recv().await.unwrap().is_ok());

        // Give the loop a moment to act on the first result frame before we probe.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(session_id.lock().await.as_deref(), Some("sess-1"));
        assert!(transport.write("{}").await.is_err(), "stdin should already be closed");

        // A second result frame must not panic or otherwise misbehave; end_input is
        // idempotent so there is nothing further to observe than "still closed".
        frame_tx
            .send(Ok(Frame::Regular(serde_json::json!({"type": "result"}))))
            .unwrap();
        assert!(out_rx.recv().await.unwrap().is_ok());
        assert!(transport.write("{}").await.is_err());

        drop(frame_tx);
        transport.close().await;
    }

    #[tokio::test]
    async fn dropping_session_terminates_the_loop_with_session_closed() {
        let (transport, _frame_tx, frames) = harness().await;
        let control = Arc::new(ControlHandler::new());
        let session_id = Arc::new(Mutex::new(None));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_message_loop(
            frames,
            Arc::clone(&transport),
            control,
            session_id,
            out_tx,
            cancel_rx,
        ));

        // Simulate the session handle being dropped: its `Drop` impl sends `true`.
        // This happens before the spawned loop task is guaranteed to have been
        // polled even once; a latched `watch` value still gets observed on the
        // loop's first `changed()` poll, unlike an edge-triggered `Notify`.
        cancel_tx.send(true).unwrap();

        let outcome = out_rx.recv().await.unwrap();
        assert!(matches!(outcome, Err(SessionError::SessionClosed)));
        transport.close().await;
    }

    #[tokio::test]
    async fn cancel_fired_before_loop_is_spawned_still_closes_it() {
        // Reproduces the race precisely: the cancel signal is sent before the
        // loop task exists at all, not merely before it's polled.
        let (transport, _frame_tx, frames) = harness().await;
        let control = Arc::new(ControlHandler::new());
        let session_id = Arc::new(Mutex::new(None));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();

        cancel_tx.send(true).unwrap();

        tokio::spawn(run_message_loop(
            frames,
            Arc::clone(&transport),
            control,
            session_id,
            out_tx,
            cancel_rx,
        ));

        let outcome = out_rx.recv().await.unwrap();
        assert!(matches!(outcome, Err(SessionError::SessionClosed)));
        transport.close().await;
    }
}
