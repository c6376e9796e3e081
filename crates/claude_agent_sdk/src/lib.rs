#![forbid(unsafe_code)]
//! Async Rust SDK driving the Claude Code CLI as a cooperating subprocess over its
//! bidirectional `stream-json` control protocol.
//!
//! The crate owns the hard concurrency problem documented in the design notes: a
//! subprocess transport (`transport`), a bidirectional control-protocol handler
//! that correlates request/response pairs across both directions at once
//! (`control`), an in-process tool server router answering JSON-RPC calls tunneled
//! over the same pipe (`tools`), a hook registry dispatching named lifecycle
//! callbacks on the CLI's behalf (`hooks`), and a session coordinator that binds
//! all of the above to one message stream with deterministic shutdown (`session`).
//!
//! Spawning the CLI's argv and any on-disk MCP config it consumes are treated as
//! external collaborators and live in `cli_options`, kept intentionally thin.

mod cli_options;
mod control;
mod error;
mod framer;
mod future;
mod hooks;
mod session;
mod tools;
mod transport;
mod wire;

pub use cli_options::{ClaudeAgentOptions, ClaudeAgentOptionsBuilder, StdioMcpServerConfig, write_stdio_mcp_config};
pub use control::{CanUseToolCall, CanUseToolHandler, HookCallbackHandler, McpMessageHandler};
pub use error::{ControlError, HookError, SdkError, SessionError, ToolError, TransportError};
pub use framer::LineFramer;
pub use hooks::{
    HookBaseInput, HookEvent, HookRegistry, NotificationInput, PermissionRequestInput,
    PostToolUseFailureInput, PostToolUseInput, PreCompactInput, PreToolUseInput,
    SessionEndInput, SessionStartInput, StopInput, SubagentStartInput, SubagentStopInput,
    UserPromptSubmitInput,
};
pub use session::{MessageStream, PermissionCallback, Session};
pub use tools::{ToolCallResult, ToolContent, ToolDecl, ToolRouter, ToolServer};
pub use transport::{FrameResult, FrameStream, Transport};
pub use wire::{
    ControlOutcome, ControlRequestFrame, ControlResponseFrame, Frame, HookOutput, InboundRequest,
    OutboundRequest, PermissionDecision, PermissionMode, PermissionResult,
    PreToolUseHookSpecificOutput,
};
