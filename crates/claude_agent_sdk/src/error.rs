use thiserror::Error;

/// Failures surfaced by the subprocess transport (C3).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,
    #[error("transport is closed")]
    Closed,
    #[error("write failed: {0}")]
    WriteFailed(String),
    #[error("failed to launch claude: {0}")]
    LaunchFailed(String),
    #[error("claude process terminated unexpectedly (exit code {0:?})")]
    ProcessTerminated(Option<i32>),
    #[error("frame stream already has a consumer")]
    AlreadySubscribed,
    #[error("failed to decode frame: {0}")]
    Decode(String),
}

/// Failures surfaced by the control handler (C4).
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control request {0} timed out")]
    Timeout(String),
    #[error("control request {0} was cancelled")]
    Cancelled(String),
    #[error("control request {0} failed: {1}")]
    ResponseError(String, String),
    #[error("unknown control subtype: {0}")]
    UnknownSubtype(String),
    #[error("invalid control message: {0}")]
    InvalidMessage(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Failures surfaced by the hook registry (C5).
#[derive(Debug, Error)]
pub enum HookError {
    #[error("no hook registered with callback id {0}")]
    CallbackNotFound(String),
    #[error("unsupported hook event: {0}")]
    UnsupportedHookEvent(String),
    #[error("invalid hook input: {0}")]
    InvalidInput(String),
    #[error("hook callback panicked: {0}")]
    CallbackPanicked(String),
    #[error("hook callback {0} exceeded its registered timeout")]
    Timeout(String),
}

/// Failures surfaced by the in-process tool server router (C6).
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("unknown mcp server: {0}")]
    UnknownServer(String),
    #[error("a server named {0} is already registered")]
    DuplicateServer(String),
    #[error("unsupported method: {0}")]
    UnsupportedMethod(String),
}

/// Failures surfaced by the session coordinator (C7).
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is closed")]
    SessionClosed,
    #[error("session is not initialized")]
    NotInitialized,
    #[error("session initialization failed: {0}")]
    InitializationFailed(String),
    #[error("the message stream already has a consumer")]
    AlreadyStarted,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Control(#[from] ControlError),
    #[error(transparent)]
    Tool(#[from] ToolError),
}

/// Umbrella error type for callers that don't need to distinguish component families.
#[derive(Debug, Error)]
pub enum SdkError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Control(#[from] ControlError),
    #[error(transparent)]
    Hook(#[from] HookError),
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error(transparent)]
    Session(#[from] SessionError),
}
