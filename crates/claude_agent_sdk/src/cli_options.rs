//! Launch configuration for the subprocess (§6.1/§6.2): binary resolution, CLI
//! argv construction, and builder ergonomics.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Serialize;

use crate::wire::PermissionMode;

/// Builder-style launch configuration for a [`crate::session::Session`].
#[derive(Debug, Clone, Default)]
pub struct ClaudeAgentOptions {
    pub(crate) binary: Option<PathBuf>,
    pub(crate) working_dir: Option<PathBuf>,
    pub(crate) env: BTreeMap<String, String>,
    pub(crate) model: Option<String>,
    pub(crate) permission_mode: Option<PermissionMode>,
    pub(crate) system_prompt: Option<String>,
    pub(crate) append_system_prompt: Option<String>,
    pub(crate) allowed_tools: Vec<String>,
    pub(crate) disallowed_tools: Vec<String>,
    pub(crate) max_turns: Option<u32>,
    pub(crate) extra_args: Vec<String>,
}

impl ClaudeAgentOptions {
    pub fn builder() -> ClaudeAgentOptionsBuilder {
        ClaudeAgentOptionsBuilder::default()
    }

    pub fn working_dir(&self) -> Option<&std::path::Path> {
        self.working_dir.as_deref()
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.system_prompt.as_deref()
    }

    pub fn append_system_prompt(&self) -> Option<&str> {
        self.append_system_prompt.as_deref()
    }

    /// Resolves the binary to launch: explicit override, then `CLAUDE_BINARY`, then
    /// `claude` on `PATH`.
    pub fn resolve_binary(&self) -> PathBuf {
        if let Some(binary) = self.binary.as_ref() {
            return binary.clone();
        }
        if let Ok(value) = std::env::var("CLAUDE_BINARY") {
            if !value.trim().is_empty() {
                return PathBuf::from(value);
            }
        }
        PathBuf::from("claude")
    }

    /// Builds the CLI argv. Always carries the structured-I/O flags the control
    /// protocol depends on (§6).
    pub fn argv(&self) -> Vec<String> {
        let mut args = vec![
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--input-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ];

        if let Some(model) = self.model.as_ref() {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if let Some(mode) = self.permission_mode {
            args.push("--permission-mode".to_string());
            args.push(permission_mode_arg(mode).to_string());
        }
        if !self.allowed_tools.is_empty() {
            args.push("--allowedTools".to_string());
            args.push(self.allowed_tools.join(","));
        }
        if !self.disallowed_tools.is_empty() {
            args.push("--disallowedTools".to_string());
            args.push(self.disallowed_tools.join(","));
        }
        if let Some(max_turns) = self.max_turns {
            args.push("--max-turns".to_string());
            args.push(max_turns.to_string());
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

fn permission_mode_arg(mode: PermissionMode) -> &'static str {
    match mode {
        PermissionMode::Default => "default",
        PermissionMode::AcceptEdits => "acceptEdits",
        PermissionMode::BypassPermissions => "bypassPermissions",
        PermissionMode::Plan => "plan",
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClaudeAgentOptionsBuilder {
    options: ClaudeAgentOptions,
}

impl ClaudeAgentOptionsBuilder {
    pub fn binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.options.binary = Some(binary.into());
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.options.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.env.insert(key.into(), value.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.options.model = Some(model.into());
        self
    }

    pub fn permission_mode(mut self, mode: PermissionMode) -> Self {
        self.options.permission_mode = Some(mode);
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.options.system_prompt = Some(prompt.into());
        self
    }

    pub fn append_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.options.append_system_prompt = Some(prompt.into());
        self
    }

    pub fn allowed_tool(mut self, tool: impl Into<String>) -> Self {
        self.options.allowed_tools.push(tool.into());
        self
    }

    pub fn disallowed_tool(mut self, tool: impl Into<String>) -> Self {
        self.options.disallowed_tools.push(tool.into());
        self
    }

    pub fn max_turns(mut self, max_turns: u32) -> Self {
        self.options.max_turns = Some(max_turns);
        self
    }

    pub fn extra_arg(mut self, arg: impl Into<String>) -> Self {
        self.options.extra_args.push(arg.into());
        self
    }

    pub fn build(self) -> ClaudeAgentOptions {
        self.options
    }
}

/// One stdio-launched MCP server entry for `--mcp-config` (§6.2).
#[derive(Debug, Clone, Serialize)]
pub struct StdioMcpServerConfig {
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

/// Writes an `{"mcpServers": {...}}` config file at `path` for use with `--mcp-config`.
pub fn write_stdio_mcp_config(
    path: &std::path::Path,
    servers: &BTreeMap<String, StdioMcpServerConfig>,
) -> std::io::Result<()> {
    let document = serde_json::json!({ "mcpServers": servers });
    let bytes = serde_json::to_vec_pretty(&document)?;
    std::fs::write(path, bytes)
}
