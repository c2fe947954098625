//! Tools the model may call during the EXECUTE phase

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

use super::AgentError;
use crate::llm::{Tool, ToolCall};
use crate::metrics::TOOL_CALLS;
use crate::sandbox::{Sandbox, SandboxError};

/// Returned to the model when no sandbox is bound yet
pub const STILL_BOOTING: &str = "This environment is still booting up! Try again in a minute.";

/// Recoverable tool failure. The text goes back to the model; the turn continues.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("missing required argument `{0}`")]
    MissingArgument(&'static str),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

/// A callable tool: `{name, description, parameters, invoke(args) -> text}`
#[async_trait]
pub trait AgentTool: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// JSON Schema of the arguments object
    fn parameters(&self) -> Value;

    async fn invoke(&self, args: &Value) -> Result<String, ToolError>;

    fn definition(&self) -> Tool {
        Tool::function(self.name(), self.description(), self.parameters())
    }
}

/// Runs shell commands inside the bound sandbox
pub struct RunCommandTool {
    sandbox: Option<Arc<dyn Sandbox>>,
}

impl RunCommandTool {
    pub fn new(sandbox: Option<Arc<dyn Sandbox>>) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl AgentTool for RunCommandTool {
    fn name(&self) -> &'static str {
        "run_command"
    }

    fn description(&self) -> &'static str {
        "Run a shell command in the project sandbox. Use for installing packages or reading the content of files. NEVER use to modify the content of files."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {"type": "string"},
                "workdir": {
                    "type": "string",
                    "description": "The directory to run the command in. Defaults to /app"
                }
            },
            "required": ["command"]
        })
    }

    async fn invoke(&self, args: &Value) -> Result<String, ToolError> {
        let Some(sandbox) = &self.sandbox else {
            return Ok(STILL_BOOTING.to_string());
        };
        let command = args["command"]
            .as_str()
            .ok_or(ToolError::MissingArgument("command"))?;
        let workdir = args["workdir"].as_str();

        let output = match sandbox.run_command(command, workdir).await {
            Ok(output) => output,
            Err(SandboxError::NotReady(_)) => return Ok(STILL_BOOTING.to_string()),
            Err(e) => return Err(e.into()),
        };
        debug!(command, output_len = output.len(), "command finished");

        if output.is_empty() {
            Ok("<empty response>".to_string())
        } else {
            Ok(output)
        }
    }
}

/// Records a page the client should navigate to when the turn completes
pub struct NavigateTool {
    working_page: Arc<Mutex<Option<String>>>,
}

impl NavigateTool {
    pub fn new(working_page: Arc<Mutex<Option<String>>>) -> Self {
        Self { working_page }
    }
}

#[async_trait]
impl AgentTool for NavigateTool {
    fn name(&self) -> &'static str {
        "navigate_to"
    }

    fn description(&self) -> &'static str {
        "Trigger the user's browser to navigate to the given path (e.g. /settings)"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"}
            },
            "required": ["path"]
        })
    }

    async fn invoke(&self, args: &Value) -> Result<String, ToolError> {
        let path = args["path"]
            .as_str()
            .ok_or(ToolError::MissingArgument("path"))?;
        *self
            .working_page
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(path.to_string());
        Ok(format!("Navigating user to {}", path))
    }
}

/// The tool set offered to the model for one turn
pub struct ToolRegistry {
    tools: Vec<Box<dyn AgentTool>>,
}

impl ToolRegistry {
    pub fn new(tools: Vec<Box<dyn AgentTool>>) -> Self {
        Self { tools }
    }

    pub fn definitions(&self) -> Vec<Tool> {
        self.tools.iter().map(|t| t.definition()).collect()
    }

    /// Resolve and run a tool call.
    ///
    /// An unknown name is fatal for the turn. Failures inside a known tool
    /// come back as `Error: ...` text for the model to react to.
    pub async fn invoke(&self, call: &ToolCall) -> Result<String, AgentError> {
        let name = call.function.name.as_str();
        let tool = self
            .tools
            .iter()
            .find(|t| t.name() == name)
            .ok_or_else(|| AgentError::UnknownTool(name.to_string()))?;

        TOOL_CALLS.with_label_values(&[tool.name()]).inc();
        let span = info_span!("tool_call", tool = tool.name(), otel.name = "tool_call");

        // some models send arguments as a JSON-encoded string
        let args = match &call.function.arguments {
            Value::String(raw) => serde_json::from_str(raw).unwrap_or(Value::Null),
            other => other.clone(),
        };

        match tool.invoke(&args).instrument(span).await {
            Ok(output) => Ok(output),
            Err(e) => Ok(format!("Error: {}", e)),
        }
    }
}
