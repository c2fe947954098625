//! Model access for the agent loop
//!
//! `ModelClient` is the seam between the agent and whatever serves the
//! model. The shipped implementation talks to Ollama's `/api/chat` endpoint
//! with streaming and tool calling; tests substitute scripted clients.

pub mod client;
pub mod tool_use;

use async_trait::async_trait;
use futures_util::stream::{BoxStream, StreamExt};
use thiserror::Error;

pub use client::OllamaClient;
pub use tool_use::{ChatMessage, ChatResponse, FunctionCall, Tool, ToolCall, ToolFunction};

/// Error type for model calls
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("model server returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("model error: {0}")]
    Remote(String),
    #[error("empty response from model")]
    EmptyResponse,
}

/// One increment of a streamed model reply
#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent {
    /// Text fragment, in order
    Content(String),
    /// The model asked for one or more tools
    ToolCalls(Vec<ToolCall>),
}

pub type ModelStream = BoxStream<'static, Result<ModelEvent, ModelError>>;

/// Everything needed for one chat completion
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<Tool>,
    pub temperature: f32,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            tools: Vec::new(),
            temperature: 0.0,
        }
    }

    pub fn with_tools(mut self, tools: Vec<Tool>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Start a streaming completion
    async fn stream_chat(&self, request: ChatRequest) -> Result<ModelStream, ModelError>;

    /// Run a completion to the end and return the concatenated text.
    /// Tool calls are ignored.
    async fn complete(&self, request: ChatRequest) -> Result<String, ModelError> {
        let mut stream = self.stream_chat(request).await?;
        let mut text = String::new();
        while let Some(event) = stream.next().await {
            if let ModelEvent::Content(fragment) = event? {
                text.push_str(&fragment);
            }
        }
        Ok(text)
    }
}
