//! Ollama `/api/chat` client with streaming and tool calling

use async_trait::async_trait;
use futures_util::stream::StreamExt;
use tracing::debug;

use super::{ChatRequest, ChatResponse, ModelClient, ModelError, ModelEvent, ModelStream};

/// Client for Ollama's /api/chat endpoint
#[derive(Clone)]
pub struct OllamaClient {
    base_url: String,
    client: reqwest::Client,
}

impl OllamaClient {
    /// Create a new Ollama client
    ///
    /// # Arguments
    /// * `base_url` - The base URL of the Ollama server (e.g., "http://localhost:11434")
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn request_body(request: &ChatRequest) -> Result<serde_json::Value, ModelError> {
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": request.messages,
            "stream": true,
            "options": {
                "temperature": request.temperature
            }
        });
        if !request.tools.is_empty() {
            body["tools"] = serde_json::to_value(&request.tools)?;
        }
        Ok(body)
    }
}

#[async_trait]
impl ModelClient for OllamaClient {
    /// Stream a chat completion
    ///
    /// Ollama answers with newline-delimited JSON. Network chunks do not line
    /// up with those lines, so bytes are buffered until a full line arrives.
    async fn stream_chat(&self, request: ChatRequest) -> Result<ModelStream, ModelError> {
        let endpoint = format!("{}/api/chat", self.base_url);
        let body = Self::request_body(&request)?;

        debug!(model = %request.model, messages = request.messages.len(), tools = request.tools.len(), "starting chat stream");

        let response = self.client.post(&endpoint).json(&body).send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Status { status, body });
        }

        let mut bytes_stream = response.bytes_stream();

        let events = async_stream::try_stream! {
            let mut buffer = LineBuffer::default();
            let mut finished = false;

            while let Some(chunk) = bytes_stream.next().await {
                let chunk = chunk?;
                for line in buffer.push(&chunk) {
                    for event in parse_line(&line)? {
                        yield event;
                    }
                    if is_done(&line) {
                        finished = true;
                    }
                }
                if finished {
                    break;
                }
            }

            if !finished {
                if let Some(line) = buffer.finish() {
                    for event in parse_line(&line)? {
                        yield event;
                    }
                }
            }
        };

        Ok(events.boxed())
    }
}

/// Accumulates bytes and hands out complete lines
#[derive(Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line).trim().to_string();
            if !line.is_empty() {
                lines.push(line);
            }
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        let rest = String::from_utf8_lossy(&self.pending).trim().to_string();
        self.pending.clear();
        if rest.is_empty() {
            None
        } else {
            Some(rest)
        }
    }
}

fn parse_line(line: &str) -> Result<Vec<ModelEvent>, ModelError> {
    let chunk: ChatResponse = serde_json::from_str(line)?;
    if let Some(error) = chunk.error {
        return Err(ModelError::Remote(error));
    }

    let mut events = Vec::new();
    if let Some(message) = chunk.message {
        if !message.content.is_empty() {
            events.push(ModelEvent::Content(message.content));
        }
        if let Some(calls) = message.tool_calls.filter(|c| !c.is_empty()) {
            events.push(ModelEvent::ToolCalls(calls));
        }
    }
    Ok(events)
}

fn is_done(line: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(line)
        .map(|v| v["done"].as_bool() == Some(true))
        .unwrap_or(false)
}
