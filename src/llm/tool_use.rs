//! Chat wire types for Ollama's `/api/chat` endpoint with tool calling

use serde::{Deserialize, Serialize};

/// A message in a chat conversation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String, // "system", "user", "assistant", "tool"
    pub content: String,
    /// Raw base64 image payloads (no data-URL prefix)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl ChatMessage {
    fn with_role(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
            images: None,
            tool_calls: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role("assistant", content)
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self::with_role("tool", content)
    }

    /// Attach images given as data URLs or raw base64
    pub fn with_images(mut self, images: &[String]) -> Self {
        if !images.is_empty() {
            self.images = Some(images.iter().map(|i| strip_data_url(i).to_string()).collect());
        }
        self
    }

    /// Assistant message carrying the tool calls the model asked for
    pub fn assistant_tool_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        let mut message = Self::assistant(content);
        message.tool_calls = Some(calls);
        message
    }
}

/// `data:image/png;base64,AAAA` -> `AAAA`
fn strip_data_url(image: &str) -> &str {
    match image.split_once(";base64,") {
        Some((prefix, data)) if prefix.starts_with("data:") => data,
        _ => image,
    }
}

/// A tool call from the model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub function: FunctionCall,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            function: FunctionCall {
                name: name.into(),
                arguments,
            },
        }
    }
}

/// Function call details
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Tool definition for the model
#[derive(Debug, Clone, Serialize)]
pub struct Tool {
    #[serde(rename = "type")]
    pub tool_type: String, // Always "function"
    pub function: ToolFunction,
}

impl Tool {
    pub fn function(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            tool_type: "function".to_string(),
            function: ToolFunction {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

/// Function specification for a tool
#[derive(Debug, Clone, Serialize)]
pub struct ToolFunction {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value, // JSON Schema
}

/// One NDJSON line of a streaming `/api/chat` response
#[derive(Debug, Clone, Deserialize)]
pub struct ChatResponse {
    pub message: Option<ChatMessage>,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub eval_count: u32,
    #[serde(default)]
    pub eval_duration: u64,
    #[serde(default)]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_images_lose_data_url_prefix() {
        let msg = ChatMessage::user("look").with_images(&[
            "data:image/png;base64,iVBORw0".to_string(),
            "rawbase64".to_string(),
        ]);
        assert_eq!(
            msg.images,
            Some(vec!["iVBORw0".to_string(), "rawbase64".to_string()])
        );
    }

    #[test]
    fn test_optional_fields_are_omitted() {
        let json = serde_json::to_value(ChatMessage::system("hi")).unwrap();
        assert_eq!(json, serde_json::json!({"role": "system", "content": "hi"}));
    }

    #[test]
    fn test_tool_serializes_with_type_field() {
        let tool = Tool::function("navigate_to", "go", serde_json::json!({"type": "object"}));
        let json = serde_json::to_value(tool).unwrap();
        assert_eq!(json["type"], "function");
        assert_eq!(json["function"]["name"], "navigate_to");
    }

    #[test]
    fn test_parse_tool_call_chunk() {
        let line = r#"{"model":"qwen3","message":{"role":"assistant","content":"","tool_calls":[{"function":{"name":"run_command","arguments":{"command":"ls"}}}]},"done":false}"#;
        let chunk: ChatResponse = serde_json::from_str(line).unwrap();
        let calls = chunk.message.unwrap().tool_calls.unwrap();
        assert_eq!(calls[0].function.name, "run_command");
        assert_eq!(calls[0].function.arguments["command"], "ls");
    }
}
