//! Agent module for LLM-driven code edits
//!
//! One `Agent` per chat. Each turn plans with the main model, then executes
//! with tools while streaming into a patch engine.
//!
//! # Architecture
//!
//! ```text
//! ProjectManager ─► Agent::stream_turn ─► Ollama /api/chat (plan, no tools)
//!                         │
//!                         ▼
//!                   Ollama /api/chat (execute, with tools)
//!                         │            │
//!                         │            └─ run_command ─► Sandbox
//!                         ▼
//!                   PatchEngine::ingest ─► Agent::finalize ─► files written
//! ```

pub mod controller;
pub mod prompts;
pub mod tools;

pub use controller::{Agent, AgentChunk, AgentConfig, AgentError, AgentMode, TurnInput};
pub use tools::{AgentTool, NavigateTool, RunCommandTool, ToolError, ToolRegistry, STILL_BOOTING};
