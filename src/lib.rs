//! Sparkvisor - sandboxed coding-agent supervisor
//!
//! Keeps one sandbox per project service alive, runs chat turns through a
//! plan/execute agent that edits those sandboxes, and fans results out to
//! every connected listener.
//!
//! # Modules
//!
//! - `sandbox` - Sandbox handle/provider traits, status state machine, supervisor, Docker backend
//! - `llm` - Streaming model client and the Ollama `/api/chat` implementation
//! - `patch` - Turns streamed code blocks into file writes
//! - `agent` - The per-chat agent loop and its tools
//! - `store` - Project and chat persistence
//! - `project` - Listener fan-out, project managers and the session registry
//! - `dashboard` - Read-only status and metrics over HTTP
//! - `config`, `telemetry`, `metrics` - Configuration, tracing and Prometheus metrics
//!
//! # Quick Start
//!
//! ```ignore
//! use sparkvisor::{ChannelListener, SessionRegistry};
//!
//! let manager = registry.get_or_create(project_id).await?;
//! let (listener, mut events) = ChannelListener::new();
//! manager.register_connection(chat_id, listener);
//! manager.on_message(chat_id, "Add a settings page.".into(), vec![]).await?;
//! ```

pub mod agent;
pub mod config;
pub mod dashboard;
pub mod llm;
pub mod metrics;
pub mod patch;
pub mod project;
pub mod sandbox;
pub mod store;
pub mod telemetry;

// Re-export commonly used types at crate root for convenience
pub use agent::{Agent, AgentConfig, AgentMode};
pub use config::Config;
pub use project::{ChannelListener, Event, ManagerConfig, ProjectManager, SessionRegistry, TurnError};
pub use sandbox::{SandboxStatus, SandboxSupervisor};
