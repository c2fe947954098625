//! Persistence boundary for projects, services and chat transcripts
//!
//! The orchestration layer only needs two things from storage: load a
//! project with its services, and append/list the messages of a chat.
//! Both are async traits so the manager never knows what backs them.
//!
//! Two stores ship with the crate:
//! - `MemoryStore` - process-local, used by tests and ephemeral runs
//! - `JsonStore` - one pretty-printed JSON file per project and per chat

pub mod json;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use json::JsonStore;
pub use memory::MemoryStore;

pub type ProjectId = i64;
pub type ChatId = i64;
pub type ServiceId = i64;

/// Error type for store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("project {0} not found")]
    ProjectNotFound(ProjectId),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid stored data: {0}")]
    Serde(#[from] serde_json::Error),
}

/// How much the owner of a project wants to see under the hood.
/// Shapes the tone of the generated plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UserType {
    WebDesigner,
    #[default]
    LearningToCode,
    ExpertDeveloper,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UserProfile {
    pub user_type: UserType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    Frontend,
    Backend,
}

impl ServiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Frontend => "frontend",
            ServiceKind::Backend => "backend",
        }
    }
}

/// Technology stack a service is built from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stack {
    pub title: String,
    /// Stack-specific guidance appended to the system prompts
    #[serde(default)]
    pub prompt: String,
    /// Container image the sandbox is started from
    pub image: String,
    #[serde(default)]
    pub start_command: Option<String>,
}

/// One independently deployable part of a project
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub id: ServiceId,
    pub kind: ServiceKind,
    pub stack: Stack,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    #[serde(default)]
    pub custom_instructions: Option<String>,
    #[serde(default)]
    pub owner: UserProfile,
    pub services: Vec<Service>,
}

impl Project {
    /// First service of the given kind
    pub fn service(&self, kind: ServiceKind) -> Option<&Service> {
        self.services.iter().find(|s| s.kind == kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// A persisted chat message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: i64,
    pub chat_id: ChatId,
    pub role: Role,
    pub content: String,
    /// Base64 data URLs attached by the user
    #[serde(default)]
    pub images: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn load_project(&self, id: ProjectId) -> Result<Project, StoreError>;

    async fn save_project(&self, project: &Project) -> Result<(), StoreError>;
}

/// Append-only chat transcripts, ordered by creation
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn append_message(
        &self,
        chat_id: ChatId,
        role: Role,
        content: &str,
        images: &[String],
    ) -> Result<Message, StoreError>;

    async fn list_messages(&self, chat_id: ChatId) -> Result<Vec<Message>, StoreError>;
}
