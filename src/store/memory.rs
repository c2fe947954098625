//! In-process store

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use super::{ChatId, ChatStore, Message, Project, ProjectId, ProjectStore, Role, StoreError};

#[derive(Default)]
pub struct MemoryStore {
    projects: Mutex<HashMap<ProjectId, Project>>,
    chats: Mutex<HashMap<ChatId, Vec<Message>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style seeding for tests and demos
    pub fn with_project(mut self, project: Project) -> Self {
        self.projects.get_mut().insert(project.id, project);
        self
    }
}

#[async_trait]
impl ProjectStore for MemoryStore {
    async fn load_project(&self, id: ProjectId) -> Result<Project, StoreError> {
        self.projects
            .lock()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::ProjectNotFound(id))
    }

    async fn save_project(&self, project: &Project) -> Result<(), StoreError> {
        self.projects.lock().await.insert(project.id, project.clone());
        Ok(())
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn append_message(
        &self,
        chat_id: ChatId,
        role: Role,
        content: &str,
        images: &[String],
    ) -> Result<Message, StoreError> {
        let mut chats = self.chats.lock().await;
        let transcript = chats.entry(chat_id).or_default();
        let message = Message {
            id: transcript.len() as i64 + 1,
            chat_id,
            role,
            content: content.to_string(),
            images: images.to_vec(),
            created_at: Utc::now(),
        };
        transcript.push(message.clone());
        Ok(message)
    }

    async fn list_messages(&self, chat_id: ChatId) -> Result<Vec<Message>, StoreError> {
        Ok(self.chats.lock().await.get(&chat_id).cloned().unwrap_or_default())
    }
}
