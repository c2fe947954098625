//! File-backed store
//!
//! Layout under the base directory:
//!
//! ```text
//! <base>/projects/<project_id>.json   Project (pretty-printed)
//! <base>/chats/<chat_id>.json         Vec<Message>, oldest first
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use super::{ChatId, ChatStore, Message, Project, ProjectId, ProjectStore, Role, StoreError};

pub struct JsonStore {
    base_dir: PathBuf,
    /// Serializes read-modify-write cycles on chat files
    write_lock: Mutex<()>,
}

impl JsonStore {
    /// Create a store rooted at `base_dir`, creating its subdirectories
    pub fn new(base_dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(base_dir.join("projects"))?;
        std::fs::create_dir_all(base_dir.join("chats"))?;
        Ok(Self {
            base_dir,
            write_lock: Mutex::new(()),
        })
    }

    /// Create with default directory (~/.sparkvisor)
    pub fn default_store() -> std::io::Result<Self> {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::new(home.join(".sparkvisor"))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn project_path(&self, id: ProjectId) -> PathBuf {
        self.base_dir.join("projects").join(format!("{}.json", id))
    }

    fn chat_path(&self, id: ChatId) -> PathBuf {
        self.base_dir.join("chats").join(format!("{}.json", id))
    }

    async fn read_chat(&self, chat_id: ChatId) -> Result<Vec<Message>, StoreError> {
        match tokio::fs::read_to_string(self.chat_path(chat_id)).await {
            Ok(json) => Ok(serde_json::from_str(&json)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ProjectStore for JsonStore {
    async fn load_project(&self, id: ProjectId) -> Result<Project, StoreError> {
        let json = match tokio::fs::read_to_string(self.project_path(id)).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::ProjectNotFound(id))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&json)?)
    }

    async fn save_project(&self, project: &Project) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(project)?;
        tokio::fs::write(self.project_path(project.id), json).await?;
        Ok(())
    }
}

#[async_trait]
impl ChatStore for JsonStore {
    async fn append_message(
        &self,
        chat_id: ChatId,
        role: Role,
        content: &str,
        images: &[String],
    ) -> Result<Message, StoreError> {
        let _guard = self.write_lock.lock().await;

        let mut transcript = self.read_chat(chat_id).await?;
        let message = Message {
            id: transcript.last().map(|m| m.id + 1).unwrap_or(1),
            chat_id,
            role,
            content: content.to_string(),
            images: images.to_vec(),
            created_at: Utc::now(),
        };
        transcript.push(message.clone());

        let json = serde_json::to_string_pretty(&transcript)?;
        tokio::fs::write(self.chat_path(chat_id), json).await?;
        Ok(message)
    }

    async fn list_messages(&self, chat_id: ChatId) -> Result<Vec<Message>, StoreError> {
        self.read_chat(chat_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Service, ServiceKind, Stack, UserProfile, UserType};

    fn project() -> Project {
        Project {
            id: 42,
            name: "todo app".into(),
            custom_instructions: Some("use tailwind".into()),
            owner: UserProfile {
                user_type: UserType::ExpertDeveloper,
            },
            services: vec![Service {
                id: 1,
                kind: ServiceKind::Backend,
                stack: Stack {
                    title: "Next.js".into(),
                    prompt: String::new(),
                    image: "node:20".into(),
                    start_command: None,
                },
            }],
        }
    }

    #[tokio::test]
    async fn test_project_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = JsonStore::new(dir.path()).unwrap();
            store.save_project(&project()).await.unwrap();
        }
        let store = JsonStore::new(dir.path()).unwrap();
        let loaded = store.load_project(42).await.unwrap();
        assert_eq!(loaded.name, "todo app");
        assert_eq!(loaded.owner.user_type, UserType::ExpertDeveloper);
        assert_eq!(loaded.services[0].kind, ServiceKind::Backend);
    }

    #[tokio::test]
    async fn test_unknown_project_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path()).unwrap();
        assert!(matches!(
            store.load_project(5).await,
            Err(StoreError::ProjectNotFound(5))
        ));
    }

    #[tokio::test]
    async fn test_chat_append_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path()).unwrap();

        assert!(store.list_messages(3).await.unwrap().is_empty());

        store
            .append_message(3, Role::User, "add a settings page", &["data:image/png;base64,AA==".into()])
            .await
            .unwrap();
        let reply = store.append_message(3, Role::Assistant, "done", &[]).await.unwrap();
        assert_eq!(reply.id, 2);

        let messages = store.list_messages(3).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].images.len(), 1);
        assert_eq!(messages[1].content, "done");
    }
}
