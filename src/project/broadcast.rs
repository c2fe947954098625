//! Listener fan-out for one chat
//!
//! Broadcasts iterate a snapshot of the listener set, so listeners can be
//! added or removed while a send is in progress. A listener whose send fails
//! is dropped from the set and the broadcast carries on.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::metrics::LIVE_LISTENERS;
use crate::sandbox::SandboxStatus;
use crate::store::{ChatId, Message, ProjectId, Role, ServiceId};

/// Aggregate status of a project's services
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProjectStatus {
    pub project_id: ProjectId,
    pub sandbox_statuses: BTreeMap<ServiceId, SandboxStatus>,
    /// Preview address per service, when published
    pub tunnels: BTreeMap<ServiceId, String>,
    pub backend_file_paths: Option<Vec<String>>,
    pub frontend_file_paths: Option<Vec<String>>,
    pub git_log: Option<String>,
    pub frontend_tunnel: Option<String>,
}

/// A persisted message, plus follow-ups and a navigation hint once a turn ends
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChatUpdate {
    pub chat_id: ChatId,
    pub message: Message,
    pub follow_ups: Vec<String>,
    pub navigate_to: Option<String>,
}

/// One streamed fragment of the assistant's reply
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChatChunk {
    pub role: Role,
    pub content: String,
    pub thinking_content: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "for_type", rename_all = "snake_case")]
pub enum Payload {
    Status(ProjectStatus),
    ChatUpdate(ChatUpdate),
    ChatChunk(ChatChunk),
}

/// Everything pushed to listeners
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum Event {
    Payload(Payload),
    Error { error: String },
}

impl Event {
    pub fn status(status: ProjectStatus) -> Self {
        Event::Payload(Payload::Status(status))
    }

    pub fn chat_update(update: ChatUpdate) -> Self {
        Event::Payload(Payload::ChatUpdate(update))
    }

    pub fn thinking(fragment: impl Into<String>) -> Self {
        Event::Payload(Payload::ChatChunk(ChatChunk {
            role: Role::Assistant,
            content: String::new(),
            thinking_content: fragment.into(),
        }))
    }

    pub fn content(fragment: impl Into<String>) -> Self {
        Event::Payload(Payload::ChatChunk(ChatChunk {
            role: Role::Assistant,
            content: fragment.into(),
            thinking_content: String::new(),
        }))
    }

    pub fn error(message: impl Into<String>) -> Self {
        Event::Error {
            error: message.into(),
        }
    }
}

#[derive(Debug, Error)]
#[error("listener connection closed")]
pub struct ListenerClosed;

/// A live connection interested in one chat
#[async_trait]
pub trait Listener: Send + Sync {
    async fn send(&self, event: &Event) -> Result<(), ListenerClosed>;

    /// Force-close the connection
    async fn close(&self);
}

/// Listener backed by an unbounded channel. The transport layer owns the
/// receiving half.
pub struct ChannelListener {
    tx: Mutex<Option<mpsc::UnboundedSender<Event>>>,
}

impl ChannelListener {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx: Mutex::new(Some(tx)) }), rx)
    }
}

#[async_trait]
impl Listener for ChannelListener {
    async fn send(&self, event: &Event) -> Result<(), ListenerClosed> {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        match tx.as_ref() {
            Some(tx) => tx.send(event.clone()).map_err(|_| ListenerClosed),
            None => Err(ListenerClosed),
        }
    }

    async fn close(&self) {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

pub type ListenerId = u64;

/// The listener set of one chat
#[derive(Default)]
pub struct Broadcaster {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(ListenerId, Arc<dyn Listener>)>>,
}

impl Broadcaster {
    pub fn add(&self, listener: Arc<dyn Listener>) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners().push((id, listener));
        LIVE_LISTENERS.inc();
        id
    }

    /// Returns whether the listener was present
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        let removed = listeners.len() < before;
        if removed {
            LIVE_LISTENERS.dec();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.listeners().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners().is_empty()
    }

    /// Send to every listener in the current snapshot
    pub async fn broadcast(&self, event: &Event) {
        let snapshot: Vec<_> = self.listeners().clone();
        for (id, listener) in snapshot {
            if listener.send(event).await.is_err() {
                debug!(listener_id = id, "dropping closed listener");
                self.remove(id);
            }
        }
    }

    /// Close and forget every listener
    pub async fn close_all(&self) {
        let drained: Vec<_> = self.listeners().drain(..).collect();
        LIVE_LISTENERS.sub(drained.len() as f64);
        for (_, listener) in drained {
            listener.close().await;
        }
    }

    fn listeners(&self) -> MutexGuard<'_, Vec<(ListenerId, Arc<dyn Listener>)>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
