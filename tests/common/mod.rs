//! Fakes shared by the integration tests

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::StreamExt;
use tokio::sync::{mpsc, Notify};

use sparkvisor::agent::prompts::COMMIT_SYSTEM_PROMPT;
use sparkvisor::llm::{ChatRequest, ModelClient, ModelError, ModelEvent, ModelStream, ToolCall};
use sparkvisor::project::{Event, Listener, ListenerClosed, ManagerConfig, Payload};
use sparkvisor::sandbox::{RetryPolicy, Sandbox, SandboxError, SandboxProvider, SandboxStatus};
use sparkvisor::store::{Project, Service, ServiceKind, Stack, UserProfile};
use sparkvisor::AgentConfig;

pub const MAIN_MODEL: &str = "main";
pub const FAST_MODEL: &str = "fast";

/// Shared, ordered record of what sandboxes and listeners saw
pub type Journal = Arc<Mutex<Vec<String>>>;

pub fn journal() -> Journal {
    Arc::new(Mutex::new(Vec::new()))
}

/// In-memory sandbox
pub struct FakeSandbox {
    pub up: AtomicBool,
    pub files: Mutex<BTreeMap<String, String>>,
    pub commits: Mutex<Vec<String>>,
    pub terminated: AtomicBool,
    /// When set, `terminate` waits for a permit on `terminate_gate`
    pub hold_terminate: AtomicBool,
    pub terminate_gate: Notify,
    journal: Journal,
}

impl FakeSandbox {
    pub fn new(journal: Journal) -> Arc<Self> {
        Arc::new(Self {
            up: AtomicBool::new(true),
            files: Mutex::new(BTreeMap::new()),
            commits: Mutex::new(Vec::new()),
            terminated: AtomicBool::new(false),
            hold_terminate: AtomicBool::new(false),
            terminate_gate: Notify::new(),
            journal,
        })
    }

    pub fn commit_count(&self) -> usize {
        self.commits.lock().unwrap().len()
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.files.lock().unwrap().get(path).cloned()
    }
}

#[async_trait]
impl Sandbox for FakeSandbox {
    async fn is_up(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }

    async fn run_command(&self, command: &str, _workdir: Option<&str>) -> Result<String, SandboxError> {
        self.journal.lock().unwrap().push(format!("run:{}", command));
        Ok(format!("ran {}", command))
    }

    async fn get_file_paths(&self) -> Result<Vec<String>, SandboxError> {
        Ok(self.files.lock().unwrap().keys().cloned().collect())
    }

    async fn read_file(&self, path: &str, missing_ok: bool) -> Result<String, SandboxError> {
        match self.files.lock().unwrap().get(path) {
            Some(content) => Ok(content.clone()),
            None if missing_ok => Ok(String::new()),
            None => Err(SandboxError::FileNotFound(path.to_string())),
        }
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError> {
        self.journal.lock().unwrap().push(format!("write:{}", path));
        self.files.lock().unwrap().insert(path.to_string(), content.to_string());
        Ok(())
    }

    async fn commit_changes(&self, message: &str) -> Result<(), SandboxError> {
        self.journal.lock().unwrap().push(format!("commit:{}", message));
        self.commits.lock().unwrap().push(message.to_string());
        Ok(())
    }

    async fn terminate(&self) -> Result<(), SandboxError> {
        self.journal.lock().unwrap().push("terminate".to_string());
        if self.hold_terminate.load(Ordering::SeqCst) {
            self.terminate_gate.notified().await;
        }
        self.terminated.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out the same sandbox for every service, or fails while `fail` is set
pub struct FakeProvider {
    pub sandbox: Arc<FakeSandbox>,
    pub fail: AtomicBool,
}

impl FakeProvider {
    pub fn new(sandbox: Arc<FakeSandbox>) -> Arc<Self> {
        Arc::new(Self {
            sandbox,
            fail: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl SandboxProvider for FakeProvider {
    async fn create_or_attach(&self, _service: &Service) -> Result<Arc<dyn Sandbox>, SandboxError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SandboxError::Backend("docker daemon unavailable".into()));
        }
        Ok(self.sandbox.clone())
    }
}

type Responder = Box<dyn Fn(&ChatRequest) -> Vec<ModelEvent> + Send + Sync>;

/// Model that answers each request through a routing closure
pub struct FakeModel {
    responder: Responder,
    /// When set, every EXECUTE stream waits for a permit before answering
    pub execute_gate: Option<Arc<Notify>>,
    pub requests: Mutex<Vec<ChatRequest>>,
}

impl FakeModel {
    pub fn new(responder: impl Fn(&ChatRequest) -> Vec<ModelEvent> + Send + Sync + 'static) -> Self {
        Self {
            responder: Box::new(responder),
            execute_gate: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Plan, then `execute` for the EXECUTE phase, then fixed commit/follow-up answers
    pub fn scripted(execute: &'static str) -> Self {
        Self::new(move |request| route(request, || vec![content(execute)]))
    }

    pub fn with_gate(mut self, gate: Arc<Notify>) -> Self {
        self.execute_gate = Some(gate);
        self
    }

    pub fn execute_requests(&self) -> Vec<ChatRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| !r.tools.is_empty())
            .cloned()
            .collect()
    }
}

/// Default routing: commit and follow-up prompts on the fast model, plan on
/// the main model without tools, `execute` otherwise
pub fn route(request: &ChatRequest, execute: impl FnOnce() -> Vec<ModelEvent>) -> Vec<ModelEvent> {
    if request.model == FAST_MODEL {
        if request.messages[0].content == COMMIT_SYSTEM_PROMPT {
            return vec![content("Added settings page")];
        }
        return vec![content("<follow-ups>\n- Add dark mode\n- Add a footer\n</follow-ups>")];
    }
    if request.tools.is_empty() {
        return vec![content("1. Create the settings page.")];
    }
    execute()
}

pub fn content(text: &str) -> ModelEvent {
    ModelEvent::Content(text.to_string())
}

pub fn tool_call(name: &str, arguments: serde_json::Value) -> ModelEvent {
    ModelEvent::ToolCalls(vec![ToolCall::new(name, arguments)])
}

#[async_trait]
impl ModelClient for FakeModel {
    async fn stream_chat(&self, request: ChatRequest) -> Result<ModelStream, ModelError> {
        let events = (self.responder)(&request);
        let gate = if request.tools.is_empty() {
            None
        } else {
            self.execute_gate.clone()
        };
        self.requests.lock().unwrap().push(request);

        Ok(async_stream::stream! {
            if let Some(gate) = gate {
                gate.notified().await;
            }
            for event in events {
                yield Ok(event);
            }
        }
        .boxed())
    }
}

/// Listener that keeps every event and journals its type
pub struct RecordingListener {
    tx: mpsc::UnboundedSender<Event>,
    journal: Journal,
}

impl RecordingListener {
    pub fn new(journal: Journal) -> (Arc<Self>, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx, journal }), rx)
    }
}

#[async_trait]
impl Listener for RecordingListener {
    async fn send(&self, event: &Event) -> Result<(), ListenerClosed> {
        let kind = match event {
            Event::Payload(Payload::Status(_)) => "status",
            Event::Payload(Payload::ChatUpdate(_)) => "chat_update",
            Event::Payload(Payload::ChatChunk(_)) => "chunk",
            Event::Error { .. } => "error",
        };
        self.journal.lock().unwrap().push(format!("event:{}", kind));
        self.tx.send(event.clone()).map_err(|_| ListenerClosed)
    }

    async fn close(&self) {}
}

pub fn stack() -> Stack {
    Stack {
        title: "Next.js".into(),
        prompt: "Use the app router.".into(),
        image: "node:20".into(),
        start_command: None,
    }
}

/// Project 1 with backend service 10
pub fn project() -> Project {
    Project {
        id: 1,
        name: "Settings demo".into(),
        custom_instructions: None,
        owner: UserProfile::default(),
        services: vec![Service {
            id: 10,
            kind: ServiceKind::Backend,
            stack: stack(),
        }],
    }
}

pub fn manager_config() -> ManagerConfig {
    ManagerConfig {
        retry: RetryPolicy {
            not_ready_backoff: Duration::from_secs(10),
            failure_backoff: Duration::from_secs(30),
            poll_interval: Duration::from_millis(10),
            readiness_polls: 5,
        },
        agent: AgentConfig {
            main_model: MAIN_MODEL.into(),
            fast_model: FAST_MODEL.into(),
            ..AgentConfig::default()
        },
        turn_timeout: Some(Duration::from_secs(60)),
        ..ManagerConfig::default()
    }
}

/// Poll `condition` until it holds or two seconds pass
pub async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Statuses reported for `service_id` in received status events, with
/// consecutive repeats collapsed
pub fn status_sequence(events: &[Event], service_id: i64) -> Vec<SandboxStatus> {
    let mut sequence: Vec<SandboxStatus> = Vec::new();
    for event in events {
        if let Event::Payload(Payload::Status(status)) = event {
            if let Some(s) = status.sandbox_statuses.get(&service_id) {
                if sequence.last() != Some(s) {
                    sequence.push(*s);
                }
            }
        }
    }
    sequence
}

/// Receive events until `done` holds for the collected list or two seconds pass
pub async fn collect_until(
    rx: &mut mpsc::UnboundedReceiver<Event>,
    events: &mut Vec<Event>,
    done: impl Fn(&[Event]) -> bool,
) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !done(events) {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(event)) => events.push(event),
            _ => return done(events),
        }
    }
    true
}
