//! Project manager - one per live project
//!
//! Owns a supervisor per service and a session per chat. Turns within a chat
//! are serialized by the session's lock; turns in different chats run
//! concurrently.
//!
//! Status events from every supervisor funnel through one channel into a
//! single pump task, which is the only place status broadcasts are sent
//! from. Listeners therefore see statuses in assignment order.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures_util::future::join_all;
use futures_util::StreamExt;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::broadcast::{Broadcaster, ChatUpdate, Event, Listener, ListenerId, ProjectStatus};
use crate::agent::{Agent, AgentChunk, AgentConfig, AgentError, TurnInput};
use crate::llm::ModelClient;
use crate::metrics::{TURNS, TURN_DURATION};
use crate::patch::{PatchEngine, PatchEngineFactory};
use crate::sandbox::{
    RetryPolicy, Sandbox, SandboxProvider, SandboxStatus, SandboxSupervisor, StatusEvent,
    SupervisorSnapshot,
};
use crate::store::{ChatId, ChatStore, Project, Role, ServiceId, ServiceKind, StoreError};

/// Turn-level failures. The display text is what listeners see.
#[derive(Debug, Error)]
pub enum TurnError {
    #[error("Backend service not found.")]
    MissingBackend,
    #[error("Backend sandbox is not running.")]
    SandboxNotRunning,
    #[error(transparent)]
    Agent(#[from] AgentError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("turn timed out after {0:?}")]
    Timeout(Duration),
}

impl TurnError {
    fn outcome(&self) -> &'static str {
        match self {
            TurnError::Timeout(_) => "timeout",
            TurnError::MissingBackend | TurnError::SandboxNotRunning => "rejected",
            _ => "error",
        }
    }
}

/// Configuration for a project manager and everything it owns
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub retry: RetryPolicy,
    pub agent: AgentConfig,
    /// Deadline for the streaming part of a turn. `None` waits forever.
    pub turn_timeout: Option<Duration>,
    pub lint_config_path: String,
    pub lint_command: String,
    pub lint_workdir: String,
    pub git_log_path: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            agent: AgentConfig::default(),
            turn_timeout: Some(Duration::from_secs(900)),
            lint_config_path: "/app/frontend/.eslintrc.json".to_string(),
            lint_command: "npm run lint".to_string(),
            lint_workdir: "/app/frontend".to_string(),
            git_log_path: "/app/git.log".to_string(),
        }
    }
}

/// Per-chat state: listeners, the agent binding and the turn lock
struct ChatSession {
    broadcaster: Broadcaster,
    agent: Option<Arc<Agent>>,
    lock: tokio::sync::Mutex<()>,
    /// Turns holding a `TurnTicket`, queued or running. Only changed while
    /// the sessions map is locked.
    turns: AtomicUsize,
}

impl ChatSession {
    fn is_idle(&self) -> bool {
        self.turns.load(Ordering::SeqCst) == 0 && self.broadcaster.is_empty()
    }
}

/// Keeps a chat session in the sessions map while a turn for it is queued
/// or running, so later messages and listeners find the same turn lock
struct TurnTicket<'a> {
    manager: &'a ProjectManager,
    chat_id: ChatId,
    session: Arc<ChatSession>,
}

impl Drop for TurnTicket<'_> {
    fn drop(&mut self) {
        let mut sessions = lock(&self.manager.sessions);
        self.session.turns.fetch_sub(1, Ordering::SeqCst);
        self.manager.discard_if_idle(&mut sessions, self.chat_id);
    }
}

/// Releases a supervisor's work registration when a turn ends, including
/// when the turn future is dropped mid-stream
struct WorkGuard {
    supervisor: Arc<SandboxSupervisor>,
    finished: bool,
}

impl WorkGuard {
    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            self.supervisor.finish_work();
        }
    }
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        self.finish();
    }
}

pub struct ProjectManager {
    project: Project,
    chats: Arc<dyn ChatStore>,
    model: Arc<dyn ModelClient>,
    patches: Arc<dyn PatchEngineFactory>,
    config: ManagerConfig,
    supervisors: Mutex<BTreeMap<ServiceId, Arc<SandboxSupervisor>>>,
    sessions: Mutex<HashMap<ChatId, Arc<ChatSession>>>,
    last_activity: Mutex<Instant>,
    events_tx: mpsc::UnboundedSender<StatusEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<StatusEvent>>>,
    pump: Mutex<Option<StatusPump>>,
}

/// The status pump task and its stop signal. The pump drains queued events
/// before honoring the signal.
struct StatusPump {
    task: JoinHandle<()>,
    stop: oneshot::Sender<()>,
}

impl ProjectManager {
    /// Create a manager with one supervisor per service. Nothing runs until
    /// `start()`.
    pub fn new(
        project: Project,
        provider: Arc<dyn SandboxProvider>,
        chats: Arc<dyn ChatStore>,
        model: Arc<dyn ModelClient>,
        patches: Arc<dyn PatchEngineFactory>,
        config: ManagerConfig,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let supervisors = project
            .services
            .iter()
            .map(|service| {
                let supervisor = SandboxSupervisor::new(
                    service.clone(),
                    Arc::clone(&provider),
                    config.retry.clone(),
                    config.git_log_path.clone(),
                    events_tx.clone(),
                );
                (service.id, supervisor)
            })
            .collect();

        Arc::new(Self {
            project,
            chats,
            model,
            patches,
            config,
            supervisors: Mutex::new(supervisors),
            sessions: Mutex::new(HashMap::new()),
            last_activity: Mutex::new(Instant::now()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            pump: Mutex::new(None),
        })
    }

    pub fn project(&self) -> &Project {
        &self.project
    }

    /// Start the status pump and every supervisor's bring-up. Returns
    /// immediately.
    pub fn start(self: &Arc<Self>) {
        let Some(mut rx) = lock(&self.events_rx).take() else {
            return;
        };

        let weak: Weak<Self> = Arc::downgrade(self);
        let mut statuses: BTreeMap<ServiceId, SandboxStatus> = self
            .supervisors()
            .iter()
            .map(|s| (s.service().id, s.status()))
            .collect();

        let (stop, mut stopped) = oneshot::channel::<()>();
        let span = info_span!("status_pump", project_id = self.project.id);
        let task = tokio::spawn(
            async move {
                loop {
                    let event = tokio::select! {
                        biased;
                        Some(event) = rx.recv() => event,
                        _ = &mut stopped => break,
                    };
                    if let StatusEvent::Changed { service_id, status } = event {
                        statuses.insert(service_id, status);
                    }
                    let Some(manager) = weak.upgrade() else {
                        break;
                    };
                    let status = manager.build_status(&statuses);
                    manager.broadcast_all(&Event::status(status)).await;
                }
                debug!("status pump stopped");
            }
            .instrument(span),
        );
        *lock(&self.pump) = Some(StatusPump { task, stop });

        for supervisor in self.supervisors() {
            supervisor.start();
        }
        info!(project_id = self.project.id, services = self.project.services.len(), "project manager started");
    }

    /// Attach a listener to a chat, creating the chat's session if needed.
    /// Every listener then receives the current project status.
    pub fn register_connection(&self, chat_id: ChatId, listener: Arc<dyn Listener>) -> ListenerId {
        let id = {
            let mut sessions = lock(&self.sessions);
            self.session_entry(&mut sessions, chat_id).broadcaster.add(listener)
        };
        self.touch();
        let _ = self.events_tx.send(StatusEvent::Refresh);
        debug!(project_id = self.project.id, chat_id, listener_id = id, "listener registered");
        id
    }

    /// Detach a listener. The chat session is discarded once it has no
    /// listeners and no queued or running turn; a turn in flight keeps the
    /// session, so listeners that reconnect see the rest of it.
    pub fn remove_connection(&self, chat_id: ChatId, listener_id: ListenerId) {
        {
            let mut sessions = lock(&self.sessions);
            if let Some(session) = sessions.get(&chat_id) {
                session.broadcaster.remove(listener_id);
            }
            self.discard_if_idle(&mut sessions, chat_id);
        }
        self.touch();
    }

    /// Run one turn for a chat message. Errors are also broadcast to the
    /// chat's listeners as `{"error": ...}`.
    pub async fn on_message(
        &self,
        chat_id: ChatId,
        content: String,
        images: Vec<String>,
    ) -> Result<(), TurnError> {
        self.touch();
        let ticket = self.begin_turn(chat_id);
        let session = &ticket.session;
        let trace_id = Uuid::now_v7();
        let span = info_span!(
            "turn",
            project_id = self.project.id,
            chat_id,
            trace_id = %trace_id,
            otel.name = "turn"
        );

        let started = std::time::Instant::now();
        let result = self
            .run_turn(session, chat_id, content, images)
            .instrument(span)
            .await;

        let outcome = match &result {
            Ok(()) => "success",
            Err(e) => e.outcome(),
        };
        TURNS.with_label_values(&[outcome]).inc();
        TURN_DURATION.observe(started.elapsed().as_secs_f64());

        if let Err(e) = &result {
            warn!(project_id = self.project.id, chat_id, %trace_id, error = %e, "turn failed");
            session.broadcaster.broadcast(&Event::error(e.to_string())).await;
        }
        drop(ticket);
        self.touch();
        result
    }

    async fn run_turn(
        &self,
        session: &ChatSession,
        chat_id: ChatId,
        content: String,
        images: Vec<String>,
    ) -> Result<(), TurnError> {
        let (supervisor, agent) = self.backend_for(session)?;
        if !supervisor.status().is_running() {
            return Err(TurnError::SandboxNotRunning);
        }

        let _turn = session.lock.lock().await;
        let sandbox = supervisor.begin_work().ok_or(TurnError::SandboxNotRunning)?;
        let mut work = WorkGuard {
            supervisor: Arc::clone(&supervisor),
            finished: false,
        };

        let user_message = self.chats.append_message(chat_id, Role::User, &content, &images).await?;
        session
            .broadcaster
            .broadcast(&Event::chat_update(ChatUpdate {
                chat_id,
                message: user_message,
                follow_ups: Vec::new(),
                navigate_to: None,
            }))
            .await;

        let transcript = self.chats.list_messages(chat_id).await?;
        let snapshot = supervisor.snapshot();
        let input = TurnInput {
            transcript,
            file_paths: snapshot.file_paths,
            git_log: snapshot.git_log,
            sandbox: Some(Arc::clone(&sandbox)),
        };

        let mut patches = self.patches.create(Arc::clone(&sandbox));
        let response = self.stream_response(session, &agent, input, patches.as_mut()).await?;
        let assistant_message = self
            .chats
            .append_message(chat_id, Role::Assistant, &response, &[])
            .await?;

        supervisor.begin_applying();
        agent.finalize(patches.as_mut(), &response).await?;
        self.lint(sandbox.as_ref(), patches.as_mut()).await;

        let commit_message = agent.commit_message(patches.total_content()).await;
        match sandbox.commit_changes(&commit_message).await {
            Ok(()) => info!(message = %commit_message, "changes committed"),
            Err(e) => warn!(error = %e, "commit failed"),
        }

        self.propagate_to_frontends(patches.total_content()).await;
        self.refresh_listings().await;
        work.finish();

        let transcript = self.chats.list_messages(chat_id).await?;
        let follow_ups = agent.suggest_follow_ups(&transcript, true).await;
        session
            .broadcaster
            .broadcast(&Event::chat_update(ChatUpdate {
                chat_id,
                message: assistant_message,
                follow_ups,
                navigate_to: agent.take_working_page(),
            }))
            .await;
        Ok(())
    }

    fn backend_for(&self, session: &ChatSession) -> Result<(Arc<SandboxSupervisor>, Arc<Agent>), TurnError> {
        let backend = self
            .project
            .service(ServiceKind::Backend)
            .ok_or(TurnError::MissingBackend)?;
        let supervisor = lock(&self.supervisors)
            .get(&backend.id)
            .cloned()
            .ok_or(TurnError::SandboxNotRunning)?;
        let agent = session.agent.clone().ok_or(TurnError::MissingBackend)?;
        Ok((supervisor, agent))
    }

    /// Stream the agent's reply to listeners, bounded by the turn timeout
    async fn stream_response(
        &self,
        session: &ChatSession,
        agent: &Agent,
        input: TurnInput,
        patches: &mut dyn PatchEngine,
    ) -> Result<String, TurnError> {
        let streaming = async {
            let mut response = String::new();
            let mut chunks = std::pin::pin!(agent.stream_turn(input, patches));
            while let Some(chunk) = chunks.next().await {
                let event = match chunk? {
                    AgentChunk::Thinking(fragment) => Event::thinking(fragment),
                    AgentChunk::Content(fragment) => {
                        response.push_str(&fragment);
                        Event::content(fragment)
                    }
                };
                session.broadcaster.broadcast(&event).await;
            }
            Ok::<_, TurnError>(response)
        };

        match self.config.turn_timeout {
            Some(limit) => tokio::time::timeout(limit, streaming)
                .await
                .map_err(|_| TurnError::Timeout(limit))?,
            None => streaming.await,
        }
    }

    /// Run the linter if the project has a lint config and feed any errors
    /// back through the patch engine
    async fn lint(&self, sandbox: &dyn Sandbox, patches: &mut dyn PatchEngine) {
        if !sandbox.has_file(&self.config.lint_config_path).await {
            return;
        }
        let output = match sandbox
            .run_command(&self.config.lint_command, Some(&self.config.lint_workdir))
            .await
        {
            Ok(output) => output,
            Err(e) => {
                warn!(error = %e, "lint command failed");
                return;
            }
        };
        if !output.contains("Error:") {
            debug!("lint clean");
            return;
        }
        match patches.apply_lint_fixes(&output).await {
            Ok(report) => info!(fixed = report.written.len(), failed = report.failed.len(), "lint fixes applied"),
            Err(e) => warn!(error = %e, "lint fixes failed"),
        }
    }

    /// Apply the turn's patch content to every running frontend sandbox
    async fn propagate_to_frontends(&self, total_content: &str) {
        let frontends: Vec<Arc<dyn Sandbox>> = self
            .supervisors()
            .iter()
            .filter(|s| s.service().kind == ServiceKind::Frontend)
            .filter_map(|s| s.handle())
            .collect();

        for sandbox in frontends {
            let mut engine = self.patches.create(sandbox);
            engine.ingest(total_content);
            if let Err(e) = engine.apply().await {
                warn!(error = %e, "frontend propagation failed");
            }
        }
    }

    /// Reload every service's listings, then push a status update
    async fn refresh_listings(&self) {
        let supervisors = self.supervisors();
        join_all(supervisors.iter().map(|s| s.refresh_listings())).await;
        let _ = self.events_tx.send(StatusEvent::Refresh);
    }

    /// True when nobody is connected and nothing happened for `timeout`
    pub fn is_inactive(&self, timeout: Duration) -> bool {
        if self.listener_count() > 0 {
            return false;
        }
        lock(&self.last_activity).elapsed() > timeout
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.sessions).values().map(|s| s.broadcaster.len()).sum()
    }

    /// Tear down every sandbox, close every listener and forget all state.
    /// Safe to call more than once.
    pub async fn kill(&self) {
        let supervisors = self.supervisors();
        join_all(supervisors.iter().map(|s| s.terminate())).await;

        // teardown statuses are already queued; let the pump deliver them
        let pump = lock(&self.pump).take();
        if let Some(pump) = pump {
            let _ = pump.stop.send(());
            if let Err(e) = pump.task.await {
                debug!(error = %e, "status pump ended abnormally");
            }
        }
        lock(&self.supervisors).clear();

        let sessions: Vec<_> = lock(&self.sessions).drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.broadcaster.close_all().await;
        }
        info!(project_id = self.project.id, "project manager killed");
    }

    /// Current aggregate status, read directly from the supervisors
    pub fn status(&self) -> ProjectStatus {
        self.build_status(&BTreeMap::new())
    }

    fn build_status(&self, overrides: &BTreeMap<ServiceId, SandboxStatus>) -> ProjectStatus {
        let snapshots: Vec<SupervisorSnapshot> = self.supervisors().iter().map(|s| s.snapshot()).collect();
        let backend = snapshots.iter().find(|s| s.kind == ServiceKind::Backend);
        let frontend = snapshots.iter().find(|s| s.kind == ServiceKind::Frontend);

        ProjectStatus {
            project_id: self.project.id,
            sandbox_statuses: snapshots
                .iter()
                .map(|s| {
                    let status = overrides.get(&s.service_id).copied().unwrap_or(s.status);
                    (s.service_id, status)
                })
                .collect(),
            tunnels: snapshots
                .iter()
                .filter_map(|s| s.preview_url.clone().map(|url| (s.service_id, url)))
                .collect(),
            backend_file_paths: backend.and_then(|s| s.file_paths.clone()),
            frontend_file_paths: frontend.and_then(|s| s.file_paths.clone()),
            git_log: backend.and_then(|s| s.git_log.clone()),
            frontend_tunnel: frontend.and_then(|s| s.preview_url.clone()),
        }
    }

    /// Number of chat sessions currently held
    pub fn session_count(&self) -> usize {
        lock(&self.sessions).len()
    }

    /// Broadcast to every chat, then discard the sessions whose last
    /// listener turned out to be gone
    async fn broadcast_all(&self, event: &Event) {
        let sessions: Vec<_> = lock(&self.sessions)
            .iter()
            .map(|(id, s)| (*id, Arc::clone(s)))
            .collect();
        for (_, session) in &sessions {
            session.broadcaster.broadcast(event).await;
        }

        let mut current = lock(&self.sessions);
        for (chat_id, _) in sessions.iter().filter(|(_, s)| s.is_idle()) {
            self.discard_if_idle(&mut current, *chat_id);
        }
    }

    fn begin_turn(&self, chat_id: ChatId) -> TurnTicket<'_> {
        let mut sessions = lock(&self.sessions);
        let session = self.session_entry(&mut sessions, chat_id);
        session.turns.fetch_add(1, Ordering::SeqCst);
        TurnTicket {
            manager: self,
            chat_id,
            session,
        }
    }

    /// Must be called with the sessions map locked
    fn discard_if_idle(&self, sessions: &mut HashMap<ChatId, Arc<ChatSession>>, chat_id: ChatId) {
        if sessions.get(&chat_id).is_some_and(|s| s.is_idle()) {
            sessions.remove(&chat_id);
            debug!(project_id = self.project.id, chat_id, "chat session discarded");
        }
    }

    fn session_entry(
        &self,
        sessions: &mut HashMap<ChatId, Arc<ChatSession>>,
        chat_id: ChatId,
    ) -> Arc<ChatSession> {
        let session = sessions.entry(chat_id).or_insert_with(|| {
            let agent = self.project.service(ServiceKind::Backend).map(|backend| {
                Arc::new(Agent::new(
                    self.project.clone(),
                    backend.stack.clone(),
                    Arc::clone(&self.model),
                    self.config.agent.clone(),
                ))
            });
            if agent.is_none() {
                error!(project_id = self.project.id, chat_id, "project has no backend service");
            }
            Arc::new(ChatSession {
                broadcaster: Broadcaster::default(),
                agent,
                lock: tokio::sync::Mutex::new(()),
                turns: AtomicUsize::new(0),
            })
        });
        Arc::clone(session)
    }

    fn supervisors(&self) -> Vec<Arc<SandboxSupervisor>> {
        lock(&self.supervisors).values().cloned().collect()
    }

    fn touch(&self) {
        *lock(&self.last_activity) = Instant::now();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
