//! Agent - runs one chat turn as PLAN -> EXECUTE -> (TOOLS)* -> FINALIZE
//!
//! ```text
//! transcript ──► PLAN (no tools) ──Thinking chunks──► caller
//!                    │ plan text
//!                    ▼
//!               EXECUTE (run_command, navigate_to) ──Content chunks──► caller
//!                    │        │                          └──► PatchEngine::ingest
//!                    │        └─ tool calls ─► ToolRegistry ─► tool messages ─► re-stream
//!                    ▼
//!               FINALIZE: PatchEngine::apply (+ BACKEND DOC in doc-handoff mode)
//! ```
//!
//! The agent never owns a sandbox. The caller borrows the supervisor's
//! current handle into each turn, so a restarted sandbox is picked up on the
//! next turn without rebinding.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use futures_util::stream::{Stream, StreamExt};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

use super::prompts::{self, PromptContext};
use super::tools::{NavigateTool, RunCommandTool, ToolRegistry};
use crate::llm::{ChatMessage, ChatRequest, ModelClient, ModelError, ModelEvent};
use crate::metrics::MODEL_CALL_DURATION;
use crate::patch::{ApplyReport, PatchEngine, PatchError};
use crate::sandbox::Sandbox;
use crate::store::{Message, Project, Stack};

/// Single backend-driven turns, or backend-doc hand-off between turns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum AgentMode {
    #[default]
    Single,
    DocHandoff,
}

/// Configuration for the agent loop
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Model for PLAN and EXECUTE
    pub main_model: String,
    /// Model for follow-ups, commit messages and merges
    pub fast_model: String,
    pub temperature: f32,
    /// EXECUTE re-streams after tool calls at most this many times
    pub max_tool_rounds: usize,
    pub mode: AgentMode,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            main_model: "qwen3".to_string(),
            fast_model: "qwen3".to_string(),
            temperature: 0.0,
            max_tool_rounds: 10,
            mode: AgentMode::Single,
        }
    }
}

/// Error type for agent turns
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("model error: {0}")]
    Model(#[from] ModelError),
    #[error("unknown tool called: {0}")]
    UnknownTool(String),
    #[error("model still calling tools after {0} rounds")]
    TooManyToolRounds(usize),
    #[error("patch error: {0}")]
    Patch(#[from] PatchError),
}

/// One streamed increment of a turn
#[derive(Debug, Clone, PartialEq)]
pub enum AgentChunk {
    /// PLAN output, shown as reasoning
    Thinking(String),
    /// EXECUTE output, part of the final assistant message
    Content(String),
}

/// Everything a turn reads. Assembled by the caller under the chat lock.
pub struct TurnInput {
    /// Full persisted conversation, ending with the new user message
    pub transcript: Vec<Message>,
    pub file_paths: Option<Vec<String>>,
    pub git_log: Option<String>,
    /// Borrowed for this turn only; `None` while booting
    pub sandbox: Option<Arc<dyn Sandbox>>,
}

/// The agent bound to one chat
pub struct Agent {
    project: Project,
    stack: Stack,
    model: Arc<dyn ModelClient>,
    config: AgentConfig,
    working_page: Arc<Mutex<Option<String>>>,
    backend_doc: Mutex<Option<String>>,
}

impl Agent {
    /// Create a new agent
    ///
    /// # Arguments
    /// * `project` - Project the chat belongs to
    /// * `stack` - Stack of the service this agent edits
    /// * `model` - Streaming model client
    /// * `config` - Agent configuration
    pub fn new(project: Project, stack: Stack, model: Arc<dyn ModelClient>, config: AgentConfig) -> Self {
        Self {
            project,
            stack,
            model,
            config,
            working_page: Arc::new(Mutex::new(None)),
            backend_doc: Mutex::new(None),
        }
    }

    pub fn project(&self) -> &Project {
        &self.project
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Navigation hint recorded by `navigate_to` during the last turn
    pub fn take_working_page(&self) -> Option<String> {
        lock(&self.working_page).take()
    }

    /// Doc carried between turns in doc-handoff mode
    pub fn backend_doc(&self) -> Option<String> {
        lock(&self.backend_doc).clone()
    }

    fn prompt_context(&self, input: &TurnInput) -> PromptContext {
        PromptContext {
            project_text: prompts::project_text(&self.project, input.sandbox.is_some()),
            user_text: prompts::user_style(self.project.owner.user_type).to_string(),
            stack_text: self.stack.prompt.clone(),
            files_text: prompts::files_text(input.file_paths.as_deref()),
            git_log_text: prompts::git_log_text(input.git_log.as_deref()),
        }
    }

    fn plan_instructions(&self) -> String {
        match self.config.mode {
            AgentMode::Single => String::new(),
            AgentMode::DocHandoff => match self.backend_doc() {
                Some(doc) => format!("BACKEND DOC: {}\n\n{}", doc, prompts::DOC_HANDOFF_INSTRUCTIONS),
                None => prompts::DOC_HANDOFF_INSTRUCTIONS.to_string(),
            },
        }
    }

    fn exec_messages(&self, ctx: &PromptContext, input: &TurnInput, plan: &str) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::system(prompts::exec_system_prompt(ctx))];
        messages.extend(input.transcript.iter().map(|m| {
            let mut message = ChatMessage::user(m.content.clone()).with_images(&m.images);
            message.role = m.role.as_str().to_string();
            message
        }));

        let mut trailer = prompts::exec_trailer(&ctx.files_text, plan);
        if self.config.mode == AgentMode::DocHandoff {
            trailer.push('\n');
            trailer.push_str(prompts::DOC_HANDOFF_INSTRUCTIONS);
        }

        match messages.iter_mut().rev().find(|m| m.role == "user") {
            Some(last_user) => {
                last_user.content.push_str("\n\n");
                last_user.content.push_str(&trailer);
            }
            None => messages.push(ChatMessage::user(trailer)),
        }
        messages
    }

    /// Stream one turn. Content chunks are fed to `patches` as they arrive.
    ///
    /// The stream ends after EXECUTE; call `finalize` to apply patches. An
    /// error item ends the stream and FINALIZE must not run.
    pub fn stream_turn<'a>(
        &'a self,
        input: TurnInput,
        patches: &'a mut dyn PatchEngine,
    ) -> impl Stream<Item = Result<AgentChunk, AgentError>> + Send + 'a {
        async_stream::try_stream! {
            lock(&self.working_page).take();
            let ctx = self.prompt_context(&input);

            // PLAN
            let plan_request = ChatRequest::new(
                self.config.main_model.clone(),
                vec![
                    ChatMessage::system(prompts::plan_system_prompt(&ctx)),
                    ChatMessage::user(prompts::plan_user_prompt(&input.transcript, &self.plan_instructions())),
                ],
            )
            .with_temperature(self.config.temperature);

            let started = Instant::now();
            let span = info_span!("model_call", phase = "plan", model = %self.config.main_model, otel.name = "model_call");
            let mut stream = self.model.stream_chat(plan_request).instrument(span).await?;
            let mut plan = String::new();
            while let Some(event) = stream.next().await {
                if let ModelEvent::Content(fragment) = event? {
                    plan.push_str(&fragment);
                    yield AgentChunk::Thinking(fragment);
                }
            }
            MODEL_CALL_DURATION.with_label_values(&["plan"]).observe(started.elapsed().as_secs_f64());
            debug!(plan_len = plan.len(), "plan complete");

            // EXECUTE
            let tools = ToolRegistry::new(vec![
                Box::new(RunCommandTool::new(input.sandbox.clone())),
                Box::new(NavigateTool::new(Arc::clone(&self.working_page))),
            ]);
            let definitions = tools.definitions();
            let mut messages = self.exec_messages(&ctx, &input, &plan);
            let mut rounds = 0usize;

            loop {
                let request = ChatRequest::new(self.config.main_model.clone(), messages.clone())
                    .with_tools(definitions.clone())
                    .with_temperature(self.config.temperature);

                let started = Instant::now();
                let span = info_span!("model_call", phase = "execute", round = rounds, model = %self.config.main_model, otel.name = "model_call");
                let mut stream = self.model.stream_chat(request).instrument(span).await?;

                let mut content = String::new();
                let mut calls = Vec::new();
                while let Some(event) = stream.next().await {
                    match event? {
                        ModelEvent::Content(fragment) => {
                            content.push_str(&fragment);
                            patches.ingest(&fragment);
                            yield AgentChunk::Content(fragment);
                        }
                        ModelEvent::ToolCalls(requested) => {
                            calls.extend(requested);
                            yield AgentChunk::Content("\n\n".to_string());
                        }
                    }
                }
                MODEL_CALL_DURATION.with_label_values(&["execute"]).observe(started.elapsed().as_secs_f64());

                if calls.is_empty() {
                    break;
                }

                rounds += 1;
                if rounds > self.config.max_tool_rounds {
                    warn!(rounds, "tool round limit reached");
                    Err(AgentError::TooManyToolRounds(self.config.max_tool_rounds))?;
                }

                messages.push(ChatMessage::assistant_tool_calls(content, calls.clone()));
                for call in &calls {
                    let output = tools.invoke(call).await?;
                    messages.push(ChatMessage::tool(output));
                }
            }
        }
    }

    /// FINALIZE: apply ingested patches, then pick up a `BACKEND DOC:` in
    /// doc-handoff mode. A missing marker keeps the previous doc.
    pub async fn finalize(
        &self,
        patches: &mut dyn PatchEngine,
        response: &str,
    ) -> Result<ApplyReport, AgentError> {
        let report = patches.apply().await?;
        info!(written = report.written.len(), failed = report.failed.len(), "patches applied");

        if self.config.mode == AgentMode::DocHandoff {
            if let Some(doc) = prompts::extract_backend_doc(response) {
                debug!(doc_len = doc.len(), "backend doc captured");
                *lock(&self.backend_doc) = Some(doc);
            }
        }
        Ok(report)
    }

    /// Three short next prompts for the user. Failures yield none.
    pub async fn suggest_follow_ups(&self, transcript: &[Message], sandbox_ready: bool) -> Vec<String> {
        let ctx = PromptContext {
            project_text: prompts::project_text(&self.project, sandbox_ready),
            user_text: String::new(),
            stack_text: self.stack.prompt.clone(),
            files_text: String::new(),
            git_log_text: String::new(),
        };
        let request = ChatRequest::new(
            self.config.fast_model.clone(),
            vec![
                ChatMessage::system(prompts::follow_up_system_prompt(&ctx)),
                ChatMessage::user(prompts::follow_up_user_prompt(transcript)),
            ],
        );

        let started = Instant::now();
        let result = self.model.complete(request).await;
        MODEL_CALL_DURATION.with_label_values(&["follow_ups"]).observe(started.elapsed().as_secs_f64());

        match result {
            Ok(content) => prompts::parse_follow_ups(&content),
            Err(e) => {
                warn!(error = %e, "follow-up suggestion failed");
                Vec::new()
            }
        }
    }

    /// Commit message summarizing the turn's patch content
    pub async fn commit_message(&self, total_content: &str) -> String {
        let request = ChatRequest::new(
            self.config.fast_model.clone(),
            vec![
                ChatMessage::system(prompts::COMMIT_SYSTEM_PROMPT),
                ChatMessage::user(prompts::commit_user_prompt(total_content)),
            ],
        );

        let started = Instant::now();
        let result = self.model.complete(request).await;
        MODEL_CALL_DURATION.with_label_values(&["commit_message"]).observe(started.elapsed().as_secs_f64());

        match result {
            Ok(raw) => prompts::clean_commit_message(&raw),
            Err(e) => {
                warn!(error = %e, "commit message generation failed");
                prompts::DEFAULT_COMMIT_MESSAGE.to_string()
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ModelStream, ToolCall};
    use crate::patch::ApplyReport;
    use crate::store::{Role, UserProfile};
    use async_trait::async_trait;
    use chrono::Utc;
    use futures_util::stream;
    use std::collections::VecDeque;

    /// Replays one scripted reply per call, recording each request
    struct ScriptedModel {
        replies: Mutex<VecDeque<Vec<Result<ModelEvent, ModelError>>>>,
        requests: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedModel {
        fn new(replies: Vec<Vec<Result<ModelEvent, ModelError>>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ModelClient for ScriptedModel {
        async fn stream_chat(&self, request: ChatRequest) -> Result<ModelStream, ModelError> {
            self.requests.lock().unwrap().push(request);
            let reply = self.replies.lock().unwrap().pop_front().unwrap_or_default();
            Ok(stream::iter(reply).boxed())
        }
    }

    #[derive(Default)]
    struct CollectingEngine {
        content: String,
        applied: usize,
    }

    #[async_trait]
    impl PatchEngine for CollectingEngine {
        fn ingest(&mut self, fragment: &str) {
            self.content.push_str(fragment);
        }
        async fn apply(&mut self) -> Result<ApplyReport, PatchError> {
            self.applied += 1;
            Ok(ApplyReport::default())
        }
        async fn apply_lint_fixes(&mut self, _: &str) -> Result<ApplyReport, PatchError> {
            Ok(ApplyReport::default())
        }
        fn total_content(&self) -> &str {
            &self.content
        }
    }

    fn content(text: &str) -> Result<ModelEvent, ModelError> {
        Ok(ModelEvent::Content(text.to_string()))
    }

    fn agent(model: Arc<ScriptedModel>, mode: AgentMode) -> Agent {
        let project = Project {
            id: 1,
            name: "Astro".into(),
            custom_instructions: None,
            owner: UserProfile::default(),
            services: vec![],
        };
        let stack = Stack {
            title: "Next.js".into(),
            prompt: "Use the app router.".into(),
            image: "node:20".into(),
            start_command: None,
        };
        Agent::new(
            project,
            stack,
            model,
            AgentConfig {
                mode,
                ..AgentConfig::default()
            },
        )
    }

    fn input(text: &str) -> TurnInput {
        TurnInput {
            transcript: vec![Message {
                id: 1,
                chat_id: 1,
                role: Role::User,
                content: text.to_string(),
                images: vec![],
                created_at: Utc::now(),
            }],
            file_paths: Some(vec!["/app/page.tsx".into()]),
            git_log: None,
            sandbox: None,
        }
    }

    async fn collect(
        agent: &Agent,
        input: TurnInput,
        engine: &mut CollectingEngine,
    ) -> Vec<Result<AgentChunk, AgentError>> {
        agent.stream_turn(input, engine).collect().await
    }

    #[tokio::test]
    async fn test_plan_then_execute() {
        let model = ScriptedModel::new(vec![
            vec![content("1. add "), content("page")],
            vec![content("Here "), content("it is.")],
        ]);
        let agent = agent(Arc::clone(&model), AgentMode::Single);
        let mut engine = CollectingEngine::default();

        let chunks: Vec<AgentChunk> = collect(&agent, input("Add a settings page."), &mut engine)
            .await
            .into_iter()
            .map(|c| c.unwrap())
            .collect();

        assert_eq!(
            chunks,
            vec![
                AgentChunk::Thinking("1. add ".into()),
                AgentChunk::Thinking("page".into()),
                AgentChunk::Content("Here ".into()),
                AgentChunk::Content("it is.".into()),
            ]
        );
        assert_eq!(engine.content, "Here it is.");

        let requests = model.requests.lock().unwrap();
        assert!(requests[0].tools.is_empty());
        assert_eq!(requests[1].tools.len(), 2);
        let last_user = requests[1].messages.last().unwrap();
        assert!(last_user.content.starts_with("Add a settings page."));
        assert!(last_user.content.contains("<plan>\n1. add page\n</plan>"));
        assert!(last_user.content.contains("/app/page.tsx"));
    }

    #[tokio::test]
    async fn test_tool_round_feeds_results_back() {
        let model = ScriptedModel::new(vec![
            vec![content("plan")],
            vec![Ok(ModelEvent::ToolCalls(vec![ToolCall::new(
                "navigate_to",
                serde_json::json!({"path": "/settings"}),
            )]))],
            vec![content("done")],
        ]);
        let agent = agent(Arc::clone(&model), AgentMode::Single);
        let mut engine = CollectingEngine::default();

        let chunks = collect(&agent, input("go"), &mut engine).await;
        assert!(chunks.iter().all(|c| c.is_ok()));
        assert!(chunks
            .iter()
            .any(|c| matches!(c, Ok(AgentChunk::Content(s)) if s == "\n\n")));

        let requests = model.requests.lock().unwrap();
        let third = &requests[2].messages;
        assert_eq!(third.last().unwrap().role, "tool");
        assert_eq!(third.last().unwrap().content, "Navigating user to /settings");
        drop(requests);
        assert_eq!(agent.take_working_page().as_deref(), Some("/settings"));
        assert_eq!(agent.take_working_page(), None);
    }

    #[tokio::test]
    async fn test_unknown_tool_ends_the_turn() {
        let model = ScriptedModel::new(vec![
            vec![content("plan")],
            vec![Ok(ModelEvent::ToolCalls(vec![ToolCall::new(
                "rm_rf",
                serde_json::json!({}),
            )]))],
        ]);
        let agent = agent(model, AgentMode::Single);
        let mut engine = CollectingEngine::default();

        let chunks = collect(&agent, input("go"), &mut engine).await;
        assert!(matches!(
            chunks.last(),
            Some(Err(AgentError::UnknownTool(name))) if name == "rm_rf"
        ));
    }

    #[tokio::test]
    async fn test_model_error_surfaces_after_partial_output() {
        let model = ScriptedModel::new(vec![
            vec![content("plan")],
            vec![content("partial"), Err(ModelError::Remote("overloaded".into()))],
        ]);
        let agent = agent(model, AgentMode::Single);
        let mut engine = CollectingEngine::default();

        let chunks = collect(&agent, input("go"), &mut engine).await;
        assert_eq!(chunks.len(), 3);
        assert!(matches!(chunks[1], Ok(AgentChunk::Content(ref s)) if s == "partial"));
        assert!(matches!(chunks[2], Err(AgentError::Model(_))));
        assert_eq!(engine.applied, 0);
    }

    #[tokio::test]
    async fn test_tool_round_limit() {
        let call = || {
            vec![Ok(ModelEvent::ToolCalls(vec![ToolCall::new(
                "navigate_to",
                serde_json::json!({"path": "/"}),
            )]))]
        };
        let mut replies = vec![vec![content("plan")]];
        replies.extend((0..5).map(|_| call()));
        let model = ScriptedModel::new(replies);
        let mut agent = agent(model, AgentMode::Single);
        agent.config.max_tool_rounds = 2;
        let mut engine = CollectingEngine::default();

        let chunks = collect(&agent, input("go"), &mut engine).await;
        assert!(matches!(chunks.last(), Some(Err(AgentError::TooManyToolRounds(2)))));
    }

    #[tokio::test]
    async fn test_doc_handoff_carries_doc_to_next_plan() {
        let model = ScriptedModel::new(vec![
            vec![content("plan")],
            vec![content("Built it.\nBACKEND DOC: GET /api/items")],
            vec![content("plan 2")],
            vec![content("ok")],
        ]);
        let agent = agent(Arc::clone(&model), AgentMode::DocHandoff);

        let mut engine = CollectingEngine::default();
        collect(&agent, input("backend"), &mut engine).await;
        let response = engine.content.clone();
        agent.finalize(&mut engine, &response).await.unwrap();
        assert_eq!(engine.applied, 1);
        assert_eq!(agent.backend_doc().as_deref(), Some("GET /api/items"));

        let mut engine = CollectingEngine::default();
        collect(&agent, input("frontend"), &mut engine).await;
        let requests = model.requests.lock().unwrap();
        assert!(requests[2].messages[1]
            .content
            .contains("BACKEND DOC: GET /api/items"));
    }

    #[tokio::test]
    async fn test_commit_message_and_follow_ups() {
        let model = ScriptedModel::new(vec![
            vec![content("\"Added settings page.\"")],
            vec![content("<follow-ups>\n- Add dark mode\n- Add a footer\n</follow-ups>")],
            vec![Err(ModelError::EmptyResponse)],
        ]);
        let agent = agent(model, AgentMode::Single);

        assert_eq!(agent.commit_message("```tsx\n...```").await, "Added settings page");
        let transcript = input("hi").transcript;
        assert_eq!(
            agent.suggest_follow_ups(&transcript, true).await,
            vec!["Add dark mode", "Add a footer"]
        );
        assert!(agent.suggest_follow_ups(&transcript, true).await.is_empty());
    }
}
