//! Sandbox supervisor - brings one service's sandbox up and keeps it there
//!
//! The supervisor owns the status of a single service. Bring-up runs as a
//! background task that retries forever until the sandbox is live or the
//! supervisor is terminated.
//!
//! ```text
//! start()
//!   │
//!   ▼
//! OFFLINE ──► BUILDING ──create_or_attach──► poll is_up()
//!                              │                 │
//!                 NotReady ◄───┤                 ├──► READY (listings loaded)
//!            BUILDING_WAITING  │                 │
//!            sleep 10s, retry  │ other error     │
//!                              ▼                 │
//!                    OFFLINE, sleep 30s, retry ◄─┘ (listing failure)
//! ```
//!
//! Every status change is pushed onto the project's `StatusEvent` channel in
//! the same critical section that assigns it, so the consumer sees changes in
//! the order they happened.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, info_span, warn, Instrument};

use super::{Sandbox, SandboxError, SandboxProvider, SandboxStatus, Transition};
use crate::metrics::{SANDBOX_START_ATTEMPTS, STATUS_TRANSITIONS};
use crate::store::{Service, ServiceId, ServiceKind};

/// Backoff and readiness polling for sandbox bring-up
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Wait after a "not ready yet" outcome
    pub not_ready_backoff: Duration,
    /// Wait after any other failure
    pub failure_backoff: Duration,
    /// Delay between readiness checks of a freshly created sandbox
    pub poll_interval: Duration,
    /// Readiness checks before the attempt counts as "not ready yet"
    pub readiness_polls: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            not_ready_backoff: Duration::from_secs(10),
            failure_backoff: Duration::from_secs(30),
            poll_interval: Duration::from_millis(1000),
            readiness_polls: 60,
        }
    }
}

/// Notification sent to the owning project manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    /// A service's status was assigned a new value
    Changed {
        service_id: ServiceId,
        status: SandboxStatus,
    },
    /// Listings changed without a status change (e.g. after a commit)
    Refresh,
}

/// Point-in-time view of one supervised service
#[derive(Debug, Clone)]
pub struct SupervisorSnapshot {
    pub service_id: ServiceId,
    pub kind: ServiceKind,
    pub status: SandboxStatus,
    pub file_paths: Option<Vec<String>>,
    pub git_log: Option<String>,
    pub preview_url: Option<String>,
}

#[derive(Default)]
struct Listings {
    file_paths: Option<Vec<String>>,
    git_log: Option<String>,
    preview_url: Option<String>,
}

struct SupervisorState {
    status: SandboxStatus,
    handle: Option<Arc<dyn Sandbox>>,
    listings: Listings,
    /// Turns currently holding this sandbox in WORKING / WORKING_APPLYING
    active_turns: usize,
    terminated: bool,
}

/// Supervises the sandbox of a single service
pub struct SandboxSupervisor {
    service: Service,
    provider: Arc<dyn SandboxProvider>,
    policy: RetryPolicy,
    git_log_path: String,
    events: mpsc::UnboundedSender<StatusEvent>,
    state: Mutex<SupervisorState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SandboxSupervisor {
    /// Create a supervisor in OFFLINE. Nothing happens until `start()`.
    ///
    /// # Arguments
    /// * `service` - The service whose sandbox is supervised
    /// * `provider` - Backend that creates or attaches to sandboxes
    /// * `policy` - Backoff and readiness polling
    /// * `git_log_path` - File read into the git log listing for backend services
    /// * `events` - Channel receiving every status change
    pub fn new(
        service: Service,
        provider: Arc<dyn SandboxProvider>,
        policy: RetryPolicy,
        git_log_path: impl Into<String>,
        events: mpsc::UnboundedSender<StatusEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            service,
            provider,
            policy,
            git_log_path: git_log_path.into(),
            events,
            state: Mutex::new(SupervisorState {
                status: SandboxStatus::Offline,
                handle: None,
                listings: Listings::default(),
                active_turns: 0,
                terminated: false,
            }),
            task: Mutex::new(None),
        })
    }

    pub fn service(&self) -> &Service {
        &self.service
    }

    pub fn status(&self) -> SandboxStatus {
        self.state().status
    }

    /// The live handle, present only while the sandbox is running
    pub fn handle(&self) -> Option<Arc<dyn Sandbox>> {
        let state = self.state();
        if state.status.is_running() {
            state.handle.clone()
        } else {
            None
        }
    }

    pub fn snapshot(&self) -> SupervisorSnapshot {
        let state = self.state();
        SupervisorSnapshot {
            service_id: self.service.id,
            kind: self.service.kind,
            status: state.status,
            file_paths: state.listings.file_paths.clone(),
            git_log: state.listings.git_log.clone(),
            preview_url: state.listings.preview_url.clone(),
        }
    }

    /// Spawn the bring-up task. Calling it again while a task exists is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task_slot();
        if task.is_some() || self.state().terminated {
            return;
        }

        let span = info_span!(
            "sandbox_supervisor",
            service_id = self.service.id,
            kind = self.service.kind.as_str(),
            otel.name = "sandbox_supervisor"
        );
        let supervisor = Arc::clone(self);
        *task = Some(tokio::spawn(supervisor.run().instrument(span)));
    }

    async fn run(self: Arc<Self>) {
        let kind = self.service.kind.as_str();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            if self.status() == SandboxStatus::Offline {
                self.set_status(SandboxStatus::Building, Transition::Regular);
            }

            match self.bring_up().await {
                Ok(()) => {
                    SANDBOX_START_ATTEMPTS.with_label_values(&[kind, "ready"]).inc();
                    info!(attempt, "sandbox ready");
                    return;
                }
                Err(SandboxError::NotReady(reason)) => {
                    SANDBOX_START_ATTEMPTS.with_label_values(&[kind, "not_ready"]).inc();
                    info!(attempt, reason = %reason, "sandbox not ready yet, retrying");
                    self.set_status(SandboxStatus::BuildingWaiting, Transition::Regular);
                    sleep(self.policy.not_ready_backoff).await;
                }
                Err(e) => {
                    SANDBOX_START_ATTEMPTS.with_label_values(&[kind, "failed"]).inc();
                    warn!(attempt, error = %e, "sandbox bring-up failed, retrying");
                    self.state().handle = None;
                    self.set_status(SandboxStatus::Offline, Transition::Regular);
                    sleep(self.policy.failure_backoff).await;
                }
            }
        }
    }

    /// One bring-up attempt: create/attach, wait for readiness, load listings
    async fn bring_up(&self) -> Result<(), SandboxError> {
        let handle = self.provider.create_or_attach(&self.service).await?;

        let polls = self.policy.readiness_polls.max(1);
        let mut up = false;
        for poll in 0..polls {
            if handle.is_up().await {
                up = true;
                break;
            }
            if poll == 0 {
                self.set_status(SandboxStatus::BuildingWaiting, Transition::Regular);
            }
            sleep(self.policy.poll_interval).await;
        }
        if !up {
            return Err(SandboxError::NotReady(format!(
                "no answer after {} readiness checks",
                polls
            )));
        }

        let listings = self.load_listings(handle.as_ref()).await?;

        let orphaned = {
            let mut state = self.state();
            if state.terminated {
                true
            } else {
                state.handle = Some(Arc::clone(&handle));
                state.listings = listings;
                false
            }
        };
        if orphaned {
            let _ = handle.terminate().await;
            return Ok(());
        }

        self.set_status(SandboxStatus::Ready, Transition::Regular);
        Ok(())
    }

    async fn load_listings(&self, handle: &dyn Sandbox) -> Result<Listings, SandboxError> {
        let file_paths = handle.get_file_paths().await?;
        let listings = match self.service.kind {
            ServiceKind::Backend => Listings {
                file_paths: Some(file_paths),
                git_log: Some(handle.read_file(&self.git_log_path, true).await?),
                preview_url: None,
            },
            ServiceKind::Frontend => Listings {
                file_paths: Some(file_paths),
                git_log: None,
                preview_url: handle.preview_url(),
            },
        };
        Ok(listings)
    }

    /// Re-read file paths and git log from the live sandbox
    pub async fn refresh_listings(&self) {
        let Some(handle) = self.handle() else {
            return;
        };
        match self.load_listings(handle.as_ref()).await {
            Ok(listings) => self.state().listings = listings,
            Err(e) => warn!(service_id = self.service.id, error = %e, "failed to refresh listings"),
        }
    }

    /// Assign a status. Returns whether the value changed.
    ///
    /// Illegal edges are logged and ignored. A change is published to the
    /// event channel before the state lock is released.
    pub fn set_status(&self, next: SandboxStatus, kind: Transition) -> bool {
        let mut state = self.state();
        self.assign(&mut state, next, kind)
    }

    fn assign(&self, state: &mut SupervisorState, next: SandboxStatus, kind: Transition) -> bool {
        let current = state.status;
        if current == next {
            return false;
        }
        if !current.can_transition_to(next, kind) {
            warn!(
                service_id = self.service.id,
                from = %current,
                to = %next,
                "ignoring illegal status transition"
            );
            return false;
        }

        state.status = next;
        STATUS_TRANSITIONS.with_label_values(&[next.as_str()]).inc();
        debug!(service_id = self.service.id, from = %current, to = %next, "status changed");
        let _ = self.events.send(StatusEvent::Changed {
            service_id: self.service.id,
            status: next,
        });
        true
    }

    /// Register a turn against this sandbox. READY becomes WORKING on the
    /// first concurrent turn. Returns `None` when the sandbox is not running.
    pub fn begin_work(&self) -> Option<Arc<dyn Sandbox>> {
        let mut state = self.state();
        if !state.status.is_running() {
            return None;
        }
        let handle = state.handle.clone()?;
        state.active_turns += 1;
        if state.status == SandboxStatus::Ready {
            self.assign(&mut state, SandboxStatus::Working, Transition::Regular);
        }
        Some(handle)
    }

    /// A turn has finished streaming and is materializing its output
    pub fn begin_applying(&self) {
        let mut state = self.state();
        if state.status == SandboxStatus::Working {
            self.assign(&mut state, SandboxStatus::WorkingApplying, Transition::Regular);
        }
    }

    /// Release a turn. The last one out walks the status back to READY.
    pub fn finish_work(&self) {
        let mut state = self.state();
        state.active_turns = state.active_turns.saturating_sub(1);
        if state.active_turns > 0 {
            return;
        }
        if state.status == SandboxStatus::Working {
            self.assign(&mut state, SandboxStatus::WorkingApplying, Transition::Regular);
        }
        if state.status == SandboxStatus::WorkingApplying {
            self.assign(&mut state, SandboxStatus::Ready, Transition::Regular);
        }
    }

    /// Stop bring-up, tear the sandbox down and settle in OFFLINE.
    /// Safe to call more than once.
    pub async fn terminate(&self) {
        if let Some(task) = self.task_slot().take() {
            task.abort();
        }

        let handle = {
            let mut state = self.state();
            state.terminated = true;
            state.handle.take()
        };

        if let Some(handle) = handle {
            self.set_status(SandboxStatus::Building, Transition::Teardown);
            if let Err(e) = handle.terminate().await {
                warn!(service_id = self.service.id, error = %e, "sandbox teardown failed");
            }
        }

        {
            let mut state = self.state();
            state.listings = Listings::default();
            state.active_turns = 0;
        }
        self.set_status(SandboxStatus::Offline, Transition::Regular);
        info!(service_id = self.service.id, "sandbox terminated");
    }

    fn state(&self) -> MutexGuard<'_, SupervisorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn task_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Stack;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::time::Instant;

    struct StubSandbox {
        terminated: AtomicBool,
    }

    #[async_trait]
    impl Sandbox for StubSandbox {
        async fn is_up(&self) -> bool {
            true
        }
        async fn run_command(&self, _: &str, _: Option<&str>) -> Result<String, SandboxError> {
            Ok(String::new())
        }
        async fn get_file_paths(&self) -> Result<Vec<String>, SandboxError> {
            Ok(vec!["app/page.tsx".into()])
        }
        async fn read_file(&self, _: &str, _: bool) -> Result<String, SandboxError> {
            Ok("abc123 initial commit".into())
        }
        async fn write_file(&self, _: &str, _: &str) -> Result<(), SandboxError> {
            Ok(())
        }
        async fn commit_changes(&self, _: &str) -> Result<(), SandboxError> {
            Ok(())
        }
        async fn terminate(&self) -> Result<(), SandboxError> {
            self.terminated.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    enum Outcome {
        Up,
        NotReady,
        Fail,
    }

    struct ScriptedProvider {
        script: Mutex<VecDeque<Outcome>>,
        last: Mutex<Option<Arc<StubSandbox>>>,
    }

    impl ScriptedProvider {
        fn new(script: Vec<Outcome>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                last: Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl SandboxProvider for ScriptedProvider {
        async fn create_or_attach(&self, _: &Service) -> Result<Arc<dyn Sandbox>, SandboxError> {
            let next = self.script.lock().unwrap().pop_front().unwrap_or(Outcome::Up);
            match next {
                Outcome::Up => {
                    let sandbox = Arc::new(StubSandbox {
                        terminated: AtomicBool::new(false),
                    });
                    *self.last.lock().unwrap() = Some(Arc::clone(&sandbox));
                    Ok(sandbox)
                }
                Outcome::NotReady => Err(SandboxError::NotReady("image still pulling".into())),
                Outcome::Fail => Err(SandboxError::Backend("docker daemon unreachable".into())),
            }
        }
    }

    fn backend_service() -> Service {
        Service {
            id: 11,
            kind: ServiceKind::Backend,
            stack: Stack {
                title: "Next.js".into(),
                prompt: String::new(),
                image: "node:20".into(),
                start_command: None,
            },
        }
    }

    fn supervisor(
        provider: Arc<ScriptedProvider>,
    ) -> (Arc<SandboxSupervisor>, mpsc::UnboundedReceiver<StatusEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sup = SandboxSupervisor::new(
            backend_service(),
            provider,
            RetryPolicy::default(),
            "/app/git.log",
            tx,
        );
        (sup, rx)
    }

    async fn next_status(rx: &mut mpsc::UnboundedReceiver<StatusEvent>) -> SandboxStatus {
        match rx.recv().await {
            Some(StatusEvent::Changed { status, .. }) => status,
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_attempt_success() {
        let (sup, mut rx) = supervisor(ScriptedProvider::new(vec![Outcome::Up]));
        sup.start();

        assert_eq!(next_status(&mut rx).await, SandboxStatus::Building);
        assert_eq!(next_status(&mut rx).await, SandboxStatus::Ready);

        let snap = sup.snapshot();
        assert_eq!(snap.file_paths, Some(vec!["app/page.tsx".to_string()]));
        assert_eq!(snap.git_log.as_deref(), Some("abc123 initial commit"));
        assert!(sup.handle().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_ready_waits_ten_seconds() {
        let (sup, mut rx) = supervisor(ScriptedProvider::new(vec![Outcome::NotReady, Outcome::Up]));
        let started = Instant::now();
        sup.start();

        assert_eq!(next_status(&mut rx).await, SandboxStatus::Building);
        assert_eq!(next_status(&mut rx).await, SandboxStatus::BuildingWaiting);
        assert_eq!(next_status(&mut rx).await, SandboxStatus::Ready);
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(started.elapsed() < Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_failure_goes_offline_and_retries_after_thirty_seconds() {
        let (sup, mut rx) = supervisor(ScriptedProvider::new(vec![Outcome::Fail, Outcome::Up]));
        let started = Instant::now();
        sup.start();

        assert_eq!(next_status(&mut rx).await, SandboxStatus::Building);
        assert_eq!(next_status(&mut rx).await, SandboxStatus::Offline);
        assert_eq!(next_status(&mut rx).await, SandboxStatus::Building);
        assert_eq!(next_status(&mut rx).await, SandboxStatus::Ready);
        assert!(started.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_turn_refcount_walks_back_to_ready() {
        let (sup, mut rx) = supervisor(ScriptedProvider::new(vec![Outcome::Up]));
        sup.start();
        next_status(&mut rx).await;
        next_status(&mut rx).await;

        assert!(sup.begin_work().is_some());
        assert!(sup.begin_work().is_some());
        assert_eq!(next_status(&mut rx).await, SandboxStatus::Working);

        sup.begin_applying();
        assert_eq!(next_status(&mut rx).await, SandboxStatus::WorkingApplying);

        sup.finish_work();
        assert_eq!(sup.status(), SandboxStatus::WorkingApplying);
        sup.finish_work();
        assert_eq!(next_status(&mut rx).await, SandboxStatus::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_aborted_turn_passes_through_applying() {
        let (sup, mut rx) = supervisor(ScriptedProvider::new(vec![Outcome::Up]));
        sup.start();
        next_status(&mut rx).await;
        next_status(&mut rx).await;

        sup.begin_work();
        sup.finish_work();
        assert_eq!(next_status(&mut rx).await, SandboxStatus::Working);
        assert_eq!(next_status(&mut rx).await, SandboxStatus::WorkingApplying);
        assert_eq!(next_status(&mut rx).await, SandboxStatus::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_begin_work_refused_while_booting() {
        let (sup, _rx) = supervisor(ScriptedProvider::new(vec![]));
        assert!(sup.begin_work().is_none());
        assert!(sup.handle().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminate_tears_down_and_is_idempotent() {
        let provider = ScriptedProvider::new(vec![Outcome::Up]);
        let (sup, mut rx) = supervisor(Arc::clone(&provider));
        sup.start();
        next_status(&mut rx).await;
        next_status(&mut rx).await;

        sup.terminate().await;
        assert_eq!(next_status(&mut rx).await, SandboxStatus::Building);
        assert_eq!(next_status(&mut rx).await, SandboxStatus::Offline);
        let sandbox = provider.last.lock().unwrap().clone().unwrap();
        assert!(sandbox.terminated.load(Ordering::SeqCst));
        assert!(sup.snapshot().file_paths.is_none());

        sup.terminate().await;
        assert_eq!(sup.status(), SandboxStatus::Offline);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminate_stops_retry_loop() {
        let (sup, mut rx) = supervisor(ScriptedProvider::new(vec![Outcome::Fail, Outcome::Fail]));
        sup.start();
        assert_eq!(next_status(&mut rx).await, SandboxStatus::Building);
        assert_eq!(next_status(&mut rx).await, SandboxStatus::Offline);

        sup.terminate().await;
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(sup.status(), SandboxStatus::Offline);
        assert!(rx.try_recv().is_err());
    }
}
