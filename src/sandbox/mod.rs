//! Sandbox module - one isolated execution environment per service
//!
//! This module provides:
//! - The `Sandbox` handle contract every backend implements
//! - The `SandboxProvider` contract that creates or attaches to a sandbox
//! - `SandboxStatus`, the per-service readiness state machine
//! - `SandboxSupervisor`, which brings a sandbox up and keeps retrying
//! - A local Docker backend (`docker`)
//!
//! # Architecture
//!
//! ```text
//! ProjectManager ──owns──► SandboxSupervisor (one per service)
//!                                  │
//!                                  ├──create_or_attach──► SandboxProvider
//!                                  │                          │
//!                                  │◄──── Arc<dyn Sandbox> ───┘
//!                                  │
//!                                  ├──poll is_up() until live
//!                                  │
//!                                  └──status change──► StatusEvent channel ──► listeners
//! ```
//!
//! The supervisor and the agent loop only ever see `dyn Sandbox`; nothing
//! above this module branches on the concrete backend.

pub mod docker;
pub mod status;
pub mod supervisor;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::store::Service;

pub use docker::{DockerProvider, DockerSandbox};
pub use status::{SandboxStatus, Transition};
pub use supervisor::{RetryPolicy, SandboxSupervisor, StatusEvent, SupervisorSnapshot};

/// Error type for sandbox operations
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The sandbox exists but is not accepting work yet. Routine while booting.
    #[error("sandbox not ready: {0}")]
    NotReady(String),
    /// A file that was required to exist does not
    #[error("file not found: {0}")]
    FileNotFound(String),
    /// A command ran but the backend reported failure
    #[error("command failed: {0}")]
    Command(String),
    /// The backend itself failed (container runtime, remote API, ...)
    #[error("sandbox backend error: {0}")]
    Backend(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Handle to one running service environment.
///
/// Implementations must answer routine calls made before `is_up()` turns true
/// with `SandboxError::NotReady` rather than failing hard.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Readiness predicate polled by the supervisor
    async fn is_up(&self) -> bool;

    /// Run a shell command, returning combined output
    async fn run_command(&self, command: &str, workdir: Option<&str>) -> Result<String, SandboxError>;

    /// Source file paths, sorted
    async fn get_file_paths(&self) -> Result<Vec<String>, SandboxError>;

    /// Read a file. With `missing_ok`, a missing file reads as the empty string.
    async fn read_file(&self, path: &str, missing_ok: bool) -> Result<String, SandboxError>;

    async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError>;

    async fn has_file(&self, path: &str) -> bool {
        self.read_file(path, false).await.is_ok()
    }

    /// Checkpoint the working tree
    async fn commit_changes(&self, message: &str) -> Result<(), SandboxError>;

    async fn terminate(&self) -> Result<(), SandboxError>;

    /// Externally reachable address, if the backend publishes one
    fn preview_url(&self) -> Option<String> {
        None
    }
}

/// Creates a sandbox for a service, or attaches to the one already running
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    async fn create_or_attach(&self, service: &Service) -> Result<Arc<dyn Sandbox>, SandboxError>;
}
