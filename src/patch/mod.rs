//! Patch engine - turns streamed model text into file writes
//!
//! The agent loop feeds every EXECUTE-phase content fragment to a
//! `PatchEngine`. The engine recognises complete file blocks as they finish
//! streaming and materializes them into the sandbox when `apply()` is called.
//!
//! ```text
//! model fragments ──ingest()──► DiffApplier ──apply()──► Sandbox::write_file
//!                                   │
//!                                   └── elided/risky blocks ──► merge via fast model
//! ```
//!
//! `apply()` drains what is pending, so a second call without new
//! ingestion writes nothing.

pub mod diff;
pub mod lint;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::llm::ModelError;
use crate::sandbox::{Sandbox, SandboxError};

pub use diff::{remove_file_changes, DiffApplier, DiffApplierFactory};
pub use lint::parse_eslint;

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxError),
    #[error("merge failed: {0}")]
    Model(#[from] ModelError),
}

/// Outcome of one `apply()` batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyReport {
    /// Paths written, in completion order
    pub written: Vec<String>,
    /// Paths that failed, with the reason
    pub failed: Vec<(String, String)>,
}

impl ApplyReport {
    pub fn is_empty(&self) -> bool {
        self.written.is_empty() && self.failed.is_empty()
    }
}

#[async_trait]
pub trait PatchEngine: Send {
    /// Accumulate a streamed fragment
    fn ingest(&mut self, fragment: &str);

    /// Materialize every patch ingested since the last call.
    /// Per-file failures are reported, not raised.
    async fn apply(&mut self) -> Result<ApplyReport, PatchError>;

    /// Re-apply previously seen files using lint errors as extra guidance
    async fn apply_lint_fixes(&mut self, lint_output: &str) -> Result<ApplyReport, PatchError>;

    /// Everything ingested so far
    fn total_content(&self) -> &str;
}

/// Builds a fresh engine bound to one sandbox, one per turn
pub trait PatchEngineFactory: Send + Sync {
    fn create(&self, sandbox: Arc<dyn Sandbox>) -> Box<dyn PatchEngine>;
}
