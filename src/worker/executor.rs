use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::job::{ExecutorKind, Job};

/// What one executor invocation produced.
///
/// `output` is kept even when the invocation failed (a shell command's
/// combined output, an HTTP error response body) so the execution record
/// shows what the target said.
#[derive(Debug, Default)]
pub struct ExecOutcome {
    pub output: String,
    pub retries_attempted: u32,
    pub error: Option<String>,
}

impl ExecOutcome {
    pub fn success(output: String) -> Self {
        Self {
            output,
            ..Default::default()
        }
    }

    pub fn failure(output: String, error: String) -> Self {
        Self {
            output,
            retries_attempted: 0,
            error: Some(error),
        }
    }
}

/// One way of carrying out a job's action.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, job: &Job) -> ExecOutcome;
}

/// Closed mapping from executor kind to executor.
pub type ExecutorRegistry = HashMap<ExecutorKind, Arc<dyn TaskExecutor>>;
