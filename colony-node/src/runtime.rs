//! Seams to the function runtime collaborators.
//!
//! The executor, the content-addressed function store, and the metadata
//! provider are external to the orchestration core; the worker only
//! depends on these traits.

use async_trait::async_trait;
use thiserror::Error;

use colony_core::{ExecuteRequest, ExecutionResult};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("function not installed ({0})")]
    NotInstalled(String),
    #[error("could not fetch function artifact: {0}")]
    Fetch(String),
    #[error("execution failed: {0}")]
    Execution(String),
}

/// Runs a function. Synchronous and deterministic given its inputs; the
/// worker invokes it from the handler task of the work order.
pub trait Executor: Send + Sync + 'static {
    fn execute(
        &self,
        request_id: &str,
        request: &ExecuteRequest,
    ) -> Result<ExecutionResult, RuntimeError>;
}

/// Content-addressed artifact store.
#[async_trait]
pub trait FunctionStore: Send + Sync + 'static {
    async fn installed(&self, function_id: &str) -> Result<bool, RuntimeError>;

    async fn fetch(&self, function_id: &str) -> Result<Vec<u8>, RuntimeError>;
}

/// Attaches opaque metadata to a node result before it leaves the worker.
pub trait MetadataProvider: Send + Sync + 'static {
    fn metadata(&self, request: &ExecuteRequest, stdout: &str) -> serde_json::Value;
}

/// Provider that attaches nothing.
pub struct NoMetadata;

impl MetadataProvider for NoMetadata {
    fn metadata(&self, _request: &ExecuteRequest, _stdout: &str) -> serde_json::Value {
        serde_json::Value::Null
    }
}
