use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Display, Formatter};
use thiserror::Error;
use uuid::Uuid;

use crate::codes::ExecutionCode;
use crate::consensus::ConsensusKind;

/// Fraction of selected peers that must report a result before a
/// non-consensus execution is considered fully answered.
pub const DEFAULT_EXECUTION_THRESHOLD: f64 = 0.5;

/// Opaque identity of a network participant. The transport layer mints
/// these; the core only compares and prints them.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        PeerId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        PeerId(s.to_string())
    }
}

/// Mint a universally unique request id. The request id is the correlation
/// key for the whole execution lifecycle and doubles as the cluster
/// identity on workers.
pub fn new_request_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestValidationError {
    #[error("function id is required")]
    MissingFunctionId,
    #[error("function method is required")]
    MissingMethod,
}

/// An execution request as submitted by a client: which function to run,
/// how to invoke it, and the orchestration knobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecuteRequest {
    /// Content hash of the function artifact.
    pub function_id: String,
    /// Entry point within the artifact.
    pub method: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub config: ExecutionConfig,
}

impl ExecuteRequest {
    /// Schema validation at ingress. Failures are returned to the client
    /// with code `Invalid`, before any roll call is issued.
    pub fn validate(&self) -> Result<(), RequestValidationError> {
        if self.function_id.is_empty() {
            return Err(RequestValidationError::MissingFunctionId);
        }
        if self.method.is_empty() {
            return Err(RequestValidationError::MissingMethod);
        }
        Ok(())
    }
}

/// Orchestration settings embedded in an execution request. All fields are
/// optional; unset values fall back to node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// How many workers to select. Unset or zero means "any number".
    #[serde(default)]
    pub node_count: Option<usize>,
    /// Consensus algorithm, in the grammar of [`ConsensusKind`].
    #[serde(default)]
    pub consensus: String,
    /// Minimum fraction of responding peers for an OK verdict.
    #[serde(default)]
    pub threshold: Option<f64>,
    /// Per-phase deadline override, in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Predicate over advertised worker attributes.
    #[serde(default)]
    pub attributes: Option<AttributeFilter>,
}

impl ExecutionConfig {
    /// Threshold to score against. Out-of-range values are replaced by the
    /// default rather than rejected.
    pub fn effective_threshold(&self) -> f64 {
        match self.threshold {
            Some(t) if t > 0.0 && t <= 1.0 => t,
            _ => DEFAULT_EXECUTION_THRESHOLD,
        }
    }

    /// Node count normalized so that `Some(0)` means "any".
    pub fn requested_node_count(&self) -> Option<usize> {
        match self.node_count {
            Some(0) | None => None,
            Some(n) => Some(n),
        }
    }
}

/// Required key/value pairs matched against a worker's advertised
/// attributes. Workers self-filter; the head re-checks on selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttributeFilter {
    #[serde(default)]
    pub required: Vec<Attribute>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attribute {
    pub key: String,
    pub value: String,
}

impl AttributeFilter {
    pub fn matches(&self, advertised: &HashMap<String, String>) -> bool {
        self.required
            .iter()
            .all(|attr| advertised.get(&attr.key) == Some(&attr.value))
    }

    pub fn is_empty(&self) -> bool {
        self.required.is_empty()
    }
}

/// Result of running the function on one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub code: ExecutionCode,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub exit_code: i32,
    /// Opaque metadata attached by the worker's metadata provider.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Default for ExecutionResult {
    fn default() -> Self {
        ExecutionResult {
            code: ExecutionCode::NoContent,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
            metadata: serde_json::Value::Null,
        }
    }
}

/// An execution result attributed to the peer that reported it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeResult {
    pub peer: PeerId,
    pub result: ExecutionResult,
}

/// Results keyed by reporting peer. Keys are always a subset of the
/// cluster's member set.
pub type ResultMap = BTreeMap<PeerId, NodeResult>;

/// The short-lived set of workers cooperating on one request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub request_id: String,
    /// Member order is first-reply-wins from the roll call and is the
    /// canonical order for leader election tie-breaks.
    pub peers: Vec<PeerId>,
    pub consensus: ConsensusKind,
}
