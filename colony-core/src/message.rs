//! Wire taxonomy of the Colony protocol.
//!
//! Every message travels inside a versioned [`Envelope`]. The payload is an
//! internally-tagged enum so the dispatcher can route on the `type` field
//! without peeking into the body. Transport-level authentication of the
//! sender is assumed; nothing here carries sender identity beyond the
//! fields the protocol itself needs.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::codes::ExecutionCode;
use crate::consensus::ConsensusKind;
use crate::execution::{
    AttributeFilter, ClusterInfo, ExecuteRequest, NodeResult, PeerId, ResultMap,
};

pub const WIRE_VERSION: u8 = 1;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("could not encode message: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("could not decode message: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("unsupported wire version ({0})")]
    UnsupportedVersion(u8),
}

/// Versioned wrapper around every wire message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub v: u8,
    pub msg: Message,
}

impl Envelope {
    pub fn encode(msg: &Message) -> Result<Vec<u8>, WireError> {
        let env = Envelope {
            v: WIRE_VERSION,
            msg: msg.clone(),
        };
        serde_json::to_vec(&env).map_err(WireError::Encode)
    }

    pub fn decode(payload: &[u8]) -> Result<Message, WireError> {
        let env: Envelope = serde_json::from_slice(payload).map_err(WireError::Decode)?;
        if env.v != WIRE_VERSION {
            return Err(WireError::UnsupportedVersion(env.v));
        }
        Ok(env.msg)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Execute(Execute),
    ExecuteResponse(ExecuteResponse),
    RollCall(RollCall),
    RollCallResponse(RollCallResponse),
    FormCluster(FormCluster),
    FormClusterResponse(FormClusterResponse),
    WorkOrder(WorkOrder),
    WorkOrderResponse(WorkOrderResponse),
    DisbandCluster(DisbandCluster),
    HealthPing(HealthPing),
}

impl Message {
    /// Short label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Execute(_) => "execute",
            Message::ExecuteResponse(_) => "execute_response",
            Message::RollCall(_) => "roll_call",
            Message::RollCallResponse(_) => "roll_call_response",
            Message::FormCluster(_) => "form_cluster",
            Message::FormClusterResponse(_) => "form_cluster_response",
            Message::WorkOrder(_) => "work_order",
            Message::WorkOrderResponse(_) => "work_order_response",
            Message::DisbandCluster(_) => "disband_cluster",
            Message::HealthPing(_) => "health_ping",
        }
    }
}

/// Client → head. Submit a function for execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execute {
    /// Topic the roll call should go out on. Unset means the default topic.
    #[serde(default)]
    pub topic: Option<String>,
    pub request: ExecuteRequest,
}

/// Head → client. Terminal answer for one execution request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub request_id: String,
    pub code: ExecutionCode,
    #[serde(default)]
    pub results: ResultMap,
    #[serde(default)]
    pub cluster: ClusterInfo,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// Head → topic. Solicit capable workers for a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollCall {
    pub request_id: String,
    pub function_id: String,
    pub consensus: ConsensusKind,
    #[serde(default)]
    pub attributes: Option<AttributeFilter>,
}

/// Worker → head. Advertisement in response to a roll call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollCallResponse {
    pub request_id: String,
    pub responder: PeerId,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

/// Head → worker. Ask a selected peer to join a consensus cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormCluster {
    pub request_id: String,
    pub peers: Vec<PeerId>,
    pub consensus: ConsensusKind,
    #[serde(default)]
    pub trace: Option<TraceInfo>,
}

/// Worker → head. Outcome of replica creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormClusterResponse {
    pub request_id: String,
    pub code: ExecutionCode,
    pub consensus: ConsensusKind,
}

/// Head → worker. The actual work, dispatched to every cluster member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkOrder {
    pub request_id: String,
    pub request: ExecuteRequest,
    /// Milliseconds since the Unix epoch, stamped by the head.
    pub timestamp_ms: u64,
    /// Detached ed25519 signature over the order digest. Present iff the
    /// cluster runs PBFT.
    #[serde(default)]
    pub signature: Option<Vec<u8>>,
}

/// Worker → head. A single node's execution result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkOrderResponse {
    pub request_id: String,
    pub code: ExecutionCode,
    pub result: NodeResult,
}

/// Head → worker. Tear down the replica for a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisbandCluster {
    pub request_id: String,
}

/// Worker → topic. Periodic liveness and capability advertisement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthPing {
    pub responder: PeerId,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    pub timestamp_ms: u64,
}

/// Carrier for distributed-trace propagation across the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceInfo(pub HashMap<String, String>);
