//! The seam between the worker and the consensus backends.
//!
//! Raft and PBFT implementations live outside this crate and are treated
//! as black-box replicated state machines. The worker hands them a
//! [`ReplicaSpec`] describing the cluster and a [`ReplicaHooks`] record to
//! invoke when the replicated log commits an order. Hooks hold only the
//! worker's result wait-map and transport handle, never the replica
//! itself, so no ownership cycle can form.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, warn};

use colony_core::message::WorkOrderResponse;
use colony_core::{
    ConsensusKind, Envelope, ExecuteRequest, ExecutionCode, ExecutionResult, Message, NodeResult,
    PeerId,
};

use crate::errors::NodeError;
use crate::runtime::{Executor, MetadataProvider};
use crate::transport::Transport;
use crate::waitmap::WaitMap;

/// A running consensus replica bound to one request id.
///
/// `execute` often just pipelines the order into the replicated log;
/// actual execution happens asynchronously on commit, through the hooks.
/// Non-leader replicas produce no output from this call.
#[async_trait]
pub trait ConsensusReplica: Send + Sync + 'static {
    fn kind(&self) -> ConsensusKind;

    async fn execute(
        &self,
        from: PeerId,
        request_id: String,
        timestamp_ms: u64,
        request: ExecuteRequest,
    ) -> Result<(ExecutionCode, ExecutionResult), NodeError>;

    async fn shutdown(&self) -> Result<(), NodeError>;
}

/// Everything a backend needs to materialize a replica for one request.
#[derive(Clone)]
pub struct ReplicaSpec {
    pub request_id: String,
    /// Cluster membership in canonical order; the first entry breaks
    /// leader-election ties.
    pub peers: Vec<PeerId>,
    pub local_peer: PeerId,
    /// Scratch directory for the replicated log, exclusive to this replica.
    pub workdir: PathBuf,
    pub executor: Arc<dyn Executor>,
}

/// Callbacks a replica invokes once the cluster commits an order.
#[derive(Clone)]
pub struct ReplicaHooks {
    local_peer: PeerId,
    transport: Arc<dyn Transport>,
    results: Arc<WaitMap<String, NodeResult>>,
    metadata: Arc<dyn MetadataProvider>,
}

impl ReplicaHooks {
    pub(crate) fn new(
        local_peer: PeerId,
        transport: Arc<dyn Transport>,
        results: Arc<WaitMap<String, NodeResult>>,
        metadata: Arc<dyn MetadataProvider>,
    ) -> Self {
        ReplicaHooks {
            local_peer,
            transport,
            results,
            metadata,
        }
    }

    pub fn local_peer(&self) -> PeerId {
        self.local_peer.clone()
    }

    /// Wrap a raw execution result in this worker's identity.
    pub fn node_result(&self, result: ExecutionResult) -> NodeResult {
        NodeResult {
            peer: self.local_peer.clone(),
            result,
        }
    }

    /// Cache a committed result locally. Every replica calls this on
    /// apply; the worker's disband path waits on it before shutdown.
    pub fn cache(&self, request_id: &str, result: NodeResult) {
        self.results.set(request_id.to_string(), result);
    }

    /// Report a committed result back to the request's origin. Invoked by
    /// the leader (Raft) or by any replica holding the quorum-agreed
    /// output (PBFT). Failures are logged, never propagated into the
    /// consensus machinery.
    pub async fn send_to_origin(
        &self,
        request_id: &str,
        origin: &PeerId,
        request: &ExecuteRequest,
        mut node_result: NodeResult,
    ) {
        node_result.result.metadata = self
            .metadata
            .metadata(request, &node_result.result.stdout);

        let code = node_result.result.code;
        let msg = Message::WorkOrderResponse(WorkOrderResponse {
            request_id: request_id.to_string(),
            code,
            result: node_result,
        });

        let payload = match Envelope::encode(&msg) {
            Ok(payload) => payload,
            Err(err) => {
                error!(request = request_id, %err, "could not encode execution result");
                return;
            }
        };

        if let Err(err) = self.transport.send(origin, payload).await {
            error!(request = request_id, peer = %origin, %err,
                "could not send execution result to origin");
        }
    }
}

/// Creates replicas of the requested consensus type. Implemented by the
/// embedding application over its Raft/PBFT libraries; the worker only
/// drives the lifecycle.
#[async_trait]
pub trait ReplicaFactory: Send + Sync + 'static {
    async fn create(
        &self,
        consensus: ConsensusKind,
        spec: ReplicaSpec,
        hooks: ReplicaHooks,
    ) -> Result<Arc<dyn ConsensusReplica>, NodeError>;
}

/// Factory for deployments without consensus backends. Every formation
/// request fails on this worker, which surfaces to the head as a non-OK
/// formation response; direct execution is unaffected.
pub struct DisabledReplicaFactory;

#[async_trait]
impl ReplicaFactory for DisabledReplicaFactory {
    async fn create(
        &self,
        consensus: ConsensusKind,
        spec: ReplicaSpec,
        _hooks: ReplicaHooks,
    ) -> Result<Arc<dyn ConsensusReplica>, NodeError> {
        warn!(request = %spec.request_id, %consensus, "no consensus backend configured");
        Err(NodeError::ConsensusUnavailable(format!(
            "no {} backend configured",
            consensus
        )))
    }
}
