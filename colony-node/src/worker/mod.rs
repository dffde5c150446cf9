//! Worker node: advertise capabilities, host consensus replicas, run work.

pub mod config;
pub mod consensus;
pub mod registry;

pub use config::WorkerConfig;
pub use consensus::{
    ConsensusReplica, DisabledReplicaFactory, ReplicaFactory, ReplicaHooks, ReplicaSpec,
};
pub use registry::ClusterRegistry;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use metrics::{counter, gauge};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use colony_core::message::{
    DisbandCluster, FormCluster, FormClusterResponse, HealthPing, RollCall, RollCallResponse,
    WorkOrder, WorkOrderResponse,
};
use colony_core::signature::verify_work_order;
use colony_core::{
    ConsensusKind, Envelope, ExecutionCode, ExecutionResult, Message, NodeResult, PeerId,
};

use crate::dispatcher::MessageHandler;
use crate::errors::{NodeError, Result};
use crate::node_metrics::{ACTIVE_CLUSTERS, WORK_ORDERS_TOTAL};
use crate::runtime::{Executor, FunctionStore, MetadataProvider};
use crate::transport::Transport;
use crate::utils::now_ms;
use crate::waitmap::WaitMap;

use config::RESULT_CACHE;

pub struct WorkerNode {
    cfg: WorkerConfig,
    transport: Arc<dyn Transport>,
    executor: Arc<dyn Executor>,
    fstore: Arc<dyn FunctionStore>,
    metadata: Arc<dyn MetadataProvider>,
    replicas: Arc<dyn ReplicaFactory>,

    registry: ClusterRegistry,
    /// Committed results, keyed by request id. Written by replica hooks,
    /// read by the disband path to let results flush before shutdown.
    results: Arc<WaitMap<String, NodeResult>>,

    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerNode {
    pub fn new(
        cfg: WorkerConfig,
        transport: Arc<dyn Transport>,
        executor: Arc<dyn Executor>,
        fstore: Arc<dyn FunctionStore>,
        metadata: Arc<dyn MetadataProvider>,
        replicas: Arc<dyn ReplicaFactory>,
    ) -> Arc<Self> {
        Arc::new(WorkerNode {
            cfg,
            transport,
            executor,
            fstore,
            metadata,
            replicas,
            registry: ClusterRegistry::new(),
            results: Arc::new(WaitMap::new(RESULT_CACHE)),
            health_task: Mutex::new(None),
        })
    }

    pub fn registry(&self) -> &ClusterRegistry {
        &self.registry
    }

    /// Subscribe to the configured topics and start the health ping loop.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        for topic in &self.cfg.topics {
            self.transport.subscribe(topic).await?;
        }

        let node = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(node.cfg.health_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                node.publish_health_ping().await;
            }
        });
        *self.health_task.lock().expect("health task lock poisoned") = Some(handle);

        Ok(())
    }

    /// Stop background work and shut down every live replica with the
    /// configured grace period.
    pub async fn shutdown(&self) {
        if let Some(handle) = self
            .health_task
            .lock()
            .expect("health task lock poisoned")
            .take()
        {
            handle.abort();
        }

        for request_id in self.registry.request_ids() {
            if let Err(err) = self
                .leave_cluster(&request_id, self.cfg.cluster_leave_grace)
                .await
            {
                debug!(request = %request_id, %err, "could not leave cluster on shutdown");
            }
        }
    }

    async fn publish_health_ping(&self) {
        let ping = Message::HealthPing(HealthPing {
            responder: self.transport.local_peer(),
            attributes: self.cfg.attributes.clone(),
            timestamp_ms: now_ms(),
        });
        let payload = match Envelope::encode(&ping) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(%err, "could not encode health ping");
                return;
            }
        };
        for topic in &self.cfg.topics {
            if let Err(err) = self.transport.publish(topic, payload.clone()).await {
                debug!(topic, %err, "could not publish health ping");
            }
        }
    }

    /// Answer a roll call when this worker satisfies the filter and can
    /// actually run the function.
    async fn process_roll_call(&self, from: PeerId, rc: RollCall) -> Result<()> {
        debug!(request = %rc.request_id, function = %rc.function_id, "received roll call");

        if let Some(filter) = &rc.attributes {
            if !filter.matches(&self.cfg.attributes) {
                debug!(request = %rc.request_id, "attribute filter not satisfied, staying quiet");
                return Ok(());
            }
        }

        let installed = match self.fstore.installed(&rc.function_id).await {
            Ok(installed) => installed,
            Err(err) => {
                warn!(function = %rc.function_id, %err, "could not probe function store");
                return Ok(());
            }
        };
        if !installed {
            // Warm the artifact; advertise only when the function is runnable.
            if let Err(err) = self.fstore.fetch(&rc.function_id).await {
                debug!(function = %rc.function_id, %err, "function unavailable, not advertising");
                return Ok(());
            }
        }

        let response = Message::RollCallResponse(RollCallResponse {
            request_id: rc.request_id,
            responder: self.transport.local_peer(),
            attributes: self.cfg.attributes.clone(),
        });
        self.send_message(&from, &response).await
    }

    /// Materialize a replica for the request and acknowledge formation.
    async fn process_form_cluster(&self, from: PeerId, fc: FormCluster) -> Result<()> {
        info!(request = %fc.request_id, consensus = %fc.consensus,
            "received cluster formation request");

        if !fc.consensus.required() {
            warn!(request = %fc.request_id, "formation request without a consensus algorithm");
            return self
                .respond_formation(&from, &fc.request_id, ExecutionCode::Error, fc.consensus)
                .await;
        }

        if self.registry.contains(&fc.request_id) {
            warn!(request = %fc.request_id, "cluster already exists");
            return self
                .respond_formation(&from, &fc.request_id, ExecutionCode::Error, fc.consensus)
                .await;
        }

        let workdir = self.cfg.workspace.join(&fc.request_id);
        if let Err(err) = tokio::fs::create_dir_all(&workdir).await {
            warn!(request = %fc.request_id, %err, "could not create replica workdir");
            return self
                .respond_formation(&from, &fc.request_id, ExecutionCode::Error, fc.consensus)
                .await;
        }

        let spec = ReplicaSpec {
            request_id: fc.request_id.clone(),
            peers: fc.peers.clone(),
            local_peer: self.transport.local_peer(),
            workdir,
            executor: Arc::clone(&self.executor),
        };
        let hooks = ReplicaHooks::new(
            self.transport.local_peer(),
            Arc::clone(&self.transport),
            Arc::clone(&self.results),
            Arc::clone(&self.metadata),
        );

        let replica = match self.replicas.create(fc.consensus, spec, hooks).await {
            Ok(replica) => replica,
            Err(err) => {
                warn!(request = %fc.request_id, %err, "could not create consensus replica");
                return self
                    .respond_formation(&from, &fc.request_id, ExecutionCode::Error, fc.consensus)
                    .await;
            }
        };

        if let Err(err) = self.registry.register(&fc.request_id, Arc::clone(&replica)) {
            // Lost a race against a duplicate formation request.
            warn!(request = %fc.request_id, %err, "replica registration rejected");
            if let Err(err) = replica.shutdown().await {
                warn!(request = %fc.request_id, %err, "could not shut down orphaned replica");
            }
            return self
                .respond_formation(&from, &fc.request_id, ExecutionCode::Error, fc.consensus)
                .await;
        }

        gauge!(ACTIVE_CLUSTERS.name).increment(1.0);
        self.respond_formation(&from, &fc.request_id, ExecutionCode::Ok, fc.consensus)
            .await
    }

    async fn respond_formation(
        &self,
        to: &PeerId,
        request_id: &str,
        code: ExecutionCode,
        consensus: ConsensusKind,
    ) -> Result<()> {
        let msg = Message::FormClusterResponse(FormClusterResponse {
            request_id: request_id.to_string(),
            code,
            consensus,
        });
        self.send_message(to, &msg).await
    }

    async fn process_work_order(&self, from: PeerId, order: WorkOrder) -> Result<()> {
        counter!(WORK_ORDERS_TOTAL.name).increment(1);
        info!(request = %order.request_id, function = %order.request.function_id,
            "received work order");

        match self.registry.get(&order.request_id) {
            Some(replica) => self.replica_work_order(from, order, replica).await,
            None => self.direct_work_order(from, order).await,
        }
    }

    /// Pipeline the order into the replica. Execution happens when the
    /// cluster commits; non-leaders produce no output here.
    async fn replica_work_order(
        &self,
        from: PeerId,
        order: WorkOrder,
        replica: Arc<dyn ConsensusReplica>,
    ) -> Result<()> {
        if replica.kind() == ConsensusKind::Pbft {
            let Some(signature) = &order.signature else {
                warn!(request = %order.request_id, "unsigned work order for a pbft cluster, dropping");
                return Ok(());
            };
            let Some(key) = self.transport.verifying_key(&from) else {
                warn!(request = %order.request_id, peer = %from,
                    "no key material for the order's origin, dropping");
                return Ok(());
            };
            if let Err(err) = verify_work_order(
                &key,
                &order.request_id,
                &order.request,
                order.timestamp_ms,
                signature,
            ) {
                warn!(request = %order.request_id, peer = %from, %err,
                    "work order signature rejected");
                return Ok(());
            }
        }

        match replica
            .execute(from, order.request_id.clone(), order.timestamp_ms, order.request)
            .await
        {
            Ok((code, _)) => {
                debug!(request = %order.request_id, %code, "work order handed to replica")
            }
            Err(err) => warn!(request = %order.request_id, %err, "replica rejected work order"),
        }
        Ok(())
    }

    /// Consensus-free path: run the function and answer directly.
    async fn direct_work_order(&self, from: PeerId, order: WorkOrder) -> Result<()> {
        let result = match self.executor.execute(&order.request_id, &order.request) {
            Ok(result) => result,
            Err(err) => {
                warn!(request = %order.request_id, %err, "execution failed");
                ExecutionResult {
                    code: ExecutionCode::Error,
                    stderr: err.to_string(),
                    ..Default::default()
                }
            }
        };

        let mut node_result = NodeResult {
            peer: self.transport.local_peer(),
            result,
        };
        node_result.result.metadata = self
            .metadata
            .metadata(&order.request, &node_result.result.stdout);

        let code = node_result.result.code;
        let msg = Message::WorkOrderResponse(WorkOrderResponse {
            request_id: order.request_id.clone(),
            code,
            result: node_result,
        });
        self.send_message(&from, &msg).await
    }

    async fn process_disband(&self, from: PeerId, dc: DisbandCluster) -> Result<()> {
        info!(request = %dc.request_id, peer = %from, "received disband request");

        match self
            .leave_cluster(&dc.request_id, self.cfg.cluster_leave_grace)
            .await
        {
            Ok(()) => {}
            // Repeated disbands are expected and harmless.
            Err(NodeError::NoSuchCluster(_)) => {
                debug!(request = %dc.request_id, "no cluster with that id")
            }
            Err(err) => warn!(request = %dc.request_id, %err, "could not leave cluster"),
        }
        Ok(())
    }

    /// Remove and shut down the replica for a request. Waits up to `grace`
    /// for a committed result to flush first.
    pub async fn leave_cluster(&self, request_id: &str, grace: Duration) -> Result<()> {
        let replica = self
            .registry
            .remove(request_id)
            .ok_or_else(|| NodeError::NoSuchCluster(request_id.to_string()))?;

        info!(consensus = %replica.kind(), request = request_id, "leaving consensus cluster");

        // The request is done executing once a result exists locally.
        let executed_work = self
            .results
            .wait_for(request_id.to_string(), grace)
            .await
            .is_some();
        info!(request = request_id, executed_work, "waiting for execution done, leaving cluster");

        if let Err(err) = replica.shutdown().await {
            warn!(request = request_id, %err, "replica shutdown failed");
        }
        gauge!(ACTIVE_CLUSTERS.name).decrement(1.0);

        let workdir = self.cfg.workspace.join(request_id);
        if let Err(err) = tokio::fs::remove_dir_all(&workdir).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                debug!(request = request_id, %err, "could not remove replica workdir");
            }
        }

        Ok(())
    }

    async fn send_message(&self, to: &PeerId, msg: &Message) -> Result<()> {
        let payload = Envelope::encode(msg)?;
        self.transport.send(to, payload).await?;
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for WorkerNode {
    async fn handle(&self, from: PeerId, msg: Message) -> Result<()> {
        match msg {
            Message::RollCall(rc) => self.process_roll_call(from, rc).await,
            Message::FormCluster(fc) => self.process_form_cluster(from, fc).await,
            Message::WorkOrder(order) => self.process_work_order(from, order).await,
            Message::DisbandCluster(dc) => self.process_disband(from, dc).await,
            Message::HealthPing(ping) => {
                debug!(responder = %ping.responder, "received health ping");
                Ok(())
            }
            other => {
                debug!(kind = other.kind(), %from, "message not handled by worker role");
                Ok(())
            }
        }
    }
}
