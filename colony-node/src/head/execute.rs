//! The four-phase execution protocol run by the head node.

use std::time::{Duration, Instant};

use futures::future;
use metrics::counter;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use colony_core::message::{
    DisbandCluster, Execute, ExecuteResponse, FormCluster, RollCall, RollCallResponse, WorkOrder,
};
use colony_core::signature::sign_work_order;
use colony_core::{
    new_request_id, ClusterInfo, ConsensusKind, Envelope, ExecuteRequest, ExecutionCode, Message,
    PeerId, ResultMap,
};

use super::aggregate;
use super::config::{DISBAND_TIMEOUT, ROLL_CALL_PEER_CEILING, ROLL_CALL_QUIESCENCE};
use super::{HeadNode, DEFAULT_TOPIC};
use crate::errors::{NodeError, Result};
use crate::node_metrics::EXECUTIONS_TOTAL;
use crate::utils::{now_ms, result_key};

impl HeadNode {
    /// Ingress handler for a client's `Execute` message. Always answers,
    /// success or failure.
    pub(crate) async fn process_execute(&self, from: PeerId, exec: Execute) -> Result<()> {
        if let Err(err) = exec.request.validate() {
            let err = NodeError::Invalid(err.to_string());
            warn!(peer = %from, %err, "rejecting execution request at ingress");
            let response = ExecuteResponse {
                request_id: String::new(),
                code: ExecutionCode::Invalid,
                results: ResultMap::new(),
                cluster: ClusterInfo::default(),
                error_message: Some(err.to_string()),
            };
            return self.send_message(&from, &Message::ExecuteResponse(response)).await;
        }

        let request_id = new_request_id();

        let (code, results, cluster, exec_err) = self
            .execute(&request_id, exec.request, exec.topic.as_deref())
            .await;

        if let Some(err) = &exec_err {
            error!(peer = %from, request = %request_id, %err, "execution failed");
        }
        info!(peer = %from, request = %request_id, %code, "execution complete");

        // Only these two failures are informative to the client; everything
        // else is summarized by the code alone.
        let error_message = exec_err.as_ref().and_then(|err| match err {
            NodeError::RollCallTimeout | NodeError::NotEnoughNodes { .. } => Some(err.to_string()),
            _ => None,
        });

        let response = ExecuteResponse {
            request_id,
            code,
            results,
            cluster,
            error_message,
        };
        self.send_message(&from, &Message::ExecuteResponse(response)).await
    }

    /// Run the four phases for one request. Never fails outright: every
    /// path yields a code and a best-effort (possibly empty) result map.
    pub async fn execute(
        &self,
        request_id: &str,
        req: ExecuteRequest,
        topic: Option<&str>,
    ) -> (ExecutionCode, ResultMap, ClusterInfo, Option<NodeError>) {
        counter!(EXECUTIONS_TOTAL.name).increment(1);

        let consensus = match req.config.consensus.parse::<ConsensusKind>() {
            Ok(kind) => kind,
            Err(err) => {
                error!(value = %req.config.consensus, default = %self.cfg.default_consensus, %err,
                    "could not parse consensus algorithm from the request, using default");
                self.cfg.default_consensus
            }
        };

        info!(request = request_id, function = %req.function_id,
            node_count = ?req.config.requested_node_count(), consensus = %consensus,
            "processing execution request");

        // Phase 1. Roll call.
        let peers = match self.execute_roll_call(request_id, &req, consensus, topic).await {
            Ok(peers) => peers,
            Err(err) => {
                let code = match err {
                    NodeError::RollCallTimeout => ExecutionCode::Timeout,
                    _ => ExecutionCode::Error,
                };
                return (code, ResultMap::new(), ClusterInfo::default(), Some(err));
            }
        };

        let cluster = ClusterInfo {
            request_id: request_id.to_string(),
            peers: peers.clone(),
            consensus,
        };

        // Phase 2. Cluster formation, when consensus is requested.
        if consensus.required() {
            info!(request = request_id, peers = ?cluster.peers,
                "requesting cluster formation from peers who reported for roll call");

            if let Err(err) = self.form_cluster(request_id, &peers, consensus).await {
                // Workers that did manage to start a replica must not leak it.
                self.disband_cluster(request_id, &peers).await;
                return (ExecutionCode::Error, ResultMap::new(), cluster, Some(err));
            }
        }

        // Phases 3 and 4. Dispatch the order and gather replies.
        let outcome = self.dispatch_and_gather(request_id, &req, consensus, &peers).await;

        // Disband only now: the work order propagates through the replicated
        // log, and followers may still be catching up when the leader's
        // result arrives. Waiting until the request is fully answered gives
        // the rest of the cluster time to observe it.
        if consensus.required() {
            self.disband_cluster(request_id, &peers).await;
        }

        match outcome {
            Ok((code, results)) => (code, results, cluster, None),
            Err(err) => (ExecutionCode::Error, ResultMap::new(), cluster, Some(err)),
        }
    }

    /// Phase 1: publish the roll call and drain the inbox until enough
    /// suitable peers replied or the deadline passed.
    async fn execute_roll_call(
        &self,
        request_id: &str,
        req: &ExecuteRequest,
        consensus: ConsensusKind,
        topic: Option<&str>,
    ) -> Result<Vec<PeerId>> {
        let needed = req.config.requested_node_count();

        // More peers than the orchestrator will ever select can never be
        // satisfied, so fail before soliciting anyone.
        if let Some(needed) = needed {
            if needed > ROLL_CALL_PEER_CEILING {
                return Err(NodeError::NotEnoughNodes {
                    needed,
                    available: ROLL_CALL_PEER_CEILING,
                });
            }
        }

        let mut inbox = self.roll_calls.open(request_id);

        let msg = Message::RollCall(RollCall {
            request_id: request_id.to_string(),
            function_id: req.function_id.clone(),
            consensus,
            attributes: req.config.attributes.clone(),
        });
        let payload = Envelope::encode(&msg)?;

        let topic = topic.unwrap_or_else(|| {
            self.cfg
                .topics
                .first()
                .map(String::as_str)
                .unwrap_or(DEFAULT_TOPIC)
        });

        if let Err(err) = self.transport.publish(topic, payload).await {
            self.roll_calls.close(request_id);
            return Err(NodeError::Internal(format!("could not publish roll call: {}", err)));
        }

        let deadline = req
            .config
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.cfg.roll_call_timeout);

        let selected = self.collect_roll_call(&mut inbox, req, needed, deadline).await;
        self.roll_calls.close(request_id);
        selected
    }

    async fn collect_roll_call(
        &self,
        inbox: &mut mpsc::Receiver<RollCallResponse>,
        req: &ExecuteRequest,
        needed: Option<usize>,
        deadline: Duration,
    ) -> Result<Vec<PeerId>> {
        let started = Instant::now();
        // Selection order is first-reply-wins and becomes the canonical
        // cluster membership order.
        let mut peers: Vec<PeerId> = Vec::new();

        loop {
            let enough = match needed {
                Some(n) => peers.len() >= n,
                None => peers.len() >= ROLL_CALL_PEER_CEILING,
            };
            if enough {
                return Ok(peers);
            }

            let remaining = deadline.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                if needed.is_none() && !peers.is_empty() {
                    return Ok(peers);
                }
                return Err(NodeError::RollCallTimeout);
            }

            // Without a pinned count, stop once replies go quiet.
            let wait = if needed.is_none() && !peers.is_empty() {
                remaining.min(ROLL_CALL_QUIESCENCE)
            } else {
                remaining
            };

            match tokio::time::timeout(wait, inbox.recv()).await {
                Ok(Some(res)) => {
                    if let Some(filter) = &req.config.attributes {
                        if !filter.matches(&res.attributes) {
                            debug!(responder = %res.responder,
                                "roll-call response does not satisfy the attribute filter, skipping");
                            continue;
                        }
                    }
                    if peers.contains(&res.responder) {
                        continue;
                    }
                    peers.push(res.responder);
                }
                Ok(None) => {
                    return Err(NodeError::Internal("roll-call inbox closed".to_string()));
                }
                Err(_) => {
                    if needed.is_none() && !peers.is_empty() {
                        return Ok(peers);
                    }
                    return Err(NodeError::RollCallTimeout);
                }
            }
        }
    }

    /// Phase 2: ask every selected peer to start a replica and wait for
    /// all of them to acknowledge. Any refusal or missing reply is fatal.
    async fn form_cluster(
        &self,
        request_id: &str,
        peers: &[PeerId],
        consensus: ConsensusKind,
    ) -> Result<()> {
        let msg = Message::FormCluster(FormCluster {
            request_id: request_id.to_string(),
            peers: peers.to_vec(),
            consensus,
            trace: None,
        });
        let payload = Envelope::encode(&msg)?;

        self.transport
            .send_to_many(peers, payload, true)
            .await
            .map_err(|err| NodeError::ClusterFormation(err.to_string()))?;

        let waits = peers.iter().map(|peer| {
            let key = result_key(request_id, peer);
            async move {
                (
                    peer,
                    self.formation_responses
                        .wait_for(key, self.cfg.cluster_formation_timeout)
                        .await,
                )
            }
        });

        for (peer, response) in future::join_all(waits).await {
            match response {
                None => {
                    return Err(NodeError::ClusterFormation(format!(
                        "no response from peer {}",
                        peer
                    )));
                }
                Some(res) if res.code != ExecutionCode::Ok => {
                    return Err(NodeError::ClusterFormation(format!(
                        "peer {} refused cluster formation ({})",
                        peer, res.code
                    )));
                }
                Some(_) => {}
            }
        }

        debug!(request = request_id, "cluster formed");
        Ok(())
    }

    /// Phases 3 and 4: send the work order to every member and gather
    /// replies according to the consensus discipline.
    async fn dispatch_and_gather(
        &self,
        request_id: &str,
        req: &ExecuteRequest,
        consensus: ConsensusKind,
        peers: &[PeerId],
    ) -> Result<(ExecutionCode, ResultMap)> {
        let timestamp_ms = now_ms();

        // Under PBFT workers verify the order really came from this head.
        let signature = (consensus == ConsensusKind::Pbft)
            .then(|| sign_work_order(&self.signing_key, request_id, req, timestamp_ms));

        let order = Message::WorkOrder(WorkOrder {
            request_id: request_id.to_string(),
            request: req.clone(),
            timestamp_ms,
            signature,
        });
        let payload = Envelope::encode(&order)?;

        // With consensus the transport should reach every member: the
        // consensus layer needs to observe the request even though
        // non-leaders drop it at the application layer.
        self.transport
            .send_to_many(peers, payload, consensus.required())
            .await
            .map_err(|err| NodeError::Dispatch(err.to_string()))?;

        debug!(request = request_id, "waiting for execution responses");

        let deadline = req
            .config
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.cfg.execution_timeout);

        let results = match consensus {
            ConsensusKind::Pbft => self.gather_single_result(request_id, peers, deadline).await,
            _ => self.gather_all_results(request_id, peers, deadline).await,
        };

        info!(request = request_id, cluster_size = peers.len(), responded = results.len(),
            "received execution responses");

        let code = aggregate::overall_code(consensus, peers, &results, req.config.effective_threshold());
        Ok((code, results))
    }

    /// PBFT discipline: the cluster agrees on one output and any replica
    /// may report it, so the first reply is authoritative.
    async fn gather_single_result(
        &self,
        request_id: &str,
        peers: &[PeerId],
        deadline: Duration,
    ) -> ResultMap {
        let mut results = ResultMap::new();
        let mut waits: Vec<_> = peers
            .iter()
            .map(|peer| {
                let key = result_key(request_id, peer);
                Box::pin(async move { self.execution_responses.wait_for(key, deadline).await })
            })
            .collect();

        while !waits.is_empty() {
            let (outcome, _, rest) = future::select_all(waits).await;
            if let Some(node_result) = outcome {
                results.insert(node_result.peer.clone(), node_result);
                break;
            }
            waits = rest;
        }
        results
    }

    /// Raft / consensus-free discipline: wait on every member in parallel
    /// and keep whatever arrived by the deadline.
    async fn gather_all_results(
        &self,
        request_id: &str,
        peers: &[PeerId],
        deadline: Duration,
    ) -> ResultMap {
        let waits = peers.iter().map(|peer| {
            let key = result_key(request_id, peer);
            async move { self.execution_responses.wait_for(key, deadline).await }
        });

        future::join_all(waits)
            .await
            .into_iter()
            .flatten()
            .map(|node_result| (node_result.peer.clone(), node_result))
            .collect()
    }

    /// Best-effort cluster teardown, bounded separately from the caller's
    /// deadline so cancelled executions still release worker replicas.
    pub(crate) async fn disband_cluster(&self, request_id: &str, peers: &[PeerId]) {
        let msg = Message::DisbandCluster(DisbandCluster {
            request_id: request_id.to_string(),
        });
        let payload = match Envelope::encode(&msg) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(request = request_id, %err, "could not encode disband message");
                return;
            }
        };

        for peer in peers {
            match tokio::time::timeout(DISBAND_TIMEOUT, self.transport.send(peer, payload.clone()))
                .await
            {
                Ok(Ok(())) => debug!(request = request_id, %peer, "disband request sent"),
                Ok(Err(err)) => {
                    warn!(request = request_id, %peer, %err, "could not send disband request")
                }
                Err(_) => warn!(request = request_id, %peer, "disband request timed out"),
            }
        }
    }

    async fn send_message(&self, to: &PeerId, msg: &Message) -> Result<()> {
        let payload = Envelope::encode(msg)?;
        self.transport.send(to, payload).await?;
        Ok(())
    }
}
