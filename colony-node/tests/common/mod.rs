//! Shared test helpers for `colony-node` integration tests.
//!
//! Provides a [`TestMesh`] that wires a head node and any number of
//! workers over the in-process transport hub, each worker with its own
//! scripted executor and replica factory. Tests submit requests through
//! an external client peer, exactly as the REST gateway would.

// Not every test binary touches every helper.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use tempfile::TempDir;
use tokio::sync::mpsc;

use colony_core::message::{Execute, ExecuteResponse};
use colony_core::{
    ConsensusKind, Envelope, ExecuteRequest, ExecutionCode, ExecutionResult, Message, PeerId,
};
use colony_node::dispatcher::{Dispatcher, MessageHandler};
use colony_node::errors::NodeError;
use colony_node::head::{HeadConfig, HeadNode};
use colony_node::runtime::{Executor, FunctionStore, NoMetadata, RuntimeError};
use colony_node::transport::{Inbound, MemoryHub, MemoryTransport, Transport};
use colony_node::worker::{
    ConsensusReplica, ReplicaFactory, ReplicaHooks, ReplicaSpec, WorkerConfig, WorkerNode,
};

/// Executor returning a scripted result, optionally after a blocking
/// delay (to simulate a worker that misses the execution deadline).
pub struct ScriptedExecutor {
    code: ExecutionCode,
    stdout: String,
    delay: Option<Duration>,
    pub invocations: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn ok(stdout: &str) -> Arc<Self> {
        Arc::new(ScriptedExecutor {
            code: ExecutionCode::Ok,
            stdout: stdout.to_string(),
            delay: None,
            invocations: AtomicUsize::new(0),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(ScriptedExecutor {
            code: ExecutionCode::Error,
            stdout: String::new(),
            delay: None,
            invocations: AtomicUsize::new(0),
        })
    }

    pub fn slow(stdout: &str, delay: Duration) -> Arc<Self> {
        Arc::new(ScriptedExecutor {
            code: ExecutionCode::Ok,
            stdout: stdout.to_string(),
            delay: Some(delay),
            invocations: AtomicUsize::new(0),
        })
    }
}

impl Executor for ScriptedExecutor {
    fn execute(
        &self,
        _request_id: &str,
        _request: &ExecuteRequest,
    ) -> Result<ExecutionResult, RuntimeError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        Ok(ExecutionResult {
            code: self.code,
            stdout: self.stdout.clone(),
            ..Default::default()
        })
    }
}

/// Function store that treats every artifact as installed.
pub struct InstalledStore;

#[async_trait]
impl FunctionStore for InstalledStore {
    async fn installed(&self, _function_id: &str) -> Result<bool, RuntimeError> {
        Ok(true)
    }

    async fn fetch(&self, _function_id: &str) -> Result<Vec<u8>, RuntimeError> {
        Ok(Vec::new())
    }
}

/// Replica mimicking the commit path of the real backends: a work order
/// is applied on every member (execute + cache); reporting back follows
/// the backend's discipline. The Raft leader relays the committed
/// output, any PBFT replica reports the quorum-agreed one.
pub struct FakeReplica {
    kind: ConsensusKind,
    spec: ReplicaSpec,
    hooks: ReplicaHooks,
    pub shut_down: AtomicBool,
}

#[async_trait]
impl ConsensusReplica for FakeReplica {
    fn kind(&self) -> ConsensusKind {
        self.kind
    }

    async fn execute(
        &self,
        from: PeerId,
        request_id: String,
        _timestamp_ms: u64,
        request: ExecuteRequest,
    ) -> Result<(ExecutionCode, ExecutionResult), NodeError> {
        let is_leader = self.spec.peers.first() == Some(&self.spec.local_peer);

        let result = self
            .spec
            .executor
            .execute(&request_id, &request)
            .unwrap_or_else(|err| ExecutionResult {
                code: ExecutionCode::Error,
                stderr: err.to_string(),
                ..Default::default()
            });
        let node_result = self.hooks.node_result(result);
        self.hooks.cache(&request_id, node_result.clone());

        match self.kind {
            ConsensusKind::Raft if is_leader => {
                self.hooks
                    .send_to_origin(&request_id, &from, &request, node_result)
                    .await;
            }
            ConsensusKind::Pbft => {
                self.hooks
                    .send_to_origin(&request_id, &from, &request, node_result)
                    .await;
            }
            _ => {}
        }

        // Pipelining the order produces no direct output.
        Ok((ExecutionCode::NoContent, ExecutionResult::default()))
    }

    async fn shutdown(&self) -> Result<(), NodeError> {
        self.shut_down.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory recording every replica it creates. Can be configured to
/// refuse creation, simulating a worker without a consensus backend.
pub struct FakeReplicaFactory {
    refuse: bool,
    pub created: Mutex<Vec<Arc<FakeReplica>>>,
}

impl FakeReplicaFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeReplicaFactory {
            refuse: false,
            created: Mutex::new(Vec::new()),
        })
    }

    pub fn refusing() -> Arc<Self> {
        Arc::new(FakeReplicaFactory {
            refuse: true,
            created: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl ReplicaFactory for FakeReplicaFactory {
    async fn create(
        &self,
        consensus: ConsensusKind,
        spec: ReplicaSpec,
        hooks: ReplicaHooks,
    ) -> Result<Arc<dyn ConsensusReplica>, NodeError> {
        if self.refuse {
            return Err(NodeError::ConsensusUnavailable(
                "refused by test factory".to_string(),
            ));
        }
        let replica = Arc::new(FakeReplica {
            kind: consensus,
            spec,
            hooks,
            shut_down: AtomicBool::new(false),
        });
        self.created.lock().unwrap().push(Arc::clone(&replica));
        Ok(replica)
    }
}

/// Head configuration with deadlines short enough for tests.
pub fn fast_head_config() -> HeadConfig {
    HeadConfig {
        roll_call_timeout: Duration::from_millis(800),
        execution_timeout: Duration::from_millis(700),
        cluster_formation_timeout: Duration::from_millis(800),
        health_interval: Duration::from_secs(60),
        ..HeadConfig::default()
    }
}

pub struct WorkerHandle {
    pub node: Arc<WorkerNode>,
    pub peer: PeerId,
    pub executor: Arc<ScriptedExecutor>,
    pub factory: Arc<FakeReplicaFactory>,
}

pub struct TestMesh {
    pub hub: MemoryHub,
    pub head: Arc<HeadNode>,
    pub head_peer: PeerId,
    pub workers: Vec<WorkerHandle>,
    _workspace: TempDir,
    _shutdowns: Vec<mpsc::Sender<()>>,
}

impl TestMesh {
    /// Start a head and one worker per (executor, factory) pair.
    pub async fn start(
        cfg: HeadConfig,
        worker_setups: Vec<(Arc<ScriptedExecutor>, Arc<FakeReplicaFactory>)>,
    ) -> Self {
        let hub = MemoryHub::new();
        let workspace = TempDir::new().expect("create workspace");
        let mut shutdowns = Vec::new();

        let signing_key = SigningKey::generate(&mut OsRng);
        let head_peer = PeerId::new("head");
        let (head_transport, head_inbound) =
            hub.join_with_key(head_peer.clone(), signing_key.verifying_key());

        let head = HeadNode::new(cfg, Arc::new(head_transport), signing_key);
        Arc::clone(&head).start().await.expect("start head");

        let (tx, rx) = mpsc::channel(1);
        shutdowns.push(tx);
        let handler: Arc<dyn MessageHandler> = head.clone();
        let _ = Dispatcher::new(handler, 16).start(head_inbound, rx);

        let mut workers = Vec::new();
        for (i, (executor, factory)) in worker_setups.into_iter().enumerate() {
            let peer = PeerId::new(format!("worker-{}", i));
            let (transport, inbound) = hub.join(peer.clone());

            let config = WorkerConfig {
                workspace: workspace.path().join(peer.as_str()),
                health_interval: Duration::from_secs(60),
                cluster_leave_grace: Duration::from_millis(500),
                ..WorkerConfig::default()
            };
            let node = WorkerNode::new(
                config,
                Arc::new(transport),
                Arc::clone(&executor) as Arc<dyn Executor>,
                Arc::new(InstalledStore),
                Arc::new(NoMetadata),
                Arc::clone(&factory) as Arc<dyn ReplicaFactory>,
            );
            Arc::clone(&node).start().await.expect("start worker");

            let (tx, rx) = mpsc::channel(1);
            shutdowns.push(tx);
            let handler: Arc<dyn MessageHandler> = node.clone();
            let _ = Dispatcher::new(handler, 16).start(inbound, rx);

            workers.push(WorkerHandle {
                node,
                peer,
                executor,
                factory,
            });
        }

        TestMesh {
            hub,
            head,
            head_peer,
            workers,
            _workspace: workspace,
            _shutdowns: shutdowns,
        }
    }

    /// Submit a request as an external client and wait for the response.
    pub async fn submit(&self, request: ExecuteRequest) -> ExecuteResponse {
        let client_peer = PeerId::new(format!("client-{}", colony_core::new_request_id()));
        let (client, mut inbound) = self.hub.join(client_peer);

        let payload = Envelope::encode(&Message::Execute(Execute {
            topic: None,
            request,
        }))
        .expect("encode execute");
        client
            .send(&self.head_peer, payload)
            .await
            .expect("send execute");

        tokio::time::timeout(Duration::from_secs(10), async move {
            loop {
                let inbound_msg = inbound.recv().await.expect("mesh shut down early");
                if let Ok(Message::ExecuteResponse(res)) = Envelope::decode(&inbound_msg.payload) {
                    return res;
                }
            }
        })
        .await
        .expect("timed out waiting for the execute response")
    }

    /// Attach a raw peer for hand-driving the worker protocol.
    pub fn raw_peer(&self, name: &str) -> (MemoryTransport, mpsc::Receiver<Inbound>) {
        self.hub.join(PeerId::new(name))
    }
}

/// Receive and decode the next protocol message on a raw peer.
pub async fn next_message(inbound: &mut mpsc::Receiver<Inbound>) -> Message {
    let msg = tokio::time::timeout(Duration::from_secs(5), inbound.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("channel closed");
    Envelope::decode(&msg.payload).expect("decode message")
}

/// A minimal valid request for the given consensus algorithm.
pub fn request(consensus: &str, node_count: usize) -> ExecuteRequest {
    ExecuteRequest {
        function_id: "bafybeif2actgxglyyyyhbga2764dhjmen2x6kjnrhh5ffkyyp4idwy4y".to_string(),
        method: "main.wasm".to_string(),
        arguments: vec!["--x".to_string()],
        config: colony_core::ExecutionConfig {
            node_count: Some(node_count),
            consensus: consensus.to_string(),
            ..Default::default()
        },
    }
}
