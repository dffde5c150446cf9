//! Colony local mesh runner.
//!
//! Spins up a head node and a handful of workers over the in-process
//! transport, either serving until interrupted or running a single
//! execution request and printing its response. Production deployments
//! embed `colony-node` as a library and wire a real peer-to-peer
//! transport, function runtime, and consensus backends into the seams.

use std::fs::read_to_string;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use tokio::sync::mpsc;
use tracing::info;

use colony_core::message::Execute;
use colony_core::{Envelope, ExecuteRequest, ExecutionCode, ExecutionResult, Message, PeerId};

use colony_node::args_parse::Args;
use colony_node::dispatcher::{Dispatcher, MessageHandler};
use colony_node::head::HeadNode;
use colony_node::node_metrics::init_metrics;
use colony_node::runtime::{Executor, FunctionStore, NoMetadata, RuntimeError};
use colony_node::service_configuration::{LoadConfiguration, ServiceConfiguration};
use colony_node::transport::{MemoryHub, Transport};
use colony_node::worker::{DisabledReplicaFactory, WorkerNode};

/// Stand-in runtime for the local mesh: echoes the invocation arguments.
struct EchoExecutor;

impl Executor for EchoExecutor {
    fn execute(
        &self,
        _request_id: &str,
        request: &ExecuteRequest,
    ) -> std::result::Result<ExecutionResult, RuntimeError> {
        Ok(ExecutionResult {
            code: ExecutionCode::Ok,
            stdout: request.arguments.join(" "),
            ..Default::default()
        })
    }
}

/// Function store that treats every artifact as present.
struct LocalStore;

#[async_trait]
impl FunctionStore for LocalStore {
    async fn installed(&self, _function_id: &str) -> std::result::Result<bool, RuntimeError> {
        Ok(true)
    }

    async fn fetch(&self, _function_id: &str) -> std::result::Result<Vec<u8>, RuntimeError> {
        Ok(Vec::new())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    // Parse command line arguments
    let args = Args::parse()?;

    // Load the configuration from the specified YAML file
    let config_content = read_to_string(Path::new(&args.config_file))?;
    let load_config: LoadConfiguration = serde_yaml::from_str(&config_content)?;
    let mut service_config: ServiceConfiguration = load_config.try_into()?;

    // If `prom-exporter` is provided via command-line args, override the config file
    if let Some(prom_exporter) = args.prom_exporter {
        let prom_address: SocketAddr = prom_exporter.parse().context(format!(
            "Failed to parse into Socket address: {}",
            prom_exporter
        ))?;
        service_config.prom_exporter = Some(prom_address);
    }

    init_metrics(service_config.prom_exporter);

    let hub = MemoryHub::new();
    let mut dispatcher_handles = Vec::new();
    let mut shutdown_senders = Vec::new();

    // The head signs PBFT work orders; its public key is resolvable by
    // every worker through the hub.
    let signing_key = SigningKey::generate(&mut OsRng);
    let head_peer = PeerId::new("head");
    let (head_transport, head_inbound) =
        hub.join_with_key(head_peer.clone(), signing_key.verifying_key());

    let head = HeadNode::new(
        service_config.head.clone(),
        Arc::new(head_transport),
        signing_key,
    );
    Arc::clone(&head).start().await?;

    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    shutdown_senders.push(shutdown_tx);
    let head_handler: Arc<dyn MessageHandler> = head.clone();
    dispatcher_handles.push(
        Dispatcher::new(head_handler, service_config.concurrency).start(head_inbound, shutdown_rx),
    );

    let mut workers = Vec::new();
    for i in 0..service_config.local_workers {
        let peer = PeerId::new(format!("worker-{}", i));
        let (transport, inbound) = hub.join(peer.clone());

        let mut worker_config = service_config.worker.clone();
        worker_config.workspace = worker_config.workspace.join(peer.as_str());

        let worker = WorkerNode::new(
            worker_config,
            Arc::new(transport),
            Arc::new(EchoExecutor),
            Arc::new(LocalStore),
            Arc::new(NoMetadata),
            Arc::new(DisabledReplicaFactory),
        );
        Arc::clone(&worker).start().await?;

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        shutdown_senders.push(shutdown_tx);
        let worker_handler: Arc<dyn MessageHandler> = worker.clone();
        dispatcher_handles.push(
            Dispatcher::new(worker_handler, service_config.concurrency)
                .start(inbound, shutdown_rx),
        );
        workers.push(worker);
    }

    info!(
        workers = service_config.local_workers,
        "colony local mesh started"
    );

    if let Some(request_file) = args.execute {
        let request: ExecuteRequest = serde_json::from_str(&read_to_string(&request_file)?)
            .context("could not parse the execution request file")?;

        let client_peer = PeerId::new("client");
        let (client, mut client_inbound) = hub.join(client_peer);

        let payload = Envelope::encode(&Message::Execute(Execute {
            topic: None,
            request,
        }))?;
        client.send(&head_peer, payload).await?;

        let deadline = service_config.head.roll_call_timeout
            + service_config.head.cluster_formation_timeout
            + service_config.head.execution_timeout
            + Duration::from_secs(5);

        let response = tokio::time::timeout(deadline, async {
            while let Some(inbound) = client_inbound.recv().await {
                if let Ok(Message::ExecuteResponse(res)) = Envelope::decode(&inbound.payload) {
                    return Some(res);
                }
            }
            None
        })
        .await
        .context("timed out waiting for the execution response")?
        .context("mesh shut down before responding")?;

        println!("{}", serde_json::to_string_pretty(&response)?);
    } else {
        info!("press Ctrl-C to stop");
        tokio::signal::ctrl_c().await?;
    }

    // Tear down: stop background loops, drain dispatchers, release replicas.
    head.stop();
    for worker in &workers {
        worker.shutdown().await;
    }
    for shutdown in &shutdown_senders {
        let _ = shutdown.send(()).await;
    }
    for handle in dispatcher_handles {
        let _ = handle.await;
    }

    Ok(())
}
