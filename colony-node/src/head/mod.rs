//! Head node: ingest execution requests, broker them across workers.

pub mod aggregate;
pub mod config;
mod execute;
mod rollcall;

pub use config::{HeadConfig, DEFAULT_TOPIC};

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use metrics::gauge;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use colony_core::message::{FormClusterResponse, HealthPing};
use colony_core::{Envelope, Message, NodeResult, PeerId};

use crate::dispatcher::MessageHandler;
use crate::errors::Result;
use crate::node_metrics::KNOWN_PEERS;
use crate::transport::Transport;
use crate::utils::{now_ms, result_key};
use crate::waitmap::WaitMap;

use config::{EXECUTION_RESULT_CACHE, ROLL_CALL_INBOX_CAPACITY};
use rollcall::RollCallInbox;

pub struct HeadNode {
    cfg: HeadConfig,
    transport: Arc<dyn Transport>,
    /// Signs work orders dispatched to PBFT clusters.
    signing_key: SigningKey,

    roll_calls: RollCallInbox,
    formation_responses: WaitMap<String, FormClusterResponse>,
    execution_responses: WaitMap<String, NodeResult>,

    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl HeadNode {
    pub fn new(cfg: HeadConfig, transport: Arc<dyn Transport>, signing_key: SigningKey) -> Arc<Self> {
        Arc::new(HeadNode {
            cfg,
            transport,
            signing_key,
            roll_calls: RollCallInbox::new(ROLL_CALL_INBOX_CAPACITY),
            formation_responses: WaitMap::new(0),
            execution_responses: WaitMap::new(EXECUTION_RESULT_CACHE),
            health_task: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &HeadConfig {
        &self.cfg
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

    pub fn stop(&self) {
        if let Some(handle) = self
            .health_task
            .lock()
            .expect("health task lock poisoned")
            .take()
        {
            handle.abort();
        }
    }

    async fn publish_health_ping(&self) {
        let ping = Message::HealthPing(HealthPing {
            responder: self.transport.local_peer(),
            attributes: Default::default(),
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
}

#[async_trait]
impl MessageHandler for HeadNode {
    async fn handle(&self, from: PeerId, msg: Message) -> Result<()> {
        match msg {
            Message::Execute(exec) => self.process_execute(from, exec).await,

            Message::RollCallResponse(res) => {
                debug!(request = %res.request_id, responder = %res.responder,
                    "received roll-call response");
                self.roll_calls.offer(res);
                Ok(())
            }

            Message::FormClusterResponse(res) => {
                debug!(request = %res.request_id, peer = %from, code = %res.code,
                    "received cluster formation response");
                let key = result_key(&res.request_id, &from);
                self.formation_responses.set(key, res);
                Ok(())
            }

            Message::WorkOrderResponse(res) => {
                debug!(request = %res.request_id, peer = %from, "received execution response");
                let key = result_key(&res.request_id, &from);
                self.execution_responses.set(key, res.result);
                Ok(())
            }

            Message::HealthPing(ping) => {
                debug!(responder = %ping.responder, "received health ping");
                gauge!(KNOWN_PEERS.name).set(self.transport.connected_peers().len() as f64);
                Ok(())
            }

            other => {
                debug!(kind = other.kind(), %from, "message not handled by head role");
                Ok(())
            }
        }
    }
}
