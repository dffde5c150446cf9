//! Inbound message dispatch.
//!
//! One dispatcher runs per node. It decodes wire envelopes, routes the
//! typed message to the node's handler, and caps the number of in-flight
//! handlers with a semaphore: once the cap is reached the reader loop
//! stalls, which backpressures the transport's inbound channel and,
//! through it, remote peers.

use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

use colony_core::{Envelope, Message, PeerId};

use crate::errors::Result;
use crate::node_metrics::MESSAGES_DROPPED_TOTAL;
use crate::transport::Inbound;

/// Typed handler surface implemented by the head and worker nodes.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, from: PeerId, msg: Message) -> Result<()>;
}

pub struct Dispatcher {
    handler: Arc<dyn MessageHandler>,
    semaphore: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(handler: Arc<dyn MessageHandler>, concurrency: usize) -> Self {
        Dispatcher {
            handler,
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    /// Consume the inbound channel until it closes or a shutdown signal
    /// arrives. In-flight handlers are drained before the task returns;
    /// no new handlers are started afterwards.
    pub fn start(
        self,
        mut inbound: mpsc::Receiver<Inbound>,
        mut shutdown: mpsc::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tasks = JoinSet::new();

            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    received = inbound.recv() => {
                        let Inbound { from, payload } = match received {
                            Some(inbound) => inbound,
                            None => break,
                        };

                        let msg = match Envelope::decode(&payload) {
                            Ok(msg) => msg,
                            Err(err) => {
                                warn!(%from, %err, "dropping undecodable message");
                                counter!(MESSAGES_DROPPED_TOTAL.name).increment(1);
                                continue;
                            }
                        };

                        // Blocks once `concurrency` handlers are in flight.
                        let permit = self
                            .semaphore
                            .clone()
                            .acquire_owned()
                            .await
                            .expect("dispatcher semaphore closed");

                        let handler = Arc::clone(&self.handler);
                        tasks.spawn(async move {
                            let _permit = permit;
                            let kind = msg.kind();
                            if let Err(err) = handler.handle(from.clone(), msg).await {
                                warn!(%from, kind, %err, "message handler failed");
                            }
                        });

                        // Opportunistically reap finished handlers so the
                        // set does not grow without bound.
                        while tasks.try_join_next().is_some() {}
                    }
                }
            }

            debug!("dispatcher draining in-flight handlers");
            while tasks.join_next().await.is_some() {}
        })
    }
}
