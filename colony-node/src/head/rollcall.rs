//! Per-request inbox for roll-call advertisements.
//!
//! The dispatcher is the producer: every `RollCallResponse` is offered to
//! the inbox of its request. The orchestrator is the single consumer,
//! draining until it has enough peers or its deadline passes. Roll call
//! is best-effort, so a saturated inbox drops the advertisement instead
//! of blocking the dispatcher.

use dashmap::DashMap;
use metrics::counter;
use tokio::sync::mpsc;
use tracing::debug;

use colony_core::message::RollCallResponse;

use crate::node_metrics::ROLL_CALLS_DROPPED_TOTAL;

pub(crate) struct RollCallInbox {
    capacity: usize,
    inboxes: DashMap<String, mpsc::Sender<RollCallResponse>>,
}

impl RollCallInbox {
    pub(crate) fn new(capacity: usize) -> Self {
        RollCallInbox {
            capacity,
            inboxes: DashMap::new(),
        }
    }

    /// Open the inbox for a request. The previous inbox for the same id,
    /// if any, is replaced and its pending entries dropped.
    pub(crate) fn open(&self, request_id: &str) -> mpsc::Receiver<RollCallResponse> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.inboxes.insert(request_id.to_string(), tx);
        rx
    }

    pub(crate) fn close(&self, request_id: &str) {
        self.inboxes.remove(request_id);
    }

    /// Offer an advertisement. Unknown request ids (stale replies after
    /// the roll call closed) and full inboxes drop the entry.
    pub(crate) fn offer(&self, response: RollCallResponse) {
        let Some(tx) = self
            .inboxes
            .get(&response.request_id)
            .map(|entry| entry.value().clone())
        else {
            debug!(request = %response.request_id, responder = %response.responder,
                "roll-call response for unknown request, dropping");
            return;
        };

        if tx.try_send(response).is_err() {
            counter!(ROLL_CALLS_DROPPED_TOTAL.name).increment(1);
        }
    }
}
