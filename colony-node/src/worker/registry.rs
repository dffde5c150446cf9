//! Registry of live consensus replicas, keyed by request id.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::errors::NodeError;
use crate::worker::consensus::ConsensusReplica;

/// Maps a request id to the replica handling it. The registry owns the
/// handle; once removed, the caller is responsible for shutting the
/// replica down.
pub struct ClusterRegistry {
    replicas: DashMap<String, Arc<dyn ConsensusReplica>>,
}

impl ClusterRegistry {
    pub fn new() -> Self {
        ClusterRegistry {
            replicas: DashMap::new(),
        }
    }

    /// Register a replica. Rejected if the request id is already taken,
    /// so at most one replica exists per (request, worker) pair even
    /// under racing duplicate formation requests.
    pub fn register(
        &self,
        request_id: &str,
        replica: Arc<dyn ConsensusReplica>,
    ) -> Result<(), NodeError> {
        match self.replicas.entry(request_id.to_string()) {
            Entry::Occupied(_) => Err(NodeError::ClusterAlreadyExists(request_id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(replica);
                Ok(())
            }
        }
    }

    pub fn get(&self, request_id: &str) -> Option<Arc<dyn ConsensusReplica>> {
        self.replicas.get(request_id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn remove(&self, request_id: &str) -> Option<Arc<dyn ConsensusReplica>> {
        self.replicas.remove(request_id).map(|(_, replica)| replica)
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.replicas.contains_key(request_id)
    }

    pub fn request_ids(&self) -> Vec<String> {
        self.replicas.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }
}

impl Default for ClusterRegistry {
    fn default() -> Self {
        Self::new()
    }
}
