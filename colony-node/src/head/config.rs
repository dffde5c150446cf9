use std::time::Duration;

use colony_core::ConsensusKind;

/// Topic every node subscribes to when none is configured.
pub const DEFAULT_TOPIC: &str = "colony";

/// Upper bound on roll-call advertisements buffered per request.
pub(crate) const ROLL_CALL_INBOX_CAPACITY: usize = 1000;

/// Cap on selected peers when the request does not pin a node count.
pub(crate) const ROLL_CALL_PEER_CEILING: usize = 16;

/// With no pinned node count, collection stops once no new advertisement
/// arrives within this window.
pub(crate) const ROLL_CALL_QUIESCENCE: Duration = Duration::from_millis(300);

/// Long-term cache size for execution results on the head.
pub(crate) const EXECUTION_RESULT_CACHE: usize = 1000;

/// Deadline for the best-effort disband send after an execution returns.
pub(crate) const DISBAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Head node configuration.
#[derive(Debug, Clone)]
pub struct HeadConfig {
    /// Topics to subscribe to and issue roll calls on.
    pub topics: Vec<String>,
    /// How often to emit the health ping.
    pub health_interval: Duration,
    /// How many inbound messages to process in parallel.
    pub concurrency: usize,
    /// How long to wait for roll-call responses.
    pub roll_call_timeout: Duration,
    /// How long to wait for workers to report execution results.
    pub execution_timeout: Duration,
    /// How long to wait for the cluster to assemble.
    pub cluster_formation_timeout: Duration,
    /// Consensus algorithm used when the request carries an unusable one.
    pub default_consensus: ConsensusKind,
}

impl Default for HeadConfig {
    fn default() -> Self {
        HeadConfig {
            topics: vec![DEFAULT_TOPIC.to_string()],
            health_interval: Duration::from_secs(60),
            concurrency: 10,
            roll_call_timeout: Duration::from_secs(5),
            execution_timeout: Duration::from_secs(20),
            cluster_formation_timeout: Duration::from_secs(10),
            default_consensus: ConsensusKind::None,
        }
    }
}
