use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::head::DEFAULT_TOPIC;

/// Local cache size for committed execution results.
pub(crate) const RESULT_CACHE: usize = 1000;

/// Worker node configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Topics to watch for roll calls and publish health pings on.
    pub topics: Vec<String>,
    /// Capabilities advertised in roll-call responses and health pings.
    pub attributes: HashMap<String, String>,
    /// Root directory for per-request replica scratch space.
    pub workspace: PathBuf,
    /// How often to emit the health ping.
    pub health_interval: Duration,
    /// How long a disbanding replica may wait for its committed result to
    /// flush before shutdown.
    pub cluster_leave_grace: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            topics: vec![DEFAULT_TOPIC.to_string()],
            attributes: HashMap::new(),
            workspace: PathBuf::from("workspace"),
            health_interval: Duration::from_secs(60),
            cluster_leave_grace: Duration::from_secs(5),
        }
    }
}
