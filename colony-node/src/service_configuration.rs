use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use colony_core::ConsensusKind;

use crate::head::HeadConfig;
use crate::worker::WorkerConfig;

/// Configuration settings loaded from the config file.
#[derive(Debug, Serialize, Deserialize)]
pub struct LoadConfiguration {
    /// Topics to subscribe to; the first is used for roll calls
    #[serde(default)]
    pub topics: Vec<String>,
    /// How many inbound messages to process in parallel
    #[serde(default)]
    pub concurrency: Option<usize>,
    /// Health ping interval in seconds
    #[serde(default)]
    pub health_interval_secs: Option<u64>,
    /// How long to wait for roll-call responses, in seconds
    #[serde(default)]
    pub roll_call_timeout_secs: Option<u64>,
    /// How long to wait for execution results, in seconds
    #[serde(default)]
    pub execution_timeout_secs: Option<u64>,
    /// How long to wait for cluster formation acks, in seconds
    #[serde(default)]
    pub cluster_formation_timeout_secs: Option<u64>,
    /// Default consensus algorithm ("", "raft" or "pbft")
    #[serde(default)]
    pub default_consensus: Option<String>,
    /// Attributes workers advertise on roll calls and health pings
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    /// Root directory for replica scratch space
    #[serde(default)]
    pub workspace: Option<String>,
    /// Prometheus exporter http address
    #[serde(default)]
    pub prom_exporter: Option<String>,
    /// Local mesh: number of in-process workers to spin up next to the head
    #[serde(default)]
    pub local_workers: Option<usize>,
}

/// Validated configuration the node services are built from.
#[derive(Debug)]
pub struct ServiceConfiguration {
    pub concurrency: usize,
    pub head: HeadConfig,
    pub worker: WorkerConfig,
    pub prom_exporter: Option<SocketAddr>,
    pub local_workers: usize,
}

impl TryFrom<LoadConfiguration> for ServiceConfiguration {
    type Error = anyhow::Error;

    fn try_from(config: LoadConfiguration) -> Result<Self> {
        let head_defaults = HeadConfig::default();
        let worker_defaults = WorkerConfig::default();

        let topics = if config.topics.is_empty() {
            head_defaults.topics.clone()
        } else {
            config.topics
        };

        let default_consensus: ConsensusKind = match &config.default_consensus {
            Some(value) => value
                .parse()
                .with_context(|| format!("invalid default_consensus ({})", value))?,
            None => head_defaults.default_consensus,
        };

        let concurrency = config.concurrency.unwrap_or(head_defaults.concurrency);

        let health_interval = config
            .health_interval_secs
            .map(Duration::from_secs)
            .unwrap_or(head_defaults.health_interval);

        let head = HeadConfig {
            topics: topics.clone(),
            health_interval,
            concurrency,
            roll_call_timeout: config
                .roll_call_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(head_defaults.roll_call_timeout),
            execution_timeout: config
                .execution_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(head_defaults.execution_timeout),
            cluster_formation_timeout: config
                .cluster_formation_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(head_defaults.cluster_formation_timeout),
            default_consensus,
        };

        let worker = WorkerConfig {
            topics,
            attributes: config.attributes,
            workspace: config
                .workspace
                .map(PathBuf::from)
                .unwrap_or(worker_defaults.workspace),
            health_interval,
            cluster_leave_grace: worker_defaults.cluster_leave_grace,
        };

        let prom_exporter: Option<SocketAddr> = match config.prom_exporter {
            Some(addr) => Some(
                addr.parse()
                    .with_context(|| format!("Failed to parse prom_exporter address: {}", addr))?,
            ),
            None => None,
        };

        Ok(ServiceConfiguration {
            concurrency,
            head,
            worker,
            prom_exporter,
            local_workers: config.local_workers.unwrap_or(3),
        })
    }
}
