use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

pub struct Metric {
    pub name: &'static str,
    description: &'static str,
}

pub const COUNTERS: [Metric; 4] = [
    EXECUTIONS_TOTAL,
    MESSAGES_DROPPED_TOTAL,
    ROLL_CALLS_DROPPED_TOTAL,
    WORK_ORDERS_TOTAL,
];
pub const GAUGES: [Metric; 2] = [ACTIVE_CLUSTERS, KNOWN_PEERS];

// HEAD Metrics --------------------------

pub const EXECUTIONS_TOTAL: Metric = Metric {
    name: "colony_head_executions_total",
    description: "Total execution requests processed by the head node.",
};

pub const ROLL_CALLS_DROPPED_TOTAL: Metric = Metric {
    name: "colony_head_roll_calls_dropped_total",
    description: "Roll-call advertisements dropped because the inbox was full.",
};

pub const KNOWN_PEERS: Metric = Metric {
    name: "colony_head_known_peers",
    description: "Peers currently reachable through the transport.",
};

// NODE Metrics --------------------------

pub const MESSAGES_DROPPED_TOTAL: Metric = Metric {
    name: "colony_node_messages_dropped_total",
    description: "Inbound messages dropped because they could not be decoded.",
};

// WORKER Metrics --------------------------

pub const WORK_ORDERS_TOTAL: Metric = Metric {
    name: "colony_worker_work_orders_total",
    description: "Work orders received by the worker.",
};

pub const ACTIVE_CLUSTERS: Metric = Metric {
    name: "colony_worker_active_clusters",
    description: "Consensus replicas currently registered on the worker.",
};

pub fn init_metrics(prom_addr: Option<std::net::SocketAddr>) {
    info!("Initializing metrics exporter");

    if let Some(addr) = prom_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .expect("failed to install Prometheus recorder");
    }

    for metric in COUNTERS {
        register_counter(metric)
    }

    for metric in GAUGES {
        register_gauge(metric)
    }
}

/// Registers a counter with the given name.
fn register_counter(metric: Metric) {
    metrics::describe_counter!(metric.name, metric.description);
    let _counter = metrics::counter!(metric.name);
}

/// Registers a gauge with the given name.
fn register_gauge(metric: Metric) {
    metrics::describe_gauge!(metric.name, metric.description);
    let _gauge = metrics::gauge!(metric.name);
}
