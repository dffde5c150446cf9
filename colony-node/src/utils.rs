use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Wait-map key for a per-peer slot of a request.
pub fn result_key(request_id: &str, peer: &colony_core::PeerId) -> String {
    format!("{}/{}", request_id, peer)
}
