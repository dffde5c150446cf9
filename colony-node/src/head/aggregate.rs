//! Consensus-aware scoring of collected execution results.
//!
//! Kept free of orchestration state so every rule can be exercised
//! directly in tests.

use colony_core::{ConsensusKind, ExecutionCode, PeerId, ResultMap};

/// Decide the overall code for an execution.
///
/// PBFT clusters produce one authoritative, quorum-agreed result; its code
/// is the overall code. Raft commits one output across the cluster but
/// only the leader reports it, so a lone reply is authoritative there
/// too and the response ratio is not a failure signal. Consensus-free
/// runs have every peer answering independently:
/// - nobody answered: `NoContent`;
/// - a single-peer cluster answers with exactly its own code;
/// - response ratio below the threshold: `PartialContent`;
/// - otherwise `Ok` if at least one peer succeeded, else `Error`.
pub fn overall_code(
    consensus: ConsensusKind,
    peers: &[PeerId],
    results: &ResultMap,
    threshold: f64,
) -> ExecutionCode {
    if consensus == ConsensusKind::Pbft {
        return results
            .values()
            .next()
            .map(|res| res.result.code)
            .unwrap_or(ExecutionCode::NoContent);
    }

    if results.is_empty() {
        return ExecutionCode::NoContent;
    }

    // A lone reply is decisive: either the cluster was a single peer, or
    // it is the quorum-backed output relayed by a Raft leader.
    if peers.len() == 1 || (consensus == ConsensusKind::Raft && results.len() == 1) {
        if let Some(res) = results.values().next() {
            return res.result.code;
        }
    }

    if consensus == ConsensusKind::None {
        let response_ratio = results.len() as f64 / peers.len() as f64;
        if response_ratio < threshold {
            return ExecutionCode::PartialContent;
        }
    }

    if results.values().any(|res| res.result.code.is_ok()) {
        ExecutionCode::Ok
    } else {
        ExecutionCode::Error
    }
}
