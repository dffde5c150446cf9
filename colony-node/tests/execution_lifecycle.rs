//! End-to-end execution over the in-process mesh, no consensus.
//!
//! Covers the happy path, partial responses against the threshold,
//! roll-call timeouts, ingress validation, and the fallback when a
//! request carries an unusable consensus algorithm.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use colony_core::{ConsensusKind, ExecuteRequest, ExecutionCode};

use common::{fast_head_config, request, FakeReplicaFactory, ScriptedExecutor, TestMesh};

/// Three workers all answer within the deadline: overall `Ok`, a result
/// from every member, cluster membership of three.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn happy_path_three_workers() {
    let mesh = TestMesh::start(
        fast_head_config(),
        vec![
            (ScriptedExecutor::ok("hi"), FakeReplicaFactory::new()),
            (ScriptedExecutor::ok("hi"), FakeReplicaFactory::new()),
            (ScriptedExecutor::ok("hi"), FakeReplicaFactory::new()),
        ],
    )
    .await;

    let res = mesh.submit(request("", 3)).await;

    assert_eq!(res.code, ExecutionCode::Ok);
    assert_eq!(res.results.len(), 3);
    assert_eq!(res.cluster.peers.len(), 3);
    assert_eq!(res.cluster.consensus, ConsensusKind::None);
    assert!(!res.request_id.is_empty());

    for (peer, node_result) in &res.results {
        assert!(res.cluster.peers.contains(peer));
        assert_eq!(node_result.result.stdout, "hi");
        assert_eq!(node_result.result.code, ExecutionCode::Ok);
    }
}

/// Only one of three workers answers before the execution deadline with
/// a threshold of 0.5: overall `PartialContent` with the single result.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn partial_response_below_threshold() {
    let slow = Duration::from_millis(1200);
    let mesh = TestMesh::start(
        fast_head_config(),
        vec![
            (ScriptedExecutor::ok("fast"), FakeReplicaFactory::new()),
            (ScriptedExecutor::slow("late", slow), FakeReplicaFactory::new()),
            (ScriptedExecutor::slow("late", slow), FakeReplicaFactory::new()),
        ],
    )
    .await;

    let res = mesh.submit(request("", 3)).await;

    assert_eq!(res.code, ExecutionCode::PartialContent);
    assert_eq!(res.results.len(), 1);
    assert_eq!(res.cluster.peers.len(), 3);
    assert_eq!(res.results.values().next().unwrap().result.stdout, "fast");
}

/// Asking for five nodes when only two exist: the roll call times out
/// and the failure reason is surfaced to the client.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn roll_call_timeout_with_too_few_workers() {
    let mesh = TestMesh::start(
        fast_head_config(),
        vec![
            (ScriptedExecutor::ok("hi"), FakeReplicaFactory::new()),
            (ScriptedExecutor::ok("hi"), FakeReplicaFactory::new()),
        ],
    )
    .await;

    let res = mesh.submit(request("", 5)).await;

    assert_eq!(res.code, ExecutionCode::Timeout);
    assert!(res.results.is_empty());
    assert_eq!(res.error_message.as_deref(), Some("roll call timeout"));
}

/// A request that fails schema validation is answered immediately with
/// `Invalid`; no roll call ever goes out.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn invalid_request_is_rejected_at_ingress() {
    let mesh = TestMesh::start(
        fast_head_config(),
        vec![(ScriptedExecutor::ok("hi"), FakeReplicaFactory::new())],
    )
    .await;

    let res = mesh
        .submit(ExecuteRequest {
            function_id: String::new(),
            method: "main.wasm".to_string(),
            ..Default::default()
        })
        .await;

    assert_eq!(res.code, ExecutionCode::Invalid);
    assert!(res.request_id.is_empty());
    assert!(res
        .error_message
        .as_deref()
        .unwrap_or_default()
        .contains("function id"));
    assert_eq!(mesh.workers[0].executor.invocations.load(Ordering::SeqCst), 0);
}

/// An unusable consensus value in the request falls back to the head's
/// configured default instead of failing the execution.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_consensus_falls_back_to_default() {
    let mesh = TestMesh::start(
        fast_head_config(),
        vec![
            (ScriptedExecutor::ok("hi"), FakeReplicaFactory::new()),
            (ScriptedExecutor::ok("hi"), FakeReplicaFactory::new()),
        ],
    )
    .await;

    let res = mesh.submit(request("quantum", 2)).await;

    assert_eq!(res.code, ExecutionCode::Ok);
    assert_eq!(res.cluster.consensus, ConsensusKind::None);
    assert_eq!(res.results.len(), 2);
}

/// Enough peers answer but none succeed: the verdict is `Error`, with
/// every failed result still returned.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn all_workers_failing_is_error() {
    let mesh = TestMesh::start(
        fast_head_config(),
        vec![
            (ScriptedExecutor::failing(), FakeReplicaFactory::new()),
            (ScriptedExecutor::failing(), FakeReplicaFactory::new()),
        ],
    )
    .await;

    let res = mesh.submit(request("", 2)).await;

    assert_eq!(res.code, ExecutionCode::Error);
    assert_eq!(res.results.len(), 2);
    for node_result in res.results.values() {
        assert_eq!(node_result.result.code, ExecutionCode::Error);
    }
}

/// With no pinned node count the head takes whoever reports in and stops
/// once replies go quiet.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unset_node_count_accepts_all_responders() {
    let mesh = TestMesh::start(
        fast_head_config(),
        vec![
            (ScriptedExecutor::ok("a"), FakeReplicaFactory::new()),
            (ScriptedExecutor::ok("b"), FakeReplicaFactory::new()),
            (ScriptedExecutor::ok("c"), FakeReplicaFactory::new()),
        ],
    )
    .await;

    let mut req = request("", 0);
    req.config.node_count = None;
    let res = mesh.submit(req).await;

    assert_eq!(res.code, ExecutionCode::Ok);
    assert_eq!(res.cluster.peers.len(), 3);
    assert_eq!(res.results.len(), 3);
}
