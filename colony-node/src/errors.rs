use thiserror::Error;

use colony_core::message::WireError;

use crate::transport::TransportError;

pub type Result<T> = std::result::Result<T, NodeError>;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("roll call timeout")]
    RollCallTimeout,

    #[error("not enough nodes (needed: {needed}, available: {available})")]
    NotEnoughNodes { needed: usize, available: usize },

    #[error("cluster formation failed: {0}")]
    ClusterFormation(String),

    #[error("could not dispatch work order: {0}")]
    Dispatch(String),

    #[error("execution timed out")]
    ExecutionTimeout,

    #[error("no cluster with request id {0}")]
    NoSuchCluster(String),

    #[error("cluster already exists for request id {0}")]
    ClusterAlreadyExists(String),

    #[error("consensus backend unavailable: {0}")]
    ConsensusUnavailable(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    #[error("internal error: {0}")]
    Internal(String),
}
