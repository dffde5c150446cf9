//! `colony-core` — shared model and wire types for the Colony compute network.
//!
//! Every node role (head, worker) and the client SDK speak the message
//! taxonomy defined here. The crate is deliberately small: model types,
//! the wire envelope, the consensus-algorithm grammar, and the work-order
//! signature scheme. No I/O.

pub mod codes;
pub mod consensus;
pub mod execution;
pub mod message;
pub mod signature;

pub use codes::ExecutionCode;
pub use consensus::{ConsensusKind, ConsensusParseError};
pub use execution::{
    new_request_id, Attribute, AttributeFilter, ClusterInfo, ExecuteRequest, ExecutionConfig,
    ExecutionResult, NodeResult, PeerId, ResultMap, DEFAULT_EXECUTION_THRESHOLD,
};
pub use message::{Envelope, Message, WireError, WIRE_VERSION};
