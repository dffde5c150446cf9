use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

/// Consensus algorithm used by a cluster. `None` means the selected workers
/// execute independently, with no replicated state between them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusKind {
    #[default]
    None,
    Raft,
    Pbft,
}

impl ConsensusKind {
    /// True if the cluster needs a formation phase before work dispatch.
    pub fn required(&self) -> bool {
        !matches!(self, ConsensusKind::None)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown consensus algorithm ({value})")]
pub struct ConsensusParseError {
    pub value: String,
}

/// Grammar accepted from clients: the empty string, "raft" or "pbft",
/// case-insensitive. Anything else is rejected.
impl FromStr for ConsensusKind {
    type Err = ConsensusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "" => Ok(ConsensusKind::None),
            "raft" => Ok(ConsensusKind::Raft),
            "pbft" => Ok(ConsensusKind::Pbft),
            _ => Err(ConsensusParseError {
                value: s.to_string(),
            }),
        }
    }
}

impl Display for ConsensusKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConsensusKind::None => "",
            ConsensusKind::Raft => "raft",
            ConsensusKind::Pbft => "pbft",
        };
        write!(f, "{}", s)
    }
}
