use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Outcome code of an execution, at the level of a single node result as
/// well as the overall orchestration verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionCode {
    Ok,
    Error,
    Invalid,
    Timeout,
    NoContent,
    PartialContent,
}

impl ExecutionCode {
    pub fn is_ok(&self) -> bool {
        matches!(self, ExecutionCode::Ok)
    }
}

impl Display for ExecutionCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionCode::Ok => "ok",
            ExecutionCode::Error => "error",
            ExecutionCode::Invalid => "invalid",
            ExecutionCode::Timeout => "timeout",
            ExecutionCode::NoContent => "no_content",
            ExecutionCode::PartialContent => "partial_content",
        };
        write!(f, "{}", s)
    }
}
