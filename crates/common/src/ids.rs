//! Typed identifiers shared by the coordinator and worker components.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Identifier of a whole distributed query.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryId(pub String);

impl QueryId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::invalid_id(&id, "query id must not be empty"));
        }
        if id.contains('.') {
            return Err(Error::invalid_id(&id, "query id must not contain '.'"));
        }
        Ok(Self(id))
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stage within a query's fragment DAG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StageId(pub u32);

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One attempt at running one partition of a stage.
///
/// Rendered and parsed as `query.stage.partition.attempt`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId {
    query_id: QueryId,
    stage_id: StageId,
    partition_id: u32,
    attempt_id: u32,
}

impl TaskId {
    pub fn new(query_id: QueryId, stage_id: StageId, partition_id: u32, attempt_id: u32) -> Self {
        Self {
            query_id,
            stage_id,
            partition_id,
            attempt_id,
        }
    }

    pub fn query_id(&self) -> &QueryId {
        &self.query_id
    }

    pub fn stage_id(&self) -> StageId {
        self.stage_id
    }

    pub fn partition_id(&self) -> u32 {
        self.partition_id
    }

    pub fn attempt_id(&self) -> u32 {
        self.attempt_id
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.query_id, self.stage_id, self.partition_id, self.attempt_id
        )
    }
}

impl FromStr for TaskId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() != 4 {
            return Err(Error::invalid_id(s, "expected query.stage.partition.attempt"));
        }
        let number = |part: &str, name: &str| -> Result<u32> {
            part.parse::<u32>()
                .map_err(|e| Error::invalid_id(s, format!("bad {} '{}': {}", name, part, e)))
        };
        Ok(Self {
            query_id: QueryId::new(parts[0])?,
            stage_id: StageId(number(parts[1], "stage")?),
            partition_id: number(parts[2], "partition")?,
            attempt_id: number(parts[3], "attempt")?,
        })
    }
}

/// Plan node that consumes splits (a table scan or remote source).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlanNodeId(pub String);

impl PlanNodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for PlanNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One downstream destination of a task's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutputBufferId(pub u32);

impl fmt::Display for OutputBufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DynamicFilterId(pub String);

impl DynamicFilterId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for DynamicFilterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_id_display_and_parse_agree() {
        let id = TaskId::new(QueryId::new("20240101_abc").unwrap(), StageId(3), 7, 1);
        assert_eq!(id.to_string(), "20240101_abc.3.7.1");
        let parsed: TaskId = "20240101_abc.3.7.1".parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn task_id_rejects_malformed_input() {
        assert!("q1.2.3".parse::<TaskId>().is_err());
        assert!("q1.x.0.0".parse::<TaskId>().is_err());
        assert!(".1.0.0".parse::<TaskId>().is_err());
    }

    #[test]
    fn query_id_rejects_separator() {
        let err = QueryId::new("a.b").unwrap_err();
        assert!(matches!(err, Error::InvalidId { .. }));
    }
}
