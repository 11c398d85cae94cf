//! Core types for the mining coordinator
//!
//! Identifiers, the candidate/task/outcome model and the messages exchanged
//! between the coordinator, its input readers and its workers.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::core::errors::MinerError;

/// Index of a table in the run's input list
pub type TableId = usize;

/// Sequence number of one dispatch attempt, unique within a run
pub type TaskId = u64;

/// Identity of a column: owning table and position in its header
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ColumnRef {
    pub table: TableId,
    pub column: usize,
}

impl ColumnRef {
    pub fn new(table: TableId, column: usize) -> Self {
        Self { table, column }
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.table, self.column)
    }
}

/// Hypothesis "values(dependent) ⊆ values(referenced)".
///
/// Directional, and never pairs a column with itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CandidatePair {
    dependent: ColumnRef,
    referenced: ColumnRef,
}

impl CandidatePair {
    /// Returns `None` for a self-pair
    pub fn new(dependent: ColumnRef, referenced: ColumnRef) -> Option<Self> {
        if dependent == referenced {
            return None;
        }
        Some(Self { dependent, referenced })
    }

    pub fn dependent(&self) -> ColumnRef {
        self.dependent
    }

    pub fn referenced(&self) -> ColumnRef {
        self.referenced
    }
}

impl fmt::Display for CandidatePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ⊆ {}", self.dependent, self.referenced)
    }
}

/// Immutable distinct-value set of one column, shared with workers
#[derive(Clone, Debug)]
pub struct ColumnSnapshot {
    pub column: ColumnRef,
    pub values: Arc<HashSet<String>>,
}

impl ColumnSnapshot {
    pub fn new(column: ColumnRef, values: Arc<HashSet<String>>) -> Self {
        Self { column, values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A candidate bound to one dispatch attempt
#[derive(Clone, Debug)]
pub struct Task {
    pub id: TaskId,
    pub pair: CandidatePair,
    /// Zero for the first dispatch, incremented on every evaluation retry
    pub attempt: u32,
    pub dependent: ColumnSnapshot,
    pub referenced: ColumnSnapshot,
}

/// Result of evaluating one task
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Included,
    NotIncluded,
    Error { reason: String },
}

impl Verdict {
    pub fn error(reason: impl Into<String>) -> Self {
        Self::Error { reason: reason.into() }
    }
}

/// What a worker sends back for a task
#[derive(Clone, Debug)]
pub struct EvaluationOutcome {
    pub task_id: TaskId,
    pub pair: CandidatePair,
    pub worker: WorkerId,
    pub verdict: Verdict,
}

/// A confirmed unary (or, later, n-ary) inclusion dependency
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InclusionDependency {
    pub dependent_table: String,
    pub dependent_attributes: Vec<String>,
    pub referenced_table: String,
    pub referenced_attributes: Vec<String>,
}

impl InclusionDependency {
    pub fn unary(
        dependent_table: impl Into<String>,
        dependent_attribute: impl Into<String>,
        referenced_table: impl Into<String>,
        referenced_attribute: impl Into<String>,
    ) -> Self {
        Self {
            dependent_table: dependent_table.into(),
            dependent_attributes: vec![dependent_attribute.into()],
            referenced_table: referenced_table.into(),
            referenced_attributes: vec![referenced_attribute.into()],
        }
    }
}

fn write_side(f: &mut fmt::Formatter<'_>, table: &str, attributes: &[String]) -> fmt::Result {
    if attributes.len() == 1 {
        write!(f, "{}.{}", table, attributes[0])
    } else {
        write!(f, "{}.[{}]", table, attributes.join(", "))
    }
}

impl fmt::Display for InclusionDependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        write_side(f, &self.dependent_table, &self.dependent_attributes)?;
        write!(f, " ⊆ ")?;
        write_side(f, &self.referenced_table, &self.referenced_attributes)?;
        write!(f, ")")
    }
}

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque, comparable worker identity
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(u64);

impl WorkerId {
    /// Allocate a process-unique id
    pub fn next() -> Self {
        Self(NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Messages a worker accepts
#[derive(Debug)]
pub enum WorkerMessage {
    Evaluate(Task),
}

/// Registry entry for a live worker: its identity and its mailbox.
///
/// Two handles are equal when their ids are equal.
#[derive(Clone, Debug)]
pub struct WorkerHandle {
    pub id: WorkerId,
    pub mailbox: mpsc::UnboundedSender<WorkerMessage>,
}

impl WorkerHandle {
    pub fn new(id: WorkerId, mailbox: mpsc::UnboundedSender<WorkerMessage>) -> Self {
        Self { id, mailbox }
    }
}

impl PartialEq for WorkerHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for WorkerHandle {}

/// A candidate waiting in the pending queue
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingCandidate {
    pub pair: CandidatePair,
    pub attempt: u32,
    /// Worker to skip on the next dispatch when another one is available
    pub avoid: Option<WorkerId>,
}

impl PendingCandidate {
    pub fn fresh(pair: CandidatePair) -> Self {
        Self {
            pair,
            attempt: 0,
            avoid: None,
        }
    }
}

/// Everything the coordinator's mailbox accepts
#[derive(Debug)]
pub enum MinerMessage {
    /// Column names of a table, delivered once
    Header {
        table: TableId,
        header: Vec<String>,
    },
    /// Rows of a table; an empty batch ends the table
    Batch {
        table: TableId,
        rows: Vec<Vec<String>>,
    },
    /// An input reader could not produce its table
    LoadFailed {
        table: TableId,
        error: MinerError,
    },
    Register {
        worker: WorkerHandle,
    },
    Completion(EvaluationOutcome),
    /// A watched worker's mailbox closed
    Departed {
        worker: WorkerId,
    },
    /// Backoff for an erroring candidate has elapsed
    RetryDue {
        candidate: PendingCandidate,
    },
}

/// Observable phase of a run
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MinerStatus {
    Loading,
    Mining,
    /// Work is pending but no worker has been live for longer than the stall timeout
    Stalled,
    Finished,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_pair_is_rejected() {
        let a = ColumnRef::new(0, 1);
        assert!(CandidatePair::new(a, a).is_none());
        assert!(CandidatePair::new(a, ColumnRef::new(1, 1)).is_some());
    }

    #[test]
    fn test_pairs_are_directional() {
        let a = ColumnRef::new(0, 0);
        let b = ColumnRef::new(1, 0);
        let forward = CandidatePair::new(a, b).unwrap();
        let backward = CandidatePair::new(b, a).unwrap();
        assert_ne!(forward, backward);
        assert_eq!(forward.dependent(), backward.referenced());
    }

    #[test]
    fn test_dependency_display() {
        let ind = InclusionDependency::unary("T0", "A", "T1", "C");
        assert_eq!(ind.to_string(), "(T0.A ⊆ T1.C)");

        let nary = InclusionDependency {
            dependent_table: "T0".into(),
            dependent_attributes: vec!["A".into(), "B".into()],
            referenced_table: "T1".into(),
            referenced_attributes: vec!["C".into(), "D".into()],
        };
        assert_eq!(nary.to_string(), "(T0.[A, B] ⊆ T1.[C, D])");
    }

    #[test]
    fn test_worker_handles_compare_by_id() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = WorkerId::next();
        let a = WorkerHandle::new(id, tx.clone());
        let b = WorkerHandle::new(id, tx.clone());
        let c = WorkerHandle::new(WorkerId::next(), tx);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
