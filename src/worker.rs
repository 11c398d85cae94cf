//! Worker side: the inclusion check and the task loop that runs it.
//!
//! Workers are stateless. Each task carries immutable snapshots of both
//! columns; the worker answers with exactly one outcome per task it receives.

use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::coord::coordinator::MinerHandle;
use crate::coord::types::{EvaluationOutcome, Task, Verdict, WorkerHandle, WorkerId, WorkerMessage};
use crate::core::errors::Result;

/// Is every distinct dependent value present among the referenced values?
///
/// An empty dependent side is included in anything. The first missing value
/// short-circuits to `NotIncluded`.
pub fn evaluate(dependent: &HashSet<String>, referenced: &HashSet<String>) -> Verdict {
    if dependent.is_empty() {
        return Verdict::Included;
    }
    // distinct sets: a larger dependent side cannot fit
    if dependent.len() > referenced.len() {
        return Verdict::NotIncluded;
    }
    for value in dependent {
        if !referenced.contains(value) {
            return Verdict::NotIncluded;
        }
    }
    Verdict::Included
}

/// Pluggable evaluation strategy
pub trait Evaluator: Send + Sync + 'static {
    fn evaluate(&self, task: &Task) -> Verdict;
}

/// The exact unary inclusion check
#[derive(Debug, Default, Clone, Copy)]
pub struct SetInclusionEvaluator;

impl Evaluator for SetInclusionEvaluator {
    fn evaluate(&self, task: &Task) -> Verdict {
        if task.dependent.column != task.pair.dependent() || task.referenced.column != task.pair.referenced() {
            return Verdict::error(format!(
                "payload columns {} / {} do not match candidate {}",
                task.dependent.column, task.referenced.column, task.pair
            ));
        }
        evaluate(&task.dependent.values, &task.referenced.values)
    }
}

/// A worker process stand-in: registers with the miner and evaluates tasks
pub struct DependencyWorker {
    id: WorkerId,
    miner: MinerHandle,
    evaluator: Arc<dyn Evaluator>,
}

impl DependencyWorker {
    pub fn new(miner: MinerHandle) -> Self {
        Self {
            id: WorkerId::next(),
            miner,
            evaluator: Arc::new(SetInclusionEvaluator),
        }
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn Evaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// Register with the miner and start serving tasks.
    ///
    /// The worker runs until its mailbox closes or the miner goes away;
    /// aborting the returned handle is a departure.
    pub fn spawn(self) -> Result<(WorkerId, JoinHandle<()>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.id;
        self.miner.register(WorkerHandle::new(id, tx))?;
        let handle = tokio::spawn(self.run(rx));
        Ok((id, handle))
    }

    async fn run(self, mut inbox: mpsc::UnboundedReceiver<WorkerMessage>) {
        debug!("{} started", self.id);
        while let Some(WorkerMessage::Evaluate(task)) = inbox.recv().await {
            let task_id = task.id;
            let pair = task.pair;
            let evaluator = Arc::clone(&self.evaluator);

            let verdict = match tokio::task::spawn_blocking(move || evaluator.evaluate(&task)).await {
                Ok(verdict) => verdict,
                Err(e) => {
                    warn!("{} failed evaluating task {}: {}", self.id, task_id, e);
                    Verdict::error(e.to_string())
                }
            };

            let outcome = EvaluationOutcome {
                task_id,
                pair,
                worker: self.id,
                verdict,
            };
            if self.miner.complete(outcome).is_err() {
                break;
            }
        }
        info!("{} stopped", self.id);
    }
}
