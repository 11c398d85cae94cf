use std::collections::{HashMap, VecDeque};
use tracing::{debug, warn};

use crate::coord::registry::WorkerRegistry;
use crate::coord::table_store::TableStore;
use crate::coord::types::{
    CandidatePair, ColumnRef, EvaluationOutcome, PendingCandidate, Task, TaskId, Verdict, WorkerId, WorkerMessage,
};
use crate::core::errors::{MinerError, Result};

/// A dispatched task awaiting its outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlight {
    pub pair: CandidatePair,
    pub attempt: u32,
    pub worker: WorkerId,
}

/// What the coordinator has to do with an outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionAction {
    /// Unknown task, superseded attempt or wrong worker: drop it
    Stale,
    Included(CandidatePair),
    NotIncluded(CandidatePair),
    /// Evaluation errored; re-enqueue `candidate` once its backoff elapsed
    Retry { candidate: PendingCandidate, reason: String },
    /// Evaluation errored and no retries are left
    Exhausted { pair: CandidatePair, attempts: u32, reason: String },
}

/// Result of one pass of the dispatch loop
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub dispatched: usize,
    /// Workers found unreachable while sending
    pub lost_workers: Vec<WorkerId>,
    /// Tasks returned to the queue because their worker was lost
    pub requeued: usize,
}

/// Scheduler owns the pending queue and the in-flight map.
///
/// A candidate is always in exactly one of three places: the pending queue,
/// the in-flight map, or waiting out a retry backoff. It leaves all three
/// only when a matching outcome is accepted.
#[derive(Debug)]
pub struct Scheduler {
    pending: VecDeque<PendingCandidate>,
    in_flight: HashMap<TaskId, InFlight>,
    waiting_retry: usize,
    next_task_id: TaskId,
    generated: bool,
    max_retries: u32,
    worker_capacity: usize,
}

impl Scheduler {
    /// Create a scheduler allowing `max_retries` re-dispatches per erroring
    /// candidate and at most `worker_capacity` tasks in flight per worker
    pub fn new(max_retries: u32, worker_capacity: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            in_flight: HashMap::new(),
            waiting_retry: 0,
            next_task_id: 0,
            generated: false,
            max_retries,
            worker_capacity: worker_capacity.max(1),
        }
    }

    /// Load the generated candidate space. Marks generation as done.
    pub fn seed(&mut self, candidates: Vec<CandidatePair>) {
        self.pending.extend(candidates.into_iter().map(PendingCandidate::fresh));
        self.generated = true;
    }

    /// Hand pending tasks to live workers with a free slot, round-robin.
    ///
    /// Stops when the queue is empty or every live worker is at capacity;
    /// the next completion, registration or departure triggers another pass. A worker whose
    /// mailbox is closed is removed from the registry on the spot and all of
    /// its in-flight tasks go back to the queue.
    pub fn dispatch(&mut self, registry: &mut WorkerRegistry, tables: &TableStore) -> Result<DispatchReport> {
        let mut report = DispatchReport::default();

        while let Some(front) = self.pending.front() {
            let avoid = front.avoid;
            let Some(worker) = registry.next_available(avoid, |id| self.in_flight_for(id) < self.worker_capacity)
            else {
                break;
            };
            let Some(candidate) = self.pending.pop_front() else {
                break;
            };

            let task = self.build_task(&candidate, tables)?;
            let task_id = task.id;
            match worker.mailbox.send(WorkerMessage::Evaluate(task)) {
                Ok(()) => {
                    debug!("Dispatched task {} ({}) to {}", task_id, candidate.pair, worker.id);
                    self.in_flight.insert(
                        task_id,
                        InFlight {
                            pair: candidate.pair,
                            attempt: candidate.attempt,
                            worker: worker.id,
                        },
                    );
                    report.dispatched += 1;
                }
                Err(_) => {
                    warn!("{} is unreachable, removing it", worker.id);
                    self.pending.push_front(candidate);
                    registry.remove(worker.id);
                    report.requeued += self.release_worker(worker.id);
                    report.lost_workers.push(worker.id);
                }
            }
        }

        Ok(report)
    }

    fn build_task(&mut self, candidate: &PendingCandidate, tables: &TableStore) -> Result<Task> {
        let pair = candidate.pair;
        let snapshot = |column: ColumnRef| {
            tables
                .snapshot(column)
                .ok_or_else(|| MinerError::internal(format!("column {} is not materialized", column)))
        };
        let dependent = snapshot(pair.dependent())?;
        let referenced = snapshot(pair.referenced())?;

        let id = self.next_task_id;
        self.next_task_id += 1;
        Ok(Task {
            id,
            pair,
            attempt: candidate.attempt,
            dependent,
            referenced,
        })
    }

    /// Match an outcome against the in-flight map and settle it
    pub fn complete(&mut self, outcome: &EvaluationOutcome) -> CompletionAction {
        let tracked = self
            .in_flight
            .get(&outcome.task_id)
            .map_or(false, |f| f.worker == outcome.worker && f.pair == outcome.pair);
        if !tracked {
            return CompletionAction::Stale;
        }
        let Some(flight) = self.in_flight.remove(&outcome.task_id) else {
            return CompletionAction::Stale;
        };

        match &outcome.verdict {
            Verdict::Included => CompletionAction::Included(flight.pair),
            Verdict::NotIncluded => CompletionAction::NotIncluded(flight.pair),
            Verdict::Error { reason } => {
                if flight.attempt >= self.max_retries {
                    CompletionAction::Exhausted {
                        pair: flight.pair,
                        attempts: flight.attempt + 1,
                        reason: reason.clone(),
                    }
                } else {
                    self.waiting_retry += 1;
                    CompletionAction::Retry {
                        candidate: PendingCandidate {
                            pair: flight.pair,
                            attempt: flight.attempt + 1,
                            avoid: Some(flight.worker),
                        },
                        reason: reason.clone(),
                    }
                }
            }
        }
    }

    /// A retry backoff elapsed: put the candidate back in line
    pub fn retry_due(&mut self, candidate: PendingCandidate) {
        self.waiting_retry = self.waiting_retry.saturating_sub(1);
        self.pending.push_back(candidate);
    }

    /// Return every task held by `worker` to the pending queue
    pub fn release_worker(&mut self, worker: WorkerId) -> usize {
        let mut held: Vec<TaskId> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.worker == worker)
            .map(|(id, _)| *id)
            .collect();
        held.sort_unstable();

        for task_id in &held {
            if let Some(flight) = self.in_flight.remove(task_id) {
                debug!("Requeueing task {} ({}) from {}", task_id, flight.pair, worker);
                self.pending.push_back(PendingCandidate {
                    pair: flight.pair,
                    attempt: flight.attempt,
                    avoid: None,
                });
            }
        }
        held.len()
    }

    /// Candidate space generated, nothing queued, in flight or backing off
    pub fn is_finished(&self) -> bool {
        self.generated && self.pending.is_empty() && self.in_flight.is_empty() && self.waiting_retry == 0
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn waiting_retry_len(&self) -> usize {
        self.waiting_retry
    }

    pub fn in_flight_for(&self, worker: WorkerId) -> usize {
        self.in_flight.values().filter(|f| f.worker == worker).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::candidates::generate_unary_candidates;
    use crate::coord::types::WorkerHandle;
    use tokio::sync::mpsc;

    fn loaded_store() -> TableStore {
        let mut store = TableStore::new(["T0", "T1"]);
        store.on_header(0, vec!["A".into(), "B".into()]).unwrap();
        store
            .on_batch(0, vec![vec!["x".into(), "1".into()], vec!["y".into(), "2".into()]])
            .unwrap();
        store.on_batch(0, vec![]).unwrap();
        store.on_header(1, vec!["C".into()]).unwrap();
        store.on_batch(1, vec![vec!["x".into()], vec!["y".into()]]).unwrap();
        store.on_batch(1, vec![]).unwrap();
        store
    }

    fn worker() -> (WorkerHandle, mpsc::UnboundedReceiver<WorkerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (WorkerHandle::new(WorkerId::next(), tx), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<WorkerMessage>) -> Vec<Task> {
        let mut tasks = Vec::new();
        while let Ok(WorkerMessage::Evaluate(task)) = rx.try_recv() {
            tasks.push(task);
        }
        tasks
    }

    fn outcome(task: &Task, worker: WorkerId, verdict: Verdict) -> EvaluationOutcome {
        EvaluationOutcome {
            task_id: task.id,
            pair: task.pair,
            worker,
            verdict,
        }
    }

    fn seeded(store: &TableStore, retries: u32, capacity: usize) -> Scheduler {
        let mut scheduler = Scheduler::new(retries, capacity);
        scheduler.seed(generate_unary_candidates(&store.columns()));
        scheduler
    }

    #[test]
    fn test_no_workers_keeps_tasks_queued() {
        let store = loaded_store();
        let mut scheduler = seeded(&store, 0, 2);
        let mut registry = WorkerRegistry::new();

        let report = scheduler.dispatch(&mut registry, &store).unwrap();
        assert_eq!(report.dispatched, 0);
        assert_eq!(scheduler.pending_len(), 6);
        assert!(!scheduler.is_finished());
    }

    #[test]
    fn test_dispatch_round_robin_with_snapshots() {
        let store = loaded_store();
        let mut scheduler = seeded(&store, 0, 3);
        let mut registry = WorkerRegistry::new();
        let (a, mut a_rx) = worker();
        let (b, mut b_rx) = worker();
        registry.register(a.clone());
        registry.register(b.clone());

        let report = scheduler.dispatch(&mut registry, &store).unwrap();
        assert_eq!(report.dispatched, 6);
        assert_eq!(scheduler.in_flight_len(), 6);

        let a_tasks = drain(&mut a_rx);
        let b_tasks = drain(&mut b_rx);
        assert_eq!(a_tasks.len(), 3);
        assert_eq!(b_tasks.len(), 3);
        assert_eq!(a_tasks[0].id, 0);
        assert_eq!(b_tasks[0].id, 1);

        let first = &a_tasks[0];
        assert_eq!(first.dependent.column, first.pair.dependent());
        assert_eq!(first.referenced.column, first.pair.referenced());
        assert_eq!(scheduler.in_flight_for(a.id), 3);
    }

    #[test]
    fn test_capacity_leaves_work_for_late_workers() {
        let store = loaded_store();
        let mut scheduler = seeded(&store, 0, 2);
        let mut registry = WorkerRegistry::new();
        let (a, mut a_rx) = worker();
        registry.register(a.clone());

        assert_eq!(scheduler.dispatch(&mut registry, &store).unwrap().dispatched, 2);
        assert_eq!(scheduler.pending_len(), 4);
        // saturated: nothing more goes out
        assert_eq!(scheduler.dispatch(&mut registry, &store).unwrap().dispatched, 0);

        let (b, mut b_rx) = worker();
        registry.register(b.clone());
        assert_eq!(scheduler.dispatch(&mut registry, &store).unwrap().dispatched, 2);
        assert_eq!(drain(&mut b_rx).len(), 2);

        // a completion frees exactly one slot
        let a_tasks = drain(&mut a_rx);
        scheduler.complete(&outcome(&a_tasks[0], a.id, Verdict::NotIncluded));
        assert_eq!(scheduler.dispatch(&mut registry, &store).unwrap().dispatched, 1);
        assert_eq!(drain(&mut a_rx).len(), 1);
        assert_eq!(scheduler.in_flight_for(a.id), 2);
        assert_eq!(scheduler.in_flight_for(b.id), 2);
        assert_eq!(scheduler.pending_len(), 1);
    }

    #[test]
    fn test_completion_and_duplicate_drop() {
        let store = loaded_store();
        let mut scheduler = seeded(&store, 0, 6);
        let mut registry = WorkerRegistry::new();
        let (a, mut rx) = worker();
        registry.register(a.clone());
        scheduler.dispatch(&mut registry, &store).unwrap();

        let tasks = drain(&mut rx);
        let done = outcome(&tasks[0], a.id, Verdict::Included);
        assert_eq!(scheduler.complete(&done), CompletionAction::Included(tasks[0].pair));
        assert_eq!(scheduler.complete(&done), CompletionAction::Stale);

        // outcome claimed by the wrong worker
        let forged = outcome(&tasks[1], WorkerId::next(), Verdict::NotIncluded);
        assert_eq!(scheduler.complete(&forged), CompletionAction::Stale);

        for task in &tasks[1..] {
            let action = scheduler.complete(&outcome(task, a.id, Verdict::NotIncluded));
            assert_eq!(action, CompletionAction::NotIncluded(task.pair));
        }
        assert!(scheduler.is_finished());
    }

    #[test]
    fn test_release_worker_requeues_everything_it_held() {
        let store = loaded_store();
        let mut scheduler = seeded(&store, 0, 6);
        let mut registry = WorkerRegistry::new();
        let (a, mut a_rx) = worker();
        let (b, mut b_rx) = worker();
        registry.register(a.clone());
        registry.register(b.clone());
        scheduler.dispatch(&mut registry, &store).unwrap();
        let stale = drain(&mut a_rx);
        drain(&mut b_rx);

        registry.remove(a.id);
        assert_eq!(scheduler.release_worker(a.id), 3);
        assert_eq!(scheduler.pending_len(), 3);

        let report = scheduler.dispatch(&mut registry, &store).unwrap();
        assert_eq!(report.dispatched, 3);
        assert_eq!(scheduler.in_flight_for(b.id), 6);

        let redispatched = drain(&mut b_rx);
        let old: Vec<_> = stale.iter().map(|t| t.pair).collect();
        let new: Vec<_> = redispatched.iter().map(|t| t.pair).collect();
        assert_eq!(old, new);
        // fresh sequence numbers for the new attempts
        assert!(redispatched.iter().all(|t| t.id >= 6));

        // a late outcome from the departed worker no longer counts
        let late = outcome(&stale[0], a.id, Verdict::Included);
        assert_eq!(scheduler.complete(&late), CompletionAction::Stale);
    }

    #[test]
    fn test_closed_mailbox_counts_as_departure() {
        let store = loaded_store();
        let mut scheduler = seeded(&store, 0, 6);
        let mut registry = WorkerRegistry::new();
        let (dead, dead_rx) = worker();
        let (alive, mut alive_rx) = worker();
        drop(dead_rx);
        registry.register(dead.clone());
        registry.register(alive.clone());

        let report = scheduler.dispatch(&mut registry, &store).unwrap();
        assert_eq!(report.lost_workers, vec![dead.id]);
        assert_eq!(report.dispatched, 6);
        assert_eq!(drain(&mut alive_rx).len(), 6);
        assert!(!registry.contains(dead.id));
    }

    #[test]
    fn test_error_retries_then_exhausts() {
        let store = loaded_store();
        let mut scheduler = Scheduler::new(1, 1);
        let pair = CandidatePair::new(ColumnRef::new(0, 0), ColumnRef::new(1, 0)).unwrap();
        scheduler.seed(vec![pair]);
        let mut registry = WorkerRegistry::new();
        let (a, mut a_rx) = worker();
        let (b, mut b_rx) = worker();
        registry.register(a.clone());
        registry.register(b.clone());

        scheduler.dispatch(&mut registry, &store).unwrap();
        let first = drain(&mut a_rx).remove(0);
        let action = scheduler.complete(&outcome(&first, a.id, Verdict::error("boom")));
        let candidate = match action {
            CompletionAction::Retry { candidate, .. } => candidate,
            other => panic!("expected retry, got {:?}", other),
        };
        assert_eq!(candidate.avoid, Some(a.id));
        assert_eq!(candidate.attempt, 1);
        assert!(!scheduler.is_finished());
        assert_eq!(scheduler.waiting_retry_len(), 1);

        // cursor is on `a` again but the retry goes elsewhere
        registry.next_available(None, |_| true);
        scheduler.retry_due(candidate);
        scheduler.dispatch(&mut registry, &store).unwrap();
        let second = drain(&mut b_rx).remove(0);
        assert_eq!(second.attempt, 1);

        let action = scheduler.complete(&outcome(&second, b.id, Verdict::error("boom")));
        assert_eq!(
            action,
            CompletionAction::Exhausted {
                pair,
                attempts: 2,
                reason: "boom".into()
            }
        );
    }
}
