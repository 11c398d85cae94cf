//! DependencyMiner - the heart of the coordinator
//!
//! All coordinator state (tables, registry, queue, in-flight map) is owned by
//! a single loop that handles one mailbox message at a time, so none of it
//! needs locking. Workers, input readers, liveness watchers and retry timers
//! are separate tasks that only talk to the loop through the mailbox; the loop
//! itself never waits on any of them.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::MinerConfig;
use crate::coord::candidates::generate_unary_candidates;
use crate::coord::metrics::{MinerStats, MiningReport};
use crate::coord::registry::WorkerRegistry;
use crate::coord::scheduler::{CompletionAction, Scheduler};
use crate::coord::table_store::TableStore;
use crate::coord::types::{
    CandidatePair, EvaluationOutcome, MinerMessage, MinerStatus, TableId, WorkerHandle, WorkerId,
};
use crate::core::errors::{MinerError, Result};
use crate::input::{InputReader, ReadRequest, TableSource};
use crate::results::ResultSink;

/// Cloneable address of a running miner; how workers register and report
#[derive(Clone, Debug)]
pub struct MinerHandle {
    tx: mpsc::UnboundedSender<MinerMessage>,
}

impl MinerHandle {
    /// Announce a worker. Registering the same worker twice is harmless.
    pub fn register(&self, worker: WorkerHandle) -> Result<()> {
        self.send(MinerMessage::Register { worker })
    }

    /// Report the outcome of a task
    pub fn complete(&self, outcome: EvaluationOutcome) -> Result<()> {
        self.send(MinerMessage::Completion(outcome))
    }

    pub fn send(&self, message: MinerMessage) -> Result<()> {
        self.tx
            .send(message)
            .map_err(|_| MinerError::channel("miner", "coordinator mailbox is closed"))
    }
}

enum Flow {
    Continue,
    Finished,
}

/// Coordinator for unary inclusion dependency discovery
pub struct DependencyMiner {
    config: MinerConfig,
    run_id: Uuid,
    tables: TableStore,
    registry: WorkerRegistry,
    scheduler: Scheduler,
    readers: Vec<mpsc::UnboundedSender<ReadRequest>>,
    sink: Box<dyn ResultSink>,
    tx: mpsc::UnboundedSender<MinerMessage>,
    rx: Option<mpsc::UnboundedReceiver<MinerMessage>>,
    // readers, liveness watchers and retry timers
    background: JoinSet<()>,
    status: watch::Sender<MinerStatus>,
    stats: MinerStats,
    started: Instant,
    started_at: DateTime<Utc>,
    elapsed: Option<Duration>,
    workerless_since: Option<Instant>,
}

impl DependencyMiner {
    /// Create a miner that reports confirmed dependencies to `sink`
    pub fn new(config: MinerConfig, sink: Box<dyn ResultSink>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(MinerStatus::Loading);
        let scheduler = Scheduler::new(config.max_evaluation_retries, config.max_in_flight_per_worker);
        Self {
            config,
            run_id: Uuid::new_v4(),
            tables: TableStore::new(Vec::<String>::new()),
            registry: WorkerRegistry::new(),
            scheduler,
            readers: Vec::new(),
            sink,
            tx,
            rx: Some(rx),
            background: JoinSet::new(),
            status,
            stats: MinerStats::default(),
            started: Instant::now(),
            started_at: Utc::now(),
            elapsed: None,
            workerless_since: None,
        }
    }

    /// Address for workers and other collaborators
    pub fn handle(&self) -> MinerHandle {
        MinerHandle { tx: self.tx.clone() }
    }

    /// Watch the run's phase, including the stalled signal
    pub fn status(&self) -> watch::Receiver<MinerStatus> {
        self.status.subscribe()
    }

    pub fn stats(&self) -> &MinerStats {
        &self.stats
    }

    /// Load every source, mine all unary candidates, finalize the sink.
    ///
    /// Returns once every candidate has a verdict, or with the first fatal
    /// error (load failure, exhausted evaluation retries, safety timeout).
    pub async fn run(mut self, sources: Vec<Box<dyn TableSource>>) -> Result<MiningReport> {
        let mut rx = self
            .rx
            .take()
            .ok_or_else(|| MinerError::internal("miner mailbox already taken"))?;

        info!("Starting mining run {} over {} tables", self.run_id, sources.len());
        let result = match self.start(sources) {
            Ok(()) => self.event_loop(&mut rx).await,
            Err(e) => Err(e),
        };
        self.shutdown();

        match result {
            Ok(()) => Ok(self.report()),
            Err(e) => {
                error!("Mining run {} aborted ({}): {}", self.run_id, e.category(), e);
                self.status.send_replace(MinerStatus::Failed);
                Err(e)
            }
        }
    }

    /// Summary of the run so far
    pub fn report(&self) -> MiningReport {
        let elapsed = self.elapsed.unwrap_or_else(|| self.started.elapsed());
        MiningReport::new(self.run_id, self.started_at, elapsed, self.stats.clone())
    }

    fn prepare_tables(&mut self, names: Vec<String>) {
        self.tables = TableStore::new(names);
        self.stats.tables = self.tables.table_count();
        self.started = Instant::now();
        self.started_at = Utc::now();
        if self.config.discover_nary {
            warn!("n-ary discovery is not supported yet; mining unary dependencies only");
        }
    }

    fn start(&mut self, sources: Vec<Box<dyn TableSource>>) -> Result<()> {
        self.prepare_tables(sources.iter().map(|s| s.name().to_string()).collect());

        for (table, source) in sources.into_iter().enumerate() {
            let (requests, inbox) = mpsc::unbounded_channel();
            let reader = InputReader::new(table, source, self.tx.clone());
            self.background.spawn(reader.run(inbox));
            for request in [ReadRequest::Header, ReadRequest::Batch] {
                requests
                    .send(request)
                    .map_err(|_| MinerError::channel(format!("reader-{}", table), "reader exited early"))?;
            }
            self.readers.push(requests);
        }

        // no tables at all: nothing will ever arrive to trigger readiness
        if self.tables.check_ready() {
            self.start_mining()?;
        }
        Ok(())
    }

    async fn event_loop(&mut self, rx: &mut mpsc::UnboundedReceiver<MinerMessage>) -> Result<()> {
        if self.scheduler.is_finished() {
            return self.finish().await;
        }

        let mut ticker = tokio::time::interval(self.config.stall_check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let run_timeout = self.config.run_timeout;
        let deadline = async move {
            match run_timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                message = rx.recv() => {
                    let Some(message) = message else {
                        return Err(MinerError::channel("miner", "mailbox closed while mining"));
                    };
                    if let Flow::Finished = self.handle_message(message).await? {
                        return Ok(());
                    }
                }
                _ = ticker.tick() => {
                    self.reap_background();
                    self.check_stall();
                }
                _ = &mut deadline => {
                    let limit = run_timeout.unwrap_or_default();
                    return Err(MinerError::timeout("mining run", limit.as_millis() as u64));
                }
            }
        }
    }

    async fn handle_message(&mut self, message: MinerMessage) -> Result<Flow> {
        match message {
            MinerMessage::Header { table, header } => {
                if self.tables.on_header(table, header)? {
                    self.start_mining()?;
                }
            }
            MinerMessage::Batch { table, rows } => {
                let more = !rows.is_empty();
                let ready = self.tables.on_batch(table, rows)?;
                if more {
                    self.request_batch(table);
                }
                if ready {
                    self.start_mining()?;
                }
            }
            MinerMessage::LoadFailed { table, error } => {
                error!("Table {} could not be loaded", table);
                return Err(error);
            }
            MinerMessage::Register { worker } => self.register_worker(worker)?,
            MinerMessage::Completion(outcome) => self.on_completion(outcome).await?,
            MinerMessage::Departed { worker } => self.on_departure(worker)?,
            MinerMessage::RetryDue { candidate } => {
                self.scheduler.retry_due(candidate);
                self.dispatch()?;
            }
        }

        if self.scheduler.is_finished() {
            self.finish().await?;
            return Ok(Flow::Finished);
        }
        Ok(Flow::Continue)
    }

    fn request_batch(&self, table: TableId) {
        let sent = self
            .readers
            .get(table)
            .map_or(false, |reader| reader.send(ReadRequest::Batch).is_ok());
        if !sent {
            warn!("Reader for table {} is gone", table);
        }
    }

    fn start_mining(&mut self) -> Result<()> {
        let columns = self.tables.columns();
        let candidates = generate_unary_candidates(&columns);
        self.stats.columns = columns.len();
        self.stats.candidates = candidates.len();
        info!(
            "All {} tables loaded: {} columns, {} candidates",
            self.tables.table_count(),
            columns.len(),
            candidates.len()
        );

        self.scheduler.seed(candidates);
        self.status.send_replace(MinerStatus::Mining);
        self.dispatch()
    }

    fn dispatch(&mut self) -> Result<()> {
        let report = self.scheduler.dispatch(&mut self.registry, &self.tables)?;
        self.stats.dispatched += report.dispatched as u64;
        self.stats.requeued += report.requeued as u64;
        self.stats.workers_departed += report.lost_workers.len() as u64;
        if report.dispatched > 0 {
            debug!(
                "Dispatched {} tasks ({} pending, {} in flight, {} backing off)",
                report.dispatched,
                self.scheduler.pending_len(),
                self.scheduler.in_flight_len(),
                self.scheduler.waiting_retry_len()
            );
        }
        Ok(())
    }

    fn register_worker(&mut self, worker: WorkerHandle) -> Result<()> {
        let id = worker.id;
        let mailbox = worker.mailbox.clone();
        if !self.registry.register(worker) {
            return Ok(());
        }
        self.stats.workers_joined += 1;
        info!("{} registered ({} live)", id, self.registry.len());

        // liveness: the mailbox closes when the worker goes away
        let tx = self.tx.clone();
        self.background.spawn(async move {
            mailbox.closed().await;
            let _ = tx.send(MinerMessage::Departed { worker: id });
        });

        self.workerless_since = None;
        if *self.status.borrow() == MinerStatus::Stalled {
            info!("Workers available again, resuming");
            self.status.send_replace(MinerStatus::Mining);
        }
        self.dispatch()
    }

    fn on_departure(&mut self, worker: WorkerId) -> Result<()> {
        if self.registry.remove(worker).is_none() {
            debug!("Ignoring departure of unregistered {}", worker);
            return Ok(());
        }
        let requeued = self.scheduler.release_worker(worker);
        self.stats.workers_departed += 1;
        self.stats.requeued += requeued as u64;
        info!(
            "{} departed, requeued {} tasks ({} workers live)",
            worker,
            requeued,
            self.registry.len()
        );
        self.dispatch()
    }

    async fn on_completion(&mut self, outcome: EvaluationOutcome) -> Result<()> {
        match self.scheduler.complete(&outcome) {
            CompletionAction::Stale => {
                self.stats.stale_outcomes += 1;
                debug!("Dropping stale outcome of task {} from {}", outcome.task_id, outcome.worker);
            }
            CompletionAction::Included(pair) => {
                self.stats.included += 1;
                let ind = self.tables.dependency(&pair)?;
                debug!("Confirmed {}", ind);
                self.sink.accept(vec![ind]).await?;
            }
            CompletionAction::NotIncluded(_) => {
                self.stats.rejected += 1;
            }
            CompletionAction::Retry { candidate, reason } => {
                self.stats.retries += 1;
                let delay = self.config.retry_backoff(candidate.attempt);
                warn!(
                    "Evaluating {} on {} failed ({}); retry {} in {:?}",
                    self.describe(&candidate.pair),
                    outcome.worker,
                    reason,
                    candidate.attempt,
                    delay
                );
                let tx = self.tx.clone();
                self.background.spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(MinerMessage::RetryDue { candidate });
                });
            }
            CompletionAction::Exhausted { pair, attempts, reason } => {
                return Err(MinerError::evaluation(&self.describe(&pair), attempts, reason));
            }
        }
        self.dispatch()
    }

    fn describe(&self, pair: &CandidatePair) -> String {
        self.tables
            .dependency(pair)
            .map(|ind| ind.to_string())
            .unwrap_or_else(|_| pair.to_string())
    }

    fn check_stall(&mut self) {
        let starving = self.scheduler.pending_len() > 0 && self.registry.is_empty();
        if !starving {
            self.workerless_since = None;
            return;
        }

        let since = *self.workerless_since.get_or_insert_with(Instant::now);
        if since.elapsed() >= self.config.stall_timeout && *self.status.borrow() != MinerStatus::Stalled {
            self.stats.stalls += 1;
            warn!(
                "No live workers for {:?}; {} tasks waiting",
                since.elapsed(),
                self.scheduler.pending_len()
            );
            self.status.send_replace(MinerStatus::Stalled);
        }
    }

    /// Release slots of finished readers, watchers and retry timers
    fn reap_background(&mut self) {
        while let Some(joined) = self.background.try_join_next() {
            if let Err(e) = joined {
                if e.is_panic() {
                    warn!("Background task panicked: {}", e);
                }
            }
        }
    }

    async fn finish(&mut self) -> Result<()> {
        self.sink.finalize().await?;
        let elapsed = self.started.elapsed();
        self.elapsed = Some(elapsed);
        info!(
            "Finished mining within {} ms! {} of {} candidates confirmed",
            elapsed.as_millis(),
            self.stats.included,
            self.stats.candidates
        );
        self.status.send_replace(MinerStatus::Finished);
        Ok(())
    }

    fn shutdown(&mut self) {
        self.background.abort_all();
        self.registry.clear();
        self.readers.clear();
    }
}
