//! Run counters and the final report

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Counters maintained by the coordinator loop.
///
/// Only the coordinator mutates these, so plain integers suffice.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinerStats {
    pub tables: usize,
    pub columns: usize,
    pub candidates: usize,
    /// Dispatch attempts, including redispatches
    pub dispatched: u64,
    pub included: u64,
    pub rejected: u64,
    /// Evaluation errors that were retried
    pub retries: u64,
    /// Tasks returned to the queue because their worker departed
    pub requeued: u64,
    /// Outcomes dropped as duplicate or stale
    pub stale_outcomes: u64,
    pub workers_joined: u64,
    pub workers_departed: u64,
    /// Times the run entered the stalled state
    pub stalls: u64,
}

impl MinerStats {
    /// Settled candidates, confirmed or rejected
    pub fn settled(&self) -> u64 {
        self.included + self.rejected
    }
}

/// Summary of a finished run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiningReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub stats: MinerStats,
}

impl MiningReport {
    pub fn new(run_id: Uuid, started_at: DateTime<Utc>, elapsed: Duration, stats: MinerStats) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: Utc::now(),
            elapsed_ms: elapsed.as_millis() as u64,
            stats,
        }
    }

    /// Every generated candidate received exactly one verdict
    pub fn is_complete(&self) -> bool {
        self.stats.settled() == self.stats.candidates as u64
    }
}
