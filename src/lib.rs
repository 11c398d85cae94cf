//! Distributed discovery of unary inclusion dependencies across tables.
//!
//! A [`DependencyMiner`] loads every table through [`TableSource`]s, generates
//! all directional column pairs and farms their inclusion checks out to
//! [`DependencyWorker`]s, which may join and leave at any time. Confirmed
//! dependencies go to a [`ResultSink`].

pub mod core;
pub mod config;
pub mod coord;
pub mod worker;
pub mod input;
pub mod results;

// Re-exports for convenience
pub use config::{MinerConfig, MinerConfigBuilder};
pub use coord::{
    DependencyMiner, InclusionDependency, MinerHandle, MinerStats, MinerStatus, MiningReport,
};
pub use core::errors::{MinerError, Result};
pub use input::{CsvTableSource, MemoryTableSource, TableSource};
pub use results::{MemoryResultSink, ReportFileSink, ResultSink};
pub use worker::{evaluate, DependencyWorker, Evaluator, SetInclusionEvaluator};
