//! Coordinator for distributed unary inclusion dependency mining
//!
//! One coordinator loop owns all scheduling state; workers evaluate
//! candidates and report back through the coordinator's mailbox.

pub mod types;
pub mod table_store;
pub mod candidates;
pub mod registry;
pub mod scheduler;
pub mod coordinator;
pub mod metrics;

pub use types::*;
pub use table_store::TableStore;
pub use candidates::{candidate_count, generate_unary_candidates};
pub use registry::WorkerRegistry;
pub use scheduler::{CompletionAction, DispatchReport, InFlight, Scheduler};
pub use coordinator::*;
pub use metrics::{MinerStats, MiningReport};
