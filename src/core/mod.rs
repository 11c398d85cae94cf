// Core infrastructure shared by the coordinator and the workers

pub mod errors;

pub use errors::{MinerError, Result};
