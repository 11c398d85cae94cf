//! Result accumulation: where confirmed dependencies go.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::coord::types::InclusionDependency;
use crate::core::errors::{MinerError, Result};

/// Receives confirmed dependencies and one final finalize call
#[async_trait]
pub trait ResultSink: Send {
    /// Deliver newly confirmed dependencies. Order across calls is not significant.
    async fn accept(&mut self, dependencies: Vec<InclusionDependency>) -> Result<()>;

    /// Materialize the output. Calls after the first are ignored.
    async fn finalize(&mut self) -> Result<()>;
}

#[derive(Debug, Default)]
struct Collected {
    dependencies: BTreeSet<InclusionDependency>,
    deliveries: usize,
    finalized: bool,
}

/// Keeps results in memory; clones share the same collection
#[derive(Clone, Default)]
pub struct MemoryResultSink {
    inner: Arc<RwLock<Collected>>,
}

impl MemoryResultSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Confirmed dependencies in sorted order
    pub async fn dependencies(&self) -> Vec<InclusionDependency> {
        self.inner.read().await.dependencies.iter().cloned().collect()
    }

    /// Number of `accept` calls received
    pub async fn deliveries(&self) -> usize {
        self.inner.read().await.deliveries
    }

    pub async fn is_finalized(&self) -> bool {
        self.inner.read().await.finalized
    }
}

#[async_trait]
impl ResultSink for MemoryResultSink {
    async fn accept(&mut self, dependencies: Vec<InclusionDependency>) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.deliveries += 1;
        inner.dependencies.extend(dependencies);
        Ok(())
    }

    async fn finalize(&mut self) -> Result<()> {
        self.inner.write().await.finalized = true;
        Ok(())
    }
}

/// Writes the sorted dependencies to a text file, one per line
pub struct ReportFileSink {
    path: PathBuf,
    dependencies: BTreeSet<InclusionDependency>,
    finalized: bool,
}

impl ReportFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            dependencies: BTreeSet::new(),
            finalized: false,
        }
    }

    fn render(&self) -> String {
        let mut report = String::new();
        for ind in &self.dependencies {
            report.push_str(&ind.to_string());
            report.push('\n');
        }
        report
    }
}

#[async_trait]
impl ResultSink for ReportFileSink {
    async fn accept(&mut self, dependencies: Vec<InclusionDependency>) -> Result<()> {
        if self.finalized {
            warn!("Dropping {} dependencies delivered after finalize", dependencies.len());
            return Ok(());
        }
        self.dependencies.extend(dependencies);
        Ok(())
    }

    async fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            return Ok(());
        }
        self.finalized = true;
        tokio::fs::write(&self.path, self.render())
            .await
            .map_err(|e| MinerError::io(format!("write report {}", self.path.display()), e))?;
        info!(
            "Wrote {} inclusion dependencies to {}",
            self.dependencies.len(),
            self.path.display()
        );
        Ok(())
    }
}
