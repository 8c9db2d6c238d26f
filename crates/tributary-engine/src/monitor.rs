//! Observational monitoring.
//!
//! The monitor reads store statistics and registry counts; it owns no
//! locks on the append path and can never block a writer.

use std::sync::Arc;

use serde::Serialize;
use tributary_core::{CoreError, CoreResult};
use tributary_registry::Registry;
use tributary_wal::{WalStats, WalStore};

/// Health snapshot of one engine instance.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// False while the WAL is wedged on a failed flush.
    pub healthy: bool,
    pub wal: WalStats,
    pub project_count: usize,
    pub branch_count: usize,
}

/// Counts, latencies, and health; out of the hot path.
pub struct Monitor {
    wal: Arc<WalStore>,
    registry: Arc<Registry>,
}

impl Monitor {
    #[must_use]
    pub fn new(wal: Arc<WalStore>, registry: Arc<Registry>) -> Self {
        Self { wal, registry }
    }

    /// Builds a health report from store atomics and registry counts.
    ///
    /// # Errors
    ///
    /// `Disabled` or `Storage`.
    pub async fn health(&self) -> CoreResult<HealthReport> {
        let wal = self.wal.stats();
        let projects = self.registry.list_projects().await?;
        let mut branch_count = 0;
        for project in &projects {
            branch_count += self.registry.list_branches(project.project_id).await?.len();
        }

        Ok(HealthReport {
            healthy: wal.wedged.is_none(),
            wal,
            project_count: projects.len(),
            branch_count,
        })
    }

    /// Prometheus text exposition of every registered collector.
    ///
    /// # Errors
    ///
    /// `Storage` when encoding fails.
    pub fn metrics_text(&self) -> CoreResult<String> {
        use prometheus::Encoder;

        let families = prometheus::gather();
        let mut buffer = Vec::new();
        prometheus::TextEncoder::new()
            .encode(&families, &mut buffer)
            .map_err(|err| CoreError::storage(format!("metrics encoding: {err}")))?;
        String::from_utf8(buffer)
            .map_err(|err| CoreError::storage(format!("metrics encoding: {err}")))
    }
}
