//! Background categorization of repositories that have never been analyzed.
//!
//! One batch takes repositories without a current basic analysis, most
//! starred first, and analyzes them one at a time. The batch stops as soon
//! as it has processed `batch.max_items` repositories or spent
//! `batch.cost_ceiling_usd`; whatever is left stays pending for the next
//! run.

use anyhow::Result;
use serde::Serialize;
use tracing::{info, warn};

use repo_compare_core::store::Store;

use crate::analyzer::RepositoryAnalyzer;
use crate::config::BatchConfig;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchReport {
    pub processed: usize,
    pub failed: usize,
    pub cost_usd: f64,
    /// Repositories still lacking an analysis after this batch.
    pub remaining: i64,
    pub stopped_by: Option<BatchStop>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStop {
    ItemCap,
    CostCeiling,
}

pub async fn run_batch(
    store: &dyn Store,
    analyzer: &RepositoryAnalyzer,
    config: &BatchConfig,
    now: i64,
) -> Result<BatchReport> {
    // One past the cap tells whether the cap, not the backlog, ended the batch.
    let backlog = store
        .repositories_pending_analysis(config.max_items as i64 + 1)
        .await?;

    let mut report = BatchReport::default();
    for repository in backlog.iter() {
        if report.processed + report.failed >= config.max_items {
            report.stopped_by = Some(BatchStop::ItemCap);
            break;
        }
        if report.cost_usd >= config.cost_ceiling_usd {
            report.stopped_by = Some(BatchStop::CostCeiling);
            break;
        }
        match analyzer.analyze_basic(repository, now).await {
            Ok(run) => {
                report.processed += 1;
                report.cost_usd += run.cost_usd;
            }
            Err(e) => {
                report.failed += 1;
                warn!(repo = %repository.full_name, error = %format!("{:#}", e), "categorization failed");
            }
        }
    }

    report.remaining = store.repositories_pending_analysis(i64::MAX).await?.len() as i64;
    info!(
        processed = report.processed,
        failed = report.failed,
        cost_usd = report.cost_usd,
        remaining = report.remaining,
        stopped_by = ?report.stopped_by,
        "categorization batch finished"
    );
    Ok(report)
}
