//! Scheduled sync of recently created, fast-rising repositories.

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;

use repo_compare_core::models::UpsertOutcome;
use repo_compare_core::store::Store;

use crate::config::SyncConfig;
use crate::search_source::SourceSearch;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub fetched: usize,
    pub created: usize,
    pub updated: usize,
}

pub async fn sync_trending(
    store: &dyn Store,
    source: &dyn SourceSearch,
    config: &SyncConfig,
    now: i64,
) -> Result<SyncReport> {
    let items = source
        .search_trending(config.days_ago, config.min_stars, config.page_size)
        .await?;

    let mut report = SyncReport {
        fetched: items.len(),
        ..SyncReport::default()
    };
    for item in &items {
        let upserted = store
            .upsert_repository(item, now)
            .await
            .with_context(|| format!("storing {}", item.full_name))?;
        match upserted.outcome {
            UpsertOutcome::Created => report.created += 1,
            UpsertOutcome::Updated => report.updated += 1,
        }
    }

    info!(
        fetched = report.fetched,
        created = report.created,
        updated = report.updated,
        "trending sync finished"
    );
    Ok(report)
}
