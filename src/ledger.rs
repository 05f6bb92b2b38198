//! Cost accounting and the daily budget gate.
//!
//! [`CostLedger`] rolls the actual cost of each completion call into the
//! `(date, model)` row for the current UTC day. [`BudgetGate`] decides
//! whether a new paid operation may start:
//!
//! ```text
//! remaining = daily_budget − spent(today) − pending(today)
//! ```
//!
//! A reservation is allowed only while `remaining > 0`, the reservation
//! itself fits, and the user is under their daily cap. The check and the
//! insert of the `processing` operation happen in one store call
//! ([`Store::try_reserve`]), so two concurrent requests cannot both see
//! room that only one of them fits into. Finishing the operation releases
//! the reservation whatever the actual cost was.

use anyhow::Result;
use chrono::{DateTime, NaiveTime, TimeZone, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use repo_compare_core::models::{
    CostLedgerEntry, OperationKind, OperationStatus, PendingOperation, ReservationOutcome,
    ReservationRequest,
};
use repo_compare_core::pricing::{self, TokenUsage};
use repo_compare_core::store::Store;

use crate::config::BudgetConfig;
use crate::error::PipelineError;

/// `YYYY-MM-DD` of the UTC day containing `now`.
pub fn ledger_date(now: i64) -> String {
    utc(now).format("%Y-%m-%d").to_string()
}

/// Unix seconds of 00:00 UTC on the day containing `now`.
pub fn day_start(now: i64) -> i64 {
    utc(now)
        .date_naive()
        .and_time(NaiveTime::MIN)
        .and_utc()
        .timestamp()
}

fn utc(now: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(now, 0).single().unwrap_or_default()
}

/// Records actual completion costs.
#[derive(Clone)]
pub struct CostLedger {
    store: Arc<dyn Store>,
}

impl CostLedger {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Price `usage` for `model` and add it to today's row. Unknown models
    /// are an error; nothing is recorded for them.
    pub async fn record(&self, model: &str, usage: TokenUsage, now: i64) -> Result<f64> {
        let cost = pricing::cost_for(model, usage)?;
        let entry = self
            .store
            .record_cost(
                &ledger_date(now),
                model,
                usage.input_tokens,
                usage.output_tokens,
                cost,
                now,
            )
            .await?;
        debug!(
            model,
            cost_usd = cost,
            day_total_usd = entry.total_cost_usd,
            requests = entry.total_requests,
            "cost recorded"
        );
        Ok(cost)
    }

    pub async fn entries_for(&self, now: i64) -> Result<Vec<CostLedgerEntry>> {
        self.store.ledger_entries(&ledger_date(now)).await
    }
}

/// Snapshot of today's budget.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetStatus {
    pub date: String,
    pub daily_budget_usd: f64,
    pub spent_usd: f64,
    pub pending_usd: f64,
    pub remaining_usd: f64,
    pub can_create: bool,
}

pub struct BudgetGate {
    store: Arc<dyn Store>,
    config: BudgetConfig,
}

impl BudgetGate {
    pub fn new(store: Arc<dyn Store>, config: BudgetConfig) -> Self {
        Self { store, config }
    }

    pub async fn status(&self, now: i64) -> Result<BudgetStatus> {
        let date = ledger_date(now);
        let spent = self.store.total_cost_for_date(&date).await?;
        let pending = self.store.pending_cost_since(day_start(now)).await?;
        let budget = self.config.daily_budget_usd;
        Ok(BudgetStatus {
            date,
            daily_budget_usd: budget,
            spent_usd: spent,
            pending_usd: pending,
            remaining_usd: (budget - spent - pending).max(0.0),
            can_create: spent + pending < budget,
        })
    }

    pub async fn can_create_today(&self, now: i64) -> Result<bool> {
        Ok(self.status(now).await?.can_create)
    }

    fn reservation_for(&self, kind: OperationKind) -> f64 {
        match kind {
            OperationKind::Comparison => self.config.comparison_reservation_usd,
            OperationKind::Analysis => self.config.analysis_reservation_usd,
        }
    }

    /// Atomically reserve budget for a new operation and record it as
    /// `processing`. Rejections come back as domain errors with the reason.
    pub async fn reserve(
        &self,
        kind: OperationKind,
        session_id: &str,
        user_id: &str,
        subject: &str,
        now: i64,
    ) -> std::result::Result<PendingOperation, PipelineError> {
        let request = ReservationRequest {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            subject: subject.to_string(),
            pending_cost_usd: self.reservation_for(kind),
            now,
            date: ledger_date(now),
            day_start: day_start(now),
            daily_budget_usd: self.config.daily_budget_usd,
            user_daily_limit: self.config.user_limit_for(user_id),
        };

        let outcome = self
            .store
            .try_reserve(&request)
            .await
            .map_err(|e| PipelineError::Internal(format!("{:#}", e)))?;

        match outcome {
            ReservationOutcome::Reserved(op) => {
                info!(
                    operation = %op.id,
                    kind = kind.as_str(),
                    user = user_id,
                    reserved_usd = op.pending_cost_usd,
                    "operation accepted"
                );
                Ok(op)
            }
            ReservationOutcome::BudgetExhausted {
                spent_usd,
                pending_usd,
            } => {
                warn!(spent_usd, pending_usd, "daily budget exhausted");
                Err(PipelineError::BudgetExhausted {
                    spent_usd,
                    pending_usd,
                })
            }
            ReservationOutcome::UserLimitReached { count, limit } => {
                warn!(user = user_id, count, limit, "per-user daily limit reached");
                Err(PipelineError::UserLimitReached { count, limit })
            }
        }
    }

    /// Move an operation to its terminal status, releasing the reservation.
    /// Returns `false` if it was already terminal.
    pub async fn release(
        &self,
        operation_id: &str,
        status: OperationStatus,
        result_id: Option<i64>,
        error_message: Option<&str>,
        now: i64,
    ) -> Result<bool> {
        let changed = self
            .store
            .finish_operation(operation_id, status, result_id, error_message, now)
            .await?;
        if !changed {
            debug!(operation = operation_id, "operation already terminal");
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use repo_compare_core::store::memory::InMemoryStore;

    #[test]
    fn utc_day_boundaries() {
        // 2024-03-10T23:59:59Z
        let late = 1_710_115_199;
        assert_eq!(ledger_date(late), "2024-03-10");
        assert_eq!(day_start(late), 1_710_028_800);
        assert_eq!(ledger_date(late + 1), "2024-03-11");
        assert_eq!(day_start(late + 1), late + 1);
    }

    #[tokio::test]
    async fn calls_on_one_day_share_a_row() {
        let ledger = CostLedger::new(Arc::new(InMemoryStore::new()));
        let now = 1_710_000_000;
        for _ in 0..3 {
            ledger
                .record("gpt-4o-mini", TokenUsage::new(1000, 500), now)
                .await
                .unwrap();
        }
        let entries = ledger.entries_for(now).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].total_requests, 3);
        assert_eq!(entries[0].input_tokens, 3000);
        assert!((entries[0].total_cost_usd - 0.00135).abs() < 1e-12);
    }

    #[tokio::test]
    async fn unpriced_model_records_nothing() {
        let ledger = CostLedger::new(Arc::new(InMemoryStore::new()));
        assert!(ledger
            .record("gpt-9", TokenUsage::new(10, 10), 1_710_000_000)
            .await
            .is_err());
        assert!(ledger.entries_for(1_710_000_000).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn gate_blocks_once_spend_reaches_budget() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let config = BudgetConfig {
            daily_budget_usd: 0.001,
            ..BudgetConfig::default()
        };
        let gate = BudgetGate::new(store.clone(), config);
        let ledger = CostLedger::new(store);
        let now = 1_710_000_000;
        assert!(gate.can_create_today(now).await.unwrap());

        ledger
            .record("gpt-4o-mini", TokenUsage::new(10_000, 0), now)
            .await
            .unwrap();
        let status = gate.status(now).await.unwrap();
        assert!(!status.can_create);
        assert_eq!(status.remaining_usd, 0.0);
        // The next UTC day starts fresh.
        assert!(gate.can_create_today(now + 86_400).await.unwrap());
    }

    #[tokio::test]
    async fn fresh_day_reports_positive_zero() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let gate = BudgetGate::new(store, BudgetConfig::default());
        let status = gate.status(1_710_000_000).await.unwrap();
        assert!(status.spent_usd.is_sign_positive());
        assert!(status.pending_usd.is_sign_positive());
        assert_eq!(crate::presenter::format_cost(status.spent_usd), "$0.00");
    }
}
