//! Read-only views for display.
//!
//! A view is built from stored records plus the viewer; it never writes
//! and the records carry no presentation logic of their own.

use serde::Serialize;

use repo_compare_core::models::{Comparison, ComparisonEntry, CostLedgerEntry};

use crate::config::BudgetConfig;
use crate::ledger::BudgetStatus;

/// Who is looking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewerContext {
    pub user_id: String,
    pub is_admin: bool,
}

impl ViewerContext {
    pub fn new(user_id: &str, budget: &BudgetConfig) -> Self {
        Self {
            user_id: user_id.to_string(),
            is_admin: budget.is_admin(user_id),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ComparisonView {
    pub id: i64,
    pub query: String,
    pub recommended: Option<String>,
    pub recommendation_reason: Option<String>,
    pub entries: Vec<ComparisonEntry>,
    pub technologies: Vec<String>,
    pub problem_domains: Vec<String>,
    pub cost: String,
    pub age: String,
    pub view_count: i64,
    pub can_refresh: bool,
}

impl ComparisonView {
    pub fn new(
        comparison: &Comparison,
        entries: Vec<ComparisonEntry>,
        viewer: &ViewerContext,
        now: i64,
    ) -> Self {
        Self {
            id: comparison.id,
            query: comparison.user_query.clone(),
            recommended: comparison.recommended_repo_full_name.clone(),
            recommendation_reason: comparison.recommendation_reason.clone(),
            entries,
            technologies: comparison.technologies.clone(),
            problem_domains: comparison.problem_domains.clone(),
            cost: format_cost(comparison.cost_usd),
            age: format_age(now - comparison.created_at),
            view_count: comparison.view_count,
            can_refresh: viewer.is_admin,
        }
    }

    pub fn print(&self) {
        println!("Comparison #{}: {}", self.id, self.query);
        if let Some(ref recommended) = self.recommended {
            println!("  recommended: {}", recommended);
        }
        if let Some(ref reason) = self.recommendation_reason {
            println!("  why: {}", reason);
        }
        println!();
        for entry in &self.entries {
            println!(
                "{}. {} [{:.0}]",
                entry.rank, entry.repository_full_name, entry.score
            );
            if !entry.fit_reasoning.is_empty() {
                println!("    fit: {}", entry.fit_reasoning);
            }
            for pro in &entry.pros {
                println!("    + {}", pro);
            }
            for con in &entry.cons {
                println!("    - {}", con);
            }
        }
        println!();
        println!(
            "  {} · {} · {} views{}",
            self.cost,
            self.age,
            self.view_count,
            if self.can_refresh {
                " · refreshable"
            } else {
                ""
            }
        );
    }
}

/// Four decimal places under a cent, two otherwise. Never prints `-0`.
pub fn format_cost(cost_usd: f64) -> String {
    let cost_usd = if cost_usd == 0.0 { 0.0 } else { cost_usd };
    if cost_usd > 0.0 && cost_usd < 0.01 {
        format!("${:.4}", cost_usd)
    } else {
        format!("${:.2}", cost_usd)
    }
}

pub fn format_age(seconds: i64) -> String {
    let seconds = seconds.max(0);
    match seconds {
        0..=59 => "just now".to_string(),
        60..=3599 => plural(seconds / 60, "minute"),
        3600..=86_399 => plural(seconds / 3600, "hour"),
        _ => plural(seconds / 86_400, "day"),
    }
}

fn plural(n: i64, unit: &str) -> String {
    if n == 1 {
        format!("1 {} ago", unit)
    } else {
        format!("{} {}s ago", n, unit)
    }
}

pub fn print_budget(status: &BudgetStatus, ledger: &[CostLedgerEntry]) {
    println!("Budget for {} (UTC)", status.date);
    println!("  daily budget: {}", format_cost(status.daily_budget_usd));
    println!("  spent:        {}", format_cost(status.spent_usd));
    println!("  pending:      {}", format_cost(status.pending_usd));
    println!("  remaining:    {}", format_cost(status.remaining_usd));
    println!(
        "  new work:     {}",
        if status.can_create {
            "allowed"
        } else {
            "blocked"
        }
    );
    if !ledger.is_empty() {
        println!();
        println!("{:<20} {:>8} {:>12} {:>12} {:>10}", "MODEL", "REQUESTS", "INPUT", "OUTPUT", "COST");
        for entry in ledger {
            println!(
                "{:<20} {:>8} {:>12} {:>12} {:>10}",
                entry.model,
                entry.total_requests,
                entry.input_tokens,
                entry.output_tokens,
                format_cost(entry.total_cost_usd)
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_formatting() {
        assert_eq!(format_cost(0.0), "$0.00");
        assert_eq!(format_cost(0.0042), "$0.0042");
        assert_eq!(format_cost(1.5), "$1.50");
        assert_eq!(format_cost(-0.0), "$0.00");
    }

    #[test]
    fn age_formatting() {
        assert_eq!(format_age(5), "just now");
        assert_eq!(format_age(60), "1 minute ago");
        assert_eq!(format_age(7200), "2 hours ago");
        assert_eq!(format_age(3 * 86_400), "3 days ago");
        assert_eq!(format_age(-10), "just now");
    }

    #[test]
    fn only_admins_can_refresh() {
        let budget = BudgetConfig {
            admin_user_ids: vec!["root".into()],
            ..BudgetConfig::default()
        };
        assert!(ViewerContext::new("root", &budget).is_admin);
        assert!(!ViewerContext::new("alice", &budget).is_admin);
    }
}
