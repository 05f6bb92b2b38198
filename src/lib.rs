//! # repo-compare
//!
//! Turns a free-text need ("Rails background jobs with retry logic") into a
//! ranked comparison of open-source repositories, reusing earlier
//! comparisons of near-identical requests.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌──────────────┐   ┌──────────┐
//! │  submit  │──▶│ cache lookup │──▶│  interpret   │──▶│ aggregate│
//! │ (budget) │   │  (trigrams)  │   │ (completion) │   │ (search) │
//! └──────────┘   └──────┬───────┘   └──────────────┘   └────┬─────┘
//!                       │ hit                                │
//!                       ▼                                    ▼
//!                 ┌──────────┐                         ┌──────────┐
//!                 │ complete │◀────────────────────────│   rank   │
//!                 └──────────┘                         └──────────┘
//! ```
//!
//! Jobs run on a worker pool with retries for transient upstream failures;
//! every stage publishes progress on a session-scoped topic.
//!
//! ## Quick Start
//!
//! ```bash
//! rcmp init
//! rcmp compare "rails background jobs with retry logic"
//! rcmp search "background jobs"
//! rcmp budget
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`db`], [`migrate`], [`sqlite_store`] | SQLite persistence |
//! | [`search_source`], [`completion`], [`embedding`] | External service clients |
//! | [`interpreter`] | Query sanitizing and interpretation |
//! | [`analyzer`] | Basic and deep repository analysis |
//! | [`aggregator`] | Multi-query search, dedup, enrichment |
//! | [`ranker`] | AI ranking into a stored comparison |
//! | [`ledger`] | Cost ledger and daily budget gate |
//! | [`progress`] | Session-scoped progress events |
//! | [`pipeline`] | Cache-or-create orchestration |
//! | [`jobs`] | Worker pool, retries, deep-analysis jobs |
//! | [`categorize`], [`sync`] | Batch categorization and trending sync |
//! | [`search`], [`presenter`] | Comparison search and display |

pub mod aggregator;
pub mod analyzer;
pub mod app;
pub mod categorize;
pub mod completion;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod interpreter;
pub mod jobs;
pub mod ledger;
pub mod migrate;
pub mod pipeline;
pub mod presenter;
pub mod progress;
pub mod ranker;
pub mod search;
pub mod search_source;
pub mod sqlite_store;
pub mod sync;
