//! # repo-compare CLI (`rcmp`)
//!
//! ## Usage
//!
//! ```bash
//! rcmp --config ./config/rcmp.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `rcmp init` | Create the SQLite database and run schema migrations |
//! | `rcmp compare "<query>"` | Compare repositories for a free-text need |
//! | `rcmp analyze <owner/name>` | Deep analysis of a stored repository |
//! | `rcmp search "<term>"` | Search stored comparisons |
//! | `rcmp show <id>` | Display a comparison |
//! | `rcmp sync trending` | Store recently created, fast-rising repositories |
//! | `rcmp categorize` | Analyze and categorize a batch of stored repositories |
//! | `rcmp budget` | Today's spend, reservations, and remaining budget |
//!
//! Progress goes to stderr; results go to stdout.

use anyhow::{bail, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use repo_compare::app::{App, Services};
use repo_compare::categorize;
use repo_compare::config::{self, Config};
use repo_compare::db;
use repo_compare::error::PipelineError;
use repo_compare::jobs::JobOutcome;
use repo_compare::ledger::{BudgetGate, CostLedger};
use repo_compare::migrate;
use repo_compare::presenter::{print_budget, ComparisonView, ViewerContext};
use repo_compare::progress::ProgressMode;
use repo_compare::search;
use repo_compare::search_source::GitHubSearch;
use repo_compare::sqlite_store::SqliteStore;
use repo_compare::sync;
use repo_compare_core::relevance::MatchMode;
use repo_compare_core::store::Store;

/// repo-compare: ranked, cached comparisons of open-source repositories.
#[derive(Parser)]
#[command(
    name = "rcmp",
    about = "repo-compare: ranked, cached comparisons of open-source repositories",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/rcmp.toml")]
    config: PathBuf,

    /// Progress output on stderr. Defaults to `human` on a terminal, `off`
    /// otherwise.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressArg>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum ProgressArg {
    Off,
    Human,
    Json,
}

impl From<ProgressArg> for ProgressMode {
    fn from(arg: ProgressArg) -> Self {
        match arg {
            ProgressArg::Off => ProgressMode::Off,
            ProgressArg::Human => ProgressMode::Human,
            ProgressArg::Json => ProgressMode::Json,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent: running it again is safe.
    Init,

    /// Compare repositories for a free-text need.
    ///
    /// Reuses a recent comparison of a near-identical request when one
    /// exists; otherwise searches, analyzes, and ranks.
    Compare {
        /// What you are looking for, e.g. "rails background jobs with retries".
        query: String,

        /// Requesting user (for the per-user daily cap).
        #[arg(long, default_value = "cli")]
        user: String,

        /// Session id for progress events. Random when omitted.
        #[arg(long)]
        session: Option<String>,

        /// Number of repositories to analyze and rank.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Deep analysis of a stored repository (reads its README).
    Analyze {
        /// Repository full name, e.g. `mperham/sidekiq`.
        full_name: String,

        #[arg(long, default_value = "cli")]
        user: String,

        #[arg(long)]
        session: Option<String>,
    },

    /// Search stored comparisons.
    Search {
        term: String,

        /// Substring matching instead of fuzzy matching.
        #[arg(long)]
        exact: bool,

        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// Display a comparison and count the view.
    Show {
        id: i64,

        #[arg(long, default_value = "cli")]
        user: String,
    },

    /// Sync repositories from the source service.
    Sync {
        #[command(subcommand)]
        target: SyncTarget,
    },

    /// Analyze and categorize repositories that have no analysis yet.
    ///
    /// Stops at `[batch] max_items` or `[batch] cost_ceiling_usd`.
    Categorize,

    /// Show today's budget and per-model costs.
    Budget,
}

#[derive(Subcommand)]
enum SyncTarget {
    /// Recently created repositories above `[sync] min_stars`.
    Trending,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    let progress = cli
        .progress
        .map(ProgressMode::from)
        .unwrap_or_else(ProgressMode::default_for_tty);

    if let Commands::Init = cli.command {
        migrate::run_migrations(&cfg).await?;
        println!("Database initialized successfully.");
        return Ok(());
    }

    let pool = db::connect(&cfg).await?;
    migrate::migrate_pool(&pool).await?;
    let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool.clone()));
    let now = chrono::Utc::now().timestamp();

    match cli.command {
        Commands::Init => {}
        Commands::Compare {
            query,
            user,
            session,
            limit,
        } => {
            let app = build_app(cfg, store)?;
            let session = session.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let job = app
                .pipeline
                .submit(&query, &user, &session, limit, now)
                .await
                .map_err(user_facing)?;
            let outcome = app.run_reported(job, progress.reporter()).await?;
            finish(&app, outcome, &user).await?;
        }
        Commands::Analyze {
            full_name,
            user,
            session,
        } => {
            let app = build_app(cfg, store)?;
            let session = session.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let job = app
                .deep_analysis
                .submit(&full_name, &user, &session, now)
                .await
                .map_err(user_facing)?;
            match app.run_reported(job, progress.reporter()).await? {
                JobOutcome::Completed(done) => println!("{}", done.message),
                JobOutcome::Failed(e) => bail!("{}", e.user_message()),
                JobOutcome::Skipped => println!("Analysis was already finished."),
            }
        }
        Commands::Search { term, exact, limit } => {
            let mode = if exact {
                MatchMode::Exact
            } else {
                MatchMode::Fuzzy
            };
            let hits =
                search::search_comparisons(store.as_ref(), &cfg.relevance, &term, mode, limit)
                    .await?;
            search::print_hits(&hits);
        }
        Commands::Show { id, user } => {
            show_comparison(store.as_ref(), &cfg, id, &user, now).await?;
        }
        Commands::Sync {
            target: SyncTarget::Trending,
        } => {
            let source = GitHubSearch::new(&cfg.source)?;
            let report = sync::sync_trending(store.as_ref(), &source, &cfg.sync, now).await?;
            println!(
                "Fetched {} repositories: {} new, {} updated.",
                report.fetched, report.created, report.updated
            );
        }
        Commands::Categorize => {
            let batch = cfg.batch.clone();
            let app = build_app(cfg, store)?;
            let report =
                categorize::run_batch(app.store.as_ref(), &app.analyzer, &batch, now).await?;
            println!(
                "Categorized {} repositories ({} failed, ${:.4}); {} still pending.",
                report.processed, report.failed, report.cost_usd, report.remaining
            );
        }
        Commands::Budget => {
            let gate = BudgetGate::new(store.clone(), cfg.budget.clone());
            let status = gate.status(now).await?;
            let entries = CostLedger::new(store.clone()).entries_for(now).await?;
            print_budget(&status, &entries);
        }
    }

    pool.close().await;
    Ok(())
}

fn build_app(cfg: Config, store: Arc<dyn Store>) -> Result<App> {
    let services = Services::from_config(&cfg)?;
    App::new(Arc::new(cfg), store, services)
}

fn user_facing(e: PipelineError) -> anyhow::Error {
    anyhow::anyhow!("{}", e.user_message())
}

async fn finish(app: &App, outcome: JobOutcome, user: &str) -> Result<()> {
    match outcome {
        JobOutcome::Completed(done) => {
            let now = chrono::Utc::now().timestamp();
            show_comparison(app.store.as_ref(), &app.config, done.result_id, user, now).await
        }
        JobOutcome::Failed(e) => bail!("{}", e.user_message()),
        JobOutcome::Skipped => {
            println!("Comparison was already finished.");
            Ok(())
        }
    }
}

async fn show_comparison(
    store: &dyn Store,
    cfg: &Config,
    id: i64,
    user: &str,
    now: i64,
) -> Result<()> {
    let Some(comparison) = store.get_comparison(id).await? else {
        bail!("No comparison with id {}", id);
    };
    store.increment_view_count(id).await?;
    let entries = store.comparison_entries(id).await?;
    let viewer = ViewerContext::new(user, &cfg.budget);
    let mut view = ComparisonView::new(&comparison, entries, &viewer, now);
    view.view_count += 1;
    view.print();
    Ok(())
}
