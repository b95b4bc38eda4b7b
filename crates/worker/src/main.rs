use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use stockval_core::ingest::provider::YahooChartProvider;
use stockval_core::service::{RefreshMode, ValuationService};
use stockval_core::storage::PgStore;
use stockval_core::time::us_market::{parse_run_time, MarketCalendar, DEFAULT_RUN_TIME};
use stockval_core::valuation::ValuationParams;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod scheduler;

#[derive(Debug, Parser)]
#[command(name = "stockval_worker")]
struct Args {
    /// Run a single refresh pass now and exit instead of waiting for the daily schedule.
    #[arg(long)]
    once: bool,

    /// Comma-separated symbols. Defaults to WATCHLIST.
    #[arg(long, value_delimiter = ',')]
    symbols: Vec<String>,

    /// Expected market session (YYYY-MM-DD) for staleness checks. Defaults to the latest
    /// New York session with a final close.
    #[arg(long)]
    as_of_date: Option<String>,

    /// Revalue from stored closes only; no provider calls.
    #[arg(long)]
    stored_only: bool,

    /// Log the plan (symbols, next run) without fetching or writing anything.
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = stockval_core::config::Settings::from_env()?;
    let _sentry_guard = init_sentry(&settings);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer())
        .init();

    let args = Args::parse();

    let symbols = if args.symbols.is_empty() {
        settings.watchlist.clone()
    } else {
        args.symbols.clone()
    };
    anyhow::ensure!(!symbols.is_empty(), "no symbols to refresh");

    let calendar = MarketCalendar::from_env();
    let run_time = parse_run_time(
        settings
            .schedule_time
            .as_deref()
            .unwrap_or(DEFAULT_RUN_TIME),
    )?;
    let symbol_delay = Duration::from_millis(settings.worker_symbol_delay_ms);

    let now = chrono::Utc::now();
    let as_of_date = calendar.resolve_as_of_date(args.as_of_date.as_deref(), now)?;

    if args.dry_run {
        let next_run = calendar.next_run_after(now, run_time)?;
        tracing::info!(
            %as_of_date,
            %next_run,
            once = args.once,
            stored_only = args.stored_only,
            dry_run = true,
            symbols = ?symbols,
            "worker plan (dry-run)"
        );
        return Ok(());
    }

    let db_url = settings.require_database_url()?;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(settings.database_max_connections)
        .connect(db_url)
        .await
        .context("connect DATABASE_URL failed")?;

    stockval_core::storage::migrate(&pool).await?;

    let service = ValuationService::new(
        Arc::new(PgStore::new(pool, settings.price_history_insert_batch)),
        Arc::new(YahooChartProvider::from_settings(&settings)?),
        ValuationParams::from_settings(&settings)?,
    )
    .with_calendar(calendar.clone());

    let job = scheduler::RefreshJob {
        service,
        symbols,
        symbol_delay,
        mode: if args.stored_only {
            RefreshMode::StoredOnly
        } else {
            RefreshMode::Fetch
        },
    };

    if args.once {
        let summary = job.run_pass(Some(as_of_date)).await;
        anyhow::ensure!(
            !summary.succeeded.is_empty(),
            "refresh pass failed for every symbol ({} failures)",
            summary.failed.len()
        );
        return Ok(());
    }

    if let Err(err) = scheduler::run_daily(&job, &calendar, run_time, shutdown_signal()).await {
        sentry_anyhow::capture_anyhow(&err);
        tracing::error!(error = %err, "scheduler stopped");
        return Err(err);
    }
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn init_sentry(settings: &stockval_core::config::Settings) -> Option<sentry::ClientInitGuard> {
    let dsn = settings.sentry_dsn.as_deref()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}
