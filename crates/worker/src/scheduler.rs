use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use std::future::Future;
use std::time::Duration;
use stockval_core::domain::run::RunTrigger;
use stockval_core::domain::snapshot::StockSnapshot;
use stockval_core::service::{RefreshMode, RefreshSummary, ValuationService};
use stockval_core::time::us_market::MarketCalendar;

pub struct RefreshJob {
    pub service: ValuationService,
    pub symbols: Vec<String>,
    pub symbol_delay: Duration,
    pub mode: RefreshMode,
}

impl RefreshJob {
    /// Refreshes every symbol once. `expected_session` is the latest session whose close should
    /// already be in the data; older snapshots are reported as stale.
    pub async fn run_pass(&self, expected_session: Option<NaiveDate>) -> RefreshSummary {
        let t0 = std::time::Instant::now();
        let summary = self
            .service
            .refresh_all(
                &self.symbols,
                self.mode,
                RunTrigger::Scheduled,
                self.symbol_delay,
            )
            .await;

        if let Some(expected) = expected_session {
            match self
                .service
                .store()
                .latest_snapshots(&summary.succeeded)
                .await
            {
                Ok(snapshots) => {
                    let stale = stale_symbols(&snapshots, expected);
                    if !stale.is_empty() {
                        tracing::warn!(
                            %expected,
                            stale = ?stale,
                            "provider data lags behind the latest session"
                        );
                    }
                }
                Err(err) => tracing::warn!(error = %err, "staleness check failed"),
            }
        }

        if summary.failed.is_empty() {
            tracing::info!(
                succeeded = summary.succeeded.len(),
                elapsed_ms = t0.elapsed().as_millis(),
                "refresh pass complete"
            );
        } else {
            tracing::error!(
                succeeded = summary.succeeded.len(),
                failed = summary.failed.len(),
                failures = ?summary.failed,
                elapsed_ms = t0.elapsed().as_millis(),
                "refresh pass finished with failures"
            );
        }

        summary
    }
}

/// Sleeps until each scheduled run, refreshes, repeats. Returns when `shutdown` resolves.
pub async fn run_daily(
    job: &RefreshJob,
    calendar: &MarketCalendar,
    run_time: NaiveTime,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    tokio::pin!(shutdown);

    loop {
        let now = Utc::now();
        let next_run = calendar.next_run_after(now, run_time)?;
        let wait = until(next_run, now);
        tracing::info!(%next_run, wait_secs = wait.as_secs(), "next refresh scheduled");

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = &mut shutdown => {
                tracing::info!("shutdown requested; stopping scheduler");
                return Ok(());
            }
        }

        let expected = match calendar.resolve_as_of_date(None, Utc::now()) {
            Ok(d) => Some(d),
            Err(err) => {
                tracing::warn!(error = %err, "could not resolve expected session");
                None
            }
        };
        job.run_pass(expected).await;
    }
}

fn until(next: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (next - now).to_std().unwrap_or(Duration::ZERO)
}

fn stale_symbols(snapshots: &[StockSnapshot], expected: NaiveDate) -> Vec<String> {
    snapshots
        .iter()
        .filter(|s| s.as_of_date < expected)
        .map(|s| s.symbol.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use stockval_core::domain::snapshot::{Signal, WeightDistribution};

    fn snapshot(symbol: &str, as_of_day: u32) -> StockSnapshot {
        StockSnapshot {
            symbol: symbol.to_string(),
            current_price: 10.0,
            value_coefficient: 1.0,
            weighted_avg: 10.0,
            margin: 0.0,
            signal: Signal::Bad,
            weight_distribution: WeightDistribution {
                last_week: 50.0,
                last_month: 30.0,
                last_6months: 20.0,
            },
            as_of_date: NaiveDate::from_ymd_opt(2026, 1, as_of_day).unwrap(),
            computed_at: Utc.with_ymd_and_hms(2026, 1, 6, 14, 30, 0).unwrap(),
        }
    }

    #[test]
    fn flags_snapshots_older_than_expected_session() {
        let expected = NaiveDate::from_ymd_opt(2026, 1, 5).unwrap();
        let stale = stale_symbols(
            &[snapshot("AAPL", 5), snapshot("MSFT", 2), snapshot("NVDA", 6)],
            expected,
        );
        assert_eq!(stale, vec!["MSFT".to_string()]);
    }

    #[tokio::test]
    async fn run_daily_stops_on_shutdown() {
        use std::sync::Arc;
        use stockval_core::config::Settings;
        use stockval_core::ingest::provider::YahooChartProvider;
        use stockval_core::storage::MemoryStore;
        use stockval_core::valuation::ValuationParams;

        let settings = Settings {
            database_url: None,
            sentry_dsn: None,
            port: 8000,
            database_max_connections: 5,
            watchlist: vec!["AAPL".to_string()],
            valuation_weights: None,
            signal_threshold_pct: None,
            price_provider_base_url: "http://127.0.0.1:9".to_string(),
            price_history_range: "1y".to_string(),
            price_provider_timeout_secs: 1,
            price_provider_retries: 1,
            price_history_insert_batch: 500,
            worker_symbol_delay_ms: 0,
            schedule_time: None,
            cors_origins: Vec::new(),
        };
        let job = RefreshJob {
            service: ValuationService::new(
                Arc::new(MemoryStore::new()),
                Arc::new(YahooChartProvider::from_settings(&settings).unwrap()),
                ValuationParams::default(),
            ),
            symbols: settings.watchlist.clone(),
            symbol_delay: Duration::ZERO,
            mode: RefreshMode::Fetch,
        };

        let calendar = MarketCalendar::default();
        let run_time = NaiveTime::from_hms_opt(9, 30, 0).unwrap();
        run_daily(&job, &calendar, run_time, async {})
            .await
            .unwrap();
    }

    #[test]
    fn wait_never_negative() {
        let now = Utc.with_ymd_and_hms(2026, 1, 5, 14, 0, 0).unwrap();
        let next = Utc.with_ymd_and_hms(2026, 1, 5, 14, 30, 0).unwrap();
        assert_eq!(until(next, now), Duration::from_secs(1800));
        assert_eq!(until(now, next), Duration::ZERO);
    }
}
