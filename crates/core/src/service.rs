use crate::domain::history::PriceHistoryPoint;
use crate::domain::run::{RunRecord, RunTrigger};
use crate::domain::snapshot::StockSnapshot;
use crate::domain::symbol::normalize_symbol;
use crate::error::{service_error, ServiceError};
use crate::ingest::provider::PriceProvider;
use crate::storage::PriceStore;
use crate::time::us_market::MarketCalendar;
use crate::valuation::{compute_snapshot, ValuationParams};
use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Fetch, store and value prices for one symbol at a time.
#[derive(Clone)]
pub struct ValuationService {
    store: Arc<dyn PriceStore>,
    provider: Arc<dyn PriceProvider>,
    params: ValuationParams,
    calendar: MarketCalendar,
    clock: fn() -> DateTime<Utc>,
}

/// Whether a batch pass pulls fresh closes or only revalues what is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshMode {
    Fetch,
    StoredOnly,
}

#[derive(Debug, Default, Clone)]
pub struct RefreshSummary {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl ValuationService {
    pub fn new(
        store: Arc<dyn PriceStore>,
        provider: Arc<dyn PriceProvider>,
        params: ValuationParams,
    ) -> Self {
        Self {
            store,
            provider,
            params,
            calendar: MarketCalendar::default(),
            clock: Utc::now,
        }
    }

    /// Calendar used to decide which sessions have a final close.
    pub fn with_calendar(mut self, calendar: MarketCalendar) -> Self {
        self.calendar = calendar;
        self
    }

    pub fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &Arc<dyn PriceStore> {
        &self.store
    }

    /// Pulls the latest closes from the provider, then recomputes and persists the snapshot.
    ///
    /// The locked section runs on its own task: a caller that goes away (client disconnect,
    /// timeout) cannot leave the symbol locked.
    pub async fn refresh(
        &self,
        raw_symbol: &str,
        trigger: RunTrigger,
    ) -> anyhow::Result<StockSnapshot> {
        let symbol = normalize_symbol(raw_symbol)?;
        let svc = self.clone();
        tokio::spawn(async move { svc.refresh_owned(symbol, trigger).await })
            .await
            .context("refresh task failed")?
    }

    /// Recomputes from stored history only.
    pub async fn recompute(&self, raw_symbol: &str) -> anyhow::Result<StockSnapshot> {
        let symbol = normalize_symbol(raw_symbol)?;
        let svc = self.clone();
        tokio::spawn(async move {
            svc.acquire(&symbol).await?;
            let res = svc.value_and_save(&symbol).await;
            svc.release(&symbol).await;
            res
        })
        .await
        .context("recompute task failed")?
    }

    pub async fn stocks(&self, watchlist: &[String]) -> anyhow::Result<Vec<StockSnapshot>> {
        let mut symbols = Vec::with_capacity(watchlist.len());
        for raw in watchlist {
            match normalize_symbol(raw) {
                Ok(s) if !symbols.contains(&s) => symbols.push(s),
                Ok(_) => {}
                Err(err) => tracing::warn!(error = %err, "skipping watchlist entry"),
            }
        }
        self.store.latest_snapshots(&symbols).await
    }

    pub async fn history(
        &self,
        raw_symbol: &str,
        since: Option<NaiveDate>,
    ) -> anyhow::Result<Vec<PriceHistoryPoint>> {
        let symbol = normalize_symbol(raw_symbol)?;
        let points = self.store.history(&symbol, since).await?;
        if points.is_empty() && since.is_none() {
            return Err(ServiceError::NotFound { symbol }.into());
        }
        Ok(points)
    }

    /// Refreshes symbols one after another; a failure is logged and the pass continues.
    pub async fn refresh_all(
        &self,
        symbols: &[String],
        mode: RefreshMode,
        trigger: RunTrigger,
        delay: Duration,
    ) -> RefreshSummary {
        let mut summary = RefreshSummary::default();
        let total = symbols.len();

        for (idx, symbol) in symbols.iter().enumerate() {
            if idx != 0 && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let res = match mode {
                RefreshMode::Fetch => self.refresh(symbol, trigger).await,
                RefreshMode::StoredOnly => self.recompute(symbol).await,
            };
            match res {
                Ok(snapshot) => {
                    tracing::info!(
                        symbol = %snapshot.symbol,
                        signal = snapshot.signal.as_str(),
                        margin = snapshot.margin,
                        processed = idx + 1,
                        total,
                        "symbol refreshed"
                    );
                    summary.succeeded.push(snapshot.symbol);
                }
                Err(err) => {
                    tracing::warn!(%symbol, error = %format!("{err:#}"), "symbol refresh failed");
                    summary.failed.push((symbol.clone(), format!("{err:#}")));
                }
            }
        }

        summary
    }

    async fn refresh_owned(
        &self,
        symbol: String,
        trigger: RunTrigger,
    ) -> anyhow::Result<StockSnapshot> {
        self.acquire(&symbol).await?;

        let started_at = Utc::now();
        let mut inserted: u64 = 0;
        let res = self.refresh_locked(&symbol, &mut inserted).await;
        self.release(&symbol).await;

        self.record_run(&symbol, trigger, started_at, inserted, &res)
            .await;
        res
    }

    async fn refresh_locked(
        &self,
        symbol: &str,
        inserted: &mut u64,
    ) -> anyhow::Result<StockSnapshot> {
        let fetched = self
            .provider
            .fetch_daily_closes(symbol)
            .await
            .map_err(|err| match service_error(&err) {
                Some(_) => err,
                None => ServiceError::Upstream {
                    symbol: symbol.to_string(),
                    detail: format!("{err:#}"),
                }
                .into(),
            })?;

        // A bar for a session that has not closed yet carries an intraday price; storing it
        // would shadow the real close forever.
        let settled = self.calendar.resolve_as_of_date(None, (self.clock)())?;
        let fetched_count = fetched.len();
        let points: Vec<_> = fetched.into_iter().filter(|p| p.date <= settled).collect();

        *inserted = self
            .store
            .append_history(symbol, &points)
            .await
            .with_context(|| format!("append history failed for {symbol}"))?;

        tracing::debug!(
            %symbol,
            provider = self.provider.provider_name(),
            fetched = fetched_count,
            unsettled = fetched_count - points.len(),
            %settled,
            inserted = *inserted,
            "price history appended"
        );

        self.value_and_save(symbol).await
    }

    async fn value_and_save(&self, symbol: &str) -> anyhow::Result<StockSnapshot> {
        let history = self.store.history(symbol, None).await?;
        if history.is_empty() {
            return Err(ServiceError::NotFound {
                symbol: symbol.to_string(),
            }
            .into());
        }

        let snapshot = compute_snapshot(symbol, &history, &self.params, Utc::now())?;
        self.store
            .save_snapshot(&snapshot)
            .await
            .with_context(|| format!("save snapshot failed for {symbol}"))?;
        Ok(snapshot)
    }

    async fn acquire(&self, symbol: &str) -> anyhow::Result<()> {
        if !self.store.try_lock_symbol(symbol).await? {
            return Err(ServiceError::Busy {
                symbol: symbol.to_string(),
            }
            .into());
        }
        Ok(())
    }

    async fn release(&self, symbol: &str) {
        if let Err(err) = self.store.unlock_symbol(symbol).await {
            tracing::warn!(%symbol, error = %err, "failed to release symbol lock");
        }
    }

    async fn record_run(
        &self,
        symbol: &str,
        trigger: RunTrigger,
        started_at: chrono::DateTime<Utc>,
        points_inserted: u64,
        res: &anyhow::Result<StockSnapshot>,
    ) {
        let run = RunRecord {
            id: uuid::Uuid::new_v4(),
            symbol: symbol.to_string(),
            trigger,
            status: if res.is_ok() { "success" } else { "error" }.to_string(),
            error: res.as_ref().err().map(|e| format!("{e:#}")),
            points_inserted,
            started_at,
            finished_at: Utc::now(),
        };

        // Best-effort: a failed audit write never changes the refresh outcome.
        if let Err(err) = self.store.record_run(&run).await {
            tracing::warn!(%symbol, error = %err, "failed to record valuation run");
        }
    }
}
