use crate::domain::history::PriceHistoryPoint;
use crate::domain::run::RunRecord;
use crate::domain::snapshot::StockSnapshot;
use anyhow::{Context, Result};
use chrono::NaiveDate;

pub mod lock;
pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

pub async fn migrate(pool: &sqlx::PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("sqlx migrations failed")?;
    Ok(())
}

/// Persistence for price history, computed snapshots and per-symbol recompute exclusion.
///
/// Symbols passed in are expected to be normalized already.
#[async_trait::async_trait]
pub trait PriceStore: Send + Sync {
    fn backend_name(&self) -> &'static str;

    /// Records new closes. Dates already on file for the symbol keep their original price.
    /// Returns the number of points actually inserted.
    async fn append_history(&self, symbol: &str, points: &[PriceHistoryPoint]) -> Result<u64>;

    /// Closes ascending by date, optionally only those on or after `since`.
    async fn history(
        &self,
        symbol: &str,
        since: Option<NaiveDate>,
    ) -> Result<Vec<PriceHistoryPoint>>;

    async fn save_snapshot(&self, snapshot: &StockSnapshot) -> Result<()>;

    async fn latest_snapshot(&self, symbol: &str) -> Result<Option<StockSnapshot>>;

    /// Latest snapshot per symbol in `symbols` order; symbols never valued are skipped.
    async fn latest_snapshots(&self, symbols: &[String]) -> Result<Vec<StockSnapshot>> {
        let mut out = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            if let Some(s) = self.latest_snapshot(symbol).await? {
                out.push(s);
            }
        }
        Ok(out)
    }

    async fn record_run(&self, run: &RunRecord) -> Result<()>;

    /// Non-blocking; `false` means another recompute of `symbol` holds the lock.
    async fn try_lock_symbol(&self, symbol: &str) -> Result<bool>;

    async fn unlock_symbol(&self, symbol: &str) -> Result<()>;
}
