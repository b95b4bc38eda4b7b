use crate::domain::history::PriceHistoryPoint;
use crate::domain::run::RunRecord;
use crate::domain::snapshot::{Signal, StockSnapshot, WeightDistribution};
use crate::storage::{lock, PriceStore};
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::pool::PoolConnection;
use sqlx::Postgres;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

type SnapshotRow = (
    String,
    NaiveDate,
    DateTime<Utc>,
    f64,
    f64,
    f64,
    f64,
    String,
    f64,
    f64,
    f64,
);

#[derive(Debug)]
struct HeldLock {
    conn: PoolConnection<Postgres>,
    _slot: OwnedSemaphorePermit,
}

#[derive(Debug)]
pub struct PgStore {
    pool: sqlx::PgPool,
    // Connections holding a session advisory lock, keyed by symbol. Never held across an await
    // on the pool.
    held_locks: tokio::sync::Mutex<HashMap<String, HeldLock>>,
    // Each lock pins a pooled connection; the slots keep one connection free for the queries the
    // lock holders still have to run.
    lock_slots: Arc<Semaphore>,
    upsert_batch: usize,
}

impl PgStore {
    pub fn new(pool: sqlx::PgPool, upsert_batch: usize) -> Self {
        let slots = lock_slots_for(pool.options().get_max_connections());
        Self {
            pool,
            held_locks: tokio::sync::Mutex::new(HashMap::new()),
            lock_slots: Arc::new(Semaphore::new(slots)),
            upsert_batch: upsert_batch.max(1),
        }
    }

    pub fn pool(&self) -> &sqlx::PgPool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl PriceStore for PgStore {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    async fn append_history(&self, symbol: &str, points: &[PriceHistoryPoint]) -> Result<u64> {
        if points.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await.context("begin transaction failed")?;
        let mut inserted: u64 = 0;

        for (batch_idx, chunk) in points.chunks(self.upsert_batch).enumerate() {
            let t0 = std::time::Instant::now();
            let mut qb = sqlx::QueryBuilder::new("INSERT INTO price_history (symbol, date, price) ");
            qb.push_values(chunk, |mut b, p| {
                b.push_bind(symbol).push_bind(p.date).push_bind(p.price);
            });
            // Recorded closes are immutable.
            qb.push(" ON CONFLICT (symbol, date) DO NOTHING");

            let res = qb
                .build()
                .persistent(false)
                .execute(&mut *tx)
                .await
                .context("batch insert price_history failed")?;
            inserted += res.rows_affected();

            tracing::debug!(
                %symbol,
                batch_idx,
                batch_size = chunk.len(),
                elapsed_ms = t0.elapsed().as_millis(),
                "price_history batch insert"
            );
        }

        tx.commit().await.context("commit transaction failed")?;
        Ok(inserted)
    }

    async fn history(
        &self,
        symbol: &str,
        since: Option<NaiveDate>,
    ) -> Result<Vec<PriceHistoryPoint>> {
        let rows = match since {
            Some(since) => {
                sqlx::query_as::<_, (NaiveDate, f64)>(
                    "SELECT date, price FROM price_history \
                     WHERE symbol = $1 AND date >= $2 \
                     ORDER BY date ASC",
                )
                .bind(symbol)
                .bind(since)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as::<_, (NaiveDate, f64)>(
                    "SELECT date, price FROM price_history \
                     WHERE symbol = $1 \
                     ORDER BY date ASC",
                )
                .bind(symbol)
                .fetch_all(&self.pool)
                .await
            }
        }
        .with_context(|| format!("select price_history failed for {symbol}"))?;

        Ok(rows
            .into_iter()
            .map(|(date, price)| PriceHistoryPoint { date, price })
            .collect())
    }

    async fn save_snapshot(&self, snapshot: &StockSnapshot) -> Result<()> {
        sqlx::query(
            "INSERT INTO stock_snapshots (id, symbol, as_of_date, computed_at, current_price, \
               value_coefficient, weighted_avg, margin, signal, \
               weight_last_week, weight_last_month, weight_last_6months) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(uuid::Uuid::new_v4())
        .bind(&snapshot.symbol)
        .bind(snapshot.as_of_date)
        .bind(snapshot.computed_at)
        .bind(snapshot.current_price)
        .bind(snapshot.value_coefficient)
        .bind(snapshot.weighted_avg)
        .bind(snapshot.margin)
        .bind(snapshot.signal.as_str())
        .bind(snapshot.weight_distribution.last_week)
        .bind(snapshot.weight_distribution.last_month)
        .bind(snapshot.weight_distribution.last_6months)
        .execute(&self.pool)
        .await
        .context("insert stock_snapshots failed")?;
        Ok(())
    }

    async fn latest_snapshot(&self, symbol: &str) -> Result<Option<StockSnapshot>> {
        let row = sqlx::query_as::<_, SnapshotRow>(
            "SELECT symbol, as_of_date, computed_at, current_price, value_coefficient, \
               weighted_avg, margin, signal, \
               weight_last_week, weight_last_month, weight_last_6months \
             FROM stock_snapshots \
             WHERE symbol = $1 \
             ORDER BY computed_at DESC \
             LIMIT 1",
        )
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("select stock_snapshots failed for {symbol}"))?;

        row.map(snapshot_from_row).transpose()
    }

    async fn latest_snapshots(&self, symbols: &[String]) -> Result<Vec<StockSnapshot>> {
        if symbols.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query_as::<_, SnapshotRow>(
            "SELECT DISTINCT ON (symbol) symbol, as_of_date, computed_at, current_price, \
               value_coefficient, weighted_avg, margin, signal, \
               weight_last_week, weight_last_month, weight_last_6months \
             FROM stock_snapshots \
             WHERE symbol = ANY($1) \
             ORDER BY symbol, computed_at DESC",
        )
        .bind(symbols)
        .fetch_all(&self.pool)
        .await
        .context("select latest stock_snapshots failed")?;

        let mut by_symbol = HashMap::with_capacity(rows.len());
        for row in rows {
            let snapshot = snapshot_from_row(row)?;
            by_symbol.insert(snapshot.symbol.clone(), snapshot);
        }

        Ok(symbols
            .iter()
            .filter_map(|s| by_symbol.remove(s))
            .collect())
    }

    async fn record_run(&self, run: &RunRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO valuation_runs (id, symbol, trigger, status, error, points_inserted, started_at, finished_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .persistent(false)
        .bind(run.id)
        .bind(&run.symbol)
        .bind(run.trigger.as_str())
        .bind(&run.status)
        .bind(&run.error)
        .bind(i64::try_from(run.points_inserted).unwrap_or(i64::MAX))
        .bind(run.started_at)
        .bind(run.finished_at)
        .execute(&self.pool)
        .await
        .context("insert valuation_runs failed")?;
        Ok(())
    }

    async fn try_lock_symbol(&self, symbol: &str) -> Result<bool> {
        if self.held_locks.lock().await.contains_key(symbol) {
            return Ok(false);
        }

        let slot = self
            .lock_slots
            .clone()
            .acquire_owned()
            .await
            .context("symbol lock slots closed")?;

        // Two local callers racing here get separate sessions, so Postgres admits only one.
        let Some(conn) = lock::try_acquire_symbol_lock(&self.pool, symbol).await? else {
            return Ok(false);
        };

        self.held_locks
            .lock()
            .await
            .insert(symbol.to_string(), HeldLock { conn, _slot: slot });
        Ok(true)
    }

    async fn unlock_symbol(&self, symbol: &str) -> Result<()> {
        let held = self.held_locks.lock().await.remove(symbol);
        match held {
            Some(held) => lock::release_symbol_lock(held.conn, symbol).await,
            None => Ok(()),
        }
    }
}

fn lock_slots_for(max_connections: u32) -> usize {
    usize::try_from(max_connections.saturating_sub(1))
        .unwrap_or(usize::MAX)
        .max(1)
}

fn snapshot_from_row(row: SnapshotRow) -> Result<StockSnapshot> {
    let (
        symbol,
        as_of_date,
        computed_at,
        current_price,
        value_coefficient,
        weighted_avg,
        margin,
        signal,
        last_week,
        last_month,
        last_6months,
    ) = row;

    let signal = Signal::parse(&signal)
        .with_context(|| format!("invalid signal {signal:?} in DB for symbol={symbol}"))?;

    Ok(StockSnapshot {
        symbol,
        current_price,
        value_coefficient,
        weighted_avg,
        margin,
        signal,
        weight_distribution: WeightDistribution {
            last_week,
            last_month,
            last_6months,
        },
        as_of_date,
        computed_at,
    })
}
