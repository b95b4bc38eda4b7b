use crate::domain::history::PriceHistoryPoint;
use crate::domain::run::RunRecord;
use crate::domain::snapshot::StockSnapshot;
use crate::storage::PriceStore;
use anyhow::Result;
use chrono::NaiveDate;
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::{Mutex, RwLock};

/// Process-local store for running without a database and for tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    history: RwLock<HashMap<String, BTreeMap<NaiveDate, f64>>>,
    snapshots: RwLock<HashMap<String, StockSnapshot>>,
    runs: Mutex<Vec<RunRecord>>,
    locks: Mutex<HashSet<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn runs(&self) -> Vec<RunRecord> {
        self.runs.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl PriceStore for MemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn append_history(&self, symbol: &str, points: &[PriceHistoryPoint]) -> Result<u64> {
        let mut guard = self.history.write().await;
        let series = guard.entry(symbol.to_string()).or_default();

        let mut inserted: u64 = 0;
        for p in points {
            if let std::collections::btree_map::Entry::Vacant(e) = series.entry(p.date) {
                e.insert(p.price);
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn history(
        &self,
        symbol: &str,
        since: Option<NaiveDate>,
    ) -> Result<Vec<PriceHistoryPoint>> {
        let guard = self.history.read().await;
        let Some(series) = guard.get(symbol) else {
            return Ok(Vec::new());
        };

        let from = since.unwrap_or(NaiveDate::MIN);
        Ok(series
            .range(from..)
            .map(|(date, price)| PriceHistoryPoint::new(*date, *price))
            .collect())
    }

    async fn save_snapshot(&self, snapshot: &StockSnapshot) -> Result<()> {
        let mut guard = self.snapshots.write().await;
        let newer = guard
            .get(&snapshot.symbol)
            .map_or(true, |cur| cur.computed_at <= snapshot.computed_at);
        if newer {
            guard.insert(snapshot.symbol.clone(), snapshot.clone());
        }
        Ok(())
    }

    async fn latest_snapshot(&self, symbol: &str) -> Result<Option<StockSnapshot>> {
        Ok(self.snapshots.read().await.get(symbol).cloned())
    }

    async fn record_run(&self, run: &RunRecord) -> Result<()> {
        self.runs.lock().await.push(run.clone());
        Ok(())
    }

    async fn try_lock_symbol(&self, symbol: &str) -> Result<bool> {
        Ok(self.locks.lock().await.insert(symbol.to_string()))
    }

    async fn unlock_symbol(&self, symbol: &str) -> Result<()> {
        self.locks.lock().await.remove(symbol);
        Ok(())
    }
}
