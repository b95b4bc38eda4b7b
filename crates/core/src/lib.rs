pub mod domain;
pub mod error;
pub mod ingest;
pub mod service;
pub mod storage;
pub mod time;
pub mod valuation;

pub mod config {
    use anyhow::Context;

    const DEFAULT_WATCHLIST: &str = "AAPL,MSFT,GOOGL,AMZN,NVDA";
    const DEFAULT_PROVIDER_BASE_URL: &str = "https://query1.finance.yahoo.com";
    const DEFAULT_HISTORY_RANGE: &str = "5y";
    const DEFAULT_PORT: u16 = 8000;
    const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;
    const DEFAULT_PROVIDER_TIMEOUT_SECS: u64 = 30;
    const DEFAULT_PROVIDER_RETRIES: u32 = 3;
    const DEFAULT_INSERT_BATCH: usize = 500;
    const DEFAULT_SYMBOL_DELAY_MS: u64 = 250;

    #[derive(Debug, Clone)]
    pub struct Settings {
        pub database_url: Option<String>,
        pub sentry_dsn: Option<String>,
        pub port: u16,
        pub database_max_connections: u32,
        pub watchlist: Vec<String>,
        pub valuation_weights: Option<String>,
        pub signal_threshold_pct: Option<String>,
        pub price_provider_base_url: String,
        pub price_history_range: String,
        pub price_provider_timeout_secs: u64,
        pub price_provider_retries: u32,
        pub price_history_insert_batch: usize,
        pub worker_symbol_delay_ms: u64,
        pub schedule_time: Option<String>,
        pub cors_origins: Vec<String>,
    }

    impl Settings {
        pub fn from_env() -> anyhow::Result<Self> {
            let database_max_connections =
                parsed_var("DATABASE_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS)?;
            anyhow::ensure!(
                database_max_connections >= 2,
                "DATABASE_MAX_CONNECTIONS must be at least 2 (got {database_max_connections})"
            );

            let price_history_insert_batch =
                parsed_var("PRICE_HISTORY_INSERT_BATCH", DEFAULT_INSERT_BATCH)?;
            anyhow::ensure!(
                price_history_insert_batch >= 1,
                "PRICE_HISTORY_INSERT_BATCH must be at least 1"
            );

            Ok(Self {
                database_url: non_empty_var("DATABASE_URL"),
                sentry_dsn: non_empty_var("SENTRY_DSN"),
                port: parsed_var("PORT", DEFAULT_PORT)?,
                database_max_connections,
                watchlist: split_list(
                    &non_empty_var("WATCHLIST").unwrap_or_else(|| DEFAULT_WATCHLIST.to_string()),
                ),
                valuation_weights: non_empty_var("VALUATION_WEIGHTS"),
                signal_threshold_pct: non_empty_var("SIGNAL_THRESHOLD_PCT"),
                price_provider_base_url: non_empty_var("PRICE_PROVIDER_BASE_URL")
                    .unwrap_or_else(|| DEFAULT_PROVIDER_BASE_URL.to_string()),
                price_history_range: non_empty_var("PRICE_HISTORY_RANGE")
                    .unwrap_or_else(|| DEFAULT_HISTORY_RANGE.to_string()),
                price_provider_timeout_secs: parsed_var(
                    "PRICE_PROVIDER_TIMEOUT_SECS",
                    DEFAULT_PROVIDER_TIMEOUT_SECS,
                )?,
                price_provider_retries: parsed_var(
                    "PRICE_PROVIDER_RETRIES",
                    DEFAULT_PROVIDER_RETRIES,
                )?,
                price_history_insert_batch,
                worker_symbol_delay_ms: parsed_var(
                    "WORKER_SYMBOL_DELAY_MS",
                    DEFAULT_SYMBOL_DELAY_MS,
                )?,
                schedule_time: non_empty_var("SCHEDULE_TIME"),
                cors_origins: non_empty_var("CORS_ORIGINS")
                    .map(|s| split_list(&s))
                    .unwrap_or_else(|| {
                        vec![
                            "http://localhost:3000".to_string(),
                            "http://localhost:5173".to_string(),
                        ]
                    }),
            })
        }

        pub fn require_database_url(&self) -> anyhow::Result<&str> {
            self.database_url
                .as_deref()
                .context("DATABASE_URL is required")
        }
    }

    fn non_empty_var(key: &str) -> Option<String> {
        std::env::var(key)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn parsed_var<T>(key: &str, default: T) -> anyhow::Result<T>
    where
        T: std::str::FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        match non_empty_var(key) {
            Some(v) => v
                .parse::<T>()
                .with_context(|| format!("{key} must be a non-negative integer (got {v:?})")),
            None => Ok(default),
        }
    }

    fn split_list(s: &str) -> Vec<String> {
        s.split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect()
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn split_list_drops_blank_entries() {
            assert_eq!(
                split_list(" AAPL, ,msft,"),
                vec!["AAPL".to_string(), "msft".to_string()]
            );
        }

        #[test]
        fn numeric_vars_fail_loudly() {
            assert_eq!(parsed_var("STOCKVAL_TEST_UNSET_NUMBER", 7u32).unwrap(), 7);

            std::env::set_var("STOCKVAL_TEST_GOOD_NUMBER", " 12 ");
            assert_eq!(parsed_var("STOCKVAL_TEST_GOOD_NUMBER", 7u32).unwrap(), 12);

            std::env::set_var("STOCKVAL_TEST_BAD_NUMBER", "fast");
            let err = parsed_var("STOCKVAL_TEST_BAD_NUMBER", 7u64).unwrap_err();
            assert!(err.to_string().contains("STOCKVAL_TEST_BAD_NUMBER"));
        }
    }
}
