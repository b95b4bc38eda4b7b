use crate::config::Settings;
use crate::domain::history::PriceHistoryPoint;
use crate::error::ServiceError;
use crate::ingest::types::ChartResponse;
use anyhow::{Context, Result};
use chrono::{NaiveDate, TimeZone, Utc};
use chrono_tz::America::New_York;
use reqwest::StatusCode;
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

const BASE_BACKOFF: Duration = Duration::from_secs(1);
const USER_AGENT: &str = "Mozilla/5.0 (compatible; stockval/0.1)";

#[async_trait::async_trait]
pub trait PriceProvider: Send + Sync {
    fn provider_name(&self) -> &'static str;

    /// Daily closes for `symbol`, ascending by date with at most one point per date.
    async fn fetch_daily_closes(&self, symbol: &str) -> Result<Vec<PriceHistoryPoint>>;
}

#[derive(Debug, Clone)]
pub struct YahooChartProvider {
    http: reqwest::Client,
    base_url: String,
    range: String,
    retries: u32,
    base_backoff: Duration,
}

impl YahooChartProvider {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.price_provider_timeout_secs))
            .user_agent(USER_AGENT)
            .build()
            .context("failed to build price provider http client")?;

        Ok(Self {
            http,
            base_url: settings.price_provider_base_url.clone(),
            range: settings.price_history_range.clone(),
            retries: settings.price_provider_retries,
            base_backoff: BASE_BACKOFF,
        })
    }

    fn url(&self, symbol: &str) -> String {
        format!(
            "{}/v8/finance/chart/{}",
            self.base_url.trim_end_matches('/'),
            symbol
        )
    }

    async fn fetch_once(&self, symbol: &str) -> Result<Attempt> {
        let res = match self
            .http
            .get(self.url(symbol))
            .query(&[("range", self.range.as_str()), ("interval", "1d")])
            .send()
            .await
        {
            Ok(r) => r,
            Err(err) => {
                return Ok(Attempt::Retryable(
                    anyhow::Error::new(err).context("price provider request failed"),
                ))
            }
        };

        let status = res.status();
        let text = res
            .text()
            .await
            .context("failed to read price provider response")?;

        if let Some(failed) = status_attempt(symbol, status, &text) {
            return Ok(failed);
        }

        let parsed = match serde_json::from_str::<ChartResponse>(&text) {
            Ok(v) => v,
            Err(err) => {
                return Ok(Attempt::Retryable(
                    anyhow::Error::new(err).context("failed to parse price provider chart response"),
                ))
            }
        };

        Ok(Attempt::Done(parse_chart(symbol, parsed)))
    }
}

enum Attempt {
    Done(Result<Vec<PriceHistoryPoint>>),
    Retryable(anyhow::Error),
}

/// Outcome of a non-success HTTP status; `None` lets the body be parsed.
fn status_attempt(symbol: &str, status: StatusCode, body: &str) -> Option<Attempt> {
    if status.is_success() {
        return None;
    }
    if status == StatusCode::NOT_FOUND {
        return Some(Attempt::Done(Err(ServiceError::NotFound {
            symbol: symbol.to_string(),
        }
        .into())));
    }

    let err = anyhow::anyhow!("price provider HTTP {status}: {}", truncate(body, 300));
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Some(Attempt::Retryable(err))
    } else {
        Some(Attempt::Done(Err(err)))
    }
}

/// Runs `fetch` until it settles, at most `max_attempts` times (at least once), doubling the
/// pause after each retryable failure.
async fn retry_fetch<F, Fut>(
    symbol: &str,
    max_attempts: u32,
    base_backoff: Duration,
    mut fetch: F,
) -> Result<Vec<PriceHistoryPoint>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Attempt>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match fetch().await? {
            Attempt::Done(res) => return res,
            Attempt::Retryable(err) => {
                if attempt >= max_attempts {
                    return Err(err);
                }
                let backoff = base_backoff * (1u32 << (attempt - 1).min(16));
                tracing::warn!(
                    attempt,
                    ?backoff,
                    %symbol,
                    error = %err,
                    "price provider fetch failed; retrying"
                );
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

#[async_trait::async_trait]
impl PriceProvider for YahooChartProvider {
    fn provider_name(&self) -> &'static str {
        "yahoo_chart"
    }

    async fn fetch_daily_closes(&self, symbol: &str) -> Result<Vec<PriceHistoryPoint>> {
        retry_fetch(symbol, self.retries, self.base_backoff, || {
            self.fetch_once(symbol)
        })
        .await
    }
}

/// Turns a chart payload into New York trading-date closes. Null and non-positive closes are
/// dropped; a date seen twice keeps its last close.
pub fn parse_chart(symbol: &str, resp: ChartResponse) -> Result<Vec<PriceHistoryPoint>> {
    if let Some(err) = resp.chart.error {
        if err.code.eq_ignore_ascii_case("Not Found") {
            return Err(ServiceError::NotFound {
                symbol: symbol.to_string(),
            }
            .into());
        }
        anyhow::bail!("price provider error {}: {}", err.code, err.description);
    }

    let Some(result) = resp.chart.result.and_then(|r| r.into_iter().next()) else {
        return Err(ServiceError::NotFound {
            symbol: symbol.to_string(),
        }
        .into());
    };

    let closes = result
        .indicators
        .quote
        .into_iter()
        .next()
        .map(|q| q.close)
        .unwrap_or_default();

    let mut by_date = BTreeMap::<NaiveDate, f64>::new();
    for (ts, close) in result.timestamp.iter().zip(closes) {
        let Some(price) = close.filter(|p| p.is_finite() && *p > 0.0) else {
            continue;
        };
        let Some(dt) = Utc.timestamp_opt(*ts, 0).single() else {
            continue;
        };
        by_date.insert(dt.with_timezone(&New_York).date_naive(), price);
    }

    if by_date.is_empty() {
        return Err(ServiceError::NotFound {
            symbol: symbol.to_string(),
        }
        .into());
    }

    Ok(by_date
        .into_iter()
        .map(|(date, price)| PriceHistoryPoint::new(date, price))
        .collect())
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::service_error;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn chart(timestamps: Vec<i64>, closes: Vec<Option<f64>>) -> ChartResponse {
        serde_json::from_value(json!({
            "chart": {
                "result": [{
                    "meta": {"symbol": "AAPL", "currency": "USD"},
                    "timestamp": timestamps,
                    "indicators": {
                        "quote": [{"close": closes, "open": [], "volume": []}],
                        "adjclose": [{"adjclose": []}]
                    }
                }],
                "error": null
            }
        }))
        .unwrap()
    }

    #[test]
    fn converts_timestamps_to_new_york_dates() {
        // 2026-01-05 14:30 UTC and 2026-01-06 14:30 UTC (09:30 EST open stamps).
        let resp = chart(
            vec![1_767_623_400, 1_767_709_800],
            vec![Some(101.5), Some(102.25)],
        );
        let points = parse_chart("AAPL", resp).unwrap();
        assert_eq!(
            points,
            vec![
                PriceHistoryPoint::new(NaiveDate::from_ymd_opt(2026, 1, 5).unwrap(), 101.5),
                PriceHistoryPoint::new(NaiveDate::from_ymd_opt(2026, 1, 6).unwrap(), 102.25),
            ]
        );
    }

    #[test]
    fn drops_null_closes_and_dedups_dates() {
        // Two stamps on 2026-01-05 (open and intraday), one null close on 2026-01-06.
        let resp = chart(
            vec![1_767_623_400, 1_767_640_000, 1_767_709_800],
            vec![Some(100.0), Some(100.5), None],
        );
        let points = parse_chart("AAPL", resp).unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].price, 100.5);
    }

    #[test]
    fn missing_result_is_not_found() {
        let resp: ChartResponse = serde_json::from_value(json!({
            "chart": {
                "result": null,
                "error": {"code": "Not Found", "description": "No data found, symbol may be delisted"}
            }
        }))
        .unwrap();
        let err = parse_chart("ZZZZ", resp).unwrap_err();
        assert!(matches!(
            service_error(&err),
            Some(ServiceError::NotFound { .. })
        ));
    }

    #[test]
    fn all_null_closes_is_not_found() {
        let resp = chart(vec![1_767_623_400], vec![None]);
        assert!(parse_chart("AAPL", resp).is_err());
    }

    fn is_retryable(a: Option<Attempt>) -> bool {
        matches!(a, Some(Attempt::Retryable(_)))
    }

    #[test]
    fn status_decides_retry() {
        assert!(status_attempt("AAPL", StatusCode::OK, "").is_none());
        assert!(is_retryable(status_attempt("AAPL", StatusCode::TOO_MANY_REQUESTS, "slow down")));
        assert!(is_retryable(status_attempt("AAPL", StatusCode::SERVICE_UNAVAILABLE, "")));
        assert!(is_retryable(status_attempt("AAPL", StatusCode::BAD_GATEWAY, "")));

        match status_attempt("AAPL", StatusCode::BAD_REQUEST, "Invalid range") {
            Some(Attempt::Done(Err(err))) => {
                assert!(service_error(&err).is_none());
                assert!(err.to_string().contains("400"));
            }
            _ => panic!("400 must fail without retry"),
        }

        match status_attempt("ZZZZ", StatusCode::NOT_FOUND, "") {
            Some(Attempt::Done(Err(err))) => assert!(matches!(
                service_error(&err),
                Some(ServiceError::NotFound { .. })
            )),
            _ => panic!("404 must map to not found"),
        }
    }

    #[tokio::test]
    async fn retries_stop_at_attempt_cap() {
        let calls = AtomicU32::new(0);
        let res = retry_fetch("AAPL", 3, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { anyhow::Ok(Attempt::Retryable(anyhow::anyhow!("HTTP 503"))) }
        })
        .await;
        assert!(res.unwrap_err().to_string().contains("503"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // Zero retries still makes one attempt.
        let calls = AtomicU32::new(0);
        let res = retry_fetch("AAPL", 0, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { anyhow::Ok(Attempt::Retryable(anyhow::anyhow!("connection reset"))) }
        })
        .await;
        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_recovers_and_final_failures_are_not_retried() {
        let calls = AtomicU32::new(0);
        let points = retry_fetch("AAPL", 3, Duration::from_millis(1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    anyhow::Ok(Attempt::Retryable(anyhow::anyhow!("HTTP 429")))
                } else {
                    Ok(Attempt::Done(Ok(vec![PriceHistoryPoint::new(
                        NaiveDate::from_ymd_opt(2026, 1, 5).unwrap(),
                        100.0,
                    )])))
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let calls = AtomicU32::new(0);
        let res = retry_fetch("AAPL", 5, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { anyhow::Ok(Attempt::Done(Err(anyhow::anyhow!("HTTP 400")))) }
        })
        .await;
        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn other_chart_errors_are_plain_failures() {
        let resp: ChartResponse = serde_json::from_value(json!({
            "chart": {"result": null, "error": {"code": "Bad Request", "description": "Invalid range"}}
        }))
        .unwrap();
        let err = parse_chart("AAPL", resp).unwrap_err();
        assert!(service_error(&err).is_none());
    }
}
