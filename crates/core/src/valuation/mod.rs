//! Weighted fair-value engine.
//!
//! The fair value of a symbol is a weighted blend of its mean close over three nested windows
//! anchored at the latest recorded close: the last week, the last month and the last six months.

use crate::config::Settings;
use crate::domain::history::PriceHistoryPoint;
use crate::domain::snapshot::{Signal, StockSnapshot, WeightDistribution};
use crate::error::ServiceError;
use anyhow::{ensure, Context};
use chrono::{DateTime, Duration, Utc};

/// Calendar-day lookback of each window, in week / month / six-month order.
pub const WINDOW_DAYS: [i64; 3] = [7, 30, 182];

const DEFAULT_WEIGHTS: [f64; 3] = [50.0, 30.0, 20.0];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValuationParams {
    weights: [f64; 3],
    signal_threshold_pct: f64,
}

impl Default for ValuationParams {
    fn default() -> Self {
        Self {
            weights: DEFAULT_WEIGHTS,
            signal_threshold_pct: 0.0,
        }
    }
}

impl ValuationParams {
    pub fn new(weights: [f64; 3], signal_threshold_pct: f64) -> anyhow::Result<Self> {
        for w in weights {
            ensure!(
                w.is_finite() && w >= 0.0,
                "valuation weights must be finite and >= 0 (got {w})"
            );
        }
        ensure!(
            weights.iter().sum::<f64>() > 0.0,
            "valuation weights must not all be zero"
        );
        ensure!(
            signal_threshold_pct.is_finite(),
            "signal threshold must be finite (got {signal_threshold_pct})"
        );

        Ok(Self {
            weights,
            signal_threshold_pct,
        })
    }

    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let weights = match settings.valuation_weights.as_deref() {
            Some(s) => parse_weights(s)?,
            None => DEFAULT_WEIGHTS,
        };

        let threshold = match settings.signal_threshold_pct.as_deref() {
            Some(s) => s
                .trim()
                .parse::<f64>()
                .with_context(|| format!("SIGNAL_THRESHOLD_PCT must be a number (got {s:?})"))?,
            None => 0.0,
        };

        Self::new(weights, threshold)
    }

    pub fn weights(&self) -> [f64; 3] {
        self.weights
    }

    pub fn signal_threshold_pct(&self) -> f64 {
        self.signal_threshold_pct
    }
}

fn parse_weights(s: &str) -> anyhow::Result<[f64; 3]> {
    let parts: Vec<&str> = s.split(',').map(str::trim).collect();
    ensure!(
        parts.len() == 3,
        "VALUATION_WEIGHTS must have exactly 3 comma-separated values (got {s:?})"
    );

    let mut out = [0.0; 3];
    for (slot, part) in out.iter_mut().zip(parts) {
        *slot = part
            .parse::<f64>()
            .with_context(|| format!("VALUATION_WEIGHTS entry is not a number: {part:?}"))?;
    }
    Ok(out)
}

/// Values `symbol` from its full price history.
///
/// `history` must be non-empty, strictly ascending by date, and carry positive finite prices.
pub fn compute_snapshot(
    symbol: &str,
    history: &[PriceHistoryPoint],
    params: &ValuationParams,
    computed_at: DateTime<Utc>,
) -> Result<StockSnapshot, ServiceError> {
    validate_history(symbol, history)?;

    let Some(latest) = history.last() else {
        return Err(insufficient(symbol, "price history is empty"));
    };
    let as_of_date = latest.date;
    let current_price = latest.price;

    let mut weighted_sum = 0.0;
    let mut weight_total = 0.0;
    let mut effective = [0.0; 3];
    for (i, days) in WINDOW_DAYS.iter().enumerate() {
        let cutoff = as_of_date - Duration::days(*days);
        let (sum, count) = history
            .iter()
            .rev()
            .take_while(|p| p.date > cutoff)
            .fold((0.0, 0usize), |(sum, count), p| (sum + p.price, count + 1));

        // The latest close is inside every window, so count is never zero here.
        if count == 0 {
            continue;
        }

        let mean = sum / count as f64;
        effective[i] = params.weights[i];
        weighted_sum += params.weights[i] * mean;
        weight_total += params.weights[i];
    }

    if weight_total <= 0.0 {
        return Err(insufficient(symbol, "no window carries a positive weight"));
    }

    let weighted_avg = round_to(weighted_sum / weight_total, 2);
    let margin = round_to((weighted_avg - current_price) / current_price * 100.0, 2);
    let signal = if margin > params.signal_threshold_pct {
        Signal::Good
    } else {
        Signal::Bad
    };

    Ok(StockSnapshot {
        symbol: symbol.to_string(),
        current_price,
        value_coefficient: round_to(weighted_avg / current_price, 4),
        weighted_avg,
        margin,
        signal,
        weight_distribution: WeightDistribution {
            last_week: round_to(effective[0] / weight_total * 100.0, 1),
            last_month: round_to(effective[1] / weight_total * 100.0, 1),
            last_6months: round_to(effective[2] / weight_total * 100.0, 1),
        },
        as_of_date,
        computed_at,
    })
}

fn validate_history(symbol: &str, history: &[PriceHistoryPoint]) -> Result<(), ServiceError> {
    if history.is_empty() {
        return Err(insufficient(symbol, "price history is empty"));
    }

    for p in history {
        if !(p.price.is_finite() && p.price > 0.0) {
            return Err(insufficient(
                symbol,
                &format!("non-positive price {} on {}", p.price, p.date),
            ));
        }
    }

    for pair in history.windows(2) {
        if pair[0].date >= pair[1].date {
            return Err(insufficient(
                symbol,
                &format!(
                    "history not strictly ascending at {} -> {}",
                    pair[0].date, pair[1].date
                ),
            ));
        }
    }

    Ok(())
}

fn insufficient(symbol: &str, detail: &str) -> ServiceError {
    ServiceError::InsufficientHistory {
        symbol: symbol.to_string(),
        detail: detail.to_string(),
    }
}

fn round_to(v: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (v * scale).round() / scale
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};

    fn at(days_before: i64, price: f64) -> PriceHistoryPoint {
        let as_of = NaiveDate::from_ymd_opt(2026, 3, 31).unwrap();
        PriceHistoryPoint::new(as_of - Duration::days(days_before), price)
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 31, 14, 30, 0).unwrap()
    }

    fn daily_series(len: i64, price_at: impl Fn(i64) -> f64) -> Vec<PriceHistoryPoint> {
        (0..len).rev().map(|d| at(d, price_at(d))).collect()
    }

    #[test]
    fn blends_nested_windows_anchored_at_latest_close() {
        let history = vec![at(100, 100.0), at(20, 200.0), at(3, 300.0), at(0, 400.0)];
        let s = compute_snapshot("AAPL", &history, &ValuationParams::default(), now()).unwrap();

        // week mean 350, month mean 300, six-month mean 250.
        assert_eq!(s.weighted_avg, 315.0);
        assert_eq!(s.current_price, 400.0);
        assert_eq!(s.margin, -21.25);
        assert_eq!(s.value_coefficient, 0.7875);
        assert_eq!(s.signal, Signal::Bad);
        assert_eq!(s.as_of_date, NaiveDate::from_ymd_opt(2026, 3, 31).unwrap());
    }

    #[test]
    fn window_boundary_is_exclusive() {
        // Exactly 7 days back falls outside the week window but inside the month window.
        let history = vec![at(7, 10.0), at(0, 20.0)];
        let params = ValuationParams::new([1.0, 0.0, 0.0], 0.0).unwrap();
        let s = compute_snapshot("X", &history, &params, now()).unwrap();
        assert_eq!(s.weighted_avg, 20.0);

        let params = ValuationParams::new([0.0, 1.0, 0.0], 0.0).unwrap();
        let s = compute_snapshot("X", &history, &params, now()).unwrap();
        assert_eq!(s.weighted_avg, 15.0);
    }

    #[test]
    fn falling_price_reads_as_undervalued() {
        let history = daily_series(200, |d| 100.0 + d as f64);
        let s = compute_snapshot("MSFT", &history, &ValuationParams::default(), now()).unwrap();
        assert!(s.weighted_avg > s.current_price);
        assert!(s.margin > 0.0);
        assert!(s.value_coefficient > 1.0);
        assert_eq!(s.signal, Signal::Good);
    }

    #[test]
    fn flat_price_is_not_a_buy() {
        let history = daily_series(60, |_| 42.0);
        let s = compute_snapshot("FLAT", &history, &ValuationParams::default(), now()).unwrap();
        assert_eq!(s.margin, 0.0);
        assert_eq!(s.value_coefficient, 1.0);
        assert_eq!(s.signal, Signal::Bad);
    }

    #[test]
    fn margin_matches_reported_average_and_price() {
        let history = daily_series(250, |d| 50.0 + ((d * 37) % 23) as f64 * 1.37);
        let s = compute_snapshot("NOISY", &history, &ValuationParams::default(), now()).unwrap();

        let expected = round_to((s.weighted_avg - s.current_price) / s.current_price * 100.0, 2);
        assert_eq!(s.margin, expected);
        assert_eq!(s.signal == Signal::Good, s.margin > 0.0);
    }

    #[test]
    fn weight_distribution_sums_to_hundred() {
        let history = daily_series(30, |d| 10.0 + d as f64);
        let params = ValuationParams::new([1.0, 1.0, 1.0], 0.0).unwrap();
        let s = compute_snapshot("T", &history, &params, now()).unwrap();
        assert!((s.weight_distribution.total() - 100.0).abs() <= 0.2);
        assert_eq!(s.weight_distribution.last_week, 33.3);

        let s = compute_snapshot("T", &history, &ValuationParams::default(), now()).unwrap();
        assert_eq!(s.weight_distribution.last_week, 50.0);
        assert_eq!(s.weight_distribution.last_month, 30.0);
        assert_eq!(s.weight_distribution.last_6months, 20.0);
    }

    #[test]
    fn threshold_is_strict() {
        // Month mean 105 against a close of 100: margin exactly 5%.
        let history = vec![at(10, 110.0), at(0, 100.0)];
        let params = ValuationParams::new([0.0, 1.0, 0.0], 5.0).unwrap();
        let s = compute_snapshot("T", &history, &params, now()).unwrap();
        assert_eq!(s.margin, 5.0);
        assert_eq!(s.signal, Signal::Bad);

        let params = ValuationParams::new([0.0, 1.0, 0.0], 4.99).unwrap();
        let s = compute_snapshot("T", &history, &params, now()).unwrap();
        assert_eq!(s.signal, Signal::Good);
    }

    #[test]
    fn rejects_bad_history() {
        let params = ValuationParams::default();
        assert!(matches!(
            compute_snapshot("T", &[], &params, now()),
            Err(ServiceError::InsufficientHistory { .. })
        ));
        assert!(compute_snapshot("T", &[at(1, 10.0), at(2, 11.0)], &params, now()).is_err());
        assert!(compute_snapshot("T", &[at(1, 10.0), at(1, 11.0)], &params, now()).is_err());
        assert!(compute_snapshot("T", &[at(1, 0.0), at(0, 11.0)], &params, now()).is_err());
        assert!(compute_snapshot("T", &[at(0, f64::NAN)], &params, now()).is_err());
    }

    #[test]
    fn params_validation() {
        assert!(ValuationParams::new([0.0, 0.0, 0.0], 0.0).is_err());
        assert!(ValuationParams::new([-1.0, 1.0, 1.0], 0.0).is_err());
        assert!(ValuationParams::new([1.0, 1.0, 1.0], f64::INFINITY).is_err());
        assert_eq!(parse_weights("60, 30 ,10").unwrap(), [60.0, 30.0, 10.0]);
        assert!(parse_weights("1,2").is_err());
        assert!(parse_weights("a,b,c").is_err());
    }
}
