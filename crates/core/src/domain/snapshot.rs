use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Signal {
    Good,
    Bad,
}

impl Signal {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Good => "GOOD",
            Self::Bad => "BAD",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "GOOD" => Some(Self::Good),
            "BAD" => Some(Self::Bad),
            _ => None,
        }
    }
}

/// Share of the total weight (in percent) each window carried into `weighted_avg`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightDistribution {
    pub last_week: f64,
    pub last_month: f64,
    pub last_6months: f64,
}

impl WeightDistribution {
    pub fn total(&self) -> f64 {
        self.last_week + self.last_month + self.last_6months
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockSnapshot {
    pub symbol: String,
    pub current_price: f64,
    pub value_coefficient: f64,
    pub weighted_avg: f64,
    pub margin: f64,
    pub signal: Signal,
    pub weight_distribution: WeightDistribution,
    pub as_of_date: NaiveDate,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StocksResponse {
    pub stocks: Vec<StockSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn serializes_dashboard_shape() {
        let snapshot = StockSnapshot {
            symbol: "AAPL".to_string(),
            current_price: 100.0,
            value_coefficient: 1.1,
            weighted_avg: 110.0,
            margin: 10.0,
            signal: Signal::Good,
            weight_distribution: WeightDistribution {
                last_week: 50.0,
                last_month: 30.0,
                last_6months: 20.0,
            },
            as_of_date: NaiveDate::from_ymd_opt(2026, 1, 5).unwrap(),
            computed_at: Utc.with_ymd_and_hms(2026, 1, 5, 14, 30, 0).unwrap(),
        };

        let v = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(v["signal"], json!("GOOD"));
        assert_eq!(v["weight_distribution"]["last_6months"], json!(20.0));
        assert_eq!(v["as_of_date"], json!("2026-01-05"));
    }

    #[test]
    fn signal_parse_matches_wire_names() {
        assert_eq!(Signal::parse("GOOD"), Some(Signal::Good));
        assert_eq!(Signal::parse("BAD"), Some(Signal::Bad));
        assert_eq!(Signal::parse("good"), None);
        assert_eq!(Signal::Bad.as_str(), "BAD");
    }
}
