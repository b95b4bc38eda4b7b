use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// One daily closing price. Recorded points are never rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceHistoryPoint {
    pub date: NaiveDate,
    pub price: f64,
}

impl PriceHistoryPoint {
    pub fn new(date: NaiveDate, price: f64) -> Self {
        Self { date, price }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub data: Vec<PriceHistoryPoint>,
}
