use std::fmt;

/// Domain failures that callers branch on. Carried inside `anyhow::Error`; recover with
/// `err.downcast_ref::<ServiceError>()`.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceError {
    InvalidSymbol(String),
    NotFound { symbol: String },
    InsufficientHistory { symbol: String, detail: String },
    Busy { symbol: String },
    Upstream { symbol: String, detail: String },
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidSymbol(raw) => write!(f, "invalid symbol: {raw:?}"),
            Self::NotFound { symbol } => write!(f, "no price history for {symbol}"),
            Self::InsufficientHistory { symbol, detail } => {
                write!(f, "cannot value {symbol}: {detail}")
            }
            Self::Busy { symbol } => write!(f, "recompute already running for {symbol}"),
            Self::Upstream { symbol, detail } => {
                write!(f, "price provider failed for {symbol}: {detail}")
            }
        }
    }
}

impl std::error::Error for ServiceError {}

pub fn service_error(err: &anyhow::Error) -> Option<&ServiceError> {
    err.downcast_ref::<ServiceError>()
}
