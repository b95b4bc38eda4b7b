use crate::error::ServiceError;

const MAX_SYMBOL_LEN: usize = 16;

/// Trims and upper-cases a ticker, rejecting anything a quote service would not accept.
pub fn normalize_symbol(raw: &str) -> Result<String, ServiceError> {
    let symbol = raw.trim().to_ascii_uppercase();
    if symbol.is_empty() || symbol.len() > MAX_SYMBOL_LEN {
        return Err(ServiceError::InvalidSymbol(raw.to_string()));
    }

    let valid = symbol
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '^' | '='));
    if !valid {
        return Err(ServiceError::InvalidSymbol(raw.to_string()));
    }

    Ok(symbol)
}
