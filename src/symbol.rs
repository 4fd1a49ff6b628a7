// =============================================================================
// Symbol — canonical BASE/QUOTE pairs and per-venue wire-form mapping
// =============================================================================

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ConnectorError;
use crate::types::SymbolInfo;

/// A canonical trading pair, always `BASE/QUOTE` in uppercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Symbol {
    pub base: String,
    pub quote: String,
}

impl Symbol {
    pub fn new(base: impl Into<String>, quote: impl Into<String>) -> Self {
        Self {
            base: base.into().to_uppercase(),
            quote: quote.into().to_uppercase(),
        }
    }

    pub fn canonical(&self) -> String {
        format!("{}/{}", self.base, self.quote)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

/// Quote currencies tried longest-suffix-first when splitting a
/// concatenated exchange symbol like `BTCUSDT`. Order matters: trying `USD`
/// before `USDT`/`USDC` would wrongly split `BTCUSDT` into `BTCUS/DT`, and
/// trying a short quote before a longer one that shares its suffix can cut
/// into a base asset that itself ends in a quote-like string (e.g.
/// `USDCUSDT`).
const KNOWN_QUOTES: &[&str] = &[
    "USDT", "USDC", "BUSD", "FDUSD", "TUSD", "DAI", "EUR", "GBP", "TRY", "BRL", "USD", "BTC",
    "ETH", "BNB",
];

/// Split an exchange-form symbol (e.g. `BTCUSDT`) into a canonical `Symbol`.
///
/// Walks `KNOWN_QUOTES` longest-first. If the resulting base is empty (the
/// whole string is a quote) or no known quote matches, the split is
/// ambiguous and the caller must supply `symbol_info` to disambiguate via
/// `SymbolInfo::base_asset`/`quote_asset` — §9 Open Question: never guess.
pub fn normalize(exchange_form: &str, symbol_info: Option<&SymbolInfo>) -> Option<Symbol> {
    if let Some(info) = symbol_info {
        return Some(Symbol::new(info.base_asset.clone(), info.quote_asset.clone()));
    }

    let upper = exchange_form.to_uppercase();
    let mut quotes: Vec<&&str> = KNOWN_QUOTES.iter().collect();
    quotes.sort_by_key(|q| std::cmp::Reverse(q.len()));

    for quote in quotes {
        if let Some(base) = upper.strip_suffix(quote) {
            if !base.is_empty() && base != *quote {
                return Some(Symbol::new(base, *quote));
            }
        }
    }
    None
}

/// Render a canonical `Symbol` back into the venue's concatenated wire form.
pub fn exchange_form(symbol: &Symbol) -> String {
    format!("{}{}", symbol.base, symbol.quote)
}

/// Normalize or fail with a structured `ConnectorError::Validation`, for
/// call sites that cannot tolerate an ambiguous, unresolved symbol.
pub fn normalize_or_err(
    exchange_form_str: &str,
    symbol_info: Option<&SymbolInfo>,
) -> crate::error::Result<Symbol> {
    normalize(exchange_form_str, symbol_info).ok_or_else(|| ConnectorError::Validation {
        field: "symbol".to_string(),
        value: exchange_form_str.to_string(),
        constraint: "ambiguous exchange symbol — supply SymbolInfo to disambiguate".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_common_pairs() {
        assert_eq!(normalize("BTCUSDT", None), Some(Symbol::new("BTC", "USDT")));
        assert_eq!(normalize("ETHBTC", None), Some(Symbol::new("ETH", "BTC")));
    }

    #[test]
    fn round_trips_documented_quotes() {
        for raw in ["BTCUSDT", "ETHUSDT", "SOLUSDC", "ETHBTC"] {
            let sym = normalize(raw, None).unwrap();
            assert_eq!(exchange_form(&sym), raw);
        }
    }

    #[test]
    fn ambiguous_symbol_falls_back_to_symbol_info() {
        // USDCUSDT: naive longest-suffix match on USDT/USDC could misparse.
        let info = SymbolInfo {
            exchange_symbol: "USDCUSDT".to_string(),
            base_asset: "USDC".to_string(),
            quote_asset: "USDT".to_string(),
            tick_size: crate::decimal::dec("0.0001"),
            lot_step_size: crate::decimal::dec("1"),
            min_price: crate::decimal::dec("0.0001"),
            max_price: crate::decimal::dec("1000000"),
            min_qty: crate::decimal::dec("1"),
            max_qty: crate::decimal::dec("1000000"),
            min_notional: crate::decimal::dec("1"),
        };
        let sym = normalize("USDCUSDT", Some(&info)).unwrap();
        assert_eq!(sym, Symbol::new("USDC", "USDT"));
    }

    #[test]
    fn unresolvable_without_symbol_info_is_left_unchanged() {
        // A made-up ticker with no known quote suffix at all.
        assert!(normalize("ZZZZZZ1", None).is_none());
        assert!(normalize_or_err("ZZZZZZ1", None).is_err());
    }
}
