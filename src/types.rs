// =============================================================================
// Domain types — plain records the connector dispatches to embedders
// =============================================================================
//
// These are value types: cheap to clone, carrying no reference into core
// state. Handlers always receive copies (§3 "Ownership").
// =============================================================================

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::decimal::Decimal;
use crate::symbol::Symbol;

/// Which venue a connector instance speaks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exchange {
    Binance,
    Bybit,
}

impl std::fmt::Display for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Exchange::Binance => write!(f, "binance"),
            Exchange::Bybit => write!(f, "bybit"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
    StopLimit,
    StopMarket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    Gtc,
    Ioc,
    Fok,
}

/// The closed set of order statuses (§3, §4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    Pending,
    PartiallyFilled,
    Filled,
    Canceling,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    /// Terminal statuses never transition further (§8 universal invariant).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected | OrderStatus::Expired
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub exchange: Exchange,
    pub symbol: Symbol,
    pub bid: Decimal,
    pub ask: Decimal,
    pub last: Decimal,
    pub volume_24h: Decimal,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub exchange: Exchange,
    pub symbol: Symbol,
    pub trade_id: String,
    pub price: Decimal,
    pub quantity: Decimal,
    pub side: Side,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OrderBookLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

/// `Decimal` is `Ord`, but we wrap it as a map key so intent at call sites
/// is unambiguous — this is a price, not an arbitrary decimal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DecimalKey(pub Decimal);

/// A full order book for one symbol: sorted bids (descending) and asks
/// (ascending), a monotonic `sequence`, and the time of the last applied
/// update. See `orderbook.rs` for the synchronizer that maintains this
/// invariantly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBook {
    pub exchange: Exchange,
    pub symbol: Symbol,
    pub bids: BTreeMap<DecimalKey, Decimal>,
    pub asks: BTreeMap<DecimalKey, Decimal>,
    pub sequence: u64,
    pub last_update_time: DateTime<Utc>,
    pub checksum: Option<u32>,
}

impl OrderBook {
    pub fn new(exchange: Exchange, symbol: Symbol) -> Self {
        Self {
            exchange,
            symbol,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            sequence: 0,
            last_update_time: Utc::now(),
            checksum: None,
        }
    }

    /// Best (highest) bid, if any.
    pub fn best_bid(&self) -> Option<OrderBookLevel> {
        self.bids.iter().next_back().map(|(k, qty)| OrderBookLevel {
            price: k.0,
            quantity: *qty,
        })
    }

    /// Best (lowest) ask, if any.
    pub fn best_ask(&self) -> Option<OrderBookLevel> {
        self.asks.iter().next().map(|(k, qty)| OrderBookLevel {
            price: k.0,
            quantity: *qty,
        })
    }

    /// §3 invariant: bids' best price <= asks' best price post-sync.
    pub fn is_crossed(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => b.price > a.price,
            _ => false,
        }
    }

    pub fn bids_desc(&self) -> Vec<OrderBookLevel> {
        self.bids
            .iter()
            .rev()
            .map(|(k, qty)| OrderBookLevel {
                price: k.0,
                quantity: *qty,
            })
            .collect()
    }

    pub fn asks_asc(&self) -> Vec<OrderBookLevel> {
        self.asks
            .iter()
            .map(|(k, qty)| OrderBookLevel {
                price: k.0,
                quantity: *qty,
            })
            .collect()
    }
}

/// Identified by `(exchange, order_id)`, secondarily indexed by
/// `client_order_id` (see `orders.rs`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub exchange: Exchange,
    pub order_id: String,
    pub client_order_id: Option<String>,
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub price: Option<Decimal>,
    pub quantity: Decimal,
    pub filled_qty: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub time_in_force: TimeInForce,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Trading rules for one pair, used for client-side validation and to
/// disambiguate symbol normalization (§9 Open Question).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub exchange_symbol: String,
    pub base_asset: String,
    pub quote_asset: String,
    pub tick_size: Decimal,
    pub lot_step_size: Decimal,
    pub min_price: Decimal,
    pub max_price: Decimal,
    pub min_qty: Decimal,
    pub max_qty: Decimal,
    pub min_notional: Decimal,
}

/// A single balance line from the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Balance {
    pub asset: String,
    pub free: Decimal,
    pub locked: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decimal::dec;

    #[test]
    fn order_book_best_levels_and_crossed_check() {
        let mut book = OrderBook::new(Exchange::Binance, Symbol::new("BTC", "USDT"));
        book.bids.insert(DecimalKey(dec("100")), dec("1"));
        book.bids.insert(DecimalKey(dec("99")), dec("2"));
        book.asks.insert(DecimalKey(dec("101")), dec("1"));
        book.asks.insert(DecimalKey(dec("102")), dec("2"));

        assert_eq!(book.best_bid().unwrap().price, dec("100"));
        assert_eq!(book.best_ask().unwrap().price, dec("101"));
        assert!(!book.is_crossed());

        book.bids.insert(DecimalKey(dec("105")), dec("1"));
        assert!(book.is_crossed());
    }

    #[test]
    fn terminal_statuses_are_closed() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Canceled.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(OrderStatus::Expired.is_terminal());
        assert!(!OrderStatus::New.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
    }
}
