// =============================================================================
// Binance WebSocket adapter — stream names, subscribe frames, heartbeat
// =============================================================================
//
// Binance speaks one raw stream per connection (`/ws`) and can't add a
// subscription to a live socket, so `supports_live_subscribe` is false: the
// session reconnects with the updated stream set instead (§4.7 "Subscription
// model"). Heartbeat is passive — the server pings, we pong.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::DateTime;
use serde_json::Value;

use super::{HeartbeatPolicy, Subscription, VenueWsAdapter, WsEvent, WsSessionConfig};
use crate::decimal::{self, Decimal};
use crate::error::{ConnectorError, Result};
use crate::orderbook::BookDelta;
use crate::orders::OrderUpdate;
use crate::symbol;
use crate::transport::WsFrame;
use crate::types::{Exchange, Order, OrderStatus, OrderType, Side, TimeInForce, Ticker, Trade};

pub struct BinanceWsAdapter {
    base_url: String,
    next_id: AtomicU64,
}

impl BinanceWsAdapter {
    pub fn new() -> Self {
        Self::with_base_url("wss://stream.binance.com:9443/ws".to_string())
    }

    pub fn with_base_url(base_url: String) -> Self {
        Self { base_url, next_id: AtomicU64::new(1) }
    }

    pub fn testnet() -> Self {
        Self::with_base_url("wss://testnet.binance.vision/ws".to_string())
    }

    fn stream_name(sub: &Subscription) -> String {
        let (symbol, suffix) = match sub {
            Subscription::Ticker(s) => (s, "ticker"),
            Subscription::OrderBook(s) => (s, "depth"),
            Subscription::Trade(s) => (s, "trade"),
        };
        format!("{}@{suffix}", symbol::exchange_form(symbol).to_lowercase())
    }

    fn frame(&self, method: &str, subs: &[Subscription]) -> WsFrame {
        let params: Vec<String> = subs.iter().map(Self::stream_name).collect();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let body = serde_json::json!({ "method": method, "params": params, "id": id });
        WsFrame::Text(body.to_string())
    }

    fn status(s: &str) -> OrderStatus {
        match s {
            "NEW" => OrderStatus::New,
            "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
            "FILLED" => OrderStatus::Filled,
            "PENDING_CANCEL" => OrderStatus::Canceling,
            "CANCELED" => OrderStatus::Canceled,
            "REJECTED" => OrderStatus::Rejected,
            "EXPIRED" => OrderStatus::Expired,
            _ => OrderStatus::Pending,
        }
    }

    fn order_type(s: &str) -> OrderType {
        match s {
            "MARKET" => OrderType::Market,
            "STOP_LOSS_LIMIT" | "STOP_LIMIT" => OrderType::StopLimit,
            "STOP_LOSS" | "STOP_MARKET" => OrderType::StopMarket,
            _ => OrderType::Limit,
        }
    }

    fn tif(s: &str) -> TimeInForce {
        match s {
            "IOC" => TimeInForce::Ioc,
            "FOK" => TimeInForce::Fok,
            _ => TimeInForce::Gtc,
        }
    }

    fn parse_ticker(v: &Value) -> Result<Ticker> {
        let exchange_symbol = v.get("s").and_then(Value::as_str).unwrap_or_default();
        let sym = symbol::normalize(exchange_symbol, None).ok_or_else(|| ConnectorError::Validation {
            field: "symbol".to_string(),
            value: exchange_symbol.to_string(),
            constraint: "ambiguous exchange symbol in ticker stream".to_string(),
        })?;
        let dec_field = |key: &str| -> Decimal {
            v.get(key).and_then(Value::as_str).and_then(|s| decimal::parse(s).ok()).unwrap_or_else(|| decimal::dec("0"))
        };
        let timestamp = v
            .get("E")
            .and_then(Value::as_i64)
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or_else(chrono::Utc::now);
        Ok(Ticker {
            exchange: Exchange::Binance,
            symbol: sym,
            bid: dec_field("b"),
            ask: dec_field("a"),
            last: dec_field("c"),
            volume_24h: dec_field("v"),
            timestamp,
        })
    }

    fn parse_trade(v: &Value) -> Result<Trade> {
        let exchange_symbol = v.get("s").and_then(Value::as_str).unwrap_or_default();
        let sym = symbol::normalize(exchange_symbol, None).ok_or_else(|| ConnectorError::Validation {
            field: "symbol".to_string(),
            value: exchange_symbol.to_string(),
            constraint: "ambiguous exchange symbol in trade stream".to_string(),
        })?;
        let price = v.get("p").and_then(Value::as_str).and_then(|s| decimal::parse(s).ok()).unwrap_or_else(|| decimal::dec("0"));
        let quantity = v.get("q").and_then(Value::as_str).and_then(|s| decimal::parse(s).ok()).unwrap_or_else(|| decimal::dec("0"));
        // `m` is "is buyer the maker"; the aggressor (our `side`) is the taker.
        let side = if v.get("m").and_then(Value::as_bool).unwrap_or(false) { Side::Sell } else { Side::Buy };
        let timestamp = v
            .get("T")
            .and_then(Value::as_i64)
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or_else(chrono::Utc::now);
        Ok(Trade {
            exchange: Exchange::Binance,
            symbol: sym,
            trade_id: v.get("t").map(|t| t.to_string()).unwrap_or_default(),
            price,
            quantity,
            side,
            timestamp,
        })
    }

    fn parse_depth(v: &Value) -> Result<(crate::symbol::Symbol, BookDelta)> {
        let exchange_symbol = v.get("s").and_then(Value::as_str).unwrap_or_default();
        let sym = symbol::normalize(exchange_symbol, None).ok_or_else(|| ConnectorError::Validation {
            field: "symbol".to_string(),
            value: exchange_symbol.to_string(),
            constraint: "ambiguous exchange symbol in depth stream".to_string(),
        })?;
        let levels = |key: &str| -> Vec<(Decimal, Decimal)> {
            v.get(key)
                .and_then(Value::as_array)
                .map(|arr| {
                    arr.iter()
                        .filter_map(|level| {
                            let pair = level.as_array()?;
                            let price = decimal::parse(pair.first()?.as_str()?).ok()?;
                            let qty = decimal::parse(pair.get(1)?.as_str()?).ok()?;
                            Some((price, qty))
                        })
                        .collect()
                })
                .unwrap_or_default()
        };
        Ok((
            sym,
            BookDelta {
                first_update_id: v.get("U").and_then(Value::as_u64).unwrap_or(0),
                final_update_id: v.get("u").and_then(Value::as_u64).unwrap_or(0),
                bids: levels("b"),
                asks: levels("a"),
                checksum: None,
            },
        ))
    }

    fn parse_execution_report(v: &Value) -> Result<OrderUpdate> {
        let exchange_symbol = v.get("s").and_then(Value::as_str).unwrap_or_default();
        let sym = symbol::normalize(exchange_symbol, None).ok_or_else(|| ConnectorError::Validation {
            field: "symbol".to_string(),
            value: exchange_symbol.to_string(),
            constraint: "ambiguous exchange symbol in execution report".to_string(),
        })?;
        let get_str = |key: &str| v.get(key).and_then(Value::as_str).unwrap_or_default();
        let get_dec = |key: &str| -> Decimal {
            v.get(key).and_then(Value::as_str).and_then(|s| decimal::parse(s).ok()).unwrap_or_else(|| decimal::dec("0"))
        };
        // Binance's user data stream has no monotonic sequence field of its
        // own; event time is strictly increasing per account and stands in
        // for the reducer's `update_id` (§4.9).
        let event_time = v.get("E").and_then(Value::as_i64).unwrap_or(0).max(0) as u64;
        let now = chrono::Utc::now();
        let order = Order {
            exchange: Exchange::Binance,
            order_id: v.get("i").map(|i| i.to_string()).unwrap_or_default(),
            client_order_id: v.get("c").and_then(Value::as_str).filter(|s| !s.is_empty()).map(str::to_string),
            symbol: sym,
            side: if get_str("S").eq_ignore_ascii_case("SELL") { Side::Sell } else { Side::Buy },
            order_type: Self::order_type(get_str("o")),
            status: Self::status(get_str("X")),
            price: v.get("p").and_then(Value::as_str).and_then(|s| decimal::parse(s).ok()),
            quantity: get_dec("q"),
            filled_qty: get_dec("z"),
            avg_fill_price: None,
            time_in_force: Self::tif(get_str("f")),
            created_at: v
                .get("O")
                .and_then(Value::as_i64)
                .and_then(DateTime::from_timestamp_millis)
                .unwrap_or(now),
            updated_at: v.get("E").and_then(Value::as_i64).and_then(DateTime::from_timestamp_millis).unwrap_or(now),
        };
        Ok(OrderUpdate { update_id: event_time, order })
    }
}

impl Default for BinanceWsAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl VenueWsAdapter for BinanceWsAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Binance
    }

    fn ws_url(&self) -> String {
        self.base_url.clone()
    }

    fn supports_live_subscribe(&self) -> bool {
        false
    }

    fn subscribe_frame(&self, subs: &[Subscription]) -> WsFrame {
        self.frame("SUBSCRIBE", subs)
    }

    fn unsubscribe_frame(&self, subs: &[Subscription]) -> WsFrame {
        self.frame("UNSUBSCRIBE", subs)
    }

    fn heartbeat_policy(&self, config: &WsSessionConfig) -> HeartbeatPolicy {
        HeartbeatPolicy::RespondToServerPing {
            read_deadline: config.ping_interval + config.heartbeat_wait,
        }
    }

    fn parse_message(&self, text: &str) -> Result<WsEvent> {
        let v: Value = serde_json::from_str(text)?;

        if v.get("result").is_some() || v.get("id").is_some() {
            return Ok(WsEvent::Control);
        }

        match v.get("e").and_then(Value::as_str) {
            Some("24hrTicker") => Ok(WsEvent::Ticker(Self::parse_ticker(&v)?)),
            Some("trade") => Ok(WsEvent::Trade(Self::parse_trade(&v)?)),
            Some("depthUpdate") => {
                let (symbol, delta) = Self::parse_depth(&v)?;
                Ok(WsEvent::BookDelta { symbol, delta })
            }
            Some("executionReport") => Ok(WsEvent::Order(Self::parse_execution_report(&v)?)),
            _ => Ok(WsEvent::Unrecognized),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_name_lowercases_exchange_symbol() {
        let sub = Subscription::Ticker(crate::symbol::Symbol::new("BTC", "USDT"));
        assert_eq!(BinanceWsAdapter::stream_name(&sub), "btcusdt@ticker");
    }

    #[test]
    fn parses_depth_update_into_book_delta() {
        let adapter = BinanceWsAdapter::new();
        let text = r#"{"e":"depthUpdate","s":"BTCUSDT","U":101,"u":105,"b":[["100.0","1.0"]],"a":[]}"#;
        match adapter.parse_message(text).unwrap() {
            WsEvent::BookDelta { symbol, delta } => {
                assert_eq!(symbol.canonical(), "BTC/USDT");
                assert_eq!(delta.first_update_id, 101);
                assert_eq!(delta.final_update_id, 105);
            }
            _ => panic!("expected BookDelta"),
        }
    }

    #[test]
    fn subscribe_ack_is_control() {
        let adapter = BinanceWsAdapter::new();
        assert!(matches!(adapter.parse_message(r#"{"result":null,"id":1}"#).unwrap(), WsEvent::Control));
    }

    #[test]
    fn execution_report_maps_to_order_update() {
        let adapter = BinanceWsAdapter::new();
        let text = r#"{"e":"executionReport","s":"BTCUSDT","i":99,"c":"abc","S":"BUY","o":"LIMIT","X":"NEW","p":"100.0","q":"1.0","z":"0","f":"GTC","O":1,"E":2}"#;
        match adapter.parse_message(text).unwrap() {
            WsEvent::Order(update) => {
                assert_eq!(update.order.status, OrderStatus::New);
                assert_eq!(update.update_id, 2);
            }
            _ => panic!("expected Order"),
        }
    }
}
