// =============================================================================
// Bybit WebSocket adapter — topic naming, live subscribe, client-ping
// =============================================================================
//
// Bybit supports subscribe/unsubscribe on a live connection (§4.7 "Subscription
// model"), so `supports_live_subscribe` is true and the session never has to
// reconnect just to add a stream. Heartbeat is active: we send `{"op":"ping"}`
// and expect a pong back within the configured deadline.
// =============================================================================

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

pub struct BybitWsAdapter {
    public_url: String,
}

impl BybitWsAdapter {
    pub fn new() -> Self {
        Self::with_base_url("wss://stream.bybit.com/v5/public/spot".to_string())
    }

    pub fn with_base_url(public_url: String) -> Self {
        Self { public_url }
    }

    pub fn testnet() -> Self {
        Self::with_base_url("wss://stream-testnet.bybit.com/v5/public/spot".to_string())
    }

    fn topic(sub: &Subscription) -> String {
        match sub {
            Subscription::Ticker(s) => format!("tickers.{}", symbol::exchange_form(s)),
            Subscription::OrderBook(s) => format!("orderbook.50.{}", symbol::exchange_form(s)),
            Subscription::Trade(s) => format!("publicTrade.{}", symbol::exchange_form(s)),
        }
    }

    fn frame(op: &str, subs: &[Subscription]) -> WsFrame {
        let args: Vec<String> = subs.iter().map(Self::topic).collect();
        WsFrame::Text(serde_json::json!({ "op": op, "args": args }).to_string())
    }

    fn status(s: &str) -> OrderStatus {
        match s {
            "New" | "Created" => OrderStatus::New,
            "PartiallyFilled" => OrderStatus::PartiallyFilled,
            "Filled" => OrderStatus::Filled,
            "PendingCancel" => OrderStatus::Canceling,
            "Cancelled" | "Deactivated" => OrderStatus::Canceled,
            "Rejected" => OrderStatus::Rejected,
            _ => OrderStatus::Pending,
        }
    }

    fn order_type(s: &str) -> OrderType {
        match s {
            "Market" => OrderType::Market,
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

    fn dec_field(v: &Value, key: &str) -> Decimal {
        v.get(key).and_then(Value::as_str).and_then(|s| decimal::parse(s).ok()).unwrap_or_else(|| decimal::dec("0"))
    }

    fn parse_ticker(data: &Value) -> Result<Ticker> {
        let exchange_symbol = data.get("symbol").and_then(Value::as_str).unwrap_or_default();
        let sym = symbol::normalize(exchange_symbol, None).ok_or_else(|| ConnectorError::Validation {
            field: "symbol".to_string(),
            value: exchange_symbol.to_string(),
            constraint: "ambiguous exchange symbol in ticker topic".to_string(),
        })?;
        Ok(Ticker {
            exchange: Exchange::Bybit,
            symbol: sym,
            bid: Self::dec_field(data, "bid1Price"),
            ask: Self::dec_field(data, "ask1Price"),
            last: Self::dec_field(data, "lastPrice"),
            volume_24h: Self::dec_field(data, "volume24h"),
            timestamp: chrono::Utc::now(),
        })
    }

    fn parse_trade(entry: &Value) -> Result<Trade> {
        let exchange_symbol = entry.get("s").and_then(Value::as_str).unwrap_or_default();
        let sym = symbol::normalize(exchange_symbol, None).ok_or_else(|| ConnectorError::Validation {
            field: "symbol".to_string(),
            value: exchange_symbol.to_string(),
            constraint: "ambiguous exchange symbol in trade topic".to_string(),
        })?;
        let side = if entry.get("S").and_then(Value::as_str) == Some("Sell") { Side::Sell } else { Side::Buy };
        let timestamp = entry
            .get("T")
            .and_then(Value::as_i64)
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or_else(chrono::Utc::now);
        Ok(Trade {
            exchange: Exchange::Bybit,
            symbol: sym,
            trade_id: entry.get("i").and_then(Value::as_str).unwrap_or_default().to_string(),
            price: Self::dec_field(entry, "p"),
            quantity: Self::dec_field(entry, "v"),
            side,
            timestamp,
        })
    }

    fn parse_book(data: &Value, is_snapshot_type: bool) -> Result<(crate::symbol::Symbol, BookDelta)> {
        let exchange_symbol = data.get("s").and_then(Value::as_str).unwrap_or_default();
        let sym = symbol::normalize(exchange_symbol, None).ok_or_else(|| ConnectorError::Validation {
            field: "symbol".to_string(),
            value: exchange_symbol.to_string(),
            constraint: "ambiguous exchange symbol in orderbook topic".to_string(),
        })?;
        let levels = |key: &str| -> Vec<(Decimal, Decimal)> {
            data.get(key)
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
        let update_id = data.get("u").and_then(Value::as_u64).unwrap_or(0);
        // Bybit's "snapshot" push carries no prior sequence to chain from; we
        // treat it as a self-contained delta whose first id equals its final
        // id so the synchronizer accepts it unconditionally once synced.
        let first_id = if is_snapshot_type { update_id } else { data.get("seq").and_then(Value::as_u64).unwrap_or(update_id) };
        Ok((
            sym,
            BookDelta {
                first_update_id: first_id,
                final_update_id: update_id,
                bids: levels("b"),
                asks: levels("a"),
                checksum: None,
            },
        ))
    }

    fn parse_order(entry: &Value) -> Result<OrderUpdate> {
        let exchange_symbol = entry.get("symbol").and_then(Value::as_str).unwrap_or_default();
        let sym = symbol::normalize(exchange_symbol, None).ok_or_else(|| ConnectorError::Validation {
            field: "symbol".to_string(),
            value: exchange_symbol.to_string(),
            constraint: "ambiguous exchange symbol in order topic".to_string(),
        })?;
        let get_str = |key: &str| entry.get(key).and_then(Value::as_str).unwrap_or_default();
        let now = chrono::Utc::now();
        let update_id = entry
            .get("updatedTime")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);
        let order = Order {
            exchange: Exchange::Bybit,
            order_id: get_str("orderId").to_string(),
            client_order_id: entry.get("orderLinkId").and_then(Value::as_str).filter(|s| !s.is_empty()).map(str::to_string),
            symbol: sym,
            side: if get_str("side").eq_ignore_ascii_case("Sell") { Side::Sell } else { Side::Buy },
            order_type: Self::order_type(get_str("orderType")),
            status: Self::status(get_str("orderStatus")),
            price: entry.get("price").and_then(Value::as_str).and_then(|s| decimal::parse(s).ok()),
            quantity: Self::dec_field(entry, "qty"),
            filled_qty: Self::dec_field(entry, "cumExecQty"),
            avg_fill_price: entry.get("avgPrice").and_then(Value::as_str).and_then(|s| decimal::parse(s).ok()),
            time_in_force: Self::tif(get_str("timeInForce")),
            created_at: entry
                .get("createdTime")
                .and_then(Value::as_str)
                .and_then(|s| s.parse::<i64>().ok())
                .and_then(DateTime::from_timestamp_millis)
                .unwrap_or(now),
            updated_at: now,
        };
        Ok(OrderUpdate { update_id, order })
    }
}

impl Default for BybitWsAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl VenueWsAdapter for BybitWsAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Bybit
    }

    fn ws_url(&self) -> String {
        self.public_url.clone()
    }

    fn supports_live_subscribe(&self) -> bool {
        true
    }

    fn subscribe_frame(&self, subs: &[Subscription]) -> WsFrame {
        Self::frame("subscribe", subs)
    }

    fn unsubscribe_frame(&self, subs: &[Subscription]) -> WsFrame {
        Self::frame("unsubscribe", subs)
    }

    fn heartbeat_policy(&self, config: &WsSessionConfig) -> HeartbeatPolicy {
        HeartbeatPolicy::ClientPing { interval: config.ping_interval, pong_deadline: config.heartbeat_wait }
    }

    fn parse_message(&self, text: &str) -> Result<WsEvent> {
        let v: Value = serde_json::from_str(text)?;

        if v.get("op").and_then(Value::as_str).is_some() {
            return Ok(WsEvent::Control);
        }

        let topic = match v.get("topic").and_then(Value::as_str) {
            Some(t) => t,
            None => return Ok(WsEvent::Unrecognized),
        };

        if topic.starts_with("tickers.") {
            let data = v.get("data").cloned().unwrap_or(Value::Null);
            return Ok(WsEvent::Ticker(Self::parse_ticker(&data)?));
        }

        if topic.starts_with("publicTrade.") {
            // Bybit batches trades in an array per message; surface the first
            // and let the next push carry the rest (mirrors §7's "best effort,
            // never blocks the read loop").
            let entry = v
                .get("data")
                .and_then(Value::as_array)
                .and_then(|arr| arr.first())
                .cloned()
                .unwrap_or(Value::Null);
            return Ok(WsEvent::Trade(Self::parse_trade(&entry)?));
        }

        if topic.starts_with("orderbook.") {
            let is_snapshot_type = v.get("type").and_then(Value::as_str) == Some("snapshot");
            let data = v.get("data").cloned().unwrap_or(Value::Null);
            let (symbol, delta) = Self::parse_book(&data, is_snapshot_type)?;
            return Ok(WsEvent::BookDelta { symbol, delta });
        }

        if topic == "order" {
            let entry = v
                .get("data")
                .and_then(Value::as_array)
                .and_then(|arr| arr.first())
                .cloned()
                .unwrap_or(Value::Null);
            return Ok(WsEvent::Order(Self::parse_order(&entry)?));
        }

        Ok(WsEvent::Unrecognized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_names_follow_bybit_convention() {
        let sym = crate::symbol::Symbol::new("BTC", "USDT");
        assert_eq!(BybitWsAdapter::topic(&Subscription::Ticker(sym.clone())), "tickers.BTCUSDT");
        assert_eq!(BybitWsAdapter::topic(&Subscription::OrderBook(sym.clone())), "orderbook.50.BTCUSDT");
        assert_eq!(BybitWsAdapter::topic(&Subscription::Trade(sym)), "publicTrade.BTCUSDT");
    }

    #[test]
    fn pong_and_ack_frames_are_control() {
        let adapter = BybitWsAdapter::new();
        assert!(matches!(adapter.parse_message(r#"{"op":"pong"}"#).unwrap(), WsEvent::Control));
        assert!(matches!(adapter.parse_message(r#"{"op":"subscribe","success":true}"#).unwrap(), WsEvent::Control));
    }

    #[test]
    fn parses_orderbook_snapshot_push() {
        let adapter = BybitWsAdapter::new();
        let text = r#"{"topic":"orderbook.50.BTCUSDT","type":"snapshot","data":{"s":"BTCUSDT","u":10,"b":[["100.0","1.0"]],"a":[]}}"#;
        match adapter.parse_message(text).unwrap() {
            WsEvent::BookDelta { symbol, delta } => {
                assert_eq!(symbol.canonical(), "BTC/USDT");
                assert_eq!(delta.final_update_id, 10);
            }
            _ => panic!("expected BookDelta"),
        }
    }

    #[test]
    fn unrecognized_topic_does_not_error() {
        let adapter = BybitWsAdapter::new();
        assert!(matches!(adapter.parse_message(r#"{"topic":"kline.1.BTCUSDT","data":{}}"#).unwrap(), WsEvent::Unrecognized));
    }
}
