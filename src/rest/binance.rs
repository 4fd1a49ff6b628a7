// =============================================================================
// Binance venue adapter — signing, endpoints, and wire shapes
// =============================================================================
//
// `signature = HMAC-SHA256(secret, querystring_without_signature)`,
// appended to the query as `&signature=...`, credential header
// `X-MBX-APIKEY`.
// =============================================================================

use std::collections::HashMap;
use std::time::Duration;

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;

use super::{OrderBookSnapshot, RestOp, SignedRequest, VenueAdapter};
use crate::decimal::{self, Decimal};
use crate::error::ConnectorError;
use crate::symbol;
use crate::transport::HttpMethod;
use crate::types::{
    Balance, Exchange, Order, OrderStatus, OrderType, Side, SymbolInfo, TimeInForce,
};

type HmacSha256 = Hmac<Sha256>;

pub struct BinanceAdapter {
    secret: String,
    api_key: String,
    base_url: String,
}

impl BinanceAdapter {
    pub fn new(secret: String) -> Self {
        Self::with_base_url(secret, String::new(), "https://api.binance.com".to_string())
    }

    pub fn with_base_url(secret: String, api_key: String, base_url: String) -> Self {
        Self { secret, api_key, base_url }
    }

    pub fn testnet(secret: String, api_key: String) -> Self {
        Self::with_base_url(secret, api_key, "https://testnet.binance.vision".to_string())
    }

    fn hmac_hex(&self, message: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(message.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn side(side_str: &str) -> Side {
        if side_str.eq_ignore_ascii_case("SELL") {
            Side::Sell
        } else {
            Side::Buy
        }
    }

    fn order_type(type_str: &str) -> OrderType {
        match type_str {
            "MARKET" => OrderType::Market,
            "STOP_LOSS_LIMIT" | "STOP_LIMIT" => OrderType::StopLimit,
            "STOP_LOSS" | "STOP_MARKET" => OrderType::StopMarket,
            _ => OrderType::Limit,
        }
    }

    fn tif(tif_str: &str) -> TimeInForce {
        match tif_str {
            "IOC" => TimeInForce::Ioc,
            "FOK" => TimeInForce::Fok,
            _ => TimeInForce::Gtc,
        }
    }

    fn status(status_str: &str) -> OrderStatus {
        match status_str {
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

    fn parse_order_value(&self, v: &Value) -> crate::error::Result<Order> {
        let get_str = |key: &str| v.get(key).and_then(Value::as_str).unwrap_or_default();
        let get_dec = |key: &str| -> Decimal {
            v.get(key)
                .and_then(Value::as_str)
                .and_then(|s| decimal::parse(s).ok())
                .unwrap_or_else(|| decimal::dec("0"))
        };
        let exchange_symbol = get_str("symbol");
        let sym = symbol::normalize(exchange_symbol, None).ok_or_else(|| ConnectorError::Validation {
            field: "symbol".to_string(),
            value: exchange_symbol.to_string(),
            constraint: "ambiguous exchange symbol in order response".to_string(),
        })?;
        let order_id = v
            .get("orderId")
            .map(|v| v.to_string())
            .unwrap_or_default();
        let now = chrono::Utc::now();
        Ok(Order {
            exchange: Exchange::Binance,
            order_id,
            client_order_id: v.get("clientOrderId").and_then(Value::as_str).map(str::to_string),
            symbol: sym,
            side: Self::side(get_str("side")),
            order_type: Self::order_type(get_str("type")),
            status: Self::status(get_str("status")),
            price: v.get("price").and_then(Value::as_str).and_then(|s| decimal::parse(s).ok()),
            quantity: get_dec("origQty"),
            filled_qty: get_dec("executedQty"),
            avg_fill_price: None,
            time_in_force: Self::tif(get_str("timeInForce")),
            created_at: v
                .get("transactTime")
                .or_else(|| v.get("time"))
                .and_then(Value::as_i64)
                .and_then(|ms| chrono::DateTime::from_timestamp_millis(ms))
                .unwrap_or(now),
            updated_at: v
                .get("updateTime")
                .and_then(Value::as_i64)
                .and_then(|ms| chrono::DateTime::from_timestamp_millis(ms))
                .unwrap_or(now),
        })
    }
}

impl VenueAdapter for BinanceAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Binance
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn sign(
        &self,
        _method: HttpMethod,
        params: &[(&str, String)],
        timestamp_ms: i64,
        recv_window_ms: u64,
    ) -> SignedRequest {
        let mut query = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        if !query.is_empty() {
            query.push('&');
        }
        query.push_str(&format!("timestamp={timestamp_ms}&recvWindow={recv_window_ms}"));

        let signature = self.hmac_hex(&query);
        query.push_str(&format!("&signature={signature}"));

        let mut headers = HashMap::new();
        headers.insert("X-MBX-APIKEY".to_string(), self.api_key.clone());

        SignedRequest { query, body: None, headers }
    }

    fn ping_path(&self) -> &str {
        "/api/v3/ping"
    }
    fn server_time_path(&self) -> &str {
        "/api/v3/time"
    }
    fn exchange_info_path(&self) -> &str {
        "/api/v3/exchangeInfo"
    }
    fn order_book_path(&self) -> &str {
        "/api/v3/depth"
    }
    fn place_order_path(&self) -> &str {
        "/api/v3/order"
    }
    fn cancel_order_path(&self) -> &str {
        "/api/v3/order"
    }
    fn get_order_path(&self) -> &str {
        "/api/v3/order"
    }
    fn open_orders_path(&self) -> &str {
        "/api/v3/openOrders"
    }
    fn balance_path(&self) -> &str {
        "/api/v3/account"
    }

    fn side_str(&self, side: Side) -> &'static str {
        match side {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    fn order_type_str(&self, order_type: OrderType) -> &'static str {
        match order_type {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
            OrderType::StopLimit => "STOP_LOSS_LIMIT",
            OrderType::StopMarket => "STOP_LOSS",
        }
    }

    fn tif_str(&self, tif: TimeInForce) -> &'static str {
        match tif {
            TimeInForce::Gtc => "GTC",
            TimeInForce::Ioc => "IOC",
            TimeInForce::Fok => "FOK",
        }
    }

    fn parse_server_time(&self, body: &str) -> crate::error::Result<i64> {
        let v: Value = serde_json::from_str(body)?;
        v.get("serverTime")
            .and_then(Value::as_i64)
            .ok_or_else(|| ConnectorError::Wire(serde_json::Error::io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "missing serverTime",
            ))))
    }

    fn parse_symbol_info(&self, body: &str, symbol: &crate::symbol::Symbol) -> crate::error::Result<SymbolInfo> {
        let v: Value = serde_json::from_str(body)?;
        let entry = v["symbols"]
            .as_array()
            .and_then(|arr| arr.first())
            .ok_or_else(|| ConnectorError::NotFound {
                what: format!("symbol info for {symbol}"),
            })?;

        let mut tick_size = decimal::dec("0.00000001");
        let mut lot_step = decimal::dec("0.00000001");
        let mut min_price = decimal::dec("0");
        let mut max_price = decimal::dec("0");
        let mut min_qty = decimal::dec("0");
        let mut max_qty = decimal::dec("0");
        let mut min_notional = decimal::dec("0");

        if let Some(filters) = entry.get("filters").and_then(Value::as_array) {
            for filter in filters {
                let ftype = filter.get("filterType").and_then(Value::as_str).unwrap_or_default();
                let get = |key: &str| filter.get(key).and_then(Value::as_str).and_then(|s| decimal::parse(s).ok());
                match ftype {
                    "PRICE_FILTER" => {
                        tick_size = get("tickSize").unwrap_or(tick_size);
                        min_price = get("minPrice").unwrap_or(min_price);
                        max_price = get("maxPrice").unwrap_or(max_price);
                    }
                    "LOT_SIZE" => {
                        lot_step = get("stepSize").unwrap_or(lot_step);
                        min_qty = get("minQty").unwrap_or(min_qty);
                        max_qty = get("maxQty").unwrap_or(max_qty);
                    }
                    "MIN_NOTIONAL" | "NOTIONAL" => {
                        min_notional = get("minNotional").or_else(|| get("notional")).unwrap_or(min_notional);
                    }
                    _ => {}
                }
            }
        }

        Ok(SymbolInfo {
            exchange_symbol: entry.get("symbol").and_then(Value::as_str).unwrap_or_default().to_string(),
            base_asset: entry.get("baseAsset").and_then(Value::as_str).unwrap_or_default().to_string(),
            quote_asset: entry.get("quoteAsset").and_then(Value::as_str).unwrap_or_default().to_string(),
            tick_size,
            lot_step_size: lot_step,
            min_price,
            max_price,
            min_qty,
            max_qty,
            min_notional,
        })
    }

    fn parse_order_book(&self, body: &str) -> crate::error::Result<OrderBookSnapshot> {
        let v: Value = serde_json::from_str(body)?;
        let last_update_id = v.get("lastUpdateId").and_then(Value::as_u64).unwrap_or(0);
        let parse_levels = |key: &str| -> Vec<(Decimal, Decimal)> {
            v.get(key)
                .and_then(Value::as_array)
                .map(|levels| {
                    levels
                        .iter()
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
        Ok(OrderBookSnapshot {
            last_update_id,
            bids: parse_levels("bids"),
            asks: parse_levels("asks"),
        })
    }

    fn parse_order(&self, body: &str) -> crate::error::Result<Order> {
        let v: Value = serde_json::from_str(body)?;
        self.parse_order_value(&v)
    }

    fn parse_orders(&self, body: &str) -> crate::error::Result<Vec<Order>> {
        let v: Value = serde_json::from_str(body)?;
        let arr = v.as_array().cloned().unwrap_or_default();
        arr.iter().map(|o| self.parse_order_value(o)).collect()
    }

    fn parse_balance(&self, body: &str, asset: &str) -> crate::error::Result<Balance> {
        let v: Value = serde_json::from_str(body)?;
        let balances = v
            .get("balances")
            .and_then(Value::as_array)
            .ok_or_else(|| ConnectorError::NotFound {
                what: "balances array in account response".to_string(),
            })?;
        for b in balances {
            if b.get("asset").and_then(Value::as_str) == Some(asset) {
                return Ok(Balance {
                    asset: asset.to_string(),
                    free: b.get("free").and_then(Value::as_str).and_then(|s| decimal::parse(s).ok()).unwrap_or_else(|| decimal::dec("0")),
                    locked: b.get("locked").and_then(Value::as_str).and_then(|s| decimal::parse(s).ok()).unwrap_or_else(|| decimal::dec("0")),
                });
            }
        }
        Err(ConnectorError::NotFound {
            what: format!("balance for asset {asset}"),
        })
    }

    fn weight(&self, op: RestOp) -> u32 {
        match op {
            RestOp::Ping | RestOp::ServerTime => 1,
            RestOp::ExchangeInfo => 10,
            RestOp::OrderBook => 10,
            RestOp::PlaceOrder | RestOp::CancelOrder | RestOp::GetOrder => 1,
            RestOp::OpenOrders => 3,
            RestOp::Balance => 10,
        }
    }

    fn classify_error(&self, status: u16, body: &str) -> ConnectorError {
        if let Ok(v) = serde_json::from_str::<Value>(body) {
            if let (Some(code), Some(message)) = (
                v.get("code").and_then(Value::as_i64),
                v.get("msg").and_then(Value::as_str),
            ) {
                if code == -1022 || code == -2015 {
                    return ConnectorError::Signature { message: message.to_string() };
                }
                if code == -2013 {
                    return ConnectorError::NotFound { what: "order".to_string() };
                }
                return ConnectorError::Exchange {
                    code,
                    message: message.to_string(),
                    retryable: matches!(code, -1001 | -1016 | -1021),
                };
            }
        }
        ConnectorError::Exchange {
            code: status as i64,
            message: body.to_string(),
            retryable: false,
        }
    }

    fn venue_rate_limited(&self, status: u16, body: &str) -> Option<Duration> {
        if status == 418 {
            return Some(Duration::from_secs(60));
        }
        let v: Value = serde_json::from_str(body).ok()?;
        let code = v.get("code").and_then(Value::as_i64)?;
        (code == -1003).then_some(Duration::from_secs(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::HttpMethod;

    #[test]
    fn signature_matches_reference_vector() {
        // §8 scenario 6: fixed secret, timestamp, recv_window, payload.
        let adapter = BinanceAdapter::new("test_secret_key".to_string());
        let params = [("symbol", "BTCUSDT".to_string()), ("side", "BUY".to_string())];
        let signed = adapter.sign(HttpMethod::Post, &params, 1_700_000_000_000, 5000);

        assert_eq!(
            signed.query,
            "symbol=BTCUSDT&side=BUY&timestamp=1700000000000&recvWindow=5000&signature=\
             334125a9ac3746828b75437dc8abdd83676aa1200bb2a2c6a9e03783edd5cb35"
        );
    }

    #[test]
    fn order_status_maps_pending_cancel_to_canceling() {
        assert_eq!(BinanceAdapter::status("PENDING_CANCEL"), OrderStatus::Canceling);
        assert_eq!(BinanceAdapter::status("FILLED"), OrderStatus::Filled);
    }

    #[test]
    fn rate_limit_code_is_recognized() {
        let adapter = BinanceAdapter::new("s".to_string());
        let retry = adapter.venue_rate_limited(400, r#"{"code":-1003,"msg":"Too many requests"}"#);
        assert!(retry.is_some());
    }

    #[test]
    fn signature_error_code_is_classified() {
        let adapter = BinanceAdapter::new("s".to_string());
        let err = adapter.classify_error(400, r#"{"code":-1022,"msg":"Signature invalid."}"#);
        assert!(matches!(err, ConnectorError::Signature { .. }));
    }
}
