// =============================================================================
// Bybit venue adapter — signing, endpoints, and wire shapes
// =============================================================================
//
// `signature = HMAC-SHA256(secret, timestamp || api_key || recv_window ||
// body_or_query)`, carried in `X-BAPI-*` headers.
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

pub struct BybitAdapter {
    secret: String,
    api_key: String,
    base_url: String,
}

impl BybitAdapter {
    pub fn new(secret: String, api_key: String) -> Self {
        Self::with_base_url(secret, api_key, "https://api.bybit.com".to_string())
    }

    pub fn with_base_url(secret: String, api_key: String, base_url: String) -> Self {
        Self { secret, api_key, base_url }
    }

    pub fn testnet(secret: String, api_key: String) -> Self {
        Self::with_base_url(secret, api_key, "https://api-testnet.bybit.com".to_string())
    }

    fn hmac_hex(&self, message: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(message.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn result<'a>(v: &'a Value) -> &'a Value {
        v.get("result").unwrap_or(v)
    }

    fn status(status_str: &str) -> OrderStatus {
        match status_str {
            "New" => OrderStatus::New,
            "PartiallyFilled" => OrderStatus::PartiallyFilled,
            "Filled" => OrderStatus::Filled,
            "PendingCancel" => OrderStatus::Canceling,
            "Cancelled" => OrderStatus::Canceled,
            "Rejected" => OrderStatus::Rejected,
            "Deactivated" => OrderStatus::Expired,
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
        let now = chrono::Utc::now();
        let parse_ms = |key: &str| {
            v.get(key)
                .and_then(Value::as_str)
                .and_then(|s| s.parse::<i64>().ok())
                .and_then(chrono::DateTime::from_timestamp_millis)
        };
        Ok(Order {
            exchange: Exchange::Bybit,
            order_id: get_str("orderId").to_string(),
            client_order_id: v.get("orderLinkId").and_then(Value::as_str).filter(|s| !s.is_empty()).map(str::to_string),
            symbol: sym,
            side: if get_str("side").eq_ignore_ascii_case("Sell") { Side::Sell } else { Side::Buy },
            order_type: if get_str("orderType").eq_ignore_ascii_case("Market") { OrderType::Market } else { OrderType::Limit },
            status: Self::status(get_str("orderStatus")),
            price: v.get("price").and_then(Value::as_str).and_then(|s| decimal::parse(s).ok()),
            quantity: get_dec("qty"),
            filled_qty: get_dec("cumExecQty"),
            avg_fill_price: v.get("avgPrice").and_then(Value::as_str).and_then(|s| decimal::parse(s).ok()),
            time_in_force: match get_str("timeInForce") {
                "IOC" => TimeInForce::Ioc,
                "FOK" => TimeInForce::Fok,
                _ => TimeInForce::Gtc,
            },
            created_at: parse_ms("createdTime").unwrap_or(now),
            updated_at: parse_ms("updatedTime").unwrap_or(now),
        })
    }
}

impl VenueAdapter for BybitAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Bybit
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn sign(
        &self,
        method: HttpMethod,
        params: &[(&str, String)],
        timestamp_ms: i64,
        recv_window_ms: u64,
    ) -> SignedRequest {
        let (query, body) = match method {
            HttpMethod::Get | HttpMethod::Delete => {
                let query = params.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join("&");
                (query, None)
            }
            HttpMethod::Post | HttpMethod::Put => {
                let mut obj = serde_json::Map::new();
                for (k, v) in params {
                    obj.insert((*k).to_string(), Value::String(v.clone()));
                }
                (String::new(), Some(Value::Object(obj).to_string()))
            }
        };

        let payload = body.clone().unwrap_or_else(|| query.clone());
        let signing_string = format!("{timestamp_ms}{}{recv_window_ms}{payload}", self.api_key);
        let signature = self.hmac_hex(&signing_string);

        let mut headers = HashMap::new();
        headers.insert("X-BAPI-API-KEY".to_string(), self.api_key.clone());
        headers.insert("X-BAPI-TIMESTAMP".to_string(), timestamp_ms.to_string());
        headers.insert("X-BAPI-RECV-WINDOW".to_string(), recv_window_ms.to_string());
        headers.insert("X-BAPI-SIGN".to_string(), signature);
        if body.is_some() {
            headers.insert("Content-Type".to_string(), "application/json".to_string());
        }

        SignedRequest { query, body, headers }
    }

    fn ping_path(&self) -> &str {
        "/v5/market/time"
    }
    fn server_time_path(&self) -> &str {
        "/v5/market/time"
    }
    fn exchange_info_path(&self) -> &str {
        "/v5/market/instruments-info"
    }
    fn order_book_path(&self) -> &str {
        "/v5/market/orderbook"
    }
    fn place_order_path(&self) -> &str {
        "/v5/order/create"
    }
    fn cancel_order_path(&self) -> &str {
        "/v5/order/cancel"
    }
    fn get_order_path(&self) -> &str {
        "/v5/order/realtime"
    }
    fn open_orders_path(&self) -> &str {
        "/v5/order/realtime"
    }
    fn balance_path(&self) -> &str {
        "/v5/account/wallet-balance"
    }

    fn side_str(&self, side: Side) -> &'static str {
        match side {
            Side::Buy => "Buy",
            Side::Sell => "Sell",
        }
    }

    fn order_type_str(&self, order_type: OrderType) -> &'static str {
        match order_type {
            OrderType::Market | OrderType::StopMarket => "Market",
            OrderType::Limit | OrderType::StopLimit => "Limit",
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
        let result = Self::result(&v);
        result
            .get("timeSecond")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<i64>().ok())
            .map(|secs| secs * 1000)
            .or_else(|| result.get("timeNano").and_then(Value::as_str).and_then(|s| s.parse::<i64>().ok()).map(|ns| ns / 1_000_000))
            .ok_or_else(|| ConnectorError::Wire(serde_json::Error::io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "missing timeSecond",
            ))))
    }

    fn parse_symbol_info(&self, body: &str, symbol: &crate::symbol::Symbol) -> crate::error::Result<SymbolInfo> {
        let v: Value = serde_json::from_str(body)?;
        let entry = Self::result(&v)["list"]
            .as_array()
            .and_then(|arr| arr.first())
            .ok_or_else(|| ConnectorError::NotFound {
                what: format!("symbol info for {symbol}"),
            })?;

        let price_filter = entry.get("priceFilter").cloned().unwrap_or_default();
        let lot_filter = entry.get("lotSizeFilter").cloned().unwrap_or_default();
        let get = |obj: &Value, key: &str| obj.get(key).and_then(Value::as_str).and_then(|s| decimal::parse(s).ok()).unwrap_or_else(|| decimal::dec("0"));

        Ok(SymbolInfo {
            exchange_symbol: entry.get("symbol").and_then(Value::as_str).unwrap_or_default().to_string(),
            base_asset: entry.get("baseCoin").and_then(Value::as_str).unwrap_or_default().to_string(),
            quote_asset: entry.get("quoteCoin").and_then(Value::as_str).unwrap_or_default().to_string(),
            tick_size: get(&price_filter, "tickSize"),
            lot_step_size: get(&lot_filter, "qtyStep"),
            min_price: get(&price_filter, "minPrice"),
            max_price: get(&price_filter, "maxPrice"),
            min_qty: get(&lot_filter, "minOrderQty"),
            max_qty: get(&lot_filter, "maxOrderQty"),
            min_notional: decimal::dec("0"),
        })
    }

    fn parse_order_book(&self, body: &str) -> crate::error::Result<OrderBookSnapshot> {
        let v: Value = serde_json::from_str(body)?;
        let result = Self::result(&v);
        let last_update_id = result.get("u").and_then(Value::as_u64).unwrap_or(0);
        let parse_levels = |key: &str| -> Vec<(Decimal, Decimal)> {
            result
                .get(key)
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
            bids: parse_levels("b"),
            asks: parse_levels("a"),
        })
    }

    fn parse_order(&self, body: &str) -> crate::error::Result<Order> {
        let v: Value = serde_json::from_str(body)?;
        let result = Self::result(&v);
        if let Some(entry) = result.get("list").and_then(Value::as_array).and_then(|a| a.first()) {
            return self.parse_order_value(entry);
        }
        self.parse_order_value(result)
    }

    fn parse_orders(&self, body: &str) -> crate::error::Result<Vec<Order>> {
        let v: Value = serde_json::from_str(body)?;
        let list = Self::result(&v)["list"].as_array().cloned().unwrap_or_default();
        list.iter().map(|o| self.parse_order_value(o)).collect()
    }

    fn parse_balance(&self, body: &str, asset: &str) -> crate::error::Result<Balance> {
        let v: Value = serde_json::from_str(body)?;
        let accounts = Self::result(&v)["list"].as_array().cloned().unwrap_or_default();
        for account in &accounts {
            if let Some(coins) = account.get("coin").and_then(Value::as_array) {
                for coin in coins {
                    if coin.get("coin").and_then(Value::as_str) == Some(asset) {
                        let wallet_balance = coin.get("walletBalance").and_then(Value::as_str).and_then(|s| decimal::parse(s).ok()).unwrap_or_else(|| decimal::dec("0"));
                        let locked = coin.get("locked").and_then(Value::as_str).and_then(|s| decimal::parse(s).ok()).unwrap_or_else(|| decimal::dec("0"));
                        return Ok(Balance {
                            asset: asset.to_string(),
                            free: wallet_balance - locked,
                            locked,
                        });
                    }
                }
            }
        }
        Err(ConnectorError::NotFound {
            what: format!("balance for asset {asset}"),
        })
    }

    fn weight(&self, op: RestOp) -> u32 {
        match op {
            RestOp::Ping | RestOp::ServerTime => 1,
            RestOp::ExchangeInfo => 5,
            RestOp::OrderBook => 5,
            RestOp::PlaceOrder | RestOp::CancelOrder | RestOp::GetOrder => 1,
            RestOp::OpenOrders => 2,
            RestOp::Balance => 5,
        }
    }

    fn classify_error(&self, status: u16, body: &str) -> ConnectorError {
        if let Ok(v) = serde_json::from_str::<Value>(body) {
            if let (Some(code), Some(message)) = (
                v.get("retCode").and_then(Value::as_i64),
                v.get("retMsg").and_then(Value::as_str),
            ) {
                if code == 10004 {
                    return ConnectorError::Signature { message: message.to_string() };
                }
                if code == 110001 {
                    return ConnectorError::NotFound { what: "order".to_string() };
                }
                return ConnectorError::Exchange {
                    code,
                    message: message.to_string(),
                    retryable: matches!(code, 10002 | 10006),
                };
            }
        }
        ConnectorError::Exchange {
            code: status as i64,
            message: body.to_string(),
            retryable: false,
        }
    }

    fn venue_rate_limited(&self, _status: u16, body: &str) -> Option<Duration> {
        let v: Value = serde_json::from_str(body).ok()?;
        let code = v.get("retCode").and_then(Value::as_i64)?;
        (code == 10006).then_some(Duration::from_millis(500))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::HttpMethod;

    #[test]
    fn signature_matches_reference_vector() {
        // §8 scenario 6, Bybit concatenation order: timestamp ∥ api_key ∥
        // recv_window ∥ body_or_query.
        let adapter = BybitAdapter::new("test_secret_key".to_string(), "test_api_key".to_string());
        let params = [("symbol", "BTCUSDT".to_string()), ("side", "Buy".to_string())];
        let signed = adapter.sign(HttpMethod::Get, &params, 1_700_000_000_000, 5000);

        assert_eq!(signed.query, "symbol=BTCUSDT&side=Buy");
        assert_eq!(
            signed.headers.get("X-BAPI-SIGN").unwrap(),
            "1dc3ae7266139058245a2fde3446bcd0735e571a57cd569374f36fc12e758190"
        );
    }

    #[test]
    fn post_requests_sign_the_json_body() {
        let adapter = BybitAdapter::new("secret".to_string(), "key".to_string());
        let params = [("symbol", "BTCUSDT".to_string())];
        let signed = adapter.sign(HttpMethod::Post, &params, 1, 5000);
        assert!(signed.body.is_some());
        assert!(signed.query.is_empty());
    }

    #[test]
    fn order_status_maps_cancelled_correctly() {
        assert_eq!(BybitAdapter::status("Cancelled"), OrderStatus::Canceled);
        assert_eq!(BybitAdapter::status("PendingCancel"), OrderStatus::Canceling);
    }
}
