// =============================================================================
// REST pipeline — signed, admitted, circuited calls against one venue (C6)
// =============================================================================
//
// Every call follows the same five-step flow: build the request record,
// sign it (for private endpoints), admit it through the rate limiter,
// execute it through the circuit breaker, then normalize the response into
// domain types. Binance and Bybit differ only in how a request is signed
// and how a response is shaped — both are expressed as one `VenueAdapter`
// implementation each (`binance.rs`, `bybit.rs`); this module owns the flow
// that's identical across both.
// =============================================================================

pub mod binance;
pub mod bybit;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

use crate::circuit::CircuitBreaker;
use crate::clock::ClockSync;
use crate::decimal::Decimal;
use crate::error::{ConnectorError, Result};
use crate::nonce::NonceGenerator;
use crate::ratelimit::WeightedBucket;
use crate::symbol::Symbol;
use crate::transport::{HttpMethod, HttpRequest, HttpTransport};
use crate::types::{Balance, Exchange, Order, OrderType, Side, SymbolInfo, TimeInForce};

/// A signed request ready to send: the final query string (GET/DELETE) or
/// body (POST), plus any venue-specific auth headers.
#[derive(Debug, Clone, Default)]
pub struct SignedRequest {
    pub query: String,
    pub body: Option<String>,
    pub headers: HashMap<String, String>,
}

/// Full order-book snapshot as returned by a venue's REST depth endpoint,
/// keyed by `last_update_id` for the synchronizer (C8, §4.8 step 3).
#[derive(Debug, Clone)]
pub struct OrderBookSnapshot {
    pub last_update_id: u64,
    pub bids: Vec<(Decimal, Decimal)>,
    pub asks: Vec<(Decimal, Decimal)>,
}

/// Parameters for `place_order` (§4.6, §3 Order fields).
#[derive(Debug, Clone)]
pub struct PlaceOrderRequest {
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub time_in_force: Option<TimeInForce>,
    pub client_order_id: Option<String>,
}

/// Parameters for `cancel_order`. Exactly one of `order_id` /
/// `client_order_id` should be set; venues accept either.
#[derive(Debug, Clone, Default)]
pub struct CancelOrderRequest {
    pub symbol: Symbol,
    pub order_id: Option<String>,
    pub client_order_id: Option<String>,
}

/// Everything that differs between Binance and Bybit: signing bytes,
/// endpoint paths, wire shapes. The pipeline in this module drives admission,
/// circuiting, retries, and error classification identically for both.
pub trait VenueAdapter: Send + Sync {
    fn exchange(&self) -> Exchange;
    fn base_url(&self) -> &str;

    /// Sign a private request per §4.6 step 2. `params` is an ordered list
    /// of query/body key-value pairs *before* timestamp/recvWindow/signature
    /// are appended — the adapter appends them in its venue's exact order.
    fn sign(
        &self,
        method: HttpMethod,
        params: &[(&str, String)],
        timestamp_ms: i64,
        recv_window_ms: u64,
    ) -> SignedRequest;

    fn ping_path(&self) -> &str;
    fn server_time_path(&self) -> &str;
    fn exchange_info_path(&self) -> &str;
    fn order_book_path(&self) -> &str;
    fn place_order_path(&self) -> &str;
    fn cancel_order_path(&self) -> &str;
    fn get_order_path(&self) -> &str;
    fn open_orders_path(&self) -> &str;
    fn balance_path(&self) -> &str;

    fn side_str(&self, side: Side) -> &'static str;
    fn order_type_str(&self, order_type: OrderType) -> &'static str;
    fn tif_str(&self, tif: TimeInForce) -> &'static str;

    fn parse_server_time(&self, body: &str) -> Result<i64>;
    fn parse_symbol_info(&self, body: &str, symbol: &Symbol) -> Result<SymbolInfo>;
    fn parse_order_book(&self, body: &str) -> Result<OrderBookSnapshot>;
    fn parse_order(&self, body: &str) -> Result<Order>;
    fn parse_orders(&self, body: &str) -> Result<Vec<Order>>;
    fn parse_balance(&self, body: &str, asset: &str) -> Result<Balance>;

    /// Weight or cost charged for an operation, for rate-limiter admission.
    fn weight(&self, op: RestOp) -> u32;

    /// Classify a non-2xx response per §4.6 step 4. `None` means "decode as
    /// success anyway" (never returned in practice, kept for symmetry).
    fn classify_error(&self, status: u16, body: &str) -> ConnectorError;

    /// Whether `status`/`body` represents the venue's own rate-limit
    /// signal (distinct from HTTP 429, which the pipeline always treats as
    /// a rate limit) and, if so, the `retry_after` to surface.
    fn venue_rate_limited(&self, status: u16, body: &str) -> Option<Duration>;
}

/// The nine REST operations this pipeline exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RestOp {
    Ping,
    ServerTime,
    ExchangeInfo,
    OrderBook,
    PlaceOrder,
    CancelOrder,
    GetOrder,
    OpenOrders,
    Balance,
}

#[derive(Debug, Clone)]
pub struct RestConfig {
    /// §6 `recv_window`, clamped to `[1, 60000]` ms (§8 boundary behavior).
    pub recv_window: Duration,
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            recv_window: Duration::from_millis(5000),
            request_timeout: Duration::from_secs(10),
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(5),
        }
    }
}

impl RestConfig {
    pub fn clamped_recv_window_ms(&self) -> u64 {
        (self.recv_window.as_millis() as u64).clamp(1, 60_000)
    }
}

/// The REST pipeline for one connector instance (C6). Owns nothing that
/// isn't shared with the rest of the connector — clock, nonce, limiter, and
/// breaker are all `Arc`-shared so the WS session's own REST needs (the
/// order-book synchronizer's snapshot fetch) go through the same gates.
pub struct RestPipeline {
    adapter: Arc<dyn VenueAdapter>,
    transport: Arc<dyn HttpTransport>,
    clock: Arc<ClockSync>,
    #[allow(dead_code)]
    nonce: Arc<NonceGenerator>,
    limiter: Arc<WeightedBucket>,
    breaker: Arc<CircuitBreaker>,
    config: RestConfig,
}

impl RestPipeline {
    pub fn new(
        adapter: Arc<dyn VenueAdapter>,
        transport: Arc<dyn HttpTransport>,
        clock: Arc<ClockSync>,
        nonce: Arc<NonceGenerator>,
        limiter: Arc<WeightedBucket>,
        breaker: Arc<CircuitBreaker>,
        config: RestConfig,
    ) -> Self {
        Self {
            adapter,
            transport,
            clock,
            nonce,
            limiter,
            breaker,
            config,
        }
    }

    fn build_query(params: &[(&str, String)]) -> String {
        params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Admit, execute through the breaker, classify, and return the raw
    /// response body. Shared by every public operation below.
    #[instrument(skip(self, params, cancel), fields(exchange = %self.adapter.exchange()))]
    async fn call(
        &self,
        op: RestOp,
        method: HttpMethod,
        path: &str,
        params: Vec<(&str, String)>,
        signed: bool,
        idempotent: bool,
        cancel: &CancellationToken,
    ) -> Result<String> {
        self.limiter.wait(self.adapter.weight(op), cancel).await?;

        let mut attempt = 0u32;
        loop {
            let request = self.build_request(method, path, &params, signed)?;
            let outcome = self
                .breaker
                .execute(|| async { self.execute_once(&request).await })
                .await;

            match outcome {
                Ok(body) => return Ok(body),
                Err(err) => {
                    let retryable = idempotent && err.is_retryable() && attempt < self.config.max_retries;
                    if !retryable {
                        return Err(err);
                    }
                    attempt += 1;
                    let delay = self.config.retry_base_delay * 2u32.pow(attempt.saturating_sub(1));
                    let delay = delay.min(self.config.retry_max_delay);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, "retrying transient REST failure");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(ConnectorError::Canceled),
                    }
                }
            }
        }
    }

    fn build_request(
        &self,
        method: HttpMethod,
        path: &str,
        params: &[(&str, String)],
        signed: bool,
    ) -> Result<HttpRequest> {
        let url_base = format!("{}{}", self.adapter.base_url(), path);

        if !signed {
            let query = Self::build_query(params);
            let url = if query.is_empty() {
                url_base
            } else {
                format!("{url_base}?{query}")
            };
            return Ok(HttpRequest {
                method,
                url,
                headers: HashMap::new(),
                body: None,
                timeout: self.config.request_timeout,
            });
        }

        let timestamp_ms = self.clock.now().timestamp_millis();
        let recv_window_ms = self.config.clamped_recv_window_ms();
        let signed_request = self.adapter.sign(method, params, timestamp_ms, recv_window_ms);

        let headers = signed_request.headers;

        let url = if signed_request.query.is_empty() {
            url_base
        } else {
            format!("{url_base}?{}", signed_request.query)
        };

        Ok(HttpRequest {
            method,
            url,
            headers,
            body: signed_request.body,
            timeout: self.config.request_timeout,
        })
    }

    async fn execute_once(&self, request: &HttpRequest) -> Result<String> {
        let response = self.transport.send(request.clone()).await.map_err(|e| match e {
            ConnectorError::Http(inner) => ConnectorError::Connection {
                message: inner.to_string(),
                temporary: true,
            },
            other => other,
        })?;

        if let Some(used) = response.header("X-MBX-USED-WEIGHT-1M").or_else(|| response.header("x-bapi-limit-status")) {
            if let Ok(used) = used.parse::<u32>() {
                self.limiter.observe_used_weight(used);
            }
        }

        if response.is_success() {
            return Ok(response.body);
        }

        if response.status == 429 {
            let retry_after = response
                .header("Retry-After")
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(1));
            return Err(ConnectorError::RateLimit { retry_after });
        }

        if let Some(retry_after) = self.adapter.venue_rate_limited(response.status, &response.body) {
            return Err(ConnectorError::RateLimit { retry_after });
        }

        if response.status >= 500 {
            return Err(ConnectorError::Connection {
                message: format!("http {}: {}", response.status, response.body),
                temporary: true,
            });
        }

        Err(self.adapter.classify_error(response.status, &response.body))
    }

    // ------------------------------------------------------------------
    // Typed operations (§6 REST surface)
    // ------------------------------------------------------------------

    pub async fn ping(&self, cancel: &CancellationToken) -> Result<()> {
        self.call(RestOp::Ping, HttpMethod::Get, self.adapter.ping_path(), vec![], false, true, cancel)
            .await
            .map(|_| ())
    }

    /// Uncircuited-from-the-breaker's-perspective is not true here — the
    /// breaker still wraps this call — but clock sync (§4.2) never signs
    /// this request, so it has no dependency on `ClockSync::now()` being
    /// accurate yet, breaking the circularity.
    pub async fn server_time(&self, cancel: &CancellationToken) -> Result<i64> {
        let body = self
            .call(RestOp::ServerTime, HttpMethod::Get, self.adapter.server_time_path(), vec![], false, true, cancel)
            .await?;
        self.adapter.parse_server_time(&body)
    }

    pub async fn exchange_info(&self, symbol: &Symbol, cancel: &CancellationToken) -> Result<SymbolInfo> {
        let params = vec![("symbol", crate::symbol::exchange_form(symbol))];
        let body = self
            .call(RestOp::ExchangeInfo, HttpMethod::Get, self.adapter.exchange_info_path(), params, false, true, cancel)
            .await?;
        self.adapter.parse_symbol_info(&body, symbol)
    }

    pub async fn order_book(
        &self,
        symbol: &Symbol,
        depth: u32,
        cancel: &CancellationToken,
    ) -> Result<OrderBookSnapshot> {
        let params = vec![
            ("symbol", crate::symbol::exchange_form(symbol)),
            ("limit", depth.to_string()),
        ];
        let body = self
            .call(RestOp::OrderBook, HttpMethod::Get, self.adapter.order_book_path(), params, false, true, cancel)
            .await?;
        self.adapter.parse_order_book(&body)
    }

    pub async fn place_order(&self, req: &PlaceOrderRequest, cancel: &CancellationToken) -> Result<Order> {
        let mut params = vec![
            ("symbol", crate::symbol::exchange_form(&req.symbol)),
            ("side", self.adapter.side_str(req.side).to_string()),
            ("type", self.adapter.order_type_str(req.order_type).to_string()),
            ("quantity", req.quantity.to_string()),
        ];
        if let Some(price) = req.price {
            params.push(("price", price.to_string()));
        }
        if let Some(tif) = req.time_in_force {
            params.push(("timeInForce", self.adapter.tif_str(tif).to_string()));
        }
        if let Some(coid) = &req.client_order_id {
            params.push(("newClientOrderId", coid.clone()));
        }
        // Client-id-tagged orders are idempotent from the caller's point of
        // view (§4.6 "applied only to idempotent or client-id-tagged
        // calls"): a retried place_order with the same client_order_id is
        // safe to resend because the venue itself deduplicates on it.
        let idempotent = req.client_order_id.is_some();
        let body = self
            .call(RestOp::PlaceOrder, HttpMethod::Post, self.adapter.place_order_path(), params, true, idempotent, cancel)
            .await?;
        self.adapter.parse_order(&body)
    }

    pub async fn cancel_order(&self, req: &CancelOrderRequest, cancel: &CancellationToken) -> Result<Order> {
        let mut params = vec![("symbol", crate::symbol::exchange_form(&req.symbol))];
        if let Some(id) = &req.order_id {
            params.push(("orderId", id.clone()));
        }
        if let Some(coid) = &req.client_order_id {
            params.push(("origClientOrderId", coid.clone()));
        }
        let body = self
            .call(RestOp::CancelOrder, HttpMethod::Delete, self.adapter.cancel_order_path(), params, true, true, cancel)
            .await?;
        self.adapter.parse_order(&body)
    }

    pub async fn get_order(&self, symbol: &Symbol, order_id: &str, cancel: &CancellationToken) -> Result<Order> {
        let params = vec![
            ("symbol", crate::symbol::exchange_form(symbol)),
            ("orderId", order_id.to_string()),
        ];
        let body = self
            .call(RestOp::GetOrder, HttpMethod::Get, self.adapter.get_order_path(), params, true, true, cancel)
            .await?;
        self.adapter.parse_order(&body)
    }

    pub async fn open_orders(&self, symbol: Option<&Symbol>, cancel: &CancellationToken) -> Result<Vec<Order>> {
        let params = match symbol {
            Some(s) => vec![("symbol", crate::symbol::exchange_form(s))],
            None => vec![],
        };
        let body = self
            .call(RestOp::OpenOrders, HttpMethod::Get, self.adapter.open_orders_path(), params, true, true, cancel)
            .await?;
        self.adapter.parse_orders(&body)
    }

    pub async fn balance(&self, asset: &str, cancel: &CancellationToken) -> Result<Balance> {
        let body = self
            .call(RestOp::Balance, HttpMethod::Get, self.adapter.balance_path(), vec![], true, true, cancel)
            .await?;
        self.adapter.parse_balance(&body, asset)
    }
}

/// Default depth requested when the WS layer resyncs a book after a gap
/// (§4.8 step 3). Deep enough to cover typical subscription depths; callers
/// needing a specific depth should call `order_book` directly instead.
const RESYNC_DEPTH: u32 = 1000;

#[async_trait::async_trait]
impl crate::ws::SnapshotSource for RestPipeline {
    async fn fetch_order_book_snapshot(&self, symbol: &Symbol) -> Result<OrderBookSnapshot> {
        // A resync fetch isn't tied to any one caller's cancellation scope;
        // the WS session's own `resync_book` loop already checks its root
        // token between attempts, so a fresh token here just bounds this one
        // call's retry/backoff loop rather than the whole resync.
        self.order_book(symbol, RESYNC_DEPTH, &CancellationToken::new()).await
    }
}

#[async_trait::async_trait]
impl crate::clock::ServerTimeSource for RestPipeline {
    async fn server_time_ms(&self) -> Result<i64> {
        // Same reasoning as the snapshot fetch above: the clock-sync task
        // owns its own retry/backoff cadence, so this call gets its own
        // short-lived token rather than threading one through.
        self.server_time(&CancellationToken::new()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decimal::dec;
    use crate::transport::HttpResponse;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;

    struct FakeTransport {
        responses: StdMutex<Vec<HttpResponse>>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl HttpTransport for FakeTransport {
        async fn send(&self, _req: HttpRequest) -> Result<HttpResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut guard = self.responses.lock().unwrap();
            if guard.is_empty() {
                panic!("fake transport ran out of canned responses");
            }
            Ok(guard.remove(0))
        }
    }

    fn ok(body: &str) -> HttpResponse {
        HttpResponse {
            status: 200,
            headers: HashMap::new(),
            body: body.to_string(),
        }
    }

    fn setup(responses: Vec<HttpResponse>) -> (RestPipeline, Arc<FakeTransport>) {
        let transport = Arc::new(FakeTransport {
            responses: StdMutex::new(responses),
            calls: AtomicU32::new(0),
        });
        let clock = Arc::new(ClockSync::new(
            Arc::new(crate::clock::SystemClock),
            crate::clock::ClockSyncConfig::default(),
        ));
        let nonce = Arc::new(NonceGenerator::new(clock.clone()));
        let limiter = Arc::new(WeightedBucket::new(1200));
        let breaker = Arc::new(CircuitBreaker::new(crate::circuit::CircuitBreakerConfig::default()));
        let adapter: Arc<dyn VenueAdapter> = Arc::new(binance::BinanceAdapter::new("secret".to_string()));

        let pipeline = RestPipeline::new(
            adapter,
            transport.clone(),
            clock,
            nonce,
            limiter,
            breaker,
            RestConfig::default(),
        );
        (pipeline, transport)
    }

    #[tokio::test]
    async fn ping_succeeds_on_2xx() {
        let (pipeline, _t) = setup(vec![ok("{}")]);
        pipeline.ping(&CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn rate_limit_status_is_classified_not_counted_as_failure() {
        let (pipeline, _t) = setup(vec![HttpResponse {
            status: 429,
            headers: HashMap::new(),
            body: String::new(),
        }]);
        let err = pipeline.ping(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ConnectorError::RateLimit { .. }));
    }

    #[tokio::test]
    async fn server_error_retries_idempotent_calls() {
        let (pipeline, transport) = setup(vec![
            HttpResponse {
                status: 500,
                headers: HashMap::new(),
                body: "boom".to_string(),
            },
            ok(r#"{"serverTime":1700000000000}"#),
        ]);
        let ts = pipeline.server_time(&CancellationToken::new()).await.unwrap();
        assert_eq!(ts, 1_700_000_000_000);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn order_book_snapshot_parses_levels() {
        let (pipeline, _t) = setup(vec![ok(
            r#"{"lastUpdateId":105,"bids":[["100.0","1.0"]],"asks":[["101.0","2.0"]]}"#,
        )]);
        let snap = pipeline
            .order_book(&crate::symbol::Symbol::new("BTC", "USDT"), 50, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(snap.last_update_id, 105);
        assert_eq!(snap.bids[0], (dec("100.0"), dec("1.0")));
        assert_eq!(snap.asks[0], (dec("101.0"), dec("2.0")));
    }
}
