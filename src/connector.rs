// =============================================================================
// Connector — owns C2-C9 for one venue and exposes the embedder-facing API
// =============================================================================
//
// One `Connector` speaks to exactly one venue. `new` builds every
// subsystem (clock sync, nonce, limiter, breaker, REST pipeline, WS
// session) but starts nothing; `start` spawns the long-running tasks and
// returns immediately; `stop` is idempotent and bounds shutdown to 30s.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitStats};
use crate::clock::{ClockSync, ClockSyncConfig, SystemClock};
use crate::error::{ConnectorError, Result};
use crate::handlers::{Dispatcher, Handlers};
use crate::nonce::NonceGenerator;
use crate::orderbook::OrderBookRegistry;
use crate::orders::OrderReducer;
use crate::ratelimit::WeightedBucket;
use crate::rest::binance::BinanceAdapter;
use crate::rest::bybit::BybitAdapter;
use crate::rest::{CancelOrderRequest, PlaceOrderRequest, RestConfig, RestPipeline, VenueAdapter};
use crate::symbol::Symbol;
use crate::transport::{ReqwestTransport, TungsteniteDialer};
use crate::types::{Balance, Exchange, Order, SymbolInfo};
use crate::ws::binance::BinanceWsAdapter;
use crate::ws::bybit::BybitWsAdapter;
use crate::ws::{Subscription, VenueWsAdapter, WsSession, WsSessionConfig};

fn default_true() -> bool {
    true
}
fn default_max_weight() -> u32 {
    1200
}
fn default_max_failures() -> u32 {
    5
}
fn default_success_threshold() -> u32 {
    3
}
fn default_open_timeout_ms() -> u64 {
    30_000
}
fn default_max_offset_ms() -> u64 {
    500
}
fn default_sync_interval_ms() -> u64 {
    300_000
}
fn default_connection_timeout_ms() -> u64 {
    10_000
}
fn default_ping_interval_ms() -> u64 {
    20_000
}
fn default_reconnect_delay_ms() -> u64 {
    1_000
}
fn default_max_reconnect_wait_ms() -> u64 {
    60_000
}

/// `exchange.*` — identity fields, no defaults: a connector with no venue
/// or credentials isn't a meaningful configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExchangeConfig {
    pub name: Exchange,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    #[serde(default)]
    pub testnet: bool,
}

/// `rate_limit.*`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    #[serde(default = "default_max_weight")]
    pub max_weight: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_weight: default_max_weight(),
            enabled: true,
        }
    }
}

/// `circuit.*`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CircuitConfig {
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            max_failures: default_max_failures(),
            success_threshold: default_success_threshold(),
            open_timeout_ms: default_open_timeout_ms(),
        }
    }
}

/// `clock.*`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClockConfig {
    #[serde(default = "default_max_offset_ms")]
    pub max_offset_ms: u64,
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            max_offset_ms: default_max_offset_ms(),
            sync_interval_ms: default_sync_interval_ms(),
        }
    }
}

/// `connection.*`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionConfig {
    #[serde(default = "default_connection_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_max_reconnect_wait_ms")]
    pub max_reconnect_wait_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_connection_timeout_ms(),
            ping_interval_ms: default_ping_interval_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            max_reconnect_wait_ms: default_max_reconnect_wait_ms(),
        }
    }
}

/// The connector's configuration record. Deserializable so an embedder can
/// load it from their own config source, but this crate never reads a
/// file, env var, or CLI flag itself — loading is the embedder's job.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub circuit: CircuitConfig,
    #[serde(default)]
    pub clock: ClockConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
}

impl Config {
    pub fn new(exchange: ExchangeConfig) -> Self {
        Self {
            exchange,
            rate_limit: RateLimitConfig::default(),
            circuit: CircuitConfig::default(),
            clock: ClockConfig::default(),
            connection: ConnectionConfig::default(),
        }
    }

    /// Eager validation invoked from `Connector::new`. Rejects out-of-range
    /// tunables before any I/O is attempted.
    pub fn validate(&self) -> Result<()> {
        let field_err = |field: &str, value: String, constraint: &str| ConnectorError::Configuration(format!(
            "field={field} value={value} constraint={constraint}"
        ));

        if self.rate_limit.max_weight == 0 {
            return Err(field_err("rate_limit.max_weight", "0".to_string(), "must be > 0"));
        }
        if self.circuit.max_failures == 0 {
            return Err(field_err("circuit.max_failures", "0".to_string(), "must be > 0"));
        }
        if self.circuit.success_threshold == 0 {
            return Err(field_err("circuit.success_threshold", "0".to_string(), "must be > 0"));
        }
        if self.circuit.open_timeout_ms == 0 {
            return Err(field_err("circuit.open_timeout_ms", "0".to_string(), "must be > 0"));
        }
        if self.clock.max_offset_ms == 0 {
            return Err(field_err("clock.max_offset_ms", "0".to_string(), "must be > 0"));
        }
        if self.clock.sync_interval_ms == 0 {
            return Err(field_err("clock.sync_interval_ms", "0".to_string(), "must be > 0"));
        }
        if self.connection.timeout_ms == 0 {
            return Err(field_err("connection.timeout_ms", "0".to_string(), "must be > 0"));
        }
        if self.connection.ping_interval_ms == 0 {
            return Err(field_err("connection.ping_interval_ms", "0".to_string(), "must be > 0"));
        }
        if self.connection.reconnect_delay_ms == 0 {
            return Err(field_err("connection.reconnect_delay_ms", "0".to_string(), "must be > 0"));
        }
        if self.connection.max_reconnect_wait_ms < self.connection.reconnect_delay_ms {
            return Err(field_err(
                "connection.max_reconnect_wait_ms",
                self.connection.max_reconnect_wait_ms.to_string(),
                "must be >= connection.reconnect_delay_ms",
            ));
        }
        Ok(())
    }
}

/// A one-shot, multi-waiter latch closed on the session's first `Connected`
/// (§6 `Ready()`).
pub struct Ready {
    ready: AtomicBool,
    notify: Notify,
}

impl Ready {
    fn new() -> Self {
        Self {
            ready: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    fn set(&self) {
        if !self.ready.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Waits until the latch closes. Safe to call from multiple tasks and
    /// safe to call after the latch is already closed.
    pub async fn wait(&self) {
        if self.is_ready() {
            return;
        }
        loop {
            let notified = self.notify.notified();
            if self.is_ready() {
                return;
            }
            notified.await;
            if self.is_ready() {
                return;
            }
        }
    }
}

/// An idempotent handle to revoke one subscription (§3 "Ownership",
/// §9 "unsubscribe tokens hold only a symbol key plus a weak reference to
/// the session"). Holding this token does not keep the connector alive.
pub struct UnsubscribeToken {
    session: Weak<WsSession>,
    subscription: Subscription,
}

impl UnsubscribeToken {
    /// Safe to call more than once, and safe to call after the connector
    /// has stopped (the weak reference simply fails to upgrade).
    pub fn unsubscribe(&self) {
        if let Some(session) = self.session.upgrade() {
            session.unsubscribe(self.subscription.clone());
        }
    }
}

fn build_rest_adapter(cfg: &ExchangeConfig) -> Arc<dyn VenueAdapter> {
    match cfg.name {
        Exchange::Binance => {
            if cfg.testnet {
                Arc::new(BinanceAdapter::testnet(cfg.api_secret.clone(), cfg.api_key.clone()))
            } else {
                Arc::new(BinanceAdapter::with_base_url(
                    cfg.api_secret.clone(),
                    cfg.api_key.clone(),
                    "https://api.binance.com".to_string(),
                ))
            }
        }
        Exchange::Bybit => {
            if cfg.testnet {
                Arc::new(BybitAdapter::testnet(cfg.api_secret.clone(), cfg.api_key.clone()))
            } else {
                Arc::new(BybitAdapter::new(cfg.api_secret.clone(), cfg.api_key.clone()))
            }
        }
    }
}

fn build_ws_adapter(cfg: &ExchangeConfig) -> Arc<dyn VenueWsAdapter> {
    match cfg.name {
        Exchange::Binance => {
            if cfg.testnet {
                Arc::new(BinanceWsAdapter::testnet())
            } else {
                Arc::new(BinanceWsAdapter::new())
            }
        }
        Exchange::Bybit => {
            if cfg.testnet {
                Arc::new(BybitWsAdapter::testnet())
            } else {
                Arc::new(BybitWsAdapter::new())
            }
        }
    }
}

/// A supervised, single-venue connector. Owns C2-C9 exclusively (§3
/// "Ownership") and is the only embedder-facing type in this crate.
pub struct Connector {
    exchange: Exchange,
    clock: Arc<ClockSync>,
    limiter: Arc<WeightedBucket>,
    breaker: Arc<CircuitBreaker>,
    rest: Arc<RestPipeline>,
    ws: Arc<WsSession>,
    books: Arc<OrderBookRegistry>,
    orders: Arc<OrderReducer>,
    root_cancel: CancellationToken,
    running: AtomicBool,
    ready: Arc<Ready>,
    sync_interval: Duration,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Connector {
    /// Validates `cfg` eagerly and builds every subsystem. Does not dial or
    /// spawn anything — call `start()` for that.
    pub fn new(cfg: Config, handlers: Handlers) -> Result<Arc<Self>> {
        cfg.validate()?;

        let ready = Arc::new(Ready::new());
        let mut handlers = handlers;
        let user_on_connect = handlers.on_connect.take();
        let ready_for_connect = ready.clone();
        handlers.on_connect = Some(Box::new(move || {
            ready_for_connect.set();
            if let Some(cb) = &user_on_connect {
                cb();
            }
        }));

        let dispatcher = Arc::new(Dispatcher::new(handlers));

        let clock = Arc::new(ClockSync::new(
            Arc::new(SystemClock),
            ClockSyncConfig {
                max_offset: Duration::from_millis(cfg.clock.max_offset_ms),
                sync_interval: Duration::from_millis(cfg.clock.sync_interval_ms),
            },
        ));
        let nonce = Arc::new(NonceGenerator::new(clock.clone()));

        // §4.4: "rate_limit.enabled=false" bypasses admission entirely; the
        // simplest faithful way to express "no limiting" through the same
        // bucket type is a bucket whose capacity can never be exhausted.
        let effective_max_weight = if cfg.rate_limit.enabled { cfg.rate_limit.max_weight } else { u32::MAX };
        let limiter = Arc::new(WeightedBucket::new(effective_max_weight));

        let dispatcher_for_breaker = dispatcher.clone();
        let breaker = Arc::new(
            CircuitBreaker::new(CircuitBreakerConfig {
                max_failures: cfg.circuit.max_failures,
                success_threshold: cfg.circuit.success_threshold,
                open_timeout: Duration::from_millis(cfg.circuit.open_timeout_ms),
            })
            .with_observer(Box::new(move |from, to| {
                dispatcher_for_breaker.state_change(from, to);
            })),
        );

        let rest_adapter = build_rest_adapter(&cfg.exchange);
        let transport = Arc::new(ReqwestTransport::new());
        let rest = Arc::new(RestPipeline::new(
            rest_adapter,
            transport,
            clock.clone(),
            nonce.clone(),
            limiter.clone(),
            breaker.clone(),
            RestConfig {
                request_timeout: Duration::from_millis(cfg.connection.timeout_ms),
                ..RestConfig::default()
            },
        ));

        let books = Arc::new(OrderBookRegistry::new());
        let orders = Arc::new(OrderReducer::new());
        let root_cancel = CancellationToken::new();

        let ws_adapter = build_ws_adapter(&cfg.exchange);
        let ws = WsSession::new(
            ws_adapter,
            Arc::new(TungsteniteDialer),
            WsSessionConfig {
                connect_timeout: Duration::from_millis(cfg.connection.timeout_ms),
                ping_interval: Duration::from_millis(cfg.connection.ping_interval_ms),
                heartbeat_wait: Duration::from_millis(cfg.connection.timeout_ms),
                reconnect_base_delay: Duration::from_millis(cfg.connection.reconnect_delay_ms),
                reconnect_max_delay: Duration::from_millis(cfg.connection.max_reconnect_wait_ms),
                close_wait: Duration::from_secs(30),
            },
            root_cancel.clone(),
            dispatcher,
            books.clone(),
            orders.clone(),
            rest.clone(),
        );

        Ok(Arc::new(Self {
            exchange: cfg.exchange.name,
            clock,
            limiter,
            breaker,
            rest,
            ws,
            books,
            orders,
            root_cancel,
            running: AtomicBool::new(false),
            ready,
            sync_interval: Duration::from_millis(cfg.clock.sync_interval_ms),
            tasks: parking_lot::Mutex::new(Vec::new()),
        }))
    }

    /// Spawns the clock-sync ticker and the WS session's dial loop, then
    /// returns immediately (§4.10).
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(exchange = %self.exchange, "starting connector");

        let this = self.clone();
        let clock_task = tokio::spawn(async move { this.run_clock_sync().await });

        let ws_task = self.ws.clone().run();

        let mut tasks = self.tasks.lock();
        tasks.push(clock_task);
        tasks.push(ws_task);
        Ok(())
    }

    async fn run_clock_sync(self: Arc<Self>) {
        let mut backoff = Duration::from_secs(1);
        loop {
            match self.clock.sync_once(self.rest.as_ref()).await {
                Ok(offset) => {
                    backoff = Duration::from_secs(1);
                    tracing::debug!(offset_ms = offset, "clock sync succeeded");
                    tokio::select! {
                        _ = tokio::time::sleep(self.sync_interval) => {}
                        _ = self.root_cancel.cancelled() => return,
                    }
                }
                Err(err) => {
                    warn!(error = %err, "clock sync failed — retrying with backoff");
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = self.root_cancel.cancelled() => return,
                    }
                    backoff = (backoff * 2).min(self.sync_interval);
                }
            }
            if self.root_cancel.is_cancelled() {
                return;
            }
        }
    }

    /// Idempotent: a second call returns `Ok(())` without side effects.
    pub async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        info!(exchange = %self.exchange, "stopping connector");
        self.root_cancel.cancel();
        self.ws.shutdown();

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        let join_all = futures_util::future::join_all(tasks);
        if tokio::time::timeout(Duration::from_secs(30), join_all).await.is_err() {
            warn!("connector shutdown exceeded 30s bound — worker tasks may still be unwinding");
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.ws.is_connected()
    }

    pub fn ready(&self) -> Arc<Ready> {
        self.ready.clone()
    }

    pub fn circuit_stats(&self) -> CircuitStats {
        self.breaker.stats()
    }

    pub fn clock_offset_ms(&self) -> i64 {
        self.clock.offset_ms()
    }

    fn require_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(ConnectorError::NotRunning)
        }
    }

    // ------------------------------------------------------------------
    // Subscriptions (§6)
    // ------------------------------------------------------------------

    pub fn subscribe_ticker(&self, symbol: Symbol) -> Result<UnsubscribeToken> {
        self.require_running()?;
        let sub = Subscription::Ticker(symbol);
        self.ws.subscribe(sub.clone());
        Ok(UnsubscribeToken { session: Arc::downgrade(&self.ws), subscription: sub })
    }

    pub fn subscribe_order_book(&self, symbol: Symbol) -> Result<UnsubscribeToken> {
        self.require_running()?;
        let sub = Subscription::OrderBook(symbol);
        self.ws.subscribe(sub.clone());
        Ok(UnsubscribeToken { session: Arc::downgrade(&self.ws), subscription: sub })
    }

    pub fn subscribe_trades(&self, symbol: Symbol) -> Result<UnsubscribeToken> {
        self.require_running()?;
        let sub = Subscription::Trade(symbol);
        self.ws.subscribe(sub.clone());
        Ok(UnsubscribeToken { session: Arc::downgrade(&self.ws), subscription: sub })
    }

    // ------------------------------------------------------------------
    // REST (§6)
    // ------------------------------------------------------------------

    pub async fn ping(&self, ctx: &CancellationToken) -> Result<()> {
        self.require_running()?;
        self.rest.ping(ctx).await
    }

    pub async fn get_server_time(&self, ctx: &CancellationToken) -> Result<i64> {
        self.require_running()?;
        self.rest.server_time(ctx).await
    }

    pub async fn get_exchange_info(&self, symbol: &Symbol, ctx: &CancellationToken) -> Result<SymbolInfo> {
        self.require_running()?;
        self.rest.exchange_info(symbol, ctx).await
    }

    pub async fn place_order(&self, req: &PlaceOrderRequest, ctx: &CancellationToken) -> Result<Order> {
        self.require_running()?;
        self.rest.place_order(req, ctx).await
    }

    pub async fn cancel_order(&self, req: &CancelOrderRequest, ctx: &CancellationToken) -> Result<Order> {
        self.require_running()?;
        self.rest.cancel_order(req, ctx).await
    }

    pub async fn get_order(&self, symbol: &Symbol, order_id: &str, ctx: &CancellationToken) -> Result<Order> {
        self.require_running()?;
        self.rest.get_order(symbol, order_id, ctx).await
    }

    pub async fn open_orders(&self, symbol: Option<&Symbol>, ctx: &CancellationToken) -> Result<Vec<Order>> {
        self.require_running()?;
        self.rest.open_orders(symbol, ctx).await
    }

    pub async fn balance(&self, asset: &str, ctx: &CancellationToken) -> Result<Balance> {
        self.require_running()?;
        self.rest.balance(asset, ctx).await
    }

    // ------------------------------------------------------------------
    // Local reads — the connector's own in-memory order/book maps, no I/O.
    // ------------------------------------------------------------------

    pub fn cached_order_book(&self, symbol: &Symbol) -> Option<crate::types::OrderBook> {
        self.books.snapshot(symbol)
    }

    pub fn cached_order(&self, order_id: &str) -> Option<Order> {
        self.orders.get(self.exchange, order_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> Config {
        Config::new(ExchangeConfig {
            name: Exchange::Binance,
            api_key: "key".to_string(),
            api_secret: "secret".to_string(),
            testnet: true,
        })
    }

    #[test]
    fn default_config_validates() {
        sample_config().validate().unwrap();
    }

    #[test]
    fn zero_max_weight_is_rejected() {
        let mut cfg = sample_config();
        cfg.rate_limit.max_weight = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn max_reconnect_wait_below_delay_is_rejected() {
        let mut cfg = sample_config();
        cfg.connection.max_reconnect_wait_ms = 100;
        cfg.connection.reconnect_delay_ms = 1000;
        assert!(cfg.validate().is_err());
    }

    #[tokio::test]
    async fn rest_calls_fail_before_start() {
        let connector = Connector::new(sample_config(), Handlers::new()).unwrap();
        let err = connector.ping(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ConnectorError::NotRunning));
    }

    #[tokio::test]
    async fn subscribe_fails_before_start() {
        let connector = Connector::new(sample_config(), Handlers::new()).unwrap();
        let err = connector.subscribe_ticker(Symbol::new("BTC", "USDT")).unwrap_err();
        assert!(matches!(err, ConnectorError::NotRunning));
    }

    #[tokio::test]
    async fn stop_is_idempotent_before_start() {
        let connector = Connector::new(sample_config(), Handlers::new()).unwrap();
        connector.stop().await.unwrap();
        connector.stop().await.unwrap();
    }

    #[tokio::test]
    async fn start_then_stop_is_idempotent_and_tears_down_workers() {
        let connector = Connector::new(sample_config(), Handlers::new()).unwrap();
        connector.start().unwrap();
        connector.start().unwrap();
        assert!(connector.is_running());
        connector.stop().await.unwrap();
        connector.stop().await.unwrap();
        assert!(!connector.is_running());
    }

    #[tokio::test]
    async fn unsubscribe_token_is_safe_after_connector_drop() {
        let connector = Connector::new(sample_config(), Handlers::new()).unwrap();
        connector.start().unwrap();
        let token = connector.subscribe_ticker(Symbol::new("BTC", "USDT")).unwrap();
        drop(connector);
        token.unsubscribe();
        token.unsubscribe();
    }
}
