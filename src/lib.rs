// =============================================================================
// venue_connector — resilient REST/WebSocket connectivity for one venue
// =============================================================================
//
// A `Connector` owns everything needed to talk to one exchange (Binance or
// Bybit) reliably: clock synchronization, nonce generation, rate-limit
// admission, a circuit breaker, a signed REST pipeline, a reconnecting
// WebSocket session, an order-book synchronizer, and an order state
// reducer. It does not place trading strategy, persistence, or a process
// entry point in scope — those live in the embedding application.
//
// ```no_run
// use venue_connector::{Connector, Config, ExchangeConfig, Exchange, Handlers};
//
// # async fn run() -> venue_connector::error::Result<()> {
// let cfg = Config::new(ExchangeConfig {
//     name: Exchange::Binance,
//     api_key: "...".to_string(),
//     api_secret: "...".to_string(),
//     testnet: true,
// });
// let handlers = Handlers::new().on_ticker(|t| println!("{t:?}"));
// let connector = Connector::new(cfg, handlers)?;
// connector.start()?;
// connector.ready().wait().await;
// # Ok(())
// # }
// ```
// =============================================================================

pub mod circuit;
pub mod clock;
pub mod connector;
pub mod decimal;
pub mod error;
pub mod handlers;
pub mod nonce;
pub mod orderbook;
pub mod orders;
pub mod ratelimit;
pub mod rest;
pub mod symbol;
pub mod transport;
pub mod types;
pub mod ws;

pub use circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitStats, CircuitState};
pub use connector::{
    CircuitConfig, ClockConfig, Config, ConnectionConfig, Connector, ExchangeConfig,
    RateLimitConfig, Ready, UnsubscribeToken,
};
pub use error::{ConnectorError, Result};
pub use handlers::{ConnectorErrorSummary, Handlers};
pub use rest::{CancelOrderRequest, PlaceOrderRequest};
pub use symbol::Symbol;
pub use types::{
    Balance, Exchange, Order, OrderBook, OrderStatus, OrderType, Side, SymbolInfo, Ticker,
    TimeInForce, Trade,
};
