// =============================================================================
// Handlers — user callback registration and panic-safe dispatch
// =============================================================================
//
// §6: "a single Handlers record with optional callbacks ... Nil callbacks
// are no-ops." §5/§7: "Every dispatch into user code is wrapped in a
// recovery boundary; a panic in one callback does not affect peers."
// =============================================================================

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::error;

use crate::circuit::CircuitState;
use crate::error::ConnectorError;
use crate::types::{Order, OrderBook, Ticker, Trade};

type TickerCb = Box<dyn Fn(Ticker) + Send + Sync>;
type OrderBookCb = Box<dyn Fn(OrderBook) + Send + Sync>;
type TradeCb = Box<dyn Fn(Trade) + Send + Sync>;
type OrderCb = Box<dyn Fn(Order) + Send + Sync>;
type ConnectCb = Box<dyn Fn() + Send + Sync>;
type DisconnectCb = Box<dyn Fn(Option<String>) + Send + Sync>;
type ErrorCb = Box<dyn Fn(ConnectorErrorSummary) + Send + Sync>;
type StateChangeCb = Box<dyn Fn(CircuitState, CircuitState) + Send + Sync>;

/// A cloneable, loggable summary of an error handed to `OnError`. We don't
/// hand the raw `ConnectorError` across the callback boundary because some
/// embedders store these for later display and `ConnectorError` is not
/// `Clone` (its transport variants wrap non-Clone upstream error types).
#[derive(Debug, Clone)]
pub struct ConnectorErrorSummary {
    pub message: String,
}

impl From<&ConnectorError> for ConnectorErrorSummary {
    fn from(err: &ConnectorError) -> Self {
        Self {
            message: err.to_string(),
        }
    }
}

/// User-supplied callback record (§6). Every field is optional; a `None`
/// (or never-registered) callback is a no-op, never a panic.
#[derive(Default)]
pub struct Handlers {
    pub on_ticker: Option<TickerCb>,
    pub on_order_book: Option<OrderBookCb>,
    pub on_trade: Option<TradeCb>,
    pub on_order: Option<OrderCb>,
    pub on_connect: Option<ConnectCb>,
    pub on_disconnect: Option<DisconnectCb>,
    pub on_error: Option<ErrorCb>,
    pub on_state_change: Option<StateChangeCb>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_ticker(mut self, f: impl Fn(Ticker) + Send + Sync + 'static) -> Self {
        self.on_ticker = Some(Box::new(f));
        self
    }
    pub fn on_order_book(mut self, f: impl Fn(OrderBook) + Send + Sync + 'static) -> Self {
        self.on_order_book = Some(Box::new(f));
        self
    }
    pub fn on_trade(mut self, f: impl Fn(Trade) + Send + Sync + 'static) -> Self {
        self.on_trade = Some(Box::new(f));
        self
    }
    pub fn on_order(mut self, f: impl Fn(Order) + Send + Sync + 'static) -> Self {
        self.on_order = Some(Box::new(f));
        self
    }
    pub fn on_connect(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Box::new(f));
        self
    }
    pub fn on_disconnect(mut self, f: impl Fn(Option<String>) + Send + Sync + 'static) -> Self {
        self.on_disconnect = Some(Box::new(f));
        self
    }
    pub fn on_error(mut self, f: impl Fn(ConnectorErrorSummary) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }
    pub fn on_state_change(
        mut self,
        f: impl Fn(CircuitState, CircuitState) + Send + Sync + 'static,
    ) -> Self {
        self.on_state_change = Some(Box::new(f));
        self
    }
}

/// Invoke `f` behind a panic recovery boundary, logging and swallowing any
/// panic instead of letting it unwind into the session read loop or the
/// connector's worker tasks (§4.7, §4.10, §7).
fn dispatch<F: FnOnce()>(context: &str, f: F) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
        let message = panic_message(&payload);
        error!(context, message = %message, "handler panicked — recovered, read loop continues");
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Shared dispatcher held by the connector and every subsystem that needs
/// to call into user code.
pub struct Dispatcher {
    handlers: Arc<parking_lot::RwLock<Handlers>>,
}

impl Dispatcher {
    pub fn new(handlers: Handlers) -> Self {
        Self {
            handlers: Arc::new(parking_lot::RwLock::new(handlers)),
        }
    }

    pub fn replace(&self, handlers: Handlers) {
        *self.handlers.write() = handlers;
    }

    pub fn ticker(&self, value: Ticker) {
        let guard = self.handlers.read();
        if let Some(cb) = &guard.on_ticker {
            dispatch("on_ticker", || cb(value));
        }
    }

    pub fn order_book(&self, value: OrderBook) {
        let guard = self.handlers.read();
        if let Some(cb) = &guard.on_order_book {
            dispatch("on_order_book", || cb(value));
        }
    }

    pub fn trade(&self, value: Trade) {
        let guard = self.handlers.read();
        if let Some(cb) = &guard.on_trade {
            dispatch("on_trade", || cb(value));
        }
    }

    pub fn order(&self, value: Order) {
        let guard = self.handlers.read();
        if let Some(cb) = &guard.on_order {
            dispatch("on_order", || cb(value));
        }
    }

    pub fn connect(&self) {
        let guard = self.handlers.read();
        if let Some(cb) = &guard.on_connect {
            dispatch("on_connect", || cb());
        }
    }

    pub fn disconnect(&self, reason: Option<String>) {
        let guard = self.handlers.read();
        if let Some(cb) = &guard.on_disconnect {
            dispatch("on_disconnect", || cb(reason));
        }
    }

    pub fn error(&self, err: &ConnectorError) {
        let summary = ConnectorErrorSummary::from(err);
        let guard = self.handlers.read();
        if let Some(cb) = &guard.on_error {
            dispatch("on_error", || cb(summary));
        }
    }

    pub fn state_change(&self, from: CircuitState, to: CircuitState) {
        let guard = self.handlers.read();
        if let Some(cb) = &guard.on_state_change {
            dispatch("on_state_change", || cb(from, to));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decimal::dec;
    use crate::symbol::Symbol;
    use crate::types::Exchange;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn sample_ticker() -> Ticker {
        Ticker {
            exchange: Exchange::Binance,
            symbol: Symbol::new("BTC", "USDT"),
            bid: dec("100"),
            ask: dec("101"),
            last: dec("100.5"),
            volume_24h: dec("10"),
            timestamp: chrono::Utc::now(),
        }
    }

    #[test]
    fn nil_callbacks_are_no_ops() {
        let dispatcher = Dispatcher::new(Handlers::new());
        dispatcher.ticker(sample_ticker());
        dispatcher.connect();
        dispatcher.disconnect(None);
    }

    #[test]
    fn panic_in_one_handler_does_not_escape() {
        let called = Arc::new(AtomicBool::new(false));
        let called2 = called.clone();
        let handlers = Handlers::new()
            .on_ticker(|_t| panic!("boom"))
            .on_connect(move || {
                called2.store(true, Ordering::SeqCst);
            });
        let dispatcher = Dispatcher::new(handlers);

        dispatcher.ticker(sample_ticker());
        dispatcher.connect();

        assert!(called.load(Ordering::SeqCst), "sibling callback still ran");
    }

    #[test]
    fn error_dispatch_carries_message() {
        let received = Arc::new(parking_lot::Mutex::new(None));
        let received2 = received.clone();
        let handlers = Handlers::new().on_error(move |e| {
            *received2.lock() = Some(e.message);
        });
        let dispatcher = Dispatcher::new(handlers);
        dispatcher.error(&ConnectorError::NotRunning);
        assert!(received.lock().as_ref().unwrap().contains("not running"));
    }
}
