// =============================================================================
// WebSocket session — dial, heartbeat, reconnect, subscription routing (C7)
// =============================================================================
//
// Reconnect/backoff is grounded on the `dawsh2-Torq` example's
// `services/adapters/src/input/connection.rs` `ConnectionManager`: the same
// connect/backoff/reconnect shape, generalized with jitter and with
// subscription restoration on every reconnect. Binance's "reconnect to add
// a subscription" and Bybit's dynamic subscribe/unsubscribe both implement
// the one `VenueWsAdapter` trait below.
//
// There is exactly one task driving connection attempts (`run`'s loop), so
// the reconnect is single-flight by construction: a second reconnect can
// never start while one is in flight, because nothing else calls `dial`.
// =============================================================================

pub mod binance;
pub mod bybit;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::error::{ConnectorError, Result};
use crate::handlers::Dispatcher;
use crate::orderbook::{BookDelta, DeltaOutcome, OrderBookRegistry};
use crate::orders::{OrderReducer, OrderUpdate};
use crate::rest::OrderBookSnapshot;
use crate::symbol::Symbol;
use crate::transport::{WsConnection, WsDialer, WsFrame};
use crate::types::{Exchange, Ticker, Trade};

/// One thing a caller can subscribe/unsubscribe to (§6 "Subscription").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Subscription {
    Ticker(Symbol),
    OrderBook(Symbol),
    Trade(Symbol),
}

/// A decoded WS message, venue-neutral (§4.7 "Read loop").
pub enum WsEvent {
    /// Subscribe/unsubscribe ack or other non-data control message.
    Control,
    Ticker(Ticker),
    Trade(Trade),
    BookDelta { symbol: Symbol, delta: BookDelta },
    Order(OrderUpdate),
    /// Recognized shape, not one we route anywhere (e.g. an unused channel).
    Unrecognized,
}

/// §4.7 "Heartbeat": the two venues have opposite liveness contracts.
pub enum HeartbeatPolicy {
    /// Server sends pings; we must pong within `read_deadline`'s tolerance.
    /// Any frame (not just a ping) resets the deadline.
    RespondToServerPing { read_deadline: Duration },
    /// We send `{"op":"ping"}` (or equivalent) every `interval` and expect a
    /// pong within `pong_deadline`.
    ClientPing { interval: Duration, pong_deadline: Duration },
}

/// Tunables from §6 `connection.*`.
#[derive(Debug, Clone)]
pub struct WsSessionConfig {
    pub connect_timeout: Duration,
    pub ping_interval: Duration,
    pub heartbeat_wait: Duration,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub close_wait: Duration,
}

impl Default for WsSessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(20),
            heartbeat_wait: Duration::from_secs(10),
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(60),
            close_wait: Duration::from_secs(30),
        }
    }
}

/// Everything that differs between Binance and Bybit at the WS layer: URL,
/// subscribe/unsubscribe wire form, heartbeat contract, and frame decoding.
#[async_trait]
pub trait VenueWsAdapter: Send + Sync {
    fn exchange(&self) -> Exchange;
    fn ws_url(&self) -> String;

    /// Binance requires a fresh connection to add a stream; Bybit can
    /// subscribe/unsubscribe on the live socket (§4.7 "Subscription model").
    fn supports_live_subscribe(&self) -> bool;

    fn subscribe_frame(&self, subs: &[Subscription]) -> WsFrame;
    fn unsubscribe_frame(&self, subs: &[Subscription]) -> WsFrame;

    fn heartbeat_policy(&self, config: &WsSessionConfig) -> HeartbeatPolicy;

    /// Decode one text frame. Parse errors are the caller's responsibility
    /// to log and drop (§7 "WS read-loop parse errors ... never terminate
    /// the session").
    fn parse_message(&self, text: &str) -> Result<WsEvent>;
}

/// Fetches a fresh REST snapshot to re-anchor an order book after a gap
/// (§4.8 steps 3-4). Implemented by `RestPipeline` (see `rest/mod.rs`) so
/// the book resync goes through the same clock/limiter/breaker gates as
/// every other REST call.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch_order_book_snapshot(&self, symbol: &Symbol) -> Result<OrderBookSnapshot>;
}

enum ControlMsg {
    Subscribe(Subscription),
    Unsubscribe(Subscription),
}

/// One venue connection plus its subscription set and reconnect policy. The
/// connector owns exactly one of these per instance (§3 "Ownership").
pub struct WsSession {
    adapter: Arc<dyn VenueWsAdapter>,
    dialer: Arc<dyn WsDialer>,
    config: WsSessionConfig,
    cancel: CancellationToken,
    dispatcher: Arc<Dispatcher>,
    books: Arc<OrderBookRegistry>,
    orders: Arc<OrderReducer>,
    snapshots: Arc<dyn SnapshotSource>,
    subscriptions: Mutex<HashSet<Subscription>>,
    connected: AtomicBool,
    control_tx: mpsc::UnboundedSender<ControlMsg>,
    control_rx: Mutex<Option<mpsc::UnboundedReceiver<ControlMsg>>>,
}

impl WsSession {
    pub fn new(
        adapter: Arc<dyn VenueWsAdapter>,
        dialer: Arc<dyn WsDialer>,
        config: WsSessionConfig,
        cancel: CancellationToken,
        dispatcher: Arc<Dispatcher>,
        books: Arc<OrderBookRegistry>,
        orders: Arc<OrderReducer>,
        snapshots: Arc<dyn SnapshotSource>,
    ) -> Arc<Self> {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            adapter,
            dialer,
            config,
            cancel,
            dispatcher,
            books,
            orders,
            snapshots,
            subscriptions: Mutex::new(HashSet::new()),
            connected: AtomicBool::new(false),
            control_tx,
            control_rx: Mutex::new(Some(control_rx)),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.subscriptions.lock().iter().cloned().collect()
    }

    /// Idempotent: subscribing to an already-subscribed stream is a no-op.
    pub fn subscribe(self: &Arc<Self>, sub: Subscription) {
        let added = self.subscriptions.lock().insert(sub.clone());
        if !added {
            return;
        }
        if let Subscription::OrderBook(symbol) = &sub {
            let this = self.clone();
            let symbol = symbol.clone();
            tokio::spawn(async move { this.resync_book(symbol).await });
        }
        let _ = self.control_tx.send(ControlMsg::Subscribe(sub));
    }

    /// Idempotent: unsubscribing twice is safe (§8 "unsubscribe(); unsubscribe() is safe").
    pub fn unsubscribe(&self, sub: Subscription) {
        let removed = self.subscriptions.lock().remove(&sub);
        if !removed {
            return;
        }
        let _ = self.control_tx.send(ControlMsg::Unsubscribe(sub));
    }

    /// §4.7 "Cancellation semantics": cancel the root context so the reconnect
    /// and read loops unwind promptly. The caller (`connector.rs`) bounds the
    /// wait on the `JoinHandle` returned by `run`.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Drives the dial/serve/reconnect loop until `shutdown()` is called.
    /// Must be called exactly once.
    pub fn run(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let mut control_rx = self
            .control_rx
            .lock()
            .take()
            .expect("WsSession::run called more than once");

        tokio::spawn(async move {
            let mut attempt: u32 = 0;
            loop {
                if self.cancel.is_cancelled() {
                    break;
                }

                match tokio::time::timeout(self.config.connect_timeout, self.dialer.dial(&self.adapter.ws_url())).await {
                    Ok(Ok(conn)) => {
                        attempt = 0;
                        let result = self.clone().serve_connection(conn, &mut control_rx).await;
                        self.connected.store(false, Ordering::SeqCst);
                        match result {
                            Ok(()) => self.dispatcher.disconnect(None),
                            Err(err) => {
                                self.dispatcher.disconnect(Some(err.to_string()));
                                self.dispatcher.error(&err);
                            }
                        }
                    }
                    Ok(Err(err)) => {
                        self.dispatcher.error(&err);
                    }
                    Err(_elapsed) => {
                        self.dispatcher.error(&ConnectorError::Connection {
                            message: "websocket connect timed out".to_string(),
                            temporary: true,
                        });
                    }
                }

                if self.cancel.is_cancelled() {
                    break;
                }

                let delay = backoff_delay(attempt, self.config.reconnect_base_delay, self.config.reconnect_max_delay);
                attempt = attempt.saturating_add(1);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting websocket session");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.cancel.cancelled() => break,
                }
            }
        })
    }

    #[instrument(skip(self, conn, control_rx), fields(exchange = %self.adapter.exchange()))]
    async fn serve_connection(
        self: Arc<Self>,
        mut conn: Box<dyn WsConnection>,
        control_rx: &mut mpsc::UnboundedReceiver<ControlMsg>,
    ) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        self.dispatcher.connect();

        let stored = self.subscriptions();
        if !stored.is_empty() {
            conn.send(self.adapter.subscribe_frame(&stored)).await?;
        }

        let policy = self.adapter.heartbeat_policy(&self.config);
        let (mut ping_ticker, read_deadline) = match &policy {
            HeartbeatPolicy::RespondToServerPing { read_deadline } => (None, *read_deadline),
            HeartbeatPolicy::ClientPing { interval, pong_deadline } => {
                (Some(tokio::time::interval(*interval)), *pong_deadline)
            }
        };

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = conn.close().await;
                    return Ok(());
                }

                maybe_ctl = control_rx.recv() => {
                    match maybe_ctl {
                        Some(ControlMsg::Subscribe(sub)) => {
                            if self.adapter.supports_live_subscribe() {
                                conn.send(self.adapter.subscribe_frame(&[sub])).await?;
                            } else {
                                debug!("subscription added on a venue without live subscribe — reconnecting with full set");
                                return Ok(());
                            }
                        }
                        Some(ControlMsg::Unsubscribe(sub)) => {
                            if self.adapter.supports_live_subscribe() {
                                conn.send(self.adapter.unsubscribe_frame(&[sub])).await?;
                            }
                            // Binance: removing from the stored set is enough; the
                            // stream simply won't be re-requested on the next connect.
                        }
                        None => {}
                    }
                }

                _ = async {
                    match ping_ticker.as_mut() {
                        Some(t) => { t.tick().await; }
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    conn.send(WsFrame::Ping(Vec::new())).await?;
                }

                frame = tokio::time::timeout(read_deadline, conn.recv()) => {
                    match frame {
                        Ok(Some(Ok(WsFrame::Ping(payload)))) => {
                            conn.send(WsFrame::Pong(payload)).await?;
                        }
                        Ok(Some(Ok(WsFrame::Pong(_)))) => {}
                        Ok(Some(Ok(WsFrame::Close))) => return Ok(()),
                        Ok(Some(Ok(WsFrame::Text(text)))) => {
                            self.handle_text(&text);
                        }
                        Ok(Some(Err(err))) => return Err(err),
                        Ok(None) => return Ok(()),
                        Err(_elapsed) => {
                            warn!("websocket read deadline elapsed — treating as disconnect");
                            return Err(ConnectorError::Connection {
                                message: "read deadline elapsed".to_string(),
                                temporary: true,
                            });
                        }
                    }
                }
            }
        }
    }

    fn handle_text(self: &Arc<Self>, text: &str) {
        match self.adapter.parse_message(text) {
            Ok(WsEvent::Control) | Ok(WsEvent::Unrecognized) => {}
            Ok(WsEvent::Ticker(ticker)) => self.dispatcher.ticker(ticker),
            Ok(WsEvent::Trade(trade)) => self.dispatcher.trade(trade),
            Ok(WsEvent::Order(update)) => {
                for outcome in self.orders.apply(update) {
                    if let crate::orders::ApplyOutcome::Applied(order) = outcome {
                        self.dispatcher.order(order);
                    }
                }
            }
            Ok(WsEvent::BookDelta { symbol, delta }) => {
                let sync = self.books.get_or_create(self.adapter.exchange(), &symbol);
                match sync.on_delta(delta) {
                    DeltaOutcome::Applied(book) => self.dispatcher.order_book(book),
                    DeltaOutcome::Buffered => {}
                    DeltaOutcome::GapDetected => {
                        let this = self.clone();
                        tokio::spawn(async move { this.resync_book(symbol).await });
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "dropping unparseable websocket frame");
            }
        }
    }

    /// §4.8 steps 3-4: fetch a fresh snapshot and fuse it with whatever
    /// deltas buffered while the fetch was in flight. Retries on gap or
    /// transport failure until canceled.
    async fn resync_book(self: Arc<Self>, symbol: Symbol) {
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            match self.snapshots.fetch_order_book_snapshot(&symbol).await {
                Ok(snapshot) => {
                    let sync = self.books.get_or_create(self.adapter.exchange(), &symbol);
                    match sync.on_snapshot(snapshot) {
                        DeltaOutcome::Applied(book) => {
                            self.dispatcher.order_book(book);
                            return;
                        }
                        DeltaOutcome::GapDetected => continue,
                        DeltaOutcome::Buffered => return,
                    }
                }
                Err(err) => {
                    self.dispatcher.error(&err);
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        _ = self.cancel.cancelled() => return,
                    }
                }
            }
        }
    }
}

/// `d_n = min(base * 2^n, max) + jitter(+-10%)` (§4.7).
fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exp = attempt.min(20);
    let scaled_ms = (base.as_millis() as u64).saturating_mul(1u64 << exp);
    let capped_ms = scaled_ms.min(max.as_millis() as u64);
    let jitter = (rand::random::<f64>() * 0.2) - 0.1;
    let jittered = (capped_ms as f64 * (1.0 + jitter)).max(0.0);
    Duration::from_millis(jittered as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_clamped_to_max() {
        let d = backoff_delay(10, Duration::from_secs(1), Duration::from_secs(60));
        assert!(d.as_millis() <= (60_000.0 * 1.1) as u128);
    }

    #[test]
    fn backoff_grows_with_attempt_before_clamp() {
        let small = backoff_delay(0, Duration::from_millis(100), Duration::from_secs(60));
        let bigger = backoff_delay(3, Duration::from_millis(100), Duration::from_secs(60));
        // 100ms*2^0=100ms vs 100ms*2^3=800ms, both +-10% jitter.
        assert!(bigger.as_millis() > small.as_millis());
    }
}
