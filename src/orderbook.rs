// =============================================================================
// Order-book synchronizer — REST snapshot + delta stream fusion (C8)
// =============================================================================
//
// Buffers deltas until a snapshot lands, discards the ones the snapshot
// already covers, verifies the sequence-id invariant on the first
// remaining delta, then applies in order and streams live thereafter. The
// symbol-keyed `RwLock<HashMap<...>>` registry shape is a common pattern
// for per-symbol shared state; here it holds a full sorted-levels book
// rather than a flattened best-bid/ask summary.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tracing::warn;

use crate::decimal::Decimal;
use crate::rest::OrderBookSnapshot;
use crate::symbol::Symbol;
use crate::types::{DecimalKey, Exchange, OrderBook};

/// An incremental book update, identified by `first_update_id..final_update_id`
/// (§4.8, GLOSSARY "Snapshot / delta").
#[derive(Debug, Clone)]
pub struct BookDelta {
    pub first_update_id: u64,
    pub final_update_id: u64,
    pub bids: Vec<(Decimal, Decimal)>,
    pub asks: Vec<(Decimal, Decimal)>,
    pub checksum: Option<u32>,
}

/// What happened when a delta or snapshot was fed to the synchronizer.
#[derive(Debug, Clone)]
pub enum DeltaOutcome {
    /// Still waiting on the initial REST snapshot; the delta was buffered.
    Buffered,
    /// Applied; here is the resulting book (a copy — §3 "Ownership").
    Applied(OrderBook),
    /// A sequence gap (or checksum mismatch) was detected. The synchronizer
    /// has reset to "awaiting snapshot"; the caller must fetch a fresh REST
    /// snapshot and feed it via `on_snapshot`.
    GapDetected,
}

enum SyncState {
    AwaitingSnapshot { buffer: Vec<BookDelta> },
    Synced { book: OrderBook, prev_final_update_id: u64 },
}

type ChecksumFn = dyn Fn(&OrderBook) -> u32 + Send + Sync;

/// Synchronizes one symbol's book. One instance per subscribed book; see
/// `OrderBookRegistry` below for the symbol-keyed map the connector holds.
pub struct OrderBookSynchronizer {
    exchange: Exchange,
    symbol: Symbol,
    state: Mutex<SyncState>,
    checksum_fn: Option<Box<ChecksumFn>>,
}

impl OrderBookSynchronizer {
    pub fn new(exchange: Exchange, symbol: Symbol) -> Self {
        Self {
            exchange,
            symbol,
            state: Mutex::new(SyncState::AwaitingSnapshot { buffer: Vec::new() }),
            checksum_fn: None,
        }
    }

    pub fn with_checksum(mut self, f: impl Fn(&OrderBook) -> u32 + Send + Sync + 'static) -> Self {
        self.checksum_fn = Some(Box::new(f));
        self
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn needs_snapshot(&self) -> bool {
        matches!(*self.state.lock(), SyncState::AwaitingSnapshot { .. })
    }

    /// Current book, if synchronized.
    pub fn book(&self) -> Option<OrderBook> {
        match &*self.state.lock() {
            SyncState::Synced { book, .. } => Some(book.clone()),
            SyncState::AwaitingSnapshot { .. } => None,
        }
    }

    fn fresh_book(&self) -> OrderBook {
        OrderBook::new(self.exchange, self.symbol.clone())
    }

    fn apply_delta_locked(book: &mut OrderBook, delta: &BookDelta) {
        for (price, qty) in &delta.bids {
            if qty.is_zero() {
                book.bids.remove(&DecimalKey(*price));
            } else {
                book.bids.insert(DecimalKey(*price), *qty);
            }
        }
        for (price, qty) in &delta.asks {
            if qty.is_zero() {
                book.asks.remove(&DecimalKey(*price));
            } else {
                book.asks.insert(DecimalKey(*price), *qty);
            }
        }
        book.sequence = delta.final_update_id;
        book.last_update_time = Utc::now();
        book.checksum = delta.checksum;
    }

    /// §4.8 step 2: buffer deltas arriving before the snapshot; §4.8 steps
    /// 5/7: apply live deltas once synced, restarting on a sequence gap or
    /// checksum mismatch.
    pub fn on_delta(&self, delta: BookDelta) -> DeltaOutcome {
        let mut state = self.state.lock();
        match &mut *state {
            SyncState::AwaitingSnapshot { buffer } => {
                buffer.push(delta);
                DeltaOutcome::Buffered
            }
            SyncState::Synced { book, prev_final_update_id } => {
                if delta.first_update_id != *prev_final_update_id + 1 {
                    warn!(
                        exchange = %self.exchange,
                        symbol = %self.symbol,
                        expected = *prev_final_update_id + 1,
                        got = delta.first_update_id,
                        "order book sequence gap — resyncing"
                    );
                    *state = SyncState::AwaitingSnapshot { buffer: Vec::new() };
                    return DeltaOutcome::GapDetected;
                }

                Self::apply_delta_locked(book, &delta);

                if let (Some(expected), Some(checker)) = (delta.checksum, &self.checksum_fn) {
                    if checker(book) != expected {
                        warn!(exchange = %self.exchange, symbol = %self.symbol, "order book checksum mismatch — resyncing");
                        *state = SyncState::AwaitingSnapshot { buffer: Vec::new() };
                        return DeltaOutcome::GapDetected;
                    }
                }

                DeltaOutcome::Applied(book.clone())
            }
        }
    }

    /// §4.8 steps 3-5: fuse a freshly fetched REST snapshot with whatever
    /// deltas were buffered while the fetch was in flight.
    pub fn on_snapshot(&self, snapshot: OrderBookSnapshot) -> DeltaOutcome {
        let mut state = self.state.lock();
        let buffer = match &mut *state {
            SyncState::AwaitingSnapshot { buffer } => std::mem::take(buffer),
            SyncState::Synced { .. } => Vec::new(),
        };

        let s = snapshot.last_update_id;
        let remaining: Vec<BookDelta> = buffer.into_iter().filter(|d| d.final_update_id > s).collect();

        let mut book = self.fresh_book();
        for (price, qty) in snapshot.bids {
            if !qty.is_zero() {
                book.bids.insert(DecimalKey(price), qty);
            }
        }
        for (price, qty) in snapshot.asks {
            if !qty.is_zero() {
                book.asks.insert(DecimalKey(price), qty);
            }
        }
        book.sequence = s;
        book.last_update_time = Utc::now();

        if remaining.is_empty() {
            *state = SyncState::Synced { book: book.clone(), prev_final_update_id: s };
            return DeltaOutcome::Applied(book);
        }

        let first = &remaining[0];
        if !(first.first_update_id <= s + 1 && s + 1 <= first.final_update_id) {
            warn!(
                exchange = %self.exchange,
                symbol = %self.symbol,
                snapshot_id = s,
                "snapshot does not overlap buffered deltas — discarding and restarting"
            );
            *state = SyncState::AwaitingSnapshot { buffer: Vec::new() };
            return DeltaOutcome::GapDetected;
        }

        let mut prev = s;
        for delta in &remaining {
            if delta.first_update_id != prev + 1 {
                warn!(exchange = %self.exchange, symbol = %self.symbol, "gap within buffered deltas — restarting");
                *state = SyncState::AwaitingSnapshot { buffer: Vec::new() };
                return DeltaOutcome::GapDetected;
            }
            Self::apply_delta_locked(&mut book, delta);
            prev = delta.final_update_id;
        }

        *state = SyncState::Synced { book: book.clone(), prev_final_update_id: prev };
        DeltaOutcome::Applied(book)
    }
}

/// Symbol-keyed registry of synchronizers, the connector's book map (§3
/// "Connector runtime state"). Mutation happens through single-owner
/// dispatch (§5 "Shared-resource policy"); reads are copy-out.
pub struct OrderBookRegistry {
    books: RwLock<HashMap<Symbol, Arc<OrderBookSynchronizer>>>,
}

impl OrderBookRegistry {
    pub fn new() -> Self {
        Self { books: RwLock::new(HashMap::new()) }
    }

    pub fn get_or_create(&self, exchange: Exchange, symbol: &Symbol) -> Arc<OrderBookSynchronizer> {
        if let Some(existing) = self.books.read().get(symbol) {
            return existing.clone();
        }
        let mut guard = self.books.write();
        guard
            .entry(symbol.clone())
            .or_insert_with(|| Arc::new(OrderBookSynchronizer::new(exchange, symbol.clone())))
            .clone()
    }

    pub fn remove(&self, symbol: &Symbol) {
        self.books.write().remove(symbol);
    }

    pub fn snapshot(&self, symbol: &Symbol) -> Option<OrderBook> {
        self.books.read().get(symbol).and_then(|s| s.book())
    }
}

impl Default for OrderBookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decimal::dec;

    fn delta(first: u64, final_id: u64) -> BookDelta {
        BookDelta {
            first_update_id: first,
            final_update_id: final_id,
            bids: vec![(dec("100"), dec("1"))],
            asks: vec![(dec("101"), dec("1"))],
            checksum: None,
        }
    }

    fn snapshot(last_update_id: u64) -> OrderBookSnapshot {
        OrderBookSnapshot {
            last_update_id,
            bids: vec![(dec("100"), dec("1"))],
            asks: vec![(dec("101"), dec("1"))],
        }
    }

    #[test]
    fn buffers_deltas_until_snapshot_arrives() {
        let sync = OrderBookSynchronizer::new(Exchange::Binance, Symbol::new("BTC", "USDT"));
        assert!(matches!(sync.on_delta(delta(101, 101)), DeltaOutcome::Buffered));
        assert!(sync.needs_snapshot());
    }

    #[test]
    fn spec_scenario_3_discards_covered_deltas_and_applies_remainder() {
        // §8 scenario 3: deltas 101..110, snapshot last_update_id=105.
        let sync = OrderBookSynchronizer::new(Exchange::Binance, Symbol::new("BTC", "USDT"));
        for i in 101..=110u64 {
            sync.on_delta(delta(i, i));
        }
        let outcome = sync.on_snapshot(snapshot(105));
        assert!(matches!(outcome, DeltaOutcome::Applied(_)));
        assert!(!sync.needs_snapshot());
        assert_eq!(sync.book().unwrap().sequence, 110);

        // A subsequent delta with a gap (112 instead of 111) triggers resync.
        let outcome = sync.on_delta(delta(112, 112));
        assert!(matches!(outcome, DeltaOutcome::GapDetected));
        assert!(sync.needs_snapshot());
    }

    #[test]
    fn non_overlapping_snapshot_restarts() {
        let sync = OrderBookSynchronizer::new(Exchange::Binance, Symbol::new("BTC", "USDT"));
        sync.on_delta(delta(200, 205));
        // Snapshot id 50 doesn't reach the first buffered delta's range.
        let outcome = sync.on_snapshot(snapshot(50));
        assert!(matches!(outcome, DeltaOutcome::GapDetected));
        assert!(sync.needs_snapshot());
    }

    #[test]
    fn quantity_zero_removes_level() {
        let sync = OrderBookSynchronizer::new(Exchange::Binance, Symbol::new("BTC", "USDT"));
        sync.on_snapshot(snapshot(1));
        let mut removal = delta(2, 2);
        removal.bids = vec![(dec("100"), dec("0"))];
        removal.asks = vec![];
        let outcome = sync.on_delta(removal);
        match outcome {
            DeltaOutcome::Applied(book) => assert!(book.best_bid().is_none()),
            _ => panic!("expected applied"),
        }
    }

    #[test]
    fn invariant_best_bid_never_exceeds_best_ask_after_sync() {
        let sync = OrderBookSynchronizer::new(Exchange::Binance, Symbol::new("BTC", "USDT"));
        sync.on_snapshot(snapshot(1));
        let book = sync.book().unwrap();
        assert!(!book.is_crossed());
    }

    #[test]
    fn registry_reuses_existing_synchronizer() {
        let registry = OrderBookRegistry::new();
        let sym = Symbol::new("BTC", "USDT");
        let a = registry.get_or_create(Exchange::Binance, &sym);
        let b = registry.get_or_create(Exchange::Binance, &sym);
        assert!(Arc::ptr_eq(&a, &b));
    }
}
