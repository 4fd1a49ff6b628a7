// =============================================================================
// Order state reducer — validated transitions with update-id dedup (C9)
// =============================================================================
//
// `parking_lot::RwLock<HashMap<...>>` for shared state, `tracing::warn!` on
// rejected transitions rather than mutating state on a bad update.
// =============================================================================

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;
use tracing::warn;

use crate::types::{Exchange, Order, OrderStatus};

/// One order update from the exchange, carrying the monotonic `update_id`
/// (or equivalent marker) §4.9 keys dedup and ordering on.
#[derive(Debug, Clone)]
pub struct OrderUpdate {
    pub update_id: u64,
    pub order: Order,
}

/// What happened to a single update_id when fed to the reducer.
#[derive(Debug, Clone)]
pub enum ApplyOutcome {
    /// Applied; this is the order's new state (a copy).
    Applied(Order),
    /// `update_id <= last_seen` for this order — already processed.
    DuplicateDropped,
    /// `update_id` is ahead of `last_seen + 1`; held until the gap closes.
    Buffered,
    /// The proposed `(from, to)` pair isn't in the allowed table (§4.9).
    /// The update_id is still marked seen; the order is not mutated.
    InvalidTransitionRejected { from: OrderStatus, to: OrderStatus },
}

/// §4.9 transition table. `from == to` is always allowed (a repeated
/// snapshot of the same status, e.g. two same-status fill events while
/// quantity fields still change) provided `from` isn't terminal.
fn allowed_transition(from: OrderStatus, to: OrderStatus) -> bool {
    if from.is_terminal() {
        return false;
    }
    if from == to {
        return true;
    }
    use OrderStatus::*;
    matches!(
        (from, to),
        (New, Pending | PartiallyFilled | Filled | Rejected)
            | (Pending, PartiallyFilled | Filled | Canceling | Rejected)
            | (PartiallyFilled, Filled | Canceling | Canceled)
            | (Canceling, Canceled | PartiallyFilled | Filled)
    )
}

struct Entry {
    last_seen: u64,
    current: Option<Order>,
    buffer: BTreeMap<u64, OrderUpdate>,
}

impl Entry {
    fn new() -> Self {
        Self { last_seen: 0, current: None, buffer: BTreeMap::new() }
    }
}

type OrderKey = (Exchange, String);

/// Applies exchange order updates through the validated state machine,
/// deduplicating by `update_id` per `(exchange, order_id)` (§4.9, §3
/// "Order"). Holds the connector's active order map.
pub struct OrderReducer {
    orders: RwLock<HashMap<OrderKey, Entry>>,
    client_id_index: RwLock<HashMap<(Exchange, String), String>>,
}

impl OrderReducer {
    pub fn new() -> Self {
        Self {
            orders: RwLock::new(HashMap::new()),
            client_id_index: RwLock::new(HashMap::new()),
        }
    }

    fn apply_single(entry: &mut Entry, update: OrderUpdate) -> ApplyOutcome {
        let outcome = match &entry.current {
            None => {
                entry.current = Some(update.order.clone());
                ApplyOutcome::Applied(update.order)
            }
            Some(existing) => {
                if allowed_transition(existing.status, update.order.status) {
                    entry.current = Some(update.order.clone());
                    ApplyOutcome::Applied(update.order)
                } else {
                    warn!(
                        order_id = %update.order.order_id,
                        from = ?existing.status,
                        to = ?update.order.status,
                        "rejected invalid order state transition"
                    );
                    ApplyOutcome::InvalidTransitionRejected {
                        from: existing.status,
                        to: update.order.status,
                    }
                }
            }
        };
        entry.last_seen = update.update_id;
        outcome
    }

    /// Feed one update. May return more than one outcome: applying this
    /// update can close a gap that unblocks a run of previously buffered
    /// updates, all of which are drained and applied in order (§4.9, §8
    /// scenario 4).
    pub fn apply(&self, update: OrderUpdate) -> Vec<ApplyOutcome> {
        let key = (update.order.exchange, update.order.order_id.clone());
        let mut orders = self.orders.write();
        let entry = orders.entry(key.clone()).or_insert_with(Entry::new);

        if update.update_id <= entry.last_seen && entry.last_seen != 0 {
            return vec![ApplyOutcome::DuplicateDropped];
        }
        // A brand-new order (last_seen == 0, nothing applied yet) always
        // accepts its first update regardless of update_id value — there is
        // no prior state to be ahead of or duplicate against.
        if entry.last_seen != 0 && update.update_id != entry.last_seen + 1 {
            entry.buffer.insert(update.update_id, update);
            return vec![ApplyOutcome::Buffered];
        }

        let mut outcomes = vec![Self::apply_single(entry, update)];
        if let Some(ApplyOutcome::Applied(order)) = outcomes.last() {
            if let Some(coid) = &order.client_order_id {
                self.client_id_index.write().insert((order.exchange, coid.clone()), order.order_id.clone());
            }
        }

        while let Some(next_id) = entry.buffer.keys().next().copied() {
            if next_id != entry.last_seen + 1 {
                break;
            }
            let next = entry.buffer.remove(&next_id).expect("key just observed");
            outcomes.push(Self::apply_single(entry, next));
        }

        outcomes
    }

    pub fn get(&self, exchange: Exchange, order_id: &str) -> Option<Order> {
        self.orders.read().get(&(exchange, order_id.to_string())).and_then(|e| e.current.clone())
    }

    pub fn get_by_client_order_id(&self, exchange: Exchange, client_order_id: &str) -> Option<Order> {
        let order_id = self.client_id_index.read().get(&(exchange, client_order_id.to_string()))?.clone();
        self.get(exchange, &order_id)
    }

    pub fn open_orders(&self, exchange: Exchange) -> Vec<Order> {
        self.orders
            .read()
            .values()
            .filter_map(|e| e.current.clone())
            .filter(|o| o.exchange == exchange && !o.status.is_terminal())
            .collect()
    }
}

impl Default for OrderReducer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decimal::dec;
    use crate::symbol::Symbol;
    use crate::types::{OrderType, Side, TimeInForce};

    fn order(id: &str, status: OrderStatus) -> Order {
        Order {
            exchange: Exchange::Binance,
            order_id: id.to_string(),
            client_order_id: Some(format!("c-{id}")),
            symbol: Symbol::new("BTC", "USDT"),
            side: Side::Buy,
            order_type: OrderType::Limit,
            status,
            price: Some(dec("100")),
            quantity: dec("1"),
            filled_qty: dec("0"),
            avg_fill_price: None,
            time_in_force: TimeInForce::Gtc,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn spec_scenario_4_dedup_buffer_and_order() {
        let reducer = OrderReducer::new();

        let o1 = reducer.apply(OrderUpdate { update_id: 1, order: order("X", OrderStatus::New) });
        assert!(matches!(o1.as_slice(), [ApplyOutcome::Applied(_)]));

        let o2 = reducer.apply(OrderUpdate { update_id: 2, order: order("X", OrderStatus::PartiallyFilled) });
        assert!(matches!(o2.as_slice(), [ApplyOutcome::Applied(_)]));

        // Duplicate at id 2.
        let dup = reducer.apply(OrderUpdate { update_id: 2, order: order("X", OrderStatus::PartiallyFilled) });
        assert!(matches!(dup.as_slice(), [ApplyOutcome::DuplicateDropped]));

        // id 4 arrives before id 3 — buffered.
        let buffered = reducer.apply(OrderUpdate { update_id: 4, order: order("X", OrderStatus::Filled) });
        assert!(matches!(buffered.as_slice(), [ApplyOutcome::Buffered]));

        // id 3 closes the gap; id 4 drains immediately after.
        let drained = reducer.apply(OrderUpdate { update_id: 3, order: order("X", OrderStatus::PartiallyFilled) });
        assert_eq!(drained.len(), 2);
        assert!(matches!(drained[0], ApplyOutcome::Applied(_)));
        assert!(matches!(drained[1], ApplyOutcome::Applied(_)));

        assert_eq!(reducer.get(Exchange::Binance, "X").unwrap().status, OrderStatus::Filled);
    }

    #[test]
    fn invalid_transition_from_terminal_is_rejected_not_applied() {
        let reducer = OrderReducer::new();
        reducer.apply(OrderUpdate { update_id: 1, order: order("Y", OrderStatus::Filled) });

        let outcome = reducer.apply(OrderUpdate { update_id: 2, order: order("Y", OrderStatus::New) });
        assert!(matches!(
            outcome.as_slice(),
            [ApplyOutcome::InvalidTransitionRejected { .. }]
        ));
        // Order is unchanged — still Filled, not repaired backwards to New.
        assert_eq!(reducer.get(Exchange::Binance, "Y").unwrap().status, OrderStatus::Filled);
    }

    #[test]
    fn terminal_status_is_stable_for_all_subsequent_updates() {
        let reducer = OrderReducer::new();
        reducer.apply(OrderUpdate { update_id: 1, order: order("Z", OrderStatus::New) });
        reducer.apply(OrderUpdate { update_id: 2, order: order("Z", OrderStatus::Canceled) });
        reducer.apply(OrderUpdate { update_id: 3, order: order("Z", OrderStatus::PartiallyFilled) });
        assert_eq!(reducer.get(Exchange::Binance, "Z").unwrap().status, OrderStatus::Canceled);
    }

    #[test]
    fn secondary_index_resolves_by_client_order_id() {
        let reducer = OrderReducer::new();
        reducer.apply(OrderUpdate { update_id: 1, order: order("A1", OrderStatus::New) });
        let found = reducer.get_by_client_order_id(Exchange::Binance, "c-A1").unwrap();
        assert_eq!(found.order_id, "A1");
    }

    #[test]
    fn open_orders_excludes_terminal_statuses() {
        let reducer = OrderReducer::new();
        reducer.apply(OrderUpdate { update_id: 1, order: order("O1", OrderStatus::New) });
        reducer.apply(OrderUpdate { update_id: 1, order: order("O2", OrderStatus::Filled) });
        let open = reducer.open_orders(Exchange::Binance);
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].order_id, "O1");
    }
}
