//! In-memory views fed by engine events
//!
//! [`OpenOrderIndex`] keeps every user's open orders for listings.
//! [`OrderUpdateCache`] buffers order deltas per (user, sub-account) until the
//! order-update dispatcher drains them. [`BalanceInvalidation`] marks the
//! owner's balances dirty on every change.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::cache::DirtyBalances;
use common::model::order::Order;
use common::model::{OrderId, SubAccountId, UserId};
use dashmap::DashMap;

use crate::engine::OrderEventSink;

/// Filters of an open-order listing
#[derive(Debug, Clone)]
pub struct OrderQuery {
    pub market_id: Option<String>,
    pub sub_account_id: Option<SubAccountId>,
    pub since: Option<DateTime<Utc>>,
    /// 1-based
    pub page: usize,
    pub limit: usize,
}

impl Default for OrderQuery {
    fn default() -> Self {
        Self {
            market_id: None,
            sub_account_id: None,
            since: None,
            page: 1,
            limit: 50,
        }
    }
}

/// One page of orders
#[derive(Debug, Clone)]
pub struct OrderPage {
    pub orders: Vec<Order>,
    /// Matching orders across all pages
    pub total: usize,
    pub page: usize,
    pub limit: usize,
}

/// Open orders by user
#[derive(Default)]
pub struct OpenOrderIndex {
    by_user: DashMap<UserId, HashMap<OrderId, Order>>,
}

impl OpenOrderIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, order: &Order) {
        let mut orders = self.by_user.entry(order.owner_id).or_default();
        if order.is_open() {
            orders.insert(order.id, order.clone());
        } else {
            orders.remove(&order.id);
        }
    }

    /// Matching open orders, newest first, child orders hidden
    pub fn query(&self, user_id: UserId, query: &OrderQuery) -> OrderPage {
        let mut orders: Vec<Order> = self
            .by_user
            .get(&user_id)
            .map(|orders| {
                orders
                    .values()
                    .filter(|o| !o.is_child())
                    .filter(|o| {
                        query
                            .market_id
                            .as_ref()
                            .map_or(true, |m| o.market_id.eq_ignore_ascii_case(m))
                    })
                    .filter(|o| query.sub_account_id.map_or(true, |s| o.sub_account_id == s))
                    .filter(|o| query.since.map_or(true, |since| o.created_at >= since))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        let total = orders.len();
        let page = query.page.max(1);
        let limit = query.limit.max(1);
        let orders = orders
            .into_iter()
            .skip(page.saturating_sub(1).saturating_mul(limit))
            .take(limit)
            .collect();

        OrderPage {
            orders,
            total,
            page,
            limit,
        }
    }

    pub fn count_for(&self, user_id: UserId) -> usize {
        self.by_user.get(&user_id).map_or(0, |o| o.len())
    }
}

impl OrderEventSink for OpenOrderIndex {
    fn on_order(&self, order: &Order) {
        self.upsert(order);
    }
}

/// Pending order deltas per (user, sub-account)
#[derive(Default)]
pub struct OrderUpdateCache {
    pending: DashMap<(UserId, SubAccountId), Vec<Order>>,
}

impl OrderUpdateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, order: &Order) {
        self.pending
            .entry((order.owner_id, order.sub_account_id))
            .or_default()
            .push(order.clone());
    }

    /// Take the buffered deltas of one (user, sub-account)
    pub fn drain(&self, user_id: UserId, sub_account_id: SubAccountId) -> Vec<Order> {
        self.pending
            .remove(&(user_id, sub_account_id))
            .map(|(_, orders)| orders)
            .unwrap_or_default()
    }

    /// Take the deltas of a user across all sub-accounts
    pub fn drain_user(&self, user_id: UserId) -> Vec<Order> {
        let keys: Vec<(UserId, SubAccountId)> = self
            .pending
            .iter()
            .filter(|e| e.key().0 == user_id)
            .map(|e| *e.key())
            .collect();
        keys.into_iter()
            .flat_map(|(u, s)| self.drain(u, s))
            .collect()
    }

    /// Drop the deltas of users nobody listens for
    pub fn discard_except(&self, users: &HashSet<UserId>) -> usize {
        let before = self.pending.len();
        self.pending.retain(|(user_id, _), _| users.contains(user_id));
        before - self.pending.len()
    }
}

impl OrderEventSink for OrderUpdateCache {
    fn on_order(&self, order: &Order) {
        self.push(order);
    }
}

/// Marks the owner's balances dirty on every order change
pub struct BalanceInvalidation(pub Arc<DirtyBalances>);

impl OrderEventSink for BalanceInvalidation {
    fn on_order(&self, order: &Order) {
        self.0.mark((order.owner_id, order.sub_account_id));
    }
}
