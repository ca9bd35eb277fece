//! Order service: matching engine port, in-memory engine, market catalog,
//! open-order index and the order adapter

mod order_book;
pub mod adapter;
pub mod engine;
pub mod index;
pub mod markets;
pub mod settlement;

use std::sync::Arc;

use account_service::{InMemoryFundsEngine, SubAccountService};
use common::cache::DirtyBalances;
use common::features::FeatureFlags;

pub use adapter::{
    BulkCancelResult, BulkCreateResult, CancelItem, CancelOutcome, CreateOrderRequest, OrderAdapter,
};
pub use engine::{CancelStatus, Depth, InMemoryOrderEngine, NewOrder, OrderEngine, OrderEventSink, Trade};
pub use index::{BalanceInvalidation, OpenOrderIndex, OrderPage, OrderQuery, OrderUpdateCache};
pub use markets::MarketCatalog;
pub use order_book::OrderBook;

/// Every order component, wired together
pub struct OrderModule {
    pub engine: Arc<dyn OrderEngine>,
    pub markets: Arc<MarketCatalog>,
    pub index: Arc<OpenOrderIndex>,
    pub updates: Arc<OrderUpdateCache>,
    pub adapter: Arc<OrderAdapter>,
}

impl OrderModule {
    /// Wire the adapter and subscribe the index, update cache and balance
    /// invalidation to engine events
    pub fn build(
        engine: Arc<dyn OrderEngine>,
        markets: Arc<MarketCatalog>,
        subs: Arc<SubAccountService>,
        flags: Arc<dyn FeatureFlags>,
        dirty: Arc<DirtyBalances>,
    ) -> Self {
        let index = Arc::new(OpenOrderIndex::new());
        let updates = Arc::new(OrderUpdateCache::new());
        engine.subscribe(index.clone());
        engine.subscribe(updates.clone());
        engine.subscribe(Arc::new(BalanceInvalidation(dirty.clone())));

        let adapter = Arc::new(OrderAdapter::new(
            engine.clone(),
            markets.clone(),
            subs,
            flags,
            index.clone(),
            dirty,
        ));

        Self {
            engine,
            markets,
            index,
            updates,
            adapter,
        }
    }

    /// In-memory engine with every catalog market registered, locking order
    /// funds in `funds` when given
    pub fn in_memory_engine(
        markets: &Arc<MarketCatalog>,
        funds: Option<Arc<InMemoryFundsEngine>>,
    ) -> Arc<InMemoryOrderEngine> {
        let mut engine = InMemoryOrderEngine::new();
        if let Some(funds) = funds {
            engine = engine.with_funds(funds, markets.clone());
        }
        let engine = Arc::new(engine);
        for market in markets.list() {
            engine.register_market(&market.id);
        }
        engine
    }
}
