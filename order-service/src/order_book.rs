//! Price-time priority book used by the in-memory engine

use std::collections::{BTreeMap, HashMap, VecDeque};

use common::decimal::{Price, Quantity};
use common::model::order::Side;
use common::model::OrderId;

/// Resting orders of one side; FIFO within a price level
#[derive(Default)]
pub struct BookSide {
    levels: BTreeMap<Price, VecDeque<OrderId>>,
}

impl BookSide {
    fn push(&mut self, price: Price, id: OrderId) {
        self.levels.entry(price).or_default().push_back(id);
    }

    fn remove(&mut self, price: Price, id: OrderId) -> bool {
        let Some(level) = self.levels.get_mut(&price) else {
            return false;
        };
        let before = level.len();
        level.retain(|o| *o != id);
        let removed = level.len() != before;
        if level.is_empty() {
            self.levels.remove(&price);
        }
        removed
    }

    fn lowest(&self) -> Option<Price> {
        self.levels.keys().next().copied()
    }

    fn highest(&self) -> Option<Price> {
        self.levels.keys().next_back().copied()
    }

    fn front_at(&self, price: Price) -> Option<OrderId> {
        self.levels.get(&price).and_then(|l| l.front().copied())
    }
}

/// Order book for a single market
#[derive(Default)]
pub struct OrderBook {
    bids: BookSide,
    asks: BookSide,
    /// Remaining amount and place of every resting order
    resting: HashMap<OrderId, (Side, Price, Quantity)>,
    pub last_price: Option<Price>,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rest an order with its remaining amount
    pub fn add(&mut self, id: OrderId, side: Side, price: Price, remaining: Quantity) {
        match side {
            Side::Buy => self.bids.push(price, id),
            Side::Sell => self.asks.push(price, id),
        }
        self.resting.insert(id, (side, price, remaining));
    }

    pub fn remove(&mut self, id: OrderId) -> Option<Quantity> {
        let (side, price, remaining) = self.resting.remove(&id)?;
        match side {
            Side::Buy => self.bids.remove(price, id),
            Side::Sell => self.asks.remove(price, id),
        };
        Some(remaining)
    }

    pub fn contains(&self, id: OrderId) -> bool {
        self.resting.contains_key(&id)
    }

    pub fn best_bid(&self) -> Option<Price> {
        self.bids.highest()
    }

    pub fn best_ask(&self) -> Option<Price> {
        self.asks.lowest()
    }

    /// Oldest order at the best opposite price a taker can trade with
    ///
    /// `limit` of `None` means any price (market order).
    pub fn best_match(&self, taker: Side, limit: Option<Price>) -> Option<(OrderId, Price, Quantity)> {
        let price = match taker {
            Side::Buy => self.best_ask().filter(|ask| limit.map_or(true, |l| *ask <= l))?,
            Side::Sell => self.best_bid().filter(|bid| limit.map_or(true, |l| *bid >= l))?,
        };
        let id = match taker {
            Side::Buy => self.asks.front_at(price)?,
            Side::Sell => self.bids.front_at(price)?,
        };
        let (_, _, remaining) = self.resting.get(&id)?;
        Some((id, price, *remaining))
    }

    /// Reduce a resting order; it leaves the book when nothing remains
    pub fn reduce(&mut self, id: OrderId, amount: Quantity) {
        let done = match self.resting.get_mut(&id) {
            Some(entry) => {
                entry.2 -= amount;
                entry.2 <= Quantity::ZERO
            }
            None => false,
        };
        if done {
            self.remove(id);
        }
    }

    /// Quote needed to buy `amount` from the resting asks, best price first
    pub fn market_buy_cost(&self, amount: Quantity) -> Price {
        let mut left = amount;
        let mut cost = Price::ZERO;
        for (price, qty) in self.levels(Side::Sell, usize::MAX) {
            if left <= Quantity::ZERO {
                break;
            }
            let take = left.min(qty);
            cost += take * price;
            left -= take;
        }
        cost
    }

    /// Aggregated (price, amount) levels, best first
    pub fn levels(&self, side: Side, limit: usize) -> Vec<(Price, Quantity)> {
        let book_side = match side {
            Side::Buy => &self.bids,
            Side::Sell => &self.asks,
        };
        let sum = |ids: &VecDeque<OrderId>| -> Quantity {
            ids.iter()
                .filter_map(|id| self.resting.get(id).map(|r| r.2))
                .sum()
        };
        match side {
            Side::Buy => book_side
                .levels
                .iter()
                .rev()
                .take(limit)
                .map(|(p, ids)| (*p, sum(ids)))
                .collect(),
            Side::Sell => book_side
                .levels
                .iter()
                .take(limit)
                .map(|(p, ids)| (*p, sum(ids)))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn price_time_priority() {
        let mut book = OrderBook::new();
        book.add(1, Side::Sell, dec!(101), dec!(1));
        book.add(2, Side::Sell, dec!(100), dec!(1));
        book.add(3, Side::Sell, dec!(100), dec!(2));
        book.add(4, Side::Buy, dec!(99), dec!(5));

        assert_eq!(book.best_match(Side::Buy, Some(dec!(100))), Some((2, dec!(100), dec!(1))));
        assert_eq!(book.best_match(Side::Buy, Some(dec!(99.5))), None);
        assert_eq!(book.best_match(Side::Sell, None), Some((4, dec!(99), dec!(5))));

        book.reduce(2, dec!(1));
        assert!(!book.contains(2));
        assert_eq!(book.best_match(Side::Buy, None), Some((3, dec!(100), dec!(2))));

        assert_eq!(book.levels(Side::Sell, 10), vec![(dec!(100), dec!(2)), (dec!(101), dec!(1))]);
        assert_eq!(book.levels(Side::Buy, 10), vec![(dec!(99), dec!(5))]);

        // 2 at 100, then 0.5 of the 101 level; beyond the book is free
        assert_eq!(book.market_buy_cost(dec!(2.5)), dec!(250.5));
        assert_eq!(book.market_buy_cost(dec!(10)), dec!(301));
    }
}
