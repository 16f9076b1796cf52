//! Badge counts and tab filtering for the order board.
//!
//! Everything here is recomputed from the full order list whenever it
//! changes: after a load, after a remote procedure call, or after a realtime
//! notification.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::customers::normalize_phone;
use crate::models::Order;
use crate::status::{derive_display_status, order_has_missing, DisplayStatus};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tab {
    #[default]
    Active,
    Picked,
    Waiting,
    Closed,
    Sent,
    Returned,
    All,
}

impl Tab {
    pub const ALL_TABS: [Tab; 7] = [
        Tab::Active,
        Tab::Picked,
        Tab::Waiting,
        Tab::Closed,
        Tab::Sent,
        Tab::Returned,
        Tab::All,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Tab::Active => "active",
            Tab::Picked => "picked",
            Tab::Waiting => "waiting",
            Tab::Closed => "closed",
            Tab::Sent => "sent",
            Tab::Returned => "returned",
            Tab::All => "all",
        }
    }

    pub fn matches(self, status: DisplayStatus) -> bool {
        match self {
            Tab::All => true,
            Tab::Active => status == DisplayStatus::Active,
            Tab::Picked => status == DisplayStatus::Picked,
            Tab::Waiting => status == DisplayStatus::Waiting,
            Tab::Closed => status == DisplayStatus::Closed,
            Tab::Sent => status == DisplayStatus::Sent,
            Tab::Returned => status == DisplayStatus::Returned,
        }
    }
}

impl fmt::Display for Tab {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tab {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_lowercase();
        if matches!(wanted.as_str(), "devolución" | "devolucion") {
            return Ok(Tab::Returned);
        }
        Tab::ALL_TABS
            .into_iter()
            .find(|t| t.as_str() == wanted)
            .ok_or_else(|| Error::validation(format!("Unknown tab: {s:?}")))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BadgeCounts {
    pub active: usize,
    pub picked: usize,
    pub waiting: usize,
    pub closed: usize,
    pub sent: usize,
    pub returned: usize,
    /// Orders with at least one missing item, whatever their state.
    pub with_missing: usize,
    pub total: usize,
}

impl BadgeCounts {
    pub fn from_orders(orders: &[Order]) -> Self {
        let mut counts = BadgeCounts::default();
        for order in orders {
            match derive_display_status(order) {
                DisplayStatus::Active => counts.active += 1,
                DisplayStatus::Picked => counts.picked += 1,
                DisplayStatus::Waiting => counts.waiting += 1,
                DisplayStatus::Closed => counts.closed += 1,
                DisplayStatus::Sent => counts.sent += 1,
                DisplayStatus::Returned => counts.returned += 1,
            }
            if order_has_missing(order) {
                counts.with_missing += 1;
            }
        }
        counts.total = orders.len();
        counts
    }

    pub fn for_tab(&self, tab: Tab) -> usize {
        match tab {
            Tab::Active => self.active,
            Tab::Picked => self.picked,
            Tab::Waiting => self.waiting,
            Tab::Closed => self.closed,
            Tab::Sent => self.sent,
            Tab::Returned => self.returned,
            Tab::All => self.total,
        }
    }
}

/// Case-insensitive match on order number, customer name, phone and dni.
/// Queries containing digits also match phones ignoring separators.
pub fn matches_search(order: &Order, query: &str) -> bool {
    let needle = query.trim().to_lowercase();
    if needle.is_empty() {
        return true;
    }
    if order.order_number.to_lowercase().contains(&needle) {
        return true;
    }
    let Some(customer) = order.customers.as_ref() else {
        return false;
    };
    if customer.name.to_lowercase().contains(&needle) {
        return true;
    }
    if customer
        .dni
        .as_deref()
        .map(|d| d.to_lowercase().contains(&needle))
        .unwrap_or(false)
    {
        return true;
    }
    let digits = normalize_phone(&needle);
    if let Some(phone) = customer.phone.as_deref() {
        if phone.to_lowercase().contains(&needle) {
            return true;
        }
        if !digits.is_empty() && normalize_phone(phone).contains(&digits) {
            return true;
        }
    }
    false
}

/// Orders shown under `tab`, narrowed by `search`, newest first.
pub fn filter_orders<'a>(orders: &'a [Order], tab: Tab, search: &str) -> Vec<&'a Order> {
    let mut out: Vec<&Order> = orders
        .iter()
        .filter(|o| tab.matches(derive_display_status(o)))
        .filter(|o| matches_search(o, search))
        .collect();
    out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    out
}

/// Current board state: the selected tab, the search text and the last
/// loaded order list, with counts kept in sync.
#[derive(Debug, Default)]
pub struct OrderBoard {
    tab: Tab,
    search: String,
    orders: Vec<Order>,
    counts: BadgeCounts,
}

impl OrderBoard {
    pub fn new(tab: Tab) -> Self {
        Self {
            tab,
            ..Default::default()
        }
    }

    /// Replace the order list (full reload) and recompute counts.
    pub fn replace_orders(&mut self, orders: Vec<Order>) {
        self.counts = BadgeCounts::from_orders(&orders);
        self.orders = orders;
    }

    /// Swap in a single updated order (e.g. the row returned after an RPC).
    pub fn upsert_order(&mut self, order: Order) {
        match self.orders.iter_mut().find(|o| o.id == order.id) {
            Some(existing) => *existing = order,
            None => self.orders.push(order),
        }
        self.counts = BadgeCounts::from_orders(&self.orders);
    }

    pub fn set_tab(&mut self, tab: Tab) {
        self.tab = tab;
    }

    pub fn set_search(&mut self, search: &str) {
        self.search = search.trim().to_string();
    }

    pub fn tab(&self) -> Tab {
        self.tab
    }

    pub fn counts(&self) -> BadgeCounts {
        self.counts
    }

    pub fn orders(&self) -> &[Order] {
        &self.orders
    }

    pub fn visible(&self) -> Vec<&Order> {
        filter_orders(&self.orders, self.tab, &self.search)
    }
}
