//! Order and item status model.
//!
//! Item statuses are the unit the server works with (stock is decremented on
//! pick and released on cancel inside the remote procedures). The order's
//! presentational state is derived from its items with the predicates below.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::models::Order;
use crate::{Error, Result};

// ---------------------------------------------------------------------------
// Item status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemStatus {
    Reserved,
    Picked,
    Waiting,
    Missing,
    Cancelled,
}

impl ItemStatus {
    pub const ALL: [ItemStatus; 5] = [
        ItemStatus::Reserved,
        ItemStatus::Picked,
        ItemStatus::Waiting,
        ItemStatus::Missing,
        ItemStatus::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ItemStatus::Reserved => "reserved",
            ItemStatus::Picked => "picked",
            ItemStatus::Waiting => "waiting",
            ItemStatus::Missing => "missing",
            ItemStatus::Cancelled => "cancelled",
        }
    }

    /// Statuses reachable from `self`. Cancelled is terminal.
    pub fn allowed_next(self) -> &'static [ItemStatus] {
        use ItemStatus::*;
        match self {
            Reserved => &[Picked, Waiting, Missing, Cancelled],
            Waiting => &[Reserved, Picked, Missing, Cancelled],
            Missing => &[Reserved, Waiting, Cancelled],
            Picked => &[Reserved, Cancelled],
            Cancelled => &[],
        }
    }

    pub fn can_transition_to(self, next: ItemStatus) -> bool {
        self.allowed_next().contains(&next)
    }

    /// Counts toward the order: not cancelled and not missing.
    pub fn is_live(self) -> bool {
        !matches!(self, ItemStatus::Cancelled | ItemStatus::Missing)
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "reserved" => Ok(ItemStatus::Reserved),
            "picked" => Ok(ItemStatus::Picked),
            "waiting" => Ok(ItemStatus::Waiting),
            "missing" => Ok(ItemStatus::Missing),
            "cancelled" | "canceled" => Ok(ItemStatus::Cancelled),
            other => Err(Error::validation(format!("Unknown item status: {other:?}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Stored order status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrderStatus {
    Active,
    Picked,
    Closed,
    Sent,
    /// Stored as `devolución`.
    Returned,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Active => "active",
            OrderStatus::Picked => "picked",
            OrderStatus::Closed => "closed",
            OrderStatus::Sent => "sent",
            OrderStatus::Returned => "devolución",
        }
    }

    /// Item statuses may only change while the order is open.
    pub fn is_open(self) -> bool {
        matches!(self, OrderStatus::Active | OrderStatus::Picked)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "active" => Ok(OrderStatus::Active),
            "picked" => Ok(OrderStatus::Picked),
            "closed" => Ok(OrderStatus::Closed),
            "sent" => Ok(OrderStatus::Sent),
            "devolución" | "devolucion" | "returned" => Ok(OrderStatus::Returned),
            other => Err(Error::validation(format!("Unknown order status: {other:?}"))),
        }
    }
}

macro_rules! string_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                raw.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

string_serde!(ItemStatus);
string_serde!(OrderStatus);

// ---------------------------------------------------------------------------
// Derived display status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayStatus {
    Active,
    Picked,
    Waiting,
    Closed,
    Sent,
    Returned,
}

impl DisplayStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DisplayStatus::Active => "active",
            DisplayStatus::Picked => "picked",
            DisplayStatus::Waiting => "waiting",
            DisplayStatus::Closed => "closed",
            DisplayStatus::Sent => "sent",
            DisplayStatus::Returned => "returned",
        }
    }
}

impl fmt::Display for DisplayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn count_items(order: &Order, status: ItemStatus) -> usize {
    order
        .order_items
        .iter()
        .filter(|i| i.status == status)
        .count()
}

pub fn order_has_missing(order: &Order) -> bool {
    count_items(order, ItemStatus::Missing) > 0
}

/// Presentational state of an order.
///
/// Stored terminal states win. For open orders: any waiting item makes the
/// order Waiting; otherwise it is Picked when it has live items and all of
/// them are picked; otherwise Active.
pub fn derive_display_status(order: &Order) -> DisplayStatus {
    match order.status {
        OrderStatus::Closed => return DisplayStatus::Closed,
        OrderStatus::Sent => return DisplayStatus::Sent,
        OrderStatus::Returned => return DisplayStatus::Returned,
        OrderStatus::Active | OrderStatus::Picked => {}
    }

    if count_items(order, ItemStatus::Waiting) > 0 {
        return DisplayStatus::Waiting;
    }

    let mut live = order.order_items.iter().filter(|i| i.status.is_live()).peekable();
    if live.peek().is_some() && live.all(|i| i.status == ItemStatus::Picked) {
        DisplayStatus::Picked
    } else {
        DisplayStatus::Active
    }
}

// ---------------------------------------------------------------------------
// Lifecycle preconditions
// ---------------------------------------------------------------------------

pub fn check_item_transition(order: &Order, item_id: &str, next: ItemStatus) -> Result<ItemStatus> {
    if !order.status.is_open() {
        return Err(Error::InvalidTransition(format!(
            "order {} is {} and its items can no longer change",
            order.order_number, order.status
        )));
    }
    let item = order
        .item(item_id)
        .ok_or_else(|| Error::NotFound(format!("item {item_id} in order {}", order.order_number)))?;
    if !item.status.can_transition_to(next) {
        return Err(Error::InvalidTransition(format!(
            "{} cannot go from {} to {}",
            item.label(),
            item.status,
            next
        )));
    }
    Ok(item.status)
}

/// Close requires every live item picked and nothing waiting.
pub fn check_can_close(order: &Order) -> Result<()> {
    match derive_display_status(order) {
        DisplayStatus::Picked => Ok(()),
        other => Err(Error::InvalidTransition(format!(
            "order {} is {other}; only fully picked orders can be closed",
            order.order_number
        ))),
    }
}

/// Shipping (courier or local pickup) requires a closed order.
pub fn check_can_ship(order: &Order) -> Result<()> {
    if order.status == OrderStatus::Closed {
        Ok(())
    } else {
        Err(Error::InvalidTransition(format!(
            "order {} is {}; only closed orders can be sent",
            order.order_number, order.status
        )))
    }
}

pub fn check_can_return(order: &Order) -> Result<()> {
    if matches!(order.status, OrderStatus::Closed | OrderStatus::Sent) {
        Ok(())
    } else {
        Err(Error::InvalidTransition(format!(
            "order {} is {}; only closed or sent orders can be returned",
            order.order_number, order.status
        )))
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use crate::models::{Customer, Order, OrderItem};
    use crate::status::{ItemStatus, OrderStatus};

    pub fn item(id: &str, status: ItemStatus, price: f64, quantity: i64) -> OrderItem {
        OrderItem {
            id: id.to_string(),
            order_id: "o".to_string(),
            product_name: format!("Producto {id}"),
            color: None,
            size: None,
            quantity,
            price,
            status,
            variant_id: Some(format!("v{id}")),
        }
    }

    pub fn order(number: &str, status: OrderStatus, items: Vec<OrderItem>) -> Order {
        Order {
            id: format!("id-{number}"),
            order_number: number.to_string(),
            status,
            total_amount: 0.0,
            created_at: None,
            updated_at: None,
            customer_id: None,
            notes: None,
            order_items: items,
            customers: Some(Customer {
                id: "c1".into(),
                name: "Ana Pérez".into(),
                phone: Some("11 5555-1234".into()),
                dni: Some("30123456".into()),
                ..Default::default()
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::{item, order};
    use super::*;
    use super::ItemStatus::*;

    #[test]
    fn item_status_parsing_is_lenient() {
        assert_eq!(" Picked ".parse::<ItemStatus>().unwrap(), Picked);
        assert_eq!("canceled".parse::<ItemStatus>().unwrap(), Cancelled);
        assert!("shipped".parse::<ItemStatus>().is_err());
    }

    #[test]
    fn order_status_accepts_devolucion_spellings() {
        for raw in ["devolución", "devolucion", "DEVOLUCIÓN", "returned"] {
            assert_eq!(raw.parse::<OrderStatus>().unwrap(), OrderStatus::Returned);
        }
        assert_eq!(
            serde_json::to_value(OrderStatus::Returned).unwrap(),
            serde_json::json!("devolución")
        );
    }

    #[test]
    fn transition_table() {
        assert!(Reserved.can_transition_to(Picked));
        assert!(Waiting.can_transition_to(Picked));
        assert!(Picked.can_transition_to(Reserved));
        assert!(!Picked.can_transition_to(Waiting));
        assert!(!Missing.can_transition_to(Picked));
        for s in ItemStatus::ALL {
            assert!(!s.can_transition_to(s), "{s} -> {s} must be rejected");
            assert!(!Cancelled.can_transition_to(s));
        }
    }

    #[test]
    fn all_picked_none_waiting_is_picked() {
        let o = order("1", OrderStatus::Active, vec![item("a", Picked, 10.0, 1), item("b", Picked, 5.0, 2)]);
        assert_eq!(derive_display_status(&o), DisplayStatus::Picked);
    }

    #[test]
    fn any_waiting_item_wins() {
        let o = order("1", OrderStatus::Picked, vec![item("a", Picked, 1.0, 1), item("b", Waiting, 1.0, 1)]);
        assert_eq!(derive_display_status(&o), DisplayStatus::Waiting);
    }

    #[test]
    fn missing_and_cancelled_items_do_not_block_picked() {
        let o = order(
            "1",
            OrderStatus::Active,
            vec![item("a", Picked, 1.0, 1), item("b", Missing, 1.0, 1), item("c", Cancelled, 1.0, 1)],
        );
        assert_eq!(derive_display_status(&o), DisplayStatus::Picked);
        assert!(order_has_missing(&o));
    }

    #[test]
    fn orders_without_live_items_stay_active() {
        let empty = order("1", OrderStatus::Active, vec![]);
        assert_eq!(derive_display_status(&empty), DisplayStatus::Active);
        let all_cancelled = order("2", OrderStatus::Picked, vec![item("a", Cancelled, 1.0, 1)]);
        assert_eq!(derive_display_status(&all_cancelled), DisplayStatus::Active);
        let partly = order("3", OrderStatus::Active, vec![item("a", Picked, 1.0, 1), item("b", Reserved, 1.0, 1)]);
        assert_eq!(derive_display_status(&partly), DisplayStatus::Active);
    }

    #[test]
    fn stored_terminal_states_take_precedence() {
        let items = vec![item("a", Waiting, 1.0, 1)];
        assert_eq!(derive_display_status(&order("1", OrderStatus::Closed, items.clone())), DisplayStatus::Closed);
        assert_eq!(derive_display_status(&order("2", OrderStatus::Sent, items.clone())), DisplayStatus::Sent);
        assert_eq!(derive_display_status(&order("3", OrderStatus::Returned, items)), DisplayStatus::Returned);
    }

    #[test]
    fn item_changes_require_open_order_and_valid_edge() {
        let open = order("7", OrderStatus::Active, vec![item("a", Reserved, 1.0, 1)]);
        assert_eq!(check_item_transition(&open, "a", Picked).unwrap(), Reserved);
        assert!(matches!(
            check_item_transition(&open, "a", Reserved),
            Err(Error::InvalidTransition(_))
        ));
        assert!(matches!(check_item_transition(&open, "zz", Picked), Err(Error::NotFound(_))));

        let closed = order("8", OrderStatus::Closed, vec![item("a", Picked, 1.0, 1)]);
        assert!(matches!(
            check_item_transition(&closed, "a", Reserved),
            Err(Error::InvalidTransition(_))
        ));
    }

    #[test]
    fn lifecycle_preconditions() {
        let picked = order("1", OrderStatus::Active, vec![item("a", Picked, 1.0, 1)]);
        assert!(check_can_close(&picked).is_ok());
        let waiting = order("2", OrderStatus::Active, vec![item("a", Waiting, 1.0, 1)]);
        assert!(check_can_close(&waiting).is_err());

        let closed = order("3", OrderStatus::Closed, vec![]);
        assert!(check_can_ship(&closed).is_ok());
        assert!(check_can_ship(&picked).is_err());
        assert!(check_can_return(&closed).is_ok());
        assert!(check_can_return(&order("4", OrderStatus::Sent, vec![])).is_ok());
        assert!(check_can_return(&picked).is_err());
    }
}
