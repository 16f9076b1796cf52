//! Back-office order operations.
//!
//! Every state change goes through a remote procedure (stock bookkeeping and
//! the transactional close live server-side). Before calling one, the client
//! checks the same preconditions the board shows, so an operator gets a clear
//! message instead of a server rejection.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::api::{Query, RpcOutcome, SupabaseClient};
use crate::badges::BadgeCounts;
use crate::db::{self, DbState};
use crate::models::{Order, Warehouse};
use crate::status::{self, ItemStatus};
use crate::{round_cents, Error, Result};

const ORDERS_TABLE: &str = "orders";
const ORDER_SELECT: &str = "*,order_items(*),customers(*)";
const ORDERS_SNAPSHOT_KEY: &str = "orders_snapshot";

// ---------------------------------------------------------------------------
// Extra charges (stored as JSON in `orders.notes`)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtraCharge {
    pub description: String,
    pub amount: f64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct NotesDocument {
    #[serde(default)]
    extra_charges: Vec<ExtraCharge>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

/// Extra charges from an order's notes. Plain-text notes carry none.
pub fn parse_extra_charges(notes: Option<&str>) -> Vec<ExtraCharge> {
    let Some(raw) = notes.map(str::trim).filter(|s| !s.is_empty()) else {
        return Vec::new();
    };
    if let Ok(charges) = serde_json::from_str::<Vec<ExtraCharge>>(raw) {
        return charges;
    }
    match serde_json::from_str::<NotesDocument>(raw) {
        Ok(doc) => doc.extra_charges,
        Err(_) => Vec::new(),
    }
}

/// Re-encode notes with new charges, keeping any free text already there.
pub fn encode_notes(existing: Option<&str>, charges: &[ExtraCharge]) -> Result<String> {
    let text = match existing.map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => match serde_json::from_str::<NotesDocument>(raw) {
            Ok(doc) => doc.text,
            Err(_) if serde_json::from_str::<Vec<ExtraCharge>>(raw).is_ok() => None,
            Err(_) => Some(raw.to_string()),
        },
        None => None,
    };
    let doc = NotesDocument {
        extra_charges: charges.to_vec(),
        text,
    };
    Ok(serde_json::to_string(&doc)?)
}

/// Parse "Envío=1500" style CLI arguments.
pub fn parse_charge_arg(raw: &str) -> Result<ExtraCharge> {
    let (desc, amount) = raw
        .rsplit_once('=')
        .ok_or_else(|| Error::validation(format!("Expected DESCRIPTION=AMOUNT, got {raw:?}")))?;
    let description = desc.trim().to_string();
    if description.is_empty() {
        return Err(Error::validation("Charge description is empty"));
    }
    let amount = amount
        .trim()
        .replace(',', ".")
        .parse::<f64>()
        .map_err(|_| Error::validation(format!("Invalid charge amount in {raw:?}")))?;
    if !amount.is_finite() {
        return Err(Error::validation(format!("Invalid charge amount in {raw:?}")));
    }
    Ok(ExtraCharge {
        description,
        amount,
    })
}

/// Sum of live item lines plus extra charges, rounded to cents.
pub fn order_total(order: &Order, charges: &[ExtraCharge]) -> f64 {
    let items: f64 = order
        .order_items
        .iter()
        .filter(|i| i.status.is_live())
        .map(|i| i.line_total())
        .sum();
    let extras: f64 = charges.iter().map(|c| c.amount).sum();
    round_cents(items + extras)
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// All orders with their items and customer, newest first.
pub async fn load_orders(client: &SupabaseClient) -> Result<Vec<Order>> {
    let orders: Vec<Order> = client
        .select(
            ORDERS_TABLE,
            &Query::new()
                .select(ORDER_SELECT)
                .order("created_at", false),
        )
        .await?;
    info!(count = orders.len(), "orders loaded");
    Ok(orders)
}

pub async fn load_order(client: &SupabaseClient, order_id: &str) -> Result<Order> {
    let rows: Vec<Order> = client
        .select(
            ORDERS_TABLE,
            &Query::new().select(ORDER_SELECT).eq("id", order_id).limit(1),
        )
        .await?;
    rows.into_iter()
        .next()
        .ok_or_else(|| Error::NotFound(format!("order {order_id}")))
}

/// Look an order up by id or by its human order number.
pub fn find_order<'a>(orders: &'a [Order], id_or_number: &str) -> Option<&'a Order> {
    let wanted = id_or_number.trim().trim_start_matches('#');
    orders
        .iter()
        .find(|o| o.id == wanted)
        .or_else(|| orders.iter().find(|o| o.order_number == wanted))
}

/// Keep the last loaded list for offline viewing.
pub fn save_snapshot(db: &DbState, orders: &[Order]) -> Result<()> {
    db::write_local_json(db, ORDERS_SNAPSHOT_KEY, &serde_json::to_value(orders)?)
}

pub fn load_snapshot(db: &DbState) -> Vec<Order> {
    let value = db::read_local_json(db, ORDERS_SNAPSHOT_KEY);
    if value.is_null() {
        return Vec::new();
    }
    serde_json::from_value(value).unwrap_or_else(|e| {
        warn!("orders snapshot unreadable: {e}");
        Vec::new()
    })
}

pub fn summarize(orders: &[Order]) -> BadgeCounts {
    BadgeCounts::from_orders(orders)
}

// ---------------------------------------------------------------------------
// Item status changes
// ---------------------------------------------------------------------------

pub async fn update_item_status(
    client: &SupabaseClient,
    order: &Order,
    item_id: &str,
    next: ItemStatus,
) -> Result<RpcOutcome> {
    let previous = status::check_item_transition(order, item_id, next)?;
    let outcome = client
        .rpc_outcome(
            "update_order_item_status",
            &json!({ "p_item_id": item_id, "p_new_status": next.as_str() }),
        )
        .await?;
    info!(
        order_number = %order.order_number,
        item_id,
        from = %previous,
        to = %next,
        "item status updated"
    );
    Ok(outcome)
}

/// Items that `select` admits and that may move to `next`.
fn targets(order: &Order, next: ItemStatus, select: impl Fn(ItemStatus) -> bool) -> Vec<&str> {
    order
        .order_items
        .iter()
        .filter(|i| select(i.status) && i.status.can_transition_to(next))
        .map(|i| i.id.as_str())
        .collect()
}

fn pickable(s: ItemStatus) -> bool {
    matches!(s, ItemStatus::Reserved | ItemStatus::Waiting)
}

fn cancellable(s: ItemStatus) -> bool {
    s != ItemStatus::Cancelled
}

/// Apply `next` to every item for which `select` is true, one call per item.
/// Stops at the first failure and reports how many were changed before it.
async fn update_items_where(
    client: &SupabaseClient,
    order: &Order,
    next: ItemStatus,
    select: impl Fn(ItemStatus) -> bool,
) -> Result<usize> {
    let mut changed = 0;
    for item_id in targets(order, next, select) {
        if let Err(e) = update_item_status(client, order, item_id, next).await {
            warn!(
                order_number = %order.order_number,
                item_id,
                changed,
                error = %e,
                "bulk item update stopped"
            );
            return Err(e);
        }
        changed += 1;
    }
    Ok(changed)
}

/// Pick every reserved or waiting item.
pub async fn pick_all(client: &SupabaseClient, order: &Order) -> Result<usize> {
    update_items_where(client, order, ItemStatus::Picked, pickable).await
}

/// Cancel every item that is not cancelled yet (releases stock server-side).
pub async fn cancel_open_items(client: &SupabaseClient, order: &Order) -> Result<usize> {
    update_items_where(client, order, ItemStatus::Cancelled, cancellable).await
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

pub async fn set_extra_charges(
    client: &SupabaseClient,
    order: &Order,
    charges: &[ExtraCharge],
) -> Result<()> {
    let notes = encode_notes(order.notes.as_deref(), charges)?;
    let _: Vec<serde_json::Value> = client
        .update(
            ORDERS_TABLE,
            &Query::new().eq("id", &order.id),
            &json!({ "notes": notes }),
        )
        .await?;
    Ok(())
}

/// Close a fully picked order, registering the payment and any extra charges.
pub async fn close_order(
    client: &SupabaseClient,
    order: &Order,
    payment_method_id: &str,
    extra_charges: &[ExtraCharge],
) -> Result<RpcOutcome> {
    status::check_can_close(order)?;
    if payment_method_id.trim().is_empty() {
        return Err(Error::validation("A payment method is required to close"));
    }
    let notes = encode_notes(order.notes.as_deref(), extra_charges)?;
    let total = order_total(order, extra_charges);
    let outcome = client
        .rpc_outcome(
            "close_order",
            &json!({
                "p_order_id": order.id,
                "p_payment_method_id": payment_method_id,
                "p_total_amount": total,
                "p_notes": notes,
            }),
        )
        .await?;
    info!(order_number = %order.order_number, total, "order closed");
    Ok(outcome)
}

pub async fn mark_as_sent(client: &SupabaseClient, order: &Order) -> Result<RpcOutcome> {
    status::check_can_ship(order)?;
    let outcome = client
        .rpc_outcome("mark_order_as_sent", &json!({ "p_order_id": order.id }))
        .await?;
    info!(order_number = %order.order_number, "order marked as sent");
    Ok(outcome)
}

pub async fn send_to_local(
    client: &SupabaseClient,
    order: &Order,
    warehouse_id: &str,
) -> Result<RpcOutcome> {
    status::check_can_ship(order)?;
    let outcome = client
        .rpc_outcome(
            "send_order_to_local",
            &json!({ "p_order_id": order.id, "p_warehouse_id": warehouse_id }),
        )
        .await?;
    info!(order_number = %order.order_number, warehouse_id, "order sent to local");
    Ok(outcome)
}

pub async fn return_order(client: &SupabaseClient, order: &Order) -> Result<RpcOutcome> {
    status::check_can_return(order)?;
    let outcome = client
        .rpc_outcome("return_order", &json!({ "p_order_id": order.id }))
        .await?;
    info!(order_number = %order.order_number, "order returned");
    Ok(outcome)
}

pub async fn list_warehouses(client: &SupabaseClient) -> Result<Vec<Warehouse>> {
    client
        .select("warehouses", &Query::new().select("*").order("name", true))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::fixtures::{item, order};
    use crate::status::OrderStatus;

    fn mixed_order() -> Order {
        order(
            "1050",
            OrderStatus::Active,
            vec![
                item("r", ItemStatus::Reserved, 100.0, 1),
                item("w", ItemStatus::Waiting, 100.0, 1),
                item("p", ItemStatus::Picked, 100.0, 1),
                item("m", ItemStatus::Missing, 100.0, 1),
                item("c", ItemStatus::Cancelled, 100.0, 1),
            ],
        )
    }

    #[test]
    fn pick_all_targets_reserved_and_waiting_only() {
        let o = mixed_order();
        assert_eq!(targets(&o, ItemStatus::Picked, pickable), vec!["r", "w"]);
    }

    #[test]
    fn cancel_targets_every_item_not_yet_cancelled() {
        let o = mixed_order();
        assert_eq!(
            targets(&o, ItemStatus::Cancelled, cancellable),
            vec!["r", "w", "p", "m"]
        );
    }

    #[test]
    fn extra_charges_from_document_array_and_text() {
        let doc = r#"{"extra_charges":[{"description":"Envío","amount":1500}]}"#;
        assert_eq!(
            parse_extra_charges(Some(doc)),
            vec![ExtraCharge {
                description: "Envío".into(),
                amount: 1500.0
            }]
        );
        let bare = r#"[{"description":"Bolsa","amount":200.5}]"#;
        assert_eq!(parse_extra_charges(Some(bare)).len(), 1);
        assert!(parse_extra_charges(Some("entregar a la tarde")).is_empty());
        assert!(parse_extra_charges(None).is_empty());
    }

    #[test]
    fn encode_notes_preserves_free_text() {
        let charges = vec![ExtraCharge {
            description: "Envío".into(),
            amount: 1500.0,
        }];
        let encoded = encode_notes(Some("tocar timbre"), &charges).unwrap();
        let v: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(v["text"], "tocar timbre");
        assert_eq!(v["extra_charges"][0]["amount"], 1500.0);
        assert_eq!(parse_extra_charges(Some(encoded.as_str())), charges);

        let reencoded = encode_notes(Some(encoded.as_str()), &[]).unwrap();
        let v: serde_json::Value = serde_json::from_str(&reencoded).unwrap();
        assert_eq!(v["text"], "tocar timbre");
        assert!(v["extra_charges"].as_array().unwrap().is_empty());
    }

    #[test]
    fn charge_argument_parsing() {
        let c = parse_charge_arg("Envío a domicilio=1500,50").unwrap();
        assert_eq!(c.description, "Envío a domicilio");
        assert_eq!(c.amount, 1500.5);
        assert!(parse_charge_arg("1500").is_err());
        assert!(parse_charge_arg("=10").is_err());
        assert!(parse_charge_arg("Envío=abc").is_err());
    }

    #[test]
    fn total_ignores_cancelled_and_missing_lines() {
        let o = order(
            "1",
            OrderStatus::Active,
            vec![
                item("a", ItemStatus::Picked, 1000.0, 2),
                item("b", ItemStatus::Missing, 500.0, 1),
                item("c", ItemStatus::Cancelled, 700.0, 1),
                item("d", ItemStatus::Picked, 333.333, 1),
            ],
        );
        let charges = vec![ExtraCharge {
            description: "Envío".into(),
            amount: 1500.0,
        }];
        assert_eq!(order_total(&o, &[]), 2333.33);
        assert_eq!(order_total(&o, &charges), 3833.33);
    }

    #[test]
    fn find_order_by_id_or_number() {
        let orders = vec![
            order("1042", OrderStatus::Active, vec![]),
            order("1043", OrderStatus::Active, vec![]),
        ];
        assert_eq!(find_order(&orders, "#1043").unwrap().order_number, "1043");
        assert_eq!(find_order(&orders, "id-1042").unwrap().order_number, "1042");
        assert!(find_order(&orders, "9999").is_none());
    }

    #[test]
    fn snapshot_roundtrip_through_local_db() {
        let db = crate::db::open_in_memory().unwrap();
        assert!(load_snapshot(&db).is_empty());
        let orders = vec![order(
            "1042",
            OrderStatus::Returned,
            vec![item("a", ItemStatus::Picked, 10.0, 1)],
        )];
        save_snapshot(&db, &orders).unwrap();
        let restored = load_snapshot(&db);
        assert_eq!(restored, orders);
        assert_eq!(summarize(&restored).returned, 1);
    }
}
