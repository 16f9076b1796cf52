//! Client cart.
//!
//! A customer has at most one `open` cart on the server; the uniqueness is
//! enforced remotely, so a conflicting create simply re-reads the existing
//! one. Before a customer is known, lines live in the local
//! `local_cart_items` table and are merged into the remote cart later.

use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::api::{Query, SupabaseClient};
use crate::db::DbState;
use crate::models::{Cart, CartItem, CartStatus, ProductVariant};
use crate::{round_cents, Error, Result};

const CARTS_TABLE: &str = "carts";
const CART_ITEMS_TABLE: &str = "cart_items";

#[derive(Debug, Serialize)]
struct NewCartLine<'a> {
    cart_id: &'a str,
    variant_id: &'a str,
    product_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    color: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    size: Option<&'a str>,
    quantity: i64,
    price: f64,
}

/// Quantity the line for `variant` would hold after adding `quantity`.
fn merged_quantity(cart_items: &[CartItem], variant: &ProductVariant, quantity: i64) -> Result<i64> {
    if quantity <= 0 {
        return Err(Error::validation("Quantity must be greater than zero"));
    }
    let current = cart_items
        .iter()
        .find(|it| it.variant_id == variant.id)
        .map(|it| it.quantity)
        .unwrap_or(0);
    let wanted = current + quantity;
    if wanted > variant.stock {
        return Err(Error::validation(format!(
            "Only {} left of {}",
            variant.stock.max(0),
            variant.product_name
        )));
    }
    Ok(wanted)
}

pub fn cart_total(cart: &Cart) -> f64 {
    round_cents(cart.cart_items.iter().map(CartItem::line_total).sum())
}

// ---------------------------------------------------------------------------
// Remote cart
// ---------------------------------------------------------------------------

async fn find_open_cart(client: &SupabaseClient, customer_id: &str) -> Result<Option<Cart>> {
    let rows: Vec<Cart> = client
        .select(
            CARTS_TABLE,
            &Query::new()
                .select("*,cart_items(*)")
                .eq("customer_id", customer_id)
                .eq("status", "open")
                .order("created_at", false)
                .limit(1),
        )
        .await?;
    Ok(rows.into_iter().next())
}

pub async fn get_cart(client: &SupabaseClient, cart_id: &str) -> Result<Cart> {
    let rows: Vec<Cart> = client
        .select(
            CARTS_TABLE,
            &Query::new().select("*,cart_items(*)").eq("id", cart_id).limit(1),
        )
        .await?;
    rows.into_iter()
        .next()
        .ok_or_else(|| Error::NotFound(format!("cart {cart_id}")))
}

/// The customer's open cart, created if needed.
pub async fn open_cart(client: &SupabaseClient, customer_id: &str) -> Result<Cart> {
    if let Some(cart) = find_open_cart(client, customer_id).await? {
        return Ok(cart);
    }
    let body = json!({ "customer_id": customer_id, "status": "open" });
    match client.insert::<Cart, _>(CARTS_TABLE, &body).await {
        Ok(rows) => {
            let cart = rows
                .into_iter()
                .next()
                .ok_or_else(|| Error::Rejected("cart insert returned no row".into()))?;
            info!(cart_id = %cart.id, customer_id, "cart created");
            Ok(cart)
        }
        Err(Error::Conflict(_)) => {
            // Another session created it first.
            find_open_cart(client, customer_id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("open cart for customer {customer_id}")))
        }
        Err(e) => Err(e),
    }
}

async fn write_line(
    client: &SupabaseClient,
    cart: &Cart,
    variant: &ProductVariant,
    quantity: i64,
) -> Result<CartItem> {
    let existing = cart.cart_items.iter().find(|it| it.variant_id == variant.id);
    let rows: Vec<CartItem> = match existing {
        Some(line) => {
            client
                .update(
                    CART_ITEMS_TABLE,
                    &Query::new().eq("id", &line.id),
                    &json!({ "quantity": quantity }),
                )
                .await?
        }
        None => {
            let line = NewCartLine {
                cart_id: &cart.id,
                variant_id: &variant.id,
                product_name: &variant.product_name,
                color: variant.color.as_deref(),
                size: variant.size.as_deref(),
                quantity,
                price: variant.price,
            };
            client.insert(CART_ITEMS_TABLE, &line).await?
        }
    };
    rows.into_iter()
        .next()
        .ok_or_else(|| Error::Rejected("cart line write returned no row".into()))
}

/// Add `quantity` units of `variant`, merging into an existing line.
pub async fn add_item(
    client: &SupabaseClient,
    cart: &Cart,
    variant: &ProductVariant,
    quantity: i64,
) -> Result<CartItem> {
    if cart.status != CartStatus::Open {
        return Err(Error::validation("Cart is no longer open"));
    }
    let wanted = merged_quantity(&cart.cart_items, variant, quantity)?;
    let line = write_line(client, cart, variant, wanted).await?;
    info!(cart_id = %cart.id, variant_id = %variant.id, quantity = wanted, "cart line saved");
    Ok(line)
}

/// Set a line's quantity; zero removes the line. Returns the updated line.
pub async fn set_quantity(
    client: &SupabaseClient,
    item: &CartItem,
    quantity: i64,
    stock: Option<i64>,
) -> Result<Option<CartItem>> {
    if quantity < 0 {
        return Err(Error::validation("Quantity cannot be negative"));
    }
    if quantity == 0 {
        remove_item(client, &item.id).await?;
        return Ok(None);
    }
    if let Some(stock) = stock {
        if quantity > stock {
            return Err(Error::validation(format!("Only {} left", stock.max(0))));
        }
    }
    let rows: Vec<CartItem> = client
        .update(
            CART_ITEMS_TABLE,
            &Query::new().eq("id", &item.id),
            &json!({ "quantity": quantity }),
        )
        .await?;
    Ok(rows.into_iter().next())
}

pub async fn remove_item(client: &SupabaseClient, item_id: &str) -> Result<()> {
    client
        .delete(CART_ITEMS_TABLE, &Query::new().eq("id", item_id))
        .await
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckoutReceipt {
    pub order_id: Option<String>,
    pub order_number: Option<String>,
    pub total: f64,
}

/// Turn the cart into an order. The server marks the cart `pending`.
pub async fn checkout(client: &SupabaseClient, cart: &Cart) -> Result<CheckoutReceipt> {
    if cart.status != CartStatus::Open {
        return Err(Error::validation("Cart is no longer open"));
    }
    if cart.cart_items.is_empty() {
        return Err(Error::validation("Cart is empty"));
    }
    let outcome = client
        .rpc_outcome("create_order_from_cart", &json!({ "p_cart_id": cart.id }))
        .await?;
    let receipt = CheckoutReceipt {
        order_id: outcome.get_str("order_id").map(str::to_string),
        order_number: outcome.get_str("order_number").map(str::to_string),
        total: cart_total(cart),
    };
    info!(
        cart_id = %cart.id,
        order_number = receipt.order_number.as_deref().unwrap_or("?"),
        "cart checked out"
    );
    Ok(receipt)
}

// ---------------------------------------------------------------------------
// Guest cart (local)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuestLine {
    pub variant_id: String,
    pub product_name: String,
    pub color: Option<String>,
    pub size: Option<String>,
    pub quantity: i64,
    pub price: f64,
}

pub fn guest_lines(db: &DbState) -> Result<Vec<GuestLine>> {
    let conn = db.lock();
    let mut stmt = conn.prepare(
        "SELECT variant_id, product_name, color, size, quantity, price
         FROM local_cart_items ORDER BY added_at, variant_id",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(GuestLine {
            variant_id: row.get(0)?,
            product_name: row.get(1)?,
            color: row.get(2)?,
            size: row.get(3)?,
            quantity: row.get(4)?,
            price: row.get(5)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn guest_total(lines: &[GuestLine]) -> f64 {
    round_cents(lines.iter().map(|l| l.price * l.quantity as f64).sum())
}

pub fn guest_add(db: &DbState, variant: &ProductVariant, quantity: i64) -> Result<GuestLine> {
    let current: Vec<CartItem> = guest_lines(db)?
        .into_iter()
        .map(|l| CartItem {
            id: String::new(),
            cart_id: String::new(),
            variant_id: l.variant_id,
            product_name: l.product_name,
            color: l.color,
            size: l.size,
            quantity: l.quantity,
            price: l.price,
        })
        .collect();
    let wanted = merged_quantity(&current, variant, quantity)?;
    let line = GuestLine {
        variant_id: variant.id.clone(),
        product_name: variant.product_name.clone(),
        color: variant.color.clone(),
        size: variant.size.clone(),
        quantity: wanted,
        price: variant.price,
    };
    let conn = db.lock();
    conn.execute(
        "INSERT INTO local_cart_items (variant_id, product_name, color, size, quantity, price)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(variant_id) DO UPDATE SET
            quantity = excluded.quantity,
            price = excluded.price",
        params![
            line.variant_id,
            line.product_name,
            line.color,
            line.size,
            line.quantity,
            line.price
        ],
    )?;
    Ok(line)
}

/// Zero removes the line.
pub fn guest_set_quantity(db: &DbState, variant_id: &str, quantity: i64) -> Result<()> {
    if quantity < 0 {
        return Err(Error::validation("Quantity cannot be negative"));
    }
    let conn = db.lock();
    let changed = if quantity == 0 {
        conn.execute(
            "DELETE FROM local_cart_items WHERE variant_id = ?1",
            params![variant_id],
        )?
    } else {
        conn.execute(
            "UPDATE local_cart_items SET quantity = ?2 WHERE variant_id = ?1",
            params![variant_id, quantity],
        )?
    };
    if changed == 0 {
        return Err(Error::NotFound(format!("guest cart line {variant_id}")));
    }
    Ok(())
}

pub fn guest_clear(db: &DbState) -> Result<usize> {
    let conn = db.lock();
    Ok(conn.execute("DELETE FROM local_cart_items", [])?)
}

/// Drop one guest line once it lives in the remote cart.
fn guest_remove(db: &DbState, variant_id: &str) -> Result<()> {
    let conn = db.lock();
    conn.execute(
        "DELETE FROM local_cart_items WHERE variant_id = ?1",
        params![variant_id],
    )?;
    Ok(())
}

/// Remote quantity for each guest line: what the cart already holds for the
/// variant plus the guest quantity.
fn plan_merge<'a>(cart_items: &[CartItem], lines: &'a [GuestLine]) -> Vec<(&'a GuestLine, i64)> {
    lines
        .iter()
        .map(|line| {
            let existing = cart_items
                .iter()
                .find(|it| it.variant_id == line.variant_id)
                .map(|it| it.quantity)
                .unwrap_or(0);
            (line, existing + line.quantity)
        })
        .collect()
}

/// Push the guest lines into the customer's open cart. Each line leaves the
/// local table as soon as it is written, so a failed merge can be retried
/// without adding the same units twice.
pub async fn merge_guest_cart(
    client: &SupabaseClient,
    db: &DbState,
    customer_id: &str,
) -> Result<Cart> {
    let lines = guest_lines(db)?;
    let cart = open_cart(client, customer_id).await?;
    if lines.is_empty() {
        return Ok(cart);
    }
    for (line, target) in plan_merge(&cart.cart_items, &lines) {
        let result = async {
            let variant = crate::catalog::get_variant(client, &line.variant_id).await?;
            if target > variant.stock {
                return Err(Error::validation(format!(
                    "Only {} left of {}",
                    variant.stock.max(0),
                    variant.product_name
                )));
            }
            write_line(client, &cart, &variant, target).await
        }
        .await;
        if let Err(e) = result {
            warn!(variant_id = %line.variant_id, "guest line merge failed: {e}");
            return Err(e);
        }
        guest_remove(db, &line.variant_id)?;
    }
    info!(cart_id = %cart.id, lines = lines.len(), "guest cart merged");
    get_cart(client, &cart.id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;

    fn variant(id: &str, price: f64, stock: i64) -> ProductVariant {
        ProductVariant {
            id: id.into(),
            product_id: None,
            sku: None,
            product_name: format!("Producto {id}"),
            color: Some("Azul".into()),
            size: Some("L".into()),
            price,
            stock,
            category: None,
            product_type: None,
            image_url: None,
            active: true,
        }
    }

    fn line(variant_id: &str, quantity: i64, price: f64) -> CartItem {
        CartItem {
            id: format!("line-{variant_id}"),
            cart_id: "cart-1".into(),
            variant_id: variant_id.into(),
            product_name: "x".into(),
            color: None,
            size: None,
            quantity,
            price,
        }
    }

    #[test]
    fn merged_quantity_adds_to_existing_line() {
        let items = vec![line("v1", 2, 100.0)];
        assert_eq!(merged_quantity(&items, &variant("v1", 100.0, 5), 3).unwrap(), 5);
        assert_eq!(merged_quantity(&items, &variant("v2", 100.0, 5), 1).unwrap(), 1);
    }

    #[test]
    fn merged_quantity_rejects_bad_amounts() {
        let items = vec![line("v1", 2, 100.0)];
        assert!(merged_quantity(&items, &variant("v1", 100.0, 5), 0).is_err());
        assert!(merged_quantity(&items, &variant("v1", 100.0, 5), -1).is_err());
        let err = merged_quantity(&items, &variant("v1", 100.0, 3), 2).unwrap_err();
        assert!(err.to_string().contains("Only 3 left"));
    }

    #[test]
    fn cart_total_sums_lines() {
        let cart = Cart {
            id: "cart-1".into(),
            customer_id: Some("c1".into()),
            status: CartStatus::Open,
            created_at: None,
            cart_items: vec![line("v1", 2, 1500.5), line("v2", 1, 99.99)],
        };
        assert_eq!(cart_total(&cart), 3100.99);
    }

    #[test]
    fn guest_cart_merges_and_removes() {
        let db = open_in_memory().unwrap();
        let v1 = variant("v1", 1200.0, 4);
        guest_add(&db, &v1, 1).unwrap();
        let merged = guest_add(&db, &v1, 2).unwrap();
        assert_eq!(merged.quantity, 3);
        assert!(guest_add(&db, &v1, 2).is_err());

        guest_add(&db, &variant("v2", 300.0, 10), 2).unwrap();
        let lines = guest_lines(&db).unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(guest_total(&lines), 4200.0);

        guest_set_quantity(&db, "v1", 0).unwrap();
        assert_eq!(guest_lines(&db).unwrap().len(), 1);
        assert!(guest_set_quantity(&db, "v1", 1).is_err());

        assert_eq!(guest_clear(&db).unwrap(), 1);
        assert!(guest_lines(&db).unwrap().is_empty());
    }

    #[test]
    fn interrupted_merge_only_replays_unmerged_lines() {
        let db = open_in_memory().unwrap();
        guest_add(&db, &variant("v1", 100.0, 10), 2).unwrap();
        guest_add(&db, &variant("v2", 50.0, 10), 1).unwrap();

        let lines = guest_lines(&db).unwrap();
        let plan = plan_merge(&[line("v2", 3, 50.0)], &lines);
        let targets: Vec<(&str, i64)> = plan
            .iter()
            .map(|(l, q)| (l.variant_id.as_str(), *q))
            .collect();
        assert_eq!(targets, vec![("v1", 2), ("v2", 4)]);

        // v1 reached the remote cart, v2 failed.
        guest_remove(&db, "v1").unwrap();
        let remaining = guest_lines(&db).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].variant_id, "v2");

        // The retry sees v1 already remote and leaves its quantity alone.
        let remote = [line("v1", 2, 100.0), line("v2", 3, 50.0)];
        let retry = plan_merge(&remote, &remaining);
        assert_eq!(retry.len(), 1);
        assert_eq!(retry[0].0.variant_id, "v2");
        assert_eq!(retry[0].1, 4);
    }
}
