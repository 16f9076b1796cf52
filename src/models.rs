//! Rows owned by the hosted backend, as the client reads and writes them.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::status::{ItemStatus, OrderStatus};

/// Ids arrive as numbers or uuid strings depending on the table; keep them
/// as strings on the client.
fn id_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Null => Ok(String::new()),
        other => Err(serde::de::Error::custom(format!("invalid id: {other}"))),
    }
}

fn opt_id_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let id = id_string(deserializer)?;
    Ok(if id.is_empty() { None } else { Some(id) })
}

/// Numeric columns (`numeric` in Postgres) may be serialized as strings.
fn lenient_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Number(n) => Ok(n.as_f64().unwrap_or(0.0)),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|e| serde::de::Error::custom(format!("invalid number {s:?}: {e}"))),
        Value::Null => Ok(0.0),
        other => Err(serde::de::Error::custom(format!("invalid number: {other}"))),
    }
}

/// PostgREST sends `null` for empty nullable columns; read it as the default.
fn null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

fn quantity_or_one<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<i64>::deserialize(deserializer).map(|q| q.unwrap_or(1))
}

// ---------------------------------------------------------------------------
// Customers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    #[serde(deserialize_with = "id_string", default)]
    pub id: String,
    #[serde(default, deserialize_with = "null_default")]
    pub name: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub dni: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub province: Option<String>,
    #[serde(default, deserialize_with = "opt_id_string")]
    pub customer_number: Option<String>,
}

/// Columns sent when creating or updating a customer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewCustomer {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dni: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub province: Option<String>,
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(default, deserialize_with = "id_string")]
    pub order_id: String,
    #[serde(default, deserialize_with = "null_default")]
    pub product_name: String,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default = "one", deserialize_with = "quantity_or_one")]
    pub quantity: i64,
    /// Price snapshot taken when the item was reserved.
    #[serde(default, deserialize_with = "lenient_f64")]
    pub price: f64,
    pub status: ItemStatus,
    #[serde(default, deserialize_with = "opt_id_string")]
    pub variant_id: Option<String>,
}

fn one() -> i64 {
    1
}

impl OrderItem {
    pub fn line_total(&self) -> f64 {
        self.price * self.quantity.max(0) as f64
    }

    /// "Remera básica (Negro / M)".
    pub fn label(&self) -> String {
        let attrs: Vec<&str> = [self.color.as_deref(), self.size.as_deref()]
            .into_iter()
            .flatten()
            .filter(|s| !s.trim().is_empty())
            .collect();
        if attrs.is_empty() {
            self.product_name.clone()
        } else {
            format!("{} ({})", self.product_name, attrs.join(" / "))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(default, deserialize_with = "id_string")]
    pub order_number: String,
    pub status: OrderStatus,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub total_amount: f64,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "opt_id_string")]
    pub customer_id: Option<String>,
    /// Free text; its JSON form carries extra charges.
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default, alias = "items")]
    pub order_items: Vec<OrderItem>,
    #[serde(default, alias = "customer")]
    pub customers: Option<Customer>,
}

impl Order {
    pub fn item(&self, item_id: &str) -> Option<&OrderItem> {
        self.order_items.iter().find(|i| i.id == item_id)
    }

    pub fn customer_name(&self) -> &str {
        self.customers
            .as_ref()
            .map(|c| c.name.as_str())
            .unwrap_or("")
    }
}

// ---------------------------------------------------------------------------
// Carts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CartStatus {
    Open,
    Pending,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cart {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(default, deserialize_with = "opt_id_string")]
    pub customer_id: Option<String>,
    pub status: CartStatus,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cart_items: Vec<CartItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartItem {
    #[serde(default, deserialize_with = "id_string")]
    pub id: String,
    #[serde(default, deserialize_with = "id_string")]
    pub cart_id: String,
    #[serde(deserialize_with = "id_string")]
    pub variant_id: String,
    #[serde(default, deserialize_with = "null_default")]
    pub product_name: String,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default = "one", deserialize_with = "quantity_or_one")]
    pub quantity: i64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub price: f64,
}

impl CartItem {
    pub fn line_total(&self) -> f64 {
        self.price * self.quantity.max(0) as f64
    }
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductVariant {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(default, deserialize_with = "opt_id_string")]
    pub product_id: Option<String>,
    #[serde(default)]
    pub sku: Option<String>,
    #[serde(default, deserialize_with = "null_default")]
    pub product_name: String,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub price: f64,
    #[serde(default, deserialize_with = "null_default")]
    pub stock: i64,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default, rename = "type")]
    pub product_type: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Promotion {
    #[serde(deserialize_with = "id_string")]
    pub variant_id: String,
    #[serde(default, deserialize_with = "opt_id_string")]
    pub promotion_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub discount_percent: Option<f64>,
    #[serde(default)]
    pub promo_price: Option<f64>,
}

// ---------------------------------------------------------------------------
// Sales & payments
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentMethod {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(default, deserialize_with = "null_default")]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailySale {
    #[serde(default, deserialize_with = "id_string")]
    pub id: String,
    pub sale_date: NaiveDate,
    #[serde(deserialize_with = "lenient_f64")]
    pub amount: f64,
    #[serde(default, deserialize_with = "opt_id_string")]
    pub payment_method_id: Option<String>,
    #[serde(default, deserialize_with = "opt_id_string")]
    pub order_id: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub payment_methods: Option<PaymentMethod>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PaymentMethodTotal {
    pub name: String,
    #[serde(deserialize_with = "lenient_f64")]
    pub total: f64,
    #[serde(default)]
    pub count: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SalesSummary {
    #[serde(default)]
    pub date: Option<NaiveDate>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub total: f64,
    #[serde(default)]
    pub count: i64,
    #[serde(default)]
    pub by_payment_method: Vec<PaymentMethodTotal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Warehouse {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(default, deserialize_with = "null_default")]
    pub name: String,
    #[serde(default)]
    pub address: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_with_embedded_rows_deserializes() {
        let raw = serde_json::json!({
            "id": 17,
            "order_number": 1042,
            "status": "active",
            "total_amount": "25000.50",
            "created_at": "2026-03-01T12:00:00Z",
            "customer_id": 5,
            "notes": null,
            "order_items": [
                { "id": 1, "order_id": 17, "product_name": "Remera", "color": "Negro",
                  "size": "M", "quantity": 2, "price": 5000, "status": "reserved",
                  "variant_id": 33 }
            ],
            "customers": { "id": 5, "name": "Ana Pérez", "phone": "11 5555-1234" }
        });
        let order: Order = serde_json::from_value(raw).unwrap();
        assert_eq!(order.id, "17");
        assert_eq!(order.order_number, "1042");
        assert_eq!(order.total_amount, 25000.5);
        assert_eq!(order.customer_name(), "Ana Pérez");
        assert_eq!(order.order_items[0].variant_id.as_deref(), Some("33"));
        assert_eq!(order.order_items[0].label(), "Remera (Negro / M)");
        assert_eq!(order.order_items[0].line_total(), 10000.0);
    }

    #[test]
    fn null_columns_fall_back_to_defaults() {
        let raw = serde_json::json!([
            { "id": 1, "status": "active", "customers": { "id": 5, "name": "Ana" } },
            { "id": 2, "status": "picked", "customers": { "id": 6, "name": null },
              "order_items": [
                  { "id": 9, "status": "picked", "price": 100,
                    "quantity": null, "product_name": null }
              ] }
        ]);
        let orders: Vec<Order> = serde_json::from_value(raw).unwrap();
        assert_eq!(orders.len(), 2);
        assert_eq!(orders[1].customer_name(), "");
        let item = &orders[1].order_items[0];
        assert_eq!(item.quantity, 1);
        assert_eq!(item.product_name, "");
        assert_eq!(item.line_total(), 100.0);

        let variant: ProductVariant = serde_json::from_value(serde_json::json!({
            "id": 3, "product_name": null, "stock": null
        }))
        .unwrap();
        assert_eq!(variant.stock, 0);

        let line: CartItem = serde_json::from_value(serde_json::json!({
            "id": 4, "variant_id": 3, "quantity": null
        }))
        .unwrap();
        assert_eq!(line.quantity, 1);

        let method: PaymentMethod =
            serde_json::from_value(serde_json::json!({ "id": 1, "name": null })).unwrap();
        assert_eq!(method.name, "");
    }

    #[test]
    fn unknown_item_status_is_rejected() {
        let raw = serde_json::json!({ "id": 1, "status": "lost", "price": 1 });
        assert!(serde_json::from_value::<OrderItem>(raw).is_err());
    }

    #[test]
    fn new_customer_skips_empty_optionals() {
        let c = NewCustomer {
            name: "Ana".into(),
            phone: Some("1155551234".into()),
            ..Default::default()
        };
        let v = serde_json::to_value(&c).unwrap();
        assert_eq!(v, serde_json::json!({ "name": "Ana", "phone": "1155551234" }));
    }
}
