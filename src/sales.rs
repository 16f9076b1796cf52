//! Daily sales ledger and payment methods.

use chrono::NaiveDate;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::api::{Query, SupabaseClient};
use crate::models::{DailySale, PaymentMethod, PaymentMethodTotal, SalesSummary};
use crate::{round_cents, Error, Result};

const SALES_TABLE: &str = "daily_sales";
const PAYMENT_METHODS_TABLE: &str = "payment_methods";
const UNASSIGNED_METHOD: &str = "Sin medio de pago";

#[derive(Debug, Clone, Serialize)]
pub struct NewSale {
    pub sale_date: NaiveDate,
    pub amount: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_method_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

pub async fn record_sale(client: &SupabaseClient, sale: NewSale) -> Result<DailySale> {
    if !(sale.amount.is_finite() && sale.amount > 0.0) {
        return Err(Error::validation("Sale amount must be greater than zero"));
    }
    let sale = NewSale {
        amount: round_cents(sale.amount),
        description: sale
            .description
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty()),
        ..sale
    };
    let rows: Vec<DailySale> = client.insert(SALES_TABLE, &sale).await?;
    let created = rows
        .into_iter()
        .next()
        .ok_or_else(|| Error::Rejected("sale insert returned no row".into()))?;
    info!(sale_date = %created.sale_date, amount = created.amount, "sale recorded");
    Ok(created)
}

pub async fn sales_for_day(client: &SupabaseClient, date: NaiveDate) -> Result<Vec<DailySale>> {
    client
        .select(
            SALES_TABLE,
            &Query::new()
                .select("*,payment_methods(*)")
                .eq("sale_date", date)
                .order("created_at", true),
        )
        .await
}

/// Totals for `date`, from the server when it has them, otherwise computed
/// from that day's rows.
pub async fn daily_summary(client: &SupabaseClient, date: NaiveDate) -> Result<SalesSummary> {
    let value = client
        .rpc_value("get_daily_sales_summary", &json!({ "p_date": date }))
        .await?;
    if let Some(summary) = parse_summary(date, &value) {
        return Ok(summary);
    }
    debug!(%date, "summary procedure returned nothing, aggregating locally");
    let sales = sales_for_day(client, date).await?;
    Ok(summarize_sales(date, &sales))
}

/// Accepts the envelope `{total, count, by_payment_method}` or a bare list of
/// per-method rows. Returns `None` for an empty answer.
fn parse_summary(date: NaiveDate, value: &Value) -> Option<SalesSummary> {
    match value {
        Value::Array(rows) if rows.is_empty() => None,
        Value::Array(rows) => {
            let by_method: Vec<PaymentMethodTotal> = rows
                .iter()
                .filter_map(|row| {
                    Some(PaymentMethodTotal {
                        name: crate::value_str(row, &["name", "payment_method", "method"])
                            .unwrap_or_else(|| UNASSIGNED_METHOD.to_string()),
                        total: crate::value_f64(row, &["total", "amount"])?,
                        count: row.get("count").and_then(Value::as_i64).unwrap_or(0),
                    })
                })
                .collect();
            if by_method.is_empty() {
                return None;
            }
            Some(SalesSummary {
                date: Some(date),
                total: round_cents(by_method.iter().map(|m| m.total).sum()),
                count: by_method.iter().map(|m| m.count).sum(),
                by_payment_method: by_method,
            })
        }
        Value::Object(_) => {
            let mut summary: SalesSummary = serde_json::from_value(value.clone()).ok()?;
            if summary.count == 0 && summary.by_payment_method.is_empty() {
                return None;
            }
            summary.date.get_or_insert(date);
            Some(summary)
        }
        _ => None,
    }
}

/// Aggregate sale rows per payment method, largest total first.
pub fn summarize_sales(date: NaiveDate, sales: &[DailySale]) -> SalesSummary {
    let mut by_name: BTreeMap<String, (f64, i64)> = BTreeMap::new();
    for sale in sales.iter().filter(|s| s.sale_date == date) {
        let name = sale
            .payment_methods
            .as_ref()
            .map(|m| m.name.clone())
            .unwrap_or_else(|| UNASSIGNED_METHOD.to_string());
        let entry = by_name.entry(name).or_insert((0.0, 0));
        entry.0 += sale.amount;
        entry.1 += 1;
    }
    let mut by_payment_method: Vec<PaymentMethodTotal> = by_name
        .into_iter()
        .map(|(name, (total, count))| PaymentMethodTotal {
            name,
            total: round_cents(total),
            count,
        })
        .collect();
    by_payment_method.sort_by(|a, b| b.total.total_cmp(&a.total));
    SalesSummary {
        date: Some(date),
        total: round_cents(by_payment_method.iter().map(|m| m.total).sum()),
        count: by_payment_method.iter().map(|m| m.count).sum(),
        by_payment_method,
    }
}

// ---------------------------------------------------------------------------
// Payment methods
// ---------------------------------------------------------------------------

pub async fn list_payment_methods(client: &SupabaseClient) -> Result<Vec<PaymentMethod>> {
    client
        .select(
            PAYMENT_METHODS_TABLE,
            &Query::new().select("*").order("name", true),
        )
        .await
}

pub fn find_payment_method<'a>(methods: &'a [PaymentMethod], name: &str) -> Option<&'a PaymentMethod> {
    let wanted = name.trim().to_lowercase();
    methods
        .iter()
        .find(|m| m.id == name.trim() || m.name.trim().to_lowercase() == wanted)
}

/// Create a payment method, or return the existing one with the same name.
pub async fn create_payment_method(client: &SupabaseClient, name: &str) -> Result<PaymentMethod> {
    let name = name.split_whitespace().collect::<Vec<_>>().join(" ");
    if name.is_empty() {
        return Err(Error::validation("Payment method name is required"));
    }
    let existing = list_payment_methods(client).await?;
    if let Some(found) = find_payment_method(&existing, &name) {
        debug!(payment_method = %found.name, "payment method already exists");
        return Ok(found.clone());
    }
    let rows: Vec<PaymentMethod> = client
        .insert(PAYMENT_METHODS_TABLE, &json!({ "name": name }))
        .await?;
    let created = rows
        .into_iter()
        .next()
        .ok_or_else(|| Error::Rejected("payment method insert returned no row".into()))?;
    info!(payment_method = %created.name, "payment method created");
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 14).unwrap()
    }

    fn sale(amount: f64, method: Option<&str>) -> DailySale {
        DailySale {
            id: "s".into(),
            sale_date: day(),
            amount,
            payment_method_id: method.map(|m| format!("pm-{m}")),
            order_id: None,
            description: None,
            payment_methods: method.map(|m| PaymentMethod {
                id: format!("pm-{m}"),
                name: m.into(),
            }),
        }
    }

    #[test]
    fn local_summary_groups_by_method() {
        let mut other_day = sale(999.0, Some("Efectivo"));
        other_day.sale_date = NaiveDate::from_ymd_opt(2026, 3, 13).unwrap();
        let sales = vec![
            sale(1000.0, Some("Efectivo")),
            sale(2500.5, Some("Transferencia")),
            sale(200.25, Some("Efectivo")),
            sale(50.0, None),
            other_day,
        ];
        let summary = summarize_sales(day(), &sales);
        assert_eq!(summary.count, 4);
        assert_eq!(summary.total, 3750.75);
        assert_eq!(summary.by_payment_method[0].name, "Transferencia");
        assert_eq!(summary.by_payment_method[1].name, "Efectivo");
        assert_eq!(summary.by_payment_method[1].total, 1200.25);
        assert_eq!(summary.by_payment_method[1].count, 2);
        assert_eq!(summary.by_payment_method[2].name, UNASSIGNED_METHOD);
    }

    #[test]
    fn parse_summary_handles_both_shapes() {
        let rows = json!([
            { "payment_method": "Efectivo", "total": "1500.50", "count": 3 },
            { "payment_method": "Débito", "total": 200, "count": 1 }
        ]);
        let summary = parse_summary(day(), &rows).unwrap();
        assert_eq!(summary.total, 1700.5);
        assert_eq!(summary.count, 4);

        let envelope = json!({
            "total": 900,
            "count": 2,
            "by_payment_method": [{ "name": "Efectivo", "total": 900, "count": 2 }]
        });
        let summary = parse_summary(day(), &envelope).unwrap();
        assert_eq!(summary.date, Some(day()));
        assert_eq!(summary.by_payment_method.len(), 1);
    }

    #[test]
    fn empty_summary_falls_back() {
        assert!(parse_summary(day(), &Value::Null).is_none());
        assert!(parse_summary(day(), &json!([])).is_none());
        assert!(parse_summary(day(), &json!({ "total": 0, "count": 0 })).is_none());
    }

    #[test]
    fn payment_method_lookup_is_case_insensitive() {
        let methods = vec![
            PaymentMethod { id: "1".into(), name: "Efectivo".into() },
            PaymentMethod { id: "2".into(), name: "Mercado Pago".into() },
        ];
        assert_eq!(find_payment_method(&methods, " mercado pago ").unwrap().id, "2");
        assert_eq!(find_payment_method(&methods, "1").unwrap().name, "Efectivo");
        assert!(find_payment_method(&methods, "Cheque").is_none());
    }
}
