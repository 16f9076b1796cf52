//! Customer directory.

use serde_json::json;
use tracing::info;

use crate::api::{sanitize_filter_value, Query, SupabaseClient};
use crate::models::{Customer, NewCustomer};
use crate::{Error, Result};

const CUSTOMERS_TABLE: &str = "customers";
const SEARCH_LIMIT: usize = 50;

pub fn normalize_phone(value: &str) -> String {
    value.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// DNI numbers are often typed with dots ("30.123.456").
pub fn normalize_dni(value: &str) -> String {
    normalize_phone(value)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Trim every field, normalize phone and dni, and require a name.
pub fn clean_customer(mut c: NewCustomer) -> Result<NewCustomer> {
    c.name = c.name.split_whitespace().collect::<Vec<_>>().join(" ");
    if c.name.is_empty() {
        return Err(Error::validation("Customer name is required"));
    }
    c.phone = non_empty(c.phone.map(|p| normalize_phone(&p)));
    c.dni = non_empty(c.dni.map(|d| normalize_dni(&d)));
    c.email = non_empty(c.email.map(|e| e.to_lowercase()));
    c.address = non_empty(c.address);
    c.city = non_empty(c.city);
    c.province = non_empty(c.province);
    if let Some(email) = c.email.as_deref() {
        if !email.contains('@') {
            return Err(Error::validation(format!("Invalid email: {email}")));
        }
    }
    Ok(c)
}

/// PostgREST `or` expression searching the usual identifying columns.
pub fn search_expression(query: &str) -> Option<String> {
    let term = sanitize_filter_value(query);
    if term.is_empty() {
        return None;
    }
    let mut parts = vec![
        format!("name.ilike.*{term}*"),
        format!("email.ilike.*{term}*"),
    ];
    let digits = normalize_phone(&term);
    if !digits.is_empty() {
        parts.push(format!("phone.ilike.*{digits}*"));
        parts.push(format!("dni.ilike.*{digits}*"));
    }
    Some(parts.join(","))
}

pub async fn search_customers(client: &SupabaseClient, query: &str) -> Result<Vec<Customer>> {
    let mut q = Query::new().select("*").order("name", true).limit(SEARCH_LIMIT);
    if let Some(expr) = search_expression(query) {
        q = q.or(&expr);
    }
    client.select(CUSTOMERS_TABLE, &q).await
}

pub async fn get_customer(client: &SupabaseClient, id: &str) -> Result<Customer> {
    let rows: Vec<Customer> = client
        .select(CUSTOMERS_TABLE, &Query::new().select("*").eq("id", id).limit(1))
        .await?;
    rows.into_iter()
        .next()
        .ok_or_else(|| Error::NotFound(format!("customer {id}")))
}

pub async fn create_customer(client: &SupabaseClient, customer: NewCustomer) -> Result<Customer> {
    let customer = clean_customer(customer)?;
    let rows: Vec<Customer> = client.insert(CUSTOMERS_TABLE, &customer).await?;
    let created = rows
        .into_iter()
        .next()
        .ok_or_else(|| Error::Rejected("customer insert returned no row".into()))?;
    info!(customer_id = %created.id, "customer created");
    Ok(created)
}

pub async fn update_customer(
    client: &SupabaseClient,
    id: &str,
    customer: NewCustomer,
) -> Result<Customer> {
    let customer = clean_customer(customer)?;
    let rows: Vec<Customer> = client
        .update(CUSTOMERS_TABLE, &Query::new().eq("id", id), &customer)
        .await?;
    rows.into_iter()
        .next()
        .ok_or_else(|| Error::NotFound(format!("customer {id}")))
}

/// Create many customers in one call. Returns how many the server created.
pub async fn bulk_create(client: &SupabaseClient, customers: &[NewCustomer]) -> Result<usize> {
    if customers.is_empty() {
        return Ok(0);
    }
    let outcome = client
        .rpc_outcome("bulk_create_customers", &json!({ "p_customers": customers }))
        .await?;
    let created = outcome
        .extra
        .get("created")
        .or_else(|| outcome.extra.get("inserted"))
        .and_then(|v| v.as_u64())
        .map(|n| n as usize)
        .unwrap_or(customers.len());
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phone_and_dni_keep_digits_only() {
        assert_eq!(normalize_phone("+54 9 (351) 444-0000"), "5493514440000");
        assert_eq!(normalize_dni("30.123.456"), "30123456");
    }

    #[test]
    fn clean_customer_normalizes_fields() {
        let cleaned = clean_customer(NewCustomer {
            name: "  Ana   Pérez ".into(),
            phone: Some("11 5555-1234".into()),
            dni: Some("30.123.456".into()),
            email: Some(" Ana@Mail.com ".into()),
            address: Some("   ".into()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(cleaned.name, "Ana Pérez");
        assert_eq!(cleaned.phone.as_deref(), Some("1155551234"));
        assert_eq!(cleaned.dni.as_deref(), Some("30123456"));
        assert_eq!(cleaned.email.as_deref(), Some("ana@mail.com"));
        assert_eq!(cleaned.address, None);
    }

    #[test]
    fn clean_customer_rejects_missing_name_and_bad_email() {
        assert!(clean_customer(NewCustomer::default()).is_err());
        assert!(clean_customer(NewCustomer {
            name: "Ana".into(),
            email: Some("not-an-email".into()),
            ..Default::default()
        })
        .is_err());
    }

    #[test]
    fn search_expression_adds_digit_columns_only_for_numbers() {
        assert_eq!(
            search_expression("ana").unwrap(),
            "name.ilike.*ana*,email.ilike.*ana*"
        );
        let numeric = search_expression("30.123").unwrap();
        assert!(numeric.contains("phone.ilike.*30123*"));
        assert!(numeric.contains("dni.ilike.*30123*"));
        assert_eq!(search_expression(" (), "), None);
    }
}
