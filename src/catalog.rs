//! Client catalog: in-stock variants, promotions and the type list per
//! category.
//!
//! Variant lists are written to the local `catalog_cache` table after every
//! successful fetch and served from there when the backend is unreachable.

use rusqlite::params;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::api::{Query, SupabaseClient};
use crate::db::DbState;
use crate::models::{ProductVariant, Promotion};
use crate::{round_cents, Result};

const VARIANTS_TABLE: &str = "product_variants";

// ---------------------------------------------------------------------------
// Filter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariantFilter {
    pub category: Option<String>,
    pub product_type: Option<String>,
}

impl VariantFilter {
    fn cache_key(&self) -> String {
        format!(
            "variants:{}:{}",
            self.category.as_deref().unwrap_or("*").to_lowercase(),
            self.product_type.as_deref().unwrap_or("*").to_lowercase()
        )
    }

    fn query(&self) -> Query {
        let mut q = Query::new()
            .select("*")
            .eq("active", true)
            .gt("stock", 0)
            .order("product_name", true);
        if let Some(category) = self.category.as_deref() {
            q = q.eq("category", category);
        }
        if let Some(kind) = self.product_type.as_deref() {
            q = q.eq("type", kind);
        }
        q
    }

    fn admits(&self, v: &ProductVariant) -> bool {
        let same = |want: &Option<String>, have: &Option<String>| match want {
            None => true,
            Some(w) => have
                .as_deref()
                .map(|h| h.eq_ignore_ascii_case(w))
                .unwrap_or(false),
        };
        v.active && v.stock > 0 && same(&self.category, &v.category)
            && same(&self.product_type, &v.product_type)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogPage {
    pub variants: Vec<ProductVariant>,
    /// True when the list came from the local cache because the backend was
    /// unreachable.
    pub from_cache: bool,
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

fn read_cache(db: &DbState, cache_key: &str) -> Option<Vec<ProductVariant>> {
    let conn = db.lock();
    let raw: String = conn
        .query_row(
            "SELECT data FROM catalog_cache WHERE cache_key = ?1",
            params![cache_key],
            |row| row.get(0),
        )
        .ok()?;
    match serde_json::from_str::<Vec<ProductVariant>>(&raw) {
        Ok(rows) => Some(rows),
        Err(e) => {
            error!("catalog_cache[{cache_key}] JSON parse error: {e}");
            None
        }
    }
}

fn write_cache(db: &DbState, cache_key: &str, variants: &[ProductVariant]) -> Result<()> {
    let data = serde_json::to_string(variants)?;
    let conn = db.lock();
    conn.execute(
        "INSERT INTO catalog_cache (cache_key, data, fetched_at)
         VALUES (?1, ?2, datetime('now'))
         ON CONFLICT(cache_key) DO UPDATE SET
            data = excluded.data,
            fetched_at = excluded.fetched_at",
        params![cache_key, data],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Remote reads
// ---------------------------------------------------------------------------

/// Active, in-stock variants matching `filter`.
pub async fn list_variants(
    client: &SupabaseClient,
    db: &DbState,
    filter: &VariantFilter,
) -> Result<CatalogPage> {
    let key = filter.cache_key();
    match client
        .select::<ProductVariant>(VARIANTS_TABLE, &filter.query())
        .await
    {
        Ok(rows) => {
            let variants: Vec<ProductVariant> =
                rows.into_iter().filter(|v| filter.admits(v)).collect();
            if let Err(e) = write_cache(db, &key, &variants) {
                warn!(cache_key = %key, "catalog cache write failed: {e}");
            }
            debug!(cache_key = %key, count = variants.len(), "catalog fetched");
            Ok(CatalogPage {
                variants,
                from_cache: false,
            })
        }
        Err(e) if e.is_offline() => match read_cache(db, &key) {
            Some(cached) => {
                info!(cache_key = %key, "backend unreachable, serving cached catalog");
                Ok(CatalogPage {
                    variants: cached.into_iter().filter(|v| filter.admits(v)).collect(),
                    from_cache: true,
                })
            }
            None => Err(e),
        },
        Err(e) => Err(e),
    }
}

/// Columns tried, in order, when resolving a variant reference. Typed id
/// columns reject non-numeric literals, so free text only goes to `sku`.
pub fn lookup_columns(term: &str) -> &'static [&'static str] {
    let looks_like_id = term.parse::<i64>().is_ok() || uuid::Uuid::parse_str(term).is_ok();
    if looks_like_id {
        &["id", "sku"]
    } else {
        &["sku"]
    }
}

/// Look a variant up by id or SKU.
pub async fn get_variant(client: &SupabaseClient, id_or_sku: &str) -> Result<ProductVariant> {
    let term = id_or_sku.trim();
    for column in lookup_columns(term) {
        let q = Query::new().select("*").eq(column, term).limit(1);
        let rows: Vec<ProductVariant> = match client.select(VARIANTS_TABLE, &q).await {
            Ok(rows) => rows,
            // A numeric term against a uuid id column.
            Err(crate::Error::Api { status: 400, .. }) if *column == "id" => continue,
            Err(e) => return Err(e),
        };
        if let Some(v) = rows.into_iter().next() {
            return Ok(v);
        }
    }
    Err(crate::Error::NotFound(format!("variant {term}")))
}

pub async fn active_promotions(
    client: &SupabaseClient,
    variant_ids: &[String],
) -> Result<Vec<Promotion>> {
    if variant_ids.is_empty() {
        return Ok(Vec::new());
    }
    let value = client
        .rpc_value(
            "get_active_promotions_for_variants",
            &json!({ "p_variant_ids": variant_ids }),
        )
        .await?;
    if value.is_null() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_value(value)?)
}

pub async fn types_by_category(client: &SupabaseClient, category: &str) -> Result<Vec<String>> {
    let value = client
        .rpc_value("get_types_by_category", &json!({ "p_category": category }))
        .await?;
    Ok(parse_types(&value))
}

/// Accepts `["remera", ...]` or `[{"type": "remera"}, ...]`; sorted, unique.
fn parse_types(value: &Value) -> Vec<String> {
    let mut out: Vec<String> = value
        .as_array()
        .map(|rows| {
            rows.iter()
                .filter_map(|row| match row {
                    Value::String(s) => Some(s.trim().to_string()),
                    other => crate::value_str(other, &["type", "product_type", "name"]),
                })
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default();
    out.sort_by_key(|s| s.to_lowercase());
    out.dedup_by(|a, b| a.eq_ignore_ascii_case(b));
    out
}

// ---------------------------------------------------------------------------
// Pricing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PricedVariant {
    #[serde(flatten)]
    pub variant: ProductVariant,
    pub final_price: f64,
    pub promotion: Option<String>,
}

impl PricedVariant {
    pub fn is_discounted(&self) -> bool {
        self.final_price < self.variant.price
    }
}

fn promo_price(base: f64, promo: &Promotion) -> Option<f64> {
    let price = match (promo.promo_price, promo.discount_percent) {
        (Some(fixed), _) => fixed,
        (None, Some(pct)) if pct > 0.0 => base * (1.0 - pct.min(100.0) / 100.0),
        _ => return None,
    };
    Some(round_cents(price.max(0.0)))
}

/// Lowest price per variant among its promotions. A promotion that would
/// raise the price is ignored.
pub fn apply_promotions(variants: Vec<ProductVariant>, promotions: &[Promotion]) -> Vec<PricedVariant> {
    variants
        .into_iter()
        .map(|variant| {
            let best = promotions
                .iter()
                .filter(|p| p.variant_id == variant.id)
                .filter_map(|p| promo_price(variant.price, p).map(|price| (price, p)))
                .filter(|(price, _)| *price < variant.price)
                .min_by(|a, b| a.0.total_cmp(&b.0));
            match best {
                Some((price, promo)) => PricedVariant {
                    final_price: price,
                    promotion: promo.name.clone().or_else(|| promo.promotion_id.clone()),
                    variant,
                },
                None => PricedVariant {
                    final_price: variant.price,
                    promotion: None,
                    variant,
                },
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;

    #[test]
    fn free_text_references_only_match_sku() {
        assert_eq!(lookup_columns("RL-NEG-M"), &["sku"]);
        assert_eq!(lookup_columns("remera negra"), &["sku"]);
        assert_eq!(lookup_columns("33"), &["id", "sku"]);
        assert_eq!(
            lookup_columns("5f0c7a2e-8d7b-4c2a-9b1e-3f4a5b6c7d8e"),
            &["id", "sku"]
        );
    }

    fn variant(id: &str, price: f64, stock: i64) -> ProductVariant {
        ProductVariant {
            id: id.into(),
            product_id: Some("p1".into()),
            sku: Some(format!("SKU-{id}")),
            product_name: "Remera lisa".into(),
            color: Some("Negro".into()),
            size: Some("M".into()),
            price,
            stock,
            category: Some("Mujer".into()),
            product_type: Some("remera".into()),
            image_url: None,
            active: true,
        }
    }

    fn promo(variant_id: &str, name: &str, pct: Option<f64>, fixed: Option<f64>) -> Promotion {
        Promotion {
            variant_id: variant_id.into(),
            promotion_id: None,
            name: Some(name.into()),
            discount_percent: pct,
            promo_price: fixed,
        }
    }

    #[test]
    fn filter_builds_query_and_cache_key() {
        let filter = VariantFilter {
            category: Some("Mujer".into()),
            product_type: None,
        };
        assert_eq!(filter.cache_key(), "variants:mujer:*");
        let q = filter.query();
        let pairs = q.pairs();
        assert!(pairs.contains(&("active".into(), "eq.true".into())));
        assert!(pairs.contains(&("stock".into(), "gt.0".into())));
        assert!(pairs.contains(&("category".into(), "eq.Mujer".into())));
        assert!(!pairs.iter().any(|(k, _)| k == "type"));
    }

    #[test]
    fn filter_admits_only_live_matching_rows() {
        let filter = VariantFilter {
            category: Some("mujer".into()),
            product_type: Some("REMERA".into()),
        };
        assert!(filter.admits(&variant("a", 100.0, 2)));
        assert!(!filter.admits(&variant("b", 100.0, 0)));
        let mut inactive = variant("c", 100.0, 3);
        inactive.active = false;
        assert!(!filter.admits(&inactive));
        let mut other = variant("d", 100.0, 3);
        other.category = Some("Hombre".into());
        assert!(!filter.admits(&other));
    }

    #[test]
    fn cache_roundtrip_and_overwrite() {
        let db = open_in_memory().unwrap();
        assert!(read_cache(&db, "variants:*:*").is_none());

        write_cache(&db, "variants:*:*", &[variant("a", 10.0, 1)]).unwrap();
        write_cache(&db, "variants:*:*", &[variant("a", 10.0, 1), variant("b", 12.0, 4)]).unwrap();
        let cached = read_cache(&db, "variants:*:*").unwrap();
        assert_eq!(cached.len(), 2);
        assert_eq!(cached[1].id, "b");
    }

    #[test]
    fn lowest_promotion_wins() {
        let priced = apply_promotions(
            vec![variant("a", 1000.0, 1), variant("b", 500.0, 1)],
            &[
                promo("a", "10% off", Some(10.0), None),
                promo("a", "Liquidación", None, Some(850.0)),
                promo("b", "Aumento", None, Some(600.0)),
            ],
        );
        assert_eq!(priced[0].final_price, 850.0);
        assert_eq!(priced[0].promotion.as_deref(), Some("Liquidación"));
        assert!(priced[0].is_discounted());

        assert_eq!(priced[1].final_price, 500.0);
        assert_eq!(priced[1].promotion, None);
    }

    #[test]
    fn percentage_discount_rounds_to_cents() {
        let priced = apply_promotions(
            vec![variant("a", 999.99, 1)],
            &[promo("a", "15%", Some(15.0), None)],
        );
        assert_eq!(priced[0].final_price, 849.99);
    }

    #[test]
    fn types_parse_from_strings_or_rows() {
        assert_eq!(
            parse_types(&json!(["remera", "Buzo", "remera"])),
            vec!["Buzo", "remera"]
        );
        assert_eq!(
            parse_types(&json!([{ "type": "jean" }, { "type": " " }, { "other": 1 }])),
            vec!["jean"]
        );
        assert!(parse_types(&Value::Null).is_empty());
    }
}
