use anyhow::Result;
use clap::Subcommand;

use super::{money, Ctx};
use crate::catalog::{self, PricedVariant, VariantFilter};
use crate::{auth, Error};

#[derive(Debug, Subcommand)]
pub enum CatalogCommand {
    /// In-stock variants with their promotional price
    List {
        #[arg(long)]
        category: Option<String>,
        #[arg(long = "type")]
        product_type: Option<String>,
    },
    /// Product types available in a category
    Types { category: String },
}

fn render_variants(list: &Vec<PricedVariant>) -> String {
    if list.is_empty() {
        return "No products in stock.".into();
    }
    list.iter()
        .map(|p| {
            let v = &p.variant;
            let price = if p.is_discounted() {
                format!("{} (was {})", money(p.final_price), money(v.price))
            } else {
                money(p.final_price)
            };
            format!(
                "{:<14} {:<30} {:<10} {:<5} {:>4}  {}",
                v.sku.as_deref().unwrap_or(&v.id),
                v.product_name,
                v.color.as_deref().unwrap_or("-"),
                v.size.as_deref().unwrap_or("-"),
                v.stock,
                price
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub async fn run(cmd: CatalogCommand, ctx: &Ctx<'_>) -> Result<()> {
    // The catalog is public; a stored session is used when there is one.
    let client = match auth::session_client(ctx.config).await {
        Ok((client, _)) => client,
        Err(Error::Unauthorized) => auth::anon_client(ctx.config)?,
        Err(e) => return Err(e.into()),
    };
    match cmd {
        CatalogCommand::List {
            category,
            product_type,
        } => {
            let filter = VariantFilter {
                category,
                product_type,
            };
            let page = catalog::list_variants(&client, ctx.db, &filter).await?;
            let ids: Vec<String> = page.variants.iter().map(|v| v.id.clone()).collect();
            let promotions = if page.from_cache {
                Vec::new()
            } else {
                catalog::active_promotions(&client, &ids).await?
            };
            let priced = catalog::apply_promotions(page.variants, &promotions);
            let from_cache = page.from_cache;
            ctx.emit(&priced, |list| {
                let body = render_variants(list);
                if from_cache {
                    format!("(offline: cached catalog, promotions not applied)\n{body}")
                } else {
                    body
                }
            })
        }
        CatalogCommand::Types { category } => {
            let types = catalog::types_by_category(&client, &category).await?;
            ctx.emit(&types, |t| t.join("\n"))
        }
    }
}
