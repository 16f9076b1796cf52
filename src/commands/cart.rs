use anyhow::Result;
use clap::Subcommand;
use serde_json::json;

use super::{money, Ctx};
use crate::api::SupabaseClient;
use crate::cart::{self, GuestLine};
use crate::models::Cart;
use crate::{auth, catalog, Error};

#[derive(Debug, Subcommand)]
pub enum CartCommand {
    /// Show the customer's open cart, or the local guest cart
    Show {
        #[arg(long)]
        customer: Option<String>,
    },
    /// Add a variant (id or SKU)
    Add {
        variant: String,
        #[arg(long, default_value_t = 1)]
        qty: i64,
        #[arg(long)]
        customer: Option<String>,
    },
    /// Set the quantity of a line (variant id or SKU); 0 removes it
    Set {
        variant: String,
        qty: i64,
        #[arg(long)]
        customer: Option<String>,
    },
    /// Remove a line (variant id or SKU)
    Remove {
        variant: String,
        #[arg(long)]
        customer: Option<String>,
    },
    /// Turn the customer's cart into an order
    Checkout {
        #[arg(long)]
        customer: String,
    },
    /// Move the local guest cart into the customer's cart
    Merge {
        #[arg(long)]
        customer: String,
    },
    /// Empty the local guest cart
    Clear,
}

fn render_cart(c: &Cart) -> String {
    let mut out = format!("Cart {} ({:?})", c.id, c.status);
    if c.cart_items.is_empty() {
        out.push_str("\n  (empty)");
    }
    for it in &c.cart_items {
        out.push_str(&format!(
            "\n  {:<38} {:<30} x{:<3} {:>12}",
            it.variant_id,
            it.product_name,
            it.quantity,
            money(it.line_total())
        ));
    }
    out.push_str(&format!("\nTotal: {}", money(cart::cart_total(c))));
    out
}

fn render_guest(lines: &Vec<GuestLine>) -> String {
    let mut out = String::from("Guest cart");
    if lines.is_empty() {
        out.push_str("\n  (empty)");
    }
    for l in lines {
        out.push_str(&format!(
            "\n  {:<38} {:<30} x{:<3} {:>12}",
            l.variant_id,
            l.product_name,
            l.quantity,
            money(l.price * l.quantity as f64)
        ));
    }
    out.push_str(&format!("\nTotal: {}", money(cart::guest_total(lines))));
    out
}

async fn client(ctx: &Ctx<'_>) -> Result<SupabaseClient> {
    Ok(auth::session_client(ctx.config).await?.0)
}

/// Catalog lookups work without a session.
async fn catalog_client(ctx: &Ctx<'_>) -> Result<SupabaseClient> {
    match auth::session_client(ctx.config).await {
        Ok((client, _)) => Ok(client),
        Err(Error::Unauthorized) => Ok(auth::anon_client(ctx.config)?),
        Err(e) => Err(e.into()),
    }
}

fn local_guest_line<'a>(lines: &'a [GuestLine], reference: &str) -> Option<&'a str> {
    let reference = reference.trim();
    lines
        .iter()
        .find(|l| l.variant_id == reference)
        .map(|l| l.variant_id.as_str())
}

/// Guest lines are keyed by variant id; a SKU is resolved through the catalog.
async fn guest_variant_id(ctx: &Ctx<'_>, reference: &str) -> Result<String> {
    let lines = cart::guest_lines(ctx.db)?;
    if let Some(id) = local_guest_line(&lines, reference) {
        return Ok(id.to_string());
    }
    let lookup = catalog_client(ctx).await?;
    Ok(catalog::get_variant(&lookup, reference).await?.id)
}

pub async fn run(cmd: CartCommand, ctx: &Ctx<'_>) -> Result<()> {
    match cmd {
        CartCommand::Show { customer: None } => {
            let lines = cart::guest_lines(ctx.db)?;
            ctx.emit(&lines, render_guest)
        }
        CartCommand::Show {
            customer: Some(customer),
        } => {
            let client = client(ctx).await?;
            let c = cart::open_cart(&client, &customer).await?;
            ctx.emit(&c, render_cart)
        }
        CartCommand::Add {
            variant,
            qty,
            customer,
        } => {
            let lookup = catalog_client(ctx).await?;
            let variant = catalog::get_variant(&lookup, &variant).await?;
            match customer {
                None => {
                    let line = cart::guest_add(ctx.db, &variant, qty)?;
                    ctx.emit(&line, |l| {
                        format!("{} now x{} in the guest cart.", l.product_name, l.quantity)
                    })
                }
                Some(customer) => {
                    let client = client(ctx).await?;
                    let c = cart::open_cart(&client, &customer).await?;
                    let line = cart::add_item(&client, &c, &variant, qty).await?;
                    ctx.emit(&line, |l| format!("{} now x{} in the cart.", l.product_name, l.quantity))
                }
            }
        }
        CartCommand::Set {
            variant,
            qty,
            customer,
        } => match customer {
            None => {
                let variant_id = guest_variant_id(ctx, &variant).await?;
                cart::guest_set_quantity(ctx.db, &variant_id, qty)?;
                let lines = cart::guest_lines(ctx.db)?;
                ctx.emit(&lines, render_guest)
            }
            Some(customer) => {
                let client = client(ctx).await?;
                let v = catalog::get_variant(&client, &variant).await?;
                let c = cart::open_cart(&client, &customer).await?;
                let line = c
                    .cart_items
                    .iter()
                    .find(|it| it.variant_id == v.id)
                    .ok_or_else(|| Error::NotFound(format!("{} is not in the cart", v.product_name)))?;
                cart::set_quantity(&client, line, qty, Some(v.stock)).await?;
                let c = cart::get_cart(&client, &c.id).await?;
                ctx.emit(&c, render_cart)
            }
        },
        CartCommand::Remove { variant, customer } => match customer {
            None => {
                let variant_id = guest_variant_id(ctx, &variant).await?;
                cart::guest_set_quantity(ctx.db, &variant_id, 0)?;
                let lines = cart::guest_lines(ctx.db)?;
                ctx.emit(&lines, render_guest)
            }
            Some(customer) => {
                let client = client(ctx).await?;
                let c = cart::open_cart(&client, &customer).await?;
                let line = c
                    .cart_items
                    .iter()
                    .find(|it| it.variant_id == variant || it.id == variant)
                    .ok_or_else(|| Error::NotFound(format!("line {variant} is not in the cart")))?;
                cart::remove_item(&client, &line.id).await?;
                let c = cart::get_cart(&client, &c.id).await?;
                ctx.emit(&c, render_cart)
            }
        },
        CartCommand::Checkout { customer } => {
            let client = client(ctx).await?;
            let c = cart::open_cart(&client, &customer).await?;
            let receipt = cart::checkout(&client, &c).await?;
            ctx.emit(&receipt, |r| {
                format!(
                    "Order {} created for {}.",
                    r.order_number.as_deref().unwrap_or("(pending number)"),
                    money(r.total)
                )
            })
        }
        CartCommand::Merge { customer } => {
            let client = client(ctx).await?;
            let c = cart::merge_guest_cart(&client, ctx.db, &customer).await?;
            ctx.emit(&c, |c| format!("Guest cart merged.\n{}", render_cart(c)))
        }
        CartCommand::Clear => {
            let removed = cart::guest_clear(ctx.db)?;
            ctx.emit(&json!({ "removed": removed }), |_| format!("{removed} line(s) removed."))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guest(variant_id: &str) -> GuestLine {
        GuestLine {
            variant_id: variant_id.into(),
            product_name: "Remera".into(),
            color: None,
            size: None,
            quantity: 1,
            price: 100.0,
        }
    }

    #[test]
    fn guest_line_matches_variant_id_without_lookup() {
        let lines = vec![guest("33"), guest("41")];
        assert_eq!(local_guest_line(&lines, " 41 "), Some("41"));
        assert_eq!(local_guest_line(&lines, "RL-NEG-M"), None);
    }
}
