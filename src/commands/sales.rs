use anyhow::Result;
use chrono::{Local, NaiveDate};
use clap::Subcommand;

use super::{money, Ctx};
use crate::models::{DailySale, PaymentMethod, SalesSummary};
use crate::sales::{self, NewSale};
use crate::{auth, Error};

#[derive(Debug, Subcommand)]
pub enum SalesCommand {
    /// Record a sale in the daily ledger
    Record {
        amount: f64,
        /// Payment method name or id
        #[arg(long)]
        payment_method: Option<String>,
        #[arg(long)]
        description: Option<String>,
        /// YYYY-MM-DD, defaults to today
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Sales recorded on a day
    List {
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Totals per payment method for a day
    Summary {
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// List payment methods
    PaymentMethods,
    /// Create a payment method (an existing one with the same name is reused)
    AddPaymentMethod { name: String },
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}

fn render_sales(list: &Vec<DailySale>) -> String {
    if list.is_empty() {
        return "No sales recorded.".into();
    }
    list.iter()
        .map(|s| {
            format!(
                "{}  {:>14}  {:<18} {}",
                s.sale_date,
                money(s.amount),
                s.payment_methods.as_ref().map(|m| m.name.as_str()).unwrap_or("-"),
                s.description.as_deref().unwrap_or("")
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_summary(s: &SalesSummary) -> String {
    let mut out = format!(
        "{}: {} in {} sale(s)",
        s.date.map(|d| d.to_string()).unwrap_or_default(),
        money(s.total),
        s.count
    );
    for m in &s.by_payment_method {
        out.push_str(&format!("\n  {:<20} {:>14}  ({})", m.name, money(m.total), m.count));
    }
    out
}

fn render_methods(list: &Vec<PaymentMethod>) -> String {
    list.iter()
        .map(|m| format!("{:<38} {}", m.id, m.name))
        .collect::<Vec<_>>()
        .join("\n")
}

pub async fn run(cmd: SalesCommand, ctx: &Ctx<'_>) -> Result<()> {
    let (client, _session) = auth::admin_client(ctx.config).await?;
    match cmd {
        SalesCommand::Record {
            amount,
            payment_method,
            description,
            date,
        } => {
            let payment_method_id = match payment_method {
                None => None,
                Some(name) => {
                    let methods = sales::list_payment_methods(&client).await?;
                    let found = sales::find_payment_method(&methods, &name)
                        .ok_or_else(|| Error::NotFound(format!("payment method {name:?}")))?;
                    Some(found.id.clone())
                }
            };
            let sale = sales::record_sale(
                &client,
                NewSale {
                    sale_date: date.unwrap_or_else(today),
                    amount,
                    payment_method_id,
                    order_id: None,
                    description,
                },
            )
            .await?;
            ctx.emit(&sale, |s| format!("Recorded {} on {}.", money(s.amount), s.sale_date))
        }
        SalesCommand::List { date } => {
            let list = sales::sales_for_day(&client, date.unwrap_or_else(today)).await?;
            ctx.emit(&list, render_sales)
        }
        SalesCommand::Summary { date } => {
            let summary = sales::daily_summary(&client, date.unwrap_or_else(today)).await?;
            ctx.emit(&summary, render_summary)
        }
        SalesCommand::PaymentMethods => {
            let list = sales::list_payment_methods(&client).await?;
            ctx.emit(&list, render_methods)
        }
        SalesCommand::AddPaymentMethod { name } => {
            let method = sales::create_payment_method(&client, &name).await?;
            ctx.emit(&method, |m| format!("Payment method: {} ({})", m.name, m.id))
        }
    }
}
