use anyhow::Result;
use clap::{Args, Subcommand};

use super::Ctx;
use crate::models::{Customer, NewCustomer};
use crate::{auth, customers};

#[derive(Debug, Subcommand)]
pub enum CustomersCommand {
    /// Search by name, phone, dni or email
    Search { query: String },
    /// Show one customer
    Show { id: String },
    /// Create a customer
    Add(CustomerFields),
    /// Replace a customer's fields
    Update {
        id: String,
        #[command(flatten)]
        fields: CustomerFields,
    },
}

#[derive(Debug, Args)]
pub struct CustomerFields {
    #[arg(long)]
    name: String,
    #[arg(long)]
    phone: Option<String>,
    #[arg(long)]
    dni: Option<String>,
    #[arg(long)]
    email: Option<String>,
    #[arg(long)]
    address: Option<String>,
    #[arg(long)]
    city: Option<String>,
    #[arg(long)]
    province: Option<String>,
}

impl From<CustomerFields> for NewCustomer {
    fn from(f: CustomerFields) -> Self {
        NewCustomer {
            name: f.name,
            phone: f.phone,
            dni: f.dni,
            email: f.email,
            address: f.address,
            city: f.city,
            province: f.province,
        }
    }
}

fn render_list(list: &Vec<Customer>) -> String {
    if list.is_empty() {
        return "No customers found.".into();
    }
    list.iter()
        .map(|c| {
            format!(
                "{:<38} {:<30} {:<14} {:<10} {}",
                c.id,
                c.name,
                c.phone.as_deref().unwrap_or("-"),
                c.dni.as_deref().unwrap_or("-"),
                c.email.as_deref().unwrap_or("")
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_one(c: &Customer) -> String {
    let mut out = format!("{} ({})", c.name, c.id);
    let fields = [
        ("Number", c.customer_number.as_deref()),
        ("Phone", c.phone.as_deref()),
        ("DNI", c.dni.as_deref()),
        ("Email", c.email.as_deref()),
        ("Address", c.address.as_deref()),
        ("City", c.city.as_deref()),
        ("Province", c.province.as_deref()),
    ];
    for (label, value) in fields {
        if let Some(v) = value {
            out.push_str(&format!("\n  {label:<9} {v}"));
        }
    }
    out
}

pub async fn run(cmd: CustomersCommand, ctx: &Ctx<'_>) -> Result<()> {
    let (client, _session) = auth::admin_client(ctx.config).await?;
    match cmd {
        CustomersCommand::Search { query } => {
            let list = customers::search_customers(&client, &query).await?;
            ctx.emit(&list, render_list)
        }
        CustomersCommand::Show { id } => {
            let c = customers::get_customer(&client, &id).await?;
            ctx.emit(&c, render_one)
        }
        CustomersCommand::Add(fields) => {
            let c = customers::create_customer(&client, fields.into()).await?;
            ctx.emit(&c, |c| format!("Customer created.\n{}", render_one(c)))
        }
        CustomersCommand::Update { id, fields } => {
            let c = customers::update_customer(&client, &id, fields.into()).await?;
            ctx.emit(&c, |c| format!("Customer updated.\n{}", render_one(c)))
        }
    }
}
