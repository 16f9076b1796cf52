//! Command-line surface.
//!
//! One submodule per area, each owning its clap subcommand enum and a `run`
//! function. Handlers print either a human table or, with `--json`, the raw
//! serialized result.

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;

use crate::config::Config;
use crate::db::DbState;
use crate::{storage, Error};

mod auth;
mod cart;
mod catalog;
mod customers;
mod diagnostics;
mod import;
mod orders;
mod sales;

/// Tienda back-office and storefront client
#[derive(Debug, Parser)]
#[command(name = "tienda-admin", author, version, about)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Args)]
pub struct GlobalArgs {
    /// Project URL of the hosted backend
    #[arg(long, global = true, env = "TIENDA_SUPABASE_URL")]
    pub supabase_url: Option<String>,

    /// Public anon key of the project
    #[arg(long, global = true, env = "TIENDA_SUPABASE_ANON_KEY", hide_env_values = true)]
    pub anon_key: Option<String>,

    /// Directory for the local database and logs
    #[arg(long, global = true, env = "TIENDA_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Project settings stored in the OS keyring
    #[command(subcommand)]
    Config(auth::ConfigCommand),

    /// Log in with email and password
    Login(auth::LoginArgs),

    /// Forget the stored session
    Logout,

    /// Show the logged-in account
    Whoami,

    /// Back-office order board and order operations
    #[command(subcommand)]
    Orders(orders::OrdersCommand),

    /// Customer directory
    #[command(subcommand)]
    Customers(customers::CustomersCommand),

    /// Product catalog with promotions
    #[command(subcommand)]
    Catalog(catalog::CatalogCommand),

    /// Shopping cart (remote, or local guest cart)
    #[command(subcommand)]
    Cart(cart::CartCommand),

    /// Daily sales and payment methods
    #[command(subcommand)]
    Sales(sales::SalesCommand),

    /// Bulk import from CSV files or Google Sheets
    #[command(subcommand)]
    Import(import::ImportCommand),

    /// Version, build and local health information
    About(diagnostics::AboutArgs),
}

/// What every handler gets.
pub(crate) struct Ctx<'a> {
    pub config: &'a Config,
    pub db: &'a DbState,
    pub json: bool,
}

impl Ctx<'_> {
    /// Print `value` as JSON, or the human rendering otherwise.
    pub fn emit<T: Serialize>(&self, value: &T, human: impl FnOnce(&T) -> String) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            let text = human(value);
            if !text.is_empty() {
                println!("{text}");
            }
        }
        Ok(())
    }
}

pub async fn dispatch(command: Command, json: bool, config: &Config, db: &DbState) -> Result<()> {
    let ctx = Ctx { config, db, json };
    let result = match command {
        Command::Config(cmd) => auth::run_config(cmd, &ctx),
        Command::Login(args) => auth::login(args, &ctx).await,
        Command::Logout => auth::logout(&ctx).await,
        Command::Whoami => auth::whoami(&ctx),
        Command::Orders(cmd) => orders::run(cmd, &ctx).await,
        Command::Customers(cmd) => customers::run(cmd, &ctx).await,
        Command::Catalog(cmd) => catalog::run(cmd, &ctx).await,
        Command::Cart(cmd) => cart::run(cmd, &ctx).await,
        Command::Sales(cmd) => sales::run(cmd, &ctx).await,
        Command::Import(cmd) => import::run(cmd, &ctx).await,
        Command::About(args) => diagnostics::run(args, &ctx),
    };

    if let Err(e) = &result {
        if matches!(e.downcast_ref::<Error>(), Some(Error::Unauthorized)) {
            if let Err(clear_err) = storage::clear_session() {
                tracing::warn!("could not clear session: {clear_err}");
            }
            anyhow::bail!("Session expired or missing. Run `tienda-admin login` again.");
        }
    }
    result
}

/// Money as shown to operators: `$ 1500.50`.
pub(crate) fn money(amount: f64) -> String {
    format!("$ {amount:.2}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_flags_parse_after_subcommand() {
        let cli = Cli::try_parse_from([
            "tienda-admin",
            "orders",
            "list",
            "--tab",
            "waiting",
            "--json",
            "--data-dir",
            "/tmp/tienda",
        ])
        .unwrap();
        assert!(cli.global.json);
        assert_eq!(cli.global.data_dir, Some(PathBuf::from("/tmp/tienda")));
        assert!(matches!(cli.command, Command::Orders(_)));
    }

    #[test]
    fn login_help_points_to_the_silent_password_path() {
        let mut cmd = Cli::command();
        let login = cmd.find_subcommand_mut("login").unwrap();
        let help = login.render_long_help().to_string();
        assert!(help.contains("TIENDA_PASSWORD"));
    }

    #[test]
    fn money_has_two_decimals() {
        assert_eq!(money(1500.5), "$ 1500.50");
    }
}
