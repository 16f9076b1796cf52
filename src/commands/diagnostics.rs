use anyhow::Result;
use clap::Args;

use super::Ctx;
use crate::diagnostics;

#[derive(Debug, Args)]
pub struct AboutArgs {
    /// Include local database, cache and session state
    #[arg(long)]
    health: bool,
}

pub fn run(args: AboutArgs, ctx: &Ctx<'_>) -> Result<()> {
    let mut value = diagnostics::about_info();
    if args.health {
        value["health"] = diagnostics::system_health(ctx.config, ctx.db);
    }
    ctx.emit(&value, |v| serde_json::to_string_pretty(v).unwrap_or_default())
}
