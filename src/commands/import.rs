use anyhow::Result;
use clap::{Args, Subcommand};

use super::Ctx;
use crate::import::{self, ImportOptions, ImportReport, ImportSource};
use crate::{auth, config};

#[derive(Debug, Subcommand)]
pub enum ImportCommand {
    /// Customers through the bulk creation procedure
    Customers(ImportArgs),
    /// Product variants, upserted on SKU
    Variants(ImportArgs),
}

#[derive(Debug, Args)]
pub struct ImportArgs {
    /// CSV file path or URL (Google Sheets links are accepted)
    source: String,
    #[arg(long, default_value_t = config::DEFAULT_IMPORT_BATCH_SIZE)]
    batch_size: usize,
    /// Parse and report without writing
    #[arg(long)]
    dry_run: bool,
}

impl ImportArgs {
    fn options(&self) -> ImportOptions {
        ImportOptions {
            batch_size: self.batch_size,
            dry_run: self.dry_run,
        }
    }
}

fn render_report(r: &ImportReport) -> String {
    let mut out = format!(
        "Read {}, imported {}, skipped {}",
        r.read, r.imported, r.skipped
    );
    if r.failed_batches > 0 {
        out.push_str(&format!(", {} batch(es) failed (see log)", r.failed_batches));
    }
    out
}

pub async fn run(cmd: ImportCommand, ctx: &Ctx<'_>) -> Result<()> {
    let (client, _session) = auth::admin_client(ctx.config).await?;
    let report = match cmd {
        ImportCommand::Customers(args) => {
            let source = ImportSource::parse(&args.source);
            import::import_customers(&client, &source, args.options()).await?
        }
        ImportCommand::Variants(args) => {
            let source = ImportSource::parse(&args.source);
            import::import_variants(&client, &source, args.options()).await?
        }
    };
    ctx.emit(&report, render_report)
}
