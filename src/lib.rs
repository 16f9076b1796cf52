//! Tienda back-office and storefront client.
//!
//! Library behind the `tienda-admin` binary. It talks to the hosted store
//! backend (auth, REST tables, remote procedures, realtime feed) and keeps a
//! small local SQLite database for settings, the catalog cache and the guest
//! cart. Order and item statuses are owned by the server; this crate derives
//! the presentational state, badge counts and filtered views from them.

use std::path::Path;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod api;
pub mod auth;
pub mod badges;
pub mod cart;
pub mod catalog;
pub mod commands;
pub mod config;
pub mod customers;
pub mod db;
pub mod diagnostics;
pub mod error;
pub mod import;
pub mod models;
pub mod orders;
pub mod realtime;
pub mod sales;
pub mod status;
pub mod storage;

pub use error::{Error, Result};

/// Returns the first non-empty, trimmed string found under any of `keys`.
pub(crate) fn value_str(v: &serde_json::Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(s) = v.get(*key).and_then(|x| x.as_str()) {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

/// Numeric lookup that also accepts numbers sent as strings ("1500.50").
pub(crate) fn value_f64(v: &serde_json::Value, keys: &[&str]) -> Option<f64> {
    for key in keys {
        match v.get(*key) {
            Some(serde_json::Value::Number(n)) => return n.as_f64(),
            Some(serde_json::Value::String(s)) => {
                if let Ok(n) = s.trim().parse::<f64>() {
                    return Some(n);
                }
            }
            _ => {}
        }
    }
    None
}

/// Round a money amount to cents.
pub fn round_cents(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

/// Initialize structured logging (console + daily rolling JSON file).
///
/// The returned guard must stay alive for the lifetime of the process;
/// dropping it flushes the file writer.
pub fn init_logging(log_dir: &Path) -> WorkerGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tienda_admin_lib=debug"));

    diagnostics::prune_old_logs(log_dir);
    std::fs::create_dir_all(log_dir).ok();

    let file_appender = tracing_appender::rolling::daily(log_dir, diagnostics::LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!("Starting Tienda admin v{}", env!("CARGO_PKG_VERSION"));
    guard
}

/// Entry point used by the binary: parse flags, set up logging and the local
/// database, then dispatch the requested command.
pub async fn run() -> anyhow::Result<()> {
    use clap::Parser;

    let cli = commands::Cli::parse();
    let config = config::Config::resolve(&cli.global)?;
    let _guard = init_logging(&config.log_dir());

    let db = db::init(&config.data_dir).map_err(anyhow::Error::from)?;
    commands::dispatch(cli.command, cli.global.json, &config, &db).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_str_skips_blank_values() {
        let v = serde_json::json!({ "nombre": "  ", "name": " Ana " });
        assert_eq!(value_str(&v, &["nombre", "name"]), Some("Ana".to_string()));
        assert_eq!(value_str(&v, &["missing"]), None);
    }

    #[test]
    fn value_f64_accepts_numeric_strings() {
        let v = serde_json::json!({ "a": "1500.5", "b": 3 });
        assert_eq!(value_f64(&v, &["a"]), Some(1500.5));
        assert_eq!(value_f64(&v, &["b"]), Some(3.0));
        assert_eq!(value_f64(&v, &["c"]), None);
    }

    #[test]
    fn round_cents_rounds_half_up() {
        assert_eq!(round_cents(10.005_1), 10.01);
        assert_eq!(round_cents(3.333), 3.33);
    }
}
