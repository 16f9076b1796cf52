//! Diagnostics.
//!
//! Provides:
//! - **About info**: version, build timestamp, git SHA, platform
//! - **Local health**: schema version, database size, cache and guest cart
//!   contents, snapshot size, configured project and session
//! - **Log rotation helpers**: used by `lib.rs` to prune rolling log files.

use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::config::Config;
use crate::db::DbState;
use crate::storage;

/// Maximum number of log files to retain.
pub const MAX_LOG_FILES: usize = 10;

/// Prefix of the daily rolling log files (`tienda.2026-03-14`).
pub const LOG_FILE_PREFIX: &str = "tienda";

// ---------------------------------------------------------------------------
// About info
// ---------------------------------------------------------------------------

pub fn about_info() -> Value {
    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "buildTimestamp": env!("BUILD_TIMESTAMP"),
        "gitSha": env!("BUILD_GIT_SHA"),
        "platform": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "rustVersion": env!("CARGO_PKG_RUST_VERSION"),
    })
}

// ---------------------------------------------------------------------------
// Local health
// ---------------------------------------------------------------------------

fn count_rows(conn: &rusqlite::Connection, sql: &str) -> i64 {
    conn.query_row(sql, [], |row| row.get(0)).unwrap_or(0)
}

/// Snapshot of local state for `about --health`. Secrets are redacted.
pub fn system_health(config: &Config, db: &DbState) -> Value {
    let (schema_version, cache_entries, guest_lines) = {
        let conn = db.lock();
        (
            count_rows(&conn, "SELECT COALESCE(MAX(version), 0) FROM schema_version"),
            count_rows(&conn, "SELECT COUNT(*) FROM catalog_cache"),
            count_rows(&conn, "SELECT COUNT(*) FROM local_cart_items"),
        )
    }; // lock released here

    let snapshot_orders = crate::orders::load_snapshot(db).len();
    let db_size = fs::metadata(&db.db_path).map(|m| m.len()).unwrap_or(0);
    let session = storage::load_session().map(|s| {
        json!({
            "email": s.email,
            "expiresAt": s.expires_at,
            "isAdmin": s.is_admin(),
        })
    });

    let health = json!({
        "schemaVersion": schema_version,
        "dbPath": db.db_path.display().to_string(),
        "dbSizeBytes": db_size,
        "catalogCacheEntries": cache_entries,
        "guestCartLines": guest_lines,
        "snapshotOrders": snapshot_orders,
        "project": {
            "url": config.supabase_url,
            "anon_key": config.anon_key,
            "configured": config.project().is_ok(),
        },
        "session": session,
        "logFiles": log_files(&config.log_dir()).len(),
    });
    redact_sensitive_fields(health)
}

fn redact_sensitive_fields(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut redacted = serde_json::Map::new();
            for (key, value) in map {
                if should_redact_key(&key) && !value.is_null() {
                    redacted.insert(key, Value::String("[REDACTED]".to_string()));
                } else {
                    redacted.insert(key, redact_sensitive_fields(value));
                }
            }
            Value::Object(redacted)
        }
        Value::Array(items) => {
            Value::Array(items.into_iter().map(redact_sensitive_fields).collect())
        }
        other => other,
    }
}

fn should_redact_key(key: &str) -> bool {
    let normalized = key.to_ascii_lowercase();
    let sensitive_markers = [
        "anon_key",
        "api_key",
        "apikey",
        "secret",
        "password",
        "token",
        "authorization",
    ];
    sensitive_markers
        .iter()
        .any(|marker| normalized.contains(marker))
}

// ---------------------------------------------------------------------------
// Log rotation
// ---------------------------------------------------------------------------

/// Log files in `log_dir`, newest first.
fn log_files(log_dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
    if let Ok(entries) = fs::read_dir(log_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let is_log = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|name| name.starts_with(&format!("{LOG_FILE_PREFIX}.")))
                .unwrap_or(false);
            if is_log {
                let modified = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .unwrap_or(std::time::UNIX_EPOCH);
                files.push((path, modified));
            }
        }
    }
    files.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
    files.into_iter().map(|(p, _)| p).collect()
}

/// Prune old log files, keeping only the most recent `MAX_LOG_FILES`.
pub fn prune_old_logs(log_dir: &Path) {
    for path in log_files(log_dir).iter().skip(MAX_LOG_FILES) {
        if let Err(e) = fs::remove_file(path) {
            warn!("Failed to prune log file {}: {e}", path.display());
        }
    }
}
