//! Runtime configuration.
//!
//! Values come from CLI flags or their environment variables first and fall
//! back to the OS credential store, where `config set` persists them.

use std::path::{Path, PathBuf};

use crate::commands::GlobalArgs;
use crate::{api, storage, Error, Result};

/// Default number of rows per bulk request in the import commands.
pub const DEFAULT_IMPORT_BATCH_SIZE: usize = 500;

#[derive(Debug, Clone)]
pub struct Config {
    pub supabase_url: Option<String>,
    pub anon_key: Option<String>,
    pub data_dir: PathBuf,
}

impl Config {
    pub fn resolve(args: &GlobalArgs) -> Result<Self> {
        let supabase_url = args
            .supabase_url
            .clone()
            .filter(|s| !s.trim().is_empty())
            .or_else(|| storage::get_credential(storage::KEY_SUPABASE_URL))
            .map(|u| api::normalize_project_url(&u));
        let anon_key = args
            .anon_key
            .clone()
            .filter(|s| !s.trim().is_empty())
            .or_else(|| storage::get_credential(storage::KEY_SUPABASE_ANON_KEY));
        let data_dir = args.data_dir.clone().unwrap_or_else(default_data_dir);

        Ok(Self {
            supabase_url,
            anon_key,
            data_dir,
        })
    }

    /// Project URL and anon key, or `NotConfigured` naming what is missing.
    pub fn project(&self) -> Result<(&str, &str)> {
        let url = self
            .supabase_url
            .as_deref()
            .ok_or_else(|| Error::NotConfigured("missing project URL".into()))?;
        let key = self
            .anon_key
            .as_deref()
            .ok_or_else(|| Error::NotConfigured("missing anon key".into()))?;
        Ok((url, key))
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn db_path(&self) -> PathBuf {
        db_path_in(&self.data_dir)
    }
}

pub fn db_path_in(dir: &Path) -> PathBuf {
    dir.join("tienda.db")
}

fn default_data_dir() -> PathBuf {
    let base = std::env::var("XDG_DATA_HOME")
        .or_else(|_| std::env::var("LOCALAPPDATA"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                .join(".local")
                .join("share")
        });
    base.join("tienda-admin")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_reports_missing_pieces() {
        let cfg = Config {
            supabase_url: Some("https://abc.supabase.co".into()),
            anon_key: None,
            data_dir: PathBuf::from("/tmp/tienda"),
        };
        let err = cfg.project().expect_err("anon key is missing");
        assert!(err.to_string().contains("anon key"));
    }

    #[test]
    fn derived_paths_live_under_data_dir() {
        let cfg = Config {
            supabase_url: None,
            anon_key: None,
            data_dir: PathBuf::from("/tmp/tienda"),
        };
        assert_eq!(cfg.log_dir(), PathBuf::from("/tmp/tienda/logs"));
        assert_eq!(cfg.db_path(), PathBuf::from("/tmp/tienda/tienda.db"));
    }
}
