//! Credential storage using the OS credential store.
//!
//! On Windows this uses the Credential Manager (via the `keyring` crate), on
//! macOS Keychain, and on Linux the Secret Service API. Project settings and
//! the current login session are kept here instead of a flat file.

use keyring::Entry;
use tracing::{info, warn};

use crate::auth::Session;
use crate::Result;

const SERVICE_NAME: &str = "tienda-admin";

// Credential keys
pub const KEY_SUPABASE_URL: &str = "supabase_url";
pub const KEY_SUPABASE_ANON_KEY: &str = "supabase_anon_key";
const KEY_ACCESS_TOKEN: &str = "access_token";
const KEY_REFRESH_TOKEN: &str = "refresh_token";
const KEY_SESSION_EXPIRES_AT: &str = "session_expires_at";
const KEY_SESSION_EMAIL: &str = "session_email";

const SESSION_KEYS: &[&str] = &[
    KEY_ACCESS_TOKEN,
    KEY_REFRESH_TOKEN,
    KEY_SESSION_EXPIRES_AT,
    KEY_SESSION_EMAIL,
];

/// All credential keys managed by this module.
const ALL_KEYS: &[&str] = &[
    KEY_SUPABASE_URL,
    KEY_SUPABASE_ANON_KEY,
    KEY_ACCESS_TOKEN,
    KEY_REFRESH_TOKEN,
    KEY_SESSION_EXPIRES_AT,
    KEY_SESSION_EMAIL,
];

// ---------------------------------------------------------------------------
// Low-level helpers
// ---------------------------------------------------------------------------

/// Retrieve a single credential from the OS keyring. Returns `None` when the
/// entry does not exist (or the platform returns a "not found" error).
pub fn get_credential(key: &str) -> Option<String> {
    let entry = match Entry::new(SERVICE_NAME, key) {
        Ok(e) => e,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to create entry");
            return None;
        }
    };
    match entry.get_password() {
        Ok(pw) => Some(pw),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to read credential");
            None
        }
    }
}

/// Store a credential in the OS keyring.
pub fn set_credential(key: &str, value: &str) -> Result<()> {
    let entry = Entry::new(SERVICE_NAME, key)?;
    entry.set_password(value)?;
    Ok(())
}

/// Delete a credential from the OS keyring. Silently succeeds if the entry
/// does not exist.
pub fn delete_credential(key: &str) -> Result<()> {
    let entry = Entry::new(SERVICE_NAME, key)?;
    match entry.delete_credential() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub fn has_credential(key: &str) -> bool {
    get_credential(key).is_some()
}

// ---------------------------------------------------------------------------
// High-level API
// ---------------------------------------------------------------------------

/// The client is considered configured when the project URL and anon key are
/// both present in the credential store.
pub fn is_configured() -> bool {
    has_credential(KEY_SUPABASE_URL) && has_credential(KEY_SUPABASE_ANON_KEY)
}

/// Persist the project URL and anon key.
pub fn save_project(url: &str, anon_key: &str) -> Result<()> {
    let normalized = crate::api::normalize_project_url(url);
    if normalized.is_empty() || anon_key.trim().is_empty() {
        return Err(crate::Error::validation("Project URL and anon key are required"));
    }
    set_credential(KEY_SUPABASE_URL, &normalized)?;
    set_credential(KEY_SUPABASE_ANON_KEY, anon_key.trim())?;
    info!(url = %normalized, "project settings saved");
    Ok(())
}

pub fn save_session(session: &Session) -> Result<()> {
    set_credential(KEY_ACCESS_TOKEN, session.access_token())?;
    set_credential(KEY_REFRESH_TOKEN, session.refresh_token())?;
    set_credential(KEY_SESSION_EXPIRES_AT, &session.expires_at.to_string())?;
    set_credential(KEY_SESSION_EMAIL, &session.email)?;
    Ok(())
}

/// Load the stored session, if a complete one exists.
pub fn load_session() -> Option<Session> {
    let access = get_credential(KEY_ACCESS_TOKEN)?;
    let refresh = get_credential(KEY_REFRESH_TOKEN)?;
    let expires_at = get_credential(KEY_SESSION_EXPIRES_AT)?
        .parse::<i64>()
        .ok()?;
    let email = get_credential(KEY_SESSION_EMAIL).unwrap_or_default();
    Session::from_tokens(access, refresh, expires_at, email).ok()
}

pub fn clear_session() -> Result<()> {
    for key in SESSION_KEYS {
        delete_credential(key)?;
    }
    Ok(())
}

/// Delete every stored credential.
pub fn factory_reset() -> Result<()> {
    info!("deleting all stored credentials");
    for key in ALL_KEYS {
        delete_credential(key)?;
    }
    Ok(())
}
