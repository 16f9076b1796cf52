//! Operator authentication against the hosted auth service.
//!
//! Password login, token refresh and logout. The session (access token,
//! refresh token, expiry) is persisted in the OS keyring through
//! [`crate::storage`]. Back-office commands additionally require the `admin`
//! role carried in the token claims.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::api::SupabaseClient;
use crate::config::Config;
use crate::{storage, Error, Result};

/// Sessions this close to expiry are refreshed before use.
const REFRESH_MARGIN_SECS: i64 = 60;

pub const ADMIN_ROLE: &str = "admin";

// ---------------------------------------------------------------------------
// Claims
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Claims {
    pub sub: String,
    pub email: Option<String>,
    pub exp: i64,
    pub role: Option<String>,
}

/// Decode the payload segment of a JWT without verifying it. The server
/// verifies every request; the client only reads identity and expiry.
pub fn decode_claims(jwt: &str) -> Result<Claims> {
    let payload = jwt
        .split('.')
        .nth(1)
        .ok_or_else(|| Error::validation("Malformed access token"))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| Error::validation(format!("Malformed access token: {e}")))?;
    let json: Value = serde_json::from_slice(&bytes)?;

    let role = json
        .get("app_metadata")
        .and_then(|m| crate::value_str(m, &["role"]))
        .or_else(|| crate::value_str(&json, &["user_role"]));

    Ok(Claims {
        sub: crate::value_str(&json, &["sub"]).unwrap_or_default(),
        email: crate::value_str(&json, &["email"]),
        exp: json.get("exp").and_then(Value::as_i64).unwrap_or(0),
        role,
    })
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Session {
    access_token: Zeroizing<String>,
    refresh_token: Zeroizing<String>,
    /// Unix seconds.
    pub expires_at: i64,
    pub email: String,
    pub claims: Claims,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("email", &self.email)
            .field("expires_at", &self.expires_at)
            .field("role", &self.claims.role)
            .finish()
    }
}

impl Session {
    pub fn from_tokens(
        access_token: String,
        refresh_token: String,
        expires_at: i64,
        email: String,
    ) -> Result<Self> {
        let claims = decode_claims(&access_token)?;
        let expires_at = if expires_at > 0 { expires_at } else { claims.exp };
        let email = if email.is_empty() {
            claims.email.clone().unwrap_or_default()
        } else {
            email
        };
        Ok(Self {
            access_token: Zeroizing::new(access_token),
            refresh_token: Zeroizing::new(refresh_token),
            expires_at,
            email,
            claims,
        })
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn refresh_token(&self) -> &str {
        &self.refresh_token
    }

    pub fn needs_refresh(&self, now_secs: i64) -> bool {
        self.expires_at - now_secs <= REFRESH_MARGIN_SECS
    }

    pub fn is_admin(&self) -> bool {
        self.claims.role.as_deref() == Some(ADMIN_ROLE)
    }
}

/// Back-office operations are limited to admin accounts.
pub fn require_admin(session: &Session) -> Result<()> {
    if session.is_admin() {
        Ok(())
    } else {
        Err(Error::Forbidden(format!(
            "{} is not an administrator",
            session.email
        )))
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
    #[serde(default)]
    user: Option<Value>,
}

impl TokenResponse {
    fn into_session(self, fallback_email: &str) -> Result<Session> {
        let now = Utc::now().timestamp();
        let expires_at = self
            .expires_at
            .or_else(|| self.expires_in.map(|secs| now + secs))
            .unwrap_or(0);
        let email = self
            .user
            .as_ref()
            .and_then(|u| crate::value_str(u, &["email"]))
            .unwrap_or_else(|| fallback_email.to_string());
        Session::from_tokens(self.access_token, self.refresh_token, expires_at, email)
    }
}

// ---------------------------------------------------------------------------
// Remote calls
// ---------------------------------------------------------------------------

pub async fn login(client: &SupabaseClient, email: &str, password: &str) -> Result<Session> {
    let email = email.trim();
    if email.is_empty() || password.is_empty() {
        return Err(Error::validation("Email and password are required"));
    }
    let req = client
        .post_auth(
            "/auth/v1/token",
            &[("grant_type".to_string(), "password".to_string())],
        )?
        .json(&serde_json::json!({ "email": email, "password": password }));
    let value = match client.send(req).await {
        // The auth service answers bad credentials with 400.
        Err(Error::Api { status: 400, .. }) => {
            return Err(Error::validation("Invalid email or password"))
        }
        other => other?,
    };
    let session = serde_json::from_value::<TokenResponse>(value)?.into_session(email)?;
    info!(email = %session.email, admin = session.is_admin(), "logged in");
    Ok(session)
}

pub async fn refresh(client: &SupabaseClient, session: &Session) -> Result<Session> {
    let req = client
        .post_auth(
            "/auth/v1/token",
            &[("grant_type".to_string(), "refresh_token".to_string())],
        )?
        .json(&serde_json::json!({ "refresh_token": session.refresh_token() }));
    let value = match client.send(req).await {
        Err(Error::Api { status: 400, .. }) => return Err(Error::Unauthorized),
        other => other?,
    };
    let refreshed = serde_json::from_value::<TokenResponse>(value)?.into_session(&session.email)?;
    info!(email = %refreshed.email, "session refreshed");
    Ok(refreshed)
}

/// Revoke the session server-side (best effort) and forget it locally.
pub async fn logout(client: &SupabaseClient) -> Result<()> {
    if let Some(session) = storage::load_session() {
        let authed = client.clone().with_access_token(session.access_token());
        match authed.post_auth("/auth/v1/logout", &[]) {
            Ok(req) => {
                if let Err(e) = authed.send(req).await {
                    warn!(error = %e, "remote logout failed, clearing local session anyway");
                }
            }
            Err(e) => warn!(error = %e, "could not build logout request"),
        }
    }
    storage::clear_session()?;
    info!("logged out");
    Ok(())
}

/// Anonymous client for the configured project.
pub fn anon_client(config: &Config) -> Result<SupabaseClient> {
    let (url, key) = config.project()?;
    SupabaseClient::new(url, key)
}

/// Client acting as the stored session, refreshing it first when close to
/// expiry. Fails with `Unauthorized` when nobody is logged in.
pub async fn session_client(config: &Config) -> Result<(SupabaseClient, Session)> {
    let client = anon_client(config)?;
    let mut session = storage::load_session().ok_or(Error::Unauthorized)?;

    if session.needs_refresh(Utc::now().timestamp()) {
        session = match refresh(&client, &session).await {
            Ok(s) => s,
            Err(Error::Unauthorized) => {
                storage::clear_session()?;
                return Err(Error::Unauthorized);
            }
            Err(e) => return Err(e),
        };
        storage::save_session(&session)?;
    }

    let client = client.with_access_token(session.access_token());
    Ok((client, session))
}

/// Like [`session_client`] but also requires the admin role.
pub async fn admin_client(config: &Config) -> Result<(SupabaseClient, Session)> {
    let (client, session) = session_client(config).await?;
    require_admin(&session)?;
    Ok((client, session))
}

#[cfg(test)]
pub(crate) fn fake_jwt(claims: &Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string().as_bytes());
    format!("{header}.{payload}.signature")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_claims_reads_app_metadata_role() {
        let jwt = fake_jwt(&serde_json::json!({
            "sub": "user-1",
            "email": "caja@tienda.com",
            "exp": 1_900_000_000,
            "app_metadata": { "role": "admin" }
        }));
        let claims = decode_claims(&jwt).unwrap();
        assert_eq!(claims.sub, "user-1");
        assert_eq!(claims.email.as_deref(), Some("caja@tienda.com"));
        assert_eq!(claims.exp, 1_900_000_000);
        assert_eq!(claims.role.as_deref(), Some("admin"));
    }

    #[test]
    fn decode_claims_falls_back_to_user_role() {
        let jwt = fake_jwt(&serde_json::json!({ "sub": "u", "user_role": "staff" }));
        assert_eq!(decode_claims(&jwt).unwrap().role.as_deref(), Some("staff"));
    }

    #[test]
    fn decode_claims_rejects_garbage() {
        assert!(decode_claims("not-a-token").is_err());
        assert!(decode_claims("a.!!!.c").is_err());
    }

    #[test]
    fn session_uses_claim_expiry_and_email_when_missing() {
        let jwt = fake_jwt(&serde_json::json!({
            "sub": "u", "email": "a@b.c", "exp": 1_000
        }));
        let session = Session::from_tokens(jwt, "r".into(), 0, String::new()).unwrap();
        assert_eq!(session.expires_at, 1_000);
        assert_eq!(session.email, "a@b.c");
        assert!(session.needs_refresh(950));
        assert!(!session.needs_refresh(900));
    }

    #[test]
    fn require_admin_checks_role() {
        let admin = Session::from_tokens(
            fake_jwt(&serde_json::json!({ "sub": "1", "app_metadata": { "role": "admin" } })),
            "r".into(),
            10,
            "admin@tienda.com".into(),
        )
        .unwrap();
        assert!(require_admin(&admin).is_ok());

        let customer = Session::from_tokens(
            fake_jwt(&serde_json::json!({ "sub": "2" })),
            "r".into(),
            10,
            "cliente@tienda.com".into(),
        )
        .unwrap();
        let err = require_admin(&customer).expect_err("not admin");
        assert!(matches!(err, Error::Forbidden(_)));
    }

    #[test]
    fn token_response_computes_expiry_from_expires_in() {
        let resp = TokenResponse {
            access_token: fake_jwt(&serde_json::json!({ "sub": "1" })),
            refresh_token: "r".into(),
            expires_in: Some(3600),
            expires_at: None,
            user: Some(serde_json::json!({ "email": "x@y.z" })),
        };
        let before = Utc::now().timestamp();
        let session = resp.into_session("fallback@y.z").unwrap();
        assert!(session.expires_at >= before + 3600);
        assert_eq!(session.email, "x@y.z");
    }
}
