//! Hosted backend client.
//!
//! Thin wrapper over the REST (PostgREST), RPC and auth endpoints of the
//! hosted backend. Every call carries the project anon key; calls made on
//! behalf of a logged-in operator also carry the session's access token.

use reqwest::{Client, Method, RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::{Error, Result};

/// Default timeout for API requests (30 seconds).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the project URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes
/// - strip a trailing `/rest/v1` segment
pub fn normalize_project_url(url: &str) -> String {
    let mut url = url.trim().to_string();
    if url.is_empty() {
        return url;
    }

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }
    if url.ends_with("/rest/v1") {
        url.truncate(url.len() - "/rest/v1".len());
    }
    while url.ends_with('/') {
        url.pop();
    }

    url
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a user-friendly message.
fn friendly_error(url: &str, err: &reqwest::Error) -> Error {
    if err.is_connect() {
        return Error::Http(format!("Cannot reach the store backend at {url}"));
    }
    if err.is_timeout() {
        return Error::Http(format!("Connection to {url} timed out"));
    }
    if err.is_builder() {
        return Error::Http(format!("Invalid store backend URL: {url}"));
    }
    Error::Http(format!("Network error communicating with {url}: {err}"))
}

/// Fallback message for a status code without a usable body.
fn status_message(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "Session is invalid or expired".to_string(),
        403 => "Operation not permitted for this account".to_string(),
        404 => "Resource not found".to_string(),
        409 => "Conflicting record already exists".to_string(),
        s if s >= 500 => format!("Store backend server error (HTTP {s})"),
        s => format!("Unexpected response from store backend (HTTP {s})"),
    }
}

/// Build the error for a non-success response, preserving the server's
/// `message`, `details` and `hint` fields for diagnostics.
pub(crate) fn error_from_response(status: StatusCode, body_text: &str) -> Error {
    let message = match serde_json::from_str::<Value>(body_text) {
        Ok(json) => {
            let base = crate::value_str(
                &json,
                &["message", "error_description", "msg", "error"],
            )
            .unwrap_or_else(|| status_message(status));
            let details = crate::value_str(&json, &["details", "hint"]);
            match details {
                Some(d) if d != base => format!("{base}: {d}"),
                _ => base,
            }
        }
        Err(_) if !body_text.trim().is_empty() => {
            format!("{}: {}", status_message(status), body_text.trim())
        }
        Err(_) => status_message(status),
    };

    match status.as_u16() {
        401 => Error::Unauthorized,
        403 => Error::Forbidden(message),
        404 => Error::NotFound(message),
        409 => Error::Conflict(message),
        s => Error::Api { status: s, message },
    }
}

// ---------------------------------------------------------------------------
// Query builder
// ---------------------------------------------------------------------------

/// PostgREST query parameters (`select`, filters, ordering, paging).
#[derive(Debug, Clone, Default)]
pub struct Query {
    params: Vec<(String, String)>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select(mut self, columns: &str) -> Self {
        self.params.push(("select".into(), columns.into()));
        self
    }

    pub fn eq(self, column: &str, value: impl ToString) -> Self {
        self.filter(column, "eq", value)
    }

    pub fn neq(self, column: &str, value: impl ToString) -> Self {
        self.filter(column, "neq", value)
    }

    pub fn gt(self, column: &str, value: impl ToString) -> Self {
        self.filter(column, "gt", value)
    }

    pub fn gte(self, column: &str, value: impl ToString) -> Self {
        self.filter(column, "gte", value)
    }

    pub fn lte(self, column: &str, value: impl ToString) -> Self {
        self.filter(column, "lte", value)
    }

    /// `column=ilike.*pattern*`, with PostgREST wildcards.
    pub fn ilike(self, column: &str, pattern: &str) -> Self {
        self.filter(column, "ilike", format!("*{}*", sanitize_filter_value(pattern)))
    }

    /// `column=in.(a,b,c)`; values are double-quoted.
    pub fn in_list<S: AsRef<str>>(mut self, column: &str, values: &[S]) -> Self {
        let list = values
            .iter()
            .map(|v| format!("\"{}\"", v.as_ref().replace('"', "")))
            .collect::<Vec<_>>()
            .join(",");
        self.params.push((column.into(), format!("in.({list})")));
        self
    }

    /// Raw `or=(...)` expression, e.g. `name.ilike.*ana*,dni.eq.123`.
    pub fn or(mut self, expression: &str) -> Self {
        self.params.push(("or".into(), format!("({expression})")));
        self
    }

    pub fn order(mut self, column: &str, ascending: bool) -> Self {
        let dir = if ascending { "asc" } else { "desc" };
        self.params.push(("order".into(), format!("{column}.{dir}")));
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.params.push(("limit".into(), n.to_string()));
        self
    }

    pub fn on_conflict(mut self, columns: &str) -> Self {
        self.params.push(("on_conflict".into(), columns.into()));
        self
    }

    fn filter(mut self, column: &str, op: &str, value: impl ToString) -> Self {
        self.params
            .push((column.into(), format!("{op}.{}", value.to_string())));
        self
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.params
    }

    fn has_filter(&self) -> bool {
        self.params
            .iter()
            .any(|(k, _)| !matches!(k.as_str(), "select" | "order" | "limit" | "on_conflict"))
    }
}

/// Strip characters with meaning inside PostgREST filter expressions.
pub fn sanitize_filter_value(raw: &str) -> String {
    raw.trim()
        .chars()
        .filter(|c| !matches!(c, ',' | '(' | ')' | '*' | '"' | '\\'))
        .collect()
}

// ---------------------------------------------------------------------------
// RPC outcome
// ---------------------------------------------------------------------------

/// The `{ success, message, ... }` envelope most store procedures return.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RpcOutcome {
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default, alias = "error")]
    pub message: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

fn default_true() -> bool {
    true
}

impl RpcOutcome {
    /// Interpret a raw RPC result. `null` and non-object results count as
    /// success; `success: false` becomes `Error::Rejected`.
    pub fn from_value(value: Value) -> Result<Self> {
        let outcome = match value {
            Value::Object(_) => serde_json::from_value::<RpcOutcome>(value)?,
            Value::Array(mut rows) if rows.len() == 1 && rows[0].is_object() => {
                serde_json::from_value::<RpcOutcome>(rows.remove(0))?
            }
            _ => RpcOutcome {
                success: true,
                ..Default::default()
            },
        };
        if !outcome.success {
            return Err(Error::Rejected(
                outcome
                    .message
                    .clone()
                    .unwrap_or_else(|| "operation failed".to_string()),
            ));
        }
        Ok(outcome)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(Value::as_str)
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct SupabaseClient {
    http: Client,
    base_url: String,
    anon_key: Zeroizing<String>,
    access_token: Option<Zeroizing<String>>,
}

impl std::fmt::Debug for SupabaseClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupabaseClient")
            .field("base_url", &self.base_url)
            .field("authenticated", &self.access_token.is_some())
            .finish()
    }
}

impl SupabaseClient {
    pub fn new(project_url: &str, anon_key: &str) -> Result<Self> {
        let base_url = normalize_project_url(project_url);
        Url::parse(&base_url).map_err(|e| Error::Http(format!("Invalid project URL: {e}")))?;
        let http = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| Error::Http(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url,
            anon_key: Zeroizing::new(anon_key.trim().to_string()),
            access_token: None,
        })
    }

    pub fn with_access_token(mut self, token: &str) -> Self {
        self.access_token = Some(Zeroizing::new(token.to_string()));
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn anon_key(&self) -> &str {
        &self.anon_key
    }

    pub fn is_authenticated(&self) -> bool {
        self.access_token.is_some()
    }

    /// Bearer token: the session token when logged in, otherwise the anon key.
    fn bearer(&self) -> &str {
        self.access_token
            .as_deref()
            .map(String::as_str)
            .unwrap_or(self.anon_key.as_str())
    }

    pub(crate) fn endpoint(&self, path: &str, query: &[(String, String)]) -> Result<Url> {
        let mut url = Url::parse(&format!("{}{path}", self.base_url))
            .map_err(|e| Error::Http(format!("Invalid project URL: {e}")))?;
        if !query.is_empty() {
            let mut qp = url.query_pairs_mut();
            for (k, v) in query {
                qp.append_pair(k, v);
            }
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.http
            .request(method, url)
            .header("apikey", self.anon_key.as_str())
            .header("Authorization", format!("Bearer {}", self.bearer()))
            .header("Content-Type", "application/json")
    }

    /// Send a request and return the JSON body (`Value::Null` for empty bodies).
    pub(crate) async fn send(&self, req: RequestBuilder) -> Result<Value> {
        let resp = req
            .send()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;
        let status = resp.status();
        let body_text = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            let err = error_from_response(status, &body_text);
            warn!(status = status.as_u16(), error = %err, "store backend request failed");
            return Err(err);
        }
        if body_text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text).map_err(Error::from)
    }

    pub(crate) fn post_auth(&self, path: &str, query: &[(String, String)]) -> Result<RequestBuilder> {
        let url = self.endpoint(path, query)?;
        Ok(self.request(Method::POST, url))
    }

    // -- tables -------------------------------------------------------------

    pub async fn select<T: DeserializeOwned>(&self, table: &str, query: &Query) -> Result<Vec<T>> {
        let url = self.endpoint(&format!("/rest/v1/{table}"), query.pairs())?;
        debug!(table, "select");
        let value = self.send(self.request(Method::GET, url)).await?;
        decode_rows(value)
    }

    pub async fn insert<T, B>(&self, table: &str, body: &B) -> Result<Vec<T>>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let url = self.endpoint(&format!("/rest/v1/{table}"), &[])?;
        let req = self
            .request(Method::POST, url)
            .header("Prefer", "return=representation")
            .json(body);
        decode_rows(self.send(req).await?)
    }

    /// Insert-or-update on the given conflict columns.
    pub async fn upsert<B>(&self, table: &str, on_conflict: &str, body: &B) -> Result<usize>
    where
        B: Serialize + ?Sized,
    {
        let query = Query::new().on_conflict(on_conflict);
        let url = self.endpoint(&format!("/rest/v1/{table}"), query.pairs())?;
        let req = self
            .request(Method::POST, url)
            .header("Prefer", "resolution=merge-duplicates,return=representation")
            .json(body);
        let rows: Vec<Value> = decode_rows(self.send(req).await?)?;
        Ok(rows.len())
    }

    pub async fn update<T, B>(&self, table: &str, filter: &Query, body: &B) -> Result<Vec<T>>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        if !filter.has_filter() {
            return Err(Error::validation("Refusing to update without a filter"));
        }
        let url = self.endpoint(&format!("/rest/v1/{table}"), filter.pairs())?;
        let req = self
            .request(Method::PATCH, url)
            .header("Prefer", "return=representation")
            .json(body);
        decode_rows(self.send(req).await?)
    }

    pub async fn delete(&self, table: &str, filter: &Query) -> Result<()> {
        if !filter.has_filter() {
            return Err(Error::validation("Refusing to delete without a filter"));
        }
        let url = self.endpoint(&format!("/rest/v1/{table}"), filter.pairs())?;
        self.send(self.request(Method::DELETE, url)).await?;
        Ok(())
    }

    // -- procedures ---------------------------------------------------------

    /// Call a remote procedure by name and decode its result.
    pub async fn rpc<T, A>(&self, name: &str, args: &A) -> Result<T>
    where
        T: DeserializeOwned,
        A: Serialize + ?Sized,
    {
        let value = self.rpc_value(name, args).await?;
        serde_json::from_value(value).map_err(Error::from)
    }

    pub async fn rpc_value<A>(&self, name: &str, args: &A) -> Result<Value>
    where
        A: Serialize + ?Sized,
    {
        let url = self.endpoint(&format!("/rest/v1/rpc/{name}"), &[])?;
        debug!(procedure = name, "rpc");
        self.send(self.request(Method::POST, url).json(args)).await
    }

    /// Call a procedure that answers with an [`RpcOutcome`] envelope.
    pub async fn rpc_outcome<A>(&self, name: &str, args: &A) -> Result<RpcOutcome>
    where
        A: Serialize + ?Sized,
    {
        RpcOutcome::from_value(self.rpc_value(name, args).await?)
    }
}

fn decode_rows<T: DeserializeOwned>(value: Value) -> Result<Vec<T>> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(_) => serde_json::from_value(value).map_err(Error::from),
        other => Ok(vec![serde_json::from_value(other)?]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_project_url_variants() {
        assert_eq!(
            normalize_project_url("abc.supabase.co/"),
            "https://abc.supabase.co"
        );
        assert_eq!(
            normalize_project_url("localhost:54321/rest/v1/"),
            "http://localhost:54321"
        );
        assert_eq!(
            normalize_project_url(" https://abc.supabase.co/rest/v1 "),
            "https://abc.supabase.co"
        );
        assert_eq!(normalize_project_url("   "), "");
    }

    #[test]
    fn query_builder_encodes_postgrest_filters() {
        let q = Query::new()
            .select("*,order_items(*)")
            .eq("status", "active")
            .in_list("id", &["a", "b"])
            .order("created_at", false)
            .limit(50);
        let pairs = q.pairs();
        assert_eq!(pairs[0], ("select".into(), "*,order_items(*)".into()));
        assert_eq!(pairs[1], ("status".into(), "eq.active".into()));
        assert_eq!(pairs[2], ("id".into(), "in.(\"a\",\"b\")".into()));
        assert_eq!(pairs[3], ("order".into(), "created_at.desc".into()));
        assert_eq!(pairs[4], ("limit".into(), "50".into()));
    }

    #[test]
    fn ilike_strips_reserved_characters() {
        let q = Query::new().ilike("name", " ana (maría), ");
        assert_eq!(q.pairs()[0].1, "ilike.*ana maría*");
    }

    #[test]
    fn filterless_queries_are_detected() {
        assert!(!Query::new().select("*").limit(1).has_filter());
        assert!(Query::new().eq("id", 1).has_filter());
    }

    #[test]
    fn endpoint_appends_query_pairs() {
        let client = SupabaseClient::new("abc.supabase.co", "anon").unwrap();
        let url = client
            .endpoint(
                "/rest/v1/orders",
                Query::new().eq("order_number", 1042).pairs(),
            )
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://abc.supabase.co/rest/v1/orders?order_number=eq.1042"
        );
    }

    #[test]
    fn response_errors_keep_server_details() {
        let err = error_from_response(
            StatusCode::BAD_REQUEST,
            r#"{"message":"insufficient stock","details":"variant 12"}"#,
        );
        match err {
            Error::Api { status, message } => {
                assert_eq!(status, 400);
                assert_eq!(message, "insufficient stock: variant 12");
            }
            other => panic!("unexpected error: {other:?}"),
        }

        assert!(matches!(
            error_from_response(StatusCode::UNAUTHORIZED, ""),
            Error::Unauthorized
        ));
        assert!(matches!(
            error_from_response(StatusCode::CONFLICT, r#"{"message":"dup"}"#),
            Error::Conflict(m) if m == "dup"
        ));
        match error_from_response(StatusCode::BAD_GATEWAY, "upstream down") {
            Error::Api { message, .. } => assert!(message.contains("upstream down")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn rpc_outcome_interpretation() {
        assert!(RpcOutcome::from_value(Value::Null).unwrap().success);

        let ok = RpcOutcome::from_value(serde_json::json!({
            "success": true, "order_number": "1042"
        }))
        .unwrap();
        assert_eq!(ok.get_str("order_number"), Some("1042"));

        let rejected = RpcOutcome::from_value(serde_json::json!({
            "success": false, "message": "sin stock"
        }))
        .expect_err("success=false must fail");
        assert!(matches!(rejected, Error::Rejected(m) if m == "sin stock"));

        let wrapped = RpcOutcome::from_value(serde_json::json!([{ "success": false, "error": "x" }]));
        assert!(matches!(wrapped, Err(Error::Rejected(m)) if m == "x"));
    }
}
