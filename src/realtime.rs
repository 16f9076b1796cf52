//! Realtime refresh trigger.
//!
//! Subscribes to row changes on the order tables over the hosted realtime
//! websocket (Phoenix channel frames) and turns every notification into a
//! request for a FULL reload; nothing is patched incrementally. Bursts are
//! coalesced, and [`ReloadGate`] keeps an older in-flight reload from
//! overwriting the result of a newer one.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::SupabaseClient;
use crate::{Error, Result};

/// Tables whose changes invalidate the order board.
pub const ORDER_TABLES: &[&str] = &["orders", "order_items"];

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const CHANNEL_TOPIC: &str = "realtime:admin-orders";

/// Wait loop for the shared client handle: 50 attempts, 100 ms apart.
pub const CLIENT_WAIT_ATTEMPTS: u32 = 50;
pub const CLIENT_WAIT_INTERVAL: Duration = Duration::from_millis(100);

/// Notifications closer together than this trigger a single reload.
pub const COALESCE_WINDOW: Duration = Duration::from_millis(300);

// ---------------------------------------------------------------------------
// Frame codec
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotice {
    pub table: String,
    /// INSERT, UPDATE or DELETE.
    pub event: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    JoinOk,
    JoinError(String),
    Change(ChangeNotice),
    HeartbeatAck,
    Closed,
    ChannelError(String),
    Other,
}

/// `wss://<project>/realtime/v1/websocket?apikey=...&vsn=1.0.0`
pub fn socket_url(project_url: &str, anon_key: &str) -> Result<String> {
    let base = crate::api::normalize_project_url(project_url);
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        return Err(Error::Realtime(format!("unsupported project URL: {base}")));
    };
    let mut url = reqwest::Url::parse(&format!("{ws_base}/realtime/v1/websocket"))
        .map_err(|e| Error::Realtime(format!("invalid realtime URL: {e}")))?;
    url.query_pairs_mut()
        .append_pair("apikey", anon_key)
        .append_pair("vsn", "1.0.0");
    Ok(url.to_string())
}

pub fn join_message(tables: &[&str], access_token: Option<&str>, msg_ref: u64) -> Value {
    let changes: Vec<Value> = tables
        .iter()
        .map(|t| json!({ "event": "*", "schema": "public", "table": t }))
        .collect();
    let mut payload = json!({
        "config": {
            "broadcast": { "self": false },
            "presence": { "key": "" },
            "postgres_changes": changes,
        }
    });
    if let Some(token) = access_token {
        payload["access_token"] = Value::String(token.to_string());
    }
    json!({
        "topic": CHANNEL_TOPIC,
        "event": "phx_join",
        "payload": payload,
        "ref": msg_ref.to_string(),
    })
}

pub fn heartbeat_message(msg_ref: u64) -> Value {
    json!({
        "topic": "phoenix",
        "event": "heartbeat",
        "payload": {},
        "ref": msg_ref.to_string(),
    })
}

pub fn parse_server_message(text: &str) -> ServerMessage {
    let Ok(msg) = serde_json::from_str::<Value>(text) else {
        return ServerMessage::Other;
    };
    let event = msg.get("event").and_then(Value::as_str).unwrap_or("");
    let topic = msg.get("topic").and_then(Value::as_str).unwrap_or("");
    let payload = msg.get("payload").cloned().unwrap_or(Value::Null);

    match event {
        "phx_reply" => {
            let ok = payload.get("status").and_then(Value::as_str) == Some("ok");
            if topic == "phoenix" {
                ServerMessage::HeartbeatAck
            } else if ok {
                ServerMessage::JoinOk
            } else {
                let reason = payload
                    .get("response")
                    .and_then(|r| crate::value_str(r, &["reason", "message"]))
                    .unwrap_or_else(|| "join refused".to_string());
                ServerMessage::JoinError(reason)
            }
        }
        "postgres_changes" => {
            let data = payload.get("data").cloned().unwrap_or(Value::Null);
            let table = crate::value_str(&data, &["table"]).unwrap_or_default();
            let kind = crate::value_str(&data, &["type", "eventType"]).unwrap_or_default();
            if table.is_empty() {
                ServerMessage::Other
            } else {
                ServerMessage::Change(ChangeNotice { table, event: kind })
            }
        }
        "phx_close" => ServerMessage::Closed,
        "phx_error" => ServerMessage::ChannelError(
            crate::value_str(&payload, &["reason", "message"])
                .unwrap_or_else(|| "channel error".to_string()),
        ),
        "system" if payload.get("status").and_then(Value::as_str) == Some("error") => {
            ServerMessage::ChannelError(
                crate::value_str(&payload, &["message"]).unwrap_or_else(|| "system error".into()),
            )
        }
        _ => ServerMessage::Other,
    }
}

// ---------------------------------------------------------------------------
// Subscription task
// ---------------------------------------------------------------------------

pub struct RealtimeSubscription {
    pub notices: mpsc::Receiver<ChangeNotice>,
    pub handle: JoinHandle<()>,
}

impl RealtimeSubscription {
    /// Connect in the background and keep reconnecting until `cancel` fires
    /// or the receiver is dropped.
    pub fn spawn(
        client: &SupabaseClient,
        access_token: Option<String>,
        tables: &'static [&'static str],
        cancel: CancellationToken,
    ) -> Result<Self> {
        let url = socket_url(client.base_url(), client.anon_key())?;
        let (tx, rx) = mpsc::channel::<ChangeNotice>(64);

        let handle = tokio::spawn(async move {
            info!(tables = ?tables, "realtime subscription started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = run_connection(&url, access_token.as_deref(), tables, &tx, &cancel) => {
                        match result {
                            Ok(()) => {
                                if cancel.is_cancelled() || tx.is_closed() {
                                    break;
                                }
                                info!("realtime connection closed, reconnecting");
                            }
                            Err(e) => warn!(error = %e, "realtime connection failed"),
                        }
                    }
                }
                if tx.is_closed() {
                    break;
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                }
            }
            info!("realtime subscription stopped");
        });

        Ok(Self {
            notices: rx,
            handle,
        })
    }
}

async fn run_connection(
    url: &str,
    access_token: Option<&str>,
    tables: &[&str],
    tx: &mpsc::Sender<ChangeNotice>,
    cancel: &CancellationToken,
) -> Result<()> {
    let (mut ws, _resp) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| Error::Realtime(format!("connect failed: {e}")))?;
    let mut msg_ref: u64 = 1;

    ws.send(Message::Text(join_message(tables, access_token, msg_ref).to_string()))
        .await
        .map_err(|e| Error::Realtime(format!("join failed: {e}")))?;

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = ws.close(None).await;
                return Ok(());
            }
            _ = heartbeat.tick() => {
                msg_ref += 1;
                ws.send(Message::Text(heartbeat_message(msg_ref).to_string()))
                    .await
                    .map_err(|e| Error::Realtime(format!("heartbeat failed: {e}")))?;
            }
            frame = ws.next() => {
                let text = match frame {
                    None => return Ok(()),
                    Some(Err(e)) => return Err(Error::Realtime(e.to_string())),
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) => return Ok(()),
                    Some(Ok(_)) => continue,
                };
                match parse_server_message(&text) {
                    ServerMessage::JoinOk => info!("realtime channel joined"),
                    ServerMessage::JoinError(reason) => {
                        return Err(Error::Realtime(format!("join refused: {reason}")));
                    }
                    ServerMessage::Change(notice) => {
                        debug!(table = %notice.table, event = %notice.event, "realtime change");
                        if tx.send(notice).await.is_err() {
                            return Ok(());
                        }
                    }
                    ServerMessage::ChannelError(reason) => {
                        return Err(Error::Realtime(reason));
                    }
                    ServerMessage::Closed => return Ok(()),
                    ServerMessage::HeartbeatAck | ServerMessage::Other => {}
                }
            }
        }
    }
}

/// Wait for the first notice, then absorb any that follow within `window`.
/// Returns `None` once the channel is closed.
pub async fn next_batch(
    rx: &mut mpsc::Receiver<ChangeNotice>,
    window: Duration,
) -> Option<Vec<ChangeNotice>> {
    let first = rx.recv().await?;
    let mut batch = vec![first];
    let deadline = tokio::time::Instant::now() + window;
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(notice)) => batch.push(notice),
            Ok(None) | Err(_) => break,
        }
    }
    Some(batch)
}

// ---------------------------------------------------------------------------
// Reload ordering
// ---------------------------------------------------------------------------

/// Sequence guard for overlapping full reloads.
///
/// Every reload takes a ticket when it starts; its result is applied only if
/// no reload with a later ticket has been applied already.
#[derive(Debug, Default)]
pub struct ReloadGate {
    issued: AtomicU64,
    applied: AtomicU64,
}

impl ReloadGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) -> u64 {
        self.issued.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Returns `true` if the caller should apply the result of `ticket`.
    pub fn try_commit(&self, ticket: u64) -> bool {
        let mut current = self.applied.load(Ordering::SeqCst);
        loop {
            if ticket <= current {
                return false;
            }
            match self.applied.compare_exchange(
                current,
                ticket,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn last_applied(&self) -> u64 {
        self.applied.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Shared client handle
// ---------------------------------------------------------------------------

/// Client handle filled in once credentials are available.
#[derive(Debug, Clone, Default)]
pub struct ClientSlot(Arc<RwLock<Option<SupabaseClient>>>);

impl ClientSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, client: SupabaseClient) {
        let mut guard = self.0.write().unwrap_or_else(|e| e.into_inner());
        *guard = Some(client);
    }

    pub fn get(&self) -> Option<SupabaseClient> {
        self.0.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Poll `slot` until a client is available, up to `attempts` times.
pub async fn wait_for_client(
    slot: &ClientSlot,
    attempts: u32,
    interval: Duration,
) -> Result<SupabaseClient> {
    for attempt in 0..attempts {
        if let Some(client) = slot.get() {
            if attempt > 0 {
                debug!(attempt, "client became available");
            }
            return Ok(client);
        }
        tokio::time::sleep(interval).await;
    }
    slot.get().ok_or_else(|| {
        Error::NotConfigured(format!(
            "client not available after {attempts} attempts"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_url_switches_scheme() {
        let url = socket_url("https://abc.supabase.co/", "anon-key").unwrap();
        assert_eq!(
            url,
            "wss://abc.supabase.co/realtime/v1/websocket?apikey=anon-key&vsn=1.0.0"
        );
        let local = socket_url("localhost:54321", "k").unwrap();
        assert!(local.starts_with("ws://localhost:54321/realtime/v1/websocket"));
    }

    #[test]
    fn join_message_lists_every_table() {
        let msg = join_message(ORDER_TABLES, Some("jwt"), 1);
        assert_eq!(msg["event"], "phx_join");
        assert_eq!(msg["ref"], "1");
        let changes = msg["payload"]["config"]["postgres_changes"].as_array().unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0]["table"], "orders");
        assert_eq!(changes[1]["table"], "order_items");
        assert_eq!(msg["payload"]["access_token"], "jwt");

        let anon = join_message(ORDER_TABLES, None, 2);
        assert!(anon["payload"].get("access_token").is_none());
    }

    #[test]
    fn heartbeat_targets_phoenix_topic() {
        let hb = heartbeat_message(7);
        assert_eq!(hb["topic"], "phoenix");
        assert_eq!(hb["event"], "heartbeat");
        assert_eq!(hb["ref"], "7");
    }

    #[test]
    fn parses_postgres_change() {
        let frame = r#"{"event":"postgres_changes","topic":"realtime:admin-orders","ref":null,
            "payload":{"ids":[1],"data":{"schema":"public","table":"order_items","type":"UPDATE"}}}"#;
        assert_eq!(
            parse_server_message(frame),
            ServerMessage::Change(ChangeNotice {
                table: "order_items".into(),
                event: "UPDATE".into()
            })
        );
    }

    #[test]
    fn parses_replies_and_errors() {
        let join_ok = r#"{"event":"phx_reply","topic":"realtime:admin-orders","ref":"1","payload":{"status":"ok","response":{}}}"#;
        assert_eq!(parse_server_message(join_ok), ServerMessage::JoinOk);

        let join_err = r#"{"event":"phx_reply","topic":"realtime:admin-orders","ref":"1","payload":{"status":"error","response":{"reason":"unauthorized"}}}"#;
        assert_eq!(
            parse_server_message(join_err),
            ServerMessage::JoinError("unauthorized".into())
        );

        let hb = r#"{"event":"phx_reply","topic":"phoenix","ref":"2","payload":{"status":"ok","response":{}}}"#;
        assert_eq!(parse_server_message(hb), ServerMessage::HeartbeatAck);

        assert_eq!(
            parse_server_message(r#"{"event":"phx_close","topic":"x","payload":{}}"#),
            ServerMessage::Closed
        );
        assert_eq!(parse_server_message("not json"), ServerMessage::Other);
        assert_eq!(
            parse_server_message(r#"{"event":"presence_state","topic":"x","payload":{}}"#),
            ServerMessage::Other
        );
    }

    #[test]
    fn reload_gate_discards_stale_results() {
        let gate = ReloadGate::new();
        let first = gate.begin();
        let second = gate.begin();
        assert!(second > first);

        // The newer reload finishes first; the older one must be dropped.
        assert!(gate.try_commit(second));
        assert!(!gate.try_commit(first));
        assert_eq!(gate.last_applied(), second);

        let third = gate.begin();
        assert!(gate.try_commit(third));
        assert!(!gate.try_commit(third));
    }

    #[tokio::test]
    async fn next_batch_coalesces_bursts() {
        let (tx, mut rx) = mpsc::channel(8);
        for table in ["orders", "order_items", "order_items"] {
            tx.send(ChangeNotice {
                table: table.into(),
                event: "UPDATE".into(),
            })
            .await
            .unwrap();
        }
        let batch = next_batch(&mut rx, Duration::from_millis(20)).await.unwrap();
        assert_eq!(batch.len(), 3);

        drop(tx);
        assert!(next_batch(&mut rx, Duration::from_millis(20)).await.is_none());
    }

    #[tokio::test]
    async fn wait_for_client_sees_late_handle() {
        let slot = ClientSlot::new();
        let filler = slot.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            filler.set(SupabaseClient::new("https://abc.supabase.co", "anon").unwrap());
        });
        let client = wait_for_client(&slot, CLIENT_WAIT_ATTEMPTS, Duration::from_millis(5))
            .await
            .expect("client should appear");
        assert_eq!(client.base_url(), "https://abc.supabase.co");
    }

    #[tokio::test]
    async fn wait_for_client_gives_up() {
        let slot = ClientSlot::new();
        let err = wait_for_client(&slot, 3, Duration::from_millis(1))
            .await
            .expect_err("nobody fills the slot");
        assert!(matches!(err, Error::NotConfigured(_)));
    }
}
