//! Realtime change channel over WebSocket (Phoenix channel protocol)
//!
//! One socket per subscribed table: `phx_join` with a `postgres_changes`
//! config for the table, a heartbeat every 25 seconds on the `phoenix`
//! topic, and `postgres_changes` pushes decoded into [`ChangeEvent`]s.

use crate::sync::backend::Subscription;
use crate::sync::reconcile::{ChangeEvent, ChangeKind};
use crate::sync::types::{Row, Table};
use anyhow::{anyhow, bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::interval;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, error, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);
const JOIN_REF: &str = "1";

/// Phoenix channel frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhoenixMessage {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
}

/// `data` of a `postgres_changes` push
#[derive(Debug, Deserialize)]
struct PostgresChange {
    #[serde(rename = "type")]
    kind: ChangeKind,
    table: String,
    #[serde(default)]
    record: Option<Row>,
    #[serde(default)]
    old_record: Option<Row>,
}

/// Subscription channel for the changes of one table
#[derive(Debug, Clone)]
pub struct RealtimeChannel {
    table: Table,
    topic: String,
    access_key: String,
}

impl RealtimeChannel {
    pub fn new(table: Table, access_key: &str) -> Self {
        Self {
            table,
            topic: format!("realtime:{}-changes", table),
            access_key: access_key.to_string(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn join_message(&self, reference: &str) -> PhoenixMessage {
        PhoenixMessage {
            topic: self.topic.clone(),
            event: "phx_join".to_string(),
            payload: json!({
                "config": {
                    "broadcast": { "self": false },
                    "presence": { "key": "" },
                    "postgres_changes": [
                        { "event": "*", "schema": "public", "table": self.table.as_str() }
                    ]
                },
                "access_token": self.access_key,
            }),
            reference: Some(reference.to_string()),
        }
    }

    pub fn leave_message(&self, reference: &str) -> PhoenixMessage {
        PhoenixMessage {
            topic: self.topic.clone(),
            event: "phx_leave".to_string(),
            payload: json!({}),
            reference: Some(reference.to_string()),
        }
    }

    pub fn heartbeat_message(reference: &str) -> PhoenixMessage {
        PhoenixMessage {
            topic: "phoenix".to_string(),
            event: "heartbeat".to_string(),
            payload: json!({}),
            reference: Some(reference.to_string()),
        }
    }

    /// Decodes one text frame; `Ok(None)` for frames that carry no change
    pub fn parse_change(&self, text: &str) -> Result<Option<ChangeEvent>> {
        let msg: PhoenixMessage =
            serde_json::from_str(text).with_context(|| format!("invalid frame: {}", text))?;
        if msg.topic != self.topic {
            return Ok(None);
        }

        match msg.event.as_str() {
            "postgres_changes" => {
                let data = msg
                    .payload
                    .get("data")
                    .cloned()
                    .ok_or_else(|| anyhow!("postgres_changes without data"))?;
                let change: PostgresChange = serde_json::from_value(data)?;
                if change.table != self.table.as_str() {
                    return Ok(None);
                }
                Ok(Some(ChangeEvent {
                    table: self.table,
                    kind: change.kind,
                    new: change.record.unwrap_or_default(),
                    old: change.old_record.unwrap_or_default(),
                }))
            }
            "phx_error" => bail!("channel {} errored: {}", self.topic, msg.payload),
            "phx_reply" if msg.payload.get("status") == Some(&json!("error")) => {
                bail!("channel {} rejected: {}", self.topic, msg.payload)
            }
            "system" | "presence_state" | "phx_reply" => {
                debug!("[Realtime] {} {}: {}", self.topic, msg.event, msg.payload);
                Ok(None)
            }
            other => {
                debug!("[Realtime] ignoring {} on {}", other, self.topic);
                Ok(None)
            }
        }
    }

    /// Connects, joins the channel and spawns the reader / heartbeat task
    pub async fn open(self, ws_url: &str) -> Result<Subscription> {
        info!("[Realtime] 🔗 connecting channel {}", self.topic);
        let (ws_stream, response) = connect_async(ws_url)
            .await
            .with_context(|| format!("realtime connect failed for {}", self.table))?;
        debug!("[Realtime] handshake status: {}", response.status());

        let (mut write, mut read) = ws_stream.split();
        let join = serde_json::to_string(&self.join_message(JOIN_REF))?;
        write
            .send(WsMessage::Text(join))
            .await
            .context("sending phx_join failed")?;

        // wait for the join reply before handing out the subscription
        loop {
            match read.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    let msg: PhoenixMessage = serde_json::from_str(&text)
                        .with_context(|| format!("invalid frame: {}", text))?;
                    if msg.event == "phx_reply" && msg.reference.as_deref() == Some(JOIN_REF) {
                        if msg.payload.get("status") == Some(&json!("ok")) {
                            break;
                        }
                        error!("[Realtime] ❌ join of {} rejected: {}", self.topic, msg.payload);
                        bail!("join of {} rejected: {}", self.topic, msg.payload);
                    }
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e).context("realtime socket error during join"),
                None => bail!("realtime socket closed before join reply"),
            }
        }
        info!("[Realtime] ✅ joined {}", self.topic);

        let (tx, rx) = mpsc::unbounded_channel();
        let (close_tx, mut close_rx) = oneshot::channel::<()>();
        let table = self.table;

        tokio::spawn(async move {
            let mut next_ref: u64 = 2;
            let mut ticker = interval(HEARTBEAT_INTERVAL);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = &mut close_rx => {
                        let leave = self.leave_message(&next_ref.to_string());
                        if let Ok(text) = serde_json::to_string(&leave) {
                            let _ = write.send(WsMessage::Text(text)).await;
                        }
                        let _ = write.close().await;
                        break;
                    }
                    _ = ticker.tick() => {
                        let heartbeat = Self::heartbeat_message(&next_ref.to_string());
                        next_ref += 1;
                        let Ok(text) = serde_json::to_string(&heartbeat) else { continue };
                        if write.send(WsMessage::Text(text)).await.is_err() {
                            warn!("[Realtime] 💓 heartbeat failed on {}", self.topic);
                            break;
                        }
                    }
                    frame = read.next() => match frame {
                        Some(Ok(WsMessage::Text(text))) => match self.parse_change(&text) {
                            Ok(Some(event)) => {
                                if tx.send(event).is_err() {
                                    break;
                                }
                            }
                            Ok(None) => {}
                            Err(e) => warn!("[Realtime] {:#}", e),
                        },
                        Some(Ok(WsMessage::Close(frame))) => {
                            warn!("[Realtime] server closed {}: {:?}", self.topic, frame);
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!("[Realtime] ❌ socket error on {}: {}", self.topic, e);
                            break;
                        }
                        None => {
                            warn!("[Realtime] socket for {} ended", self.topic);
                            break;
                        }
                    },
                }
            }
            // dropping `tx` ends the subscription; the store's pump records it
            debug!("[Realtime] channel {} finished", self.topic);
        });

        Ok(Subscription::new(table, rx, close_tx))
    }
}

/// Realtime socket url for a backend base url (`https` -> `wss`)
pub fn realtime_url(base_url: &str, access_key: &str) -> Result<String> {
    let base = base_url.trim_end_matches('/');
    let socket_base = if let Some(host) = base.strip_prefix("https://") {
        format!("wss://{}", host)
    } else if let Some(host) = base.strip_prefix("http://") {
        format!("ws://{}", host)
    } else {
        bail!("backend url must start with http:// or https://: {}", base_url);
    };
    Ok(format!(
        "{}/realtime/v1/websocket?apikey={}&vsn=1.0.0",
        socket_base, access_key
    ))
}
