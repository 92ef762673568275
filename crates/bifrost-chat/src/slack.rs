// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Slack Web API client and Socket Mode ingress.
//!
//! Socket Mode uses an outbound WebSocket, so no inbound port or signing
//! secret is needed — only the bot token (`xoxb-…`) for the Web API and the
//! app-level token (`xapp-…`) to open the socket.  Every received envelope
//! is acknowledged immediately; events the gateway does not care about are
//! dropped after the ack.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::{ChatClient, ChatError, ChatEvent, ChatFile, ChatStreamer, InboundMessage};

const SLACK_API_BASE: &str = "https://slack.com/api";

/// Web API client; cheap to clone.
#[derive(Clone)]
pub struct SlackClient {
    http: reqwest::Client,
    token: String,
}

impl SlackClient {
    pub fn new(bot_token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            token: bot_token.into(),
        }
    }

    /// POST a Web API method and unwrap Slack's `{ok, error, ...}` envelope.
    async fn call(&self, method: &str, payload: Value) -> Result<Value, ChatError> {
        let resp: Value = self
            .http
            .post(format!("{SLACK_API_BASE}/{method}"))
            .bearer_auth(&self.token)
            .json(&payload)
            .send()
            .await?
            .json()
            .await?;
        if resp.get("ok").and_then(Value::as_bool) != Some(true) {
            let cause = resp
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown_error");
            return Err(ChatError::Api(format!("{method}: {cause}")));
        }
        Ok(resp)
    }
}

#[async_trait]
impl ChatClient for SlackClient {
    async fn post_message(
        &self,
        channel: &str,
        thread_ts: Option<&str>,
        text: &str,
    ) -> Result<String, ChatError> {
        let mut payload = json!({ "channel": channel, "text": text });
        if let Some(ts) = thread_ts {
            payload["thread_ts"] = json!(ts);
        }
        let resp = self.call("chat.postMessage", payload).await?;
        resp.get("ts")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ChatError::Shape("chat.postMessage returned no ts".into()))
    }

    async fn update_message(&self, channel: &str, ts: &str, text: &str) -> Result<(), ChatError> {
        self.call(
            "chat.update",
            json!({ "channel": channel, "ts": ts, "text": text }),
        )
        .await
        .map(|_| ())
    }

    async fn delete_message(&self, channel: &str, ts: &str) -> Result<(), ChatError> {
        self.call("chat.delete", json!({ "channel": channel, "ts": ts }))
            .await
            .map(|_| ())
    }

    async fn reaction_add(&self, channel: &str, ts: &str, name: &str) -> Result<(), ChatError> {
        self.call(
            "reactions.add",
            json!({ "channel": channel, "timestamp": ts, "name": name }),
        )
        .await
        .map(|_| ())
    }

    async fn reaction_remove(&self, channel: &str, ts: &str, name: &str) -> Result<(), ChatError> {
        self.call(
            "reactions.remove",
            json!({ "channel": channel, "timestamp": ts, "name": name }),
        )
        .await
        .map(|_| ())
    }

    async fn file_upload(
        &self,
        channel: &str,
        thread_ts: Option<&str>,
        content: &str,
        filename: &str,
        title: &str,
    ) -> Result<(), ChatError> {
        // Two-step external upload: reserve a URL, PUT the bytes, complete.
        let reserve: Value = self
            .http
            .get(format!("{SLACK_API_BASE}/files.getUploadURLExternal"))
            .bearer_auth(&self.token)
            .query(&[
                ("filename", filename),
                ("length", &content.len().to_string()),
            ])
            .send()
            .await?
            .json()
            .await?;
        if reserve.get("ok").and_then(Value::as_bool) != Some(true) {
            let cause = reserve
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown_error");
            return Err(ChatError::Api(format!("files.getUploadURLExternal: {cause}")));
        }
        let upload_url = reserve
            .get("upload_url")
            .and_then(Value::as_str)
            .ok_or_else(|| ChatError::Shape("missing upload_url".into()))?;
        let file_id = reserve
            .get("file_id")
            .and_then(Value::as_str)
            .ok_or_else(|| ChatError::Shape("missing file_id".into()))?;

        self.http
            .post(upload_url)
            .body(content.to_string())
            .send()
            .await?
            .error_for_status()
            .map_err(ChatError::Http)?;

        let mut payload = json!({
            "files": [{ "id": file_id, "title": title }],
            "channel_id": channel,
        });
        if let Some(ts) = thread_ts {
            payload["thread_ts"] = json!(ts);
        }
        self.call("files.completeUploadExternal", payload)
            .await
            .map(|_| ())
    }

    async fn chat_stream(
        &self,
        channel: &str,
        thread_ts: Option<&str>,
        buffer_size: u32,
    ) -> Result<Box<dyn ChatStreamer>, ChatError> {
        let mut payload = json!({ "channel": channel, "buffer_size": buffer_size });
        if let Some(ts) = thread_ts {
            payload["thread_ts"] = json!(ts);
        }
        let resp = self.call("chat.startStream", payload).await?;
        let ts = resp
            .get("ts")
            .and_then(Value::as_str)
            .ok_or_else(|| ChatError::Shape("chat.startStream returned no ts".into()))?;
        Ok(Box::new(SlackStreamer {
            client: self.clone(),
            channel: channel.to_string(),
            ts: ts.to_string(),
        }))
    }

    async fn download_file(&self, url: &str) -> Result<Vec<u8>, ChatError> {
        let resp = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await?
            .error_for_status()
            .map_err(ChatError::Http)?;
        Ok(resp.bytes().await?.to_vec())
    }
}

struct SlackStreamer {
    client: SlackClient,
    channel: String,
    ts: String,
}

#[async_trait]
impl ChatStreamer for SlackStreamer {
    async fn append(&self, markdown: &str) -> Result<(), ChatError> {
        self.client
            .call(
                "chat.appendStream",
                json!({ "channel": self.channel, "ts": self.ts, "markdown_text": markdown }),
            )
            .await
            .map(|_| ())
    }

    async fn stop(&self) -> Result<(), ChatError> {
        self.client
            .call(
                "chat.stopStream",
                json!({ "channel": self.channel, "ts": self.ts }),
            )
            .await
            .map(|_| ())
    }
}

// ── Socket Mode ingress ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SocketModeEnvelope {
    envelope_id: Option<String>,
    #[serde(rename = "type")]
    kind: String,
    payload: Option<Value>,
}

/// Run the Socket Mode connection forever, reconnecting on failure.
///
/// Translated [`ChatEvent`]s are sent to `events_tx`; the task ends when the
/// receiving side of that channel is dropped.
pub async fn run_socket_mode(app_token: String, events_tx: mpsc::Sender<ChatEvent>) {
    loop {
        match connect_socket_mode(&app_token, &events_tx).await {
            Ok(()) => {
                if events_tx.is_closed() {
                    return;
                }
                info!("socket mode connection closed, reconnecting in 5s");
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            }
            Err(e) => {
                error!("socket mode error: {e}, reconnecting in 10s");
                tokio::time::sleep(std::time::Duration::from_secs(10)).await;
            }
        }
    }
}

async fn connect_socket_mode(
    app_token: &str,
    events_tx: &mpsc::Sender<ChatEvent>,
) -> anyhow::Result<()> {
    let wss_url = fetch_socket_mode_url(app_token).await?;
    debug!(url = %wss_url, "socket mode: got WebSocket URL");

    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    let (ws_stream, _) = connect_async(&wss_url)
        .await
        .map_err(|e| anyhow::anyhow!("WebSocket connect: {e}"))?;
    let (mut sink, mut stream) = ws_stream.split();

    while let Some(msg) = stream.next().await {
        match msg? {
            WsMessage::Text(text) => {
                let Ok(envelope) = serde_json::from_str::<SocketModeEnvelope>(&text) else {
                    continue;
                };
                // Acknowledge first; Slack redelivers unacked envelopes.
                if let Some(id) = &envelope.envelope_id {
                    let ack = json!({ "envelope_id": id }).to_string();
                    let _ = sink.send(WsMessage::Text(ack)).await;
                }
                if envelope.kind == "disconnect" {
                    // Slack is rotating the connection; reconnect cleanly.
                    break;
                }
                let Some(payload) = envelope.payload else { continue };
                if let Some(event) = payload.get("event").and_then(translate_event) {
                    if events_tx.send(event).await.is_err() {
                        return Ok(());
                    }
                }
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }
    Ok(())
}

async fn fetch_socket_mode_url(app_token: &str) -> anyhow::Result<String> {
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{SLACK_API_BASE}/apps.connections.open"))
        .bearer_auth(app_token)
        .send()
        .await?
        .json::<Value>()
        .await?;

    resp.get("url")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow::anyhow!("apps.connections.open returned no url: {resp}"))
}

/// Translate one Slack `message` event into gateway traffic.
///
/// Returns `None` for event types and message subtypes the gateway does not
/// act on (joins, pins, bot chatter about its own messages, ...).
fn translate_event(event: &Value) -> Option<ChatEvent> {
    if event.get("type").and_then(Value::as_str) != Some("message") {
        return None;
    }
    let channel = event.get("channel").and_then(Value::as_str)?.to_string();

    match event.get("subtype").and_then(Value::as_str) {
        None => {
            Some(ChatEvent::Message(InboundMessage {
                channel,
                user: str_field(event, "user"),
                text: str_field(event, "text"),
                ts: event.get("ts").and_then(Value::as_str)?.to_string(),
                thread_ts: event
                    .get("thread_ts")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                files: event
                    .get("files")
                    .and_then(Value::as_array)
                    .map(|files| files.iter().filter_map(translate_file).collect())
                    .unwrap_or_default(),
                from_bot: event.get("bot_id").is_some(),
            }))
        }
        Some("bot_message") => {
            Some(ChatEvent::Message(InboundMessage {
                channel,
                user: str_field(event, "user"),
                text: str_field(event, "text"),
                ts: event.get("ts").and_then(Value::as_str)?.to_string(),
                thread_ts: None,
                files: Vec::new(),
                from_bot: true,
            }))
        }
        Some("message_changed") => {
            let message = event.get("message")?;
            if message.get("bot_id").is_some() {
                return None;
            }
            Some(ChatEvent::MessageChanged {
                channel,
                ts: message.get("ts").and_then(Value::as_str)?.to_string(),
                new_text: str_field(message, "text"),
            })
        }
        Some("message_deleted") => Some(ChatEvent::MessageDeleted {
            channel,
            deleted_ts: event.get("deleted_ts").and_then(Value::as_str)?.to_string(),
        }),
        Some(other) => {
            debug!(subtype = other, "ignoring message subtype");
            None
        }
    }
}

fn str_field(v: &Value, key: &str) -> String {
    v.get(key).and_then(Value::as_str).unwrap_or("").to_string()
}

fn translate_file(v: &Value) -> Option<ChatFile> {
    Some(ChatFile {
        id: v.get("id").and_then(Value::as_str)?.to_string(),
        name: str_field(v, "name"),
        mimetype: str_field(v, "mimetype"),
        size: v.get("size").and_then(Value::as_u64).unwrap_or(0),
        url_private_download: v
            .get("url_private_download")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
