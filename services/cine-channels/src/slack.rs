//! Slack channel for cinebot.
//!
//! Receives events over Socket Mode (a websocket opened with the app-level
//! token) and replies through the Web API with the bot token.

use crate::message::{ChatMessage, EventKind, InboundEvent, OutgoingMessage, Sender};
use crate::traits::{Channel, ChannelError, ChannelResult};
use async_trait::async_trait;
use cine_common::config::SlackConfig;
use futures_util::{SinkExt, StreamExt};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio_tungstenite::tungstenite::Message;

/// Web API error codes that retrying cannot fix.
const AUTH_ERRORS: &[&str] = &[
    "invalid_auth",
    "not_authed",
    "account_inactive",
    "token_revoked",
    "not_allowed_token_type",
];

/// Slack channel using Socket Mode for events and the Web API for replies.
pub struct SlackChannel {
    bot_token: String,
    app_token: String,
    api_base: String,
    client: Client,
    bot_user_id: Arc<RwLock<Option<String>>>,
    running: watch::Sender<bool>,
    reconnect_delay: Duration,
}

impl SlackChannel {
    /// Create a new Slack channel.
    pub fn new(bot_token: String, app_token: String) -> Self {
        let (running, _) = watch::channel(false);
        Self {
            bot_token,
            app_token,
            api_base: "https://slack.com/api".into(),
            client: Client::new(),
            bot_user_id: Arc::new(RwLock::new(None)),
            running,
            reconnect_delay: Duration::from_secs(5),
        }
    }

    /// Build from configuration; both tokens are required.
    pub fn from_config(config: &SlackConfig) -> ChannelResult<Self> {
        let bot_token = config
            .bot_token
            .clone()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| ChannelError::Auth("SLACK_BOT_TOKEN is not set".into()))?;
        let app_token = config
            .app_token
            .clone()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| ChannelError::Auth("SLACK_APP_TOKEN is not set".into()))?;

        Ok(Self::new(bot_token, app_token)
            .with_api_base(config.api_base.clone())
            .with_reconnect_delay(Duration::from_secs(config.reconnect_delay_secs)))
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// The bot's own user ID, known after `init`.
    pub async fn bot_user_id(&self) -> Option<String> {
        self.bot_user_id.read().await.clone()
    }

    async fn call(
        &self,
        method: &str,
        token: &str,
        body: Option<Value>,
    ) -> ChannelResult<SlackApiResponse> {
        let url = format!("{}/{}", self.api_base, method);
        let mut request = self.client.post(&url).bearer_auth(token);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| ChannelError::Connection(format!("Slack {method} request failed: {e}")))?;

        resp.json::<SlackApiResponse>()
            .await
            .map_err(|e| ChannelError::Internal(format!("Failed to parse Slack {method} response: {e}")))
    }

    async fn open_socket_url(&self) -> ChannelResult<String> {
        let data = self.call("apps.connections.open", &self.app_token, None).await?;

        if !data.ok {
            let error = data.error.unwrap_or_else(|| "unknown".into());
            if AUTH_ERRORS.contains(&error.as_str()) {
                return Err(ChannelError::Auth(format!(
                    "Slack apps.connections.open rejected app token: {error}"
                )));
            }
            return Err(ChannelError::Connection(format!(
                "Slack apps.connections.open failed: {error}"
            )));
        }

        data.url.ok_or_else(|| {
            ChannelError::Connection("Slack apps.connections.open returned no url".into())
        })
    }

    /// Run one websocket session until it closes, is told to reconnect, or
    /// the channel shuts down.
    async fn run_socket_session(
        &self,
        url: &str,
        sink: &mpsc::Sender<InboundEvent>,
        stop: &mut watch::Receiver<bool>,
    ) -> ChannelResult<()> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| ChannelError::Connection(format!("Slack socket connect failed: {e}")))?;
        let (mut write, mut read) = ws_stream.split();

        loop {
            let frame = tokio::select! {
                _ = stop.changed() => {
                    if !*stop.borrow_and_update() {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(());
                    }
                    continue;
                }
                frame = read.next() => frame,
            };

            let text = match frame {
                Some(Ok(Message::Text(t))) => t,
                Some(Ok(Message::Binary(b))) => match String::from_utf8(b) {
                    Ok(t) => t,
                    Err(_) => continue,
                },
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    return Err(ChannelError::Connection(format!("Slack socket read error: {e}")))
                }
            };

            let frame: SocketFrame = match serde_json::from_str(&text) {
                Ok(f) => f,
                Err(e) => {
                    tracing::warn!(error = %e, "Slack: unparseable socket frame");
                    continue;
                }
            };

            if let Some(ref envelope_id) = frame.envelope_id {
                let ack = json!({ "envelope_id": envelope_id });
                write
                    .send(Message::Text(ack.to_string()))
                    .await
                    .map_err(|e| ChannelError::Connection(format!("Slack ack failed: {e}")))?;
            }

            match frame.frame_type.as_str() {
                "hello" => tracing::info!("Slack socket connected"),
                "disconnect" => {
                    tracing::info!(reason = ?frame.reason, "Slack requested reconnect");
                    return Ok(());
                }
                "events_api" => self.dispatch(&frame.payload, sink).await?,
                other => tracing::debug!(frame_type = other, "Slack: ignoring socket frame"),
            }
        }
    }

    async fn dispatch(&self, payload: &Value, sink: &mpsc::Sender<InboundEvent>) -> ChannelResult<()> {
        let bot_user_id = self.bot_user_id().await;

        match parse_event_payload(payload, bot_user_id.as_deref()) {
            Ok(Some(event)) => {
                tracing::debug!(
                    kind = event.kind().as_str(),
                    channel_id = %event.channel_id(),
                    from_bot = event.is_from_bot(),
                    "Received Slack event"
                );
                sink.send(event).await.map_err(|_| ChannelError::NotReady)?;
            }
            Ok(None) => {}
            Err(bad) => {
                tracing::error!(error = %bad, channel_id = ?bad.channel_id, "Rejected Slack event");
                if let Some(channel_id) = bad.channel_id {
                    let apology = bad.kind.unwrap_or(EventKind::Message).apology();
                    if let Err(e) = self.send(OutgoingMessage::text(channel_id, apology)).await {
                        tracing::error!(error = %e, "Failed to send apology for rejected event");
                    }
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl Channel for SlackChannel {
    fn name(&self) -> &'static str {
        "slack"
    }

    async fn init(&mut self) -> ChannelResult<()> {
        let data = self
            .call("auth.test", &self.bot_token, None)
            .await
            .map_err(|e| ChannelError::Auth(format!("Failed to verify Slack token: {e}")))?;

        if !data.ok {
            let error = data.error.unwrap_or_else(|| "unknown".into());
            return Err(ChannelError::Auth(format!("Slack auth failed: {error}")));
        }

        tracing::info!(bot_user_id = ?data.user_id, "Slack channel initialized");
        *self.bot_user_id.write().await = data.user_id;
        self.running.send_replace(true);
        Ok(())
    }

    async fn send(&self, message: OutgoingMessage) -> ChannelResult<String> {
        let body = json!({
            "channel": message.channel_id,
            "text": message.text,
        });

        let data = self
            .call("chat.postMessage", &self.bot_token, Some(body))
            .await
            .map_err(|e| ChannelError::SendFailed(e.to_string()))?;

        if !data.ok {
            let error = data.error.unwrap_or_else(|| "unknown".into());
            return Err(ChannelError::SendFailed(format!("Slack send failed: {error}")));
        }

        Ok(data.ts.unwrap_or_else(|| "unknown".into()))
    }

    async fn listen(&self, sink: mpsc::Sender<InboundEvent>) -> ChannelResult<()> {
        // One receiver for the whole listen; a shutdown after this point
        // wakes the session or the reconnect wait.
        let mut stop = self.running.subscribe();
        if !*stop.borrow_and_update() {
            return Err(ChannelError::NotReady);
        }

        tracing::info!("Slack channel listening via Socket Mode...");

        loop {
            if !*stop.borrow_and_update() || sink.is_closed() {
                tracing::info!("Slack listener stopped");
                return Ok(());
            }

            match self.open_socket_url().await {
                Ok(url) => {
                    if let Err(e) = self.run_socket_session(&url, &sink, &mut stop).await {
                        tracing::warn!(error = %e, "Slack socket session error");
                    }
                }
                Err(e @ ChannelError::Auth(_)) => return Err(e),
                Err(e) => tracing::warn!(error = %e, "Failed to open Slack socket"),
            }

            if !*stop.borrow() {
                continue;
            }
            tokio::select! {
                _ = stop.changed() => {}
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }
    }

    async fn health_check(&self) -> ChannelResult<()> {
        let data = self
            .call("auth.test", &self.bot_token, None)
            .await
            .map_err(|e| ChannelError::Connection(format!("Health check failed: {e}")))?;

        if data.ok {
            Ok(())
        } else {
            Err(ChannelError::Auth("Slack authentication failed".into()))
        }
    }

    async fn shutdown(&self) -> ChannelResult<()> {
        self.running.send_replace(false);
        tracing::info!("Slack channel shutdown");
        Ok(())
    }
}

// ============================================================================
// Wire types
// ============================================================================

/// Subset of fields used from Web API responses.
#[derive(Debug, Deserialize)]
struct SlackApiResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    ts: Option<String>,
}

/// One Socket Mode frame.
#[derive(Debug, Deserialize)]
struct SocketFrame {
    #[serde(rename = "type")]
    frame_type: String,
    #[serde(default)]
    envelope_id: Option<String>,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EventCallback {
    #[serde(rename = "type")]
    callback_type: String,
    #[serde(default)]
    event: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct SlackEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    bot_id: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    ts: Option<String>,
}

/// An event that should have been handled but is missing required fields.
#[derive(Debug, thiserror::Error)]
#[error("malformed Slack event: {reason}")]
pub struct MalformedEvent {
    pub kind: Option<EventKind>,
    pub channel_id: Option<String>,
    pub reason: String,
}

/// Turn an `events_api` payload into an [`InboundEvent`].
///
/// Returns `Ok(None)` for events the relay does not handle (edits, deletes,
/// joins, other event types). Messages posted by a bot, or by the user ID in
/// `bot_user_id`, are returned flagged as [`Sender::Bot`].
pub fn parse_event_payload(
    payload: &Value,
    bot_user_id: Option<&str>,
) -> Result<Option<InboundEvent>, MalformedEvent> {
    let malformed = |kind, channel_id, reason: String| MalformedEvent {
        kind,
        channel_id,
        reason,
    };

    let callback: EventCallback = serde_json::from_value(payload.clone())
        .map_err(|e| malformed(None, None, format!("bad callback envelope: {e}")))?;
    if callback.callback_type != "event_callback" {
        return Ok(None);
    }

    let raw = callback
        .event
        .ok_or_else(|| malformed(None, None, "event_callback without event".into()))?;
    let event: SlackEvent = match serde_json::from_value(raw.clone()) {
        Ok(event) => event,
        Err(_) if is_bot_authored(&raw, bot_user_id) => return Ok(None),
        Err(e) => {
            let channel_id = raw.get("channel").and_then(Value::as_str).map(String::from);
            return Err(malformed(None, channel_id, format!("bad event body: {e}")));
        }
    };

    let kind = match event.event_type.as_str() {
        "message" => EventKind::Message,
        "app_mention" => EventKind::Mention,
        _ => return Ok(None),
    };

    let mut from_bot = event.bot_id.is_some();
    match event.subtype.as_deref() {
        None => {}
        Some("bot_message") => from_bot = true,
        Some(_) => return Ok(None),
    }
    if let (Some(user), Some(bot)) = (event.user.as_deref(), bot_user_id) {
        from_bot |= user == bot;
    }

    let channel_id = event.channel.filter(|c| !c.trim().is_empty());
    let (channel_id, text) = match (channel_id, event.text) {
        (Some(channel_id), Some(text)) => (channel_id, text),
        // Attachment-only bot posts and the like: nothing to answer.
        _ if from_bot => return Ok(None),
        (None, _) => return Err(malformed(Some(kind), None, "missing channel".into())),
        (Some(channel_id), None) => {
            return Err(malformed(Some(kind), Some(channel_id), "missing text".into()))
        }
    };

    let message = ChatMessage {
        channel_id,
        user_id: event.user,
        text,
        ts: event.ts,
        sender: if from_bot { Sender::Bot } else { Sender::Human },
        timestamp: chrono::Utc::now().timestamp_millis(),
    };

    Ok(Some(InboundEvent::new(kind, message)))
}

fn is_bot_authored(raw: &Value, bot_user_id: Option<&str>) -> bool {
    let field = |name: &str| raw.get(name).and_then(Value::as_str);
    raw.get("bot_id").is_some_and(|v| !v.is_null())
        || field("subtype") == Some("bot_message")
        || (bot_user_id.is_some() && field("user") == bot_user_id)
}
