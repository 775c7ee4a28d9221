//! Wire types for the WristClaw server: WebSocket events in, client frames
//! out, and the REST payloads the data plane returns.

use {
    serde::Deserialize,
    serde_json::{Value, json},
};

/// Prefix of per-conversation subscription topics.
pub const CHANNEL_TOPIC_PREFIX: &str = "channel:";

/// Prefix of the per-bot-user subscription topic.
pub const USER_TOPIC_PREFIX: &str = "user:";

// ── Server → client events ──────────────────────────────────────────────────

/// Events the server pushes over the WebSocket. Unknown types deserialize to
/// [`ServerEvent::Unknown`] and are ignored without error.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "authenticated")]
    Authenticated,

    #[serde(rename = "pong")]
    Pong,

    #[serde(rename = "subscribed")]
    Subscribed {
        #[serde(default)]
        channel: Option<String>,
    },

    #[serde(rename = "message:new")]
    MessageNew {
        /// Subscription topic the event arrived on (e.g. `channel:ch-1`).
        #[serde(default)]
        channel: Option<String>,
        payload: MessagePayload,
    },

    #[serde(rename = "message:update")]
    MessageUpdate { payload: MessageUpdatePayload },

    /// Legacy transcription event, kept for servers that predate
    /// `message:update`.
    #[serde(rename = "voice:transcribed")]
    VoiceTranscribed { payload: VoiceTranscribedPayload },

    #[serde(rename = "pair:created")]
    PairCreated {
        #[serde(default)]
        payload: Option<Value>,
    },

    #[serde(rename = "group:member_added")]
    GroupMemberAdded { payload: GroupMemberPayload },

    #[serde(rename = "group:member_changed")]
    GroupMemberChanged,

    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        payload: Option<Value>,
    },

    #[serde(other)]
    Unknown,
}

/// Parse a text frame into a server event.
pub fn parse_frame(text: &str) -> serde_json::Result<ServerEvent> {
    serde_json::from_str(text)
}

/// A new message, as carried by `message:new` events and by the REST
/// catch-up endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MessagePayload {
    pub message_id: String,
    pub channel_id: Option<String>,
    pub pair_id: Option<String>,
    pub author_id: String,
    pub sender_name: Option<String>,
    /// Unix epoch seconds.
    pub created_at: Option<i64>,
    /// Top-level media URL (some server versions put it here instead of in
    /// the content object).
    pub media_url: Option<String>,
    pub reply_context: Option<ReplyContext>,
    /// Nested content object.
    pub payload: MessageContent,
}

/// Nested content of a message.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MessageContent {
    pub content_type: Option<String>,
    pub text: Option<String>,
    pub media_url: Option<String>,
    pub duration_sec: Option<f64>,
    /// Origin marker; `"openclaw"` flags our own outbound messages.
    pub via: Option<String>,
}

/// The message being replied to, as far as the server previews it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReplyContext {
    pub message_id: String,
    pub author_id: String,
    pub text_preview: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MessageUpdatePayload {
    pub message_id: String,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VoiceTranscribedPayload {
    pub message_id: String,
    pub channel_id: Option<String>,
    pub pair_id: Option<String>,
    #[serde(alias = "transcription")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GroupMemberPayload {
    pub channel_id: String,
}

// ── REST payloads ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct BotIdentity {
    pub user_id: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Conversation {
    #[serde(rename = "type")]
    pub kind: String,
    pub channel_id: String,
    #[serde(default)]
    pub pair_id: Option<String>,
    #[serde(default)]
    pub group_name: Option<String>,
}

impl Conversation {
    #[must_use]
    pub fn is_group(&self) -> bool {
        self.kind == "group"
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConversationsResponse {
    #[serde(default)]
    pub conversations: Vec<Conversation>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PairInfo {
    pub pair_id: String,
    pub channel_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PairListResponse {
    #[serde(default)]
    pub pairs: Vec<PairInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessagesResponse {
    #[serde(default)]
    pub messages: Vec<MessagePayload>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    #[serde(default)]
    pub version: Option<String>,
}

// ── Client → server frames ──────────────────────────────────────────────────

/// Typing indicator status, re-sent by the heartbeat while a dispatch runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingStatus {
    Thinking,
    Typing,
    Stopped,
}

impl TypingStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Thinking => "thinking",
            Self::Typing => "typing",
            Self::Stopped => "stopped",
        }
    }
}

#[must_use]
pub fn auth_frame(api_key: &str) -> String {
    json!({"type": "auth", "payload": {"apiKey": api_key}}).to_string()
}

#[must_use]
pub fn subscribe_frame(topic: &str) -> String {
    json!({"type": "subscribe", "channel": topic}).to_string()
}

#[must_use]
pub fn ping_frame() -> String {
    json!({"type": "ping"}).to_string()
}

#[must_use]
pub fn typing_frame(channel_id: &str, status: TypingStatus) -> String {
    json!({
        "type": "typing",
        "channel": format!("{CHANNEL_TOPIC_PREFIX}{channel_id}"),
        "payload": {"status": status.as_str()},
    })
    .to_string()
}

/// Topic name for a conversation subscription.
#[must_use]
pub fn channel_topic(channel_id: &str) -> String {
    format!("{CHANNEL_TOPIC_PREFIX}{channel_id}")
}

/// Topic name for the bot-user subscription.
#[must_use]
pub fn user_topic(user_id: &str) -> String {
    format!("{USER_TOPIC_PREFIX}{user_id}")
}
