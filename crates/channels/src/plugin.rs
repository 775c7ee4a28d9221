use std::{path::PathBuf, sync::Arc};

use {
    anyhow::Result, async_trait::async_trait, serde::Serialize, serde_json::Value,
    tokio::sync::mpsc,
};

use wristclaw_common::types::{HistoryEntry, MediaBuffer};

// ── Channel plugin ──────────────────────────────────────────────────────────

/// Core channel plugin trait. Each messaging platform implements this.
#[async_trait]
pub trait ChannelPlugin: Send + Sync {
    /// Channel identifier (e.g. "wristclaw").
    fn id(&self) -> &str;

    /// Human-readable channel name.
    fn name(&self) -> &str;

    /// Start an account connection.
    async fn start_account(&mut self, account_id: &str, config: Value) -> Result<()>;

    /// Stop an account connection.
    async fn stop_account(&mut self, account_id: &str) -> Result<()>;

    /// Get status adapter for health checks.
    fn status(&self) -> Option<&dyn ChannelStatus>;
}

/// Probe channel account health.
#[async_trait]
pub trait ChannelStatus: Send + Sync {
    async fn probe(&self, account_id: &str) -> Result<ChannelHealthSnapshot>;
}

/// Channel health snapshot.
#[derive(Debug, Clone)]
pub struct ChannelHealthSnapshot {
    pub connected: bool,
    pub account_id: String,
    pub details: Option<String>,
}

/// Send messages back to a channel. Owned by the outbound helper; the inbound
/// core only ever calls `send_text`.
#[async_trait]
pub trait Outbound: Send + Sync {
    async fn send_text(&self, account_id: &str, channel_id: &str, text: &str) -> Result<()>;
}

// ── Host runtime capabilities ───────────────────────────────────────────────

/// Resolve which agent answers on a channel.
pub trait AgentRouting: Send + Sync {
    /// The default route agent for a channel/account pair.
    fn resolve_default_agent(&self, channel: &str, account_id: &str, channel_id: &str) -> String;
}

/// Inbound session bookkeeping on the host side.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Unix epoch seconds of the session's previous update, if any.
    async fn session_updated_at(&self, session_key: &str) -> Option<i64>;

    /// Record that an inbound message arrived for a session. Failures are
    /// non-fatal to the caller.
    async fn record_inbound(&self, record: InboundSessionRecord) -> Result<()>;
}

/// A single inbound-session record.
#[derive(Debug, Clone, Serialize)]
pub struct InboundSessionRecord {
    pub session_key: String,
    pub channel: String,
    pub account_id: String,
    pub channel_id: String,
    pub sender_id: String,
    /// Unix epoch seconds.
    pub received_at: i64,
}

/// Reply stream event, delivered block-by-block by the host dispatcher.
#[derive(Debug, Clone)]
pub enum ReplyEvent {
    /// A buffered block of reply text, ready for chunked delivery.
    Block(String),
    /// Reply is complete.
    Done,
    /// The dispatcher failed mid-reply.
    Error(String),
}

/// Receiver end of a reply stream.
pub type ReplyReceiver = mpsc::Receiver<ReplyEvent>;

/// Sender end of a reply stream.
pub type ReplySender = mpsc::Sender<ReplyEvent>;

/// Envelope inputs the host formats into the agent-facing wrapper text.
#[derive(Debug, Clone, Default)]
pub struct EnvelopeParts {
    pub channel: String,
    pub channel_name: String,
    pub sender_label: String,
    pub body: String,
    /// Unix epoch seconds of the inbound message.
    pub timestamp: i64,
    /// Unix epoch seconds of the previous session update, if any.
    pub prev_session_at: Option<i64>,
    /// Rendered prior-history block, prepended for group mention replies.
    pub history_context: Option<String>,
}

/// The fully assembled context for one agent dispatch.
#[derive(Debug, Clone, Default)]
pub struct InboundContext {
    pub account_id: String,
    pub channel_id: String,
    pub session_key: String,
    pub agent_id: String,
    pub sender_id: String,
    pub sender_label: String,
    pub body_for_agent: String,
    pub envelope: String,
    pub command_authorized: bool,
    pub media_urls: Vec<String>,
    pub media_paths: Vec<PathBuf>,
    pub inbound_history: Vec<HistoryEntry>,
}

/// Agent reply dispatch, plus the envelope formatting it owns.
#[async_trait]
pub trait ReplyDispatcher: Send + Sync {
    /// Format the agent-facing envelope around a message body.
    fn format_envelope(&self, parts: EnvelopeParts) -> String;

    /// Dispatch a finalized inbound context to the agent and stream the reply
    /// back block-by-block.
    async fn dispatch(&self, ctx: InboundContext) -> Result<ReplyReceiver>;
}

/// How reply text is split into outbound pieces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkMode {
    /// Split at the length limit, preferring line boundaries.
    Length,
    /// Split on blank lines first, then at the length limit.
    Paragraph,
}

/// Host text tooling used for outbound delivery.
pub trait TextTools: Send + Sync {
    /// Rewrite markdown tables into a form the channel can render.
    fn convert_markdown_tables(&self, text: &str) -> String;

    /// The chunk mode configured for a channel.
    fn resolve_chunk_mode(&self, channel: &str) -> ChunkMode;

    /// Split text into pieces of at most `max_len` characters.
    fn chunk_text(&self, text: &str, mode: ChunkMode, max_len: usize) -> Vec<String>;
}

/// Host media helpers (download with a byte cap, persist to local storage).
#[async_trait]
pub trait MediaStore: Send + Sync {
    async fn fetch_remote_media(&self, url: &str, max_bytes: usize) -> Result<MediaBuffer>;

    async fn save_media_buffer(&self, buffer: MediaBuffer, scope: &str) -> Result<PathBuf>;
}

/// The capability set a channel consumes from the host runtime.
#[derive(Clone)]
pub struct HostRuntime {
    pub routing: Arc<dyn AgentRouting>,
    pub sessions: Arc<dyn SessionStore>,
    pub reply: Arc<dyn ReplyDispatcher>,
    pub text: Arc<dyn TextTools>,
    pub media: Arc<dyn MediaStore>,
}
