//! The inbound message pipeline: policy gates, body building, media
//! handling, @mention gating, envelope assembly, and reply delivery.
//!
//! Every early return is silent — a dropped message is policy working as
//! intended, not an error.

use std::{sync::Arc, time::Duration};

use {tokio::task::JoinHandle, tracing::warn};

use {
    wristclaw_channels::{EnvelopeParts, InboundContext, InboundSessionRecord, ReplyEvent},
    wristclaw_common::types::{ChatKind, HistoryEntry},
};

use crate::{
    CHANNEL_ID,
    events::{MessagePayload, TypingStatus, typing_frame},
    history,
    monitor::MonitorContext,
    policy::{self, GateDecision},
};

/// Reply chunks are split to at most this many characters.
pub const MAX_CHUNK_LEN: usize = 4000;

/// Per-file cap for inbound media downloads.
pub const MEDIA_MAX_BYTES: usize = 10 * 1024 * 1024;

/// Reply-context previews are clipped to this many characters.
const REPLY_PREVIEW_MAX: usize = 100;

/// Typing heartbeat re-send cadence while a dispatch runs.
const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(3500);

/// Account id whose session keys omit the account segment.
const DEFAULT_ACCOUNT_ID: &str = "default";

/// Historical fallback body for voice messages with no transcription, used
/// only when the account opts in; the default is to drop.
const VOICE_FALLBACK_BODY: &str = "🎤 語音訊息";

/// Placeholder bodies for media without caption text.
const IMAGE_BODY_SINGLE: &str = "📷 圖片";
const INTERACTIVE_BODY: &str = "📋 互動訊息";

/// Pipeline switches that vary between host deployments.
#[derive(Debug, Clone, Default)]
pub struct PipelineHooks {
    /// Dispatch the literal voice placeholder instead of dropping when a
    /// transcription never arrives.
    pub voice_fallback_text: bool,
}

/// Stable session key. The channel segment is the fixed literal
/// `wristclaw` — not the agent id — so session identity survives agent
/// routing changes. The account segment is omitted for the default account.
#[must_use]
pub fn session_key(account_id: &str, channel_id: &str, kind: ChatKind) -> String {
    if account_id == DEFAULT_ACCOUNT_ID {
        format!("agent:{CHANNEL_ID}:{}:ch:{channel_id}", kind.as_str())
    } else {
        format!(
            "agent:{CHANNEL_ID}:{account_id}:{}:ch:{channel_id}",
            kind.as_str()
        )
    }
}

/// Run one inbound message through the full pipeline.
///
/// `extras` carries additional media URLs batched by the media-group buffer.
/// The concurrency cap was acquired by the caller before this runs.
pub async fn process_message(
    ctx: &Arc<MonitorContext>,
    msg: MessagePayload,
    channel_id: String,
    is_group: bool,
    extras: Vec<String>,
) {
    let Ok(config) = ctx.config.read().map(|c| c.clone()) else {
        return;
    };

    // 1. Parse nested fields.
    let content = &msg.payload;
    let via = content.via.as_deref();
    let content_type = content
        .content_type
        .clone()
        .unwrap_or_else(|| "text".into());
    let text = content.text.clone().unwrap_or_default();
    let media_url = content.media_url.clone().or_else(|| msg.media_url.clone());
    let sender_id = msg.author_id.clone();
    let sender_label = msg
        .sender_name
        .clone()
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| sender_id.clone());

    // 2. Echo suppression.
    let bot = ctx.bot_identity();
    if policy::is_echo(via, &sender_id, bot.as_ref().map(|b| b.user_id.as_str())) {
        return;
    }

    // 3. Cross-account claim.
    if !ctx.cross_dedup.claim(&msg.message_id) {
        return;
    }

    // 4. Per-account dedup.
    {
        let Ok(mut dedup) = ctx.account_dedup.lock() else {
            return;
        };
        if !dedup.claim(&msg.message_id) {
            return;
        }
    }

    // 5. Access gate.
    let is_owner = config.is_owner(&sender_id);
    let mut mention_required = false;
    if is_group {
        match policy::group_gate(&config, &sender_id) {
            GateDecision::Deny => return,
            GateDecision::RecordOnly => mention_required = true,
            GateDecision::Allow => {},
        }
    } else if policy::dm_gate(&config, &sender_id) != GateDecision::Allow {
        return;
    }

    // 6. Rate limit.
    {
        let Ok(mut limiter) = ctx.rate_limiter.lock() else {
            return;
        };
        if limiter.is_limited(&sender_id) {
            return;
        }
    }

    // 7. Body building.
    let trimmed = text.trim().to_string();
    let image_count = usize::from(media_url.is_some()) + extras.len();
    let mut body = match content_type.as_str() {
        "voice" => {
            let resolved = if trimmed.is_empty() {
                ctx.voice.wait(&msg.message_id).await.trim().to_string()
            } else {
                trimmed
            };
            if resolved.is_empty() {
                if !ctx.hooks.voice_fallback_text {
                    return;
                }
                VOICE_FALLBACK_BODY.to_string()
            } else {
                resolved
            }
        },
        "image" => {
            if !trimmed.is_empty() {
                trimmed
            } else if image_count > 1 {
                format!("📷 {image_count} 張圖片")
            } else {
                IMAGE_BODY_SINGLE.to_string()
            }
        },
        "interactive" => {
            if trimmed.is_empty() {
                INTERACTIVE_BODY.to_string()
            } else {
                trimmed
            }
        },
        _ => {
            if trimmed.is_empty() {
                return;
            }
            trimmed
        },
    };

    // 8. Media fetch (images only).
    let mut media_urls = Vec::new();
    let mut media_paths = Vec::new();
    if content_type == "image" {
        for url in media_url.iter().chain(extras.iter()) {
            if !policy::is_safe_media_url(url, &ctx.server) {
                warn!(
                    account_id = %ctx.account_id,
                    %url,
                    "skipping media url outside the account server"
                );
                continue;
            }
            media_urls.push(url.clone());
            let fetch_url = resolve_media_url(url, ctx);
            match ctx
                .host
                .media
                .fetch_remote_media(&fetch_url, MEDIA_MAX_BYTES)
                .await
            {
                Ok(buffer) => match ctx.host.media.save_media_buffer(buffer, "inbound").await {
                    Ok(path) => media_paths.push(path),
                    Err(e) => {
                        warn!(account_id = %ctx.account_id, %url, error = %e, "saving media failed");
                    },
                },
                Err(e) => {
                    warn!(account_id = %ctx.account_id, %url, error = %e, "fetching media failed");
                },
            }
        }
    }

    // 9. @mention gate for mention-policy groups.
    let mut mention_triggered = false;
    if is_group && mention_required {
        let pool = policy::mention_pool(&config, bot.as_ref().and_then(|b| b.display_name.as_deref()));
        let outcome = policy::detect_and_strip_mention(&body, &pool);
        if !outcome.mentioned {
            if let Ok(mut buffers) = ctx.history.lock() {
                buffers.record(
                    &channel_id,
                    HistoryEntry {
                        sender: sender_label.clone(),
                        body,
                        timestamp: msg.created_at.unwrap_or_else(now),
                        message_id: msg.message_id.clone(),
                    },
                );
            }
            return;
        }
        if outcome.stripped.is_empty() {
            return;
        }
        body = outcome.stripped;
        mention_triggered = true;
    }

    // 10. Reply-context prefix.
    if let Some(reply) = &msg.reply_context
        && let Some(preview) = reply.text_preview.as_deref()
    {
        let cleaned = sanitize_preview(preview);
        if !cleaned.is_empty() {
            body = format!("[Re: {cleaned}]\n{body}");
        }
    }

    // 11. Agent routing.
    let default_agent =
        ctx.host
            .routing
            .resolve_default_agent(CHANNEL_ID, &ctx.account_id, &channel_id);
    let agent_id = if is_owner {
        default_agent
    } else {
        config
            .secretary_agent_id
            .clone()
            .unwrap_or(default_agent)
    };
    let kind = if is_group {
        ChatKind::Group
    } else {
        ChatKind::Direct
    };
    let key = session_key(&ctx.account_id, &channel_id, kind);

    // 12. Envelope + history context.
    let prev_session_at = ctx.host.sessions.session_updated_at(&key).await;
    let (inbound_history, history_context) = if is_group && config.group_history_limit > 0 {
        let entries = ctx
            .history
            .lock()
            .map(|buffers| buffers.snapshot(&channel_id))
            .unwrap_or_default();
        if entries.is_empty() {
            (Vec::new(), None)
        } else {
            let rendered = history::render_history(&entries);
            (entries, Some(rendered))
        }
    } else {
        (Vec::new(), None)
    };
    let envelope = ctx.host.reply.format_envelope(EnvelopeParts {
        channel: CHANNEL_ID.into(),
        channel_name: ctx.channel_name(&channel_id),
        sender_label: sender_label.clone(),
        body: body.clone(),
        timestamp: msg.created_at.unwrap_or_else(now),
        prev_session_at,
        history_context,
    });

    // 13. Record the inbound session; failures are logged, not fatal.
    if let Err(e) = ctx
        .host
        .sessions
        .record_inbound(InboundSessionRecord {
            session_key: key.clone(),
            channel: CHANNEL_ID.into(),
            account_id: ctx.account_id.clone(),
            channel_id: channel_id.clone(),
            sender_id: sender_id.clone(),
            received_at: msg.created_at.unwrap_or_else(now),
        })
        .await
    {
        warn!(account_id = %ctx.account_id, error = %e, "recording inbound session failed");
    }

    // 14. Dispatch with a typing heartbeat.
    let inbound = InboundContext {
        account_id: ctx.account_id.clone(),
        channel_id: channel_id.clone(),
        session_key: key,
        agent_id,
        sender_id,
        sender_label,
        body_for_agent: body,
        envelope,
        command_authorized: is_owner,
        media_urls,
        media_paths,
        inbound_history,
    };

    let mut heartbeat = TypingHeartbeat::start(Arc::clone(ctx), channel_id.clone());
    match ctx.host.reply.dispatch(inbound).await {
        Ok(mut replies) => {
            let mut first_block = true;
            while let Some(event) = replies.recv().await {
                match event {
                    ReplyEvent::Block(block) => {
                        if first_block {
                            first_block = false;
                            heartbeat.first_block();
                        }
                        deliver_block(ctx, &channel_id, &block).await;
                        ctx.status.note_outbound();
                    },
                    ReplyEvent::Done => break,
                    ReplyEvent::Error(e) => {
                        warn!(account_id = %ctx.account_id, error = %e, "reply stream error");
                        break;
                    },
                }
            }
        },
        Err(e) => {
            warn!(account_id = %ctx.account_id, error = %e, "reply dispatch failed");
        },
    }

    // 15. Finalize.
    heartbeat.finish();
    if mention_triggered
        && let Ok(mut buffers) = ctx.history.lock()
    {
        buffers.clear(&channel_id);
    }
}

/// Split a reply block per host rules and send the pieces in order.
async fn deliver_block(ctx: &Arc<MonitorContext>, channel_id: &str, block: &str) {
    let converted = ctx.host.text.convert_markdown_tables(block);
    let mode = ctx.host.text.resolve_chunk_mode(CHANNEL_ID);
    for piece in ctx.host.text.chunk_text(&converted, mode, MAX_CHUNK_LEN) {
        if let Err(e) = ctx
            .outbound
            .send_text(&ctx.account_id, channel_id, &piece)
            .await
        {
            warn!(account_id = %ctx.account_id, channel_id, error = %e, "outbound send failed");
        }
    }
}

/// Resolve a server-relative media path against the account base URL.
fn resolve_media_url(url: &str, ctx: &MonitorContext) -> String {
    if url.starts_with('/') {
        ctx.server
            .join(url)
            .map(|resolved| resolved.to_string())
            .unwrap_or_else(|_| url.to_string())
    } else {
        url.to_string()
    }
}

/// Clip a reply preview to 100 characters and strip ASCII control bytes
/// other than tab, newline, and carriage return.
fn sanitize_preview(preview: &str) -> String {
    preview
        .chars()
        .take(REPLY_PREVIEW_MAX)
        .filter(|c| !c.is_ascii_control() || matches!(c, '\t' | '\n' | '\r'))
        .collect::<String>()
        .trim()
        .to_string()
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Typing-indicator lifecycle for one dispatch: `thinking` is sent up front
/// and re-sent on a heartbeat; the first delivered block switches to
/// `typing` once and stops the heartbeat; `finish` sends `stopped`.
struct TypingHeartbeat {
    ctx: Arc<MonitorContext>,
    channel_id: String,
    task: Option<JoinHandle<()>>,
}

impl TypingHeartbeat {
    fn start(ctx: Arc<MonitorContext>, channel_id: String) -> Self {
        ctx.send_ws(typing_frame(&channel_id, TypingStatus::Thinking));
        let beat_ctx = Arc::clone(&ctx);
        let beat_channel = channel_id.clone();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                beat_ctx.send_ws(typing_frame(&beat_channel, TypingStatus::Thinking));
            }
        });
        Self {
            ctx,
            channel_id,
            task: Some(task),
        }
    }

    fn first_block(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.ctx
            .send_ws(typing_frame(&self.channel_id, TypingStatus::Typing));
    }

    fn finish(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.ctx
            .send_ws(typing_frame(&self.channel_id, TypingStatus::Stopped));
    }
}

impl Drop for TypingHeartbeat {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
