#![allow(clippy::unwrap_used, clippy::expect_used)]
//! End-to-end pipeline scenarios against a stub host runtime.
//!
//! The stub captures every dispatched inbound context and streams a canned
//! reply, so assertions run on exactly what the agent would have received.

use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use {
    anyhow::Result,
    async_trait::async_trait,
    secrecy::Secret,
    tokio::sync::mpsc,
};

use {
    wristclaw_channels::{
        AgentRouting, ChunkMode, EnvelopeParts, HostRuntime, InboundContext,
        InboundSessionRecord, MediaStore, Outbound, ReplyDispatcher, ReplyEvent, ReplyReceiver,
        SessionStore, TextTools,
    },
    wristclaw_common::types::MediaBuffer,
    wristclaw_gateway::{
        AccountConfig, catchup,
        events::{BotIdentity, MessageContent, MessagePayload, ReplyContext},
        media_group::{BufferOutcome, group_key},
        monitor::MonitorContext,
        pipeline::{self, PipelineHooks},
        rate_limit::SenderRateLimiter,
    },
};

// ── Stub host ───────────────────────────────────────────────────────────────

#[derive(Default)]
struct StubState {
    dispatches: Mutex<Vec<InboundContext>>,
    envelopes: Mutex<Vec<EnvelopeParts>>,
    records: Mutex<Vec<InboundSessionRecord>>,
    reply_blocks: Mutex<Vec<String>>,
    fetched_urls: Mutex<Vec<String>>,
}

#[derive(Clone)]
struct StubHost(Arc<StubState>);

impl StubHost {
    fn dispatches(&self) -> Vec<InboundContext> {
        self.0.dispatches.lock().unwrap().clone()
    }

    async fn wait_for_dispatches(&self, count: usize) -> Vec<InboundContext> {
        for _ in 0..200 {
            let current = self.dispatches();
            if current.len() >= count {
                return current;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {count} dispatches, saw {}", self.dispatches().len());
    }
}

impl AgentRouting for StubHost {
    fn resolve_default_agent(&self, _channel: &str, _account_id: &str, _channel_id: &str) -> String {
        "main-agent".into()
    }
}

#[async_trait]
impl SessionStore for StubHost {
    async fn session_updated_at(&self, _session_key: &str) -> Option<i64> {
        Some(1_700_000_000)
    }

    async fn record_inbound(&self, record: InboundSessionRecord) -> Result<()> {
        self.0.records.lock().unwrap().push(record);
        Ok(())
    }
}

#[async_trait]
impl ReplyDispatcher for StubHost {
    fn format_envelope(&self, parts: EnvelopeParts) -> String {
        self.0.envelopes.lock().unwrap().push(parts.clone());
        match parts.history_context {
            Some(history) => format!("{history}\n[{}] {}", parts.sender_label, parts.body),
            None => format!("[{}] {}", parts.sender_label, parts.body),
        }
    }

    async fn dispatch(&self, ctx: InboundContext) -> Result<ReplyReceiver> {
        self.0.dispatches.lock().unwrap().push(ctx);
        let blocks = self.0.reply_blocks.lock().unwrap().clone();
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            for block in blocks {
                let _ = tx.send(ReplyEvent::Block(block)).await;
            }
            let _ = tx.send(ReplyEvent::Done).await;
        });
        Ok(rx)
    }
}

impl TextTools for StubHost {
    fn convert_markdown_tables(&self, text: &str) -> String {
        text.to_string()
    }

    fn resolve_chunk_mode(&self, _channel: &str) -> ChunkMode {
        ChunkMode::Length
    }

    fn chunk_text(&self, text: &str, _mode: ChunkMode, max_len: usize) -> Vec<String> {
        text.chars()
            .collect::<Vec<_>>()
            .chunks(max_len)
            .map(|chunk| chunk.iter().collect())
            .collect()
    }
}

#[async_trait]
impl MediaStore for StubHost {
    async fn fetch_remote_media(&self, url: &str, _max_bytes: usize) -> Result<MediaBuffer> {
        self.0.fetched_urls.lock().unwrap().push(url.to_string());
        Ok(MediaBuffer {
            bytes: vec![0xFF, 0xD8],
            content_type: Some("image/jpeg".into()),
        })
    }

    async fn save_media_buffer(&self, _buffer: MediaBuffer, _scope: &str) -> Result<PathBuf> {
        Ok(PathBuf::from("/tmp/inbound/media.jpg"))
    }
}

#[derive(Default)]
struct CapturingOutbound {
    sent: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl Outbound for CapturingOutbound {
    async fn send_text(&self, _account_id: &str, channel_id: &str, text: &str) -> Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((channel_id.to_string(), text.to_string()));
        Ok(())
    }
}

// ── Harness ─────────────────────────────────────────────────────────────────

struct Harness {
    ctx: Arc<MonitorContext>,
    host: StubHost,
    outbound: Arc<CapturingOutbound>,
    flush_rx: mpsc::UnboundedReceiver<wristclaw_gateway::media_group::FlushDue>,
}

fn harness_with(config: AccountConfig) -> Harness {
    let host = StubHost(Arc::new(StubState::default()));
    host.0
        .reply_blocks
        .lock()
        .unwrap()
        .push("Sure thing.".into());
    let runtime = HostRuntime {
        routing: Arc::new(host.clone()),
        sessions: Arc::new(host.clone()),
        reply: Arc::new(host.clone()),
        text: Arc::new(host.clone()),
        media: Arc::new(host.clone()),
    };
    let outbound = Arc::new(CapturingOutbound::default());
    let (ctx, flush_rx) = MonitorContext::new(
        "default",
        config,
        runtime,
        outbound.clone(),
        PipelineHooks::default(),
    )
    .unwrap();
    Harness {
        ctx,
        host,
        outbound,
        flush_rx,
    }
}

fn owner_config() -> AccountConfig {
    AccountConfig {
        server_url: "https://wrist.example.com".into(),
        api_key: Secret::new("wk-test".into()),
        owner_user_id: Some("owner-1".into()),
        ..Default::default()
    }
}

fn text_message(id: &str, channel: &str, author: &str, text: &str) -> MessagePayload {
    MessagePayload {
        message_id: id.into(),
        channel_id: Some(channel.into()),
        author_id: author.into(),
        created_at: Some(1_700_000_100),
        payload: MessageContent {
            content_type: Some("text".into()),
            text: Some(text.into()),
            ..Default::default()
        },
        ..Default::default()
    }
}

// ── Scenarios ───────────────────────────────────────────────────────────────

/// Owner DM happy path: one dispatch with the stable session key and the
/// owner marked command-authorized.
#[tokio::test]
async fn owner_dm_happy_path() {
    let mut h = harness_with(owner_config());
    let msg = text_message("s1-m1", "ch-1", "owner-1", "hi");
    pipeline::process_message(&h.ctx, msg, "ch-1".into(), false, Vec::new()).await;

    let dispatches = h.host.dispatches();
    assert_eq!(dispatches.len(), 1);
    let d = &dispatches[0];
    assert_eq!(d.session_key, "agent:wristclaw:direct:ch:ch-1");
    assert!(d.command_authorized);
    assert_eq!(d.body_for_agent, "hi");
    assert_eq!(d.agent_id, "main-agent");

    // The canned reply went out on the same channel.
    let sent = h.outbound.sent.lock().unwrap().clone();
    assert_eq!(sent, vec![("ch-1".to_string(), "Sure thing.".to_string())]);

    // Nothing pending in the flush mailbox.
    assert!(h.flush_rx.try_recv().is_err());
}

/// Messages this plugin sent itself never reach the agent.
#[tokio::test]
async fn echo_suppression() {
    let h = harness_with(owner_config());
    let mut msg = text_message("s2-m1", "ch-1", "owner-1", "hi");
    msg.payload.via = Some("openclaw".into());
    pipeline::process_message(&h.ctx, msg, "ch-1".into(), false, Vec::new()).await;
    assert!(h.host.dispatches().is_empty());

    // Author echo: the bot's own user id is dropped too.
    *h.ctx.bot.write().unwrap() = Some(BotIdentity {
        user_id: "bot-9".into(),
        display_name: Some("bot".into()),
    });
    let msg = text_message("s2-m2", "ch-1", "bot-9", "own message");
    pipeline::process_message(&h.ctx, msg, "ch-1".into(), false, Vec::new()).await;
    assert!(h.host.dispatches().is_empty());
}

/// Group @mention gate: non-mentioning messages buffer as history; the
/// mention dispatches with stripped body plus that history, then clears it.
#[tokio::test]
async fn group_mention_gate_with_history() {
    let h = harness_with(owner_config());
    *h.ctx.bot.write().unwrap() = Some(BotIdentity {
        user_id: "bot-9".into(),
        display_name: Some("bot".into()),
    });
    h.ctx.group_channels.lock().unwrap().insert("g-1".into());

    let first = text_message("s3-m1", "g-1", "u1", "hello");
    pipeline::process_message(&h.ctx, first, "g-1".into(), true, Vec::new()).await;
    assert!(h.host.dispatches().is_empty(), "no dispatch without mention");
    assert_eq!(h.ctx.history.lock().unwrap().snapshot("g-1").len(), 1);

    let second = text_message("s3-m2", "g-1", "u2", "@bot who's there");
    pipeline::process_message(&h.ctx, second, "g-1".into(), true, Vec::new()).await;

    let dispatches = h.host.dispatches();
    assert_eq!(dispatches.len(), 1);
    let d = &dispatches[0];
    assert_eq!(d.body_for_agent, "who's there");
    assert_eq!(d.session_key, "agent:wristclaw:group:ch:g-1");
    assert!(!d.command_authorized);
    assert_eq!(d.inbound_history.len(), 1);
    assert_eq!(d.inbound_history[0].body, "hello");

    // The envelope carried the rendered history block.
    let envelopes = h.host.0.envelopes.lock().unwrap();
    assert!(envelopes.last().unwrap().history_context.is_some());
    drop(envelopes);

    // Buffer cleared after the mention-triggered reply.
    assert!(h.ctx.history.lock().unwrap().snapshot("g-1").is_empty());
}

/// Sliding-window rate limit: with M=2, the third message inside the window
/// is dropped silently.
#[tokio::test]
async fn sender_rate_limit() {
    let h = harness_with(owner_config());
    *h.ctx.rate_limiter.lock().unwrap() = SenderRateLimiter::new(2, Duration::from_secs(60));

    for i in 0..3 {
        let msg = text_message(&format!("s4-m{i}"), "ch-1", "u", &format!("msg {i}"));
        pipeline::process_message(&h.ctx, msg, "ch-1".into(), false, Vec::new()).await;
    }
    assert_eq!(h.host.dispatches().len(), 2);
}

/// Media-group batching: three rapid images collapse into one dispatch with
/// all three URLs, exactly 800 ms after the last arrival.
#[tokio::test(start_paused = true)]
async fn media_group_batching() {
    let mut h = harness_with(owner_config());
    let key = group_key("ch-1", "u1");
    let urls = ["/media/u1.jpg", "/media/u2.jpg", "/media/u3.jpg"];

    let started = tokio::time::Instant::now();
    for (i, url) in urls.into_iter().enumerate() {
        let mut msg = text_message(&format!("s5-m{i}"), "ch-1", "u1", "");
        msg.payload.content_type = Some("image".into());
        msg.payload.media_url = Some(url.into());
        let outcome = h
            .ctx
            .media_groups
            .try_buffer(&key, &msg, "ch-1", false, Some(url), true);
        assert!(matches!(outcome, BufferOutcome::Buffered));
        if i < urls.len() - 1 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    // The flush fires 800 ms after the last image, not the first.
    let (due, group) = loop {
        let due = h.flush_rx.recv().await.unwrap();
        if let Some(group) = h.ctx.media_groups.take_due(&due) {
            break (due, group);
        }
    };
    assert_eq!(started.elapsed(), Duration::from_millis(1000));

    // Re-take returns nothing; the flush is exactly-once.
    assert!(h.ctx.media_groups.take_due(&due).is_none());

    // The first image is the primary; the later URLs rode along as extras.
    assert_eq!(group.payload.message_id, "s5-m0");
    assert_eq!(group.extras, vec![urls[1], urls[2]]);

    // Dispatch the flushed group the way the monitor does.
    pipeline::process_message(
        &h.ctx,
        group.payload,
        group.channel_id,
        group.is_group,
        group.extras,
    )
    .await;

    let dispatches = h.host.dispatches();
    assert_eq!(dispatches.len(), 1);
    let d = &dispatches[0];
    assert_eq!(d.body_for_agent, "📷 3 張圖片");
    assert_eq!(d.media_urls, urls);
    assert_eq!(d.media_paths.len(), 3);
}

/// Unsafe media URLs are skipped while safe ones are fetched.
#[tokio::test]
async fn unsafe_media_url_skipped() {
    let h = harness_with(owner_config());
    let mut msg = text_message("s5b-m1", "ch-1", "u1", "");
    msg.payload.content_type = Some("image".into());
    msg.payload.media_url = Some("/media/ok.jpg".into());
    pipeline::process_message(
        &h.ctx,
        msg,
        "ch-1".into(),
        false,
        vec!["https://evil.example.com/steal.jpg".into()],
    )
    .await;

    let dispatches = h.host.dispatches();
    assert_eq!(dispatches.len(), 1);
    assert_eq!(dispatches[0].media_urls, vec!["/media/ok.jpg"]);
    // The fetch went to the resolved absolute URL on the account server.
    let fetched = h.host.0.fetched_urls.lock().unwrap().clone();
    assert_eq!(fetched, vec!["https://wrist.example.com/media/ok.jpg"]);
}

/// Reconnect + catch-up: missed messages replay through the pipeline, and
/// cross-account dedup stops a live duplicate of the same message.
#[tokio::test]
async fn catchup_replays_missed_messages_once() {
    let mut server = mockito::Server::new_async().await;
    let _messages = server
        .mock("GET", "/v1/channels/ch-1/messages?after=s6-m2&limit=50")
        .with_status(200)
        .with_body(
            r#"{"messages": [{
                "message_id": "s6-m3",
                "author_id": "owner-1",
                "channel_id": "ch-1",
                "created_at": 1700000200,
                "payload": {"content_type": "text", "text": "missed you"}
            }]}"#,
        )
        .create_async()
        .await;

    let mut config = owner_config();
    config.server_url = server.url();
    let h = harness_with(config);
    h.ctx
        .last_seen
        .lock()
        .unwrap()
        .insert("ch-1".into(), "s6-m2".into());

    catchup::run(&h.ctx).await;
    let dispatches = h.host.wait_for_dispatches(1).await;
    assert_eq!(dispatches[0].body_for_agent, "missed you");

    // Last-seen advanced to the replayed message.
    assert_eq!(
        h.ctx.last_seen.lock().unwrap().get("ch-1"),
        Some(&"s6-m3".to_string())
    );

    // A live message:new for the same id is a duplicate now.
    let duplicate = text_message("s6-m3", "ch-1", "owner-1", "missed you");
    pipeline::process_message(&h.ctx, duplicate, "ch-1".into(), false, Vec::new()).await;
    assert_eq!(h.host.dispatches().len(), 1);
}

/// Catch-up skips our own messages.
#[tokio::test]
async fn catchup_skips_echoes() {
    let mut server = mockito::Server::new_async().await;
    let _messages = server
        .mock("GET", "/v1/channels/ch-2/messages?after=s6b-m1&limit=50")
        .with_status(200)
        .with_body(
            r#"{"messages": [
                {"message_id": "s6b-m2", "author_id": "u1",
                 "payload": {"content_type": "text", "text": "ok", "via": "openclaw"}},
                {"message_id": "s6b-m3", "author_id": "bot-9",
                 "payload": {"content_type": "text", "text": "self"}}
            ]}"#,
        )
        .create_async()
        .await;

    let mut config = owner_config();
    config.server_url = server.url();
    let h = harness_with(config);
    *h.ctx.bot.write().unwrap() = Some(BotIdentity {
        user_id: "bot-9".into(),
        display_name: None,
    });
    h.ctx
        .last_seen
        .lock()
        .unwrap()
        .insert("ch-2".into(), "s6b-m1".into());

    catchup::run(&h.ctx).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.host.dispatches().is_empty());
}

/// Voice rendezvous: an untranscribed voice message waits for its
/// `message:update` and dispatches the transcription.
#[tokio::test]
async fn voice_waits_for_transcription() {
    let h = harness_with(owner_config());
    let mut msg = text_message("s7-m1", "ch-1", "owner-1", "");
    msg.payload.content_type = Some("voice".into());
    msg.payload.text = None;

    let ctx = Arc::clone(&h.ctx);
    let task = tokio::spawn(async move {
        pipeline::process_message(&ctx, msg, "ch-1".into(), false, Vec::new()).await;
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(h.ctx.voice.resolve("s7-m1", "turn on the lights"));
    task.await.unwrap();

    let dispatches = h.host.dispatches();
    assert_eq!(dispatches.len(), 1);
    assert_eq!(dispatches[0].body_for_agent, "turn on the lights");
}

/// A voice message whose transcription never arrives is dropped, not
/// dispatched as an empty prompt.
#[tokio::test(start_paused = true)]
async fn voice_timeout_drops_message() {
    let h = harness_with(owner_config());
    let mut msg = text_message("s7-m2", "ch-1", "owner-1", "");
    msg.payload.content_type = Some("voice".into());
    msg.payload.text = None;

    pipeline::process_message(&h.ctx, msg, "ch-1".into(), false, Vec::new()).await;
    assert!(h.host.dispatches().is_empty());
}

/// DM allowlist policy: listed senders pass, others are dropped silently.
#[tokio::test]
async fn dm_allowlist_policy() {
    let mut config = owner_config();
    config.dm_policy = wristclaw_channels::gating::DmPolicy::Allowlist;
    config.dm_allowlist = vec!["friend".into()];
    let h = harness_with(config);

    let allowed = text_message("s8-m1", "ch-1", "friend", "hello");
    pipeline::process_message(&h.ctx, allowed, "ch-1".into(), false, Vec::new()).await;
    let denied = text_message("s8-m2", "ch-1", "stranger", "hello");
    pipeline::process_message(&h.ctx, denied, "ch-1".into(), false, Vec::new()).await;
    // Owner bypasses the allowlist.
    let owner = text_message("s8-m3", "ch-1", "owner-1", "hello");
    pipeline::process_message(&h.ctx, owner, "ch-1".into(), false, Vec::new()).await;

    let senders: Vec<String> = h
        .host
        .dispatches()
        .into_iter()
        .map(|d| d.sender_id)
        .collect();
    assert_eq!(senders, vec!["friend", "owner-1"]);
}

/// Visitors route to the secretary agent when configured; the owner keeps
/// the default route.
#[tokio::test]
async fn secretary_agent_routing() {
    let mut config = owner_config();
    config.secretary_agent_id = Some("secretary".into());
    let h = harness_with(config);

    let visitor = text_message("s9-m1", "ch-1", "guest", "hello");
    pipeline::process_message(&h.ctx, visitor, "ch-1".into(), false, Vec::new()).await;
    let owner = text_message("s9-m2", "ch-1", "owner-1", "hello");
    pipeline::process_message(&h.ctx, owner, "ch-1".into(), false, Vec::new()).await;

    let agents: Vec<String> = h
        .host
        .dispatches()
        .into_iter()
        .map(|d| d.agent_id)
        .collect();
    assert_eq!(agents, vec!["secretary", "main-agent"]);
}

/// Reply-context previews are clipped, control-stripped, and prefixed.
#[tokio::test]
async fn reply_context_prefix() {
    let h = harness_with(owner_config());
    let mut msg = text_message("s10-m1", "ch-1", "owner-1", "yes");
    msg.reply_context = Some(ReplyContext {
        message_id: "m-old".into(),
        author_id: "u2".into(),
        text_preview: Some("shall we\x00 meet?".into()),
    });
    pipeline::process_message(&h.ctx, msg, "ch-1".into(), false, Vec::new()).await;

    let dispatches = h.host.dispatches();
    assert_eq!(dispatches[0].body_for_agent, "[Re: shall we meet?]\nyes");
}

/// Per-account dedup: the same message id processed twice dispatches once.
#[tokio::test]
async fn per_account_dedup() {
    let h = harness_with(owner_config());
    let msg = text_message("s11-m1", "ch-1", "owner-1", "hi");
    pipeline::process_message(&h.ctx, msg.clone(), "ch-1".into(), false, Vec::new()).await;
    pipeline::process_message(&h.ctx, msg, "ch-1".into(), false, Vec::new()).await;
    assert_eq!(h.host.dispatches().len(), 1);
}
