//! Per-account session loop.
//!
//! One monitor owns one WebSocket, the timers around it (ping, pong,
//! reconnect backoff, rate-limit cleanup), and the per-account state the
//! pipeline reads. The loop is driven by a `select!` over the socket reader,
//! the outbound frame queue, timer ticks, and the media-group flush mailbox.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use {
    futures::{SinkExt, StreamExt},
    secrecy::ExposeSecret,
    tokio::sync::mpsc,
    tokio_tungstenite::{connect_async, tungstenite::Message},
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info, warn},
    url::{Host, Url},
};

use wristclaw_channels::{HostRuntime, Outbound};

use crate::{
    bounded::BoundedMap,
    catchup,
    config::AccountConfig,
    dedup::{AccountDedup, CrossAccountDedup},
    error::{Error, Result},
    events::{
        self, BotIdentity, CHANNEL_TOPIC_PREFIX, MessageContent, MessagePayload, PairInfo,
        ServerEvent, VoiceTranscribedPayload, channel_topic, user_topic,
    },
    history::GroupHistory,
    media_group::{BufferOutcome, FlushDue, MediaGroupBuffer, group_key},
    pipeline::{self, PipelineHooks},
    rate_limit::{CLEANUP_INTERVAL, SenderRateLimiter},
    rest::RestClient,
    state::StatusSink,
    voice::VoiceWaiters,
};

/// Upper bound on concurrently running pipeline dispatches per account.
pub const MAX_CONCURRENT_DISPATCHES: usize = 3;

/// Application-level ping cadence.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// A ping must be answered within this window or the socket is force-closed.
const PONG_TIMEOUT: Duration = Duration::from_secs(10);

/// Reconnect backoff bounds; doubles per failure, resets on authentication.
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Capacity of the message-id → author cache feeding the legacy
/// `voice:transcribed` path.
const AUTHOR_CACHE_CAPACITY: usize = 500;

/// Everything one account monitor owns, shared with its pipeline tasks.
pub struct MonitorContext {
    pub account_id: String,
    pub config: RwLock<AccountConfig>,
    pub server: Url,
    pub rest: RestClient,
    pub host: HostRuntime,
    pub outbound: Arc<dyn Outbound>,
    pub status: Arc<StatusSink>,
    pub cancel: CancellationToken,
    pub hooks: PipelineHooks,
    pub cross_dedup: Arc<CrossAccountDedup>,

    pub bot: RwLock<Option<BotIdentity>>,
    pub ws_writer: Mutex<Option<mpsc::UnboundedSender<String>>>,
    pub pair_to_channel: Mutex<HashMap<String, String>>,
    pub group_channels: Mutex<HashSet<String>>,
    pub channel_names: Mutex<HashMap<String, String>>,
    pub last_seen: Mutex<HashMap<String, String>>,
    pub author_cache: Mutex<BoundedMap<String, String>>,
    pub account_dedup: Mutex<AccountDedup>,
    pub rate_limiter: Mutex<SenderRateLimiter>,
    pub history: Mutex<GroupHistory>,
    pub voice: VoiceWaiters,
    pub media_groups: MediaGroupBuffer,
    pub active_dispatches: AtomicUsize,
    first_connect_done: AtomicBool,
}

impl MonitorContext {
    /// Build the context and the flush mailbox its media-group buffer feeds.
    pub fn new(
        account_id: impl Into<String>,
        config: AccountConfig,
        host: HostRuntime,
        outbound: Arc<dyn Outbound>,
        hooks: PipelineHooks,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<FlushDue>)> {
        if config.api_key.expose_secret().is_empty() {
            return Err(Error::config("api_key is required"));
        }
        if config.server_url.is_empty() {
            return Err(Error::config("server_url is required"));
        }
        let server = Url::parse(&config.server_url)
            .map_err(|e| Error::config(format!("invalid server_url: {e}")))?;
        let rest = RestClient::new(server.clone(), config.api_key.clone())?;
        let (flush_tx, flush_rx) = mpsc::unbounded_channel();
        let history_limit = config.group_history_limit;
        let ctx = Arc::new(Self {
            account_id: account_id.into(),
            config: RwLock::new(config),
            rest,
            host,
            outbound,
            status: Arc::new(StatusSink::new()),
            cancel: CancellationToken::new(),
            hooks,
            cross_dedup: CrossAccountDedup::global(),
            bot: RwLock::new(None),
            ws_writer: Mutex::new(None),
            pair_to_channel: Mutex::new(HashMap::new()),
            group_channels: Mutex::new(HashSet::new()),
            channel_names: Mutex::new(HashMap::new()),
            last_seen: Mutex::new(HashMap::new()),
            author_cache: Mutex::new(BoundedMap::new(AUTHOR_CACHE_CAPACITY)),
            account_dedup: Mutex::new(AccountDedup::new()),
            rate_limiter: Mutex::new(SenderRateLimiter::default()),
            history: Mutex::new(GroupHistory::new(history_limit)),
            voice: VoiceWaiters::new(),
            media_groups: MediaGroupBuffer::new(server.clone(), flush_tx),
            active_dispatches: AtomicUsize::new(0),
            first_connect_done: AtomicBool::new(false),
            server,
        });
        Ok((ctx, flush_rx))
    }

    /// Queue a frame for the socket writer. Silently a no-op when no socket
    /// is live; the close handler is the single source of reconnect truth.
    pub fn send_ws(&self, frame: String) {
        if let Ok(writer) = self.ws_writer.lock()
            && let Some(tx) = writer.as_ref()
        {
            let _ = tx.send(frame);
        }
    }

    /// The bot identity fetched at first authentication, if known yet.
    #[must_use]
    pub fn bot_identity(&self) -> Option<BotIdentity> {
        self.bot.read().ok().and_then(|b| b.clone())
    }

    /// Display name for a channel, falling back to its id.
    #[must_use]
    pub fn channel_name(&self, channel_id: &str) -> String {
        self.channel_names
            .lock()
            .ok()
            .and_then(|names| names.get(channel_id).cloned())
            .unwrap_or_else(|| channel_id.to_string())
    }

    #[must_use]
    pub fn is_group_channel(&self, channel_id: &str) -> bool {
        self.group_channels
            .lock()
            .is_ok_and(|groups| groups.contains(channel_id))
    }
}

/// Spawn the monitor task for an account. Fatal configuration (missing key,
/// cleartext `ws://` to a remote host) fails here, before anything runs.
pub fn spawn(
    account_id: impl Into<String>,
    config: AccountConfig,
    host: HostRuntime,
    outbound: Arc<dyn Outbound>,
    hooks: PipelineHooks,
) -> Result<Arc<MonitorContext>> {
    let (ctx, flush_rx) = MonitorContext::new(account_id, config, host, outbound, hooks)?;
    let ws_url = derive_ws_url(&ctx.server)?;
    let task_ctx = Arc::clone(&ctx);
    tokio::spawn(async move {
        run(task_ctx, ws_url, flush_rx).await;
    });
    Ok(ctx)
}

/// Derive the control-plane URL: swap `http(s)` for `ws(s)` and append
/// `/v1/ws`. Cleartext `ws://` is refused unless the host is loopback — the
/// API key would travel unencrypted.
pub fn derive_ws_url(server: &Url) -> Result<Url> {
    let scheme = match server.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => {
            return Err(Error::config(format!("unsupported server scheme: {other}")));
        },
    };
    let mut ws = server.clone();
    ws.set_scheme(scheme)
        .map_err(|()| Error::config("server_url cannot carry a websocket scheme"))?;
    let path = format!("{}/v1/ws", server.path().trim_end_matches('/'));
    ws.set_path(&path);
    if ws.scheme() == "ws" && !is_loopback_host(&ws) {
        return Err(Error::config(
            "refusing ws:// to a non-local host: the API key would be sent in cleartext",
        ));
    }
    Ok(ws)
}

fn is_loopback_host(url: &Url) -> bool {
    match url.host() {
        Some(Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        Some(Host::Ipv4(ip)) => ip.is_loopback(),
        Some(Host::Ipv6(ip)) => ip.is_loopback(),
        None => false,
    }
}

enum SessionEnd {
    Stopped,
    Disconnected,
}

/// Outer reconnect loop.
pub(crate) async fn run(
    ctx: Arc<MonitorContext>,
    ws_url: Url,
    mut flush_rx: mpsc::UnboundedReceiver<FlushDue>,
) {
    ctx.status.mark_started();
    info!(account_id = %ctx.account_id, url = %ws_url, "monitor starting");

    // Rate-limit bookkeeping runs for the monitor's whole lifetime.
    let cleanup_ctx = Arc::clone(&ctx);
    let cleanup = tokio::spawn(async move {
        let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            if let Ok(mut limiter) = cleanup_ctx.rate_limiter.lock() {
                limiter.cleanup();
            }
        }
    });

    let mut backoff = INITIAL_BACKOFF;
    loop {
        if ctx.cancel.is_cancelled() {
            break;
        }
        match run_session(&ctx, &ws_url, &mut flush_rx, &mut backoff).await {
            SessionEnd::Stopped => break,
            SessionEnd::Disconnected => {
                info!(
                    account_id = %ctx.account_id,
                    delay_ms = backoff.as_millis() as u64,
                    "reconnecting after delay"
                );
                tokio::select! {
                    () = tokio::time::sleep(backoff) => {},
                    () = ctx.cancel.cancelled() => break,
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
            },
        }
    }

    cleanup.abort();
    shutdown(&ctx);
}

/// One connection attempt: connect, authenticate, then route events until
/// the socket dies or the monitor stops.
async fn run_session(
    ctx: &Arc<MonitorContext>,
    ws_url: &Url,
    flush_rx: &mut mpsc::UnboundedReceiver<FlushDue>,
    backoff: &mut Duration,
) -> SessionEnd {
    let (stream, _response) = match connect_async(ws_url.as_str()).await {
        Ok(ok) => ok,
        Err(e) => {
            warn!(account_id = %ctx.account_id, error = %e, "websocket connect failed");
            ctx.status.record_error(&e);
            return SessionEnd::Disconnected;
        },
    };
    let (mut sink, mut reader) = stream.split();

    let (write_tx, mut write_rx) = mpsc::unbounded_channel::<String>();
    if let Ok(mut writer) = ctx.ws_writer.lock() {
        *writer = Some(write_tx.clone());
    }

    // Authenticate first; everything else happens on `authenticated`.
    {
        let api_key = ctx
            .config
            .read()
            .map(|c| c.api_key.expose_secret().clone())
            .unwrap_or_default();
        let _ = write_tx.send(events::auth_frame(&api_key));
    }

    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping.reset();
    let mut authenticated = false;
    let mut pong_deadline: Option<tokio::time::Instant> = None;

    let end = loop {
        tokio::select! {
            () = ctx.cancel.cancelled() => break SessionEnd::Stopped,

            frame = reader.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    match events::parse_frame(text.as_str()) {
                        Ok(ServerEvent::Authenticated) => {
                            *backoff = INITIAL_BACKOFF;
                            authenticated = true;
                            pong_deadline = None;
                            ping.reset();
                            if let Err(e) = on_authenticated(ctx, &write_tx).await {
                                warn!(account_id = %ctx.account_id, error = %e, "post-auth setup failed");
                                ctx.status.record_error(&e);
                            }
                        },
                        Ok(ServerEvent::Pong) => {
                            pong_deadline = None;
                        },
                        Ok(event) => handle_event(ctx, event, &write_tx).await,
                        Err(e) => {
                            error!(account_id = %ctx.account_id, error = %e, "unparseable websocket frame");
                        },
                    }
                },
                Some(Ok(Message::Ping(data))) => {
                    let _ = sink.send(Message::Pong(data)).await;
                },
                Some(Ok(Message::Close(_))) | None => {
                    debug!(account_id = %ctx.account_id, "websocket closed by server");
                    break SessionEnd::Disconnected;
                },
                Some(Ok(_)) => {},
                Some(Err(e)) => {
                    warn!(account_id = %ctx.account_id, error = %e, "websocket read error");
                    ctx.status.record_error(&e);
                    break SessionEnd::Disconnected;
                },
            },

            outgoing = write_rx.recv() => {
                if let Some(text) = outgoing {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break SessionEnd::Disconnected;
                    }
                }
            },

            _ = ping.tick(), if authenticated => {
                let _ = write_tx.send(events::ping_frame());
                if pong_deadline.is_none() {
                    pong_deadline = Some(tokio::time::Instant::now() + PONG_TIMEOUT);
                }
            },

            () = sleep_until_opt(pong_deadline), if pong_deadline.is_some() => {
                warn!(account_id = %ctx.account_id, "pong timeout, forcing reconnect");
                break SessionEnd::Disconnected;
            },

            due = flush_rx.recv() => {
                if let Some(due) = due
                    && let Some(group) = ctx.media_groups.take_due(&due)
                {
                    submit_dispatch(ctx, group.payload, group.channel_id, group.is_group, group.extras);
                }
            },
        }
    };

    if let Ok(mut writer) = ctx.ws_writer.lock() {
        *writer = None;
    }
    let _ = sink.close().await;
    end
}

async fn sleep_until_opt(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Post-authentication setup: identity, subscriptions, conversation map
/// rebuild, and catch-up on reconnects.
async fn on_authenticated(
    ctx: &Arc<MonitorContext>,
    write_tx: &mpsc::UnboundedSender<String>,
) -> Result<()> {
    info!(account_id = %ctx.account_id, "authenticated");

    // Bot identity is fetched once per monitor lifetime.
    let identity = match ctx.bot_identity() {
        Some(identity) => identity,
        None => {
            let identity = ctx.rest.bot_identity().await?;
            info!(
                account_id = %ctx.account_id,
                bot_user = %identity.user_id,
                display_name = ?identity.display_name,
                "bot identity resolved"
            );
            if let Ok(mut bot) = ctx.bot.write() {
                *bot = Some(identity.clone());
            }
            identity
        },
    };
    let _ = write_tx.send(events::subscribe_frame(&user_topic(&identity.user_id)));

    // Conversation maps are truth-derived from this response alone.
    let conversations = ctx.rest.conversations().await?;
    {
        if let Ok(mut pairs) = ctx.pair_to_channel.lock() {
            pairs.clear();
            for conv in &conversations {
                if let Some(pair_id) = &conv.pair_id {
                    pairs.insert(pair_id.clone(), conv.channel_id.clone());
                }
            }
        }
        if let Ok(mut groups) = ctx.group_channels.lock() {
            groups.clear();
            for conv in &conversations {
                if conv.is_group() {
                    groups.insert(conv.channel_id.clone());
                }
            }
        }
        if let Ok(mut names) = ctx.channel_names.lock() {
            names.clear();
            for conv in &conversations {
                if let Some(name) = &conv.group_name {
                    names.insert(conv.channel_id.clone(), name.clone());
                }
            }
        }
    }
    let mut seen = HashSet::new();
    for conv in &conversations {
        if seen.insert(conv.channel_id.clone()) {
            let _ = write_tx.send(events::subscribe_frame(&channel_topic(&conv.channel_id)));
        }
    }

    let first = !ctx.first_connect_done.swap(true, Ordering::SeqCst);
    if !first {
        catchup::run(ctx).await;
    }
    Ok(())
}

/// Route one server event.
async fn handle_event(
    ctx: &Arc<MonitorContext>,
    event: ServerEvent,
    write_tx: &mpsc::UnboundedSender<String>,
) {
    match event {
        ServerEvent::MessageNew { channel, payload } => {
            on_message_new(ctx, channel.as_deref(), payload);
        },
        ServerEvent::MessageUpdate { payload } => {
            if !payload.message_id.is_empty()
                && let Some(text) = payload.text.as_deref()
                && !text.is_empty()
            {
                ctx.voice.resolve(&payload.message_id, text);
            }
        },
        ServerEvent::VoiceTranscribed { payload } => {
            on_voice_transcribed(ctx, payload);
        },
        ServerEvent::PairCreated { .. } => {
            on_pair_created(ctx, write_tx).await;
        },
        ServerEvent::GroupMemberAdded { payload } => {
            if payload.channel_id.is_empty() {
                return;
            }
            if let Ok(mut groups) = ctx.group_channels.lock() {
                groups.insert(payload.channel_id.clone());
            }
            let _ = write_tx.send(events::subscribe_frame(&channel_topic(&payload.channel_id)));
        },
        ServerEvent::Subscribed { channel } => {
            debug!(account_id = %ctx.account_id, channel = ?channel, "subscribed");
        },
        ServerEvent::Error { payload } => {
            warn!(account_id = %ctx.account_id, payload = ?payload, "server error event");
        },
        // Membership churn and unrecognized event types carry nothing we act on.
        ServerEvent::GroupMemberChanged | ServerEvent::Unknown => {},
        // Handled inline by the session loop.
        ServerEvent::Authenticated | ServerEvent::Pong => {},
    }
}

fn on_message_new(ctx: &Arc<MonitorContext>, ws_channel: Option<&str>, payload: MessagePayload) {
    let Some(channel_id) = resolve_channel_id(ctx, &payload, ws_channel) else {
        debug!(
            account_id = %ctx.account_id,
            message_id = %payload.message_id,
            "unroutable message, dropping"
        );
        return;
    };

    if let Ok(mut last_seen) = ctx.last_seen.lock() {
        last_seen.insert(channel_id.clone(), payload.message_id.clone());
    }
    if let Ok(mut authors) = ctx.author_cache.lock() {
        authors.set(payload.message_id.clone(), payload.author_id.clone());
    }
    ctx.status.note_inbound();

    let is_group = ctx.is_group_channel(&channel_id);
    let is_image = payload.payload.content_type.as_deref() == Some("image");
    let media_url = payload
        .payload
        .media_url
        .clone()
        .or_else(|| payload.media_url.clone());
    let key = group_key(&channel_id, &payload.author_id);

    match ctx.media_groups.try_buffer(
        &key,
        &payload,
        &channel_id,
        is_group,
        media_url.as_deref(),
        is_image,
    ) {
        BufferOutcome::Buffered => {},
        BufferOutcome::PassthroughWithFlush(group) => {
            submit_dispatch(ctx, group.payload, group.channel_id, group.is_group, group.extras);
            submit_dispatch(ctx, payload, channel_id, is_group, Vec::new());
        },
        BufferOutcome::Passthrough => {
            submit_dispatch(ctx, payload, channel_id, is_group, Vec::new());
        },
    }
}

/// Legacy transcription event: resolve a pending waiter when one exists,
/// otherwise synthesize a voice `message:new` for servers that never send
/// the original message through `message:update`.
fn on_voice_transcribed(ctx: &Arc<MonitorContext>, payload: VoiceTranscribedPayload) {
    let Some(text) = payload.text.clone().filter(|t| !t.is_empty()) else {
        return;
    };
    if ctx.voice.resolve(&payload.message_id, &text) {
        return;
    }

    let author_id = ctx
        .author_cache
        .lock()
        .ok()
        .and_then(|authors| authors.get(&payload.message_id).cloned())
        .unwrap_or_default();
    let synthesized = MessagePayload {
        message_id: payload.message_id,
        channel_id: payload.channel_id,
        pair_id: payload.pair_id,
        author_id,
        payload: MessageContent {
            content_type: Some("voice".into()),
            text: Some(text),
            ..Default::default()
        },
        ..Default::default()
    };
    let Some(channel_id) = resolve_channel_id(ctx, &synthesized, None) else {
        return;
    };
    let is_group = ctx.is_group_channel(&channel_id);
    submit_dispatch(ctx, synthesized, channel_id, is_group, Vec::new());
}

/// `pair:created` refresh: insert new pair mappings and subscribe their
/// channels. Existing mappings are left alone to avoid unsubscription churn;
/// full reconciliation happens at the next authentication.
async fn on_pair_created(ctx: &Arc<MonitorContext>, write_tx: &mpsc::UnboundedSender<String>) {
    match ctx.rest.pair_list().await {
        Ok(pairs) => {
            for PairInfo { pair_id, channel_id } in pairs {
                let newly_mapped = ctx
                    .pair_to_channel
                    .lock()
                    .is_ok_and(|mut map| map.insert(pair_id, channel_id.clone()).is_none());
                if newly_mapped {
                    let _ = write_tx.send(events::subscribe_frame(&channel_topic(&channel_id)));
                }
            }
        },
        Err(e) => {
            warn!(account_id = %ctx.account_id, error = %e, "pair refresh failed");
        },
    }
}

/// Resolve the channel a `message:new` belongs to: payload channel id, then
/// the pair map, then the subscription topic name. Unresolvable events are
/// unroutable.
pub(crate) fn resolve_channel_id(
    ctx: &MonitorContext,
    payload: &MessagePayload,
    ws_channel: Option<&str>,
) -> Option<String> {
    if let Some(channel_id) = payload.channel_id.as_deref()
        && !channel_id.is_empty()
    {
        return Some(channel_id.to_string());
    }
    if let Some(pair_id) = payload.pair_id.as_deref()
        && let Ok(pairs) = ctx.pair_to_channel.lock()
        && let Some(channel_id) = pairs.get(pair_id)
    {
        return Some(channel_id.clone());
    }
    if let Some(topic) = ws_channel
        && let Some(channel_id) = topic.strip_prefix(CHANNEL_TOPIC_PREFIX)
        && !channel_id.is_empty()
    {
        return Some(channel_id.to_string());
    }
    None
}

/// Submit a message to the pipeline under the per-account concurrency cap.
/// Returns whether the dispatch was accepted; at the cap, the message is
/// logged and dropped.
pub(crate) fn submit_dispatch(
    ctx: &Arc<MonitorContext>,
    payload: MessagePayload,
    channel_id: String,
    is_group: bool,
    extras: Vec<String>,
) -> bool {
    let acquired = ctx
        .active_dispatches
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |active| {
            (active < MAX_CONCURRENT_DISPATCHES).then_some(active + 1)
        })
        .is_ok();
    if !acquired {
        warn!(
            account_id = %ctx.account_id,
            message_id = %payload.message_id,
            "dispatch concurrency cap reached, dropping message"
        );
        return false;
    }

    let task_ctx = Arc::clone(ctx);
    tokio::spawn(async move {
        pipeline::process_message(&task_ctx, payload, channel_id, is_group, extras).await;
        task_ctx.active_dispatches.fetch_sub(1, Ordering::SeqCst);
    });
    true
}

/// Final teardown: flush pending media groups through the capped pipeline,
/// resolve outstanding voice waiters, and drop the writer handle.
fn shutdown(ctx: &Arc<MonitorContext>) {
    for group in ctx.media_groups.dispose() {
        submit_dispatch(ctx, group.payload, group.channel_id, group.is_group, group.extras);
    }
    ctx.voice.dispose();
    if let Ok(mut writer) = ctx.ws_writer.lock() {
        *writer = None;
    }
    ctx.status.mark_stopped();
    info!(account_id = %ctx.account_id, "monitor stopped");
}
