//! Pure policy checks applied before a message may reach the agent: echo
//! suppression, media-URL safety, access gates, and @mention handling.

use {regex::Regex, url::Url};

use wristclaw_channels::gating::{DmPolicy, GroupPolicy, list_allows};

use crate::config::AccountConfig;

/// Marker the outbound path stamps on messages this plugin sent itself.
pub const ECHO_VIA: &str = "openclaw";

/// Whether an inbound message is our own output echoed back.
#[must_use]
pub fn is_echo(via: Option<&str>, author_id: &str, bot_user_id: Option<&str>) -> bool {
    if via == Some(ECHO_VIA) {
        return true;
    }
    match bot_user_id {
        Some(bot) if !bot.is_empty() => author_id == bot,
        _ => false,
    }
}

/// Whether a media URL may be fetched.
///
/// Server-relative paths are always safe; absolute URLs only when their
/// hostname equals the account server's hostname. Everything else is treated
/// as a server-side redirect trick and skipped.
#[must_use]
pub fn is_safe_media_url(url: &str, server: &Url) -> bool {
    if url.is_empty() {
        return false;
    }
    if url.starts_with('/') {
        return true;
    }
    match Url::parse(url) {
        Ok(parsed) => parsed.host_str().is_some() && parsed.host_str() == server.host_str(),
        Err(_) => false,
    }
}

/// Outcome of an access gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Allow,
    Deny,
    /// Allowed into the room but the caller must still check @mention; a
    /// non-mentioning message is only recorded as context.
    RecordOnly,
}

/// DM access gate. The owner is always allowed.
#[must_use]
pub fn dm_gate(config: &AccountConfig, sender_id: &str) -> GateDecision {
    if config.is_owner(sender_id) {
        return GateDecision::Allow;
    }
    match config.dm_policy {
        DmPolicy::Disabled => GateDecision::Deny,
        DmPolicy::Open => GateDecision::Allow,
        DmPolicy::Allowlist => {
            if list_allows(&config.dm_allowlist, sender_id) {
                GateDecision::Allow
            } else {
                GateDecision::Deny
            }
        },
    }
}

/// Group access gate. A configured group allowlist gates non-owner senders
/// regardless of policy; `mention` policy admits messages as record-only.
#[must_use]
pub fn group_gate(config: &AccountConfig, sender_id: &str) -> GateDecision {
    if config.group_policy == GroupPolicy::Disabled {
        return GateDecision::Deny;
    }
    if !config.is_owner(sender_id)
        && !config.group_allowlist.is_empty()
        && !list_allows(&config.group_allowlist, sender_id)
    {
        return GateDecision::Deny;
    }
    match config.group_policy {
        GroupPolicy::Open => GateDecision::Allow,
        GroupPolicy::Mention => GateDecision::RecordOnly,
        GroupPolicy::Disabled => GateDecision::Deny,
    }
}

/// Result of mention detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MentionOutcome {
    pub mentioned: bool,
    pub stripped: String,
}

/// The names a group message may @mention to address the bot: the account's
/// configured names, the bot's display name, and the literal "all".
#[must_use]
pub fn mention_pool(config: &AccountConfig, bot_display_name: Option<&str>) -> Vec<String> {
    let mut pool: Vec<String> = config
        .mention_names
        .iter()
        .map(|n| n.to_lowercase())
        .collect();
    if let Some(name) = bot_display_name {
        let name = name.trim().to_lowercase();
        if !name.is_empty() && !pool.contains(&name) {
            pool.push(name);
        }
    }
    if !pool.contains(&"all".to_string()) {
        pool.push("all".into());
    }
    pool
}

/// Detect whether `text` @mentions any of `names` (case-insensitive) and,
/// when it does, remove every occurrence of every name along with trailing
/// whitespace, returning the trimmed remainder.
#[must_use]
pub fn detect_and_strip_mention(text: &str, names: &[String]) -> MentionOutcome {
    let mut mentioned = false;
    let mut stripped = text.to_string();
    for name in names {
        if name.is_empty() {
            continue;
        }
        let pattern = format!(r"(?i)@{}\s*", regex::escape(name));
        let Ok(re) = Regex::new(&pattern) else {
            continue;
        };
        if re.is_match(&stripped) {
            mentioned = true;
            stripped = re.replace_all(&stripped, "").into_owned();
        }
    }
    if !mentioned {
        return MentionOutcome {
            mentioned: false,
            stripped: text.to_string(),
        };
    }
    MentionOutcome {
        mentioned: true,
        stripped: stripped.trim().to_string(),
    }
}
