//! Replay of messages missed during a disconnect.
//!
//! Runs after every re-authentication: for each channel with a known
//! last-seen message id, page the REST data plane forward and feed the
//! results through the same concurrency-gated pipeline as live events.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::{
    monitor::{self, MonitorContext},
    policy,
    rest::{self, CATCHUP_PAGE_LIMIT},
};

/// Run one catch-up pass over every channel with a known last-seen id.
pub async fn run(ctx: &Arc<MonitorContext>) {
    let channels: Vec<(String, String)> = match ctx.last_seen.lock() {
        Ok(last_seen) => last_seen
            .iter()
            .map(|(channel, message)| (channel.clone(), message.clone()))
            .collect(),
        Err(_) => return,
    };
    if channels.is_empty() {
        return;
    }

    let bot_user_id = ctx.bot_identity().map(|b| b.user_id);

    for (channel_id, after) in channels {
        // Ids are spliced into the request path; anything unexpected is
        // skipped rather than sent.
        if !rest::is_valid_id(&channel_id) || !rest::is_valid_id(&after) {
            debug!(account_id = %ctx.account_id, %channel_id, %after, "skipping catch-up for odd ids");
            continue;
        }

        let messages = match ctx
            .rest
            .messages_after(&channel_id, &after, CATCHUP_PAGE_LIMIT)
            .await
        {
            Ok(messages) => messages,
            Err(e) => {
                warn!(account_id = %ctx.account_id, %channel_id, error = %e, "catch-up fetch failed");
                continue;
            },
        };

        debug!(
            account_id = %ctx.account_id,
            %channel_id,
            count = messages.len(),
            "replaying missed messages"
        );

        for mut payload in messages {
            if payload.payload.via.as_deref() == Some(policy::ECHO_VIA) {
                continue;
            }
            if let Some(bot) = bot_user_id.as_deref()
                && !bot.is_empty()
                && payload.author_id == bot
            {
                continue;
            }

            payload.channel_id = Some(channel_id.clone());
            let message_id = payload.message_id.clone();
            let is_group = ctx.is_group_channel(&channel_id);
            if !monitor::submit_dispatch(ctx, payload, channel_id.clone(), is_group, Vec::new()) {
                // At the concurrency cap; leave last-seen where it is so the
                // next reconnect replays from here.
                break;
            }
            if let Ok(mut last_seen) = ctx.last_seen.lock() {
                last_seen.insert(channel_id.clone(), message_id);
            }
        }
    }
}
