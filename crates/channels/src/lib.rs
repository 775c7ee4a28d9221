//! Channel plugin system.
//!
//! A channel bridges the agent host to one messaging platform. This crate
//! defines the plugin trait a channel implements, the access-gating policy
//! types shared by every channel, and the capability surface the host runtime
//! provides to channels (agent routing, session store, reply dispatch, text
//! tooling, media helpers).

pub mod error;
pub mod gating;
pub mod plugin;

pub use {
    error::{Error, Result},
    plugin::{
        AgentRouting, ChannelHealthSnapshot, ChannelPlugin, ChannelStatus, ChunkMode,
        EnvelopeParts, HostRuntime, InboundContext, InboundSessionRecord, MediaStore, Outbound,
        ReplyDispatcher, ReplyEvent, ReplyReceiver, ReplySender, SessionStore, TextTools,
    },
};
