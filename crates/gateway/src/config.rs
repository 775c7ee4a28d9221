use {
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
};

use wristclaw_channels::gating::{DmPolicy, GroupPolicy};

/// Default number of buffered group messages handed to the agent as context.
pub const DEFAULT_GROUP_HISTORY_LIMIT: usize = 20;

/// Configuration for a single WristClaw account.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountConfig {
    /// HTTP(S) base URL of the WristClaw server.
    pub server_url: String,

    /// API key presented on the REST and WebSocket planes.
    #[serde(serialize_with = "serialize_secret")]
    pub api_key: Secret<String>,

    /// User id of the account owner. The owner bypasses access policies and
    /// is routed to the default agent.
    pub owner_user_id: Option<String>,

    /// DM access policy.
    pub dm_policy: DmPolicy,

    /// Sender allowlist for DMs (`"*"` admits everyone).
    pub dm_allowlist: Vec<String>,

    /// Group access policy.
    pub group_policy: GroupPolicy,

    /// Sender allowlist for groups; empty means no sender gating.
    pub group_allowlist: Vec<String>,

    /// Lowercase names the bot answers to when @mentioned in groups, in
    /// addition to its display name and the literal "all".
    pub mention_names: Vec<String>,

    /// How many non-mentioning group messages to buffer as context.
    pub group_history_limit: usize,

    /// Agent that answers visitors (non-owners). Owners always get the
    /// default route agent.
    pub secretary_agent_id: Option<String>,
}

impl AccountConfig {
    /// Whether `sender_id` is the configured owner.
    #[must_use]
    pub fn is_owner(&self, sender_id: &str) -> bool {
        self.owner_user_id.as_deref() == Some(sender_id)
    }
}

impl std::fmt::Debug for AccountConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountConfig")
            .field("server_url", &self.server_url)
            .field("api_key", &"[REDACTED]")
            .field("dm_policy", &self.dm_policy)
            .field("group_policy", &self.group_policy)
            .finish_non_exhaustive()
    }
}

fn serialize_secret<S: serde::Serializer>(
    secret: &Secret<String>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(secret.expose_secret())
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            api_key: Secret::new(String::new()),
            owner_user_id: None,
            dm_policy: DmPolicy::default(),
            dm_allowlist: Vec::new(),
            group_policy: GroupPolicy::default(),
            group_allowlist: Vec::new(),
            mention_names: Vec::new(),
            group_history_limit: DEFAULT_GROUP_HISTORY_LIMIT,
            secretary_agent_id: None,
        }
    }
}
