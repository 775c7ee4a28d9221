use serde::{Deserialize, Serialize};

/// Check whether an allowlist admits an id.
///
/// Matching is exact, with `"*"` admitting everyone. An empty list admits
/// no one — policies that want open access say so explicitly instead of
/// leaving the list empty.
pub fn list_allows(allowlist: &[String], id: &str) -> bool {
    allowlist.iter().any(|entry| entry == "*" || entry == id)
}

/// DM access policy.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DmPolicy {
    /// Anyone can DM the bot.
    #[default]
    Open,
    /// Only senders on the DM allowlist.
    Allowlist,
    /// DMs disabled.
    Disabled,
}

/// Group access policy.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GroupPolicy {
    /// Bot must be @mentioned to respond; other messages are recorded as
    /// context only.
    #[default]
    Mention,
    /// Bot responds to all group messages.
    Open,
    /// Groups disabled.
    Disabled,
}
