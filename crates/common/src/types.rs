use serde::{Deserialize, Serialize};

/// Kind of conversation an inbound message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    /// 1:1 conversation (a pair on the wire).
    Direct,
    /// Multi-party conversation.
    Group,
}

impl ChatKind {
    /// Wire/session-key segment for this kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Group => "group",
        }
    }
}

/// One buffered group message handed to the agent as context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub sender: String,
    pub body: String,
    /// Unix epoch seconds.
    pub timestamp: i64,
    pub message_id: String,
}

/// Raw media bytes fetched through the host's media helper.
#[derive(Debug, Clone)]
pub struct MediaBuffer {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_kind_segments() {
        assert_eq!(ChatKind::Direct.as_str(), "direct");
        assert_eq!(ChatKind::Group.as_str(), "group");
    }

    #[test]
    fn history_entry_roundtrip() {
        let entry = HistoryEntry {
            sender: "u1".into(),
            body: "hello".into(),
            timestamp: 1_700_000_000,
            message_id: "m1".into(),
        };
        let json = serde_json::to_string(&entry).unwrap();
        let back: HistoryEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
    }
}
