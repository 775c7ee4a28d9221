//! REST data plane of the WristClaw server.

use std::sync::OnceLock;

use {
    regex::Regex,
    reqwest::header,
    secrecy::{ExposeSecret, Secret},
    url::Url,
};

use crate::{
    error::{Error, Result},
    events::{
        BotIdentity, Conversation, ConversationsResponse, HealthStatus, MessagePayload,
        MessagesResponse, PairInfo, PairListResponse,
    },
    fetch::{FetchOptions, fetch_with_retry},
};

/// Page size for catch-up fetches.
pub const CATCHUP_PAGE_LIMIT: u32 = 50;

/// Ids that may be spliced into request paths.
fn id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+$").unwrap_or_else(|_| unreachable!()))
}

/// Whether an id is safe to place in a URL path or query.
#[must_use]
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty() && id_pattern().is_match(id)
}

/// Bearer-authenticated client for the server's REST endpoints.
#[derive(Clone)]
pub struct RestClient {
    http: reqwest::Client,
    base: Url,
    api_key: Secret<String>,
}

impl RestClient {
    pub fn new(base: Url, api_key: Secret<String>) -> Result<Self> {
        let http = reqwest::Client::builder().build().map_err(Error::Http)?;
        Ok(Self {
            http,
            base,
            api_key,
        })
    }

    #[must_use]
    pub fn base(&self) -> &Url {
        &self.base
    }

    fn get(&self, path: &str) -> Result<reqwest::RequestBuilder> {
        let url = self.base.join(path)?;
        Ok(self.http.get(url).header(
            header::AUTHORIZATION,
            format!("Bearer {}", self.api_key.expose_secret()),
        ))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let resp = fetch_with_retry(self.get(path)?, &FetchOptions::default()).await?;
        let resp = resp.error_for_status()?;
        Ok(resp.json::<T>().await?)
    }

    /// `GET /v1/me` — who the API key authenticates as.
    pub async fn bot_identity(&self) -> Result<BotIdentity> {
        self.get_json("/v1/me").await
    }

    /// `GET /v1/conversations` — every conversation the account is in.
    pub async fn conversations(&self) -> Result<Vec<Conversation>> {
        let resp: ConversationsResponse = self.get_json("/v1/conversations").await?;
        Ok(resp.conversations)
    }

    /// `GET /v1/pair/list` — pair conversations, for the `pair:created`
    /// refresh path.
    pub async fn pair_list(&self) -> Result<Vec<PairInfo>> {
        let resp: PairListResponse = self.get_json("/v1/pair/list").await?;
        Ok(resp.pairs)
    }

    /// `GET /v1/channels/{id}/messages?after=..&limit=..` — messages missed
    /// during a disconnect, ascending. Both ids are validated before they
    /// touch the URL.
    pub async fn messages_after(
        &self,
        channel_id: &str,
        after_message_id: &str,
        limit: u32,
    ) -> Result<Vec<MessagePayload>> {
        if !is_valid_id(channel_id) {
            return Err(Error::message(format!("invalid channel id: {channel_id:?}")));
        }
        if !is_valid_id(after_message_id) {
            return Err(Error::message(format!(
                "invalid message id: {after_message_id:?}"
            )));
        }
        let path =
            format!("/v1/channels/{channel_id}/messages?after={after_message_id}&limit={limit}");
        let resp: MessagesResponse = self.get_json(&path).await?;
        Ok(resp.messages)
    }

    /// `GET /health` — liveness probe.
    pub async fn health(&self) -> Result<HealthStatus> {
        self.get_json("/health").await
    }
}
