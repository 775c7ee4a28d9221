//! The WristClaw channel plugin: account lifecycle and health surface
//! around the per-account monitors.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::Instant,
};

use {
    anyhow::Result,
    async_trait::async_trait,
    tracing::{info, warn},
};

use wristclaw_channels::{
    ChannelHealthSnapshot, ChannelPlugin, ChannelStatus, HostRuntime, Outbound,
};

use crate::{
    config::AccountConfig,
    monitor,
    pipeline::PipelineHooks,
    state::{AccountState, AccountStateMap, StatusSnapshot},
};

/// Cache TTL for probe results (30 seconds).
const PROBE_CACHE_TTL: std::time::Duration = std::time::Duration::from_secs(30);

/// WristClaw channel plugin.
pub struct WristclawPlugin {
    accounts: AccountStateMap,
    host: HostRuntime,
    outbound: Arc<dyn Outbound>,
    hooks: PipelineHooks,
    probe_cache: RwLock<HashMap<String, (ChannelHealthSnapshot, Instant)>>,
}

impl WristclawPlugin {
    #[must_use]
    pub fn new(host: HostRuntime, outbound: Arc<dyn Outbound>) -> Self {
        Self {
            accounts: Arc::new(RwLock::new(HashMap::new())),
            host,
            outbound,
            hooks: PipelineHooks::default(),
            probe_cache: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn with_hooks(mut self, hooks: PipelineHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// List all active account IDs.
    #[must_use]
    pub fn account_ids(&self) -> Vec<String> {
        self.accounts
            .read()
            .map(|accounts| accounts.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Get the config for a specific account (serialized to JSON).
    #[must_use]
    pub fn account_config(&self, account_id: &str) -> Option<serde_json::Value> {
        let accounts = self.accounts.read().ok()?;
        let state = accounts.get(account_id)?;
        let config = state.ctx.config.read().ok()?.clone();
        serde_json::to_value(&config).ok()
    }

    /// Update the in-memory config for an account without restarting its
    /// monitor. Use for allowlist and policy changes that don't need
    /// re-authentication; the running session, dedup windows, and buffered
    /// group history all survive.
    pub fn update_account_config(
        &self,
        account_id: &str,
        config: serde_json::Value,
    ) -> Result<()> {
        let parsed: AccountConfig = serde_json::from_value(config)?;
        let accounts = self
            .accounts
            .read()
            .map_err(|_| anyhow::anyhow!("account map poisoned"))?;
        let state = accounts
            .get(account_id)
            .ok_or_else(|| anyhow::anyhow!("account not found: {account_id}"))?;
        let mut current = state
            .ctx
            .config
            .write()
            .map_err(|_| anyhow::anyhow!("account config poisoned"))?;
        *current = parsed;
        Ok(())
    }

    /// Status snapshot for one account (running / last error / timestamps).
    #[must_use]
    pub fn status_snapshot(&self, account_id: &str) -> Option<StatusSnapshot> {
        let accounts = self.accounts.read().ok()?;
        accounts
            .get(account_id)
            .map(|state| state.ctx.status.snapshot())
    }
}

#[async_trait]
impl ChannelPlugin for WristclawPlugin {
    fn id(&self) -> &str {
        "wristclaw"
    }

    fn name(&self) -> &str {
        "WristClaw"
    }

    async fn start_account(&mut self, account_id: &str, config: serde_json::Value) -> Result<()> {
        let config: AccountConfig = serde_json::from_value(config)?;

        // Restarting an account replaces its monitor.
        let previous = self
            .accounts
            .read()
            .ok()
            .and_then(|accounts| accounts.get(account_id).map(|s| s.ctx.cancel.clone()));
        if let Some(cancel) = previous {
            warn!(account_id, "account already running, restarting");
            cancel.cancel();
        }

        info!(account_id, "starting wristclaw account");
        let ctx = monitor::spawn(
            account_id,
            config,
            self.host.clone(),
            Arc::clone(&self.outbound),
            self.hooks.clone(),
        )?;

        let mut accounts = self
            .accounts
            .write()
            .map_err(|_| anyhow::anyhow!("account map poisoned"))?;
        accounts.insert(
            account_id.to_string(),
            AccountState {
                account_id: account_id.to_string(),
                ctx,
            },
        );
        Ok(())
    }

    async fn stop_account(&mut self, account_id: &str) -> Result<()> {
        let removed = self
            .accounts
            .write()
            .ok()
            .and_then(|mut accounts| accounts.remove(account_id));

        match removed {
            Some(state) => {
                info!(account_id, "stopping wristclaw account");
                state.ctx.cancel.cancel();
            },
            None => {
                warn!(account_id, "wristclaw account not found");
            },
        }
        Ok(())
    }

    fn status(&self) -> Option<&dyn ChannelStatus> {
        Some(self)
    }
}

#[async_trait]
impl ChannelStatus for WristclawPlugin {
    async fn probe(&self, account_id: &str) -> Result<ChannelHealthSnapshot> {
        // Return cached result if fresh enough.
        if let Ok(cache) = self.probe_cache.read()
            && let Some((snapshot, at)) = cache.get(account_id)
            && at.elapsed() < PROBE_CACHE_TTL
        {
            return Ok(snapshot.clone());
        }

        let ctx = {
            let accounts = self
                .accounts
                .read()
                .map_err(|_| anyhow::anyhow!("account map poisoned"))?;
            accounts.get(account_id).map(|s| Arc::clone(&s.ctx))
        };

        let result = match ctx {
            Some(ctx) => match ctx.rest.health().await {
                Ok(health) => ChannelHealthSnapshot {
                    connected: ctx.status.is_running(),
                    account_id: account_id.to_string(),
                    details: Some(match health.version {
                        Some(version) => format!("server {} ({version})", health.status),
                        None => format!("server {}", health.status),
                    }),
                },
                Err(e) => ChannelHealthSnapshot {
                    connected: false,
                    account_id: account_id.to_string(),
                    details: Some(format!("health check failed: {e}")),
                },
            },
            None => ChannelHealthSnapshot {
                connected: false,
                account_id: account_id.to_string(),
                details: Some("account not started".into()),
            },
        };

        if let Ok(mut cache) = self.probe_cache.write() {
            cache.insert(account_id.to_string(), (result.clone(), Instant::now()));
        }

        Ok(result)
    }
}
