pub mod supabase;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::config::BindingConfig;
use crate::error::Result;
use crate::event::ChannelRef;

/// Active link between one source channel and one destination wall.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelBinding {
    pub channel_id: i64,
    pub channel_username: Option<String>,
    pub target_id: i64,
    pub target_name: Option<String>,
    pub access_token: String,
    /// Post as the community rather than as the token's user.
    pub post_as_group: bool,
    pub active: bool,
    pub owner_id: Option<String>,
}

impl From<&BindingConfig> for ChannelBinding {
    fn from(cfg: &BindingConfig) -> Self {
        Self {
            channel_id: cfg.channel_id,
            channel_username: cfg.channel_username.clone(),
            target_id: cfg.target_id,
            target_name: cfg.target_name.clone(),
            access_token: cfg.access_token.clone(),
            post_as_group: cfg.post_as_group,
            active: cfg.active,
            owner_id: cfg.owner_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Tracked(ChannelBinding),
    Untracked,
}

/// Read-only source of channel bindings. One exact-id lookup per call.
#[async_trait]
pub trait BindingDirectory: Send + Sync {
    async fn lookup(&self, channel_id: i64) -> Result<Option<ChannelBinding>>;
}

const SUPERGROUP_PREFIX: &str = "-100";

/// Other numeric spellings of the same channel: with or without the
/// `-100` supergroup prefix.
pub fn alternate_ids(channel_id: i64) -> Vec<i64> {
    let text = channel_id.to_string();
    let mut ids = Vec::new();

    if let Some(bare) = text.strip_prefix(SUPERGROUP_PREFIX) {
        if let Ok(id) = bare.parse::<i64>() {
            ids.push(id);
        }
    } else if let Some(abs) = text.strip_prefix('-') {
        if let Ok(id) = format!("{SUPERGROUP_PREFIX}{abs}").parse::<i64>() {
            ids.push(id);
        }
    } else if let Ok(id) = format!("{SUPERGROUP_PREFIX}{text}").parse::<i64>() {
        ids.push(id);
    }

    ids.retain(|id| *id != channel_id && *id != 0);
    ids
}

pub struct ContentResolver {
    directory: Arc<dyn BindingDirectory>,
}

impl ContentResolver {
    pub fn new(directory: Arc<dyn BindingDirectory>) -> Self {
        Self { directory }
    }

    /// Find the active binding for a channel, trying the canonical id first
    /// and then its alternate spellings.
    pub async fn resolve(&self, channel: &ChannelRef) -> Result<Resolution> {
        let candidates = std::iter::once(channel.id).chain(alternate_ids(channel.id));

        for id in candidates {
            debug!(channel_id = channel.id, candidate = id, "looking up binding");
            if let Some(binding) = self.directory.lookup(id).await? {
                if binding.active {
                    return Ok(Resolution::Tracked(binding));
                }
                debug!(channel_id = channel.id, candidate = id, "binding inactive");
            }
        }

        info!(
            channel_id = channel.id,
            username = channel.username.as_deref().unwrap_or("-"),
            "message from untracked channel"
        );
        Ok(Resolution::Untracked)
    }
}

/// Bindings declared in the config file.
pub struct StaticDirectory {
    bindings: Vec<ChannelBinding>,
}

impl StaticDirectory {
    pub fn new(bindings: Vec<ChannelBinding>) -> Self {
        Self { bindings }
    }

    pub fn from_config(bindings: &[BindingConfig]) -> Self {
        Self::new(bindings.iter().map(ChannelBinding::from).collect())
    }
}

#[async_trait]
impl BindingDirectory for StaticDirectory {
    async fn lookup(&self, channel_id: i64) -> Result<Option<ChannelBinding>> {
        Ok(self
            .bindings
            .iter()
            .find(|b| b.channel_id == channel_id)
            .cloned())
    }
}
