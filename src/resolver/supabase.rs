use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{BindingDirectory, ChannelBinding};
use crate::error::{CrosspostError, Result};
use crate::supabase::{eq, SupabaseClient};

#[derive(Debug, Deserialize)]
struct ChannelRow {
    id: serde_json::Value,
    #[serde(default)]
    user_id: Option<String>,
    channel_id: i64,
    #[serde(default)]
    channel_username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SettingsRow {
    vk_target_id: serde_json::Value,
    #[serde(default)]
    post_as_group: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct TargetRow {
    target_id: serde_json::Value,
    #[serde(default)]
    target_name: Option<String>,
    access_token: String,
}

/// Bindings stored across the `telegram_channels`, `crosspost_settings` and
/// `vk_targets` tables.
pub struct SupabaseDirectory {
    client: SupabaseClient,
}

impl SupabaseDirectory {
    pub fn new(client: SupabaseClient) -> Self {
        Self { client }
    }

    async fn lookup_inner(&self, channel_id: i64) -> Result<Option<ChannelBinding>> {
        let channels: Vec<ChannelRow> = self
            .client
            .select(
                "telegram_channels",
                "id,user_id,channel_id,channel_username",
                &[eq("channel_id", channel_id)],
            )
            .await?;
        let Some(channel) = channels.into_iter().next() else {
            return Ok(None);
        };

        let settings: Vec<SettingsRow> = self
            .client
            .select(
                "crosspost_settings",
                "id,vk_target_id,post_as_group",
                &[
                    eq("telegram_channel_id", json_scalar(&channel.id)),
                    eq("is_active", true),
                ],
            )
            .await?;
        let Some(settings) = settings.into_iter().next() else {
            debug!(channel_id, "no active crosspost settings");
            return Ok(None);
        };

        let targets: Vec<TargetRow> = self
            .client
            .select(
                "vk_targets",
                "id,target_id,target_name,access_token",
                &[
                    eq("id", json_scalar(&settings.vk_target_id)),
                    eq("is_active", true),
                ],
            )
            .await?;
        let Some(target) = targets.into_iter().next() else {
            debug!(channel_id, "VK target missing or inactive");
            return Ok(None);
        };

        let target_id = json_i64(&target.target_id).ok_or_else(|| {
            CrosspostError::Directory(format!("bad target_id {}", target.target_id))
        })?;

        Ok(Some(ChannelBinding {
            channel_id: channel.channel_id,
            channel_username: channel.channel_username.filter(|u| !u.is_empty()),
            target_id,
            target_name: target.target_name,
            access_token: target.access_token,
            post_as_group: settings.post_as_group.as_ref().map_or(true, json_truthy),
            active: true,
            owner_id: channel.user_id,
        }))
    }
}

#[async_trait]
impl BindingDirectory for SupabaseDirectory {
    async fn lookup(&self, channel_id: i64) -> Result<Option<ChannelBinding>> {
        self.lookup_inner(channel_id).await.map_err(|e| match e {
            CrosspostError::Directory(_) => e,
            other => CrosspostError::Directory(other.to_string()),
        })
    }
}

/// Render a JSON id (number or string) for a PostgREST filter.
fn json_scalar(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Target ids are stored as text in some deployments and as numbers in others.
fn json_i64(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// `post_as_group` is either a boolean or the 0/1 integer VK itself uses.
fn json_truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_i64().map_or(true, |n| n != 0),
        serde_json::Value::Null => true,
        _ => true,
    }
}
