use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{MappingBackend, PostMapping};
use crate::error::{CrosspostError, Result};
use crate::event::SourceKey;
use crate::supabase::{eq, SupabaseClient};

const TABLE: &str = "post_info";
const COLUMNS: &str =
    "telegram_chat_id,telegram_message_id,vk_post_id,user_id,edit_count,is_edited,created_at,updated_at";

#[derive(Debug, Serialize, Deserialize)]
struct PostInfoRow {
    telegram_chat_id: i64,
    telegram_message_id: i32,
    vk_post_id: i64,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    edit_count: Option<u32>,
    #[serde(default)]
    is_edited: Option<bool>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

impl From<PostInfoRow> for PostMapping {
    fn from(row: PostInfoRow) -> Self {
        let now = Utc::now();
        let created_at = row.created_at.unwrap_or(now);
        Self {
            source: SourceKey::new(row.telegram_chat_id, row.telegram_message_id),
            target_id: row.vk_post_id,
            owner_id: row.user_id,
            edit_count: row.edit_count.unwrap_or(0),
            is_edited: row.is_edited.unwrap_or(false),
            created_at,
            updated_at: row.updated_at.unwrap_or(created_at),
        }
    }
}

/// Mappings in the Supabase `post_info` table.
pub struct SupabaseMappings {
    client: SupabaseClient,
}

impl SupabaseMappings {
    pub fn new(client: SupabaseClient) -> Self {
        Self { client }
    }

    fn key_filters(source: SourceKey) -> [(String, String); 2] {
        [
            eq("telegram_chat_id", source.channel_id),
            eq("telegram_message_id", source.message_id),
        ]
    }

    fn first(rows: Vec<PostInfoRow>, op: &str) -> Result<PostMapping> {
        rows.into_iter()
            .next()
            .map(PostMapping::from)
            .ok_or_else(|| CrosspostError::Mapping(format!("{TABLE} {op} returned no row")))
    }
}

#[async_trait]
impl MappingBackend for SupabaseMappings {
    fn name(&self) -> &str {
        "supabase"
    }

    async fn ping(&self) -> Result<()> {
        self.client.ping(TABLE).await
    }

    async fn get(&self, source: SourceKey) -> Result<Option<PostMapping>> {
        let rows: Vec<PostInfoRow> = self
            .client
            .select(TABLE, COLUMNS, &Self::key_filters(source))
            .await?;
        Ok(rows.into_iter().next().map(PostMapping::from))
    }

    async fn upsert(
        &self,
        source: SourceKey,
        target_id: i64,
        owner_id: Option<&str>,
    ) -> Result<PostMapping> {
        let now = Utc::now();

        if self.get(source).await?.is_some() {
            let mut patch = json!({ "vk_post_id": target_id, "updated_at": now });
            if let Some(owner) = owner_id {
                patch["user_id"] = json!(owner);
            }
            let rows: Vec<PostInfoRow> = self
                .client
                .update(TABLE, &Self::key_filters(source), &patch)
                .await?;
            return Self::first(rows, "update");
        }

        let row = PostInfoRow {
            telegram_chat_id: source.channel_id,
            telegram_message_id: source.message_id,
            vk_post_id: target_id,
            user_id: owner_id.map(String::from),
            edit_count: Some(0),
            is_edited: Some(false),
            created_at: Some(now),
            updated_at: Some(now),
        };
        let rows: Vec<PostInfoRow> = self.client.insert(TABLE, &row).await?;
        Self::first(rows, "insert")
    }

    async fn increment_edit(&self, source: SourceKey) -> Result<Option<PostMapping>> {
        let Some(current) = self.get(source).await? else {
            return Ok(None);
        };

        let patch = json!({
            "edit_count": current.edit_count + 1,
            "is_edited": true,
            "updated_at": Utc::now(),
        });
        let rows: Vec<PostInfoRow> = self
            .client
            .update(TABLE, &Self::key_filters(source), &patch)
            .await?;
        Self::first(rows, "update").map(Some)
    }
}
