use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::info;

use super::{MappingBackend, PostMapping};
use crate::error::{CrosspostError, Result};
use crate::event::SourceKey;

/// Mappings kept in a JSON file under the data directory.
pub struct LocalMappings {
    path: PathBuf,
    records: RwLock<HashMap<SourceKey, PostMapping>>,
}

impl LocalMappings {
    /// Load `mappings.json` if it exists.
    pub fn open(path: PathBuf) -> Result<Self> {
        let records = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let list: Vec<PostMapping> = serde_json::from_str(&content).map_err(|e| {
                CrosspostError::Mapping(format!("Failed to parse {}: {e}", path.display()))
            })?;
            info!("Loaded {} mapping(s) from {}", list.len(), path.display());
            list.into_iter().map(|m| (m.source, m)).collect()
        } else {
            HashMap::new()
        };

        Ok(Self {
            path,
            records: RwLock::new(records),
        })
    }

    fn save(&self, records: &HashMap<SourceKey, PostMapping>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut list: Vec<&PostMapping> = records.values().collect();
        list.sort_by_key(|m| (m.source.channel_id, m.source.message_id));
        let json = serde_json::to_string_pretty(&list)?;

        // Atomic write: write to tmp, then rename
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json.as_bytes())?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

#[async_trait]
impl MappingBackend for LocalMappings {
    fn name(&self) -> &str {
        "local"
    }

    async fn ping(&self) -> Result<()> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| CrosspostError::Mapping("mapping file has no parent dir".into()))?;
        std::fs::create_dir_all(dir)?;
        Ok(())
    }

    async fn get(&self, source: SourceKey) -> Result<Option<PostMapping>> {
        Ok(self.records.read().await.get(&source).cloned())
    }

    async fn upsert(
        &self,
        source: SourceKey,
        target_id: i64,
        owner_id: Option<&str>,
    ) -> Result<PostMapping> {
        let mut records = self.records.write().await;
        let mapping = match records.get_mut(&source) {
            Some(existing) => {
                existing.target_id = target_id;
                if owner_id.is_some() {
                    existing.owner_id = owner_id.map(String::from);
                }
                existing.updated_at = Utc::now();
                existing.clone()
            }
            None => {
                let mapping = PostMapping::new(source, target_id, owner_id.map(String::from));
                records.insert(source, mapping.clone());
                mapping
            }
        };
        self.save(&records)?;
        Ok(mapping)
    }

    async fn increment_edit(&self, source: SourceKey) -> Result<Option<PostMapping>> {
        let mut records = self.records.write().await;
        let Some(mapping) = records.get_mut(&source) else {
            return Ok(None);
        };
        mapping.edit_count += 1;
        mapping.is_edited = true;
        mapping.updated_at = Utc::now();
        let updated = mapping.clone();
        self.save(&records)?;
        Ok(Some(updated))
    }
}
