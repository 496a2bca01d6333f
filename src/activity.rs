use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;
use crate::supabase::SupabaseClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityLevel {
    Info,
    Warning,
    Error,
}

/// One row of the `logs` table, or one line of `activity.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEntry {
    #[serde(default)]
    pub user_id: Option<String>,
    pub level: ActivityLevel,
    pub message: String,
    #[serde(default)]
    pub details: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl ActivityEntry {
    pub fn new(level: ActivityLevel, user_id: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            user_id: user_id.map(String::from),
            level,
            message: message.into(),
            details: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

#[derive(Clone)]
enum Sink {
    Supabase(SupabaseClient),
    File(PathBuf),
}

/// Owner-visible record of what was published, edited or failed.
#[derive(Clone)]
pub struct ActivityLog {
    sink: Sink,
}

impl ActivityLog {
    pub fn supabase(client: SupabaseClient) -> Self {
        Self {
            sink: Sink::Supabase(client),
        }
    }

    pub fn file(path: PathBuf) -> Self {
        Self {
            sink: Sink::File(path),
        }
    }

    /// Fire-and-forget: failures are logged, never returned.
    pub fn record(&self, entry: ActivityEntry) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.write(&entry).await {
                warn!("Failed to record activity: {e}");
            }
        });
    }

    pub async fn write(&self, entry: &ActivityEntry) -> Result<()> {
        match &self.sink {
            Sink::Supabase(client) => {
                let _: Vec<serde_json::Value> = client.insert("logs", entry).await?;
                Ok(())
            }
            Sink::File(path) => append_line(path, entry),
        }
    }

    /// Most recent entries, oldest first.
    pub async fn recent(&self, lines: usize) -> Result<Vec<ActivityEntry>> {
        match &self.sink {
            Sink::Supabase(client) => {
                let mut rows: Vec<ActivityEntry> = client
                    .select(
                        "logs",
                        "user_id,level,message,details,created_at",
                        &[
                            ("order".to_string(), "created_at.desc".to_string()),
                            ("limit".to_string(), lines.to_string()),
                        ],
                    )
                    .await?;
                rows.reverse();
                Ok(rows)
            }
            Sink::File(path) => read_tail(path, lines),
        }
    }
}

fn append_line(path: &Path, entry: &ActivityEntry) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let line = serde_json::to_string(entry)?;
    use std::io::Write;
    let mut f = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(f, "{line}")?;
    Ok(())
}

fn read_tail(path: &Path, lines: usize) -> Result<Vec<ActivityEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let data = std::fs::read_to_string(path)?;
    let all: Vec<&str> = data.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = all.len().saturating_sub(lines);
    let mut entries = Vec::new();
    for line in &all[start..] {
        match serde_json::from_str::<ActivityEntry>(line) {
            Ok(e) => entries.push(e),
            Err(e) => warn!("Skipping malformed activity line: {e}"),
        }
    }
    Ok(entries)
}
