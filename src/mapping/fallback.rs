use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::Result;
use crate::event::SourceKey;

/// One `sourceId:targetId` line of the fallback log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FallbackEntry {
    pub source: SourceKey,
    pub target_id: i64,
}

impl FallbackEntry {
    pub fn new(source: SourceKey, target_id: i64) -> Self {
        Self { source, target_id }
    }

    pub fn to_line(&self) -> String {
        format!("{}:{}", self.source, self.target_id)
    }

    pub fn parse(line: &str) -> Option<Self> {
        let (source, target) = line.trim().rsplit_once(':')?;
        Some(Self {
            source: source.parse().ok()?,
            target_id: target.trim().parse().ok()?,
        })
    }
}

/// Append-only text log used when the primary store cannot be reached.
/// A later line for the same source supersedes earlier ones.
pub struct FallbackLog {
    path: PathBuf,
    io: Mutex<()>,
}

impl FallbackLog {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            io: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, entry: FallbackEntry) -> Result<()> {
        let _guard = self.io.lock().await;
        self.append_locked(entry).await
    }

    /// Append unless `entry` is already the current record for its source.
    pub async fn append_if_absent(&self, entry: FallbackEntry) -> Result<bool> {
        let _guard = self.io.lock().await;
        let current = latest_target(&self.read_locked().await?, entry.source);
        if current == Some(entry.target_id) {
            return Ok(false);
        }
        if let Some(previous) = current {
            warn!(
                source = %entry.source,
                previous,
                target_id = entry.target_id,
                "fallback mapping retargeted"
            );
        }
        self.append_locked(entry).await?;
        Ok(true)
    }

    pub async fn find(&self, source: SourceKey) -> Result<Option<i64>> {
        let _guard = self.io.lock().await;
        Ok(latest_target(&self.read_locked().await?, source))
    }

    /// Every line, in file order.
    pub async fn entries(&self) -> Result<Vec<FallbackEntry>> {
        let _guard = self.io.lock().await;
        self.read_locked().await
    }

    /// One entry per source carrying its current target, in first-seen order.
    pub async fn latest(&self) -> Result<Vec<FallbackEntry>> {
        let entries = self.entries().await?;
        let mut slots: HashMap<SourceKey, usize> = HashMap::new();
        let mut current: Vec<FallbackEntry> = Vec::new();
        for entry in entries {
            match slots.get(&entry.source) {
                Some(&slot) => current[slot].target_id = entry.target_id,
                None => {
                    slots.insert(entry.source, current.len());
                    current.push(entry);
                }
            }
        }
        Ok(current)
    }

    /// Rewrite the log keeping only the entries `keep` accepts. Returns how
    /// many are left.
    pub async fn retain(&self, keep: impl Fn(&FallbackEntry) -> bool) -> Result<usize> {
        let _guard = self.io.lock().await;
        let remaining: Vec<FallbackEntry> = self
            .read_locked()
            .await?
            .into_iter()
            .filter(|e| keep(e))
            .collect();

        let mut data = String::new();
        for entry in &remaining {
            data.push_str(&entry.to_line());
            data.push('\n');
        }
        let tmp_path = self.path.with_extension("tmp");
        tokio::fs::write(&tmp_path, data.as_bytes()).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;
        Ok(remaining.len())
    }

    async fn append_locked(&self, entry: FallbackEntry) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(format!("{}\n", entry.to_line()).as_bytes())
            .await?;
        file.flush().await?;
        Ok(())
    }

    async fn read_locked(&self) -> Result<Vec<FallbackEntry>> {
        let data = match tokio::fs::read_to_string(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for line in data.lines().filter(|l| !l.trim().is_empty()) {
            match FallbackEntry::parse(line) {
                Some(entry) => entries.push(entry),
                None => warn!("Skipping malformed fallback line: {line}"),
            }
        }
        Ok(entries)
    }
}

fn latest_target(entries: &[FallbackEntry], source: SourceKey) -> Option<i64> {
    entries
        .iter()
        .rev()
        .find(|e| e.source == source)
        .map(|e| e.target_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(m: i32) -> SourceKey {
        SourceKey::new(-1001234, m)
    }

    #[test]
    fn test_line_format() {
        let entry = FallbackEntry::new(key(45), 678);
        assert_eq!(entry.to_line(), "-1001234/45:678");
        assert_eq!(FallbackEntry::parse("-1001234/45:678"), Some(entry));
        assert_eq!(FallbackEntry::parse("45:678"), None);
        assert_eq!(FallbackEntry::parse("garbage"), None);
    }

    #[tokio::test]
    async fn test_later_line_supersedes_earlier() {
        let tmp = tempfile::tempdir().unwrap();
        let log = FallbackLog::new(tmp.path().join("data.txt"));

        log.append(FallbackEntry::new(key(1), 10)).await.unwrap();
        log.append(FallbackEntry::new(key(2), 20)).await.unwrap();
        log.append(FallbackEntry::new(key(1), 11)).await.unwrap();

        assert_eq!(log.find(key(1)).await.unwrap(), Some(11));
        assert_eq!(log.find(key(2)).await.unwrap(), Some(20));
        assert_eq!(log.find(key(3)).await.unwrap(), None);
        assert_eq!(log.entries().await.unwrap().len(), 3);
        assert_eq!(
            log.latest().await.unwrap(),
            vec![FallbackEntry::new(key(1), 11), FallbackEntry::new(key(2), 20)]
        );
    }

    #[tokio::test]
    async fn test_append_if_absent_compares_current_target() {
        let tmp = tempfile::tempdir().unwrap();
        let log = FallbackLog::new(tmp.path().join("data.txt"));

        assert!(log.append_if_absent(FallbackEntry::new(key(1), 10)).await.unwrap());
        assert!(log.append_if_absent(FallbackEntry::new(key(1), 11)).await.unwrap());
        assert!(!log.append_if_absent(FallbackEntry::new(key(1), 11)).await.unwrap());
        // Going back to an older target is a change too.
        assert!(log.append_if_absent(FallbackEntry::new(key(1), 10)).await.unwrap());
        assert_eq!(log.find(key(1)).await.unwrap(), Some(10));
    }

    #[tokio::test]
    async fn test_missing_file_reads_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let log = FallbackLog::new(tmp.path().join("nested").join("data.txt"));
        assert!(log.entries().await.unwrap().is_empty());

        assert!(log.append_if_absent(FallbackEntry::new(key(1), 5)).await.unwrap());
        assert!(!log.append_if_absent(FallbackEntry::new(key(1), 5)).await.unwrap());
        assert_eq!(log.entries().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_lines_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("data.txt");
        std::fs::write(&path, "-1001234/1:10\nnot a line\n\n-1001234/2:20\n").unwrap();

        let log = FallbackLog::new(path);
        assert_eq!(log.entries().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_retain_rewrites_log() {
        let tmp = tempfile::tempdir().unwrap();
        let log = FallbackLog::new(tmp.path().join("data.txt"));
        for m in 1..=3 {
            log.append(FallbackEntry::new(key(m), m as i64 * 10)).await.unwrap();
        }

        let left = log.retain(|e| e.source.message_id == 2).await.unwrap();
        assert_eq!(left, 1);
        assert_eq!(log.find(key(1)).await.unwrap(), None);
        assert_eq!(log.find(key(2)).await.unwrap(), Some(20));
    }
}
