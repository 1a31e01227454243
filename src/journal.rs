//! Change journal: one JSONL entry per node create/update/delete.
//!
//! The journal is an append-only file under the brain home's `logs/`
//! directory; entries are serialized with bounded concurrency and appended
//! in one write per batch.

use std::path::{Path, PathBuf};

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::Result;
use crate::graph::now_iso;

/// Bounded concurrency for entry serialization.
pub const JOURNAL_CONCURRENCY: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Created,
    Updated,
    Deleted,
}

/// One journaled change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEntry {
    pub entity_type: String,
    pub entity_uuid: String,
    pub old_content: Option<String>,
    pub new_content: Option<String>,
    pub old_hash: Option<String>,
    pub new_hash: Option<String>,
    pub change_type: ChangeType,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub at: String,
}

impl ChangeEntry {
    pub fn new(entity_type: &str, entity_uuid: &str, change_type: ChangeType) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            entity_uuid: entity_uuid.to_string(),
            old_content: None,
            new_content: None,
            old_hash: None,
            new_hash: None,
            change_type,
            metadata: serde_json::Value::Null,
            at: now_iso(),
        }
    }
}

/// Append-only JSONL journal.
pub struct Journal {
    path: PathBuf,
    file: tokio::sync::Mutex<Option<tokio::fs::File>>,
}

impl Journal {
    /// Journal writing to `logs_dir/changes.jsonl`.
    pub fn open(logs_dir: &Path) -> Self {
        Self {
            path: logs_dir.join("changes.jsonl"),
            file: tokio::sync::Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record a batch of entries. Serialization runs with bounded
    /// concurrency; the append itself is a single write.
    pub async fn record(&self, entries: Vec<ChangeEntry>) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }
        let count = entries.len();

        let lines: Vec<String> = stream::iter(entries.into_iter().map(|entry| async move {
            serde_json::to_string(&entry).unwrap_or_default()
        }))
        .buffer_unordered(JOURNAL_CONCURRENCY)
        .collect()
        .await;

        let mut guard = self.file.lock().await;
        if guard.is_none() {
            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            *guard = Some(file);
        }
        let file = guard.as_mut().unwrap();
        let mut payload = String::new();
        for line in lines {
            if !line.is_empty() {
                payload.push_str(&line);
                payload.push('\n');
            }
        }
        file.write_all(payload.as_bytes()).await?;
        file.flush().await?;
        debug!(entries = count, path = %self.path.display(), "journaled changes");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn record_appends_jsonl() {
        let dir = tempfile::TempDir::new().unwrap();
        let journal = Journal::open(dir.path());

        let mut entry = ChangeEntry::new("Scope", "scope:1", ChangeType::Created);
        entry.new_content = Some("const x = 1".into());
        entry.new_hash = Some("aabbccddeeff0011".into());
        journal.record(vec![entry]).await.unwrap();
        journal
            .record(vec![ChangeEntry::new("Scope", "scope:1", ChangeType::Deleted)])
            .await
            .unwrap();

        let raw = std::fs::read_to_string(journal.path()).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: ChangeEntry = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.change_type, ChangeType::Created);
        assert_eq!(first.entity_uuid, "scope:1");
        assert_eq!(first.new_hash.as_deref(), Some("aabbccddeeff0011"));

        let second: ChangeEntry = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.change_type, ChangeType::Deleted);
    }

    #[tokio::test]
    async fn empty_batch_is_noop() {
        let dir = tempfile::TempDir::new().unwrap();
        let journal = Journal::open(dir.path());
        assert_eq!(journal.record(vec![]).await.unwrap(), 0);
        assert!(!journal.path().exists());
    }
}
