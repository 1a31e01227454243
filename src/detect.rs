//! Batch file-level change classification against the graph store.
//!
//! A pure function of disk + graph state: reads each file with bounded
//! concurrency, hashes it, and compares against the hash stored on the
//! `File` node (fetched in a single round trip). No writes, no mtimes.

use std::path::PathBuf;

use futures::stream::{self, StreamExt};
use tracing::debug;

use crate::error::Result;
use crate::graph::GraphStore;
use crate::hash;

/// Bounded concurrency for file reads.
pub const READ_CONCURRENCY: usize = 20;

/// Classification of one file against the stored graph state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    New,
    Modified,
    Unchanged,
    Deleted,
    Error,
}

/// One classified file.
#[derive(Debug, Clone)]
pub struct FileChange {
    pub absolute_path: PathBuf,
    pub kind: ChangeKind,
    /// Hash of the bytes currently on disk (absent for deleted/error).
    pub new_hash: Option<String>,
    /// Hash stored on the `File` node, when one exists.
    pub stored_hash: Option<String>,
    pub error: Option<String>,
}

/// Result of a batch detection pass.
#[derive(Debug, Default)]
pub struct DetectReport {
    /// New, modified, and deleted files.
    pub changed: Vec<FileChange>,
    pub unchanged: Vec<FileChange>,
    pub errors: Vec<FileChange>,
}

impl DetectReport {
    pub fn has_changes(&self) -> bool {
        !self.changed.is_empty()
    }
}

async fn classify_one(path: PathBuf, stored_hash: Option<String>) -> FileChange {
    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            let new_hash = hash::content_hash(&bytes);
            let kind = match &stored_hash {
                None => ChangeKind::New,
                Some(stored) if *stored == new_hash => ChangeKind::Unchanged,
                Some(_) => ChangeKind::Modified,
            };
            FileChange {
                absolute_path: path,
                kind,
                new_hash: Some(new_hash),
                stored_hash,
                error: None,
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            // Only a deletion when the graph knew the file.
            let kind = if stored_hash.is_some() {
                ChangeKind::Deleted
            } else {
                ChangeKind::Error
            };
            FileChange {
                absolute_path: path,
                kind,
                new_hash: None,
                stored_hash,
                error: Some(e.to_string()),
            }
        }
        Err(e) => FileChange {
            absolute_path: path,
            kind: ChangeKind::Error,
            new_hash: None,
            stored_hash,
            error: Some(e.to_string()),
        },
    }
}

/// Classify each path as new, modified, unchanged, deleted, or error.
pub async fn detect_changes(store: &dyn GraphStore, paths: &[PathBuf]) -> Result<DetectReport> {
    let path_strings: Vec<String> = paths
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect();
    let stored = store.file_hashes(&path_strings).await?;

    let results: Vec<FileChange> = stream::iter(paths.iter().cloned().map(|path| {
        let stored_hash = stored.get(&path.to_string_lossy().into_owned()).cloned();
        classify_one(path, stored_hash)
    }))
    .buffer_unordered(READ_CONCURRENCY)
    .collect()
    .await;

    let mut report = DetectReport::default();
    for change in results {
        match change.kind {
            ChangeKind::Unchanged => report.unchanged.push(change),
            ChangeKind::Error => report.errors.push(change),
            _ => report.changed.push(change),
        }
    }
    debug!(
        changed = report.changed.len(),
        unchanged = report.unchanged.len(),
        errors = report.errors.len(),
        "change detection complete"
    );
    Ok(report)
}

/// Early-out variant: true as soon as any file differs from the graph.
pub async fn has_any_changed(store: &dyn GraphStore, paths: &[PathBuf]) -> Result<bool> {
    let path_strings: Vec<String> = paths
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect();
    let stored = store.file_hashes(&path_strings).await?;

    let mut results = stream::iter(paths.iter().cloned().map(|path| {
        let stored_hash = stored.get(&path.to_string_lossy().into_owned()).cloned();
        classify_one(path, stored_hash)
    }))
    .buffer_unordered(READ_CONCURRENCY);

    while let Some(change) = results.next().await {
        match change.kind {
            ChangeKind::Unchanged | ChangeKind::Error => continue,
            _ => return Ok(true),
        }
    }
    Ok(false)
}
