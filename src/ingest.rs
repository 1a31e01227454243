//! Incremental ingestion across many files.
//!
//! Two-level incremental work avoidance: a file-hash pre-filter drops files
//! whose bytes match the graph (unless schema invalidation forces a
//! re-parse), then a per-node hash diff inside the processor avoids
//! rewriting unchanged content nodes. Per-file failures are isolated; the
//! batch always completes.

use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::detect;
use crate::discovery::FileDiscovery;
use crate::error::{Error, Result};
use crate::graph::GraphStore;
use crate::journal::Journal;
use crate::parse::ParserRegistry;
use crate::process::{FileProcessor, ProcessOptions, ProcessStatus};

/// The four-valued incremental contract: which levels of change detection
/// run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IncrementalMode {
    /// File-hash pre-filter only.
    Files,
    /// Per-node hash diff only.
    Content,
    /// Both levels.
    #[default]
    Both,
    /// Neither: full re-parse and replace.
    None,
}

impl IncrementalMode {
    pub fn file_prefilter(&self) -> bool {
        matches!(self, IncrementalMode::Files | IncrementalMode::Both)
    }

    pub fn node_diff(&self) -> bool {
        matches!(self, IncrementalMode::Content | IncrementalMode::Both)
    }
}

impl FromStr for IncrementalMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "files" => Ok(IncrementalMode::Files),
            "content" => Ok(IncrementalMode::Content),
            "both" => Ok(IncrementalMode::Both),
            "none" => Ok(IncrementalMode::None),
            other => Err(Error::Config(format!(
                "unknown incremental mode '{other}': expected files, content, both, or none"
            ))),
        }
    }
}

/// Where and what to ingest.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub project_id: String,
    pub root: PathBuf,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

/// Options for one ingest run.
#[derive(Debug, Clone, Default)]
pub struct IngestOptions {
    pub incremental: IncrementalMode,
    /// Journal every node create/update/delete.
    pub track_changes: bool,
    /// Re-ingest only these absolute paths instead of enumerating.
    pub files: Option<Vec<PathBuf>>,
}

/// File-level ingest counters plus node-level detail.
#[derive(Debug, Default, Serialize)]
pub struct IngestReport {
    pub unchanged: usize,
    pub updated: usize,
    pub created: usize,
    pub deleted: usize,
    pub nodes_created: usize,
    pub nodes_updated: usize,
    pub nodes_unchanged: usize,
    pub nodes_deleted: usize,
    pub edges_created: usize,
    pub errors: Vec<IngestError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestError {
    pub path: String,
    pub message: String,
}

pub struct IngestManager {
    store: Arc<dyn GraphStore>,
    registry: Arc<ParserRegistry>,
    journal: Option<Arc<Journal>>,
}

impl IngestManager {
    pub fn new(
        store: Arc<dyn GraphStore>,
        registry: Arc<ParserRegistry>,
        journal: Option<Arc<Journal>>,
    ) -> Self {
        Self {
            store,
            registry,
            journal,
        }
    }

    /// Ingest files under a source root (or an explicit file list) into the
    /// graph.
    pub async fn ingest_from_paths(
        &self,
        source: &SourceConfig,
        options: &IngestOptions,
    ) -> Result<IngestReport> {
        let mut report = IngestReport::default();

        let candidates: Vec<PathBuf> = match &options.files {
            Some(files) => files.clone(),
            None => {
                let discovery =
                    FileDiscovery::new(&source.root, &source.include, &source.exclude)?;
                discovery.discover()?
            }
        };
        debug!(
            project = %source.project_id,
            candidates = candidates.len(),
            mode = ?options.incremental,
            "ingest starting"
        );

        let mut work: Vec<PathBuf> = Vec::new();

        if options.incremental.file_prefilter() {
            let detected = detect::detect_changes(self.store.as_ref(), &candidates).await?;
            let schema_dirty = self
                .store
                .files_with_schema_dirty(&source.project_id)
                .await?;

            for change in detected.unchanged {
                let path_str = change.absolute_path.to_string_lossy().into_owned();
                if schema_dirty.contains(&path_str) {
                    // Schema invalidation forces re-parse even when bytes
                    // are unchanged.
                    work.push(change.absolute_path);
                } else {
                    report.unchanged += 1;
                }
            }
            for change in detected.changed {
                work.push(change.absolute_path);
            }
            for failed in detected.errors {
                report.errors.push(IngestError {
                    path: failed.absolute_path.to_string_lossy().into_owned(),
                    message: failed.error.unwrap_or_else(|| "read failed".into()),
                });
            }
        } else {
            work = candidates.clone();
        }

        // Full enumeration also sweeps files that vanished from disk but
        // are still in the graph.
        if options.files.is_none() {
            let candidate_set: HashSet<String> = candidates
                .iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect();
            let work_set: HashSet<String> = work
                .iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect();
            for file in self.store.files_in_project(&source.project_id).await? {
                if file.prop_bool("mentioned").unwrap_or(false) {
                    continue;
                }
                let Some(path) = file.absolute_path() else {
                    continue;
                };
                if !candidate_set.contains(path) && !work_set.contains(path) {
                    work.push(PathBuf::from(path));
                }
            }
        }

        if work.is_empty() {
            info!(
                project = %source.project_id,
                unchanged = report.unchanged,
                "nothing to ingest"
            );
            return Ok(report);
        }

        let processor = FileProcessor::new(
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            &source.project_id,
            &source.root,
        );
        let process_options = ProcessOptions {
            diff_nodes: options.incremental.node_diff(),
            clean_stale_edges: true,
            track_changes: options.track_changes,
        };

        let mut journal_entries = Vec::new();
        for path in work {
            match processor.process(&path, process_options).await {
                Ok(outcome) => {
                    match outcome.status {
                        ProcessStatus::Deleted => report.deleted += 1,
                        ProcessStatus::Skipped => report.unchanged += 1,
                        ProcessStatus::Processed => {
                            if outcome.file_created {
                                report.created += 1;
                            } else {
                                report.updated += 1;
                            }
                        }
                    }
                    report.nodes_created += outcome.nodes_created;
                    report.nodes_updated += outcome.nodes_updated;
                    report.nodes_unchanged += outcome.nodes_unchanged;
                    report.nodes_deleted += outcome.nodes_deleted;
                    report.edges_created += outcome.edges_created;
                    journal_entries.extend(outcome.changes);
                }
                Err(e) => {
                    // Per-file error isolation: the batch continues.
                    warn!(path = %path.display(), error = %e, "file ingest failed");
                    report.errors.push(IngestError {
                        path: path.to_string_lossy().into_owned(),
                        message: e.to_string(),
                    });
                }
            }
        }

        if options.track_changes {
            if let Some(journal) = &self.journal {
                journal.record(journal_entries).await?;
            }
        }

        self.store.save().await?;

        info!(
            project = %source.project_id,
            unchanged = report.unchanged,
            created = report.created,
            updated = report.updated,
            deleted = report.deleted,
            errors = report.errors.len(),
            "ingest complete"
        );
        Ok(report)
    }
}
