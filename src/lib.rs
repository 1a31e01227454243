//! ragforge — a local, persistent, multi-project knowledge graph and
//! retrieval engine.
//!
//! Source code, documents, and data files are continuously ingested into a
//! typed graph; multi-facet embeddings are generated in the background; and
//! hybrid semantic+lexical queries run over the result while a filesystem
//! watcher and a debounced agent-edit queue keep everything fresh. The
//! [`Brain`] coordinator owns the store, the provider, the project registry,
//! both cooperating locks, the edit queue, and the watchers; it is
//! constructed explicitly and passed by reference — there is no hidden
//! global.

pub mod chunker;
pub mod config;
pub mod detect;
pub mod discovery;
pub mod edits;
pub mod embed;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod graph;
pub mod hash;
pub mod ingest;
pub mod journal;
pub mod lock;
pub mod logging;
pub mod parse;
pub mod process;
pub mod project;
pub mod resolve;
pub mod search;
pub mod state;
pub mod watch;

pub use config::Config;
pub use error::Error;
pub use graph::{GraphStore, Label, MemoryGraph, Node};
pub use ingest::{IncrementalMode, IngestOptions, IngestReport};
pub use project::{ProjectEntry, ProjectType, Registration};
pub use search::{SearchHit, SearchOptions, SearchResponse};
pub use state::FileState;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::edits::{EditKind, EditQueue, FlushHandler};
use crate::embed::{EmbedReport, EmbeddingCoordinator};
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::ingest::{IngestManager, SourceConfig};
use crate::journal::Journal;
use crate::lock::CoopMutex;
use crate::parse::ParserRegistry;
use crate::project::ProjectRegistry;
use crate::search::SearchService;
use crate::watch::ProjectWatcher;

/// Options for [`Brain::quick_ingest`].
#[derive(Debug, Clone)]
pub struct QuickIngestOptions {
    pub project_name: Option<String>,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    /// Start a watcher after the initial sync.
    pub watch: bool,
    pub track_changes: bool,
}

impl Default for QuickIngestOptions {
    fn default() -> Self {
        Self {
            project_name: None,
            include: Vec::new(),
            exclude: Vec::new(),
            watch: true,
            track_changes: false,
        }
    }
}

/// Result of a quick ingest.
#[derive(Debug, Serialize)]
pub struct QuickIngestReport {
    pub project_id: String,
    pub stats: IngestReport,
    pub embedding: EmbedReport,
    pub watching: bool,
}

/// Status snapshot of the whole brain.
#[derive(Debug, Serialize)]
pub struct BrainStatus {
    pub projects: Vec<ProjectStatus>,
    pub total_nodes: usize,
}

#[derive(Debug, Serialize)]
pub struct ProjectStatus {
    pub project_id: String,
    pub root: PathBuf,
    pub display_name: String,
    pub project_type: &'static str,
    pub excluded: bool,
    pub node_count: usize,
    pub watching: bool,
}

/// Everything the background pipelines share.
struct Shared {
    config: Config,
    store: Arc<dyn GraphStore>,
    provider: Arc<dyn EmbeddingProvider>,
    parsers: Arc<ParserRegistry>,
    projects: ProjectRegistry,
    journal: Arc<Journal>,
    ingestion_lock: CoopMutex,
    embedding_lock: CoopMutex,
}

impl Shared {
    fn ingest_manager(&self) -> IngestManager {
        IngestManager::new(
            Arc::clone(&self.store),
            Arc::clone(&self.parsers),
            Some(Arc::clone(&self.journal)),
        )
    }

    fn embedding_coordinator(&self) -> EmbeddingCoordinator {
        EmbeddingCoordinator::new(
            Arc::clone(&self.store),
            Arc::clone(&self.provider),
            self.config.embedding_batch_size,
            self.config.chunk_max_tokens,
            self.config.chunk_overlap_tokens,
        )
    }

    fn source_for(&self, entry: &ProjectEntry) -> SourceConfig {
        SourceConfig {
            project_id: entry.project_id.clone(),
            root: entry.root.clone(),
            include: self.config.include.clone(),
            exclude: self.config.exclude.clone(),
        }
    }
}

/// Flush one coalesced batch of file changes: group by owning project,
/// re-ingest under the ingestion lock, then embed under the embedding lock.
async fn flush_changes(shared: Arc<Shared>, batch: Vec<(PathBuf, EditKind)>) -> Result<()> {
    let mut by_project: HashMap<String, (ProjectEntry, Vec<PathBuf>)> = HashMap::new();
    for (path, _kind) in batch {
        match shared.projects.project_for_path(&path) {
            Some(entry) => {
                by_project
                    .entry(entry.project_id.clone())
                    .or_insert_with(|| (entry, Vec::new()))
                    .1
                    .push(path);
            }
            None => warn!(path = %path.display(), "edit for unregistered path, ignoring"),
        }
    }

    for (project_id, (entry, files)) in by_project {
        {
            let _guard = shared
                .ingestion_lock
                .acquire(&format!("edit flush: {project_id}"))
                .await?;
            let options = IngestOptions {
                incremental: IncrementalMode::Content,
                track_changes: true,
                files: Some(files),
            };
            shared
                .ingest_manager()
                .ingest_from_paths(&shared.source_for(&entry), &options)
                .await?;
        }
        {
            let _guard = shared
                .embedding_lock
                .acquire(&format!("embed after flush: {project_id}"))
                .await?;
            shared
                .embedding_coordinator()
                .embed_dirty(Some(&project_id))
                .await?;
        }
        shared.store.save().await?;
    }
    Ok(())
}

fn flush_handler(shared: Arc<Shared>) -> FlushHandler {
    Arc::new(move |batch| {
        let shared = Arc::clone(&shared);
        Box::pin(async move { flush_changes(shared, batch).await })
    })
}

/// The per-process coordinator.
pub struct Brain {
    shared: Arc<Shared>,
    edit_queue: EditQueue,
    watchers: parking_lot::Mutex<HashMap<String, ProjectWatcher>>,
}

impl Brain {
    /// Open a brain against the configured home directory (creating the
    /// layout on first run) with the persistent bundled store.
    pub async fn open(home: Option<&Path>) -> Result<Self> {
        let config = Config::load(home)?;
        let store: Arc<dyn GraphStore> = Arc::new(MemoryGraph::open(&config.brain_dir())?);
        let provider: Arc<dyn EmbeddingProvider> = Arc::from(create_provider(&config)?);
        Self::open_with(config, store, provider).await
    }

    /// Open with explicit collaborators (tests inject an in-memory store
    /// and the mock provider here).
    pub async fn open_with(
        config: Config,
        store: Arc<dyn GraphStore>,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        let projects = ProjectRegistry::new(Arc::clone(&store));
        projects.refresh().await?;

        // Schema-fingerprint invalidation: nodes written by an older
        // property schema re-ingest even when their files are unchanged.
        let mut outdated = 0;
        for label in Label::ALL.iter().filter(|l| l.is_content()) {
            outdated += store
                .mark_schema_outdated(*label, &label.schema_version())
                .await?;
        }
        if outdated > 0 {
            info!(nodes = outdated, "flagged schema-outdated nodes for re-ingest");
        }

        let journal = Arc::new(Journal::open(&config.logs_dir()));
        let shared = Arc::new(Shared {
            ingestion_lock: CoopMutex::new("ingestion", config.lock_timeout_ms),
            embedding_lock: CoopMutex::new("embedding", config.lock_timeout_ms),
            parsers: Arc::new(ParserRegistry::with_builtin()),
            projects,
            journal,
            provider,
            store,
            config,
        });

        let edit_queue = EditQueue::new(
            shared.config.edit_debounce_ms,
            flush_handler(Arc::clone(&shared)),
        );

        Ok(Self {
            shared,
            edit_queue,
            watchers: parking_lot::Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// The underlying graph store. Raw reads should go through
    /// [`Brain::read_store`] so they serialize against ingestion.
    pub fn store(&self) -> Arc<dyn GraphStore> {
        Arc::clone(&self.shared.store)
    }

    pub fn projects(&self) -> &ProjectRegistry {
        &self.shared.projects
    }

    /// Await the ingestion lock being free (raw queries wait only on
    /// ingestion, never on embedding, so reads may overlap background
    /// embedding work), then hand out the store.
    pub async fn read_store(&self) -> Arc<dyn GraphStore> {
        self.shared
            .ingestion_lock
            .wait_for_unlock(self.shared.config.lock_timeout_ms)
            .await;
        Arc::clone(&self.shared.store)
    }

    /// Register (or join) a project, run an initial sync under the
    /// ingestion lock, embed, and start a watcher.
    pub async fn quick_ingest(
        &self,
        path: &Path,
        options: QuickIngestOptions,
    ) -> Result<QuickIngestReport> {
        let registration = self
            .shared
            .projects
            .register(
                path,
                ProjectType::QuickIngest,
                options.project_name.as_deref(),
            )
            .await?;
        let project_id = registration.project_id().to_string();
        let entry = self
            .shared
            .projects
            .get(&project_id)
            .ok_or_else(|| Error::store_fatal("registry lost freshly registered project"))?;

        let mut source = self.shared.source_for(&entry);
        if !options.include.is_empty() {
            source.include = options.include.clone();
        }
        if !options.exclude.is_empty() {
            source.exclude = options.exclude.clone();
        }

        let stats = {
            // Initial syncs may be long; wait forever rather than time out.
            let _guard = self
                .shared
                .ingestion_lock
                .acquire_timeout(&format!("initial sync: {project_id}"), 0)
                .await?;
            let ingest_options = IngestOptions {
                incremental: IncrementalMode::Both,
                track_changes: options.track_changes,
                files: None,
            };
            self.shared
                .ingest_manager()
                .ingest_from_paths(&source, &ingest_options)
                .await?
        };

        let embedding = {
            let _guard = self
                .shared
                .embedding_lock
                .acquire(&format!("initial embed: {project_id}"))
                .await?;
            self.shared
                .embedding_coordinator()
                .embed_dirty(Some(&project_id))
                .await?
        };
        self.shared.store.save().await?;

        let mut watching = false;
        if options.watch {
            let mut watchers = self.watchers.lock();
            if !watchers.contains_key(&project_id) {
                let watcher = ProjectWatcher::start(
                    &project_id,
                    &entry.root,
                    &source.include,
                    &source.exclude,
                    self.shared.config.watch_batch_ms,
                    flush_handler(Arc::clone(&self.shared)),
                )?;
                watchers.insert(project_id.clone(), watcher);
            }
            watching = true;
        }

        Ok(QuickIngestReport {
            project_id,
            stats,
            embedding,
            watching,
        })
    }

    /// Queue a programmatic file change (agent edit). Changes coalesce per
    /// path and flush after the debounce window.
    pub fn queue_file_change(&self, path: &Path, kind: EditKind) {
        self.edit_queue.queue_file_change(path.to_path_buf(), kind);
    }

    /// Wait until all queued edits have flushed, forcing an immediate
    /// flush. Resolves `false` on expiry without failing.
    pub async fn wait_for_pending_edits(&self, timeout_ms: Option<u64>) -> bool {
        let timeout = timeout_ms.unwrap_or(self.shared.config.edit_wait_timeout_ms);
        self.edit_queue.wait_for_pending_edits(timeout).await
    }

    /// Hybrid search. With `fresh`, queued edits are flushed and the
    /// ingestion lock awaited first, so the query observes every edit
    /// queued before this call.
    pub async fn search(
        &self,
        query: &str,
        options: &SearchOptions,
        fresh: bool,
    ) -> Result<SearchResponse> {
        if fresh {
            self.wait_for_pending_edits(None).await;
            self.shared
                .ingestion_lock
                .wait_for_unlock(self.shared.config.lock_timeout_ms)
                .await;
        }
        let service = SearchService::new(
            Arc::clone(&self.shared.store),
            Arc::clone(&self.shared.provider),
        );
        service
            .search(query, options, &self.shared.projects.excluded_ids())
            .await
    }

    /// Pause the watcher for the project owning `path` (agent operations
    /// wrap their own edits between pause and resume).
    pub fn pause_watcher(&self, path: &Path) {
        if let Some(entry) = self.shared.projects.project_for_path(path) {
            if let Some(watcher) = self.watchers.lock().get(&entry.project_id) {
                watcher.pause();
            }
        }
    }

    pub fn resume_watcher(&self, path: &Path) {
        if let Some(entry) = self.shared.projects.project_for_path(path) {
            if let Some(watcher) = self.watchers.lock().get(&entry.project_id) {
                watcher.resume();
            }
        }
    }

    /// Delete every node of the project registered at `path` and drop its
    /// watcher.
    pub async fn forget(&self, path: &Path) -> Result<usize> {
        let watcher = self
            .shared
            .projects
            .project_for_path(path)
            .and_then(|entry| self.watchers.lock().remove(&entry.project_id));
        if let Some(watcher) = watcher {
            watcher.stop().await;
        }
        let deleted = self.shared.projects.forget_path(path).await?;
        self.shared.store.save().await?;
        Ok(deleted)
    }

    /// Run the GC policy: orphan nodes, then stale quick-ingest projects.
    pub async fn gc(&self) -> Result<project::GcReport> {
        let report = self
            .shared
            .projects
            .gc(self.shared.config.retention_days)
            .await?;
        self.shared.store.save().await?;
        Ok(report)
    }

    pub async fn status(&self) -> Result<BrainStatus> {
        let mut projects = Vec::new();
        let mut total_nodes = 0;
        let watchers = self
            .watchers
            .lock()
            .keys()
            .cloned()
            .collect::<std::collections::HashSet<_>>();
        for entry in self.shared.projects.entries() {
            let node_count = self.shared.projects.node_count(&entry.project_id).await?;
            total_nodes += node_count;
            projects.push(ProjectStatus {
                watching: watchers.contains(&entry.project_id),
                project_id: entry.project_id,
                root: entry.root,
                display_name: entry.display_name,
                project_type: entry.project_type.as_str(),
                excluded: entry.excluded,
                node_count,
            });
        }
        projects.sort_by(|a, b| a.display_name.cmp(&b.display_name));
        Ok(BrainStatus {
            projects,
            total_nodes,
        })
    }

    /// Flush pending edits, stop all watchers, and save.
    pub async fn shutdown(&self) -> Result<()> {
        self.edit_queue.shutdown().await;
        let watchers: Vec<ProjectWatcher> = {
            let mut guard = self.watchers.lock();
            guard.drain().map(|(_, w)| w).collect()
        };
        for watcher in watchers {
            watcher.stop().await;
        }
        self.shared.store.save().await?;
        info!("brain shut down");
        Ok(())
    }
}
