//! Project registry: deterministic ids, containment, exclusion, GC.
//!
//! The graph store is authoritative; the in-memory cache is refreshed on
//! init and after every project mutation. Registration enforces
//! containment: a path inside an existing project joins it; a path that
//! contains existing projects swallows them (they are deleted first, then
//! the parent is created).

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::graph::{now_iso, GraphStore, Label, Node};
use crate::hash;

/// Project kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProjectType {
    RagforgeProject,
    QuickIngest,
    WebCrawl,
}

impl ProjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectType::RagforgeProject => "ragforge-project",
            ProjectType::QuickIngest => "quick-ingest",
            ProjectType::WebCrawl => "web-crawl",
        }
    }

    /// Quick-ingest projects are garbage-collected after the retention
    /// window.
    pub fn auto_cleanup(&self) -> bool {
        matches!(self, ProjectType::QuickIngest)
    }
}

impl FromStr for ProjectType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ragforge-project" => Ok(ProjectType::RagforgeProject),
            "quick-ingest" => Ok(ProjectType::QuickIngest),
            "web-crawl" => Ok(ProjectType::WebCrawl),
            other => Err(Error::Config(format!("unknown project type '{other}'"))),
        }
    }
}

/// One registered project, as cached from the store.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectEntry {
    pub project_id: String,
    pub root: PathBuf,
    pub project_type: ProjectType,
    pub excluded: bool,
    pub auto_cleanup: bool,
    pub display_name: String,
    pub last_accessed: String,
}

/// Outcome of a registration attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    /// A new project was created (possibly after swallowing children).
    Created(String),
    /// The path lies inside an existing project; its id is returned.
    JoinedParent(String),
}

impl Registration {
    pub fn project_id(&self) -> &str {
        match self {
            Registration::Created(id) | Registration::JoinedParent(id) => id,
        }
    }
}

#[derive(Debug, Default, Serialize)]
pub struct GcReport {
    pub orphan_nodes_deleted: usize,
    pub projects_removed: usize,
}

/// Canonicalize a path without requiring it to exist.
fn canonical(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| {
        let mut out = PathBuf::new();
        for component in path.components() {
            match component {
                std::path::Component::CurDir => {}
                std::path::Component::ParentDir => {
                    out.pop();
                }
                other => out.push(other),
            }
        }
        out
    })
}

/// Deterministic project id from the canonical path.
pub fn project_id_for_path(path: &Path) -> String {
    hash::content_hash_str(&canonical(path).to_string_lossy())
}

pub struct ProjectRegistry {
    store: Arc<dyn GraphStore>,
    cache: RwLock<HashMap<String, ProjectEntry>>,
}

impl ProjectRegistry {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Reload the cache from the store.
    pub async fn refresh(&self) -> Result<()> {
        let nodes = self.store.nodes_with_label(Label::Project, None).await?;
        let mut cache = HashMap::new();
        for node in nodes {
            let Some(root) = node.prop_str("root").map(PathBuf::from) else {
                continue;
            };
            let project_type = node
                .prop_str("type")
                .and_then(|t| t.parse().ok())
                .unwrap_or(ProjectType::RagforgeProject);
            cache.insert(
                node.project_id.clone(),
                ProjectEntry {
                    project_id: node.project_id.clone(),
                    root,
                    project_type,
                    excluded: node.prop_bool("excluded").unwrap_or(false),
                    auto_cleanup: node.prop_bool("autoCleanup").unwrap_or(false),
                    display_name: node
                        .prop_str("displayName")
                        .unwrap_or_default()
                        .to_string(),
                    last_accessed: node.prop_str("lastAccessed").unwrap_or_default().to_string(),
                },
            );
        }
        *self.cache.write() = cache;
        Ok(())
    }

    pub fn entries(&self) -> Vec<ProjectEntry> {
        self.cache.read().values().cloned().collect()
    }

    pub fn get(&self, project_id: &str) -> Option<ProjectEntry> {
        self.cache.read().get(project_id).cloned()
    }

    /// Project ids currently flagged excluded.
    pub fn excluded_ids(&self) -> HashSet<String> {
        self.cache
            .read()
            .values()
            .filter(|e| e.excluded)
            .map(|e| e.project_id.clone())
            .collect()
    }

    /// The project whose root contains `path`, preferring the deepest root.
    pub fn project_for_path(&self, path: &Path) -> Option<ProjectEntry> {
        let path = canonical(path);
        self.cache
            .read()
            .values()
            .filter(|entry| path.starts_with(&entry.root))
            .max_by_key(|entry| entry.root.components().count())
            .cloned()
    }

    /// Register a project at `path`, enforcing containment:
    /// - `path` inside an existing root → join the parent, no new project;
    /// - existing roots inside `path` → those projects are deleted first.
    pub async fn register(
        &self,
        path: &Path,
        project_type: ProjectType,
        display_name: Option<&str>,
    ) -> Result<Registration> {
        let root = canonical(path);

        // Joined if any registered root is an ancestor (or exact match).
        let parent = {
            let cache = self.cache.read();
            cache
                .values()
                .find(|entry| root.starts_with(&entry.root))
                .cloned()
        };
        if let Some(parent) = parent {
            debug!(
                path = %root.display(),
                parent = %parent.root.display(),
                "path joins existing project"
            );
            self.touch(&parent.project_id).await?;
            return Ok(Registration::JoinedParent(parent.project_id));
        }

        // Swallow any projects nested under the new root.
        let swallowed: Vec<ProjectEntry> = {
            let cache = self.cache.read();
            cache
                .values()
                .filter(|entry| entry.root.starts_with(&root) && entry.root != root)
                .cloned()
                .collect()
        };
        for child in swallowed {
            info!(
                child = %child.root.display(),
                parent = %root.display(),
                "deleting contained project before parent registration"
            );
            self.store.delete_project_nodes(&child.project_id).await?;
            self.cache.write().remove(&child.project_id);
        }

        let project_id = project_id_for_path(&root);
        let display_name = display_name
            .map(str::to_string)
            .unwrap_or_else(|| {
                root.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| project_id.clone())
            });

        let mut node = Node::new(
            Label::Project,
            hash::node_uuid("project", &root.to_string_lossy()),
            project_id.clone(),
        );
        node.set_prop("projectId", project_id.as_str())
            .set_prop("root", root.to_string_lossy().into_owned())
            .set_prop("type", project_type.as_str())
            .set_prop("excluded", false)
            .set_prop("autoCleanup", project_type.auto_cleanup())
            .set_prop("displayName", display_name.as_str())
            .set_prop("lastAccessed", now_iso());
        self.store.upsert_nodes(vec![node]).await?;

        self.cache.write().insert(
            project_id.clone(),
            ProjectEntry {
                project_id: project_id.clone(),
                root,
                project_type,
                excluded: false,
                auto_cleanup: project_type.auto_cleanup(),
                display_name,
                last_accessed: now_iso(),
            },
        );
        Ok(Registration::Created(project_id))
    }

    /// Flip the exclusion flag on the `Project` node (not cascaded).
    pub async fn set_excluded(&self, project_id: &str, excluded: bool) -> Result<()> {
        let node = self.project_node(project_id).await?;
        let mut props = crate::graph::PropertyMap::new();
        props.insert("excluded".into(), excluded.into());
        self.store.update_properties(&node.uuid, props).await?;
        if let Some(entry) = self.cache.write().get_mut(project_id) {
            entry.excluded = excluded;
        }
        Ok(())
    }

    /// Refresh a project's last-accessed timestamp.
    pub async fn touch(&self, project_id: &str) -> Result<()> {
        let node = self.project_node(project_id).await?;
        let now = now_iso();
        let mut props = crate::graph::PropertyMap::new();
        props.insert("lastAccessed".into(), now.clone().into());
        self.store.update_properties(&node.uuid, props).await?;
        if let Some(entry) = self.cache.write().get_mut(project_id) {
            entry.last_accessed = now;
        }
        Ok(())
    }

    /// Number of nodes tagged with a project id.
    pub async fn node_count(&self, project_id: &str) -> Result<usize> {
        self.store.count_nodes(project_id).await
    }

    /// Delete every node of the project registered at `path`.
    pub async fn forget_path(&self, path: &Path) -> Result<usize> {
        let root = canonical(path);
        let entry = {
            let cache = self.cache.read();
            cache
                .values()
                .find(|entry| entry.root == root)
                .cloned()
        };
        let Some(entry) = entry else {
            return Err(Error::ProjectNotRegistered {
                path: path.to_path_buf(),
            });
        };
        let deleted = self.store.delete_project_nodes(&entry.project_id).await?;
        self.cache.write().remove(&entry.project_id);
        info!(
            project = %entry.project_id,
            root = %root.display(),
            nodes = deleted,
            "project forgotten"
        );
        Ok(deleted)
    }

    /// GC: detach-delete orphan nodes, then remove quick-ingest projects
    /// whose last access exceeds the retention window.
    pub async fn gc(&self, retention_days: i64) -> Result<GcReport> {
        let mut report = GcReport::default();

        let orphans = self.store.orphan_nodes().await?;
        if !orphans.is_empty() {
            report.orphan_nodes_deleted = self.store.delete_nodes(&orphans).await?;
        }

        let cutoff = (chrono::Local::now() - chrono::Duration::days(retention_days)).timestamp();
        let stale: Vec<ProjectEntry> = {
            let cache = self.cache.read();
            cache
                .values()
                .filter(|entry| entry.auto_cleanup)
                .filter(|entry| {
                    chrono::DateTime::parse_from_rfc3339(&entry.last_accessed)
                        .map(|t| t.timestamp() < cutoff)
                        .unwrap_or(false)
                })
                .cloned()
                .collect()
        };
        for entry in stale {
            info!(
                project = %entry.project_id,
                last_accessed = %entry.last_accessed,
                "retention expired, forgetting quick-ingest project"
            );
            self.forget_path(&entry.root).await?;
            report.projects_removed += 1;
        }
        Ok(report)
    }

    async fn project_node(&self, project_id: &str) -> Result<Node> {
        self.store
            .nodes_with_label(Label::Project, Some(project_id))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::store_fatal(format!("no Project node for {project_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::MemoryGraph;

    async fn registry() -> ProjectRegistry {
        ProjectRegistry::new(Arc::new(MemoryGraph::in_memory().unwrap()))
    }

    #[test]
    fn project_id_is_deterministic() {
        let a = project_id_for_path(Path::new("/tmp/ragforge-id-test"));
        let b = project_id_for_path(Path::new("/tmp/ragforge-id-test"));
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert_ne!(a, project_id_for_path(Path::new("/tmp/other")));
    }

    #[test]
    fn project_type_round_trip() {
        for t in [
            ProjectType::RagforgeProject,
            ProjectType::QuickIngest,
            ProjectType::WebCrawl,
        ] {
            assert_eq!(t.as_str().parse::<ProjectType>().unwrap(), t);
        }
        assert!(ProjectType::QuickIngest.auto_cleanup());
        assert!(!ProjectType::RagforgeProject.auto_cleanup());
    }

    #[tokio::test]
    async fn register_creates_project_node() {
        let registry = registry().await;
        let outcome = registry
            .register(Path::new("/tmp/ragforge-reg/p"), ProjectType::QuickIngest, None)
            .await
            .unwrap();
        let Registration::Created(id) = outcome else {
            panic!("expected Created");
        };
        let entry = registry.get(&id).unwrap();
        assert_eq!(entry.project_type, ProjectType::QuickIngest);
        assert!(entry.auto_cleanup);
        assert!(!entry.excluded);
    }

    #[tokio::test]
    async fn child_path_joins_parent() {
        let registry = registry().await;
        let parent = registry
            .register(Path::new("/tmp/ragforge-join/p"), ProjectType::QuickIngest, None)
            .await
            .unwrap();
        let child = registry
            .register(
                Path::new("/tmp/ragforge-join/p/sub"),
                ProjectType::QuickIngest,
                None,
            )
            .await
            .unwrap();
        assert_eq!(child, Registration::JoinedParent(parent.project_id().to_string()));
        assert_eq!(registry.entries().len(), 1);
    }

    #[tokio::test]
    async fn parent_registration_swallows_children() {
        let registry = registry().await;
        let child = registry
            .register(
                Path::new("/tmp/ragforge-swallow/p/sub"),
                ProjectType::QuickIngest,
                None,
            )
            .await
            .unwrap();
        let child_id = child.project_id().to_string();

        let parent = registry
            .register(Path::new("/tmp/ragforge-swallow/p"), ProjectType::QuickIngest, None)
            .await
            .unwrap();
        assert!(matches!(parent, Registration::Created(_)));
        assert!(registry.get(&child_id).is_none());
        assert_eq!(registry.node_count(&child_id).await.unwrap(), 0);

        // No two roots where one is a proper prefix of the other.
        let entries = registry.entries();
        for a in &entries {
            for b in &entries {
                if a.project_id != b.project_id {
                    assert!(!a.root.starts_with(&b.root));
                }
            }
        }
    }

    #[tokio::test]
    async fn exclusion_toggle() {
        let registry = registry().await;
        let id = registry
            .register(Path::new("/tmp/ragforge-excl/p"), ProjectType::RagforgeProject, None)
            .await
            .unwrap()
            .project_id()
            .to_string();
        assert!(registry.excluded_ids().is_empty());
        registry.set_excluded(&id, true).await.unwrap();
        assert!(registry.excluded_ids().contains(&id));
        registry.set_excluded(&id, false).await.unwrap();
        assert!(registry.excluded_ids().is_empty());
    }

    #[tokio::test]
    async fn forget_removes_everything() {
        let store: Arc<dyn GraphStore> = Arc::new(MemoryGraph::in_memory().unwrap());
        let registry = ProjectRegistry::new(Arc::clone(&store));
        let id = registry
            .register(Path::new("/tmp/ragforge-forget/p"), ProjectType::QuickIngest, None)
            .await
            .unwrap()
            .project_id()
            .to_string();

        let mut extra = Node::new(Label::Scope, "scope:x", id.clone());
        extra.set_prop("name", "x");
        store.upsert_nodes(vec![extra]).await.unwrap();

        let deleted = registry
            .forget_path(Path::new("/tmp/ragforge-forget/p"))
            .await
            .unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(store.count_nodes(&id).await.unwrap(), 0);
        assert!(registry.get(&id).is_none());
    }

    #[tokio::test]
    async fn forget_unknown_path_errors() {
        let registry = registry().await;
        assert!(matches!(
            registry.forget_path(Path::new("/tmp/never-registered")).await,
            Err(Error::ProjectNotRegistered { .. })
        ));
    }

    #[tokio::test]
    async fn gc_removes_orphans_and_stale_quick_ingests() {
        let store: Arc<dyn GraphStore> = Arc::new(MemoryGraph::in_memory().unwrap());
        let registry = ProjectRegistry::new(Arc::clone(&store));

        // Orphan: no project id.
        let mut orphan = Node::new(Label::Scope, "scope:orphan", "");
        orphan.set_prop("name", "stray");
        store.upsert_nodes(vec![orphan]).await.unwrap();

        // Stale quick-ingest project.
        let id = registry
            .register(Path::new("/tmp/ragforge-gc/p"), ProjectType::QuickIngest, None)
            .await
            .unwrap()
            .project_id()
            .to_string();
        let node = store
            .nodes_with_label(Label::Project, Some(&id))
            .await
            .unwrap()
            .remove(0);
        let old = (chrono::Local::now() - chrono::Duration::days(45))
            .to_rfc3339_opts(chrono::SecondsFormat::Secs, false);
        let mut props = crate::graph::PropertyMap::new();
        props.insert("lastAccessed".into(), old.clone().into());
        store.update_properties(&node.uuid, props).await.unwrap();
        registry.refresh().await.unwrap();

        let report = registry.gc(30).await.unwrap();
        assert_eq!(report.orphan_nodes_deleted, 1);
        assert_eq!(report.projects_removed, 1);
        assert!(registry.get(&id).is_none());
    }

    #[tokio::test]
    async fn refresh_rebuilds_cache_from_store() {
        let store: Arc<dyn GraphStore> = Arc::new(MemoryGraph::in_memory().unwrap());
        let registry = ProjectRegistry::new(Arc::clone(&store));
        registry
            .register(Path::new("/tmp/ragforge-refresh/p"), ProjectType::WebCrawl, Some("Web"))
            .await
            .unwrap();

        let second = ProjectRegistry::new(Arc::clone(&store));
        assert!(second.entries().is_empty());
        second.refresh().await.unwrap();
        let entries = second.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].display_name, "Web");
        assert_eq!(entries[0].project_type, ProjectType::WebCrawl);
    }
}
