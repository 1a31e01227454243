//! The one-file parse-and-upsert pipeline.
//!
//! Advances the file state machine around the parser adapter: read, hash
//! skip-check, fragment normalization (project id, deterministic uuids,
//! schema fingerprint, dirty flags), stale content-node replacement or
//! per-node hash diff, label-grouped upserts, grouped edge batches,
//! reference resolution, and the linked-file hook that upgrades pending
//! imports targeting this file.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::graph::{Edge, EdgeType, GraphStore, Label, Node};
use crate::hash;
use crate::journal::{ChangeEntry, ChangeType};
use crate::parse::ParserRegistry;
use crate::resolve::ReferenceResolver;
use crate::state::{ErrorKind, FileState, FileStateMachine, TransitionMeta};

/// Retry a graph-store batch once when the failure is transient.
macro_rules! retry_transient {
    ($call:expr) => {{
        match $call.await {
            Err(e) if e.is_transient() => $call.await,
            other => other,
        }
    }};
}

/// What happened to the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// File gone from disk; the file node and its content were removed.
    Deleted,
    /// Bytes and schema unchanged; nothing re-parsed.
    Skipped,
    /// Parsed and upserted.
    Processed,
}

/// Per-file processing report.
#[derive(Debug)]
pub struct ProcessReport {
    pub status: ProcessStatus,
    /// Whether the `File` node itself was created by this call.
    pub file_created: bool,
    pub nodes_created: usize,
    pub nodes_updated: usize,
    pub nodes_unchanged: usize,
    pub nodes_deleted: usize,
    pub edges_created: usize,
    pub changes: Vec<ChangeEntry>,
}

impl ProcessReport {
    fn new(status: ProcessStatus, file_created: bool) -> Self {
        Self {
            status,
            file_created,
            nodes_created: 0,
            nodes_updated: 0,
            nodes_unchanged: 0,
            nodes_deleted: 0,
            edges_created: 0,
            changes: Vec::new(),
        }
    }
}

/// Knobs for one processing call.
#[derive(Debug, Clone, Copy)]
pub struct ProcessOptions {
    /// Diff fragment nodes against stored hashes instead of replacing all
    /// content nodes.
    pub diff_nodes: bool,
    /// Delete outgoing edges of modified nodes before re-resolution.
    pub clean_stale_edges: bool,
    /// Collect change-journal entries.
    pub track_changes: bool,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            diff_nodes: true,
            clean_stale_edges: true,
            track_changes: false,
        }
    }
}

pub struct FileProcessor {
    store: Arc<dyn GraphStore>,
    registry: Arc<ParserRegistry>,
    resolver: ReferenceResolver,
    project_id: String,
    project_root: PathBuf,
}

impl FileProcessor {
    pub fn new(
        store: Arc<dyn GraphStore>,
        registry: Arc<ParserRegistry>,
        project_id: &str,
        project_root: &Path,
    ) -> Self {
        let resolver = ReferenceResolver::new(Arc::clone(&store), project_id, project_root);
        Self {
            store,
            registry,
            resolver,
            project_id: project_id.to_string(),
            project_root: project_root.to_path_buf(),
        }
    }

    pub fn resolver(&self) -> &ReferenceResolver {
        &self.resolver
    }

    /// Run the full pipeline for one file.
    pub async fn process(
        &self,
        absolute_path: &Path,
        options: ProcessOptions,
    ) -> Result<ProcessReport> {
        let path_str = absolute_path.to_string_lossy().into_owned();
        let sm = FileStateMachine::new(self.store.as_ref());

        let existing = self.store.file_by_absolute_path(&path_str).await?;
        let file_created = existing.is_none();
        let prior_hash = existing.as_ref().and_then(|n| n.hash.clone());

        let file = match existing {
            Some(node) => node,
            None => {
                if tokio::fs::metadata(absolute_path).await.is_err() {
                    // Neither on disk nor in the graph; nothing to do.
                    return Ok(ProcessReport::new(ProcessStatus::Deleted, false));
                }
                let mut node = Node::new(
                    Label::File,
                    hash::node_uuid("file", &format!("{}:{path_str}", self.project_id)),
                    self.project_id.clone(),
                );
                node.set_prop("absolutePath", path_str.as_str());
                if let Ok(rel) = absolute_path.strip_prefix(&self.project_root) {
                    node.set_prop("path", rel.to_string_lossy().into_owned());
                }
                node.set_prop("state", FileState::Discovered.as_str());
                self.store.upsert_nodes(vec![node.clone()]).await?;
                node
            }
        };

        sm.begin_parsing(&file.uuid).await?;

        let bytes = match tokio::fs::read(absolute_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let mut report = ProcessReport::new(ProcessStatus::Deleted, file_created);
                let mut changes = Vec::new();
                report.nodes_deleted =
                    self.cascade_delete(&file, options.track_changes, &mut changes).await?;
                report.changes = changes;
                info!(path = %path_str, "file removed, cascade-deleted from graph");
                return Ok(report);
            }
            Err(e) => {
                sm.transition(
                    &file.uuid,
                    FileState::Error,
                    TransitionMeta::error(ErrorKind::Io, e.to_string()),
                )
                .await?;
                return Err(Error::Io(e));
            }
        };

        let new_hash = hash::content_hash(&bytes);
        if prior_hash.as_deref() == Some(new_hash.as_str()) {
            let schema_dirty = self
                .store
                .nodes_defined_in(&file.uuid)
                .await?
                .iter()
                .any(|n| n.schema_dirty);
            if !schema_dirty {
                sm.transition(&file.uuid, FileState::Linked, TransitionMeta::default())
                    .await?;
                debug!(path = %path_str, "unchanged, skipping parse");
                return Ok(ProcessReport::new(ProcessStatus::Skipped, file_created));
            }
            debug!(path = %path_str, "bytes unchanged but schema dirty, re-parsing");
        }

        let relative = absolute_path
            .strip_prefix(&self.project_root)
            .unwrap_or(absolute_path)
            .to_path_buf();
        let text = String::from_utf8_lossy(&bytes).into_owned();

        let fragment = match self.registry.parse_file(&self.project_id, &relative, &text) {
            Ok(fragment) => fragment,
            Err(e) => {
                // Prior nodes are kept so the previous state stays
                // queryable.
                sm.transition(
                    &file.uuid,
                    FileState::Error,
                    TransitionMeta::error(ErrorKind::Parse, e.to_string()),
                )
                .await?;
                return Err(e);
            }
        };
        sm.transition(&file.uuid, FileState::Parsed, TransitionMeta::default())
            .await?;

        let mut report = ProcessReport::new(ProcessStatus::Processed, file_created);

        // Normalize the fragment into nodes the store understands.
        let mut new_nodes: Vec<Node> = Vec::new();
        let mut id_map: HashMap<String, String> = HashMap::new();
        let mut label_map: HashMap<String, Label> = HashMap::new();
        for fragment_node in &fragment.nodes {
            let Some(primary) = fragment_node.labels.first() else {
                continue;
            };
            let label: Label = match primary.parse() {
                Ok(label) => label,
                Err(_) => {
                    warn!(label = %primary, "unknown label in fragment, skipping node");
                    continue;
                }
            };
            // File and Project nodes are owned elsewhere.
            if matches!(label, Label::File | Label::Project | Label::Directory) {
                continue;
            }
            let uuid = if fragment_node.id.contains(':') {
                fragment_node.id.clone()
            } else {
                hash::node_uuid(
                    label.uuid_prefix(),
                    &format!("{}:{}:{}", self.project_id, relative.display(), fragment_node.id),
                )
            };
            let mut node = Node::new(label, uuid.clone(), self.project_id.clone());
            node.properties = fragment_node.properties.clone();
            node.set_prop("file", relative.to_string_lossy().into_owned());
            node.set_prop("absolutePath", path_str.as_str());
            node.embeddings_dirty = true;
            node.schema_version = Some(label.schema_version());
            node.hash = Some(node.compute_content_hash());
            id_map.insert(fragment_node.id.clone(), uuid.clone());
            label_map.insert(uuid, label);
            new_nodes.push(node);
        }

        let stored = self.store.nodes_defined_in(&file.uuid).await?;
        let stored_by_uuid: HashMap<String, &Node> =
            stored.iter().map(|n| (n.uuid.clone(), n)).collect();
        let seen: HashSet<String> = new_nodes.iter().map(|n| n.uuid.clone()).collect();

        let mut to_upsert: Vec<Node> = Vec::new();
        let mut link_uuids: Vec<String> = Vec::new();

        if options.diff_nodes {
            for node in new_nodes {
                match stored_by_uuid.get(&node.uuid) {
                    Some(old) if old.hash == node.hash && !old.schema_dirty => {
                        report.nodes_unchanged += 1;
                    }
                    Some(old) => {
                        report.nodes_updated += 1;
                        if options.clean_stale_edges {
                            self.store.delete_edges_from(&node.uuid, None).await?;
                        }
                        if options.track_changes {
                            report.changes.push(change_entry(
                                &node,
                                ChangeType::Updated,
                                Some(*old),
                            ));
                        }
                        link_uuids.push(node.uuid.clone());
                        to_upsert.push(node);
                    }
                    None => {
                        report.nodes_created += 1;
                        if options.track_changes {
                            report.changes.push(change_entry(&node, ChangeType::Created, None));
                        }
                        link_uuids.push(node.uuid.clone());
                        to_upsert.push(node);
                    }
                }
            }
            let orphaned: Vec<String> = stored
                .iter()
                .filter(|n| !seen.contains(&n.uuid))
                .map(|n| n.uuid.clone())
                .collect();
            let deleted = self
                .delete_with_chunks(&orphaned, options.track_changes, &mut report.changes)
                .await?;
            report.nodes_deleted += deleted;
        } else {
            let all: Vec<String> = stored.iter().map(|n| n.uuid.clone()).collect();
            let deleted = self
                .delete_with_chunks(&all, options.track_changes, &mut report.changes)
                .await?;
            report.nodes_deleted += deleted;
            for node in new_nodes {
                report.nodes_created += 1;
                if options.track_changes {
                    report.changes.push(change_entry(&node, ChangeType::Created, None));
                }
                link_uuids.push(node.uuid.clone());
                to_upsert.push(node);
            }
        }

        if !to_upsert.is_empty() {
            retry_transient!(self.store.upsert_nodes(to_upsert.clone()))?;
        }

        // Every new node is DEFINED_IN this file.
        let defined_in: Vec<Edge> = link_uuids
            .iter()
            .map(|uuid| Edge::new(EdgeType::DefinedIn, uuid.clone(), file.uuid.clone()))
            .collect();
        if !defined_in.is_empty() {
            report.edges_created += retry_transient!(self.store.create_edges(defined_in.clone()))?;
        }

        report.edges_created += self.ensure_structure(&file, &relative).await?;

        // Intra-fragment edges, grouped by (type, source label, target
        // label) for index-friendly matches.
        let mut groups: HashMap<(EdgeType, Label, Label), Vec<Edge>> = HashMap::new();
        for rel in &fragment.relationships {
            let Ok(edge_type) = rel.rel_type.parse::<EdgeType>() else {
                warn!(rel_type = %rel.rel_type, "unknown edge type in fragment, skipping");
                continue;
            };
            let (Some(from), Some(to)) = (id_map.get(&rel.from), id_map.get(&rel.to)) else {
                continue;
            };
            let (Some(&from_label), Some(&to_label)) =
                (label_map.get(from), label_map.get(to))
            else {
                continue;
            };
            let mut edge = Edge::new(edge_type, from.clone(), to.clone());
            edge.properties = rel.properties.clone();
            groups.entry((edge_type, from_label, to_label)).or_default().push(edge);
        }
        for (_, group) in groups {
            report.edges_created += retry_transient!(self.store.create_edges(group.clone()))?;
        }

        sm.transition(&file.uuid, FileState::Relations, TransitionMeta::default())
            .await?;

        // References are best-effort: extraction failures are logged, the
        // file still reaches linked.
        let refreshed = self
            .store
            .get_node(&file.uuid)
            .await?
            .unwrap_or_else(|| file.clone());
        if let Err(e) = self.resolver.resolve_file(&refreshed, &text).await {
            warn!(path = %path_str, error = %e, "reference resolution failed");
        }

        sm.transition(
            &file.uuid,
            FileState::Linked,
            TransitionMeta {
                content_hash: Some(new_hash.clone()),
                ..Default::default()
            },
        )
        .await?;

        let mut props = crate::graph::PropertyMap::new();
        props.insert("hash".into(), new_hash.clone().into());
        props.insert("rawContentHash".into(), new_hash.into());
        props.insert("lineCount".into(), text.lines().count().into());
        // No longer a bare mentioned-file placeholder, if it ever was one.
        props.insert("mentioned".into(), serde_json::Value::Null);
        self.store.update_properties(&file.uuid, props).await?;

        // Announce linkage so pending imports targeting this file upgrade.
        let linked = self
            .store
            .get_node(&file.uuid)
            .await?
            .unwrap_or_else(|| file.clone());
        if let Err(e) = self.resolver.on_file_linked(&linked).await {
            warn!(path = %path_str, error = %e, "pending-import upgrade failed");
        }

        info!(
            path = %path_str,
            created = report.nodes_created,
            updated = report.nodes_updated,
            unchanged = report.nodes_unchanged,
            deleted = report.nodes_deleted,
            edges = report.edges_created,
            "file processed"
        );
        Ok(report)
    }

    /// Delete nodes together with their embedding chunks.
    async fn delete_with_chunks(
        &self,
        uuids: &[String],
        track: bool,
        changes: &mut Vec<ChangeEntry>,
    ) -> Result<usize> {
        if uuids.is_empty() {
            return Ok(0);
        }
        let mut all: Vec<String> = Vec::with_capacity(uuids.len());
        for uuid in uuids {
            if track {
                if let Some(node) = self.store.get_node(uuid).await? {
                    changes.push(change_entry(&node, ChangeType::Deleted, Some(&node)));
                }
            }
            for edge in self
                .store
                .edges_from(uuid, Some(EdgeType::HasEmbeddingChunk))
                .await?
            {
                all.push(edge.to);
            }
            all.push(uuid.clone());
        }
        self.store.delete_nodes(&all).await
    }

    /// File gone from disk: remove the file node, everything defined in it,
    /// and re-resolve files that imported it (their edges degrade to
    /// pending imports against a mentioned placeholder).
    async fn cascade_delete(
        &self,
        file: &Node,
        track: bool,
        changes: &mut Vec<ChangeEntry>,
    ) -> Result<usize> {
        let defined = self.store.nodes_defined_in(&file.uuid).await?;

        // Importers to re-resolve afterwards: files importing this file
        // directly, and files whose scopes consume this file's scopes.
        let mut importer_files: HashSet<String> = HashSet::new();
        for edge in self.store.edges_to(&file.uuid, None).await? {
            if edge.edge_type.is_reference() {
                if let Some(node) = self.store.get_node(&edge.from).await? {
                    match node.label {
                        Label::File => {
                            importer_files.insert(node.uuid);
                        }
                        _ => {
                            for defined_in in self
                                .store
                                .edges_from(&node.uuid, Some(EdgeType::DefinedIn))
                                .await?
                            {
                                importer_files.insert(defined_in.to);
                            }
                        }
                    }
                }
            }
        }
        for content in &defined {
            for edge in self.store.edges_to(&content.uuid, None).await? {
                if !edge.edge_type.is_reference() {
                    continue;
                }
                for defined_in in self
                    .store
                    .edges_from(&edge.from, Some(EdgeType::DefinedIn))
                    .await?
                {
                    importer_files.insert(defined_in.to);
                }
            }
        }
        importer_files.remove(&file.uuid);

        let uuids: Vec<String> = defined.iter().map(|n| n.uuid.clone()).collect();
        let deleted = self.delete_with_chunks(&uuids, track, changes).await?;
        if track {
            changes.push(change_entry(file, ChangeType::Deleted, Some(file)));
        }
        self.store
            .delete_nodes(std::slice::from_ref(&file.uuid))
            .await?;

        for importer_uuid in importer_files {
            let Some(importer) = self.store.get_node(&importer_uuid).await? else {
                continue;
            };
            let Some(path) = importer.absolute_path().map(PathBuf::from) else {
                continue;
            };
            match tokio::fs::read_to_string(&path).await {
                Ok(text) => {
                    if let Err(e) = self.resolver.resolve_file(&importer, &text).await {
                        warn!(path = %path.display(), error = %e, "re-resolution after delete failed");
                    }
                }
                Err(_) => continue,
            }
        }
        Ok(deleted + 1)
    }

    /// Maintain the structural skeleton: directory chain and project
    /// membership edges.
    async fn ensure_structure(&self, file: &Node, relative: &Path) -> Result<usize> {
        let mut edges: Vec<Edge> = Vec::new();
        let mut dirs: Vec<Node> = Vec::new();

        let project_uuid = self
            .store
            .nodes_with_label(Label::Project, Some(&self.project_id))
            .await?
            .first()
            .map(|n| n.uuid.clone());

        let mut child_uuid = file.uuid.clone();
        let mut current = relative.parent();
        while let Some(dir) = current {
            if dir.as_os_str().is_empty() {
                break;
            }
            let dir_path = dir.to_string_lossy().replace('\\', "/");
            let uuid = hash::node_uuid("dir", &format!("{}:{dir_path}", self.project_id));
            let mut node = Node::new(Label::Directory, uuid.clone(), self.project_id.clone());
            node.set_prop("path", dir_path.as_str());
            dirs.push(node);
            edges.push(Edge::new(EdgeType::InDirectory, child_uuid.clone(), uuid.clone()));
            if let Some(project_uuid) = &project_uuid {
                edges.push(Edge::new(EdgeType::BelongsTo, uuid.clone(), project_uuid.clone()));
            }
            child_uuid = uuid;
            current = dir.parent();
        }
        if let Some(project_uuid) = &project_uuid {
            edges.push(Edge::new(
                EdgeType::BelongsTo,
                file.uuid.clone(),
                project_uuid.clone(),
            ));
        }
        if !dirs.is_empty() {
            self.store.upsert_nodes(dirs).await?;
        }
        if edges.is_empty() {
            return Ok(0);
        }
        self.store.create_edges(edges).await
    }
}

fn change_entry(node: &Node, change_type: ChangeType, old: Option<&Node>) -> ChangeEntry {
    let mut entry = ChangeEntry::new(node.label.as_str(), &node.uuid, change_type);
    match change_type {
        ChangeType::Created => {
            entry.new_content = node.prop_str("content").map(str::to_string);
            entry.new_hash = node.hash.clone();
        }
        ChangeType::Updated => {
            entry.old_content = old.and_then(|n| n.prop_str("content").map(str::to_string));
            entry.old_hash = old.and_then(|n| n.hash.clone());
            entry.new_content = node.prop_str("content").map(str::to_string);
            entry.new_hash = node.hash.clone();
        }
        ChangeType::Deleted => {
            entry.old_content = old.and_then(|n| n.prop_str("content").map(str::to_string));
            entry.old_hash = old.and_then(|n| n.hash.clone());
        }
    }
    entry.metadata = serde_json::json!({
        "file": node.prop_str("file"),
        "projectId": node.project_id,
    });
    entry
}
