//! Reference resolution: from extracted specifiers to graph edges.
//!
//! Candidate resolution is a pure function (exact path, `.js ↔ .ts/.tsx`
//! substitutions, family extension probing, directory `index.*` and
//! `README.md`); all side effects — `CONSUMES`/`IMPORTS`/`REFERENCES_*`
//! edges and pending-import placeholders — live in the edge-emission step.
//! When a file later reaches `linked`, pending imports targeting it are
//! upgraded in place.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

use crate::error::Result;
use crate::extract::{self, Family, RawReference};
use crate::graph::{Edge, EdgeType, GraphStore, Label, Node};
use crate::hash;
use crate::state::FileState;

/// Bounded concurrency for edge creation.
pub const RESOLVE_CONCURRENCY: usize = 10;

/// Outcome counters for one file's resolution pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveStats {
    pub consumes: usize,
    pub imports: usize,
    pub assets: usize,
    pub docs: usize,
    pub pending: usize,
}

impl ResolveStats {
    fn absorb(&mut self, other: ResolveStats) {
        self.consumes += other.consumes;
        self.imports += other.imports;
        self.assets += other.assets;
        self.docs += other.docs;
        self.pending += other.pending;
    }
}

/// Resolve `.` and `..` components without touching the filesystem.
fn normalize_path(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                components.pop();
            }
            other => components.push(other),
        }
    }
    components.iter().collect()
}

/// Build the fixed, ordered candidate list for a specifier.
///
/// Specifiers starting with `/` resolve against the project root; everything
/// else against the importing file's directory.
pub fn candidate_paths(
    project_root: &Path,
    importer_dir: &Path,
    specifier: &str,
    source_family: Family,
) -> Vec<PathBuf> {
    let base = if let Some(rooted) = specifier.strip_prefix('/') {
        normalize_path(&project_root.join(rooted))
    } else {
        normalize_path(&importer_dir.join(specifier))
    };

    let mut candidates = vec![base.clone()];

    let extension = base
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase);
    match extension.as_deref() {
        // The compiled-output convention: imports say `.js`, sources are
        // `.ts`/`.tsx` (and vice versa).
        Some("js") => {
            candidates.push(base.with_extension("ts"));
            candidates.push(base.with_extension("tsx"));
        }
        Some("ts") | Some("tsx") => {
            candidates.push(base.with_extension("js"));
        }
        Some(_) => {}
        None => {
            for ext in source_family.extensions() {
                candidates.push(base.with_extension(ext));
            }
        }
    }

    // Directory targets.
    for index in ["index.ts", "index.tsx", "index.js", "index.jsx", "index.md"] {
        candidates.push(base.join(index));
    }
    candidates.push(base.join("README.md"));

    candidates.dedup();
    candidates
}

/// Resolves references for files of one project and emits edges.
pub struct ReferenceResolver {
    store: Arc<dyn GraphStore>,
    project_id: String,
    project_root: PathBuf,
}

impl ReferenceResolver {
    pub fn new(store: Arc<dyn GraphStore>, project_id: &str, project_root: &Path) -> Self {
        Self {
            store,
            project_id: project_id.to_string(),
            project_root: project_root.to_path_buf(),
        }
    }

    /// Extract and resolve all references in `text`, replacing the file's
    /// previous reference edges.
    pub async fn resolve_file(&self, file: &Node, text: &str) -> Result<ResolveStats> {
        let Some(absolute_path) = file.absolute_path().map(PathBuf::from) else {
            return Ok(ResolveStats::default());
        };
        let extension = absolute_path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_string();
        let source_family = extract::family_of(&extension);
        let references = extract::extract_references(text, &extension);

        // Re-resolution replaces whatever the previous parse produced.
        for edge_type in EdgeType::ALL.iter().filter(|t| t.is_reference()) {
            self.store
                .delete_edges_from(&file.uuid, Some(*edge_type))
                .await?;
        }

        if references.is_empty() {
            return Ok(ResolveStats::default());
        }

        let importer_dir = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.project_root.clone());
        let source_scopes = self.scopes_of(&file.uuid).await?;

        let mut pending: Vec<std::pin::Pin<Box<dyn std::future::Future<Output = Result<ResolveStats>> + Send + '_>>> =
            Vec::with_capacity(references.len());
        for reference in &references {
            pending.push(Box::pin(self.resolve_one(
                file,
                &source_scopes,
                &importer_dir,
                source_family,
                reference,
            )));
        }
        let outcomes: Vec<Result<ResolveStats>> = stream::iter(pending)
            .buffer_unordered(RESOLVE_CONCURRENCY)
            .collect()
            .await;

        let mut stats = ResolveStats::default();
        for outcome in outcomes {
            match outcome {
                Ok(s) => stats.absorb(s),
                // References are best-effort; a single bad one never fails
                // the file.
                Err(e) => warn!(file = %absolute_path.display(), error = %e, "reference failed"),
            }
        }
        debug!(
            file = %absolute_path.display(),
            consumes = stats.consumes,
            imports = stats.imports,
            pending = stats.pending,
            "references resolved"
        );
        Ok(stats)
    }

    async fn scopes_of(&self, file_uuid: &str) -> Result<Vec<Node>> {
        Ok(self
            .store
            .nodes_defined_in(file_uuid)
            .await?
            .into_iter()
            .filter(|n| n.label == Label::Scope)
            .collect())
    }

    async fn resolve_one(
        &self,
        file: &Node,
        source_scopes: &[Node],
        importer_dir: &Path,
        source_family: Family,
        reference: &RawReference,
    ) -> Result<ResolveStats> {
        let candidates = candidate_paths(
            &self.project_root,
            importer_dir,
            &reference.source,
            source_family,
        );

        // Probe the graph first, in candidate order.
        let mut target: Option<Node> = None;
        for candidate in &candidates {
            if let Some(node) = self
                .store
                .file_by_absolute_path(&candidate.to_string_lossy())
                .await?
            {
                target = Some(node);
                break;
            }
        }

        match target {
            Some(target) => {
                self.emit_edges(file, source_scopes, source_family, &target, reference)
                    .await
            }
            None => {
                // Not in the graph: probe disk so the placeholder points at
                // the real path when one exists; otherwise prefer the first
                // candidate that carries an extension over a bare directory
                // path.
                let mut mentioned = None;
                for candidate in &candidates {
                    if tokio::fs::metadata(candidate).await.is_ok() {
                        mentioned = Some(candidate.clone());
                        break;
                    }
                }
                let mentioned = mentioned
                    .or_else(|| {
                        candidates
                            .iter()
                            .find(|c| c.extension().is_some())
                            .cloned()
                    })
                    .unwrap_or_else(|| candidates[0].clone());
                self.emit_pending(file, source_scopes, reference, &mentioned)
                    .await
            }
        }
    }

    /// Apply the edge policy against a target that exists in the graph.
    async fn emit_edges(
        &self,
        file: &Node,
        source_scopes: &[Node],
        source_family: Family,
        target: &Node,
        reference: &RawReference,
    ) -> Result<ResolveStats> {
        let mut stats = ResolveStats::default();
        let target_family = target
            .absolute_path()
            .and_then(|p| Path::new(p).extension())
            .and_then(|e| e.to_str())
            .map(extract::family_of)
            .unwrap_or(Family::Other);

        // Documents reference, they do not import.
        if source_family == Family::Markdown {
            self.store
                .create_edges(vec![
                    Edge::new(EdgeType::ReferencesDoc, &file.uuid, &target.uuid)
                        .with_prop("importPath", reference.source.as_str()),
                ])
                .await?;
            stats.docs += 1;
            return Ok(stats);
        }

        match target_family {
            Family::TsJs | Family::Python | Family::Component => {
                if target.file_state().is_linked() {
                    stats.absorb(
                        self.emit_code_edges(file, source_scopes, target, reference)
                            .await?,
                    );
                } else {
                    stats.absorb(
                        self.emit_pending_to_node(file, source_scopes, reference, target)
                            .await?,
                    );
                }
            }
            Family::Markdown | Family::Document => {
                self.store
                    .create_edges(vec![
                        Edge::new(EdgeType::ReferencesDoc, &file.uuid, &target.uuid)
                            .with_prop("importPath", reference.source.as_str()),
                    ])
                    .await?;
                stats.docs += 1;
            }
            _ => {
                self.store
                    .create_edges(vec![
                        Edge::new(EdgeType::ReferencesAsset, &file.uuid, &target.uuid)
                            .with_prop("importPath", reference.source.as_str()),
                    ])
                    .await?;
                stats.assets += 1;
            }
        }
        Ok(stats)
    }

    /// Scope-level `CONSUMES` where symbols match, file-level `IMPORTS`
    /// otherwise.
    async fn emit_code_edges(
        &self,
        file: &Node,
        source_scopes: &[Node],
        target: &Node,
        reference: &RawReference,
    ) -> Result<ResolveStats> {
        let mut stats = ResolveStats::default();
        let target_scopes = self.scopes_of(&target.uuid).await?;
        let wildcard = reference.symbols.iter().any(|s| s == "*");

        if source_scopes.is_empty() || target_scopes.is_empty() || reference.symbols.is_empty() {
            self.store
                .create_edges(vec![
                    Edge::new(EdgeType::Imports, &file.uuid, &target.uuid)
                        .with_prop("importPath", reference.source.as_str()),
                ])
                .await?;
            stats.imports += 1;
            return Ok(stats);
        }

        let mut edges = Vec::new();
        for target_scope in &target_scopes {
            let matched_symbol = if wildcard {
                target_scope.prop_str("name").map(str::to_string)
            } else {
                reference
                    .symbols
                    .iter()
                    .find(|symbol| {
                        target_scope.prop_str("name") == Some(symbol.as_str())
                            || target_scope.prop_str("exportedAs") == Some(symbol.as_str())
                    })
                    .cloned()
            };
            let Some(symbol) = matched_symbol else {
                continue;
            };
            let source = source_scope_for(source_scopes, &symbol)
                .unwrap_or_else(|| source_scopes[0].uuid.clone());
            edges.push(
                Edge::new(EdgeType::Consumes, source, &target_scope.uuid)
                    .with_prop("symbols", serde_json::json!([symbol]))
                    .with_prop("importPath", reference.source.as_str()),
            );
        }

        if edges.is_empty() {
            self.store
                .create_edges(vec![
                    Edge::new(EdgeType::Imports, &file.uuid, &target.uuid)
                        .with_prop("importPath", reference.source.as_str()),
                ])
                .await?;
            stats.imports += 1;
        } else {
            stats.consumes += self.store.create_edges(edges).await?;
        }
        Ok(stats)
    }

    /// Create (or reuse) a mentioned-file placeholder and attach a pending
    /// import.
    async fn emit_pending(
        &self,
        file: &Node,
        source_scopes: &[Node],
        reference: &RawReference,
        mentioned_path: &Path,
    ) -> Result<ResolveStats> {
        let path_str = mentioned_path.to_string_lossy().into_owned();
        let placeholder = match self.store.file_by_absolute_path(&path_str).await? {
            Some(existing) => existing,
            None => {
                let mut node = Node::new(
                    Label::File,
                    hash::node_uuid("file", &format!("{}:{path_str}", self.project_id)),
                    self.project_id.clone(),
                );
                node.set_prop("absolutePath", path_str.as_str());
                if let Ok(rel) = mentioned_path.strip_prefix(&self.project_root) {
                    node.set_prop("path", rel.to_string_lossy().into_owned());
                }
                node.set_prop("state", FileState::Discovered.as_str());
                node.set_prop("mentioned", true);
                self.store.upsert_nodes(vec![node.clone()]).await?;
                node
            }
        };
        self.emit_pending_to_node(file, source_scopes, reference, &placeholder)
            .await
    }

    async fn emit_pending_to_node(
        &self,
        file: &Node,
        source_scopes: &[Node],
        reference: &RawReference,
        target: &Node,
    ) -> Result<ResolveStats> {
        let source = reference
            .symbols
            .first()
            .and_then(|symbol| source_scope_for(source_scopes, symbol))
            .unwrap_or_else(|| file.uuid.clone());
        let created = self
            .store
            .create_edges(vec![
                Edge::new(EdgeType::PendingImport, source, &target.uuid)
                    .with_prop("symbols", serde_json::json!(reference.symbols))
                    .with_prop("importPath", reference.source.as_str()),
            ])
            .await?;
        Ok(ResolveStats {
            pending: created,
            ..Default::default()
        })
    }

    /// Upgrade every pending import targeting a file that just reached
    /// `linked`. Returns the number of upgraded edges.
    pub async fn on_file_linked(&self, target: &Node) -> Result<usize> {
        let pending = self
            .store
            .edges_to(&target.uuid, Some(EdgeType::PendingImport))
            .await?;
        if pending.is_empty() {
            return Ok(0);
        }

        let mut upgraded = 0;
        for edge in pending {
            let Some(importer) = self.store.get_node(&edge.from).await? else {
                continue;
            };
            // The importing file: the importer itself, or the file a scope
            // is defined in.
            let importing_file = if importer.label == Label::File {
                Some(importer.clone())
            } else {
                let defined_in = self
                    .store
                    .edges_from(&importer.uuid, Some(EdgeType::DefinedIn))
                    .await?;
                match defined_in.first() {
                    Some(e) => self.store.get_node(&e.to).await?,
                    None => None,
                }
            };
            let Some(importing_file) = importing_file else {
                continue;
            };

            let symbols: Vec<String> = edge
                .properties
                .get("symbols")
                .and_then(|v| v.as_array())
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();
            let import_path = edge
                .properties
                .get("importPath")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();

            self.store
                .delete_edge(EdgeType::PendingImport, &edge.from, &edge.to)
                .await?;

            let source_family = importing_file
                .absolute_path()
                .and_then(|p| Path::new(p).extension())
                .and_then(|e| e.to_str())
                .map(extract::family_of)
                .unwrap_or(Family::Other);
            let source_scopes = self.scopes_of(&importing_file.uuid).await?;
            let reference = RawReference {
                source: import_path,
                symbols,
            };
            self.emit_edges(
                &importing_file,
                &source_scopes,
                source_family,
                target,
                &reference,
            )
            .await?;
            upgraded += 1;
        }
        debug!(target = ?target.absolute_path(), upgraded, "pending imports upgraded");
        Ok(upgraded)
    }
}

/// Pick the importing scope for a symbol: the first scope whose content
/// mentions it.
fn source_scope_for(source_scopes: &[Node], symbol: &str) -> Option<String> {
    source_scopes
        .iter()
        .find(|scope| {
            scope
                .prop_str("content")
                .is_some_and(|content| content.contains(symbol))
        })
        .map(|scope| scope.uuid.clone())
}
