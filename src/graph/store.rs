//! The graph-store contract.
//!
//! Everything the core requires of the external database: keyed upserts with
//! label sets and property maps, batched row-stream writes, cosine vector
//! indexes with lookup, and BM25 full-text over `name`/`content`/
//! `description`. The bundled [`MemoryGraph`](super::MemoryGraph) implements
//! the trait in-process; a server-backed store would implement it over the
//! wire.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;

use crate::error::Result;
use crate::graph::{Edge, EdgeType, Label, Node, PropertyMap};

/// Counts returned by a batch node upsert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertCounts {
    pub created: usize,
    pub updated: usize,
}

#[async_trait]
pub trait GraphStore: Send + Sync {
    // ── Nodes ────────────────────────────────────────────────────────

    /// Upsert a batch of nodes, merging by each label's canonical key
    /// (`projectId` for Project, `absolutePath` for File, `path` for
    /// Directory, `uuid` otherwise). Merging keeps the stored uuid;
    /// `schemaDirty` is cleared on write.
    async fn upsert_nodes(&self, nodes: Vec<Node>) -> Result<UpsertCounts>;

    async fn get_node(&self, uuid: &str) -> Result<Option<Node>>;

    async fn get_nodes(&self, uuids: &[String]) -> Result<Vec<Node>>;

    /// Detach-delete nodes: all touching edges go with them.
    async fn delete_nodes(&self, uuids: &[String]) -> Result<usize>;

    /// Detach-delete every node tagged with the project id.
    async fn delete_project_nodes(&self, project_id: &str) -> Result<usize>;

    async fn file_by_absolute_path(&self, absolute_path: &str) -> Result<Option<Node>>;

    async fn files_in_project(&self, project_id: &str) -> Result<Vec<Node>>;

    /// Stored raw-content hashes for the given absolute paths, fetched in a
    /// single round trip. Paths with no `File` node are absent from the map.
    async fn file_hashes(&self, absolute_paths: &[String]) -> Result<HashMap<String, String>>;

    /// Stored per-node content hashes for the given uuids.
    async fn content_hashes(&self, uuids: &[String]) -> Result<HashMap<String, String>>;

    /// Content nodes with an incoming `DEFINED_IN` edge to the file.
    async fn nodes_defined_in(&self, file_uuid: &str) -> Result<Vec<Node>>;

    async fn nodes_with_label(&self, label: Label, project_id: Option<&str>) -> Result<Vec<Node>>;

    /// All content nodes, optionally restricted to one project.
    async fn content_nodes(&self, project_id: Option<&str>) -> Result<Vec<Node>>;

    async fn count_nodes(&self, project_id: &str) -> Result<usize>;

    /// Uuids of nodes carrying no project id (GC targets).
    async fn orphan_nodes(&self) -> Result<Vec<String>>;

    /// Absolute paths of files owning at least one schema-dirty content
    /// node. Such files re-parse even when their bytes are unchanged.
    async fn files_with_schema_dirty(&self, project_id: &str) -> Result<HashSet<String>>;

    /// Merge properties into a node. A `null` value removes the property.
    /// Returns `false` when the node does not exist.
    async fn update_properties(&self, uuid: &str, props: PropertyMap) -> Result<bool>;

    async fn set_flags(
        &self,
        uuid: &str,
        embeddings_dirty: Option<bool>,
        schema_dirty: Option<bool>,
    ) -> Result<bool>;

    /// Flag content nodes of `label` whose stored `schemaVersion` differs
    /// from `current` as schema-dirty and embeddings-dirty. Returns the
    /// number of nodes flagged.
    async fn mark_schema_outdated(&self, label: Label, current: &str) -> Result<usize>;

    // ── Edges ────────────────────────────────────────────────────────

    /// Create edges, deduplicating on `(type, from, to)`. Implementations
    /// dispatch in batches grouped by `(type, source label, target label)`.
    async fn create_edges(&self, edges: Vec<Edge>) -> Result<usize>;

    async fn edges_from(&self, uuid: &str, edge_type: Option<EdgeType>) -> Result<Vec<Edge>>;

    async fn edges_to(&self, uuid: &str, edge_type: Option<EdgeType>) -> Result<Vec<Edge>>;

    async fn delete_edges_from(&self, uuid: &str, edge_type: Option<EdgeType>) -> Result<usize>;

    async fn delete_edge(&self, edge_type: EdgeType, from: &str, to: &str) -> Result<bool>;

    // ── Vector indexes ───────────────────────────────────────────────

    /// Ensure a cosine vector index exists for `(label, property)`. Created
    /// lazily on first eligible write.
    async fn ensure_vector_index(
        &self,
        label: Label,
        property: &str,
        dimensions: usize,
    ) -> Result<()>;

    async fn has_vector_index(&self, label: Label, property: &str) -> Result<bool>;

    /// Store a facet embedding and the hash of the text it was computed
    /// from, updating the vector index when one exists.
    async fn write_embedding(
        &self,
        uuid: &str,
        property: &str,
        vector: Vec<f32>,
        text_hash: &str,
    ) -> Result<()>;

    /// Cosine top-k lookup over the `(label, property)` index. Scores are in
    /// `[0, 1]`, best first.
    async fn vector_search(
        &self,
        label: Label,
        property: &str,
        query: &[f32],
        top_k: usize,
    ) -> Result<Vec<(String, f32)>>;

    /// Up to `cap` nodes of `label` carrying a vector for `property`; the
    /// in-process cosine fallback path when no index exists.
    async fn embedding_candidates(
        &self,
        label: Label,
        property: &str,
        cap: usize,
    ) -> Result<Vec<(String, Vec<f32>)>>;

    // ── Full text ────────────────────────────────────────────────────

    /// BM25 search over the unified `name`/`content`/`description` index.
    /// `fuzzy_distance` of 0 disables the fuzzy operator. Returns
    /// `(uuid, bm25_score)` best first.
    async fn fulltext_search(
        &self,
        query: &str,
        fuzzy_distance: u8,
        limit: usize,
    ) -> Result<Vec<(String, f32)>>;

    // ── Persistence ──────────────────────────────────────────────────

    /// Flush pending state to durable storage.
    async fn save(&self) -> Result<()>;
}
