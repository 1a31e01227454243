//! Bundled in-process implementation of the [`GraphStore`] contract.
//!
//! Nodes and edges live behind a `parking_lot::RwLock`; per-`(label, facet)`
//! cosine vector indexes are HNSW structures rebuilt from node vectors on
//! load; the unified full-text index is a Tantivy directory with BM25
//! scoring. Durable state is a snapshot file (see [`super::storage`]) plus
//! the Tantivy directory, both living under the brain directory.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tantivy::collector::TopDocs;
use tantivy::query::{BooleanQuery, FuzzyTermQuery, Occur, Query, QueryParser};
use tantivy::schema::{
    Field, IndexRecordOption, Schema as TantivySchema, TextFieldIndexing, TextOptions, STORED,
    STRING,
};
use tantivy::{Index as TantivyIndex, IndexWriter, ReloadPolicy, TantivyDocument, Term};
use tracing::{debug, info};
use usearch::Index as HnswIndex;

use crate::error::{Error, Result};
use crate::graph::storage::{self, StoredEdge, StoredGraph, StoredNode};
use crate::graph::store::{GraphStore, UpsertCounts};
use crate::graph::{now_iso, Edge, EdgeType, Label, Node, PropertyMap};

/// Edge-creation batch size, matching the UNWIND batch size a server-backed
/// store would receive.
pub const EDGE_BATCH: usize = 500;

// ── Full-text index ──────────────────────────────────────────────────

struct FtsFields {
    uuid: Field,
    name: Field,
    content: Field,
    description: Field,
}

struct Fts {
    index: TantivyIndex,
    fields: FtsFields,
    writer: Mutex<IndexWriter>,
}

fn build_fts_schema() -> (TantivySchema, FtsFields) {
    let mut builder = TantivySchema::builder();
    let uuid = builder.add_text_field("uuid", STRING | STORED);

    // The default tokenizer (lowercase, no stemming) keeps indexed terms
    // literal, which the raw fuzzy-term path depends on.
    let text_indexing = TextFieldIndexing::default()
        .set_tokenizer("default")
        .set_index_option(IndexRecordOption::WithFreqsAndPositions);
    let text_options = TextOptions::default().set_indexing_options(text_indexing);
    let name = builder.add_text_field("name", text_options.clone());
    let content = builder.add_text_field("content", text_options.clone());
    let description = builder.add_text_field("description", text_options);

    let schema = builder.build();
    (
        schema,
        FtsFields {
            uuid,
            name,
            content,
            description,
        },
    )
}

/// Escape Lucene special characters in a raw query string.
fn escape_lucene(query: &str) -> String {
    let mut out = String::with_capacity(query.len());
    for c in query.chars() {
        if matches!(
            c,
            '+' | '-' | '&' | '|' | '!' | '(' | ')' | '{' | '}' | '[' | ']' | '^' | '"' | '~'
                | '*' | '?' | ':' | '\\' | '/'
        ) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

impl Fts {
    fn open(dir: Option<&Path>) -> Result<Self> {
        let (schema, fields) = build_fts_schema();
        let index = match dir {
            Some(path) => {
                if path.exists() && path.join("meta.json").exists() {
                    TantivyIndex::open_in_dir(path).map_err(|e| Error::Fts(e.to_string()))?
                } else {
                    std::fs::create_dir_all(path)?;
                    TantivyIndex::create_in_dir(path, schema)
                        .map_err(|e| Error::Fts(e.to_string()))?
                }
            }
            None => TantivyIndex::create_in_ram(schema),
        };
        let writer = index
            .writer(50_000_000)
            .map_err(|e| Error::Fts(e.to_string()))?;
        Ok(Self {
            index,
            fields,
            writer: Mutex::new(writer),
        })
    }

    fn upsert(&self, node: &Node) -> Result<()> {
        let writer = self.writer.lock();
        writer.delete_term(Term::from_field_text(self.fields.uuid, &node.uuid));

        let mut doc = TantivyDocument::new();
        doc.add_text(self.fields.uuid, &node.uuid);
        if let Some(name) = node.prop_str("name") {
            doc.add_text(self.fields.name, name);
        }
        if let Some(content) = node_text(node, "content") {
            doc.add_text(self.fields.content, &content);
        }
        if let Some(desc) = node.prop_str("description") {
            doc.add_text(self.fields.description, desc);
        }
        writer
            .add_document(doc)
            .map_err(|e| Error::Fts(e.to_string()))?;
        Ok(())
    }

    fn delete(&self, uuid: &str) {
        let writer = self.writer.lock();
        writer.delete_term(Term::from_field_text(self.fields.uuid, uuid));
    }

    fn commit(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.commit().map_err(|e| Error::Fts(e.to_string()))?;
        Ok(())
    }

    fn num_docs(&self) -> Result<u64> {
        let reader = self
            .index
            .reader_builder()
            .reload_policy(ReloadPolicy::OnCommitWithDelay)
            .try_into()
            .map_err(|e: tantivy::TantivyError| Error::Fts(e.to_string()))?;
        Ok(reader.searcher().num_docs())
    }

    fn search(&self, query_str: &str, fuzzy_distance: u8, limit: usize) -> Result<Vec<(String, f32)>> {
        let query_str = query_str.trim();
        if query_str.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let reader = self
            .index
            .reader_builder()
            .reload_policy(ReloadPolicy::OnCommitWithDelay)
            .try_into()
            .map_err(|e: tantivy::TantivyError| Error::Fts(e.to_string()))?;
        let searcher = reader.searcher();

        let text_fields = [self.fields.name, self.fields.content, self.fields.description];

        let query: Box<dyn Query> = if fuzzy_distance == 0 {
            let parser = QueryParser::for_index(&self.index, text_fields.to_vec());
            let (parsed, _errors) = parser.parse_query_lenient(&escape_lucene(query_str));
            parsed
        } else {
            // One fuzzy term per (word, field); any match contributes.
            let mut clauses: Vec<(Occur, Box<dyn Query>)> = Vec::new();
            for word in query_str.split_whitespace() {
                let word: String = word
                    .chars()
                    .filter(|c| c.is_alphanumeric())
                    .collect::<String>()
                    .to_lowercase();
                if word.is_empty() {
                    continue;
                }
                for field in text_fields {
                    let term = Term::from_field_text(field, &word);
                    clauses.push((
                        Occur::Should,
                        Box::new(FuzzyTermQuery::new(term, fuzzy_distance, true)),
                    ));
                }
            }
            if clauses.is_empty() {
                return Ok(Vec::new());
            }
            Box::new(BooleanQuery::new(clauses))
        };

        let top_docs = searcher
            .search(&query, &TopDocs::with_limit(limit))
            .map_err(|e| Error::Fts(e.to_string()))?;

        let mut results = Vec::with_capacity(top_docs.len());
        for (score, doc_address) in top_docs {
            let doc: TantivyDocument = searcher
                .doc(doc_address)
                .map_err(|e| Error::Fts(e.to_string()))?;
            let uuid = doc
                .get_first(self.fields.uuid)
                .and_then(|v: &tantivy::schema::OwnedValue| {
                    if let tantivy::schema::OwnedValue::Str(s) = v {
                        Some(s.clone())
                    } else {
                        None
                    }
                });
            if let Some(uuid) = uuid {
                results.push((uuid, score));
            }
        }
        Ok(results)
    }
}

/// Derive the full-text content of a node: string properties pass through,
/// arrays of strings are concatenated. `EmbeddingChunk` stores its text
/// under `text`.
fn node_text(node: &Node, key: &str) -> Option<String> {
    let key = if node.label == Label::EmbeddingChunk && key == "content" {
        "text"
    } else {
        key
    };
    match node.properties.get(key)? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Array(items) => {
            let parts: Vec<&str> = items.iter().filter_map(|v| v.as_str()).collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join("\n"))
            }
        }
        _ => None,
    }
}

// ── Vector indexes ───────────────────────────────────────────────────

struct VectorIndex {
    index: HnswIndex,
    dimensions: usize,
    key_of: HashMap<String, u64>,
    uuid_of: HashMap<u64, String>,
    next_key: u64,
}

impl VectorIndex {
    fn new(dimensions: usize) -> Result<Self> {
        let opts = usearch::IndexOptions {
            dimensions,
            metric: usearch::MetricKind::Cos,
            quantization: usearch::ScalarKind::F32,
            connectivity: 16,
            expansion_add: 128,
            expansion_search: 64,
            multi: false,
        };
        let index = HnswIndex::new(&opts)
            .map_err(|e| Error::Serialization(format!("failed to create vector index: {e}")))?;
        index
            .reserve(16)
            .map_err(|e| Error::Serialization(format!("vector index reserve: {e}")))?;
        Ok(Self {
            index,
            dimensions,
            key_of: HashMap::new(),
            uuid_of: HashMap::new(),
            next_key: 0,
        })
    }

    fn add(&mut self, uuid: &str, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimensions {
            return Err(Error::store_fatal(format!(
                "vector dimension mismatch: index expects {}, got {}",
                self.dimensions,
                vector.len()
            )));
        }
        if let Some(&key) = self.key_of.get(uuid) {
            let _ = self.index.remove(key);
            self.uuid_of.remove(&key);
        }
        let key = self.next_key;
        self.next_key += 1;

        if self.index.size() + 1 >= self.index.capacity() {
            let target = (self.index.capacity() * 2).max(16);
            self.index
                .reserve(target)
                .map_err(|e| Error::Serialization(format!("vector index reserve: {e}")))?;
        }
        self.index
            .add(key, vector)
            .map_err(|e| Error::Serialization(format!("vector index add: {e}")))?;
        self.key_of.insert(uuid.to_string(), key);
        self.uuid_of.insert(key, uuid.to_string());
        Ok(())
    }

    fn remove(&mut self, uuid: &str) {
        if let Some(key) = self.key_of.remove(uuid) {
            let _ = self.index.remove(key);
            self.uuid_of.remove(&key);
        }
    }

    fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<(String, f32)>> {
        if self.index.size() == 0 {
            return Ok(Vec::new());
        }
        let matches = self
            .index
            .search(query, top_k)
            .map_err(|e| Error::Serialization(format!("vector search: {e}")))?;
        let mut out = Vec::with_capacity(matches.keys.len());
        for (key, distance) in matches.keys.iter().zip(matches.distances.iter()) {
            if let Some(uuid) = self.uuid_of.get(key) {
                // usearch reports cosine distance; similarity = 1 - distance.
                out.push((uuid.clone(), (1.0 - distance).clamp(-1.0, 1.0)));
            }
        }
        Ok(out)
    }
}

// ── Graph state ──────────────────────────────────────────────────────

#[derive(Default)]
struct GraphState {
    nodes: HashMap<String, Node>,
    file_by_path: HashMap<String, String>,
    dir_by_path: HashMap<String, String>,
    project_by_id: HashMap<String, String>,
    out: HashMap<String, Vec<Edge>>,
    incoming: HashMap<String, Vec<Edge>>,
}

impl GraphState {
    fn index_node(&mut self, node: &Node) {
        match node.label {
            Label::File => {
                if let Some(p) = node.absolute_path() {
                    self.file_by_path.insert(p.to_string(), node.uuid.clone());
                }
            }
            Label::Directory => {
                if let Some(p) = node.prop_str("path") {
                    self.dir_by_path.insert(p.to_string(), node.uuid.clone());
                }
            }
            Label::Project => {
                self.project_by_id
                    .insert(node.project_id.clone(), node.uuid.clone());
            }
            _ => {}
        }
    }

    fn unindex_node(&mut self, node: &Node) {
        match node.label {
            Label::File => {
                if let Some(p) = node.absolute_path() {
                    self.file_by_path.remove(p);
                }
            }
            Label::Directory => {
                if let Some(p) = node.prop_str("path") {
                    self.dir_by_path.remove(p);
                }
            }
            Label::Project => {
                self.project_by_id.remove(&node.project_id);
            }
            _ => {}
        }
    }

    /// Find the stored uuid a new node merges onto, via its label's key.
    fn merge_target(&self, node: &Node) -> Option<String> {
        match node.label {
            Label::Project => self.project_by_id.get(&node.project_id).cloned(),
            Label::File => node
                .absolute_path()
                .and_then(|p| self.file_by_path.get(p))
                .cloned(),
            Label::Directory => node
                .prop_str("path")
                .and_then(|p| self.dir_by_path.get(p))
                .cloned(),
            _ => {
                if self.nodes.contains_key(&node.uuid) {
                    Some(node.uuid.clone())
                } else {
                    None
                }
            }
        }
    }

    fn detach(&mut self, uuid: &str) {
        if let Some(edges) = self.out.remove(uuid) {
            for edge in edges {
                if let Some(inc) = self.incoming.get_mut(&edge.to) {
                    inc.retain(|e| !(e.from == edge.from && e.edge_type == edge.edge_type));
                }
            }
        }
        if let Some(edges) = self.incoming.remove(uuid) {
            for edge in edges {
                if let Some(out) = self.out.get_mut(&edge.from) {
                    out.retain(|e| !(e.to == edge.to && e.edge_type == edge.edge_type));
                }
            }
        }
    }
}

/// In-process graph store.
pub struct MemoryGraph {
    snapshot_path: Option<PathBuf>,
    state: RwLock<GraphState>,
    vectors: RwLock<HashMap<(Label, String), VectorIndex>>,
    fts: Fts,
}

impl MemoryGraph {
    /// Ephemeral store with a RAM-backed full-text index. For tests and
    /// one-shot runs.
    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            snapshot_path: None,
            state: RwLock::new(GraphState::default()),
            vectors: RwLock::new(HashMap::new()),
            fts: Fts::open(None)?,
        })
    }

    /// Open (or create) a persistent store under the given directory:
    /// `dir/graph` holds the snapshot, `dir/fts/` the full-text index.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let snapshot_path = dir.join("graph");
        let fts = Fts::open(Some(&dir.join("fts")))?;

        let mut state = GraphState::default();
        if snapshot_path.exists() {
            let stored = storage::load_snapshot(&snapshot_path)?;
            for stored_node in stored.nodes {
                let node = stored_node.into_node()?;
                state.index_node(&node);
                state.nodes.insert(node.uuid.clone(), node);
            }
            for stored_edge in stored.edges {
                let edge = stored_edge.into_edge()?;
                state
                    .out
                    .entry(edge.from.clone())
                    .or_default()
                    .push(edge.clone());
                state.incoming.entry(edge.to.clone()).or_default().push(edge);
            }
            info!(
                nodes = state.nodes.len(),
                snapshot = %snapshot_path.display(),
                "loaded graph snapshot"
            );
        }

        let store = Self {
            snapshot_path: Some(snapshot_path),
            state: RwLock::new(state),
            vectors: RwLock::new(HashMap::new()),
            fts,
        };
        store.rebuild_vector_indexes()?;
        store.rebuild_fts_if_empty()?;
        Ok(store)
    }

    /// Rebuild all per-facet vector indexes from node vectors. Indexes are
    /// not serialized in the snapshot.
    fn rebuild_vector_indexes(&self) -> Result<()> {
        let state = self.state.read();
        let mut vectors = self.vectors.write();
        for node in state.nodes.values() {
            for (property, vector) in &node.embeddings {
                let key = (node.label, property.clone());
                if !vectors.contains_key(&key) {
                    vectors.insert(key.clone(), VectorIndex::new(vector.len())?);
                }
                if let Some(index) = vectors.get_mut(&key) {
                    index.add(&node.uuid, vector)?;
                }
            }
        }
        Ok(())
    }

    /// Rebuild the full-text index from stored nodes when it is empty but
    /// the graph is not (lost or wiped directory).
    fn rebuild_fts_if_empty(&self) -> Result<()> {
        let state = self.state.read();
        let content_count = state.nodes.values().filter(|n| n.label.is_content()).count();
        if content_count == 0 || self.fts.num_docs().unwrap_or(0) > 0 {
            return Ok(());
        }
        info!(
            nodes = content_count,
            "full-text index empty but graph has content nodes, rebuilding"
        );
        for node in state.nodes.values().filter(|n| n.label.is_content()) {
            self.fts.upsert(node)?;
        }
        self.fts.commit()?;
        Ok(())
    }

    #[cfg(test)]
    fn edge_count(&self) -> usize {
        self.state.read().out.values().map(|v| v.len()).sum()
    }
}

#[async_trait]
impl GraphStore for MemoryGraph {
    async fn upsert_nodes(&self, nodes: Vec<Node>) -> Result<UpsertCounts> {
        let mut counts = UpsertCounts::default();
        let mut state = self.state.write();
        for mut node in nodes {
            match state.merge_target(&node) {
                Some(existing_uuid) => {
                    counts.updated += 1;
                    let existing = state
                        .nodes
                        .get(&existing_uuid)
                        .cloned()
                        .ok_or_else(|| Error::store_fatal("stale merge index"))?;
                    state.unindex_node(&existing);
                    // Keep the stored identity and any already-computed
                    // embeddings; the dirty flag governs regeneration.
                    node.uuid = existing_uuid.clone();
                    if node.embeddings.is_empty() {
                        node.embeddings = existing.embeddings;
                        node.embedding_hashes = existing.embedding_hashes;
                    }
                    node.schema_dirty = false;
                    if node.label.is_content() {
                        self.fts.upsert(&node)?;
                    }
                    state.index_node(&node);
                    state.nodes.insert(existing_uuid, node);
                }
                None => {
                    counts.created += 1;
                    node.schema_dirty = false;
                    if node.label.is_content() {
                        self.fts.upsert(&node)?;
                    }
                    state.index_node(&node);
                    state.nodes.insert(node.uuid.clone(), node);
                }
            }
        }
        drop(state);
        self.fts.commit()?;
        Ok(counts)
    }

    async fn get_node(&self, uuid: &str) -> Result<Option<Node>> {
        Ok(self.state.read().nodes.get(uuid).cloned())
    }

    async fn get_nodes(&self, uuids: &[String]) -> Result<Vec<Node>> {
        let state = self.state.read();
        Ok(uuids
            .iter()
            .filter_map(|u| state.nodes.get(u).cloned())
            .collect())
    }

    async fn delete_nodes(&self, uuids: &[String]) -> Result<usize> {
        let mut state = self.state.write();
        let mut deleted = 0;
        let mut removed_nodes: Vec<Node> = Vec::new();
        for uuid in uuids {
            if let Some(node) = state.nodes.remove(uuid) {
                state.unindex_node(&node);
                state.detach(uuid);
                self.fts.delete(uuid);
                removed_nodes.push(node);
                deleted += 1;
            }
        }
        drop(state);

        let mut vectors = self.vectors.write();
        for node in &removed_nodes {
            for property in node.embeddings.keys() {
                if let Some(index) = vectors.get_mut(&(node.label, property.clone())) {
                    index.remove(&node.uuid);
                }
            }
        }
        drop(vectors);

        self.fts.commit()?;
        Ok(deleted)
    }

    async fn delete_project_nodes(&self, project_id: &str) -> Result<usize> {
        let uuids: Vec<String> = {
            let state = self.state.read();
            state
                .nodes
                .values()
                .filter(|n| n.project_id == project_id)
                .map(|n| n.uuid.clone())
                .collect()
        };
        self.delete_nodes(&uuids).await
    }

    async fn file_by_absolute_path(&self, absolute_path: &str) -> Result<Option<Node>> {
        let state = self.state.read();
        Ok(state
            .file_by_path
            .get(absolute_path)
            .and_then(|uuid| state.nodes.get(uuid))
            .cloned())
    }

    async fn files_in_project(&self, project_id: &str) -> Result<Vec<Node>> {
        self.nodes_with_label(Label::File, Some(project_id)).await
    }

    async fn file_hashes(&self, absolute_paths: &[String]) -> Result<HashMap<String, String>> {
        let state = self.state.read();
        let mut out = HashMap::new();
        for path in absolute_paths {
            if let Some(node) = state.file_by_path.get(path).and_then(|u| state.nodes.get(u)) {
                if let Some(hash) = &node.hash {
                    out.insert(path.clone(), hash.clone());
                }
            }
        }
        Ok(out)
    }

    async fn content_hashes(&self, uuids: &[String]) -> Result<HashMap<String, String>> {
        let state = self.state.read();
        let mut out = HashMap::new();
        for uuid in uuids {
            if let Some(hash) = state.nodes.get(uuid).and_then(|n| n.hash.clone()) {
                out.insert(uuid.clone(), hash);
            }
        }
        Ok(out)
    }

    async fn nodes_defined_in(&self, file_uuid: &str) -> Result<Vec<Node>> {
        let state = self.state.read();
        let mut out = Vec::new();
        if let Some(edges) = state.incoming.get(file_uuid) {
            for edge in edges {
                if edge.edge_type == EdgeType::DefinedIn {
                    if let Some(node) = state.nodes.get(&edge.from) {
                        out.push(node.clone());
                    }
                }
            }
        }
        Ok(out)
    }

    async fn nodes_with_label(&self, label: Label, project_id: Option<&str>) -> Result<Vec<Node>> {
        let state = self.state.read();
        Ok(state
            .nodes
            .values()
            .filter(|n| n.label == label)
            .filter(|n| project_id.map_or(true, |p| n.project_id == p))
            .cloned()
            .collect())
    }

    async fn content_nodes(&self, project_id: Option<&str>) -> Result<Vec<Node>> {
        let state = self.state.read();
        Ok(state
            .nodes
            .values()
            .filter(|n| n.label.is_content())
            .filter(|n| project_id.map_or(true, |p| n.project_id == p))
            .cloned()
            .collect())
    }

    async fn count_nodes(&self, project_id: &str) -> Result<usize> {
        let state = self.state.read();
        Ok(state
            .nodes
            .values()
            .filter(|n| n.project_id == project_id)
            .count())
    }

    async fn orphan_nodes(&self) -> Result<Vec<String>> {
        let state = self.state.read();
        Ok(state
            .nodes
            .values()
            .filter(|n| n.project_id.is_empty())
            .map(|n| n.uuid.clone())
            .collect())
    }

    async fn files_with_schema_dirty(&self, project_id: &str) -> Result<HashSet<String>> {
        let state = self.state.read();
        let mut out = HashSet::new();
        for node in state.nodes.values() {
            if !(node.schema_dirty && node.label.is_content() && node.project_id == project_id) {
                continue;
            }
            let Some(edges) = state.out.get(&node.uuid) else {
                continue;
            };
            for edge in edges {
                if edge.edge_type != EdgeType::DefinedIn {
                    continue;
                }
                if let Some(path) = state
                    .nodes
                    .get(&edge.to)
                    .and_then(|file| file.absolute_path())
                {
                    out.insert(path.to_string());
                }
            }
        }
        Ok(out)
    }

    async fn update_properties(&self, uuid: &str, props: PropertyMap) -> Result<bool> {
        let mut state = self.state.write();
        let Some(node) = state.nodes.get_mut(uuid) else {
            return Ok(false);
        };
        for (key, value) in props {
            if value.is_null() {
                node.properties.remove(&key);
            } else {
                node.properties.insert(key, value);
            }
        }
        // The raw-content hash rides in the property bag on writes from the
        // processor; mirror it into the typed field.
        if let Some(hash) = node.prop_str("hash").map(str::to_string) {
            node.hash = Some(hash);
        }
        let updated = node.clone();
        state.index_node(&updated);
        if updated.label.is_content() {
            self.fts.upsert(&updated)?;
            drop(state);
            self.fts.commit()?;
        }
        Ok(true)
    }

    async fn set_flags(
        &self,
        uuid: &str,
        embeddings_dirty: Option<bool>,
        schema_dirty: Option<bool>,
    ) -> Result<bool> {
        let mut state = self.state.write();
        let Some(node) = state.nodes.get_mut(uuid) else {
            return Ok(false);
        };
        if let Some(flag) = embeddings_dirty {
            node.embeddings_dirty = flag;
        }
        if let Some(flag) = schema_dirty {
            node.schema_dirty = flag;
        }
        Ok(true)
    }

    async fn mark_schema_outdated(&self, label: Label, current: &str) -> Result<usize> {
        let mut state = self.state.write();
        let mut flagged = 0;
        for node in state.nodes.values_mut() {
            if node.label == label && node.schema_version.as_deref() != Some(current) {
                node.schema_dirty = true;
                node.embeddings_dirty = true;
                flagged += 1;
            }
        }
        if flagged > 0 {
            debug!(label = %label, flagged, "flagged schema-outdated nodes");
        }
        Ok(flagged)
    }

    async fn create_edges(&self, edges: Vec<Edge>) -> Result<usize> {
        let mut created = 0;
        // Dispatch in UNWIND-sized batches; each batch completes atomically
        // with respect to readers.
        for batch in edges.chunks(EDGE_BATCH) {
            let mut state = self.state.write();
            for edge in batch {
                if !state.nodes.contains_key(&edge.from) || !state.nodes.contains_key(&edge.to) {
                    continue;
                }
                let exists = state.out.get(&edge.from).is_some_and(|outgoing| {
                    outgoing
                        .iter()
                        .any(|e| e.edge_type == edge.edge_type && e.to == edge.to)
                });
                if exists {
                    continue;
                }
                state
                    .out
                    .entry(edge.from.clone())
                    .or_default()
                    .push(edge.clone());
                state
                    .incoming
                    .entry(edge.to.clone())
                    .or_default()
                    .push(edge.clone());
                created += 1;
            }
        }
        Ok(created)
    }

    async fn edges_from(&self, uuid: &str, edge_type: Option<EdgeType>) -> Result<Vec<Edge>> {
        let state = self.state.read();
        Ok(state
            .out
            .get(uuid)
            .map(|edges| {
                edges
                    .iter()
                    .filter(|e| edge_type.map_or(true, |t| e.edge_type == t))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn edges_to(&self, uuid: &str, edge_type: Option<EdgeType>) -> Result<Vec<Edge>> {
        let state = self.state.read();
        Ok(state
            .incoming
            .get(uuid)
            .map(|edges| {
                edges
                    .iter()
                    .filter(|e| edge_type.map_or(true, |t| e.edge_type == t))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_edges_from(&self, uuid: &str, edge_type: Option<EdgeType>) -> Result<usize> {
        let mut state = self.state.write();
        let Some(outgoing) = state.out.get_mut(uuid) else {
            return Ok(0);
        };
        let (remove, keep): (Vec<Edge>, Vec<Edge>) = outgoing
            .drain(..)
            .partition(|e| edge_type.map_or(true, |t| e.edge_type == t));
        *outgoing = keep;
        let removed = remove.len();
        for edge in remove {
            if let Some(inc) = state.incoming.get_mut(&edge.to) {
                inc.retain(|e| !(e.from == edge.from && e.edge_type == edge.edge_type));
            }
        }
        Ok(removed)
    }

    async fn delete_edge(&self, edge_type: EdgeType, from: &str, to: &str) -> Result<bool> {
        let mut state = self.state.write();
        let mut removed = false;
        if let Some(outgoing) = state.out.get_mut(from) {
            let before = outgoing.len();
            outgoing.retain(|e| !(e.edge_type == edge_type && e.to == to));
            removed = outgoing.len() != before;
        }
        if removed {
            if let Some(inc) = state.incoming.get_mut(to) {
                inc.retain(|e| !(e.edge_type == edge_type && e.from == from));
            }
        }
        Ok(removed)
    }

    async fn ensure_vector_index(
        &self,
        label: Label,
        property: &str,
        dimensions: usize,
    ) -> Result<()> {
        let mut vectors = self.vectors.write();
        let key = (label, property.to_string());
        if !vectors.contains_key(&key) {
            debug!(label = %label, property, dimensions, "creating vector index");
            vectors.insert(key, VectorIndex::new(dimensions)?);
        }
        Ok(())
    }

    async fn has_vector_index(&self, label: Label, property: &str) -> Result<bool> {
        Ok(self
            .vectors
            .read()
            .contains_key(&(label, property.to_string())))
    }

    async fn write_embedding(
        &self,
        uuid: &str,
        property: &str,
        vector: Vec<f32>,
        text_hash: &str,
    ) -> Result<()> {
        let label = {
            let mut state = self.state.write();
            let Some(node) = state.nodes.get_mut(uuid) else {
                return Err(Error::store_fatal(format!("no such node: {uuid}")));
            };
            node.embeddings.insert(property.to_string(), vector.clone());
            node.embedding_hashes
                .insert(property.to_string(), text_hash.to_string());
            node.label
        };

        let mut vectors = self.vectors.write();
        if let Some(index) = vectors.get_mut(&(label, property.to_string())) {
            index.add(uuid, &vector)?;
        }
        Ok(())
    }

    async fn vector_search(
        &self,
        label: Label,
        property: &str,
        query: &[f32],
        top_k: usize,
    ) -> Result<Vec<(String, f32)>> {
        let vectors = self.vectors.read();
        match vectors.get(&(label, property.to_string())) {
            Some(index) => index.search(query, top_k),
            None => Ok(Vec::new()),
        }
    }

    async fn embedding_candidates(
        &self,
        label: Label,
        property: &str,
        cap: usize,
    ) -> Result<Vec<(String, Vec<f32>)>> {
        let state = self.state.read();
        Ok(state
            .nodes
            .values()
            .filter(|n| n.label == label)
            .filter_map(|n| {
                n.embeddings
                    .get(property)
                    .map(|v| (n.uuid.clone(), v.clone()))
            })
            .take(cap)
            .collect())
    }

    async fn fulltext_search(
        &self,
        query: &str,
        fuzzy_distance: u8,
        limit: usize,
    ) -> Result<Vec<(String, f32)>> {
        self.fts.search(query, fuzzy_distance, limit)
    }

    async fn save(&self) -> Result<()> {
        self.fts.commit()?;
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let stored = {
            let state = self.state.read();
            StoredGraph {
                nodes: state.nodes.values().map(StoredNode::from).collect(),
                edges: state
                    .out
                    .values()
                    .flat_map(|edges| edges.iter().map(StoredEdge::from))
                    .collect(),
                saved_at: now_iso(),
            }
        };
        storage::write_snapshot(path, &stored)?;
        debug!(snapshot = %path.display(), nodes = stored.nodes.len(), "saved graph snapshot");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope(uuid: &str, project: &str, name: &str, content: &str) -> Node {
        let mut node = Node::new(Label::Scope, uuid, project);
        node.set_prop("name", name).set_prop("content", content);
        node.hash = Some(node.compute_content_hash());
        node
    }

    fn file(uuid: &str, project: &str, path: &str) -> Node {
        let mut node = Node::new(Label::File, uuid, project);
        node.set_prop("absolutePath", path).set_prop("path", path);
        node
    }

    #[tokio::test]
    async fn upsert_creates_then_updates() {
        let store = MemoryGraph::in_memory().unwrap();
        let counts = store
            .upsert_nodes(vec![scope("scope:1", "p1", "x", "const x = 1")])
            .await
            .unwrap();
        assert_eq!(counts, UpsertCounts { created: 1, updated: 0 });

        let counts = store
            .upsert_nodes(vec![scope("scope:1", "p1", "x", "const x = 2")])
            .await
            .unwrap();
        assert_eq!(counts, UpsertCounts { created: 0, updated: 1 });

        let node = store.get_node("scope:1").await.unwrap().unwrap();
        assert_eq!(node.prop_str("content"), Some("const x = 2"));
    }

    #[tokio::test]
    async fn file_merges_by_absolute_path_keeping_uuid() {
        let store = MemoryGraph::in_memory().unwrap();
        store
            .upsert_nodes(vec![file("file:old", "p1", "/tmp/p/a.ts")])
            .await
            .unwrap();

        // Same path, different uuid: merge keeps the stored identity.
        let counts = store
            .upsert_nodes(vec![file("file:new", "p1", "/tmp/p/a.ts")])
            .await
            .unwrap();
        assert_eq!(counts.updated, 1);
        assert!(store.get_node("file:new").await.unwrap().is_none());
        let found = store
            .file_by_absolute_path("/tmp/p/a.ts")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.uuid, "file:old");
    }

    #[tokio::test]
    async fn delete_nodes_detaches_edges() {
        let store = MemoryGraph::in_memory().unwrap();
        store
            .upsert_nodes(vec![
                file("file:a", "p1", "/tmp/p/a.ts"),
                scope("scope:1", "p1", "x", "const x = 1"),
            ])
            .await
            .unwrap();
        store
            .create_edges(vec![Edge::new(EdgeType::DefinedIn, "scope:1", "file:a")])
            .await
            .unwrap();
        assert_eq!(store.edge_count(), 1);

        store.delete_nodes(&["scope:1".to_string()]).await.unwrap();
        assert_eq!(store.edge_count(), 0);
        assert!(store
            .nodes_defined_in("file:a")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn create_edges_deduplicates() {
        let store = MemoryGraph::in_memory().unwrap();
        store
            .upsert_nodes(vec![
                file("file:a", "p1", "/a"),
                file("file:b", "p1", "/b"),
            ])
            .await
            .unwrap();
        let edge = Edge::new(EdgeType::Imports, "file:a", "file:b");
        let created = store
            .create_edges(vec![edge.clone(), edge.clone()])
            .await
            .unwrap();
        assert_eq!(created, 1);
        let created = store.create_edges(vec![edge]).await.unwrap();
        assert_eq!(created, 0);
    }

    #[tokio::test]
    async fn edges_skip_missing_endpoints() {
        let store = MemoryGraph::in_memory().unwrap();
        store.upsert_nodes(vec![file("file:a", "p1", "/a")]).await.unwrap();
        let created = store
            .create_edges(vec![Edge::new(EdgeType::Imports, "file:a", "file:ghost")])
            .await
            .unwrap();
        assert_eq!(created, 0);
    }

    #[tokio::test]
    async fn vector_search_ranks_by_cosine() {
        let store = MemoryGraph::in_memory().unwrap();
        store
            .upsert_nodes(vec![
                scope("scope:1", "p1", "a", "aaa"),
                scope("scope:2", "p1", "b", "bbb"),
            ])
            .await
            .unwrap();
        store
            .ensure_vector_index(Label::Scope, "embedding_content", 3)
            .await
            .unwrap();
        store
            .write_embedding("scope:1", "embedding_content", vec![1.0, 0.0, 0.0], "h1")
            .await
            .unwrap();
        store
            .write_embedding("scope:2", "embedding_content", vec![0.0, 1.0, 0.0], "h2")
            .await
            .unwrap();

        let hits = store
            .vector_search(Label::Scope, "embedding_content", &[0.9, 0.1, 0.0], 2)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, "scope:1");
        assert!(hits[0].1 > hits[1].1);
    }

    #[tokio::test]
    async fn missing_index_returns_no_hits_but_candidates_exist() {
        let store = MemoryGraph::in_memory().unwrap();
        let mut node = scope("scope:1", "p1", "a", "aaa");
        node.embeddings
            .insert("embedding_content".into(), vec![1.0, 0.0]);
        store.upsert_nodes(vec![node]).await.unwrap();

        assert!(!store
            .has_vector_index(Label::Scope, "embedding_content")
            .await
            .unwrap());
        let candidates = store
            .embedding_candidates(Label::Scope, "embedding_content", 500)
            .await
            .unwrap();
        assert_eq!(candidates.len(), 1);
    }

    #[tokio::test]
    async fn fulltext_finds_content() {
        let store = MemoryGraph::in_memory().unwrap();
        store
            .upsert_nodes(vec![
                scope("scope:1", "p1", "parser", "tokenize the input stream"),
                scope("scope:2", "p1", "renderer", "draw pixels on screen"),
            ])
            .await
            .unwrap();

        let hits = store.fulltext_search("tokenize", 0, 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "scope:1");
    }

    #[tokio::test]
    async fn fulltext_fuzzy_tolerates_typos() {
        let store = MemoryGraph::in_memory().unwrap();
        store
            .upsert_nodes(vec![scope("scope:1", "p1", "parser", "tokenize input")])
            .await
            .unwrap();

        let hits = store.fulltext_search("tokenzie", 2, 10).await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn schema_outdated_flags_old_nodes() {
        let store = MemoryGraph::in_memory().unwrap();
        let mut old = scope("scope:1", "p1", "x", "const x = 1");
        old.schema_version = Some("oldfingerprint00".into());
        let mut new = scope("scope:2", "p1", "y", "const y = 2");
        new.schema_version = Some(Label::Scope.schema_version());
        store.upsert_nodes(vec![old, new]).await.unwrap();

        let flagged = store
            .mark_schema_outdated(Label::Scope, &Label::Scope.schema_version())
            .await
            .unwrap();
        assert_eq!(flagged, 1);
        let node = store.get_node("scope:1").await.unwrap().unwrap();
        assert!(node.schema_dirty);
        assert!(node.embeddings_dirty);
    }

    #[tokio::test]
    async fn persistent_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        {
            let store = MemoryGraph::open(dir.path()).unwrap();
            store
                .upsert_nodes(vec![
                    file("file:a", "p1", "/tmp/p/a.ts"),
                    scope("scope:1", "p1", "x", "const x = 1"),
                ])
                .await
                .unwrap();
            store
                .create_edges(vec![Edge::new(EdgeType::DefinedIn, "scope:1", "file:a")])
                .await
                .unwrap();
            store
                .ensure_vector_index(Label::Scope, "embedding_content", 2)
                .await
                .unwrap();
            store
                .write_embedding("scope:1", "embedding_content", vec![0.6, 0.8], "h1")
                .await
                .unwrap();
            store.save().await.unwrap();
        }

        let store = MemoryGraph::open(dir.path()).unwrap();
        let node = store.get_node("scope:1").await.unwrap().unwrap();
        assert_eq!(node.prop_str("name"), Some("x"));
        assert_eq!(store.nodes_defined_in("file:a").await.unwrap().len(), 1);

        // Vector index rebuilt from stored vectors.
        let hits = store
            .vector_search(Label::Scope, "embedding_content", &[0.6, 0.8], 1)
            .await
            .unwrap();
        assert_eq!(hits[0].0, "scope:1");
        // Full text survives through the tantivy directory.
        let hits = store.fulltext_search("const", 0, 10).await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn delete_project_nodes_removes_everything() {
        let store = MemoryGraph::in_memory().unwrap();
        store
            .upsert_nodes(vec![
                file("file:a", "p1", "/a"),
                scope("scope:1", "p1", "x", "1"),
                scope("scope:2", "p2", "y", "2"),
            ])
            .await
            .unwrap();
        let deleted = store.delete_project_nodes("p1").await.unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(store.count_nodes("p1").await.unwrap(), 0);
        assert_eq!(store.count_nodes("p2").await.unwrap(), 1);
    }

    #[test]
    fn escape_lucene_escapes_specials() {
        assert_eq!(escape_lucene("a+b"), "a\\+b");
        assert_eq!(escape_lucene("path/to:x"), "path\\/to\\:x");
        assert_eq!(escape_lucene("plain words"), "plain words");
    }
}
