//! Multi-facet embedding generation for dirty nodes.
//!
//! Each embeddable label declares facets (`embedding_name`,
//! `embedding_content`, `embedding_description`); a node is eligible when
//! its dirty flag is set or any facet's stored text-hash no longer matches
//! the text that would be embedded. Oversized content is split into
//! `EmbeddingChunk` nodes. Provider failures leave nodes dirty for the next
//! pass — embedding never fails a file.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::chunker;
use crate::embedding::EmbeddingProvider;
use crate::error::Result;
use crate::graph::{Edge, EdgeType, GraphStore, Label, Node};
use crate::hash;

/// Where a facet's text comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FacetSource {
    Name,
    Content,
    Description,
}

/// One embedding facet of a label.
#[derive(Debug, Clone, Copy)]
pub struct FacetSpec {
    pub property: &'static str,
    pub source: FacetSource,
    pub chunk_if_large: bool,
}

const NAME_FACET: FacetSpec = FacetSpec {
    property: "embedding_name",
    source: FacetSource::Name,
    chunk_if_large: false,
};
const CONTENT_FACET: FacetSpec = FacetSpec {
    property: "embedding_content",
    source: FacetSource::Content,
    chunk_if_large: true,
};
const DESCRIPTION_FACET: FacetSpec = FacetSpec {
    property: "embedding_description",
    source: FacetSource::Description,
    chunk_if_large: false,
};

/// Facet configuration per embeddable label.
pub fn facets_for(label: Label) -> &'static [FacetSpec] {
    match label {
        Label::Scope | Label::MarkdownSection | Label::DataFile | Label::DataSection => {
            &[NAME_FACET, CONTENT_FACET]
        }
        Label::MarkdownDocument
        | Label::PdfDocument
        | Label::WordDocument
        | Label::SpreadsheetDocument
        | Label::WebPage => &[NAME_FACET, CONTENT_FACET, DESCRIPTION_FACET],
        Label::CodeBlock => &[CONTENT_FACET],
        Label::ImageFile | Label::ThreeDFile => &[NAME_FACET, DESCRIPTION_FACET],
        Label::EmbeddingChunk => &[FacetSpec {
            property: "embedding_content",
            source: FacetSource::Content,
            chunk_if_large: false,
        }],
        Label::Project | Label::Directory | Label::File => &[],
    }
}

/// Derive the text a facet embeds from a node.
pub fn facet_text(node: &Node, source: FacetSource) -> Option<String> {
    let key = match source {
        FacetSource::Name => "name",
        FacetSource::Content => {
            if node.label == Label::EmbeddingChunk {
                "text"
            } else {
                "content"
            }
        }
        FacetSource::Description => "description",
    };
    match node.properties.get(key)? {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        serde_json::Value::Array(items) => {
            let parts: Vec<&str> = items.iter().filter_map(|v| v.as_str()).collect();
            let joined = parts.join("\n");
            if joined.trim().is_empty() {
                None
            } else {
                Some(joined)
            }
        }
        _ => None,
    }
}

/// Whether a node needs any embedding work (invariant I5).
pub fn is_embedding_candidate(node: &Node) -> bool {
    if !node.label.is_content() {
        return false;
    }
    if node.embeddings_dirty {
        return true;
    }
    facets_for(node.label).iter().any(|facet| {
        match facet_text(node, facet.source) {
            Some(text) => {
                node.embedding_hashes.get(facet.property).map(String::as_str)
                    != Some(hash::content_hash_str(&text).as_str())
            }
            None => false,
        }
    })
}

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct EmbedReport {
    pub nodes_processed: usize,
    pub facets_embedded: usize,
    pub facets_skipped: usize,
    pub chunks_created: usize,
    pub api_calls: usize,
    /// Provider failed mid-pass; unfinished nodes stay dirty.
    pub incomplete: bool,
}

struct EmbedJob {
    uuid: String,
    label: Label,
    property: &'static str,
    text: String,
    text_hash: String,
    /// Node whose dirty flag this job contributes to.
    owner: String,
}

pub struct EmbeddingCoordinator {
    store: Arc<dyn GraphStore>,
    provider: Arc<dyn EmbeddingProvider>,
    batch_size: usize,
    chunk_max_tokens: usize,
    chunk_overlap_tokens: usize,
}

impl EmbeddingCoordinator {
    pub fn new(
        store: Arc<dyn GraphStore>,
        provider: Arc<dyn EmbeddingProvider>,
        batch_size: usize,
        chunk_max_tokens: usize,
        chunk_overlap_tokens: usize,
    ) -> Self {
        Self {
            store,
            provider,
            batch_size,
            chunk_max_tokens,
            chunk_overlap_tokens,
        }
    }

    /// Embed every eligible node, optionally restricted to one project.
    pub async fn embed_dirty(&self, project_id: Option<&str>) -> Result<EmbedReport> {
        let mut report = EmbedReport::default();

        let nodes = self.store.content_nodes(project_id).await?;
        let candidates: Vec<Node> = nodes.into_iter().filter(is_embedding_candidate).collect();
        if candidates.is_empty() {
            return Ok(report);
        }
        debug!(candidates = candidates.len(), "embedding pass starting");

        let mut jobs: Vec<EmbedJob> = Vec::new();
        for node in &candidates {
            for facet in facets_for(node.label) {
                let Some(text) = facet_text(node, facet.source) else {
                    continue;
                };
                let text_hash = hash::content_hash_str(&text);
                if node.embedding_hashes.get(facet.property) == Some(&text_hash) {
                    report.facets_skipped += 1;
                    continue;
                }

                if facet.chunk_if_large
                    && chunker::count_tokens(&text) > self.chunk_max_tokens
                {
                    let spans = self.replace_chunks(node, &text).await?;
                    report.chunks_created += spans.len();
                    for (chunk_uuid, chunk_text) in spans {
                        let chunk_hash = hash::content_hash_str(&chunk_text);
                        jobs.push(EmbedJob {
                            uuid: chunk_uuid,
                            label: Label::EmbeddingChunk,
                            property: "embedding_content",
                            text: chunk_text,
                            text_hash: chunk_hash,
                            owner: node.uuid.clone(),
                        });
                    }
                    // The parent keeps its own content facet, over a
                    // token-bounded prefix.
                    let truncated = chunker::chunk_text(&text, self.chunk_max_tokens, 0)
                        .into_iter()
                        .next()
                        .map(|span| span.text)
                        .unwrap_or_else(|| text.clone());
                    jobs.push(EmbedJob {
                        uuid: node.uuid.clone(),
                        label: node.label,
                        property: facet.property,
                        text: truncated,
                        text_hash,
                        owner: node.uuid.clone(),
                    });
                } else {
                    jobs.push(EmbedJob {
                        uuid: node.uuid.clone(),
                        label: node.label,
                        property: facet.property,
                        text,
                        text_hash,
                        owner: node.uuid.clone(),
                    });
                }
            }
        }

        if jobs.is_empty() {
            // Dirty nodes with nothing to embed (no text in any facet)
            // still settle.
            for node in &candidates {
                self.store.set_flags(&node.uuid, Some(false), None).await?;
            }
            report.nodes_processed = candidates.len();
            return Ok(report);
        }

        // Vector indexes are created lazily on first eligible write, plus
        // the legacy per-label index.
        let dimensions = self.provider.dimensions();
        let mut ensured: HashSet<(Label, &'static str)> = HashSet::new();
        for job in &jobs {
            if ensured.insert((job.label, job.property)) {
                self.store
                    .ensure_vector_index(job.label, job.property, dimensions)
                    .await?;
            }
            if ensured.insert((job.label, "embedding")) {
                self.store
                    .ensure_vector_index(job.label, "embedding", dimensions)
                    .await?;
            }
        }

        // Jobs per owner: a node's dirty flag clears only when every one of
        // its facets (and chunks) has been written.
        let mut remaining: HashMap<String, usize> = HashMap::new();
        for job in &jobs {
            *remaining.entry(job.owner.clone()).or_default() += 1;
        }

        let mut settled: HashSet<String> = HashSet::new();
        // Candidates whose every facet was a cache hit have no jobs; they
        // settle straight away.
        for node in &candidates {
            if !remaining.contains_key(&node.uuid) {
                self.store.set_flags(&node.uuid, Some(false), None).await?;
                settled.insert(node.uuid.clone());
            }
        }
        for batch in jobs.chunks(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|j| j.text.clone()).collect();
            let vectors = match self.provider.embed_batch(&texts).await {
                Ok(vectors) => vectors,
                Err(e) => {
                    // Unwritten facets stay dirty; the next pass retries.
                    warn!(error = %e, "embedding provider failed, pass incomplete");
                    report.incomplete = true;
                    break;
                }
            };
            report.api_calls += 1;
            for (job, vector) in batch.iter().zip(vectors) {
                self.store
                    .write_embedding(&job.uuid, job.property, vector, &job.text_hash)
                    .await?;
                report.facets_embedded += 1;
                let count = remaining.entry(job.owner.clone()).or_default();
                *count = count.saturating_sub(1);
                if *count == 0 {
                    settled.insert(job.owner.clone());
                }
            }
        }

        for uuid in &settled {
            self.store.set_flags(uuid, Some(false), None).await?;
        }
        report.nodes_processed = settled.len();

        info!(
            nodes = report.nodes_processed,
            embedded = report.facets_embedded,
            skipped = report.facets_skipped,
            chunks = report.chunks_created,
            api_calls = report.api_calls,
            incomplete = report.incomplete,
            "embedding pass complete"
        );
        Ok(report)
    }

    /// Replace a node's embedding chunks with a fresh split of `text`.
    /// Returns `(chunk_uuid, chunk_text)` pairs to embed.
    async fn replace_chunks(&self, parent: &Node, text: &str) -> Result<Vec<(String, String)>> {
        let stale: Vec<String> = self
            .store
            .edges_from(&parent.uuid, Some(EdgeType::HasEmbeddingChunk))
            .await?
            .into_iter()
            .map(|e| e.to)
            .collect();
        if !stale.is_empty() {
            self.store.delete_nodes(&stale).await?;
        }

        let spans = chunker::chunk_text(text, self.chunk_max_tokens, self.chunk_overlap_tokens);
        let mut chunk_nodes: Vec<Node> = Vec::new();
        let mut edges: Vec<Edge> = Vec::new();
        let mut out: Vec<(String, String)> = Vec::new();

        for span in &spans {
            let uuid = hash::node_uuid(
                "chunk",
                &format!("{}:{}", parent.uuid, span.chunk_index),
            );
            let mut node = Node::new(Label::EmbeddingChunk, uuid.clone(), parent.project_id.clone());
            node.set_prop("parentUuid", parent.uuid.as_str())
                .set_prop("parentLabel", parent.label.as_str())
                .set_prop("chunkIndex", span.chunk_index)
                .set_prop("startLine", span.start_line)
                .set_prop("endLine", span.end_line)
                .set_prop("startChar", span.start_char)
                .set_prop("endChar", span.end_char)
                .set_prop("text", span.text.as_str());
            node.hash = Some(hash::content_hash_str(&span.text));
            node.schema_version = Some(Label::EmbeddingChunk.schema_version());
            edges.push(Edge::new(
                EdgeType::HasEmbeddingChunk,
                parent.uuid.clone(),
                uuid.clone(),
            ));
            out.push((uuid, span.text.clone()));
            chunk_nodes.push(node);
        }

        if !chunk_nodes.is_empty() {
            self.store.upsert_nodes(chunk_nodes).await?;
            self.store.create_edges(edges).await?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::MockProvider;
    use crate::graph::MemoryGraph;

    fn scope(uuid: &str, name: &str, content: &str) -> Node {
        let mut node = Node::new(Label::Scope, uuid, "p1");
        node.set_prop("name", name).set_prop("content", content);
        node.hash = Some(node.compute_content_hash());
        node.embeddings_dirty = true;
        node
    }

    fn coordinator(store: Arc<MemoryGraph>, provider: Arc<MockProvider>) -> EmbeddingCoordinator {
        EmbeddingCoordinator::new(store, provider, 32, 64, 8)
    }

    #[tokio::test]
    async fn embeds_dirty_nodes_and_clears_flag() {
        let store = Arc::new(MemoryGraph::in_memory().unwrap());
        let provider = Arc::new(MockProvider::new(16));
        store
            .upsert_nodes(vec![scope("scope:1", "x", "const x = 1")])
            .await
            .unwrap();

        let report = coordinator(Arc::clone(&store), Arc::clone(&provider))
            .embed_dirty(Some("p1"))
            .await
            .unwrap();
        assert_eq!(report.nodes_processed, 1);
        assert_eq!(report.facets_embedded, 2); // name + content
        assert!(!report.incomplete);

        let node = store.get_node("scope:1").await.unwrap().unwrap();
        assert!(!node.embeddings_dirty);
        assert!(node.embeddings.contains_key("embedding_name"));
        assert!(node.embeddings.contains_key("embedding_content"));
        assert_eq!(
            node.embedding_hashes["embedding_content"],
            hash::content_hash_str("const x = 1")
        );
    }

    #[tokio::test]
    async fn cache_hit_skips_provider() {
        let store = Arc::new(MemoryGraph::in_memory().unwrap());
        let provider = Arc::new(MockProvider::new(16));
        store
            .upsert_nodes(vec![scope("scope:1", "x", "const x = 1")])
            .await
            .unwrap();

        let coordinator = coordinator(Arc::clone(&store), Arc::clone(&provider));
        coordinator.embed_dirty(Some("p1")).await.unwrap();
        let calls_after_first = provider.call_count();

        // Dirty flag set again but text unchanged: every facet is a cache
        // hit.
        store
            .set_flags("scope:1", Some(true), None)
            .await
            .unwrap();
        let report = coordinator.embed_dirty(Some("p1")).await.unwrap();
        assert_eq!(report.facets_embedded, 0);
        assert_eq!(report.facets_skipped, 2);
        assert_eq!(provider.call_count(), calls_after_first);

        let node = store.get_node("scope:1").await.unwrap().unwrap();
        assert!(!node.embeddings_dirty);
    }

    #[tokio::test]
    async fn clean_nodes_are_not_candidates() {
        let store = Arc::new(MemoryGraph::in_memory().unwrap());
        let provider = Arc::new(MockProvider::new(16));
        let mut node = scope("scope:1", "x", "const x = 1");
        node.embeddings_dirty = false;
        node.embedding_hashes.insert(
            "embedding_name".into(),
            hash::content_hash_str("x"),
        );
        node.embedding_hashes.insert(
            "embedding_content".into(),
            hash::content_hash_str("const x = 1"),
        );
        store.upsert_nodes(vec![node]).await.unwrap();

        let report = coordinator(Arc::clone(&store), Arc::clone(&provider))
            .embed_dirty(Some("p1"))
            .await
            .unwrap();
        assert_eq!(report.nodes_processed, 0);
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn stale_facet_hash_makes_candidate() {
        let mut node = scope("scope:1", "x", "const x = 1");
        node.embeddings_dirty = false;
        node.embedding_hashes
            .insert("embedding_content".into(), "0000000000000000".into());
        assert!(is_embedding_candidate(&node));
    }

    #[tokio::test]
    async fn large_content_is_chunked() {
        let store = Arc::new(MemoryGraph::in_memory().unwrap());
        let provider = Arc::new(MockProvider::new(16));
        let long: String = (0..200)
            .map(|i| format!("line {i} with a handful of words"))
            .collect::<Vec<_>>()
            .join("\n");
        store
            .upsert_nodes(vec![scope("scope:big", "big", &long)])
            .await
            .unwrap();

        let report = coordinator(Arc::clone(&store), Arc::clone(&provider))
            .embed_dirty(Some("p1"))
            .await
            .unwrap();
        assert!(report.chunks_created > 1);

        let chunk_edges = store
            .edges_from("scope:big", Some(EdgeType::HasEmbeddingChunk))
            .await
            .unwrap();
        assert_eq!(chunk_edges.len(), report.chunks_created);

        let chunk = store.get_node(&chunk_edges[0].to).await.unwrap().unwrap();
        assert_eq!(chunk.label, Label::EmbeddingChunk);
        assert_eq!(chunk.prop_str("parentUuid"), Some("scope:big"));
        assert!(chunk.embeddings.contains_key("embedding_content"));
        assert!(chunk.prop_u64("endLine").unwrap() >= chunk.prop_u64("startLine").unwrap());

        // Parent still carries its own content facet.
        let parent = store.get_node("scope:big").await.unwrap().unwrap();
        assert!(parent.embeddings.contains_key("embedding_content"));
        assert!(!parent.embeddings_dirty);
    }

    #[tokio::test]
    async fn provider_failure_leaves_nodes_dirty() {
        let store = Arc::new(MemoryGraph::in_memory().unwrap());
        let provider = Arc::new(MockProvider::new(16));
        store
            .upsert_nodes(vec![scope("scope:1", "x", "const x = 1")])
            .await
            .unwrap();

        provider.fail_next(1);
        let coordinator = coordinator(Arc::clone(&store), Arc::clone(&provider));
        let report = coordinator.embed_dirty(Some("p1")).await.unwrap();
        assert!(report.incomplete);
        let node = store.get_node("scope:1").await.unwrap().unwrap();
        assert!(node.embeddings_dirty, "failed node stays dirty");

        // Next pass succeeds.
        let report = coordinator.embed_dirty(Some("p1")).await.unwrap();
        assert!(!report.incomplete);
        let node = store.get_node("scope:1").await.unwrap().unwrap();
        assert!(!node.embeddings_dirty);
    }

    #[tokio::test]
    async fn vector_indexes_created_lazily() {
        let store = Arc::new(MemoryGraph::in_memory().unwrap());
        let provider = Arc::new(MockProvider::new(16));
        store
            .upsert_nodes(vec![scope("scope:1", "x", "const x = 1")])
            .await
            .unwrap();
        assert!(!store
            .has_vector_index(Label::Scope, "embedding_content")
            .await
            .unwrap());

        coordinator(Arc::clone(&store), Arc::clone(&provider))
            .embed_dirty(Some("p1"))
            .await
            .unwrap();
        assert!(store
            .has_vector_index(Label::Scope, "embedding_content")
            .await
            .unwrap());
        // Legacy per-label index rides along.
        assert!(store.has_vector_index(Label::Scope, "embedding").await.unwrap());
    }
}
