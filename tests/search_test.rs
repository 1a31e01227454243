use std::collections::HashSet;
use std::sync::Arc;

use ragforge::embed::EmbeddingCoordinator;
use ragforge::embedding::MockProvider;
use ragforge::graph::{GraphStore, Label, MemoryGraph, Node};
use ragforge::search::{EmbeddingType, SearchOptions, SearchService};
use tempfile::TempDir;

const DIMS: usize = 16;
const CHUNK_MAX: usize = 64;
const CHUNK_OVERLAP: usize = 8;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Fixture {
    store: Arc<MemoryGraph>,
    provider: Arc<MockProvider>,
    _home: TempDir,
}

impl Fixture {
    fn service(&self) -> SearchService {
        SearchService::new(
            Arc::clone(&self.store) as Arc<dyn GraphStore>,
            Arc::clone(&self.provider) as Arc<dyn ragforge::embedding::EmbeddingProvider>,
        )
    }

    async fn embed_all(&self) {
        EmbeddingCoordinator::new(
            Arc::clone(&self.store) as Arc<dyn GraphStore>,
            Arc::clone(&self.provider) as Arc<dyn ragforge::embedding::EmbeddingProvider>,
            32,
            CHUNK_MAX,
            CHUNK_OVERLAP,
        )
        .embed_dirty(None)
        .await
        .unwrap();
    }
}

fn fixture() -> Fixture {
    Fixture {
        store: Arc::new(MemoryGraph::in_memory().unwrap()),
        provider: Arc::new(MockProvider::new(DIMS)),
        _home: TempDir::new().unwrap(),
    }
}

fn scope(uuid: &str, project: &str, name: &str, content: &str, file: &str) -> Node {
    let mut node = Node::new(Label::Scope, uuid, project);
    node.set_prop("name", name)
        .set_prop("content", content)
        .set_prop("language", "typescript")
        .set_prop("file", file)
        .set_prop("absolutePath", format!("/p/{file}"));
    node.hash = Some(node.compute_content_hash());
    node.embeddings_dirty = true;
    node
}

fn no_exclusions() -> HashSet<String> {
    HashSet::new()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn exact_semantic_match_ranks_first() {
    let fx = fixture();
    fx.store
        .upsert_nodes(vec![
            scope("scope:a", "p1", "tokenizer", "tokenize the input stream", "src/lex.ts"),
            scope("scope:b", "p1", "renderer", "draw pixels on the screen", "src/draw.ts"),
        ])
        .await
        .unwrap();
    fx.embed_all().await;

    let opts = SearchOptions {
        hybrid: false,
        min_score: 0.0,
        ..SearchOptions::default()
    };
    let response = fx
        .service()
        .search("tokenize the input stream", &opts, &no_exclusions())
        .await
        .unwrap();

    assert!(!response.results.is_empty());
    assert_eq!(response.results[0].uuid, "scope:a");
    assert!(response.results[0].score > 0.99, "identical text embeds identically");
}

#[tokio::test]
async fn empty_query_returns_nothing() {
    let fx = fixture();
    let response = fx
        .service()
        .search("   ", &SearchOptions::default(), &no_exclusions())
        .await
        .unwrap();
    assert!(response.results.is_empty());
    assert_eq!(response.total_count, 0);
}

#[tokio::test]
async fn chunk_hits_promote_to_parent_with_range() {
    let fx = fixture();
    let long: String = (0..120)
        .map(|i| format!("paragraph {i} talks about subsystem number {i}"))
        .collect::<Vec<_>>()
        .join("\n");
    fx.store
        .upsert_nodes(vec![scope("scope:big", "p1", "manual", &long, "docs/manual.md")])
        .await
        .unwrap();
    fx.embed_all().await;

    // Query with the exact text of a non-first chunk.
    let spans = ragforge::chunker::chunk_text(&long, CHUNK_MAX, CHUNK_OVERLAP);
    assert!(spans.len() > 1, "fixture content must chunk");
    let target = &spans[1];

    let opts = SearchOptions {
        hybrid: false,
        min_score: 0.0,
        ..SearchOptions::default()
    };
    let response = fx
        .service()
        .search(&target.text, &opts, &no_exclusions())
        .await
        .unwrap();

    let top = &response.results[0];
    assert_eq!(top.uuid, "scope:big", "chunks are never returned directly");
    for hit in &response.results {
        assert_ne!(hit.label, "EmbeddingChunk");
    }
    let range = top.matched_range.as_ref().expect("promoted hit carries range");
    assert_eq!(range.chunk_index, target.chunk_index);
    assert_eq!(range.start_line, target.start_line);
    assert_eq!(range.end_line, target.end_line);
    assert!(range.chunk_score > 0.99);
}

#[tokio::test]
async fn hybrid_bm25_presence_strictly_boosts() {
    let fx = fixture();
    fx.store
        .upsert_nodes(vec![
            scope("scope:a", "p1", "tokenizer", "tokenize the input stream", "src/lex.ts"),
            scope("scope:b", "p1", "renderer", "draw pixels on the screen", "src/draw.ts"),
        ])
        .await
        .unwrap();
    fx.embed_all().await;

    let semantic_only = SearchOptions {
        hybrid: false,
        min_score: 0.0,
        ..SearchOptions::default()
    };
    let hybrid = SearchOptions {
        min_score: 0.0,
        ..SearchOptions::default()
    };

    let service = fx.service();
    let base = service
        .search("tokenize the input stream", &semantic_only, &no_exclusions())
        .await
        .unwrap();
    let fused = service
        .search("tokenize the input stream", &hybrid, &no_exclusions())
        .await
        .unwrap();

    let base_score = base.results.iter().find(|h| h.uuid == "scope:a").unwrap().score;
    let fused_hit = fused.results.iter().find(|h| h.uuid == "scope:a").unwrap();
    assert!(
        fused_hit.score > base_score,
        "a semantic hit that also ranks in BM25 must score strictly higher"
    );

    let rrf = fused_hit.rrf_details.as_ref().unwrap();
    assert_eq!(rrf.provenance, "semantic");
    assert_eq!(rrf.bm25_rank, Some(1));
    assert!(rrf.boost > 1.0);
    assert!((rrf.boost - (1.0 + 0.3)).abs() < 1e-9, "rank 1 boost is 1.3");
}

#[tokio::test]
async fn bm25_only_results_are_injected() {
    let fx = fixture();
    fx.store
        .upsert_nodes(vec![scope(
            "scope:a",
            "p1",
            "tokenizer",
            "tokenize the input stream",
            "src/lex.ts",
        )])
        .await
        .unwrap();
    fx.embed_all().await;

    // A node the vector path cannot see: indexed lexically, never embedded.
    let mut unembedded = scope(
        "scope:zanzibar",
        "p1",
        "exotic",
        "the zanzibar gateway handles spice routes",
        "src/zanzibar.ts",
    );
    unembedded.embeddings_dirty = true;
    fx.store.upsert_nodes(vec![unembedded]).await.unwrap();

    let response = fx
        .service()
        .search("zanzibar spice", &SearchOptions::default(), &no_exclusions())
        .await
        .unwrap();

    let hit = response
        .results
        .iter()
        .find(|h| h.uuid == "scope:zanzibar")
        .expect("lexical-only hit must be injected");
    let rrf = hit.rrf_details.as_ref().unwrap();
    assert_eq!(rrf.provenance, "bm25-only");
    assert!(rrf.bm25_rank.is_some());
    assert!((hit.score - 0.4).abs() < 0.11, "synthetic scores start at 0.4");
}

#[tokio::test]
async fn lexical_only_mode_skips_embeddings() {
    let fx = fixture();
    fx.store
        .upsert_nodes(vec![
            scope("scope:a", "p1", "tokenizer", "tokenize the input stream", "src/lex.ts"),
            scope("scope:b", "p1", "renderer", "draw pixels on the screen", "src/draw.ts"),
        ])
        .await
        .unwrap();
    fx.embed_all().await;
    let calls_before = fx.provider.call_count();

    let opts = SearchOptions {
        semantic: false,
        hybrid: false,
        min_score: 0.0,
        ..SearchOptions::default()
    };
    let response = fx
        .service()
        .search("pixels", &opts, &no_exclusions())
        .await
        .unwrap();

    assert_eq!(response.results.len(), 1);
    assert_eq!(response.results[0].uuid, "scope:b");
    assert_eq!(
        fx.provider.call_count(),
        calls_before,
        "lexical-only search never embeds the query"
    );
}

#[tokio::test]
async fn glob_filters_by_path() {
    let fx = fixture();
    fx.store
        .upsert_nodes(vec![
            scope("scope:a", "p1", "widget", "widget assembly code", "src/widget.ts"),
            scope("scope:b", "p1", "widget", "widget assembly docs", "docs/widget.md"),
        ])
        .await
        .unwrap();
    fx.embed_all().await;

    let opts = SearchOptions {
        semantic: false,
        hybrid: false,
        min_score: 0.0,
        glob: Some("src/**".into()),
        ..SearchOptions::default()
    };
    let response = fx
        .service()
        .search("widget assembly", &opts, &no_exclusions())
        .await
        .unwrap();
    assert_eq!(response.results.len(), 1);
    assert_eq!(response.results[0].uuid, "scope:a");
}

#[tokio::test]
async fn excluded_projects_are_hidden_unless_named() {
    let fx = fixture();
    fx.store
        .upsert_nodes(vec![
            scope("scope:a", "p1", "shared", "quarantine handling logic", "src/a.ts"),
            scope("scope:b", "p2", "shared", "quarantine handling logic too", "src/b.ts"),
        ])
        .await
        .unwrap();
    fx.embed_all().await;

    let mut excluded = HashSet::new();
    excluded.insert("p2".to_string());

    let opts = SearchOptions {
        semantic: false,
        hybrid: false,
        min_score: 0.0,
        ..SearchOptions::default()
    };
    let response = fx
        .service()
        .search("quarantine", &opts, &excluded)
        .await
        .unwrap();
    assert_eq!(response.results.len(), 1);
    assert_eq!(response.results[0].project_id, "p1");

    // An explicit project scope overrides the exclusion flag.
    let scoped = SearchOptions {
        projects: Some(vec!["p2".into()]),
        ..opts
    };
    let response = fx
        .service()
        .search("quarantine", &scoped, &excluded)
        .await
        .unwrap();
    assert_eq!(response.results.len(), 1);
    assert_eq!(response.results[0].project_id, "p2");
}

#[tokio::test]
async fn raw_filter_clause_narrows_results() {
    let fx = fixture();
    let mut py = scope("scope:py", "p1", "loader", "load the manifest file", "src/loader.py");
    py.set_prop("language", "python");
    fx.store
        .upsert_nodes(vec![
            scope("scope:ts", "p1", "loader", "load the manifest file", "src/loader.ts"),
            py,
        ])
        .await
        .unwrap();
    fx.embed_all().await;

    let opts = SearchOptions {
        semantic: false,
        hybrid: false,
        min_score: 0.0,
        raw_filter_clause: Some("language = 'python'".into()),
        ..SearchOptions::default()
    };
    let response = fx
        .service()
        .search("manifest", &opts, &no_exclusions())
        .await
        .unwrap();
    assert_eq!(response.results.len(), 1);
    assert_eq!(response.results[0].uuid, "scope:py");
}

#[tokio::test]
async fn name_facet_restriction() {
    let fx = fixture();
    fx.store
        .upsert_nodes(vec![scope(
            "scope:a",
            "p1",
            "quantum flux capacitor",
            "completely unrelated body text",
            "src/a.ts",
        )])
        .await
        .unwrap();
    fx.embed_all().await;

    let opts = SearchOptions {
        hybrid: false,
        embedding_type: EmbeddingType::Name,
        min_score: 0.0,
        ..SearchOptions::default()
    };
    let response = fx
        .service()
        .search("quantum flux capacitor", &opts, &no_exclusions())
        .await
        .unwrap();
    assert_eq!(response.results[0].uuid, "scope:a");
    assert!(response.results[0].score > 0.99);
}

#[tokio::test]
async fn returned_properties_are_stripped_of_embeddings() {
    let fx = fixture();
    fx.store
        .upsert_nodes(vec![scope("scope:a", "p1", "x", "searchable text body", "src/a.ts")])
        .await
        .unwrap();
    fx.embed_all().await;

    let opts = SearchOptions {
        min_score: 0.0,
        ..SearchOptions::default()
    };
    let response = fx
        .service()
        .search("searchable text body", &opts, &no_exclusions())
        .await
        .unwrap();
    let hit = &response.results[0];
    assert!(hit.properties.contains_key("name"));
    assert!(hit
        .properties
        .keys()
        .all(|key| !key.starts_with("embedding")));
}

#[tokio::test]
async fn missing_vector_index_falls_back_to_cosine() {
    let fx = fixture();
    // Vector present on the node, but no index was ever created.
    let mut node = scope("scope:a", "p1", "x", "fallback body text", "src/a.ts");
    node.embeddings.insert(
        "embedding_content".into(),
        fx.provider_vector("fallback body text").await,
    );
    node.embedding_hashes.insert(
        "embedding_content".into(),
        ragforge::hash::content_hash_str("fallback body text"),
    );
    node.embeddings_dirty = false;
    fx.store.upsert_nodes(vec![node]).await.unwrap();

    assert!(!fx
        .store
        .has_vector_index(Label::Scope, "embedding_content")
        .await
        .unwrap());

    let opts = SearchOptions {
        hybrid: false,
        min_score: 0.0,
        ..SearchOptions::default()
    };
    let response = fx
        .service()
        .search("fallback body text", &opts, &no_exclusions())
        .await
        .unwrap();
    assert_eq!(response.results[0].uuid, "scope:a");
    assert!(response.results[0].score > 0.99);
}

impl Fixture {
    async fn provider_vector(&self, text: &str) -> Vec<f32> {
        use ragforge::embedding::EmbeddingProvider;
        self.provider
            .embed_batch(&[text.to_string()])
            .await
            .unwrap()
            .remove(0)
    }
}
