use std::path::PathBuf;
use std::sync::Arc;

use ragforge::graph::{EdgeType, GraphStore, Label, MemoryGraph};
use ragforge::process::{FileProcessor, ProcessOptions};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn setup(files: &[(&str, &str)]) -> (TempDir, Arc<MemoryGraph>, FileProcessor) {
    let dir = TempDir::new().unwrap();
    for (path, content) in files {
        let full = dir.path().join(path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&full, content).unwrap();
    }
    let store = Arc::new(MemoryGraph::in_memory().unwrap());
    let processor = FileProcessor::new(
        Arc::clone(&store) as Arc<dyn GraphStore>,
        Arc::new(ragforge::parse::ParserRegistry::with_builtin()),
        "p1",
        dir.path(),
    );
    (dir, store, processor)
}

async fn process(processor: &FileProcessor, dir: &TempDir, rel: &str) {
    processor
        .process(&dir.path().join(rel), ProcessOptions::default())
        .await
        .unwrap();
}

async fn all_edges_of_type(store: &MemoryGraph, edge_type: EdgeType) -> Vec<ragforge::graph::Edge> {
    let mut out = Vec::new();
    for label in Label::ALL {
        for node in store.nodes_with_label(*label, None).await.unwrap() {
            out.extend(store.edges_from(&node.uuid, Some(edge_type)).await.unwrap());
        }
    }
    out
}

async fn file_uuid(store: &MemoryGraph, dir: &TempDir, rel: &str) -> String {
    store
        .file_by_absolute_path(&dir.path().join(rel).to_string_lossy())
        .await
        .unwrap()
        .unwrap()
        .uuid
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn linked_target_gets_scope_level_consumes() {
    let (dir, store, processor) = setup(&[
        ("src/a.ts", "export const x = 1"),
        ("src/b.ts", "import {x} from './a'; console.log(x)"),
    ]);
    process(&processor, &dir, "src/a.ts").await;
    process(&processor, &dir, "src/b.ts").await;

    let scopes = store.nodes_with_label(Label::Scope, Some("p1")).await.unwrap();
    assert_eq!(scopes.len(), 2);

    let consumes = all_edges_of_type(&store, EdgeType::Consumes).await;
    assert_eq!(consumes.len(), 1);

    let source = store.get_node(&consumes[0].from).await.unwrap().unwrap();
    let target = store.get_node(&consumes[0].to).await.unwrap().unwrap();
    assert_eq!(source.label, Label::Scope);
    assert_eq!(target.label, Label::Scope);
    assert!(source.prop_str("content").unwrap().contains("console.log"));
    assert_eq!(target.prop_str("exportedAs"), Some("x"));
    assert_eq!(consumes[0].properties["symbols"], serde_json::json!(["x"]));

    assert!(
        all_edges_of_type(&store, EdgeType::PendingImport).await.is_empty(),
        "no pending imports once both sides are linked"
    );
}

#[tokio::test]
async fn unlinked_target_defers_then_upgrades() {
    let (dir, store, processor) = setup(&[
        ("src/a.ts", "export const x = 1"),
        ("src/b.ts", "import {x} from './a'; console.log(x)"),
    ]);
    // Importer first: the target is on disk but not in the graph yet.
    process(&processor, &dir, "src/b.ts").await;

    let pending = all_edges_of_type(&store, EdgeType::PendingImport).await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].properties["symbols"], serde_json::json!(["x"]));
    assert_eq!(pending[0].properties["importPath"], "./a");

    let placeholder = store.get_node(&pending[0].to).await.unwrap().unwrap();
    assert_eq!(placeholder.label, Label::File);
    assert_eq!(placeholder.prop_bool("mentioned"), Some(true));
    assert!(placeholder
        .absolute_path()
        .unwrap()
        .ends_with("src/a.ts"));

    // Target reaches linked: the pending edge upgrades in place.
    process(&processor, &dir, "src/a.ts").await;
    assert!(all_edges_of_type(&store, EdgeType::PendingImport).await.is_empty());
    assert_eq!(all_edges_of_type(&store, EdgeType::Consumes).await.len(), 1);

    let a = store
        .file_by_absolute_path(&dir.path().join("src/a.ts").to_string_lossy())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(a.prop_bool("mentioned"), None, "placeholder became real");
}

#[tokio::test]
async fn markdown_reference_becomes_doc_edge() {
    let (dir, store, processor) = setup(&[
        ("src/a.ts", "export const x = 1"),
        ("src/c.md", "See [A](./a.ts)"),
    ]);
    process(&processor, &dir, "src/a.ts").await;
    process(&processor, &dir, "src/c.md").await;

    let doc_edges = all_edges_of_type(&store, EdgeType::ReferencesDoc).await;
    assert_eq!(doc_edges.len(), 1);
    assert_eq!(doc_edges[0].from, file_uuid(&store, &dir, "src/c.md").await);
    assert_eq!(doc_edges[0].to, file_uuid(&store, &dir, "src/a.ts").await);
}

#[tokio::test]
async fn css_asset_reference_becomes_asset_edge() {
    let (dir, store, processor) = setup(&[
        ("img/logo.png", "not-a-real-png"),
        ("styles/main.css", ".logo { background: url(../img/logo.png); }"),
    ]);
    process(&processor, &dir, "img/logo.png").await;
    process(&processor, &dir, "styles/main.css").await;

    let asset_edges = all_edges_of_type(&store, EdgeType::ReferencesAsset).await;
    assert_eq!(asset_edges.len(), 1);
    assert_eq!(
        asset_edges[0].from,
        file_uuid(&store, &dir, "styles/main.css").await
    );
    assert_eq!(
        asset_edges[0].to,
        file_uuid(&store, &dir, "img/logo.png").await
    );
}

#[tokio::test]
async fn import_without_symbols_falls_back_to_file_level() {
    let (dir, store, processor) = setup(&[
        ("src/setup.ts", "export const ready = true"),
        ("src/entry.ts", "import './setup'\nconst boot = 1;\n"),
    ]);
    process(&processor, &dir, "src/setup.ts").await;
    process(&processor, &dir, "src/entry.ts").await;

    let imports = all_edges_of_type(&store, EdgeType::Imports).await;
    assert_eq!(imports.len(), 1);
    assert_eq!(
        imports[0].from,
        file_uuid(&store, &dir, "src/entry.ts").await
    );
    assert_eq!(
        imports[0].to,
        file_uuid(&store, &dir, "src/setup.ts").await
    );
    assert!(all_edges_of_type(&store, EdgeType::Consumes).await.is_empty());
}

#[tokio::test]
async fn js_specifier_resolves_to_ts_source() {
    let (dir, store, processor) = setup(&[
        ("src/util.ts", "export const helper = 1"),
        ("src/user.ts", "import {helper} from './util.js'; helper;"),
    ]);
    process(&processor, &dir, "src/util.ts").await;
    process(&processor, &dir, "src/user.ts").await;

    assert_eq!(all_edges_of_type(&store, EdgeType::Consumes).await.len(), 1);
    assert!(all_edges_of_type(&store, EdgeType::PendingImport).await.is_empty());
}

#[tokio::test]
async fn deleting_target_degrades_importer_to_pending() {
    let (dir, store, processor) = setup(&[
        ("src/a.ts", "export const x = 1"),
        ("src/b.ts", "import {x} from './a'; console.log(x)"),
    ]);
    process(&processor, &dir, "src/a.ts").await;
    process(&processor, &dir, "src/b.ts").await;
    assert_eq!(all_edges_of_type(&store, EdgeType::Consumes).await.len(), 1);

    // Remove the target; the cascade re-resolves importers.
    std::fs::remove_file(dir.path().join("src/a.ts")).unwrap();
    process(&processor, &dir, "src/a.ts").await;

    assert!(all_edges_of_type(&store, EdgeType::Consumes).await.is_empty());
    let pending = all_edges_of_type(&store, EdgeType::PendingImport).await;
    assert_eq!(pending.len(), 1);
    let placeholder = store.get_node(&pending[0].to).await.unwrap().unwrap();
    assert_eq!(placeholder.prop_bool("mentioned"), Some(true));

    // All of a.ts's content is gone.
    let scopes = store.nodes_with_label(Label::Scope, Some("p1")).await.unwrap();
    assert_eq!(scopes.len(), 1);
    assert!(scopes[0].prop_str("content").unwrap().contains("console.log"));
}

#[tokio::test]
async fn reprocessing_does_not_duplicate_reference_edges() {
    let (dir, store, processor) = setup(&[
        ("src/a.ts", "export const x = 1"),
        ("src/b.ts", "import {x} from './a'; console.log(x)"),
    ]);
    process(&processor, &dir, "src/a.ts").await;
    process(&processor, &dir, "src/b.ts").await;

    // Touch the importer with a real change and re-process.
    std::fs::write(
        dir.path().join("src/b.ts"),
        "import {x} from './a'; console.warn(x)",
    )
    .unwrap();
    process(&processor, &dir, "src/b.ts").await;

    assert_eq!(all_edges_of_type(&store, EdgeType::Consumes).await.len(), 1);
    assert!(all_edges_of_type(&store, EdgeType::PendingImport).await.is_empty());
}
