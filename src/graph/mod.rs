//! Typed node/edge model and the graph-store boundary.
//!
//! The graph holds structural nodes (`Project`, `Directory`, `File`) and
//! content nodes (scopes, document sections, media, chunks). Content nodes
//! carry a content hash and a schema fingerprint and are replaced wholesale
//! when their parent file changes; structural nodes are upserted in place.

pub mod memory;
pub mod storage;
pub mod store;

pub use memory::MemoryGraph;
pub use store::{GraphStore, UpsertCounts};

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::hash;

/// Open property bag used at the serialization boundary.
pub type PropertyMap = serde_json::Map<String, serde_json::Value>;

/// Current ISO-8601 timestamp in local time.
pub fn now_iso() -> String {
    chrono::Local::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, false)
}

/// Primary node labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Label {
    Project,
    Directory,
    File,
    Scope,
    MarkdownDocument,
    MarkdownSection,
    CodeBlock,
    DataFile,
    DataSection,
    PdfDocument,
    WordDocument,
    SpreadsheetDocument,
    ImageFile,
    ThreeDFile,
    WebPage,
    EmbeddingChunk,
}

impl Label {
    pub const ALL: &'static [Label] = &[
        Label::Project,
        Label::Directory,
        Label::File,
        Label::Scope,
        Label::MarkdownDocument,
        Label::MarkdownSection,
        Label::CodeBlock,
        Label::DataFile,
        Label::DataSection,
        Label::PdfDocument,
        Label::WordDocument,
        Label::SpreadsheetDocument,
        Label::ImageFile,
        Label::ThreeDFile,
        Label::WebPage,
        Label::EmbeddingChunk,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Label::Project => "Project",
            Label::Directory => "Directory",
            Label::File => "File",
            Label::Scope => "Scope",
            Label::MarkdownDocument => "MarkdownDocument",
            Label::MarkdownSection => "MarkdownSection",
            Label::CodeBlock => "CodeBlock",
            Label::DataFile => "DataFile",
            Label::DataSection => "DataSection",
            Label::PdfDocument => "PDFDocument",
            Label::WordDocument => "WordDocument",
            Label::SpreadsheetDocument => "SpreadsheetDocument",
            Label::ImageFile => "ImageFile",
            Label::ThreeDFile => "ThreeDFile",
            Label::WebPage => "WebPage",
            Label::EmbeddingChunk => "EmbeddingChunk",
        }
    }

    /// Mixin labels carried alongside the primary label.
    pub fn mixins(&self) -> &'static [&'static str] {
        match self {
            Label::PdfDocument | Label::WordDocument | Label::SpreadsheetDocument => {
                &["DocumentFile"]
            }
            Label::ImageFile | Label::ThreeDFile => &["MediaFile"],
            _ => &[],
        }
    }

    /// Structural nodes carry no content hash and survive content
    /// regeneration.
    pub fn is_structural(&self) -> bool {
        matches!(self, Label::Project | Label::Directory | Label::File)
    }

    /// Content nodes are hashed, schema-versioned, and embeddable.
    pub fn is_content(&self) -> bool {
        !self.is_structural()
    }

    /// Typed uuid prefix for nodes of this label.
    pub fn uuid_prefix(&self) -> &'static str {
        match self {
            Label::Project => "project",
            Label::Directory => "dir",
            Label::File => "file",
            Label::Scope => "scope",
            Label::MarkdownDocument | Label::MarkdownSection => "md",
            Label::CodeBlock => "code",
            Label::DataFile | Label::DataSection => "data",
            Label::PdfDocument | Label::WordDocument | Label::SpreadsheetDocument => "doc",
            Label::ImageFile | Label::ThreeDFile => "media",
            Label::WebPage => "web",
            Label::EmbeddingChunk => "chunk",
        }
    }

    /// Canonical uniqueness key used for upserts of this label.
    pub fn merge_key(&self) -> &'static str {
        match self {
            Label::Project => "projectId",
            Label::File => "absolutePath",
            Label::Directory => "path",
            _ => "uuid",
        }
    }

    /// Property names the current writer emits for content nodes of this
    /// label. The schema fingerprint is derived from this set; extending it
    /// invalidates previously written nodes.
    pub fn schema_properties(&self) -> &'static [&'static str] {
        match self {
            Label::Scope => &[
                "name",
                "content",
                "exportedAs",
                "language",
                "startLine",
                "endLine",
                "file",
                "absolutePath",
            ],
            Label::MarkdownDocument => {
                &["name", "content", "description", "file", "absolutePath"]
            }
            Label::MarkdownSection => {
                &["name", "content", "level", "startLine", "endLine", "file", "absolutePath"]
            }
            Label::CodeBlock => {
                &["name", "content", "language", "startLine", "endLine", "file", "absolutePath"]
            }
            Label::DataFile => &["name", "content", "format", "file", "absolutePath"],
            Label::DataSection => &["name", "content", "file", "absolutePath"],
            Label::PdfDocument | Label::WordDocument | Label::SpreadsheetDocument => {
                &["name", "content", "description", "pageCount", "file", "absolutePath"]
            }
            Label::ImageFile | Label::ThreeDFile => {
                &["name", "description", "file", "absolutePath"]
            }
            Label::WebPage => &["name", "content", "description", "url"],
            Label::EmbeddingChunk => &[
                "parentUuid",
                "parentLabel",
                "chunkIndex",
                "startLine",
                "endLine",
                "startChar",
                "endChar",
                "text",
            ],
            _ => &[],
        }
    }

    /// Fingerprint of the property schema the current writer uses for this
    /// label.
    pub fn schema_version(&self) -> String {
        hash::schema_hash(self.as_str(), self.schema_properties())
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Label {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        Label::ALL
            .iter()
            .copied()
            .find(|l| l.as_str() == s)
            .ok_or_else(|| Error::Config(format!("unknown node label '{s}'")))
    }
}

/// Typed directed edge kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EdgeType {
    BelongsTo,
    InDirectory,
    DefinedIn,
    Consumes,
    Imports,
    ReferencesAsset,
    ReferencesDoc,
    PendingImport,
    GeneratedFrom,
    RenderedAs,
    HasEmbeddingChunk,
}

impl EdgeType {
    pub const ALL: &'static [EdgeType] = &[
        EdgeType::BelongsTo,
        EdgeType::InDirectory,
        EdgeType::DefinedIn,
        EdgeType::Consumes,
        EdgeType::Imports,
        EdgeType::ReferencesAsset,
        EdgeType::ReferencesDoc,
        EdgeType::PendingImport,
        EdgeType::GeneratedFrom,
        EdgeType::RenderedAs,
        EdgeType::HasEmbeddingChunk,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeType::BelongsTo => "BELONGS_TO",
            EdgeType::InDirectory => "IN_DIRECTORY",
            EdgeType::DefinedIn => "DEFINED_IN",
            EdgeType::Consumes => "CONSUMES",
            EdgeType::Imports => "IMPORTS",
            EdgeType::ReferencesAsset => "REFERENCES_ASSET",
            EdgeType::ReferencesDoc => "REFERENCES_DOC",
            EdgeType::PendingImport => "PENDING_IMPORT",
            EdgeType::GeneratedFrom => "GENERATED_FROM",
            EdgeType::RenderedAs => "RENDERED_AS",
            EdgeType::HasEmbeddingChunk => "HAS_EMBEDDING_CHUNK",
        }
    }

    /// Edge types emitted by reference resolution, refreshed on re-parse.
    pub fn is_reference(&self) -> bool {
        matches!(
            self,
            EdgeType::Consumes
                | EdgeType::Imports
                | EdgeType::ReferencesAsset
                | EdgeType::ReferencesDoc
                | EdgeType::PendingImport
        )
    }
}

impl fmt::Display for EdgeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EdgeType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        EdgeType::ALL
            .iter()
            .copied()
            .find(|e| e.as_str() == s)
            .ok_or_else(|| Error::Config(format!("unknown edge type '{s}'")))
    }
}

/// A node in the graph.
#[derive(Debug, Clone)]
pub struct Node {
    pub uuid: String,
    pub label: Label,
    pub project_id: String,
    /// Open property bag; embedding vectors live in `embeddings`, never here.
    pub properties: PropertyMap,
    /// Content hash of whatever produced this node. `None` for structural
    /// nodes.
    pub hash: Option<String>,
    /// Schema fingerprint at write time. `None` for structural nodes.
    pub schema_version: Option<String>,
    pub embeddings_dirty: bool,
    pub schema_dirty: bool,
    pub indexed_at: String,
    /// Facet embeddings keyed by property name (`embedding_name`, …).
    pub embeddings: HashMap<String, Vec<f32>>,
    /// hash16 of the text each facet embedding was computed from.
    pub embedding_hashes: HashMap<String, String>,
}

impl Node {
    pub fn new(label: Label, uuid: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            label,
            project_id: project_id.into(),
            properties: PropertyMap::new(),
            hash: None,
            schema_version: None,
            embeddings_dirty: false,
            schema_dirty: false,
            indexed_at: now_iso(),
            embeddings: HashMap::new(),
            embedding_hashes: HashMap::new(),
        }
    }

    pub fn prop_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(|v| v.as_str())
    }

    pub fn prop_u64(&self, key: &str) -> Option<u64> {
        self.properties.get(key).and_then(|v| v.as_u64())
    }

    pub fn prop_bool(&self, key: &str) -> Option<bool> {
        self.properties.get(key).and_then(|v| v.as_bool())
    }

    pub fn set_prop(&mut self, key: &str, value: impl Into<serde_json::Value>) -> &mut Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }

    /// Canonical filesystem key for `File` nodes.
    pub fn absolute_path(&self) -> Option<&str> {
        self.prop_str("absolutePath")
    }

    /// Parse the persisted file state, defaulting to `discovered`.
    pub fn file_state(&self) -> crate::state::FileState {
        self.prop_str("state")
            .and_then(|s| s.parse().ok())
            .unwrap_or(crate::state::FileState::Discovered)
    }

    /// Hash over the node's property bag, used as the per-node content hash.
    ///
    /// `serde_json::Map` iterates keys in sorted order, so the serialization
    /// is canonical.
    pub fn compute_content_hash(&self) -> String {
        let serialized =
            serde_json::to_string(&self.properties).unwrap_or_default();
        hash::content_hash_str(&serialized)
    }
}

/// A typed directed edge.
#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    pub edge_type: EdgeType,
    pub from: String,
    pub to: String,
    pub properties: PropertyMap,
}

impl Edge {
    pub fn new(edge_type: EdgeType, from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            edge_type,
            from: from.into(),
            to: to.into(),
            properties: PropertyMap::new(),
        }
    }

    pub fn with_prop(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }
}

/// A node as emitted by a parser adapter, before normalization.
#[derive(Debug, Clone)]
pub struct FragmentNode {
    /// Parser-local identifier; becomes (or seeds) the node uuid.
    pub id: String,
    pub labels: Vec<String>,
    pub properties: PropertyMap,
}

/// A relationship between two fragment nodes, by parser-local id.
#[derive(Debug, Clone)]
pub struct FragmentRel {
    pub rel_type: String,
    pub from: String,
    pub to: String,
    pub properties: PropertyMap,
}

/// Graph fragment returned by a parser adapter for one or more files.
#[derive(Debug, Clone, Default)]
pub struct GraphFragment {
    pub nodes: Vec<FragmentNode>,
    pub relationships: Vec<FragmentRel>,
}

impl GraphFragment {
    pub fn merge(&mut self, other: GraphFragment) {
        self.nodes.extend(other.nodes);
        self.relationships.extend(other.relationships);
    }
}
