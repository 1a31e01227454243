//! Snapshot persistence for the in-process graph backend.
//!
//! Layout: a fixed 64-byte header (magic, format version, metadata offset and
//! size) followed by a zstd-compressed rkyv archive of the whole graph.
//! Writes go to a `.tmp` sibling, fsync, then rename; loads go through a
//! memory map. Vector indexes are not serialized — raw vectors live on the
//! nodes and the indexes are rebuilt on load.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use memmap2::Mmap;

use crate::error::{Error, Result};
use crate::graph::{Edge, Node, PropertyMap};

/// Magic bytes identifying a ragforge graph snapshot.
pub const MAGIC: &[u8; 6] = b"RAGFG\x00";

/// Current snapshot format version.
pub const VERSION: u32 = 1;

/// Fixed header size in bytes.
pub const HEADER_SIZE: usize = 64;

/// A node flattened for archival. Property bags and edge payloads are stored
/// as JSON strings since `serde_json::Value` has no rkyv representation.
#[derive(Debug, Clone, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
#[rkyv(derive(Debug))]
pub struct StoredNode {
    pub uuid: String,
    pub label: String,
    pub project_id: String,
    pub properties_json: String,
    pub hash: Option<String>,
    pub schema_version: Option<String>,
    pub embeddings_dirty: bool,
    pub schema_dirty: bool,
    pub indexed_at: String,
    pub embeddings: Vec<(String, Vec<f32>)>,
    pub embedding_hashes: Vec<(String, String)>,
}

#[derive(Debug, Clone, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
#[rkyv(derive(Debug))]
pub struct StoredEdge {
    pub edge_type: String,
    pub from: String,
    pub to: String,
    pub properties_json: String,
}

/// The serialized graph.
#[derive(Debug, Clone, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
#[rkyv(derive(Debug))]
pub struct StoredGraph {
    pub nodes: Vec<StoredNode>,
    pub edges: Vec<StoredEdge>,
    pub saved_at: String,
}

fn parse_properties(json: &str) -> Result<PropertyMap> {
    if json.is_empty() {
        return Ok(PropertyMap::new());
    }
    serde_json::from_str(json).map_err(|e| Error::Serialization(format!("property bag: {e}")))
}

impl From<&Node> for StoredNode {
    fn from(node: &Node) -> Self {
        Self {
            uuid: node.uuid.clone(),
            label: node.label.as_str().to_string(),
            project_id: node.project_id.clone(),
            properties_json: serde_json::to_string(&node.properties).unwrap_or_default(),
            hash: node.hash.clone(),
            schema_version: node.schema_version.clone(),
            embeddings_dirty: node.embeddings_dirty,
            schema_dirty: node.schema_dirty,
            indexed_at: node.indexed_at.clone(),
            embeddings: node
                .embeddings
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            embedding_hashes: node
                .embedding_hashes
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

impl StoredNode {
    pub fn into_node(self) -> Result<Node> {
        let label = self
            .label
            .parse()
            .map_err(|_| Error::SnapshotCorrupted(format!("unknown label '{}'", self.label)))?;
        Ok(Node {
            uuid: self.uuid,
            label,
            project_id: self.project_id,
            properties: parse_properties(&self.properties_json)?,
            hash: self.hash,
            schema_version: self.schema_version,
            embeddings_dirty: self.embeddings_dirty,
            schema_dirty: self.schema_dirty,
            indexed_at: self.indexed_at,
            embeddings: self.embeddings.into_iter().collect::<HashMap<_, _>>(),
            embedding_hashes: self.embedding_hashes.into_iter().collect::<HashMap<_, _>>(),
        })
    }
}

impl From<&Edge> for StoredEdge {
    fn from(edge: &Edge) -> Self {
        Self {
            edge_type: edge.edge_type.as_str().to_string(),
            from: edge.from.clone(),
            to: edge.to.clone(),
            properties_json: serde_json::to_string(&edge.properties).unwrap_or_default(),
        }
    }
}

impl StoredEdge {
    pub fn into_edge(self) -> Result<Edge> {
        let edge_type = self.edge_type.parse().map_err(|_| {
            Error::SnapshotCorrupted(format!("unknown edge type '{}'", self.edge_type))
        })?;
        Ok(Edge {
            edge_type,
            from: self.from,
            to: self.to,
            properties: parse_properties(&self.properties_json)?,
        })
    }
}

/// Write a snapshot atomically: serialize, compress, write to `.tmp`,
/// fsync, rename.
pub fn write_snapshot(path: &Path, graph: &StoredGraph) -> Result<()> {
    let archived = rkyv::to_bytes::<rkyv::rancor::Error>(graph)
        .map_err(|e| Error::Serialization(e.to_string()))?;
    let compressed = zstd::encode_all(archived.as_slice(), 3)
        .map_err(|e| Error::Serialization(format!("zstd encode: {e}")))?;

    let meta_offset: u64 = HEADER_SIZE as u64;
    let meta_size: u64 = compressed.len() as u64;

    let mut header = [0u8; HEADER_SIZE];
    header[..6].copy_from_slice(MAGIC);
    header[6..10].copy_from_slice(&VERSION.to_le_bytes());
    header[10..18].copy_from_slice(&meta_offset.to_le_bytes());
    header[18..26].copy_from_slice(&meta_size.to_le_bytes());
    // bytes 26..64 reserved

    let tmp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&tmp_path)?;
    file.write_all(&header)?;
    file.write_all(&compressed)?;
    file.sync_all()?;

    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Load a snapshot via memory-mapping.
pub fn load_snapshot(path: &Path) -> Result<StoredGraph> {
    let file = fs::File::open(path)?;
    let mmap = unsafe { Mmap::map(&file)? };

    if mmap.len() < HEADER_SIZE {
        return Err(Error::SnapshotCorrupted("file too small for header".into()));
    }
    if &mmap[..6] != MAGIC {
        return Err(Error::SnapshotCorrupted("invalid magic bytes".into()));
    }

    let version = u32::from_le_bytes(mmap[6..10].try_into().unwrap());
    if version != VERSION {
        return Err(Error::SnapshotCorrupted(format!(
            "unsupported snapshot version: {version}"
        )));
    }

    let meta_offset = u64::from_le_bytes(mmap[10..18].try_into().unwrap()) as usize;
    let meta_size = u64::from_le_bytes(mmap[18..26].try_into().unwrap()) as usize;
    if meta_offset + meta_size > mmap.len() {
        return Err(Error::SnapshotCorrupted("truncated file".into()));
    }

    let compressed = &mmap[meta_offset..meta_offset + meta_size];
    let archived = zstd::decode_all(compressed)
        .map_err(|e| Error::SnapshotCorrupted(format!("zstd decode: {e}")))?;

    rkyv::from_bytes::<StoredGraph, rkyv::rancor::Error>(&archived)
        .map_err(|e| Error::SnapshotCorrupted(format!("rkyv deserialize: {e}")))
}
