//! Media/document stub adapter.
//!
//! Emits the typed content node for binary formats (images, 3D models, PDF,
//! Word, spreadsheets) with its name only. Content and description
//! enrichment — OCR, vision captioning, document text extraction — comes
//! from external providers that replace this adapter through the registry.

use std::path::Path;

use crate::error::Result;
use crate::graph::{FragmentNode, GraphFragment, Label, PropertyMap};
use crate::hash;

use super::ParserAdapter;

pub struct MediaParser;

fn label_for(extension: &str) -> Option<Label> {
    match extension {
        "png" | "jpg" | "jpeg" | "gif" | "svg" | "webp" | "ico" => Some(Label::ImageFile),
        "glb" | "gltf" | "obj" | "stl" => Some(Label::ThreeDFile),
        "pdf" => Some(Label::PdfDocument),
        "docx" => Some(Label::WordDocument),
        "xlsx" => Some(Label::SpreadsheetDocument),
        _ => None,
    }
}

impl ParserAdapter for MediaParser {
    fn name(&self) -> &'static str {
        "media"
    }

    fn handles(&self, extension: &str) -> bool {
        label_for(extension).is_some()
    }

    fn parse_file(
        &self,
        project_id: &str,
        relative_path: &Path,
        _text: &str,
    ) -> Result<GraphFragment> {
        let rel = relative_path.to_string_lossy().replace('\\', "/");
        let extension = relative_path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();
        let Some(label) = label_for(&extension) else {
            return Ok(GraphFragment::default());
        };
        let stem = relative_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| rel.clone());

        let mut props = PropertyMap::new();
        props.insert("name".into(), stem.into());

        let mut fragment = GraphFragment::default();
        fragment.nodes.push(FragmentNode {
            id: hash::node_uuid(label.uuid_prefix(), &format!("{project_id}:{rel}:{label}")),
            labels: std::iter::once(label.as_str().to_string())
                .chain(label.mixins().iter().map(|m| m.to_string()))
                .collect(),
            properties: props,
        });
        Ok(fragment)
    }
}
