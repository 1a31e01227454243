//! Parser-adapter boundary.
//!
//! Adapters turn one file into a graph fragment of labeled nodes and
//! relationships. Real AST and document parsers are external collaborators
//! behind this trait; the bundled adapters (markdown, a deliberately naive
//! code splitter, data files, media stubs) are enough to drive the pipeline
//! and its tests. The registry also exposes the batch `parse` surface: walk
//! include/exclude globs, skip what the caller says to skip, merge per-file
//! fragments.

pub mod code;
pub mod data;
pub mod markdown;
pub mod media;

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::discovery::FileDiscovery;
use crate::error::{Error, Result};
use crate::graph::GraphFragment;

/// Request for a batch parse.
#[derive(Debug, Clone)]
pub struct ParseRequest {
    pub root: PathBuf,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub project_id: String,
    /// Files the ingestion manager decided do not need re-parsing.
    pub skip_files: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct ParseMetadata {
    pub files_parsed: usize,
    pub files_skipped: usize,
    pub nodes: usize,
    pub relationships: usize,
    pub errors: Vec<(PathBuf, String)>,
}

#[derive(Debug, Default)]
pub struct ParseOutput {
    pub graph: GraphFragment,
    pub metadata: ParseMetadata,
}

/// One parser adapter, keyed on file extension.
pub trait ParserAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    fn handles(&self, extension: &str) -> bool;

    /// Parse one file into a graph fragment. `text` is the lossily-decoded
    /// file content; adapters for binary formats ignore it.
    fn parse_file(
        &self,
        project_id: &str,
        relative_path: &Path,
        text: &str,
    ) -> Result<GraphFragment>;
}

/// Dispatches files to adapters and merges their fragments.
pub struct ParserRegistry {
    adapters: Vec<Box<dyn ParserAdapter>>,
}

impl ParserRegistry {
    /// Registry with the bundled adapters.
    pub fn with_builtin() -> Self {
        Self {
            adapters: vec![
                Box::new(markdown::MarkdownParser),
                Box::new(code::CodeParser),
                Box::new(data::DataParser),
                Box::new(media::MediaParser),
            ],
        }
    }

    /// Registry with caller-supplied adapters (external parsers plug in
    /// here).
    pub fn new(adapters: Vec<Box<dyn ParserAdapter>>) -> Self {
        Self { adapters }
    }

    pub fn adapter_for(&self, extension: &str) -> Option<&dyn ParserAdapter> {
        self.adapters
            .iter()
            .map(|a| a.as_ref())
            .find(|a| a.handles(extension))
    }

    /// Parse one file through whichever adapter claims its extension.
    /// Files with no adapter yield an empty fragment.
    pub fn parse_file(
        &self,
        project_id: &str,
        relative_path: &Path,
        text: &str,
    ) -> Result<GraphFragment> {
        let extension = relative_path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();
        match self.adapter_for(&extension) {
            Some(adapter) => {
                debug!(
                    path = %relative_path.display(),
                    adapter = adapter.name(),
                    "parsing file"
                );
                adapter.parse_file(project_id, relative_path, text)
            }
            None => Ok(GraphFragment::default()),
        }
    }

    /// Batch parse: enumerate files under the request's root, skip the
    /// skip-list, and merge all fragments. Per-file parse failures are
    /// collected, not fatal.
    pub async fn parse(&self, request: &ParseRequest) -> Result<ParseOutput> {
        let discovery = FileDiscovery::new(&request.root, &request.include, &request.exclude)?;
        let files = discovery.discover()?;

        let mut output = ParseOutput::default();
        for absolute in files {
            if request.skip_files.contains(&absolute) {
                output.metadata.files_skipped += 1;
                continue;
            }
            let relative = absolute
                .strip_prefix(&request.root)
                .map_err(|_| {
                    Error::Config(format!(
                        "path {} is not under root {}",
                        absolute.display(),
                        request.root.display()
                    ))
                })?
                .to_path_buf();
            let bytes = tokio::fs::read(&absolute).await?;
            let text = String::from_utf8_lossy(&bytes).into_owned();
            match self.parse_file(&request.project_id, &relative, &text) {
                Ok(fragment) => {
                    output.metadata.files_parsed += 1;
                    output.metadata.nodes += fragment.nodes.len();
                    output.metadata.relationships += fragment.relationships.len();
                    output.graph.merge(fragment);
                }
                Err(e) => output.metadata.errors.push((absolute, e.to_string())),
            }
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_covers_families() {
        let registry = ParserRegistry::with_builtin();
        assert!(registry.adapter_for("md").is_some());
        assert!(registry.adapter_for("ts").is_some());
        assert!(registry.adapter_for("json").is_some());
        assert!(registry.adapter_for("png").is_some());
        assert!(registry.adapter_for("exe").is_none());
    }

    #[test]
    fn unhandled_extension_yields_empty_fragment() {
        let registry = ParserRegistry::with_builtin();
        let fragment = registry
            .parse_file("p1", Path::new("bin/tool.exe"), "")
            .unwrap();
        assert!(fragment.nodes.is_empty());
    }

    #[tokio::test]
    async fn batch_parse_merges_and_skips() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.ts"), "export const x = 1").unwrap();
        std::fs::write(dir.path().join("b.md"), "# Title\n\nBody.").unwrap();

        let registry = ParserRegistry::with_builtin();
        let output = registry
            .parse(&ParseRequest {
                root: dir.path().to_path_buf(),
                include: vec![],
                exclude: vec![],
                project_id: "p1".into(),
                skip_files: vec![dir.path().join("b.md")],
            })
            .await
            .unwrap();

        assert_eq!(output.metadata.files_parsed, 1);
        assert_eq!(output.metadata.files_skipped, 1);
        assert!(!output.graph.nodes.is_empty());
    }
}
