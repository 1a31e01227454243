//! File enumeration shared by ingestion and the watcher.
//!
//! Walks a project root applying gitignore rules, built-in ignore
//! directories, and caller-supplied include/exclude globs; only files whose
//! extension belongs to an indexable family are returned. The watcher uses
//! [`FileDiscovery::should_index`] to filter raw filesystem events with the
//! same rules.

use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::overrides::OverrideBuilder;
use ignore::WalkBuilder;
use tracing::debug;

use crate::error::{Error, Result};
use crate::extract;

/// Directories that are always excluded from discovery.
pub const BUILTIN_IGNORE_DIRS: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    ".ragforge",
    ".claude",
    ".vscode",
    ".idea",
    "node_modules",
    "__pycache__",
    ".venv",
    "venv",
    ".next",
    ".nuxt",
    ".svelte-kit",
    "target",
    "dist",
    "build",
    "out",
];

/// Discovers indexable files under a project root.
#[derive(Debug)]
pub struct FileDiscovery {
    project_root: PathBuf,
    /// Include globs apply in `should_index` so the same logic filters
    /// watcher events.
    include: Option<GlobSet>,
    exclude: Option<GlobSet>,
    exclude_patterns: Vec<String>,
}

fn build_globset(patterns: &[String]) -> Result<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| Error::Config(format!("invalid glob '{pattern}': {e}")))?;
        builder.add(glob);
    }
    builder
        .build()
        .map(Some)
        .map_err(|e| Error::Config(format!("failed to build glob set: {e}")))
}

impl FileDiscovery {
    /// Create a discovery over `project_root` with include/exclude globs
    /// (both relative to the root; empty include means "all indexable").
    pub fn new(project_root: &Path, include: &[String], exclude: &[String]) -> Result<Self> {
        Ok(Self {
            project_root: project_root.to_path_buf(),
            include: build_globset(include)?,
            exclude: build_globset(exclude)?,
            exclude_patterns: exclude.to_vec(),
        })
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// Enumerate all indexable files under the root.
    ///
    /// Returns sorted absolute paths.
    pub fn discover(&self) -> Result<Vec<PathBuf>> {
        if !self.project_root.is_dir() {
            debug!(root = %self.project_root.display(), "project root does not exist");
            return Ok(Vec::new());
        }

        let overrides = self.build_overrides()?;
        let walker = WalkBuilder::new(&self.project_root)
            .standard_filters(true)
            .overrides(overrides)
            .build();

        let mut results = Vec::new();
        for entry in walker {
            let entry = entry.map_err(|e| {
                let msg = e.to_string();
                Error::Io(
                    e.into_io_error()
                        .unwrap_or_else(|| std::io::Error::other(msg)),
                )
            })?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Ok(relative) = path.strip_prefix(&self.project_root) else {
                continue;
            };
            if self.should_index(relative) {
                results.push(path.to_path_buf());
            }
        }
        results.sort();
        results.dedup();
        Ok(results)
    }

    /// Whether a project-relative path should be indexed: indexable
    /// extension, not under a built-in ignored directory, and matching the
    /// include/exclude globs.
    pub fn should_index(&self, relative_path: &Path) -> bool {
        let Some(ext) = relative_path.extension().and_then(|e| e.to_str()) else {
            return false;
        };
        if !extract::indexable_extensions().contains(&ext.to_lowercase().as_str()) {
            return false;
        }

        for component in relative_path.components() {
            if let std::path::Component::Normal(c) = component {
                if let Some(name) = c.to_str() {
                    if BUILTIN_IGNORE_DIRS.contains(&name) {
                        return false;
                    }
                }
            }
        }

        if let Some(include) = &self.include {
            if !include.is_match(relative_path) {
                return false;
            }
        }
        if let Some(exclude) = &self.exclude {
            if exclude.is_match(relative_path) {
                return false;
            }
        }
        true
    }

    fn build_overrides(&self) -> Result<ignore::overrides::Override> {
        let mut builder = OverrideBuilder::new(&self.project_root);
        for dir in BUILTIN_IGNORE_DIRS {
            builder
                .add(&format!("!{dir}/"))
                .map_err(|e| Error::Config(format!("invalid built-in ignore '{dir}': {e}")))?;
        }
        for pattern in &self.exclude_patterns {
            let negated = if pattern.starts_with('!') {
                pattern.clone()
            } else {
                format!("!{pattern}")
            };
            builder
                .add(&negated)
                .map_err(|e| Error::Config(format!("invalid exclude pattern '{pattern}': {e}")))?;
        }
        builder
            .build()
            .map_err(|e| Error::Config(format!("failed to build override rules: {e}")))
    }
}
