//! Language-agnostic reference extraction.
//!
//! One pure extractor per extension family, driven by a table of
//! `(family, pattern set)`. Extraction returns raw specifiers plus imported
//! symbols; candidate resolution and edge emission live in [`crate::resolve`].
//! External references (`http(s):`, `mailto:`, `data:`, `javascript:`, bare
//! anchors) are discarded — only specifiers starting with `.` or `/` are
//! kept.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

/// Extension family a file belongs to, keyed on its extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    TsJs,
    Python,
    Markdown,
    Css,
    Html,
    /// Single-file components (Vue/Svelte): the script block is extracted
    /// and re-run through the TS/JS rules.
    Component,
    Data,
    Asset,
    Document,
    Other,
}

impl Family {
    /// Extensions probed, in order, when a specifier of this family has no
    /// extension.
    pub fn extensions(&self) -> &'static [&'static str] {
        match self {
            Family::TsJs => &["ts", "tsx", "js", "jsx", "mjs", "cjs"],
            Family::Python => &["py"],
            Family::Markdown => &["md", "markdown"],
            Family::Css => &["css", "scss", "less"],
            Family::Html => &["html", "htm"],
            Family::Component => &["vue", "svelte"],
            Family::Data => &["json", "yaml", "yml", "toml", "csv"],
            Family::Asset => &[
                "png", "jpg", "jpeg", "gif", "svg", "webp", "ico", "mp3", "mp4", "wav", "glb",
                "gltf", "obj", "stl",
            ],
            Family::Document => &["pdf", "docx", "xlsx"],
            Family::Other => &[],
        }
    }
}

/// Classify an extension into its family.
pub fn family_of(extension: &str) -> Family {
    let ext = extension.to_lowercase();
    for family in [
        Family::TsJs,
        Family::Python,
        Family::Markdown,
        Family::Css,
        Family::Html,
        Family::Component,
        Family::Data,
        Family::Asset,
        Family::Document,
    ] {
        if family.extensions().contains(&ext.as_str()) {
            return family;
        }
    }
    Family::Other
}

/// Every extension the ingestion pipeline considers indexable.
pub fn indexable_extensions() -> Vec<&'static str> {
    let mut out = Vec::new();
    for family in [
        Family::TsJs,
        Family::Python,
        Family::Markdown,
        Family::Css,
        Family::Html,
        Family::Component,
        Family::Data,
        Family::Asset,
        Family::Document,
    ] {
        out.extend_from_slice(family.extensions());
    }
    out
}

/// A single reference extracted from a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawReference {
    /// The raw specifier as written (`./a`, `/img/logo.png`, `../pkg/mod`).
    pub source: String,
    /// Imported symbols, when the syntax names them. `"*"` means wildcard.
    pub symbols: Vec<String>,
}

fn ts_js_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            // import { a, b as c } from '...'
            Regex::new(r#"import\s*\{([^}]*)\}\s*from\s*['"]([^'"]+)['"]"#).unwrap(),
            // import d from '...' / import d, { a } from '...'
            Regex::new(r#"import\s+([A-Za-z_$][\w$]*)\s*(?:,\s*\{[^}]*\})?\s*from\s*['"]([^'"]+)['"]"#)
                .unwrap(),
            // import * as ns from '...'
            Regex::new(r#"import\s*\*\s*as\s+[A-Za-z_$][\w$]*\s*from\s*['"]([^'"]+)['"]"#).unwrap(),
            // export { a } from '...' / export * from '...'
            Regex::new(r#"export\s*(?:\{([^}]*)\}|\*)\s*from\s*['"]([^'"]+)['"]"#).unwrap(),
            // side-effect import '...'
            Regex::new(r#"import\s*['"]([^'"]+)['"]"#).unwrap(),
            // dynamic import('...')
            Regex::new(r#"import\(\s*['"]([^'"]+)['"]\s*\)"#).unwrap(),
            // require('...')
            Regex::new(r#"require\(\s*['"]([^'"]+)['"]\s*\)"#).unwrap(),
        ]
    })
}

fn python_import() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*from\s+([.\w]+)\s+import\s+([^\n]+)").unwrap())
}

fn markdown_link() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"!?\[[^\]]*\]\(([^)\s]+)[^)]*\)").unwrap())
}

fn css_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            Regex::new(r#"@import\s+(?:url\(\s*)?['"]?([^'")\s;]+)"#).unwrap(),
            Regex::new(r#"url\(\s*['"]?([^'")]+?)['"]?\s*\)"#).unwrap(),
        ]
    })
}

fn html_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            Regex::new(r#"<script[^>]*\ssrc=["']([^"']+)["']"#).unwrap(),
            Regex::new(r#"<link[^>]*\shref=["']([^"']+)["']"#).unwrap(),
            Regex::new(r#"<img[^>]*\ssrc=["']([^"']+)["']"#).unwrap(),
            Regex::new(r#"<a[^>]*\shref=["']([^"']+)["']"#).unwrap(),
        ]
    })
}

fn script_block() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<script[^>]*>(.*?)</script>").unwrap())
}

/// Whether a raw specifier points outside the local filesystem.
fn is_external(specifier: &str) -> bool {
    let lower = specifier.to_lowercase();
    lower.starts_with("http:")
        || lower.starts_with("https:")
        || lower.starts_with("//")
        || lower.starts_with("mailto:")
        || lower.starts_with("data:")
        || lower.starts_with("javascript:")
        || lower.starts_with('#')
}

/// Whether a specifier is kept: local paths only.
fn is_local(specifier: &str) -> bool {
    !is_external(specifier) && (specifier.starts_with('.') || specifier.starts_with('/'))
}

/// Strip a `#fragment` from a specifier.
fn strip_anchor(specifier: &str) -> &str {
    specifier.split('#').next().unwrap_or(specifier)
}

/// Parse a named-import list (`a, b as c`) into exported symbol names.
fn parse_symbol_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .filter_map(|part| {
            let name = part.trim().split_whitespace().next()?;
            if name.is_empty() || name == "type" {
                None
            } else {
                Some(name.trim_matches(|c: char| !c.is_alphanumeric() && c != '_' && c != '$' && c != '*')
                    .to_string())
            }
        })
        .filter(|s| !s.is_empty())
        .collect()
}

/// Convert a Python relative module path (`.mod`, `..pkg.mod`) to a
/// path-style specifier.
fn python_module_to_path(module: &str) -> Option<String> {
    let dots = module.chars().take_while(|&c| c == '.').count();
    if dots == 0 {
        return None; // absolute import, not a local file reference
    }
    let rest = &module[dots..];
    let mut prefix = String::new();
    if dots == 1 {
        prefix.push_str("./");
    } else {
        for _ in 0..dots - 1 {
            prefix.push_str("../");
        }
    }
    let path = rest.replace('.', "/");
    Some(format!("{prefix}{path}"))
}

fn extract_ts_js(text: &str) -> Vec<RawReference> {
    let patterns = ts_js_patterns();
    let mut out: Vec<RawReference> = Vec::new();

    for caps in patterns[0].captures_iter(text) {
        out.push(RawReference {
            source: caps[2].to_string(),
            symbols: parse_symbol_list(&caps[1]),
        });
    }
    for caps in patterns[1].captures_iter(text) {
        out.push(RawReference {
            source: caps[2].to_string(),
            symbols: vec![caps[1].to_string()],
        });
    }
    for caps in patterns[2].captures_iter(text) {
        out.push(RawReference {
            source: caps[1].to_string(),
            symbols: vec!["*".to_string()],
        });
    }
    for caps in patterns[3].captures_iter(text) {
        let symbols = caps
            .get(1)
            .map(|m| parse_symbol_list(m.as_str()))
            .unwrap_or_else(|| vec!["*".to_string()]);
        out.push(RawReference {
            source: caps[2].to_string(),
            symbols,
        });
    }
    for pattern in &patterns[4..] {
        for caps in pattern.captures_iter(text) {
            out.push(RawReference {
                source: caps[1].to_string(),
                symbols: Vec::new(),
            });
        }
    }
    out
}

fn extract_python(text: &str) -> Vec<RawReference> {
    python_import()
        .captures_iter(text)
        .filter_map(|caps| {
            let source = python_module_to_path(&caps[1])?;
            Some(RawReference {
                source,
                symbols: parse_symbol_list(&caps[2]),
            })
        })
        .collect()
}

fn extract_markdown(text: &str) -> Vec<RawReference> {
    markdown_link()
        .captures_iter(text)
        .map(|caps| RawReference {
            source: strip_anchor(&caps[1]).to_string(),
            symbols: Vec::new(),
        })
        .filter(|r| !r.source.is_empty())
        .collect()
}

fn extract_css(text: &str) -> Vec<RawReference> {
    css_patterns()
        .iter()
        .flat_map(|p| p.captures_iter(text))
        .map(|caps| RawReference {
            source: caps[1].to_string(),
            symbols: Vec::new(),
        })
        .collect()
}

fn extract_html(text: &str) -> Vec<RawReference> {
    html_patterns()
        .iter()
        .flat_map(|p| p.captures_iter(text))
        .map(|caps| RawReference {
            source: strip_anchor(&caps[1]).to_string(),
            symbols: Vec::new(),
        })
        .collect()
}

fn extract_component(text: &str) -> Vec<RawReference> {
    script_block()
        .captures_iter(text)
        .flat_map(|caps| extract_ts_js(&caps[1]))
        .collect()
}

/// Extract local references from a file's text, keyed on its extension
/// family. Duplicate specifiers merge their symbol lists.
pub fn extract_references(text: &str, extension: &str) -> Vec<RawReference> {
    let raw = match family_of(extension) {
        Family::TsJs => extract_ts_js(text),
        Family::Python => extract_python(text),
        Family::Markdown => extract_markdown(text),
        Family::Css => extract_css(text),
        Family::Html => extract_html(text),
        Family::Component => extract_component(text),
        _ => Vec::new(),
    };

    let mut merged: HashMap<String, Vec<String>> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    for reference in raw {
        if !is_local(&reference.source) {
            continue;
        }
        let entry = merged.entry(reference.source.clone()).or_insert_with(|| {
            order.push(reference.source.clone());
            Vec::new()
        });
        for symbol in reference.symbols {
            if !entry.contains(&symbol) {
                entry.push(symbol);
            }
        }
    }
    order
        .into_iter()
        .map(|source| {
            let symbols = merged.remove(&source).unwrap_or_default();
            RawReference { source, symbols }
        })
        .collect()
}
