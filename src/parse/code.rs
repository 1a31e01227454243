//! Naive code adapter: one `Scope` node per top-level statement block.
//!
//! This is deliberately shallow — a brace/indent-aware line splitter with a
//! declaration-name regex — because real AST parsers are external
//! collaborators behind the adapter trait. It is enough to give code files
//! scope-level identity for reference resolution and search.

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::Result;
use crate::extract::{family_of, Family};
use crate::graph::{FragmentNode, GraphFragment, Label, PropertyMap};
use crate::hash;

use super::ParserAdapter;

pub struct CodeParser;

struct Block {
    start_line: usize,
    end_line: usize,
    lines: Vec<String>,
}

fn declaration_name() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?:export\s+)?(?:default\s+)?(?:async\s+)?(?:const|let|var|function\*?|class|interface|type|enum|def)\s+([A-Za-z_$][\w$]*)",
        )
        .unwrap()
    })
}

fn identifier() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[A-Za-z_$][\w$]*").unwrap())
}

const KEYWORDS: &[&str] = &[
    "import", "from", "export", "default", "const", "let", "var", "function", "class", "return",
    "async", "await", "new", "if", "else", "for", "while", "def", "pass", "lambda", "require",
];

/// Net brace/paren/bracket depth change of a line, ignoring string contents
/// well enough for top-level splitting.
fn depth_delta(line: &str) -> i32 {
    let mut delta = 0;
    let mut in_string: Option<char> = None;
    let mut prev = '\0';
    for c in line.chars() {
        if let Some(quote) = in_string {
            if c == quote && prev != '\\' {
                in_string = None;
            }
        } else {
            match c {
                '\'' | '"' | '`' => in_string = Some(c),
                '{' | '(' | '[' => delta += 1,
                '}' | ')' | ']' => delta -= 1,
                '/' if prev == '/' => break,
                '#' => break,
                _ => {}
            }
        }
        prev = c;
    }
    delta
}

/// Split source into top-level blocks: a new block starts at an unindented
/// line while bracket depth is zero; indented and bracketed lines continue
/// the current block.
fn split_top_level(text: &str) -> Vec<Block> {
    let mut blocks: Vec<Block> = Vec::new();
    let mut depth: i32 = 0;

    for (idx, line) in text.lines().enumerate() {
        let line_number = idx + 1;
        let is_blank = line.trim().is_empty();
        let starts_at_col0 = line
            .chars()
            .next()
            .map(|c| !c.is_whitespace())
            .unwrap_or(false);

        let starts_new_block = depth <= 0 && starts_at_col0 && !is_blank;
        if starts_new_block || blocks.is_empty() {
            if is_blank && blocks.is_empty() {
                depth += depth_delta(line);
                continue;
            }
            blocks.push(Block {
                start_line: line_number,
                end_line: line_number,
                lines: vec![line.to_string()],
            });
        } else if let Some(block) = blocks.last_mut() {
            if !is_blank {
                block.end_line = line_number;
            }
            block.lines.push(line.to_string());
        }
        depth += depth_delta(line);
    }

    blocks
        .into_iter()
        .map(|mut b| {
            while b
                .lines
                .last()
                .map(|l| l.trim().is_empty())
                .unwrap_or(false)
            {
                b.lines.pop();
            }
            b
        })
        .filter(|b| !b.lines.is_empty())
        .collect()
}

fn is_comment_only(content: &str) -> bool {
    content.lines().all(|l| {
        let t = l.trim();
        t.is_empty() || t.starts_with("//") || t.starts_with('#') || t.starts_with('*') || t.starts_with("/*")
    })
}

/// Pick a name for a block: declared identifier first, then the first
/// non-keyword identifier, then a positional fallback.
fn block_name(content: &str, index: usize) -> String {
    if let Some(caps) = declaration_name().captures(content) {
        return caps[1].to_string();
    }
    for m in identifier().find_iter(content) {
        let word = m.as_str();
        if !KEYWORDS.contains(&word) {
            return word.to_string();
        }
    }
    format!("stmt{index}")
}

fn is_exported(content: &str, family: Family) -> bool {
    match family {
        Family::TsJs => {
            content.trim_start().starts_with("export")
                || content.contains("module.exports")
        }
        // Python top-level defs and classes are importable.
        Family::Python => {
            let t = content.trim_start();
            t.starts_with("def ") || t.starts_with("class ")
        }
        _ => false,
    }
}

fn language_of(extension: &str) -> &'static str {
    match family_of(extension) {
        Family::TsJs => "typescript",
        Family::Python => "python",
        _ => "unknown",
    }
}

impl ParserAdapter for CodeParser {
    fn name(&self) -> &'static str {
        "code"
    }

    fn handles(&self, extension: &str) -> bool {
        matches!(family_of(extension), Family::TsJs | Family::Python)
    }

    fn parse_file(
        &self,
        project_id: &str,
        relative_path: &Path,
        text: &str,
    ) -> Result<GraphFragment> {
        let rel = relative_path.to_string_lossy().replace('\\', "/");
        let extension = relative_path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("");
        let family = family_of(extension);
        let language = language_of(extension);

        let mut fragment = GraphFragment::default();
        let mut scope_index = 0usize;

        for block in split_top_level(text) {
            let content = block.lines.join("\n");
            if is_comment_only(&content) {
                continue;
            }
            let name = block_name(&content, scope_index);

            let mut props = PropertyMap::new();
            props.insert("name".into(), name.clone().into());
            props.insert("content".into(), content.clone().into());
            props.insert("language".into(), language.into());
            props.insert("startLine".into(), block.start_line.into());
            props.insert("endLine".into(), block.end_line.into());
            if is_exported(&content, family) {
                props.insert("exportedAs".into(), name.clone().into());
            }

            fragment.nodes.push(FragmentNode {
                id: hash::node_uuid(
                    Label::Scope.uuid_prefix(),
                    &format!("{project_id}:{rel}:scope:{name}:{scope_index}"),
                ),
                labels: vec![Label::Scope.as_str().to_string()],
                properties: props,
            });
            scope_index += 1;
        }

        Ok(fragment)
    }
}
