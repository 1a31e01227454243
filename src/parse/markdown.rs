//! Markdown adapter: one `MarkdownDocument` per file, a `MarkdownSection`
//! per heading section, and a `CodeBlock` per fenced block.

use std::path::Path;

use pulldown_cmark::{Event, Parser};

use crate::error::Result;
use crate::graph::{FragmentNode, GraphFragment, Label, PropertyMap};
use crate::hash;

use super::ParserAdapter;

pub struct MarkdownParser;

struct Section {
    heading: String,
    level: u8,
    start_line: usize,
    end_line: usize,
    lines: Vec<String>,
}

struct Fence {
    language: String,
    start_line: usize,
    end_line: usize,
    lines: Vec<String>,
}

/// Split YAML frontmatter (`--- … ---`) off the top of a document.
fn split_frontmatter(text: &str) -> (Option<serde_json::Value>, &str, usize) {
    let Some(rest) = text.strip_prefix("---\n") else {
        return (None, text, 0);
    };
    let Some(end) = rest.find("\n---") else {
        return (None, text, 0);
    };
    let yaml = &rest[..end];
    let body_start = match rest[end + 1..].find('\n') {
        Some(nl) => end + 1 + nl + 1,
        None => rest.len(),
    };
    let body = &rest[body_start..];
    let consumed_lines = text[..text.len() - body.len()].lines().count();
    let value = serde_yaml::from_str::<serde_json::Value>(yaml).ok();
    (value, body, consumed_lines)
}

/// Reduce markdown to plain text for embedding-adjacent fields.
pub fn strip_markdown(content: &str) -> String {
    let parser = Parser::new(content);
    let mut text = String::new();
    for event in parser {
        match event {
            Event::Text(t) => text.push_str(&t),
            Event::Code(c) => text.push_str(&c),
            Event::SoftBreak | Event::HardBreak => text.push(' '),
            _ => {}
        }
    }
    text
}

fn scan(body: &str, line_offset: usize) -> (Vec<Section>, Vec<Fence>) {
    let mut sections: Vec<Section> = Vec::new();
    let mut fences: Vec<Fence> = Vec::new();
    let mut open_fence: Option<Fence> = None;

    for (idx, line) in body.lines().enumerate() {
        let line_number = line_offset + idx + 1;

        if let Some(fence) = open_fence.as_mut() {
            if line.trim_start().starts_with("```") {
                fence.end_line = line_number;
                fences.push(open_fence.take().unwrap());
            } else {
                fence.lines.push(line.to_string());
            }
            if let Some(section) = sections.last_mut() {
                section.end_line = line_number;
                section.lines.push(line.to_string());
            }
            continue;
        }

        if let Some(stripped) = line.trim_start().strip_prefix("```") {
            open_fence = Some(Fence {
                language: stripped.trim().to_string(),
                start_line: line_number,
                end_line: line_number,
                lines: Vec::new(),
            });
            if let Some(section) = sections.last_mut() {
                section.end_line = line_number;
                section.lines.push(line.to_string());
            }
            continue;
        }

        let trimmed = line.trim_start();
        let hashes = trimmed.chars().take_while(|&c| c == '#').count();
        if (1..=6).contains(&hashes) && trimmed.chars().nth(hashes) == Some(' ') {
            sections.push(Section {
                heading: trimmed[hashes + 1..].trim().to_string(),
                level: hashes as u8,
                start_line: line_number,
                end_line: line_number,
                lines: Vec::new(),
            });
            continue;
        }

        if let Some(section) = sections.last_mut() {
            section.end_line = line_number;
            section.lines.push(line.to_string());
        }
    }
    if let Some(fence) = open_fence {
        fences.push(fence);
    }
    (sections, fences)
}

impl ParserAdapter for MarkdownParser {
    fn name(&self) -> &'static str {
        "markdown"
    }

    fn handles(&self, extension: &str) -> bool {
        matches!(extension, "md" | "markdown")
    }

    fn parse_file(
        &self,
        project_id: &str,
        relative_path: &Path,
        text: &str,
    ) -> Result<GraphFragment> {
        let rel = relative_path.to_string_lossy().replace('\\', "/");
        let (frontmatter, body, line_offset) = split_frontmatter(text);

        let stem = relative_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| rel.clone());
        let doc_name = frontmatter
            .as_ref()
            .and_then(|fm| fm.get("title"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or(stem);
        let description = frontmatter
            .as_ref()
            .and_then(|fm| fm.get("description"))
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let mut fragment = GraphFragment::default();

        let mut doc_props = PropertyMap::new();
        doc_props.insert("name".into(), doc_name.into());
        doc_props.insert("content".into(), body.to_string().into());
        if let Some(desc) = description {
            doc_props.insert("description".into(), desc.into());
        }
        fragment.nodes.push(FragmentNode {
            id: hash::node_uuid(
                Label::MarkdownDocument.uuid_prefix(),
                &format!("{project_id}:{rel}:document"),
            ),
            labels: vec![Label::MarkdownDocument.as_str().to_string()],
            properties: doc_props,
        });

        let (sections, fences) = scan(body, line_offset);

        for (idx, section) in sections.iter().enumerate() {
            let mut props = PropertyMap::new();
            props.insert("name".into(), section.heading.clone().into());
            props.insert("content".into(), section.lines.join("\n").into());
            props.insert("level".into(), section.level.into());
            props.insert("startLine".into(), section.start_line.into());
            props.insert("endLine".into(), section.end_line.into());
            fragment.nodes.push(FragmentNode {
                id: hash::node_uuid(
                    Label::MarkdownSection.uuid_prefix(),
                    &format!("{project_id}:{rel}:section:{}:{idx}", section.heading),
                ),
                labels: vec![Label::MarkdownSection.as_str().to_string()],
                properties: props,
            });
        }

        for (idx, fence) in fences.iter().enumerate() {
            let content = fence.lines.join("\n");
            if content.trim().is_empty() {
                continue;
            }
            let mut props = PropertyMap::new();
            props.insert(
                "name".into(),
                if fence.language.is_empty() {
                    format!("code block {idx}")
                } else {
                    format!("{} block {idx}", fence.language)
                }
                .into(),
            );
            props.insert("content".into(), content.into());
            props.insert("language".into(), fence.language.clone().into());
            props.insert("startLine".into(), fence.start_line.into());
            props.insert("endLine".into(), fence.end_line.into());
            fragment.nodes.push(FragmentNode {
                id: hash::node_uuid(
                    Label::CodeBlock.uuid_prefix(),
                    &format!("{project_id}:{rel}:fence:{idx}"),
                ),
                labels: vec![Label::CodeBlock.as_str().to_string()],
                properties: props,
            });
        }

        Ok(fragment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> GraphFragment {
        MarkdownParser
            .parse_file("p1", Path::new("docs/guide.md"), text)
            .unwrap()
    }

    #[test]
    fn document_node_always_present() {
        let fragment = parse("just a paragraph");
        assert_eq!(fragment.nodes.len(), 1);
        assert_eq!(fragment.nodes[0].labels, vec!["MarkdownDocument"]);
        assert_eq!(fragment.nodes[0].properties["name"], "guide");
    }

    #[test]
    fn frontmatter_title_and_description() {
        let fragment = parse("---\ntitle: My Guide\ndescription: All about it\n---\n\nBody.");
        let doc = &fragment.nodes[0];
        assert_eq!(doc.properties["name"], "My Guide");
        assert_eq!(doc.properties["description"], "All about it");
        assert_eq!(doc.properties["content"], "\nBody.");
    }

    #[test]
    fn sections_track_headings_and_lines() {
        let fragment = parse("# One\n\nalpha\n\n## Two\n\nbeta\ngamma\n");
        let sections: Vec<&FragmentNode> = fragment
            .nodes
            .iter()
            .filter(|n| n.labels[0] == "MarkdownSection")
            .collect();
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].properties["name"], "One");
        assert_eq!(sections[0].properties["level"], 1);
        assert_eq!(sections[0].properties["startLine"], 1);
        assert_eq!(sections[1].properties["name"], "Two");
        assert_eq!(sections[1].properties["level"], 2);
        assert!(sections[1].properties["content"]
            .as_str()
            .unwrap()
            .contains("gamma"));
    }

    #[test]
    fn fenced_code_blocks_extracted() {
        let fragment = parse("# T\n\n```rust\nfn main() {}\n```\n");
        let blocks: Vec<&FragmentNode> = fragment
            .nodes
            .iter()
            .filter(|n| n.labels[0] == "CodeBlock")
            .collect();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].properties["language"], "rust");
        assert_eq!(blocks[0].properties["content"], "fn main() {}");
    }

    #[test]
    fn node_ids_are_stable_across_reparses() {
        let a = parse("# One\n\nalpha\n");
        let b = parse("# One\n\nalpha changed\n");
        assert_eq!(a.nodes[1].id, b.nodes[1].id);
    }

    #[test]
    fn strip_markdown_removes_formatting() {
        let plain = strip_markdown("# Hi **world** and `code` [link](http://x)");
        assert!(plain.contains("world"));
        assert!(plain.contains("code"));
        assert!(!plain.contains('#'));
        assert!(!plain.contains("http"));
    }
}
