//! Data-file adapter: JSON/YAML become a `DataFile` plus one `DataSection`
//! per top-level key; TOML and CSV keep only the file-level node.

use std::path::Path;

use crate::error::Result;
use crate::graph::{FragmentNode, GraphFragment, Label, PropertyMap};
use crate::hash;

use super::ParserAdapter;

pub struct DataParser;

fn parse_value(extension: &str, text: &str) -> Option<serde_json::Value> {
    match extension {
        "json" => serde_json::from_str(text).ok(),
        "yaml" | "yml" => serde_yaml::from_str(text).ok(),
        _ => None,
    }
}

impl ParserAdapter for DataParser {
    fn name(&self) -> &'static str {
        "data"
    }

    fn handles(&self, extension: &str) -> bool {
        matches!(extension, "json" | "yaml" | "yml" | "toml" | "csv")
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
            .unwrap_or("")
            .to_lowercase();
        let stem = relative_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| rel.clone());

        let mut fragment = GraphFragment::default();

        let mut props = PropertyMap::new();
        props.insert("name".into(), stem.into());
        props.insert("content".into(), text.to_string().into());
        props.insert("format".into(), extension.clone().into());
        fragment.nodes.push(FragmentNode {
            id: hash::node_uuid(
                Label::DataFile.uuid_prefix(),
                &format!("{project_id}:{rel}:datafile"),
            ),
            labels: vec![Label::DataFile.as_str().to_string()],
            properties: props,
        });

        if let Some(serde_json::Value::Object(map)) = parse_value(&extension, text) {
            for (key, value) in &map {
                let mut props = PropertyMap::new();
                props.insert("name".into(), key.clone().into());
                props.insert(
                    "content".into(),
                    serde_json::to_string_pretty(value)
                        .unwrap_or_default()
                        .into(),
                );
                fragment.nodes.push(FragmentNode {
                    id: hash::node_uuid(
                        Label::DataSection.uuid_prefix(),
                        &format!("{project_id}:{rel}:section:{key}"),
                    ),
                    labels: vec![Label::DataSection.as_str().to_string()],
                    properties: props,
                });
            }
        }

        Ok(fragment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_top_level_keys_become_sections() {
        let fragment = DataParser
            .parse_file(
                "p1",
                Path::new("config/app.json"),
                r#"{"server": {"port": 80}, "debug": true}"#,
            )
            .unwrap();
        assert_eq!(fragment.nodes.len(), 3);
        assert_eq!(fragment.nodes[0].labels, vec!["DataFile"]);
        assert_eq!(fragment.nodes[0].properties["format"], "json");
        let names: Vec<&str> = fragment.nodes[1..]
            .iter()
            .map(|n| n.properties["name"].as_str().unwrap())
            .collect();
        assert!(names.contains(&"server"));
        assert!(names.contains(&"debug"));
    }

    #[test]
    fn yaml_parses_like_json() {
        let fragment = DataParser
            .parse_file("p1", Path::new("x.yaml"), "alpha: 1\nbeta:\n  nested: 2\n")
            .unwrap();
        assert_eq!(fragment.nodes.len(), 3);
    }

    #[test]
    fn invalid_json_keeps_file_node_only() {
        let fragment = DataParser
            .parse_file("p1", Path::new("broken.json"), "{not json")
            .unwrap();
        assert_eq!(fragment.nodes.len(), 1);
    }

    #[test]
    fn csv_gets_file_node_only() {
        let fragment = DataParser
            .parse_file("p1", Path::new("data.csv"), "a,b\n1,2\n")
            .unwrap();
        assert_eq!(fragment.nodes.len(), 1);
        assert_eq!(fragment.nodes[0].properties["format"], "csv");
    }
}
