//! Load resource definitions from JSON documents (one resource or an array per document).

use crate::error::SchemaError;
use crate::schema::types::ResourceDefinition;
use serde::Deserialize;
use std::path::Path;

#[derive(Deserialize)]
#[serde(untagged)]
enum Document {
    Many(Vec<ResourceDefinition>),
    One(Box<ResourceDefinition>),
}

pub fn parse_definitions(json: &str) -> Result<Vec<ResourceDefinition>, SchemaError> {
    let doc: Document = serde_json::from_str(json).map_err(|e| SchemaError::Load(e.to_string()))?;
    Ok(match doc {
        Document::Many(defs) => defs,
        Document::One(def) => vec![*def],
    })
}

/// Every `*.json` file in `dir`, in file-name order.
pub fn load_definitions_from_dir(dir: impl AsRef<Path>) -> Result<Vec<ResourceDefinition>, SchemaError> {
    let dir = dir.as_ref();
    let entries = std::fs::read_dir(dir)
        .map_err(|e| SchemaError::Load(format!("{}: {}", dir.display(), e)))?;
    let mut paths = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| SchemaError::Load(e.to_string()))?.path();
        if path.extension().and_then(|e| e.to_str()) == Some("json") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut defs = Vec::new();
    for path in paths {
        let content = std::fs::read_to_string(&path)
            .map_err(|e| SchemaError::Load(format!("{}: {}", path.display(), e)))?;
        let mut parsed = parse_definitions(&content).map_err(|e| match e {
            SchemaError::Load(msg) => SchemaError::Load(format!("{}: {}", path.display(), msg)),
            other => other,
        })?;
        tracing::debug!(path = %path.display(), count = parsed.len(), "loaded definitions");
        defs.append(&mut parsed);
    }
    Ok(defs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{DefaultValue, FieldType, Generator, RelationshipKindName};
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_single_and_array_documents() {
        let one = parse_definitions(
            r#"{"name": "users", "fields": [
                {"name": "id", "type": "uuid", "required": true, "default": {"generated": "uuid"}},
                {"name": "email", "type": "string", "required": true, "format": "email", "unique": true, "max_length": 255}
            ]}"#,
        )
        .unwrap();
        assert_eq!(one.len(), 1);
        let users = &one[0];
        assert_eq!(users.primary_key, "id");
        assert_eq!(users.fields[0].type_, FieldType::Uuid);
        assert_eq!(
            users.fields[0].constraints.default,
            Some(DefaultValue::Generated(Generator::Uuid))
        );
        assert!(users.fields[1].constraints.unique);
        assert_eq!(users.fields[1].constraints.max_length, Some(255));

        let many = parse_definitions(
            r#"[{"name": "a", "fields": []},
                {"name": "b", "fields": [], "relationships": [
                    {"name": "a", "kind": "has_many", "target": "a", "foreign_key": "b_id"}]}]"#,
        )
        .unwrap();
        assert_eq!(many.len(), 2);
        assert_eq!(many[1].relationships[0].kind, RelationshipKindName::OwnedCollection);
    }

    #[test]
    fn literal_defaults_accept_plain_and_wrapped_values() {
        let defs = parse_definitions(
            r#"{"name": "t", "fields": [
                {"name": "a", "type": "integer", "optional": true, "default": 3},
                {"name": "b", "type": "json", "optional": true, "default": {"value": {"k": 1}}}
            ]}"#,
        )
        .unwrap();
        assert_eq!(
            defs[0].fields[0].constraints.default,
            Some(DefaultValue::Literal(serde_json::json!(3)))
        );
        assert_eq!(
            defs[0].fields[1].constraints.default,
            Some(DefaultValue::Literal(serde_json::json!({"k": 1})))
        );
    }

    #[test]
    fn loads_json_files_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("02_posts.json"),
            r#"{"name": "posts", "fields": []}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("01_users.json"),
            r#"[{"name": "users", "fields": []}, {"name": "teams", "fields": []}]"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("README.md"), "ignored").unwrap();

        let defs = load_definitions_from_dir(dir.path()).unwrap();
        let names: Vec<&str> = defs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["users", "teams", "posts"]);
    }

    #[test]
    fn malformed_file_names_its_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.json"), "{ nope").unwrap();
        let err = load_definitions_from_dir(dir.path()).unwrap_err();
        assert!(matches!(err, SchemaError::Load(ref m) if m.contains("bad.json")));
    }
}
