//! Graph schema: allowed entity types, allowed relation triples and
//! required properties per entity type.

use crate::error::{PipelineError, Result};
use crate::graph::{labels, EntityType, GraphEntity, GraphRelation, Properties};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelationSpec {
    pub source: String,
    pub label: String,
    pub target: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SchemaFile {
    entity_types: Vec<String>,
    #[serde(default)]
    relations: Vec<RelationSpec>,
    #[serde(default)]
    required_properties: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GraphSchema {
    entity_types: BTreeSet<EntityType>,
    triples: BTreeSet<(EntityType, String, EntityType)>,
    required: BTreeMap<EntityType, Vec<String>>,
}

impl Default for GraphSchema {
    /// The plant schema used when no schema file is configured
    fn default() -> Self {
        use EntityType::*;
        let triples = [
            (Alarm, labels::TRIGGERS_ON, Event),
            (Event, labels::LOCATED_AT, Asset),
            (Sensor, labels::PART_OF, Asset),
            (Sensor, labels::HAS_ALARM, Alarm),
            (Event, labels::MENTIONS, Asset),
            (Event, labels::MENTIONS, Sensor),
        ];
        let required = [
            (Asset, vec!["id"]),
            (Sensor, vec!["id"]),
            (Alarm, vec!["id"]),
            (Event, vec!["timestamp", "kind"]),
        ];

        Self {
            entity_types: EntityType::ALL.into_iter().collect(),
            triples: triples
                .into_iter()
                .map(|(s, l, t)| (s, l.to_string(), t))
                .collect(),
            required: required
                .into_iter()
                .map(|(t, props)| (t, props.into_iter().map(String::from).collect()))
                .collect(),
        }
    }
}

impl GraphSchema {
    /// Load a schema file. Any failure is fatal.
    pub fn from_yaml_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let name = path.display().to_string();
        let text = std::fs::read_to_string(path).map_err(|e| PipelineError::fatal(&name, e))?;
        let schema = Self::from_yaml(&text).map_err(|e| PipelineError::fatal(&name, e))?;
        info!(
            "Loaded graph schema from {}: {} entity types, {} relation triples",
            name,
            schema.entity_types.len(),
            schema.triples.len()
        );
        Ok(schema)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let file: SchemaFile = serde_yaml::from_str(text)?;
        let parse = |name: &str| {
            EntityType::parse(name)
                .ok_or_else(|| PipelineError::Config(format!("unknown entity type '{}'", name)))
        };

        let mut entity_types = BTreeSet::new();
        for name in &file.entity_types {
            entity_types.insert(parse(name)?);
        }

        let mut triples = BTreeSet::new();
        for spec in &file.relations {
            let (source, target) = (parse(&spec.source)?, parse(&spec.target)?);
            if !entity_types.contains(&source) || !entity_types.contains(&target) {
                return Err(PipelineError::Config(format!(
                    "relation {} references an undeclared entity type",
                    spec.label
                )));
            }
            if spec.label.trim().is_empty() {
                return Err(PipelineError::Config("relation with empty label".into()));
            }
            triples.insert((source, spec.label.clone(), target));
        }

        let mut required = BTreeMap::new();
        for (name, props) in file.required_properties {
            required.insert(parse(&name)?, props);
        }

        Ok(Self { entity_types, triples, required })
    }

    pub fn allows_entity(&self, entity_type: EntityType) -> bool {
        self.entity_types.contains(&entity_type)
    }

    pub fn allows_relation(&self, source: EntityType, label: &str, target: EntityType) -> bool {
        self.triples.contains(&(source, label.to_string(), target))
    }

    /// Whether any triple uses `label`
    pub fn has_label(&self, label: &str) -> bool {
        self.triples.iter().any(|(_, l, _)| l == label)
    }

    pub fn required_properties(&self, entity_type: EntityType) -> &[String] {
        self.required.get(&entity_type).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Sanitize and check an entity.
    pub fn validate_entity(&self, entity: &mut GraphEntity) -> Result<()> {
        if !self.allows_entity(entity.entity_type) {
            return Err(PipelineError::SchemaViolation(format!(
                "entity type {} is not allowed",
                entity.entity_type
            )));
        }
        if entity.key.trim().is_empty() {
            return Err(PipelineError::SchemaViolation(format!(
                "{} entity without a natural key",
                entity.entity_type
            )));
        }
        sanitize(&mut entity.properties);
        let missing: Vec<&str> = self
            .required_properties(entity.entity_type)
            .iter()
            .filter(|p| !entity.properties.contains_key(p.as_str()))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(PipelineError::SchemaViolation(format!(
                "{}({}) is missing required properties: {}",
                entity.entity_type,
                entity.key,
                missing.join(", ")
            )));
        }
        Ok(())
    }

    /// Sanitize and check a relation's type triple.
    pub fn validate_relation(&self, relation: &mut GraphRelation) -> Result<()> {
        if !self.allows_relation(relation.source.entity_type, &relation.label, relation.target.entity_type) {
            return Err(PipelineError::SchemaViolation(format!(
                "relation {} -{}-> {} is not allowed",
                relation.source.entity_type, relation.label, relation.target.entity_type
            )));
        }
        sanitize(&mut relation.properties);
        Ok(())
    }
}

/// Drop null and empty properties
pub fn sanitize(properties: &mut Properties) {
    properties.retain(|_, v| match v {
        serde_json::Value::Null => false,
        serde_json::Value::String(s) => !s.trim().is_empty(),
        serde_json::Value::Array(a) => !a.is_empty(),
        serde_json::Value::Object(o) => !o.is_empty(),
        _ => true,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::EntityKey;
    use serde_json::json;

    #[test]
    fn test_default_schema_triples() {
        let schema = GraphSchema::default();
        assert!(schema.allows_relation(EntityType::Alarm, "TRIGGERS_ON", EntityType::Event));
        assert!(!schema.allows_relation(EntityType::Event, "TRIGGERS_ON", EntityType::Alarm));
        assert!(schema.has_label("MENTIONS"));
        assert!(!schema.has_label("RELATED_TO"));
    }

    #[test]
    fn test_required_properties_after_sanitizing() {
        let schema = GraphSchema::default();
        let mut event = GraphEntity::new(EntityType::Event, "T1:enter-high:1000")
            .with_property("timestamp", "1970-01-01T00:00:01Z")
            .with_property("kind", "")
            .with_property("note", serde_json::Value::Null);
        let err = schema.validate_entity(&mut event).unwrap_err();
        assert!(err.to_string().contains("kind"));
        assert!(!event.properties.contains_key("note"));

        let mut asset = GraphEntity::new(EntityType::Asset, "A1").with_property("id", "A1");
        assert!(schema.validate_entity(&mut asset).is_ok());
    }

    #[test]
    fn test_relation_outside_schema() {
        let schema = GraphSchema::default();
        let mut rel = GraphRelation::new(
            EntityKey::new(EntityType::Asset, "A1"),
            "PART_OF",
            EntityKey::new(EntityType::Sensor, "T1"),
        )
        .with_property("weight", json!([]));
        assert!(matches!(
            schema.validate_relation(&mut rel),
            Err(PipelineError::SchemaViolation(_))
        ));
    }

    #[test]
    fn test_load_yaml_schema() {
        let yaml = r#"
entity_types: [Asset, Sensor]
relations:
  - { source: Sensor, label: PART_OF, target: Asset }
required_properties:
  Asset: [id, area]
"#;
        let schema = GraphSchema::from_yaml(yaml).unwrap();
        assert!(!schema.allows_entity(EntityType::Event));
        assert_eq!(schema.required_properties(EntityType::Asset), ["id", "area"]);

        let bad = "entity_types: [Asset]\nrelations:\n  - { source: Sensor, label: PART_OF, target: Asset }\n";
        assert!(GraphSchema::from_yaml(bad).is_err());
        assert!(GraphSchema::from_yaml("entity_types: [Pipe]").is_err());
    }
}
