//! Property graph model: typed entities with natural keys and labelled
//! relations between them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Relation labels used by the built-in schema and topology seeding
pub mod labels {
    pub const TRIGGERS_ON: &str = "TRIGGERS_ON";
    pub const LOCATED_AT: &str = "LOCATED_AT";
    pub const PART_OF: &str = "PART_OF";
    pub const HAS_ALARM: &str = "HAS_ALARM";
    pub const MENTIONS: &str = "MENTIONS";
}

/// Property map; ordered so serialized items are stable
pub type Properties = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityType {
    Asset,
    Sensor,
    Alarm,
    Event,
}

impl EntityType {
    pub const ALL: [EntityType; 4] = [EntityType::Asset, EntityType::Sensor, EntityType::Alarm, EntityType::Event];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Asset => "Asset",
            EntityType::Sensor => "Sensor",
            EntityType::Alarm => "Alarm",
            EntityType::Event => "Event",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of an entity: natural keys are unique per type
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub entity_type: EntityType,
    pub key: String,
}

impl EntityKey {
    pub fn new(entity_type: EntityType, key: impl Into<String>) -> Self {
        Self { entity_type, key: key.into() }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.entity_type, self.key)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEntity {
    pub entity_type: EntityType,
    pub key: String,
    #[serde(default)]
    pub properties: Properties,
}

impl GraphEntity {
    pub fn new(entity_type: EntityType, key: impl Into<String>) -> Self {
        Self { entity_type, key: key.into(), properties: Properties::new() }
    }

    pub fn with_property(mut self, name: &str, value: impl Into<serde_json::Value>) -> Self {
        self.properties.insert(name.to_string(), value.into());
        self
    }

    pub fn entity_key(&self) -> EntityKey {
        EntityKey::new(self.entity_type, self.key.clone())
    }
}

/// Identity of a relation
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelationKey {
    pub source: EntityKey,
    pub label: String,
    pub target: EntityKey,
}

impl fmt::Display for RelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -{}-> {}", self.source, self.label, self.target)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphRelation {
    pub source: EntityKey,
    pub target: EntityKey,
    pub label: String,
    #[serde(default)]
    pub properties: Properties,
}

impl GraphRelation {
    pub fn new(source: EntityKey, label: impl Into<String>, target: EntityKey) -> Self {
        Self { source, target, label: label.into(), properties: Properties::new() }
    }

    pub fn with_property(mut self, name: &str, value: impl Into<serde_json::Value>) -> Self {
        self.properties.insert(name.to_string(), value.into());
        self
    }

    pub fn relation_key(&self) -> RelationKey {
        RelationKey {
            source: self.source.clone(),
            label: self.label.clone(),
            target: self.target.clone(),
        }
    }
}

/// Graph item proposed for persistence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "item", rename_all = "lowercase")]
pub enum GraphItem {
    Entity(GraphEntity),
    Relation(GraphRelation),
}

/// Entities and relations proposed for one commit
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Candidates {
    pub entities: Vec<GraphEntity>,
    pub relations: Vec<GraphRelation>,
}

impl Candidates {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entities.len() + self.relations.len()
    }

    pub fn extend(&mut self, other: Candidates) {
        self.entities.extend(other.entities);
        self.relations.extend(other.relations);
    }

    pub fn into_items(self) -> impl Iterator<Item = GraphItem> {
        self.entities
            .into_iter()
            .map(GraphItem::Entity)
            .chain(self.relations.into_iter().map(GraphItem::Relation))
    }

    pub fn from_items(items: impl IntoIterator<Item = GraphItem>) -> Self {
        let mut candidates = Candidates::default();
        for item in items {
            match item {
                GraphItem::Entity(e) => candidates.entities.push(e),
                GraphItem::Relation(r) => candidates.relations.push(r),
            }
        }
        candidates
    }
}
