//! Rule-driven entity and relation extraction.
//!
//! An event binds a small set of entities: the event itself, its tag's
//! sensor, the sensor's asset, the tag's alarm and any assets or sensors
//! mentioned in the event description. Relation rules then connect bound
//! entities by type. Extraction is a pure function of the event and the
//! static metadata, so re-extracting an event yields the same candidates.

use crate::alarms::{alarm_key, AlarmPriority, AlarmRuleSet, Event, TransitionKind};
use crate::error::{PipelineError, Result};
use crate::graph::{labels, Candidates, EntityKey, EntityType, GraphEntity, GraphRelation};
use crate::registry::TagRegistry;
use crate::schema::GraphSchema;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Longest run of tokens joined when looking up multi-word names
const MAX_MENTION_WORDS: usize = 3;

// ============================================================================
// RULES
// ============================================================================

/// When a relation rule applies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "TriggerRepr", into = "TriggerRepr")]
pub enum Trigger {
    Always,
    Transition(Vec<TransitionKind>),
    Entering,
    Clearing,
    MinPriority(AlarmPriority),
    /// Pairs where an endpoint came from a mention in the description
    Mentioned,
}

impl Default for Trigger {
    fn default() -> Self {
        Trigger::Always
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum SimpleTrigger {
    Always,
    Entering,
    Clearing,
    Mentioned,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum TriggerRepr {
    Simple(SimpleTrigger),
    Transition { transition: Vec<TransitionKind> },
    MinPriority { min_priority: AlarmPriority },
}

impl From<TriggerRepr> for Trigger {
    fn from(repr: TriggerRepr) -> Self {
        match repr {
            TriggerRepr::Simple(SimpleTrigger::Always) => Trigger::Always,
            TriggerRepr::Simple(SimpleTrigger::Entering) => Trigger::Entering,
            TriggerRepr::Simple(SimpleTrigger::Clearing) => Trigger::Clearing,
            TriggerRepr::Simple(SimpleTrigger::Mentioned) => Trigger::Mentioned,
            TriggerRepr::Transition { transition } => Trigger::Transition(transition),
            TriggerRepr::MinPriority { min_priority } => Trigger::MinPriority(min_priority),
        }
    }
}

impl From<Trigger> for TriggerRepr {
    fn from(trigger: Trigger) -> Self {
        match trigger {
            Trigger::Always => TriggerRepr::Simple(SimpleTrigger::Always),
            Trigger::Entering => TriggerRepr::Simple(SimpleTrigger::Entering),
            Trigger::Clearing => TriggerRepr::Simple(SimpleTrigger::Clearing),
            Trigger::Mentioned => TriggerRepr::Simple(SimpleTrigger::Mentioned),
            Trigger::Transition(transition) => TriggerRepr::Transition { transition },
            Trigger::MinPriority(min_priority) => TriggerRepr::MinPriority { min_priority },
        }
    }
}

impl Trigger {
    fn matches(&self, event: &Event, provenance: Provenance) -> bool {
        match (self, provenance) {
            (Trigger::Mentioned, Provenance::Mentioned) => true,
            (_, Provenance::Mentioned) | (Trigger::Mentioned, _) => false,
            (Trigger::Always, _) => true,
            (Trigger::Transition(kinds), _) => kinds.contains(&event.kind),
            (Trigger::Entering, _) => event.kind.is_entering(),
            (Trigger::Clearing, _) => !event.kind.is_entering(),
            (Trigger::MinPriority(p), _) => event.priority.at_least(*p),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationRule {
    pub source: EntityType,
    pub target: EntityType,
    pub label: String,
    #[serde(default)]
    pub when: Trigger,
}

impl RelationRule {
    pub fn new(source: EntityType, label: impl Into<String>, target: EntityType, when: Trigger) -> Self {
        Self { source, target, label: label.into(), when }
    }

    /// Rules relating every event to its alarm and asset, plus mentions
    pub fn defaults() -> Vec<RelationRule> {
        use EntityType::*;
        vec![
            RelationRule::new(Alarm, labels::TRIGGERS_ON, Event, Trigger::Always),
            RelationRule::new(Event, labels::LOCATED_AT, Asset, Trigger::Always),
            RelationRule::new(Event, labels::MENTIONS, Asset, Trigger::Mentioned),
            RelationRule::new(Event, labels::MENTIONS, Sensor, Trigger::Mentioned),
        ]
    }

    /// Load a YAML rule list. Rules outside the schema are skipped with a
    /// warning; an unreadable or unparseable file is fatal.
    pub fn load_yaml_path(path: impl AsRef<Path>, schema: &GraphSchema) -> Result<Vec<RelationRule>> {
        let path = path.as_ref();
        let name = path.display().to_string();
        let text = std::fs::read_to_string(path).map_err(|e| PipelineError::fatal(&name, e))?;
        let rules = Self::load_yaml(&text, schema).map_err(|e| PipelineError::fatal(&name, e))?;
        info!("Loaded {} relation rules from {}", rules.len(), name);
        Ok(rules)
    }

    pub fn load_yaml(text: &str, schema: &GraphSchema) -> Result<Vec<RelationRule>> {
        let rules: Vec<RelationRule> = if text.trim().is_empty() {
            Vec::new()
        } else {
            serde_yaml::from_str(text)?
        };
        Ok(rules
            .into_iter()
            .filter(|rule| match rule.check(schema) {
                Ok(()) => true,
                Err(e) => {
                    warn!("Skipping relation rule: {}", e);
                    false
                }
            })
            .collect())
    }

    pub fn check(&self, schema: &GraphSchema) -> Result<()> {
        if !schema.allows_relation(self.source, &self.label, self.target) {
            return Err(PipelineError::RuleMisconfiguration(format!(
                "{} -{}-> {} is not allowed by the graph schema",
                self.source, self.label, self.target
            )));
        }
        Ok(())
    }
}

// ============================================================================
// EXTRACTOR
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Provenance {
    Direct,
    Mentioned,
}

impl Provenance {
    fn pair(a: Provenance, b: Provenance) -> Provenance {
        if a == Provenance::Mentioned || b == Provenance::Mentioned {
            Provenance::Mentioned
        } else {
            Provenance::Direct
        }
    }
}

/// Stateless event-to-candidates extractor
#[derive(Clone)]
pub struct Extractor {
    registry: Arc<TagRegistry>,
    alarm_rules: Arc<AlarmRuleSet>,
    rules: Vec<RelationRule>,
    token: Regex,
}

impl Extractor {
    pub fn new(
        registry: Arc<TagRegistry>,
        alarm_rules: Arc<AlarmRuleSet>,
        mut rules: Vec<RelationRule>,
    ) -> Result<Self> {
        // rule order never affects output
        rules.sort_by(|a, b| {
            (a.source, &a.label, a.target).cmp(&(b.source, &b.label, b.target))
        });
        let token = Regex::new(r"[A-Za-z0-9](?:[A-Za-z0-9_\-./]*[A-Za-z0-9])?")
            .map_err(|e| PipelineError::Config(format!("mention pattern: {}", e)))?;
        Ok(Self { registry, alarm_rules, rules, token })
    }

    pub fn rules(&self) -> &[RelationRule] {
        &self.rules
    }

    /// Candidates for one event
    pub fn extract(&self, event: &Event) -> Candidates {
        let mut bound: Vec<(GraphEntity, Provenance)> = vec![(event_entity(event), Provenance::Direct)];

        if let Some(def) = self.registry.get(&event.tag) {
            bound.push((sensor_entity(def), Provenance::Direct));
        }
        if !event.asset.is_empty() {
            bound.push((asset_entity(&event.asset), Provenance::Direct));
        }
        if self.alarm_rules.get(&event.tag).is_some() {
            if let Some(alarm) = self.alarm_entity(&event.tag) {
                bound.push((alarm, Provenance::Direct));
            }
        }
        for mention in self.mentions(&event.description) {
            if !bound.iter().any(|(e, _)| e.entity_type == mention.entity_type && e.key == mention.key) {
                bound.push((mention, Provenance::Mentioned));
            }
        }

        let mut relations: BTreeMap<_, GraphRelation> = BTreeMap::new();
        for rule in &self.rules {
            for (source, source_prov) in bound.iter().filter(|(e, _)| e.entity_type == rule.source) {
                for (target, target_prov) in bound.iter().filter(|(e, _)| e.entity_type == rule.target) {
                    if source.entity_type == target.entity_type && source.key == target.key {
                        continue;
                    }
                    if !rule.when.matches(event, Provenance::pair(*source_prov, *target_prov)) {
                        continue;
                    }
                    let relation = GraphRelation::new(source.entity_key(), rule.label.clone(), target.entity_key());
                    relations.entry(relation.relation_key()).or_insert(relation);
                }
            }
        }

        if relations.is_empty() {
            debug!("No relation rule matched event {}", event.key());
        }

        Candidates {
            entities: bound.into_iter().map(|(e, _)| e).collect(),
            relations: relations.into_values().collect(),
        }
    }

    /// Assets and sensors named in free text, resolved case-insensitively.
    /// Unresolved words are discarded.
    pub fn mentions(&self, text: &str) -> Vec<GraphEntity> {
        let words: Vec<&str> = self.token.find_iter(text).map(|m| m.as_str()).collect();
        let mut found: BTreeMap<EntityKey, GraphEntity> = BTreeMap::new();

        for start in 0..words.len() {
            for len in 1..=MAX_MENTION_WORDS.min(words.len() - start) {
                let phrase = words[start..start + len].join(" ");
                if let Some(tag) = self.registry.resolve_tag(&phrase) {
                    if let Some(def) = self.registry.get(tag) {
                        let sensor = sensor_entity(def);
                        found.entry(sensor.entity_key()).or_insert(sensor);
                    }
                }
                if let Some(asset) = self.registry.resolve_asset(&phrase) {
                    let asset = asset_entity(asset);
                    found.entry(asset.entity_key()).or_insert(asset);
                }
            }
        }
        found.into_values().collect()
    }

    fn alarm_entity(&self, tag: &str) -> Option<GraphEntity> {
        self.alarm_rules.get(tag).map(alarm_entity)
    }

    /// Static plant graph: assets, sensors and alarms with PART_OF and
    /// HAS_ALARM relations.
    pub fn seed_topology(&self) -> Candidates {
        let mut candidates = Candidates::default();

        for asset in self.registry.assets() {
            candidates.entities.push(asset_entity(asset));
        }
        for def in self.registry.definitions() {
            let sensor = sensor_entity(def);
            candidates.relations.push(GraphRelation::new(
                sensor.entity_key(),
                labels::PART_OF,
                EntityKey::new(EntityType::Asset, def.asset.clone()),
            ));
            if let Some(alarm) = self.alarm_entity(&def.id) {
                candidates.relations.push(GraphRelation::new(
                    sensor.entity_key(),
                    labels::HAS_ALARM,
                    alarm.entity_key(),
                ));
                candidates.entities.push(alarm);
            }
            candidates.entities.push(sensor);
        }

        info!(
            "Seeded topology: {} entities, {} relations",
            candidates.entities.len(),
            candidates.relations.len()
        );
        candidates
    }
}

// ============================================================================
// ENTITY BUILDERS
// ============================================================================

fn asset_entity(asset: &str) -> GraphEntity {
    GraphEntity::new(EntityType::Asset, asset).with_property("id", asset)
}

fn sensor_entity(def: &crate::registry::TagDefinition) -> GraphEntity {
    let mut sensor = GraphEntity::new(EntityType::Sensor, def.id.clone())
        .with_property("id", def.id.clone())
        .with_property("data_type", def.data_type.name())
        .with_property("unit", def.unit.clone())
        .with_property("asset", def.asset.clone());
    if let Some(min) = def.min {
        sensor = sensor.with_property("min", min);
    }
    if let Some(max) = def.max {
        sensor = sensor.with_property("max", max);
    }
    if let Some(description) = &def.description {
        sensor = sensor.with_property("description", description.clone());
    }
    sensor
}

fn alarm_entity(rule: &crate::alarms::AlarmRule) -> GraphEntity {
    let mut alarm = GraphEntity::new(EntityType::Alarm, alarm_key(&rule.tag))
        .with_property("id", alarm_key(&rule.tag))
        .with_property("tag", rule.tag.clone())
        .with_property("hysteresis", rule.hysteresis)
        .with_property("priority", rule.priority.as_str())
        .with_property("enabled", rule.enabled);
    if let Some(high) = rule.high {
        alarm = alarm.with_property("high", high);
    }
    if let Some(low) = rule.low {
        alarm = alarm.with_property("low", low);
    }
    if let Some(description) = &rule.description {
        alarm = alarm.with_property("description", description.clone());
    }
    alarm
}

fn event_entity(event: &Event) -> GraphEntity {
    let mut entity = GraphEntity::new(EntityType::Event, event.key())
        .with_property("tag", event.tag.clone())
        .with_property("asset", event.asset.clone())
        .with_property("kind", event.kind.as_str())
        .with_property("timestamp", event.timestamp.to_rfc3339())
        .with_property("value", event.value)
        .with_property("priority", event.priority.as_str())
        .with_property("quality", event.quality.as_str())
        .with_property("description", event.description.clone());
    if let Some(threshold) = event.threshold {
        entity = entity.with_property("threshold", threshold);
    }
    entity
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarms::AlarmRule;
    use crate::registry::TagDefinition;
    use crate::value::{DataType, Quality};
    use chrono::{DateTime, Utc};

    fn fixture() -> (Arc<TagRegistry>, Arc<AlarmRuleSet>) {
        let registry = TagRegistry::from_definitions(vec![
            TagDefinition::new("T1", DataType::Numeric, "A1"),
            TagDefinition::new("T2", DataType::Numeric, "Feed Pump"),
        ])
        .unwrap();
        let rules = AlarmRuleSet::from_rules(
            vec![AlarmRule::new("T1").with_high(100.0).with_hysteresis(5.0)],
            &registry,
        );
        (Arc::new(registry), Arc::new(rules))
    }

    fn event(kind: TransitionKind, description: &str) -> Event {
        Event {
            tag: "T1".into(),
            asset: "A1".into(),
            kind,
            timestamp: DateTime::<Utc>::from_timestamp(1, 0).unwrap(),
            value: 105.0,
            threshold: Some(100.0),
            priority: AlarmPriority::Medium,
            quality: Quality::Good,
            description: description.into(),
        }
    }

    fn labels_of(c: &Candidates) -> Vec<String> {
        c.relations
            .iter()
            .map(|r| format!("{}-{}->{}", r.source.key, r.label, r.target.key))
            .collect()
    }

    #[test]
    fn test_default_rules_link_alarm_and_asset() {
        let (registry, alarms) = fixture();
        let extractor = Extractor::new(registry, alarms, RelationRule::defaults()).unwrap();
        let candidates = extractor.extract(&event(TransitionKind::EnterHigh, "T1 = 105 crossed HIGH threshold (100)"));

        assert_eq!(
            labels_of(&candidates),
            vec!["T1:alarm-TRIGGERS_ON->T1:enter-high:1000", "T1:enter-high:1000-LOCATED_AT->A1"]
        );
        assert_eq!(candidates.entities[0].key, "T1:enter-high:1000");
        assert_eq!(candidates.entities.len(), 4);
    }

    #[test]
    fn test_mentions_resolve_case_insensitively() {
        let (registry, alarms) = fixture();
        let extractor = Extractor::new(registry, alarms, RelationRule::defaults()).unwrap();
        let candidates = extractor.extract(&event(
            TransitionKind::EnterHigh,
            "T1 high, check feed pump and t2; ignore Boiler-9",
        ));
        let labels = labels_of(&candidates);
        assert!(labels.contains(&"T1:enter-high:1000-MENTIONS->Feed Pump".to_string()));
        assert!(labels.contains(&"T1:enter-high:1000-MENTIONS->T2".to_string()));
        assert!(!labels.iter().any(|l| l.contains("Boiler")));
        // the event's own sensor and asset are direct, never mentions
        assert!(!labels.contains(&"T1:enter-high:1000-MENTIONS->T1".to_string()));
    }

    #[test]
    fn test_triggers() {
        let (registry, alarms) = fixture();
        let rules = vec![
            RelationRule::new(EntityType::Event, "LOCATED_AT", EntityType::Asset, Trigger::Clearing),
            RelationRule::new(
                EntityType::Alarm,
                "TRIGGERS_ON",
                EntityType::Event,
                Trigger::MinPriority(AlarmPriority::High),
            ),
        ];
        let extractor = Extractor::new(registry, alarms, rules).unwrap();

        assert!(extractor.extract(&event(TransitionKind::EnterHigh, "")).relations.is_empty());
        assert_eq!(extractor.extract(&event(TransitionKind::ClearHigh, "")).relations.len(), 1);

        let mut critical = event(TransitionKind::EnterHigh, "");
        critical.priority = AlarmPriority::Critical;
        assert_eq!(extractor.extract(&critical).relations[0].label, "TRIGGERS_ON");
    }

    #[test]
    fn test_no_rules_no_relations() {
        let (registry, alarms) = fixture();
        let extractor = Extractor::new(registry, alarms, Vec::new()).unwrap();
        let candidates = extractor.extract(&event(TransitionKind::EnterHigh, "feed pump"));
        assert!(candidates.relations.is_empty());
        assert!(!candidates.entities.is_empty());
    }

    #[test]
    fn test_extraction_is_deterministic_across_rule_order() {
        let (registry, alarms) = fixture();
        let mut reversed = RelationRule::defaults();
        reversed.reverse();
        let a = Extractor::new(registry.clone(), alarms.clone(), RelationRule::defaults()).unwrap();
        let b = Extractor::new(registry, alarms, reversed).unwrap();
        let e = event(TransitionKind::EnterHigh, "see T2 on Feed Pump");
        assert_eq!(a.extract(&e), b.extract(&e));
    }

    #[test]
    fn test_load_rules_skips_schema_violations() {
        let yaml = r#"
- { source: Alarm, target: Event, label: TRIGGERS_ON, when: always }
- { source: Event, target: Asset, label: LOCATED_AT, when: { transition: [enter-high, clear-high] } }
- { source: Event, target: Asset, label: OWNS }
- { source: Event, target: Sensor, label: MENTIONS, when: mentioned }
- { source: Alarm, target: Event, label: TRIGGERS_ON, when: { min_priority: critical } }
"#;
        let rules = RelationRule::load_yaml(yaml, &GraphSchema::default()).unwrap();
        assert_eq!(rules.len(), 4);
        assert_eq!(
            rules[1].when,
            Trigger::Transition(vec![TransitionKind::EnterHigh, TransitionKind::ClearHigh])
        );
        assert_eq!(rules[2].when, Trigger::Mentioned);
        assert_eq!(rules[3].when, Trigger::MinPriority(AlarmPriority::Critical));
    }

    #[test]
    fn test_seed_topology() {
        let (registry, alarms) = fixture();
        let extractor = Extractor::new(registry, alarms, RelationRule::defaults()).unwrap();
        let seed = extractor.seed_topology();

        assert_eq!(seed.entities.len(), 5);
        assert_eq!(
            labels_of(&seed),
            vec!["T1-PART_OF->A1", "T1-HAS_ALARM->T1:alarm", "T2-PART_OF->Feed Pump"]
        );
    }
}
