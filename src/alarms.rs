// File: src/alarms.rs
// Threshold alarm engine with hysteresis
//
// Each tag with an enabled rule runs a NORMAL / HIGH / LOW state machine.
// Only state changes produce events, and every new state is written to the
// state store before its events leave the engine.

use crate::config::AlarmSettings;
use crate::error::{PipelineError, Result};
use crate::normalizer::Reading;
use crate::registry::TagRegistry;
use crate::value::{DataType, Quality, Value};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

// ==========================================
// SECTION 1: ALARM RULES
// ==========================================

/// Alarm priority, most severe first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum AlarmPriority {
    /// Immediate operator action required
    Critical = 1,
    /// Prompt operator action required
    High = 2,
    /// Operator action required
    Medium = 3,
    /// Operator awareness required
    Low = 4,
}

impl AlarmPriority {
    /// Whether this priority is at least as severe as `other`
    pub fn at_least(&self, other: AlarmPriority) -> bool {
        *self <= other
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlarmPriority::Critical => "critical",
            AlarmPriority::High => "high",
            AlarmPriority::Medium => "medium",
            AlarmPriority::Low => "low",
        }
    }
}

impl Default for AlarmPriority {
    fn default() -> Self {
        AlarmPriority::Medium
    }
}

/// Threshold rule for one tag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmRule {
    pub tag: String,

    #[serde(default)]
    pub high: Option<f64>,

    #[serde(default)]
    pub low: Option<f64>,

    /// Margin a value must move back past a threshold before it clears
    #[serde(default)]
    pub hysteresis: f64,

    #[serde(default)]
    pub priority: AlarmPriority,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub description: Option<String>,
}

fn default_enabled() -> bool { true }

impl AlarmRule {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            high: None,
            low: None,
            hysteresis: 0.0,
            priority: AlarmPriority::default(),
            enabled: true,
            description: None,
        }
    }

    pub fn with_high(mut self, high: f64) -> Self {
        self.high = Some(high);
        self
    }

    pub fn with_low(mut self, low: f64) -> Self {
        self.low = Some(low);
        self
    }

    pub fn with_hysteresis(mut self, hysteresis: f64) -> Self {
        self.hysteresis = hysteresis;
        self
    }

    pub fn with_priority(mut self, priority: AlarmPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Check the rule against the registry.
    pub fn validate(&self, registry: &TagRegistry) -> Result<()> {
        let misconfigured = |msg: String| Err(PipelineError::RuleMisconfiguration(msg));

        let Some(def) = registry.get(&self.tag) else {
            return misconfigured(format!("alarm rule references unknown tag '{}'", self.tag));
        };
        if def.data_type != DataType::Numeric {
            return misconfigured(format!(
                "alarm rule for '{}' requires a numeric tag, found {}",
                self.tag, def.data_type
            ));
        }
        if self.high.is_none() && self.low.is_none() {
            return misconfigured(format!("alarm rule for '{}' has no threshold", self.tag));
        }
        if !self.hysteresis.is_finite() || self.hysteresis < 0.0 {
            return misconfigured(format!(
                "alarm rule for '{}' has invalid hysteresis {}",
                self.tag, self.hysteresis
            ));
        }
        if self.high.into_iter().chain(self.low).any(|t| !t.is_finite()) {
            return misconfigured(format!("alarm rule for '{}' has a non-finite threshold", self.tag));
        }
        if let (Some(high), Some(low)) = (self.high, self.low) {
            if low >= high {
                return misconfigured(format!(
                    "alarm rule for '{}' has low {} >= high {}",
                    self.tag, low, high
                ));
            }
        }
        Ok(())
    }

    /// Next state for `value`, with the transitions taken to reach it.
    ///
    /// A single reading can clear one side and enter the other; both
    /// transitions are returned in that order.
    pub fn next_state(&self, state: AlarmState, value: f64) -> (AlarmState, Vec<TransitionKind>) {
        use AlarmState::*;
        use TransitionKind::*;

        let breaches_high = self.high.map_or(false, |h| value >= h);
        let breaches_low = self.low.map_or(false, |l| value <= l);

        match state {
            Normal if breaches_high => (High, vec![EnterHigh]),
            Normal if breaches_low => (Low, vec![EnterLow]),
            Normal => (Normal, vec![]),

            High => {
                let clears = self.high.map_or(true, |h| value <= h - self.hysteresis);
                match (clears, breaches_low) {
                    (false, _) => (High, vec![]),
                    (true, true) => (Low, vec![ClearHigh, EnterLow]),
                    (true, false) => (Normal, vec![ClearHigh]),
                }
            }

            Low => {
                let clears = self.low.map_or(true, |l| value >= l + self.hysteresis);
                match (clears, breaches_high) {
                    (false, _) => (Low, vec![]),
                    (true, true) => (High, vec![ClearLow, EnterHigh]),
                    (true, false) => (Normal, vec![ClearLow]),
                }
            }
        }
    }

    fn threshold_for(&self, kind: TransitionKind) -> Option<f64> {
        match kind {
            TransitionKind::EnterHigh | TransitionKind::ClearHigh => self.high,
            TransitionKind::EnterLow | TransitionKind::ClearLow => self.low,
        }
    }
}

/// Rules keyed by tag
#[derive(Debug, Clone, Default)]
pub struct AlarmRuleSet {
    rules: HashMap<String, AlarmRule>,
}

impl AlarmRuleSet {
    /// Build from rules, skipping misconfigured ones with a warning.
    pub fn from_rules(rules: impl IntoIterator<Item = AlarmRule>, registry: &TagRegistry) -> Self {
        let mut set = AlarmRuleSet::default();
        for rule in rules {
            if let Err(e) = rule.validate(registry) {
                warn!("Skipping alarm rule: {}", e);
                continue;
            }
            if set.rules.contains_key(&rule.tag) {
                warn!("Skipping duplicate alarm rule for '{}'", rule.tag);
                continue;
            }
            set.rules.insert(rule.tag.clone(), rule);
        }
        set
    }

    /// Load a YAML list of rules. An unreadable or unparseable file is fatal.
    pub fn from_yaml_path(path: impl AsRef<Path>, registry: &TagRegistry) -> Result<Self> {
        let path = path.as_ref();
        let name = path.display().to_string();
        let text = std::fs::read_to_string(path).map_err(|e| PipelineError::fatal(&name, e))?;
        let set = Self::from_yaml(&text, registry).map_err(|e| PipelineError::fatal(&name, e))?;
        info!("Loaded {} alarm rules from {}", set.len(), name);
        Ok(set)
    }

    pub fn from_yaml(text: &str, registry: &TagRegistry) -> Result<Self> {
        let rules: Vec<AlarmRule> = if text.trim().is_empty() {
            Vec::new()
        } else {
            serde_yaml::from_str(text)?
        };
        Ok(Self::from_rules(rules, registry))
    }

    pub fn get(&self, tag: &str) -> Option<&AlarmRule> {
        self.rules.get(tag)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AlarmRule> {
        self.rules.values()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

// ==========================================
// SECTION 2: STATES AND EVENTS
// ==========================================

/// Per-tag alarm state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlarmState {
    #[default]
    Normal = 0,
    High = 1,
    Low = 2,
}

impl AlarmState {
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(AlarmState::Normal),
            1 => Some(AlarmState::High),
            2 => Some(AlarmState::Low),
            _ => None,
        }
    }
}

/// Kind of state transition carried by an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransitionKind {
    EnterHigh,
    ClearHigh,
    EnterLow,
    ClearLow,
}

impl TransitionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionKind::EnterHigh => "enter-high",
            TransitionKind::ClearHigh => "clear-high",
            TransitionKind::EnterLow => "enter-low",
            TransitionKind::ClearLow => "clear-low",
        }
    }

    pub fn is_entering(&self) -> bool {
        matches!(self, TransitionKind::EnterHigh | TransitionKind::EnterLow)
    }

    fn side(&self) -> &'static str {
        match self {
            TransitionKind::EnterHigh | TransitionKind::ClearHigh => "HIGH",
            TransitionKind::EnterLow | TransitionKind::ClearLow => "LOW",
        }
    }
}

impl fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Alarm transition event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub tag: String,
    pub asset: String,
    pub kind: TransitionKind,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub threshold: Option<f64>,
    pub priority: AlarmPriority,
    pub quality: Quality,
    pub description: String,
}

impl Event {
    /// Natural key `"{tag}:{kind}:{timestamp_ms}"`
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.tag, self.kind, self.timestamp.timestamp_millis())
    }
}

/// Natural key of the alarm entity belonging to a tag
pub fn alarm_key(tag: &str) -> String {
    format!("{}:alarm", tag)
}

// ==========================================
// SECTION 3: STATE PERSISTENCE
// ==========================================

/// Persisted state of one tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    pub state: AlarmState,
    /// Last evaluated timestamp
    pub timestamp: DateTime<Utc>,
}

/// Durable per-shard alarm state
pub trait StateStore: Send {
    /// Restore the latest state of every tag.
    fn load(&mut self) -> Result<HashMap<String, PersistedState>>;

    /// Durably record a state change. Must complete before the change's
    /// events are emitted.
    fn persist(&mut self, tag: &str, state: PersistedState) -> Result<()>;

    /// Replace the log with a snapshot of `states`.
    fn checkpoint(&mut self, _states: &HashMap<String, PersistedState>) -> Result<()> {
        Ok(())
    }
}

/// Process-local state store. Clones share the same map, which lets tests
/// simulate a restart by building a second engine over a clone.
#[derive(Debug, Clone, Default)]
pub struct MemoryStateStore {
    states: Arc<DashMap<String, PersistedState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, tag: &str) -> Option<PersistedState> {
        self.states.get(tag).map(|s| *s)
    }
}

impl StateStore for MemoryStateStore {
    fn load(&mut self) -> Result<HashMap<String, PersistedState>> {
        Ok(self
            .states
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect())
    }

    fn persist(&mut self, tag: &str, state: PersistedState) -> Result<()> {
        self.states.insert(tag.to_string(), state);
        Ok(())
    }
}

// ==========================================
// SECTION 4: ALARM ENGINE
// ==========================================

/// Outcome counts of evaluating a run of readings
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    pub events: Vec<Event>,
    pub evaluated: usize,
    pub out_of_order: usize,
    /// Readings on alarmed tags that were not evaluated (bad quality, degraded
    /// quality when disabled, non-numeric values)
    pub skipped: usize,
}

/// Single-owner alarm evaluator for a set of tags
pub struct AlarmEngine {
    rules: Arc<AlarmRuleSet>,
    registry: Arc<TagRegistry>,
    states: HashMap<String, PersistedState>,
    store: Box<dyn StateStore>,
    evaluate_degraded: bool,
    checkpoint_every: usize,
    since_checkpoint: usize,
}

impl AlarmEngine {
    /// Create an engine, restoring state from `store`.
    pub fn new(
        rules: Arc<AlarmRuleSet>,
        registry: Arc<TagRegistry>,
        mut store: Box<dyn StateStore>,
        settings: &AlarmSettings,
    ) -> Result<Self> {
        let states = store.load()?;
        if !states.is_empty() {
            info!("Restored alarm state for {} tags", states.len());
        }
        Ok(Self {
            rules,
            registry,
            states,
            store,
            evaluate_degraded: settings.evaluate_degraded,
            checkpoint_every: settings.checkpoint_every.max(1),
            since_checkpoint: 0,
        })
    }

    /// Current state of a tag
    pub fn state(&self, tag: &str) -> AlarmState {
        self.states.get(tag).map(|s| s.state).unwrap_or_default()
    }

    /// Last evaluated timestamp of a tag
    pub fn last_timestamp(&self, tag: &str) -> Option<DateTime<Utc>> {
        self.states.get(tag).map(|s| s.timestamp)
    }

    /// Evaluate readings in order. Out-of-order readings are counted, not
    /// fatal; a state store failure aborts the run.
    pub fn evaluate_all<'a>(&mut self, readings: impl IntoIterator<Item = &'a Reading>) -> Result<Evaluation> {
        let mut evaluation = Evaluation::default();
        for reading in readings {
            match self.evaluate(reading) {
                Ok(Some(events)) => {
                    evaluation.evaluated += 1;
                    evaluation.events.extend(events);
                }
                Ok(None) => {
                    if self.rules.get(&reading.tag).map_or(false, |r| r.enabled) {
                        evaluation.skipped += 1;
                    }
                }
                Err(PipelineError::OutOfOrder { tag, timestamp, last }) => {
                    debug!("Out-of-order reading for {}: {} <= {}", tag, timestamp, last);
                    evaluation.out_of_order += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(evaluation)
    }

    /// Evaluate one reading. `Ok(None)` means the reading was not evaluated.
    pub fn evaluate(&mut self, reading: &Reading) -> Result<Option<Vec<Event>>> {
        let Some(rule) = self.rules.get(&reading.tag).filter(|r| r.enabled) else {
            return Ok(None);
        };
        let Value::Float(value) = reading.value else {
            return Ok(None);
        };

        let current = self.states.get(&reading.tag).copied();
        if let Some(last) = current {
            if reading.timestamp <= last.timestamp {
                return Err(PipelineError::OutOfOrder {
                    tag: reading.tag.clone(),
                    timestamp: reading.timestamp,
                    last: last.timestamp,
                });
            }
        }

        match reading.quality {
            Quality::Bad => return Ok(None),
            Quality::Uncertain | Quality::OutOfRange if !self.evaluate_degraded => return Ok(None),
            _ => {}
        }

        let state = current.map(|s| s.state).unwrap_or_default();
        let (next, transitions) = rule.next_state(state, value);
        let persisted = PersistedState { state: next, timestamp: reading.timestamp };

        if next != state {
            self.store.persist(&reading.tag, persisted)?;
            self.since_checkpoint += 1;
        }
        self.states.insert(reading.tag.clone(), persisted);

        if self.since_checkpoint >= self.checkpoint_every {
            self.store.checkpoint(&self.states)?;
            self.since_checkpoint = 0;
        }

        trace!("{} = {} ({:?} -> {:?})", reading.tag, value, state, next);

        Ok(Some(
            transitions
                .into_iter()
                .map(|kind| self.build_event(&rule, reading, value, kind))
                .collect(),
        ))
    }

    fn build_event(&self, rule: &AlarmRule, reading: &Reading, value: f64, kind: TransitionKind) -> Event {
        let (asset, unit) = self
            .registry
            .get(&reading.tag)
            .map(|d| (d.asset.clone(), d.unit.clone()))
            .unwrap_or_default();
        let threshold = rule.threshold_for(kind);

        let verb = if kind.is_entering() { "crossed" } else { "returned within" };
        let mut description = format!("{} = {}", reading.tag, value);
        if !unit.is_empty() {
            description.push(' ');
            description.push_str(&unit);
        }
        description.push_str(&format!(" {} {} threshold", verb, kind.side()));
        if let Some(t) = threshold {
            description.push_str(&format!(" ({})", t));
        }
        if let Some(prefix) = rule.description.as_deref().filter(|d| !d.is_empty()) {
            description = format!("{}: {}", prefix, description);
        }

        debug!("Alarm event {} on {} at {}", kind, reading.tag, reading.timestamp);

        Event {
            tag: reading.tag.clone(),
            asset,
            kind,
            timestamp: reading.timestamp,
            value,
            threshold,
            priority: rule.priority,
            quality: reading.quality,
            description,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::RecordOrigin;
    use crate::registry::TagDefinition;

    fn registry() -> Arc<TagRegistry> {
        Arc::new(
            TagRegistry::from_definitions(vec![
                TagDefinition::new("T1", DataType::Numeric, "A1").with_unit("bar"),
                TagDefinition::new("T2", DataType::Numeric, "A1"),
                TagDefinition::new("V1", DataType::Boolean, "A1"),
            ])
            .unwrap(),
        )
    }

    fn engine_with(rules: Vec<AlarmRule>, store: MemoryStateStore) -> AlarmEngine {
        let registry = registry();
        let rules = Arc::new(AlarmRuleSet::from_rules(rules, &registry));
        AlarmEngine::new(rules, registry, Box::new(store), &AlarmSettings::default()).unwrap()
    }

    fn reading(tag: &str, secs: i64, value: f64) -> Reading {
        Reading {
            tag: tag.into(),
            timestamp: DateTime::<Utc>::from_timestamp(secs, 0).unwrap(),
            value: Value::Float(value),
            quality: Quality::Good,
            schema_version: "1.1".into(),
            origin: RecordOrigin::new("test", secs as usize),
        }
    }

    fn high_rule() -> AlarmRule {
        AlarmRule::new("T1").with_high(100.0).with_hysteresis(5.0)
    }

    #[test]
    fn test_hysteresis_sequence() {
        let mut engine = engine_with(vec![high_rule()], MemoryStateStore::new());
        let readings: Vec<_> = [90.0, 101.0, 99.0, 94.0]
            .iter()
            .enumerate()
            .map(|(i, v)| reading("T1", i as i64, *v))
            .collect();

        let evaluation = engine.evaluate_all(&readings).unwrap();
        let kinds: Vec<_> = evaluation.events.iter().map(|e| (e.kind, e.value)).collect();
        assert_eq!(
            kinds,
            vec![(TransitionKind::EnterHigh, 101.0), (TransitionKind::ClearHigh, 94.0)]
        );
        assert_eq!(evaluation.evaluated, 4);
        assert_eq!(engine.state("T1"), AlarmState::Normal);
    }

    #[test]
    fn test_repeated_breach_is_silent() {
        let mut engine = engine_with(vec![high_rule()], MemoryStateStore::new());
        let readings = vec![reading("T1", 0, 101.0), reading("T1", 1, 150.0), reading("T1", 2, 100.0)];
        let evaluation = engine.evaluate_all(&readings).unwrap();
        assert_eq!(evaluation.events.len(), 1);
    }

    #[test]
    fn test_low_side_and_direct_jump() {
        let rule = AlarmRule::new("T1").with_high(100.0).with_low(10.0).with_hysteresis(2.0);
        let mut engine = engine_with(vec![rule], MemoryStateStore::new());
        let readings = vec![reading("T1", 0, 5.0), reading("T1", 1, 12.5), reading("T1", 2, 120.0)];
        let evaluation = engine.evaluate_all(&readings).unwrap();
        let kinds: Vec<_> = evaluation.events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![TransitionKind::EnterLow, TransitionKind::ClearLow, TransitionKind::EnterHigh]
        );
        assert_eq!(evaluation.events[2].timestamp.timestamp(), 2);

        let mut engine = engine_with(
            vec![AlarmRule::new("T2").with_high(100.0).with_low(10.0)],
            MemoryStateStore::new(),
        );
        let evaluation = engine
            .evaluate_all(&[reading("T2", 0, 150.0), reading("T2", 1, 0.0)])
            .unwrap();
        let kinds: Vec<_> = evaluation.events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![TransitionKind::EnterHigh, TransitionKind::ClearHigh, TransitionKind::EnterLow]
        );
        assert_eq!(evaluation.events[1].timestamp, evaluation.events[2].timestamp);
    }

    #[test]
    fn test_out_of_order_refused() {
        let mut engine = engine_with(vec![high_rule()], MemoryStateStore::new());
        let evaluation = engine
            .evaluate_all(&[reading("T1", 5, 101.0), reading("T1", 5, 50.0), reading("T1", 3, 50.0)])
            .unwrap();
        assert_eq!(evaluation.events.len(), 1);
        assert_eq!(evaluation.out_of_order, 2);
        assert_eq!(engine.state("T1"), AlarmState::High);
    }

    #[test]
    fn test_state_restored_and_replay_silent() {
        let store = MemoryStateStore::new();
        let readings = vec![reading("T1", 0, 90.0), reading("T1", 1, 105.0)];

        let mut engine = engine_with(vec![high_rule()], store.clone());
        assert_eq!(engine.evaluate_all(&readings).unwrap().events.len(), 1);
        assert_eq!(store.get("T1").unwrap().state, AlarmState::High);

        let mut restarted = engine_with(vec![high_rule()], store.clone());
        assert_eq!(restarted.state("T1"), AlarmState::High);
        let replay = restarted.evaluate_all(&readings).unwrap();
        assert!(replay.events.is_empty());
        assert_eq!(replay.out_of_order, 2);

        let clear = restarted.evaluate_all(&[reading("T1", 2, 90.0)]).unwrap();
        assert_eq!(clear.events[0].kind, TransitionKind::ClearHigh);
    }

    #[test]
    fn test_quality_policy() {
        let mut engine = engine_with(vec![high_rule()], MemoryStateStore::new());
        let mut bad = reading("T1", 0, 200.0);
        bad.quality = Quality::Bad;
        let mut degraded = reading("T1", 1, 200.0);
        degraded.quality = Quality::OutOfRange;

        let evaluation = engine.evaluate_all(&[bad, degraded]).unwrap();
        assert_eq!(evaluation.skipped, 1);
        assert_eq!(evaluation.events.len(), 1);
        assert_eq!(evaluation.events[0].quality, Quality::OutOfRange);

        let registry = registry();
        let rules = Arc::new(AlarmRuleSet::from_rules(vec![high_rule()], &registry));
        let settings = AlarmSettings { evaluate_degraded: false, ..AlarmSettings::default() };
        let mut strict =
            AlarmEngine::new(rules, registry, Box::new(MemoryStateStore::new()), &settings).unwrap();
        let mut degraded = reading("T1", 1, 200.0);
        degraded.quality = Quality::Uncertain;
        assert!(strict.evaluate_all(&[degraded]).unwrap().events.is_empty());
    }

    #[test]
    fn test_disabled_and_unruled_tags_pass_through() {
        let mut disabled = high_rule();
        disabled.enabled = false;
        let mut engine = engine_with(vec![disabled], MemoryStateStore::new());
        let evaluation = engine
            .evaluate_all(&[reading("T1", 0, 500.0), reading("T2", 0, 500.0)])
            .unwrap();
        assert_eq!(evaluation, Evaluation::default());
    }

    #[test]
    fn test_event_description_and_key() {
        let mut rule = high_rule().with_priority(AlarmPriority::Critical);
        rule.description = Some("Discharge pressure".into());
        let mut engine = engine_with(vec![rule], MemoryStateStore::new());
        let events = engine.evaluate(&reading("T1", 1, 101.0)).unwrap().unwrap();

        assert_eq!(events[0].key(), "T1:enter-high:1000");
        assert_eq!(events[0].asset, "A1");
        assert_eq!(events[0].priority, AlarmPriority::Critical);
        assert_eq!(
            events[0].description,
            "Discharge pressure: T1 = 101 bar crossed HIGH threshold (100)"
        );
    }

    #[test]
    fn test_misconfigured_rules_skipped() {
        let yaml = r#"
- tag: T1
  high: 100
  hysteresis: 5
  priority: high
- tag: MISSING
  high: 1
- tag: V1
  high: 1
- tag: T2
  hysteresis: 1
- tag: T2
  low: 5
  high: 4
"#;
        let set = AlarmRuleSet::from_yaml(yaml, &registry()).unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.get("T1").unwrap().priority, AlarmPriority::High);
        assert!(AlarmRuleSet::from_yaml("- tag: [", &registry()).is_err());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(AlarmPriority::Critical.at_least(AlarmPriority::High));
        assert!(AlarmPriority::High.at_least(AlarmPriority::High));
        assert!(!AlarmPriority::Low.at_least(AlarmPriority::Medium));
    }
}
