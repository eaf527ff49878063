//! Master tag registry.
//!
//! Loaded once at startup from a CSV file and shared read-only by every
//! pipeline stage. Any problem with the file aborts startup.

use crate::error::{PipelineError, Result};
use crate::value::DataType;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Static definition of one plant tag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagDefinition {
    pub id: String,
    pub data_type: DataType,
    #[serde(default)]
    pub unit: String,
    pub asset: String,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub description: Option<String>,
}

impl TagDefinition {
    pub fn new(id: impl Into<String>, data_type: DataType, asset: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            data_type,
            unit: String::new(),
            asset: asset.into(),
            min: None,
            max: None,
            description: None,
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    pub fn with_range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Whether `value` lies inside the valid range (bounds inclusive)
    pub fn in_range(&self, value: f64) -> bool {
        self.min.map_or(true, |min| value >= min) && self.max.map_or(true, |max| value <= max)
    }
}

/// Raw CSV row; blank optional cells become `None`
#[derive(Debug, Deserialize)]
struct RegistryRow {
    tag: String,
    data_type: String,
    #[serde(default)]
    unit: Option<String>,
    asset: String,
    #[serde(default)]
    min: Option<f64>,
    #[serde(default)]
    max: Option<f64>,
    #[serde(default)]
    description: Option<String>,
}

/// Immutable tag id -> definition map
#[derive(Debug, Clone, Default)]
pub struct TagRegistry {
    tags: HashMap<String, Arc<TagDefinition>>,
    /// Lowercased tag ids, for mention resolution
    tags_folded: HashMap<String, String>,
    /// Lowercased asset id -> canonical asset id
    assets: BTreeMap<String, String>,
}

impl TagRegistry {
    /// Load the registry CSV (`tag,data_type,unit,asset[,min,max,description]`).
    pub fn from_csv_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let name = path.display().to_string();
        let file = std::fs::File::open(path).map_err(|e| PipelineError::fatal(&name, e))?;
        let registry = Self::from_csv_reader(file).map_err(|e| match e {
            PipelineError::FatalConfig { reason, .. } => PipelineError::fatal(&name, reason),
            other => PipelineError::fatal(&name, other),
        })?;
        info!("Loaded {} tags on {} assets from {}", registry.len(), registry.assets.len(), name);
        Ok(registry)
    }

    pub fn from_csv_reader<R: std::io::Read>(reader: R) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(reader);

        let mut definitions = Vec::new();
        for (line, row) in rdr.deserialize::<RegistryRow>().enumerate() {
            let row = row.map_err(|e| PipelineError::fatal("registry", e))?;
            let data_type = DataType::parse(&row.data_type).ok_or_else(|| {
                PipelineError::fatal(
                    "registry",
                    format!("row {}: unknown data type '{}'", line + 1, row.data_type),
                )
            })?;
            definitions.push(TagDefinition {
                id: row.tag,
                data_type,
                unit: row.unit.unwrap_or_default(),
                asset: row.asset,
                min: row.min,
                max: row.max,
                description: row.description.filter(|d| !d.is_empty()),
            });
        }
        Self::from_definitions(definitions)
    }

    /// Build a registry from definitions, rejecting duplicates and bad ranges.
    pub fn from_definitions(definitions: impl IntoIterator<Item = TagDefinition>) -> Result<Self> {
        let mut registry = TagRegistry::default();
        for def in definitions {
            if def.id.is_empty() {
                return Err(PipelineError::fatal("registry", "empty tag id"));
            }
            if def.asset.is_empty() {
                return Err(PipelineError::fatal(
                    "registry",
                    format!("tag '{}' has no asset", def.id),
                ));
            }
            if let (Some(min), Some(max)) = (def.min, def.max) {
                if min > max {
                    return Err(PipelineError::fatal(
                        "registry",
                        format!("tag '{}' has min {} > max {}", def.id, min, max),
                    ));
                }
            }
            if registry.tags.contains_key(&def.id) {
                return Err(PipelineError::fatal(
                    "registry",
                    format!("duplicate tag '{}'", def.id),
                ));
            }

            debug!("Registered tag {} ({}) on {}", def.id, def.data_type, def.asset);
            registry.tags_folded.insert(def.id.to_lowercase(), def.id.clone());
            registry
                .assets
                .entry(def.asset.to_lowercase())
                .or_insert_with(|| def.asset.clone());
            registry.tags.insert(def.id.clone(), Arc::new(def));
        }
        Ok(registry)
    }

    pub fn get(&self, tag: &str) -> Option<&Arc<TagDefinition>> {
        self.tags.get(tag)
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.tags.contains_key(tag)
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Definitions sorted by tag id
    pub fn definitions(&self) -> Vec<&Arc<TagDefinition>> {
        let mut defs: Vec<_> = self.tags.values().collect();
        defs.sort_by(|a, b| a.id.cmp(&b.id));
        defs
    }

    /// Asset ids, sorted
    pub fn assets(&self) -> impl Iterator<Item = &str> {
        let mut assets: Vec<&str> = self.assets.values().map(String::as_str).collect();
        assets.sort_unstable();
        assets.into_iter()
    }

    /// Case-insensitive asset lookup returning the canonical id
    pub fn resolve_asset(&self, name: &str) -> Option<&str> {
        self.assets.get(&name.to_lowercase()).map(String::as_str)
    }

    /// Case-insensitive tag lookup returning the canonical id
    pub fn resolve_tag(&self, name: &str) -> Option<&str> {
        self.tags_folded.get(&name.to_lowercase()).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTRY: &str = "\
tag,data_type,unit,asset,min,max,description
TI-101,numeric,degC,Reactor-1,0,400,Reactor inlet temperature
XV-7,boolean,,Reactor-1,,,
FIC-200,float,m3/h,Pump-3,,,
";

    #[test]
    fn test_load_registry_csv() {
        let registry = TagRegistry::from_csv_reader(REGISTRY.as_bytes()).unwrap();
        assert_eq!(registry.len(), 3);

        let ti = registry.get("TI-101").unwrap();
        assert_eq!(ti.data_type, DataType::Numeric);
        assert_eq!(ti.unit, "degC");
        assert_eq!(ti.max, Some(400.0));
        assert_eq!(ti.description.as_deref(), Some("Reactor inlet temperature"));

        let xv = registry.get("XV-7").unwrap();
        assert_eq!(xv.data_type, DataType::Boolean);
        assert_eq!(xv.min, None);
        assert_eq!(xv.description, None);

        assert_eq!(registry.assets().collect::<Vec<_>>(), vec!["Pump-3", "Reactor-1"]);
    }

    #[test]
    fn test_duplicate_tag_is_fatal() {
        let csv = "tag,data_type,unit,asset\nT1,numeric,,A1\nT1,numeric,,A2\n";
        let err = TagRegistry::from_csv_reader(csv.as_bytes()).unwrap_err();
        assert!(matches!(err, PipelineError::FatalConfig { .. }));
    }

    #[test]
    fn test_unknown_data_type_is_fatal() {
        let csv = "tag,data_type,unit,asset\nT1,complex,,A1\n";
        assert!(TagRegistry::from_csv_reader(csv.as_bytes()).is_err());
    }

    #[test]
    fn test_missing_file_is_fatal() {
        let err = TagRegistry::from_csv_path("/nonexistent/tags.csv").unwrap_err();
        assert!(matches!(err, PipelineError::FatalConfig { .. }));
    }

    #[test]
    fn test_case_insensitive_resolution() {
        let registry = TagRegistry::from_csv_reader(REGISTRY.as_bytes()).unwrap();
        assert_eq!(registry.resolve_asset("reactor-1"), Some("Reactor-1"));
        assert_eq!(registry.resolve_tag("fic-200"), Some("FIC-200"));
        assert_eq!(registry.resolve_asset("Boiler"), None);
    }

    #[test]
    fn test_range_check() {
        let def = TagDefinition::new("T", DataType::Numeric, "A").with_range(Some(0.0), Some(10.0));
        assert!(def.in_range(0.0));
        assert!(def.in_range(10.0));
        assert!(!def.in_range(10.5));
        assert!(TagDefinition::new("T", DataType::Numeric, "A").in_range(f64::MAX));
    }
}
