//! Type coercion and timestamp canonicalization.

use crate::config::{EpochUnit, PipelineSettings, TimestampResolution};
use crate::error::{PipelineError, Result};
use crate::reader::{RawReading, RecordOrigin, RejectReason, Rejection};
use crate::registry::{TagDefinition, TagRegistry};
use crate::value::{parse_bool, DataType, Quality, Value};
use chrono::{DateTime, FixedOffset, NaiveDateTime, Offset, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::{debug, trace};

const NAIVE_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// Validated, typed reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub tag: String,
    pub timestamp: DateTime<Utc>,
    pub value: Value,
    pub quality: Quality,
    pub schema_version: String,
    pub origin: RecordOrigin,
}

impl Reading {
    /// Approximate serialized size, for byte-bounded chunking
    pub fn approx_size(&self) -> usize {
        self.tag.len() + 8 + self.value.approx_size() + self.schema_version.len() + self.origin.source.len() + 16
    }
}

/// Normalizer settings extracted from the pipeline configuration
#[derive(Debug, Clone)]
pub struct NormalizerSettings {
    pub schema_version: String,
    pub resolution: TimestampResolution,
    pub epoch_unit: EpochUnit,
    pub source_offset: FixedOffset,
}

impl Default for NormalizerSettings {
    fn default() -> Self {
        Self::from(&PipelineSettings::default())
    }
}

impl From<&PipelineSettings> for NormalizerSettings {
    fn from(settings: &PipelineSettings) -> Self {
        Self {
            schema_version: settings.schema_version.clone(),
            resolution: settings.resolution,
            epoch_unit: settings.epoch_unit,
            // validated to lie within one day
            source_offset: FixedOffset::east_opt(settings.source_utc_offset_secs)
                .unwrap_or_else(|| Utc.fix()),
        }
    }
}

/// Pure, per-record normalizer
#[derive(Clone)]
pub struct Normalizer {
    registry: Arc<TagRegistry>,
    settings: NormalizerSettings,
}

impl Normalizer {
    pub fn new(registry: Arc<TagRegistry>, settings: NormalizerSettings) -> Self {
        Self { registry, settings }
    }

    pub fn settings(&self) -> &NormalizerSettings {
        &self.settings
    }

    /// Normalize a batch, keeping input order. Failed records become
    /// rejections and never stop the batch.
    pub fn normalize_batch(&self, raws: Vec<RawReading>) -> (Vec<Reading>, Vec<Rejection>) {
        let mut readings = Vec::with_capacity(raws.len());
        let mut rejections = Vec::new();
        for raw in raws {
            match self.normalize(raw) {
                Ok(reading) => readings.push(reading),
                Err(rejection) => rejections.push(rejection),
            }
        }
        (readings, rejections)
    }

    pub fn normalize(&self, raw: RawReading) -> std::result::Result<Reading, Rejection> {
        let reject = |raw: &RawReading, reason: RejectReason, err: PipelineError| {
            debug!("Rejected {} at {}: {}", raw.tag, raw.origin, err);
            Rejection::new(raw.origin.clone(), reason, err.to_string())
                .with_tag(&raw.tag)
                .with_payload(serde_json::json!({
                    "tag": raw.tag,
                    "timestamp": raw.timestamp,
                    "value": raw.value,
                    "quality": raw.quality,
                }))
        };

        let Some(def) = self.registry.get(&raw.tag) else {
            let err = PipelineError::UnknownTag(raw.tag.clone());
            return Err(reject(&raw, RejectReason::UnknownTag, err));
        };

        let timestamp = match self.canonical_timestamp(&raw.tag, &raw.timestamp) {
            Ok(ts) => ts,
            Err(e) => return Err(reject(&raw, RejectReason::TypeMismatch, e)),
        };
        let value = match coerce_value(def, &raw.value) {
            Ok(v) => v,
            Err(e) => return Err(reject(&raw, RejectReason::TypeMismatch, e)),
        };

        let mut quality = match raw.quality.as_deref() {
            None => Quality::Good,
            Some(q) => Quality::parse(q).unwrap_or_else(|| {
                trace!("Unrecognized quality '{}' for {}, using uncertain", q, raw.tag);
                Quality::Uncertain
            }),
        };
        if let Value::Float(v) = value {
            if !def.in_range(v) && !quality.is_bad() {
                quality = Quality::OutOfRange;
            }
        }

        Ok(Reading {
            tag: raw.tag,
            timestamp,
            value,
            quality,
            schema_version: self.settings.schema_version.clone(),
            origin: raw.origin,
        })
    }

    /// Canonical UTC timestamp at the configured resolution
    pub fn canonical_timestamp(&self, tag: &str, raw: &JsonValue) -> Result<DateTime<Utc>> {
        let mismatch = || PipelineError::TypeMismatch {
            tag: tag.to_string(),
            expected: "timestamp",
            actual: raw.to_string(),
        };

        let parsed = match raw {
            JsonValue::Number(n) => n.as_f64().and_then(|v| self.from_epoch(v)),
            JsonValue::String(s) => self.parse_timestamp_str(s.trim()),
            _ => None,
        }
        .ok_or_else(mismatch)?;

        truncate(parsed, self.settings.resolution).ok_or_else(mismatch)
    }

    fn parse_timestamp_str(&self, s: &str) -> Option<DateTime<Utc>> {
        if s.is_empty() {
            return None;
        }
        if let Ok(epoch) = s.parse::<f64>() {
            return self.from_epoch(epoch);
        }
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Some(dt.with_timezone(&Utc));
        }
        NAIVE_FORMATS.iter().find_map(|fmt| {
            let naive = NaiveDateTime::parse_from_str(s, fmt).ok()?;
            let local = self.settings.source_offset.from_local_datetime(&naive).single()?;
            Some(local.with_timezone(&Utc))
        })
    }

    fn from_epoch(&self, epoch: f64) -> Option<DateTime<Utc>> {
        if !epoch.is_finite() {
            return None;
        }
        let micros = match self.settings.epoch_unit {
            EpochUnit::Seconds => epoch * 1e6,
            EpochUnit::Milliseconds => epoch * 1e3,
            EpochUnit::Microseconds => epoch,
        }
        .round();
        if micros.abs() > i64::MAX as f64 {
            return None;
        }
        DateTime::<Utc>::from_timestamp_micros(micros as i64)
    }
}

fn truncate(ts: DateTime<Utc>, resolution: TimestampResolution) -> Option<DateTime<Utc>> {
    match resolution {
        TimestampResolution::Seconds => DateTime::<Utc>::from_timestamp(ts.timestamp(), 0),
        TimestampResolution::Milliseconds => DateTime::<Utc>::from_timestamp_millis(ts.timestamp_millis()),
        TimestampResolution::Microseconds => DateTime::<Utc>::from_timestamp_micros(ts.timestamp_micros()),
    }
}

/// Coerce a raw value to the tag's declared type.
pub fn coerce_value(def: &TagDefinition, raw: &JsonValue) -> Result<Value> {
    let mismatch = || PipelineError::TypeMismatch {
        tag: def.id.clone(),
        expected: def.data_type.name(),
        actual: raw.to_string(),
    };

    match def.data_type {
        DataType::Numeric => {
            let v = match raw {
                JsonValue::Number(n) => n.as_f64(),
                JsonValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
                JsonValue::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            };
            v.filter(|v| v.is_finite()).map(Value::Float).ok_or_else(mismatch)
        }
        DataType::Boolean => {
            let b = match raw {
                JsonValue::Bool(b) => Some(*b),
                JsonValue::Number(n) => match n.as_f64() {
                    Some(v) if v == 0.0 => Some(false),
                    Some(v) if v == 1.0 => Some(true),
                    _ => None,
                },
                JsonValue::String(s) => parse_bool(s),
                _ => None,
            };
            b.map(Value::Bool).ok_or_else(mismatch)
        }
        DataType::String => match raw {
            JsonValue::Null => Err(mismatch()),
            JsonValue::String(s) => Ok(Value::String(s.clone())),
            other => Ok(Value::String(other.to_string())),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn normalizer(settings: NormalizerSettings) -> Normalizer {
        let registry = TagRegistry::from_definitions(vec![
            TagDefinition::new("T1", DataType::Numeric, "A1").with_range(Some(0.0), Some(100.0)),
            TagDefinition::new("V1", DataType::Boolean, "A1"),
            TagDefinition::new("S1", DataType::String, "A1"),
        ])
        .unwrap();
        Normalizer::new(Arc::new(registry), settings)
    }

    fn raw(tag: &str, ts: JsonValue, value: JsonValue) -> RawReading {
        RawReading {
            tag: tag.into(),
            timestamp: ts,
            value,
            quality: None,
            origin: RecordOrigin::new("test", 0),
        }
    }

    #[test]
    fn test_numeric_string_coercion() {
        let n = normalizer(NormalizerSettings::default());
        let reading = n.normalize(raw("T1", json!("1700000000"), json!(" 42.5 "))).unwrap();
        assert_eq!(reading.value, Value::Float(42.5));
        assert_eq!(reading.timestamp.timestamp(), 1_700_000_000);
        assert_eq!(reading.quality, Quality::Good);
        assert_eq!(reading.schema_version, "1.1");
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let n = normalizer(NormalizerSettings::default());
        let rejection = n.normalize(raw("T1", json!(0), json!("abc"))).unwrap_err();
        assert_eq!(rejection.reason, RejectReason::TypeMismatch);
        assert_eq!(rejection.tag.as_deref(), Some("T1"));

        let rejection = n.normalize(raw("V1", json!(0), json!(2))).unwrap_err();
        assert_eq!(rejection.reason, RejectReason::TypeMismatch);

        assert!(n.normalize(raw("T1", json!(0), json!("NaN"))).is_err());
        assert!(n.normalize(raw("T1", json!("yesterday"), json!(1))).is_err());
    }

    #[test]
    fn test_boolean_and_string_coercion() {
        let n = normalizer(NormalizerSettings::default());
        assert_eq!(n.normalize(raw("V1", json!(0), json!("ON"))).unwrap().value, Value::Bool(true));
        assert_eq!(n.normalize(raw("V1", json!(0), json!(0))).unwrap().value, Value::Bool(false));
        assert_eq!(n.normalize(raw("S1", json!(0), json!(12))).unwrap().value, Value::String("12".into()));
        assert_eq!(n.normalize(raw("T1", json!(0), json!(true))).unwrap().value, Value::Float(1.0));
    }

    #[test]
    fn test_out_of_range_flagged_not_rejected() {
        let n = normalizer(NormalizerSettings::default());
        let reading = n.normalize(raw("T1", json!(0), json!(150))).unwrap();
        assert_eq!(reading.quality, Quality::OutOfRange);

        let mut bad = raw("T1", json!(0), json!(150));
        bad.quality = Some("bad".into());
        assert_eq!(n.normalize(bad).unwrap().quality, Quality::Bad);
    }

    #[test]
    fn test_naive_timestamp_uses_source_offset() {
        let mut settings = NormalizerSettings::default();
        settings.source_offset = FixedOffset::east_opt(2 * 3600).unwrap();
        let n = normalizer(settings);
        let reading = n.normalize(raw("T1", json!("2024-03-01 12:00:00.250"), json!(1))).unwrap();
        assert_eq!(reading.timestamp.to_rfc3339(), "2024-03-01T10:00:00.250+00:00");

        let reading = n.normalize(raw("T1", json!("2024-03-01T12:00:00+00:00"), json!(1))).unwrap();
        assert_eq!(reading.timestamp.to_rfc3339(), "2024-03-01T12:00:00+00:00");
    }

    #[test]
    fn test_resolution_and_epoch_unit() {
        let mut settings = NormalizerSettings::default();
        settings.resolution = TimestampResolution::Seconds;
        settings.epoch_unit = EpochUnit::Milliseconds;
        let n = normalizer(settings);
        let reading = n.normalize(raw("T1", json!(1_700_000_000_999i64), json!(1))).unwrap();
        assert_eq!(reading.timestamp.timestamp(), 1_700_000_000);
        assert_eq!(reading.timestamp.timestamp_subsec_nanos(), 0);
    }

    #[test]
    fn test_batch_preserves_order() {
        let n = normalizer(NormalizerSettings::default());
        let raws = vec![
            raw("T1", json!(2), json!(1)),
            raw("T1", json!(1), json!("x")),
            raw("T1", json!(0), json!(3)),
        ];
        let (readings, rejections) = n.normalize_batch(raws);
        let ts: Vec<i64> = readings.iter().map(|r| r.timestamp.timestamp()).collect();
        assert_eq!(ts, vec![2, 0]);
        assert_eq!(rejections.len(), 1);
    }
}
